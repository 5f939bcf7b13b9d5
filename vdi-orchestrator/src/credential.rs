//! Credential records. Key material is encrypted with the vault before it
//! touches the database and is only decrypted into a short-lived
//! [`CredentialMaterial`] at the adapter boundary. Anything shown to a user
//! goes through masking first.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use vdi_core::mask::{mask_key, mask_secret};
use vdi_core::CloudProvider;
use vdi_provider::CredentialMaterial;
use vdi_vault::Vault;

use crate::error::{OrchestratorError, Result};

/// User-facing view of a stored credential. The access key is masked and
/// the secret never appears at all.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialSummary {
    pub id: String,
    pub name: String,
    pub provider: CloudProvider,
    pub access_key_masked: String,
    pub secret_key_masked: String,
    pub region: String,
    pub directory_id: Option<String>,
    pub tenant_id: Option<String>,
    pub subscription_id: Option<String>,
    pub resource_group: Option<String>,
    pub valid: bool,
    pub last_checked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewCredential {
    pub name: String,
    pub provider: CloudProvider,
    pub access_key: String,
    pub secret_key: String,
    pub region: String,
    pub directory_id: Option<String>,
    pub tenant_id: Option<String>,
    pub subscription_id: Option<String>,
    pub resource_group: Option<String>,
}

#[derive(Clone)]
pub struct CredentialStore {
    pool: SqlitePool,
    vault: Arc<Vault>,
}

impl CredentialStore {
    pub fn new(pool: SqlitePool, vault: Arc<Vault>) -> Self {
        Self { pool, vault }
    }

    pub fn vault(&self) -> &Arc<Vault> {
        &self.vault
    }

    pub async fn add(&self, new: NewCredential) -> Result<CredentialSummary> {
        if new.access_key.trim().is_empty() || new.secret_key.trim().is_empty() {
            return Err(OrchestratorError::InvalidInput(
                "Access key and secret key must not be empty".to_string(),
            ));
        }
        match new.provider {
            CloudProvider::Aws => {
                if new.directory_id.is_none() {
                    return Err(OrchestratorError::InvalidInput(
                        "AWS credentials require a directory ID".to_string(),
                    ));
                }
            }
            CloudProvider::Azure => {
                if new.tenant_id.is_none()
                    || new.subscription_id.is_none()
                    || new.resource_group.is_none()
                {
                    return Err(OrchestratorError::InvalidInput(
                        "Azure credentials require tenant ID, subscription ID and resource group"
                            .to_string(),
                    ));
                }
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();
        let access_key_enc = self.vault.encrypt(&new.access_key)?;
        let secret_key_enc = self.vault.encrypt(&new.secret_key)?;

        sqlx::query(
            r#"
            INSERT INTO cloud_credentials
                (id, name, provider, access_key_enc, secret_key_enc, region,
                 directory_id, tenant_id, subscription_id, resource_group,
                 valid, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 0, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.name)
        .bind(new.provider)
        .bind(&access_key_enc)
        .bind(&secret_key_enc)
        .bind(&new.region)
        .bind(&new.directory_id)
        .bind(&new.tenant_id)
        .bind(&new.subscription_id)
        .bind(&new.resource_group)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            OrchestratorError::from_unique_violation(
                e,
                "A credential with this name already exists",
            )
        })?;

        self.get(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<CredentialSummary> {
        let row = self.fetch(id).await?;
        self.summarize(row)
    }

    pub async fn get_by_name(&self, name: &str) -> Result<CredentialSummary> {
        let row =
            sqlx::query_as::<_, CredentialRow>("SELECT * FROM cloud_credentials WHERE name = ?")
                .bind(name)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| OrchestratorError::NotFound(format!("credential '{}'", name)))?;

        self.summarize(row)
    }

    pub async fn list(&self) -> Result<Vec<CredentialSummary>> {
        let rows = sqlx::query_as::<_, CredentialRow>(
            "SELECT * FROM cloud_credentials ORDER BY created_at DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(|row| self.summarize(row)).collect()
    }

    /// Decrypt a credential into adapter-ready material. The result lives
    /// on the stack for one operation and is never persisted.
    pub async fn material(&self, id: &str) -> Result<CredentialMaterial> {
        let row = self.fetch(id).await?;

        Ok(CredentialMaterial {
            provider: row.provider,
            access_key: self.vault.decrypt(&row.access_key_enc)?,
            secret_key: self.vault.decrypt(&row.secret_key_enc)?,
            region: row.region,
            directory_id: row.directory_id,
            tenant_id: row.tenant_id,
            subscription_id: row.subscription_id,
            resource_group: row.resource_group,
        })
    }

    pub async fn mark_checked(&self, id: &str, valid: bool) -> Result<()> {
        sqlx::query(
            "UPDATE cloud_credentials SET valid = ?, last_checked_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(valid)
        .bind(Utc::now().timestamp())
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Delete a credential unless a non-terminated workspace still depends
    /// on it.
    pub async fn delete(&self, id: &str, active_workspaces: i64) -> Result<()> {
        if active_workspaces > 0 {
            return Err(OrchestratorError::Conflict(format!(
                "Credential is still used by {} active workspace(s); terminate them first",
                active_workspaces
            )));
        }

        let result = sqlx::query("DELETE FROM cloud_credentials WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("credential {}", id)));
        }

        Ok(())
    }

    async fn fetch(&self, id: &str) -> Result<CredentialRow> {
        sqlx::query_as::<_, CredentialRow>("SELECT * FROM cloud_credentials WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("credential {}", id)))
    }

    fn summarize(&self, row: CredentialRow) -> Result<CredentialSummary> {
        let access_key = self.vault.decrypt(&row.access_key_enc)?;

        Ok(CredentialSummary {
            id: row.id,
            name: row.name,
            provider: row.provider,
            access_key_masked: mask_key(&access_key),
            secret_key_masked: mask_secret().to_string(),
            region: row.region,
            directory_id: row.directory_id,
            tenant_id: row.tenant_id,
            subscription_id: row.subscription_id,
            resource_group: row.resource_group,
            valid: row.valid,
            last_checked_at: row
                .last_checked_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
        })
    }
}

#[derive(sqlx::FromRow)]
struct CredentialRow {
    id: String,
    name: String,
    provider: CloudProvider,
    access_key_enc: String,
    secret_key_enc: String,
    region: String,
    directory_id: Option<String>,
    tenant_id: Option<String>,
    subscription_id: Option<String>,
    resource_group: Option<String>,
    valid: bool,
    last_checked_at: Option<i64>,
    created_at: i64,
    #[allow(dead_code)]
    updated_at: i64,
}
