use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use vdi_core::{CloudProvider, DesktopOs};

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workspace {
    pub id: String,
    pub credential_id: Option<String>,
    pub application_id: Option<String>,
    pub requester: String,
    pub username: String,
    pub bundle_id: String,
    pub os: DesktopOs,
    pub provider: CloudProvider,
    pub state: WorkspaceState,
    pub provider_handle: Option<String>,
    pub connection_string: Option<String>,
    pub registration_code: Option<String>,
    /// Vault-encrypted desktop password, carried only by imported
    /// workspaces. Never serialized; decrypted solely inside
    /// connection-info assembly for an authorized caller.
    #[serde(skip)]
    pub password_enc: Option<String>,
    pub ip_address: Option<String>,
    pub computer_name: Option<String>,
    /// Operator-facing failure detail. Always set when `state` is `Error`;
    /// may also carry a monitoring-timeout note on a still-pending row.
    pub diagnostic: Option<String>,
    pub imported: bool,

    #[serde(serialize_with = "serialize_datetime")]
    pub created_at: DateTime<Utc>,

    #[serde(serialize_with = "serialize_datetime")]
    pub updated_at: DateTime<Utc>,
}

/// Stored lifecycle state. `Pending` covers both "create requested, no
/// handle yet" and "provider still building"; the difference is whether
/// `provider_handle` is set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum WorkspaceState {
    Pending,
    Available,
    Starting,
    Stopping,
    Stopped,
    Rebooting,
    Terminated,
    Error,
}

impl WorkspaceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkspaceState::Pending => "PENDING",
            WorkspaceState::Available => "AVAILABLE",
            WorkspaceState::Starting => "STARTING",
            WorkspaceState::Stopping => "STOPPING",
            WorkspaceState::Stopped => "STOPPED",
            WorkspaceState::Rebooting => "REBOOTING",
            WorkspaceState::Terminated => "TERMINATED",
            WorkspaceState::Error => "ERROR",
        }
    }

    /// States the startup sweep must pick back up: an operation was in
    /// flight when the process last stopped.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            WorkspaceState::Pending
                | WorkspaceState::Starting
                | WorkspaceState::Stopping
                | WorkspaceState::Rebooting
        )
    }
}

impl std::fmt::Display for WorkspaceState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone)]
pub struct NewWorkspace {
    pub credential_id: Option<String>,
    pub application_id: Option<String>,
    pub requester: String,
    pub username: String,
    pub bundle_id: String,
    pub os: DesktopOs,
    pub provider: CloudProvider,
    /// Set for imports of already-provisioned desktops.
    pub provider_handle: Option<String>,
    pub registration_code: Option<String>,
    pub password_enc: Option<String>,
    pub initial_state: WorkspaceState,
    pub imported: bool,
}

#[derive(Debug, Clone, Default)]
pub struct WorkspaceFilters {
    pub requester: Option<String>,
    pub state: Option<WorkspaceState>,
    pub provider: Option<CloudProvider>,
}

#[derive(Clone)]
pub struct WorkspaceStore {
    pool: SqlitePool,
}

impl WorkspaceStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn create(&self, new: NewWorkspace) -> Result<Workspace> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            r#"
            INSERT INTO workspaces
                (id, credential_id, application_id, requester, username, bundle_id, os,
                 provider, state, provider_handle, registration_code, password_enc,
                 imported, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&id)
        .bind(&new.credential_id)
        .bind(&new.application_id)
        .bind(&new.requester)
        .bind(&new.username)
        .bind(&new.bundle_id)
        .bind(new.os)
        .bind(new.provider)
        .bind(new.initial_state)
        .bind(&new.provider_handle)
        .bind(&new.registration_code)
        .bind(&new.password_enc)
        .bind(new.imported)
        .bind(now)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| {
            OrchestratorError::from_unique_violation(
                e,
                "A workspace with this provider handle or application already exists",
            )
        })?;

        self.get(&id).await
    }

    pub async fn get(&self, id: &str) -> Result<Workspace> {
        let row = sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("workspace {}", id)))?;

        Ok(row.into())
    }

    pub async fn get_by_handle(&self, handle: &str) -> Result<Option<Workspace>> {
        let row =
            sqlx::query_as::<_, WorkspaceRow>("SELECT * FROM workspaces WHERE provider_handle = ?")
                .bind(handle)
                .fetch_optional(&self.pool)
                .await?;

        Ok(row.map(Into::into))
    }

    pub async fn list(&self, filters: WorkspaceFilters) -> Result<Vec<Workspace>> {
        let mut query = "SELECT * FROM workspaces WHERE 1=1".to_string();

        if filters.requester.is_some() {
            query.push_str(" AND requester = ?");
        }
        if filters.state.is_some() {
            query.push_str(" AND state = ?");
        }
        if filters.provider.is_some() {
            query.push_str(" AND provider = ?");
        }

        query.push_str(" ORDER BY created_at DESC");

        let mut q = sqlx::query_as::<_, WorkspaceRow>(&query);

        if let Some(requester) = &filters.requester {
            q = q.bind(requester);
        }
        if let Some(state) = &filters.state {
            q = q.bind(*state);
        }
        if let Some(provider) = &filters.provider {
            q = q.bind(*provider);
        }

        let rows = q.fetch_all(&self.pool).await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Workspaces assigned to an application that are not terminated.
    pub async fn active_for_application(&self, application_id: &str) -> Result<Option<Workspace>> {
        let row = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT * FROM workspaces WHERE application_id = ? AND state != ?",
        )
        .bind(application_id)
        .bind(WorkspaceState::Terminated)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Into::into))
    }

    /// Record the provider-assigned handle after a successful create.
    pub async fn set_handle(&self, id: &str, handle: &str) -> Result<()> {
        sqlx::query("UPDATE workspaces SET provider_handle = ?, updated_at = ? WHERE id = ?")
            .bind(handle)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                OrchestratorError::from_unique_violation(
                    e,
                    "This provider handle already belongs to another workspace",
                )
            })?;

        Ok(())
    }

    /// Transition to a non-error state. Clears any leftover diagnostic so a
    /// healthy row never carries stale failure text.
    pub async fn set_state(&self, id: &str, state: WorkspaceState) -> Result<()> {
        debug_assert!(state != WorkspaceState::Error, "use mark_error for ERROR");

        sqlx::query(
            "UPDATE workspaces SET state = ?, diagnostic = NULL, updated_at = ? WHERE id = ?",
        )
        .bind(state)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Transition to ERROR. The diagnostic is mandatory: an error state
    /// without an explanation is useless to the operator.
    pub async fn mark_error(&self, id: &str, diagnostic: &str) -> Result<()> {
        sqlx::query("UPDATE workspaces SET state = ?, diagnostic = ?, updated_at = ? WHERE id = ?")
            .bind(WorkspaceState::Error)
            .bind(diagnostic)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    /// Attach a diagnostic note without changing state (monitoring timeout
    /// on a still-pending workspace).
    pub async fn attach_diagnostic(&self, id: &str, diagnostic: &str) -> Result<()> {
        sqlx::query("UPDATE workspaces SET diagnostic = ?, updated_at = ? WHERE id = ?")
            .bind(diagnostic)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    pub async fn update_connection(
        &self,
        id: &str,
        ip_address: Option<&str>,
        computer_name: Option<&str>,
        connection_string: Option<&str>,
        registration_code: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE workspaces
             SET ip_address = COALESCE(?, ip_address),
                 computer_name = COALESCE(?, computer_name),
                 connection_string = COALESCE(?, connection_string),
                 registration_code = COALESCE(?, registration_code),
                 updated_at = ?
             WHERE id = ?",
        )
        .bind(ip_address)
        .bind(computer_name)
        .bind(connection_string)
        .bind(registration_code)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Reassign (or clear) the application binding.
    pub async fn set_assignment(&self, id: &str, application_id: Option<&str>) -> Result<()> {
        sqlx::query("UPDATE workspaces SET application_id = ?, updated_at = ? WHERE id = ?")
            .bind(application_id)
            .bind(Utc::now().timestamp())
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| {
                OrchestratorError::from_unique_violation(
                    e,
                    "This application already has an active workspace",
                )
            })?;

        Ok(())
    }

    /// Drop the stored handle and return the row to PENDING for a fresh
    /// provisioning attempt.
    pub async fn reset_for_retry(&self, id: &str) -> Result<()> {
        sqlx::query(
            "UPDATE workspaces
             SET state = ?, provider_handle = NULL, diagnostic = NULL, updated_at = ?
             WHERE id = ?",
        )
        .bind(WorkspaceState::Pending)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn delete(&self, id: &str) -> Result<()> {
        let result = sqlx::query("DELETE FROM workspaces WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            return Err(OrchestratorError::NotFound(format!("workspace {}", id)));
        }

        Ok(())
    }

    /// In-flight workspaces the startup sweep should resume monitoring.
    pub async fn incomplete(&self) -> Result<Vec<Workspace>> {
        let rows = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT * FROM workspaces
             WHERE state IN (?, ?, ?, ?) AND provider_handle IS NOT NULL",
        )
        .bind(WorkspaceState::Pending)
        .bind(WorkspaceState::Starting)
        .bind(WorkspaceState::Stopping)
        .bind(WorkspaceState::Rebooting)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Handle-less PENDING rows older than the grace period. These mean a
    /// crash interrupted provisioning before the provider acknowledged the
    /// create; they are surfaced for an operator, never auto-healed, since
    /// the provider may or may not hold an orphaned desktop.
    pub async fn stale_pending(&self, grace_secs: i64) -> Result<Vec<Workspace>> {
        let cutoff = Utc::now().timestamp() - grace_secs;

        let rows = sqlx::query_as::<_, WorkspaceRow>(
            "SELECT * FROM workspaces
             WHERE state = ? AND provider_handle IS NULL AND created_at < ?",
        )
        .bind(WorkspaceState::Pending)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Workspaces still referencing a credential, used for delete
    /// protection.
    pub async fn count_active_for_credential(&self, credential_id: &str) -> Result<i64> {
        let count: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM workspaces WHERE credential_id = ? AND state != ?",
        )
        .bind(credential_id)
        .bind(WorkspaceState::Terminated)
        .fetch_one(&self.pool)
        .await?;

        Ok(count.0)
    }
}

#[derive(sqlx::FromRow)]
struct WorkspaceRow {
    id: String,
    credential_id: Option<String>,
    application_id: Option<String>,
    requester: String,
    username: String,
    bundle_id: String,
    os: DesktopOs,
    provider: CloudProvider,
    state: WorkspaceState,
    provider_handle: Option<String>,
    connection_string: Option<String>,
    registration_code: Option<String>,
    password_enc: Option<String>,
    ip_address: Option<String>,
    computer_name: Option<String>,
    diagnostic: Option<String>,
    imported: bool,
    created_at: i64,
    updated_at: i64,
}

impl From<WorkspaceRow> for Workspace {
    fn from(row: WorkspaceRow) -> Self {
        Self {
            id: row.id,
            credential_id: row.credential_id,
            application_id: row.application_id,
            requester: row.requester,
            username: row.username,
            bundle_id: row.bundle_id,
            os: row.os,
            provider: row.provider,
            state: row.state,
            provider_handle: row.provider_handle,
            connection_string: row.connection_string,
            registration_code: row.registration_code,
            password_enc: row.password_enc,
            ip_address: row.ip_address,
            computer_name: row.computer_name,
            diagnostic: row.diagnostic,
            imported: row.imported,
            created_at: DateTime::from_timestamp(row.created_at, 0).unwrap_or_default(),
            updated_at: DateTime::from_timestamp(row.updated_at, 0).unwrap_or_default(),
        }
    }
}

fn serialize_datetime<S>(dt: &DateTime<Utc>, serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.serialize_str(&dt.to_rfc3339())
}
