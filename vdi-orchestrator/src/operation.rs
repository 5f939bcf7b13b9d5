//! Audit log of lifecycle operations. Every provider-touching action is
//! recorded here with its attempt count and final outcome; failed rows are
//! the dead-letter trail an operator inspects after an ERROR.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Operation {
    pub id: String,
    pub workspace_id: String,
    pub kind: OperationKind,
    pub status: OperationStatus,
    pub attempts: i64,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Create,
    Import,
    Start,
    Stop,
    Reboot,
    Terminate,
    Retry,
    Refresh,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum OperationStatus {
    Running,
    Success,
    Failed,
}

#[derive(Clone)]
pub struct OperationLog {
    pool: SqlitePool,
}

impl OperationLog {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Open a running operation record; returns its id.
    pub async fn record(&self, workspace_id: &str, kind: OperationKind) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now().timestamp();

        sqlx::query(
            "INSERT INTO operations (id, workspace_id, kind, status, attempts, started_at)
             VALUES (?, ?, ?, ?, 0, ?)",
        )
        .bind(&id)
        .bind(workspace_id)
        .bind(kind)
        .bind(OperationStatus::Running)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    pub async fn complete(
        &self,
        id: &str,
        attempts: u32,
        outcome: std::result::Result<(), String>,
    ) -> Result<()> {
        let (status, error) = match outcome {
            Ok(()) => (OperationStatus::Success, None),
            Err(message) => (OperationStatus::Failed, Some(message)),
        };

        sqlx::query(
            "UPDATE operations SET status = ?, attempts = ?, error = ?, completed_at = ?
             WHERE id = ?",
        )
        .bind(status)
        .bind(attempts as i64)
        .bind(error)
        .bind(Utc::now().timestamp())
        .bind(id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn get(&self, id: &str) -> Result<Operation> {
        let row = sqlx::query_as::<_, OperationRow>("SELECT * FROM operations WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| OrchestratorError::NotFound(format!("operation {}", id)))?;

        Ok(row.into())
    }

    pub async fn for_workspace(&self, workspace_id: &str) -> Result<Vec<Operation>> {
        let rows = sqlx::query_as::<_, OperationRow>(
            "SELECT * FROM operations WHERE workspace_id = ? ORDER BY started_at DESC",
        )
        .bind(workspace_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Failed operations across all workspaces, newest first.
    pub async fn failed(&self) -> Result<Vec<Operation>> {
        let rows = sqlx::query_as::<_, OperationRow>(
            "SELECT * FROM operations WHERE status = ? ORDER BY started_at DESC",
        )
        .bind(OperationStatus::Failed)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }
}

#[derive(sqlx::FromRow)]
struct OperationRow {
    id: String,
    workspace_id: String,
    kind: OperationKind,
    status: OperationStatus,
    attempts: i64,
    error: Option<String>,
    started_at: i64,
    completed_at: Option<i64>,
}

impl From<OperationRow> for Operation {
    fn from(row: OperationRow) -> Self {
        Self {
            id: row.id,
            workspace_id: row.workspace_id,
            kind: row.kind,
            status: row.status,
            attempts: row.attempts,
            error: row.error,
            started_at: DateTime::from_timestamp(row.started_at, 0).unwrap_or_default(),
            completed_at: row
                .completed_at
                .and_then(|ts| DateTime::from_timestamp(ts, 0)),
        }
    }
}
