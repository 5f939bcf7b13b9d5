use thiserror::Error;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("{0}")]
    Provider(#[from] vdi_provider::ProviderError),

    #[error(transparent)]
    Core(#[from] vdi_core::VdiError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl OrchestratorError {
    /// Map a SQLite unique-constraint violation onto a conflict with a
    /// caller-facing message; everything else stays a database error.
    pub fn from_unique_violation(err: sqlx::Error, conflict_message: &str) -> Self {
        if let sqlx::Error::Database(ref db_err) = err {
            if db_err.message().contains("UNIQUE constraint failed") {
                return OrchestratorError::Conflict(conflict_message.to_string());
            }
        }
        OrchestratorError::Database(err)
    }
}
