//! Access-approval lookups. Workspace creation is gated on an approved
//! application record owned by the requester; the directory is a trait so
//! deployments can back it with whatever system tracks approvals.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

use crate::error::{OrchestratorError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationRecord {
    pub id: String,
    /// Who filed (and owns) the application.
    pub requester: String,
    /// Directory username the desktop is provisioned for.
    pub username: String,
    pub approved: bool,
}

pub trait ApplicationDirectory: Send + Sync {
    fn application(&self, id: &str) -> Result<Option<ApplicationRecord>>;
}

/// File-backed directory: a JSON document mapping application ids to
/// records. Suits single-host deployments and tests.
pub struct JsonApplicationDirectory {
    records: HashMap<String, ApplicationRecord>,
}

#[derive(Deserialize)]
struct DirectoryFile {
    applications: Vec<ApplicationRecord>,
}

impl JsonApplicationDirectory {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            OrchestratorError::InvalidInput(format!(
                "Cannot read application directory {}: {}",
                path.display(),
                e
            ))
        })?;
        let file: DirectoryFile = serde_json::from_str(&raw)?;

        Ok(Self {
            records: file
                .applications
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
        })
    }

    pub fn from_records(records: Vec<ApplicationRecord>) -> Self {
        Self {
            records: records
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
        }
    }
}

impl ApplicationDirectory for JsonApplicationDirectory {
    fn application(&self, id: &str) -> Result<Option<ApplicationRecord>> {
        Ok(self.records.get(id).cloned())
    }
}
