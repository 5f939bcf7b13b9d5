//! Provider and desktop vocabulary shared by every crate in the workspace.

use crate::error::VdiError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Which cloud vendor hosts a workspace.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum CloudProvider {
    Aws,
    Azure,
}

impl CloudProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloudProvider::Aws => "aws",
            CloudProvider::Azure => "azure",
        }
    }
}

impl fmt::Display for CloudProvider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CloudProvider {
    type Err = VdiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aws" => Ok(CloudProvider::Aws),
            "azure" => Ok(CloudProvider::Azure),
            other => Err(VdiError::Validation(format!(
                "Unsupported cloud provider: '{}' (expected 'aws' or 'azure')",
                other
            ))),
        }
    }
}

/// Operating system family of a desktop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum DesktopOs {
    Ubuntu,
    Windows,
}

impl DesktopOs {
    pub fn as_str(&self) -> &'static str {
        match self {
            DesktopOs::Ubuntu => "ubuntu",
            DesktopOs::Windows => "windows",
        }
    }
}

impl fmt::Display for DesktopOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DesktopOs {
    type Err = VdiError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ubuntu" => Ok(DesktopOs::Ubuntu),
            "windows" => Ok(DesktopOs::Windows),
            other => Err(VdiError::Validation(format!(
                "Invalid workspace type: '{}' (expected 'ubuntu' or 'windows')",
                other
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_round_trips_through_str() {
        for p in [CloudProvider::Aws, CloudProvider::Azure] {
            assert_eq!(p.as_str().parse::<CloudProvider>().unwrap(), p);
        }
    }

    #[test]
    fn unknown_provider_is_a_validation_error() {
        let err = "gcp".parse::<CloudProvider>().unwrap_err();
        assert!(matches!(err, VdiError::Validation(_)));
    }

    #[test]
    fn os_round_trips_through_str() {
        for os in [DesktopOs::Ubuntu, DesktopOs::Windows] {
            assert_eq!(os.as_str().parse::<DesktopOs>().unwrap(), os);
        }
    }
}
