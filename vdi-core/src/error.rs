pub use anyhow::bail;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VdiError {
    Config(String),
    Validation(String),
    Crypto(String),
    Dependency(String),
    Internal(String),
    Io(#[from] std::io::Error),
    Serialization(String),
    AwsCliMissing,
    AzureCliMissing,
    Other(#[from] anyhow::Error),
}

impl Display for VdiError {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            VdiError::Config(s) => write!(f, "Configuration error: {}", s),
            VdiError::Validation(s) => write!(f, "Validation error: {}", s),
            VdiError::Crypto(s) => write!(f, "Crypto error: {}", s),
            VdiError::Dependency(s) => write!(f, "Dependency not found: {}", s),
            VdiError::Internal(s) => write!(f, "Internal error: {}", s),
            VdiError::Io(e) => write!(f, "I/O error: {}", e),
            VdiError::Serialization(s) => write!(f, "Serialization error: {}", s),
            VdiError::AwsCliMissing => {
                write!(f, "The `aws` command-line tool was not found\n\n")?;
                write!(f, "Fix:\n")?;
                write!(f, "  • Install the AWS CLI v2: https://aws.amazon.com/cli/\n")?;
                write!(f, "  • Verify: aws --version")
            }
            VdiError::AzureCliMissing => {
                write!(f, "The `az` command-line tool was not found\n\n")?;
                write!(f, "Fix:\n")?;
                write!(f, "  • Install the Azure CLI: https://aka.ms/azure-cli\n")?;
                write!(f, "  • Verify: az version")
            }
            VdiError::Other(e) => write!(f, "Other error: {}", e),
        }
    }
}

impl From<serde_json::Error> for VdiError {
    fn from(err: serde_json::Error) -> Self {
        VdiError::Serialization(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, VdiError>;
