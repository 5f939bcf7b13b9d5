//! Vendor CLI command runner.
//!
//! Both adapters drive their vendor's official command-line tool through
//! `tokio::process`, with credentials supplied via the child environment
//! only. This module centralizes spawning, output capture and the mapping
//! of local failures (missing binary, spawn errors) into [`ProviderError`].

use serde::de::DeserializeOwned;
use std::io;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use vdi_core::VdiError;

use crate::{ErrorCategory, ProviderError};

/// Captured result of one CLI invocation.
#[derive(Debug)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Builder for a single vendor CLI call.
#[derive(Debug)]
pub struct CloudCommand {
    program: String,
    args: Vec<String>,
    envs: Vec<(String, String)>,
}

impl CloudCommand {
    pub fn new(program: &str) -> Self {
        Self {
            program: program.to_string(),
            args: Vec::new(),
            envs: Vec::new(),
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable for the child process only.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    /// Run the command and capture its output. Only local failures (binary
    /// missing, spawn error) are returned as `Err`; a non-zero exit is a
    /// normal `CommandOutput` for the adapter to classify.
    pub async fn run(self) -> Result<CommandOutput, ProviderError> {
        debug!(program = %self.program, args = ?self.args, "running vendor CLI command");

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }

        let output = cmd.output().await.map_err(|e| {
            if e.kind() == io::ErrorKind::NotFound {
                missing_tool(&self.program)
            } else {
                ProviderError::transport(format!(
                    "Failed to run `{}`: {}",
                    self.program, e
                ))
            }
        })?;

        Ok(CommandOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl CommandOutput {
    /// Parse the captured stdout as JSON.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, ProviderError> {
        serde_json::from_str(&self.stdout).map_err(|e| {
            ProviderError::api(format!("Unexpected response from provider CLI: {}", e))
        })
    }
}

/// Verify a vendor CLI binary is installed before the first call.
pub fn preflight(program: &str) -> Result<(), ProviderError> {
    which::which(program).map_err(|_| missing_tool(program))?;
    Ok(())
}

/// Missing-binary failure with per-tool install and verify steps.
fn missing_tool(program: &str) -> ProviderError {
    let message = match program {
        "aws" => VdiError::AwsCliMissing.to_string(),
        "az" => VdiError::AzureCliMissing.to_string(),
        _ => format!("`{}` command not found", program),
    };
    ProviderError::new(ErrorCategory::Dependency, message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_vendor_binaries_carry_install_steps() {
        let aws = missing_tool("aws");
        assert_eq!(aws.category, ErrorCategory::Dependency);
        assert!(aws.message.contains("https://aws.amazon.com/cli/"));
        assert!(aws.message.contains("aws --version"));

        let az = missing_tool("az");
        assert!(az.message.contains("https://aka.ms/azure-cli"));
        assert!(az.message.contains("az version"));
    }

    #[test]
    fn preflight_rejects_an_uninstalled_binary() {
        let err = preflight("vdi-no-such-vendor-cli").unwrap_err();
        assert_eq!(err.category, ErrorCategory::Dependency);
        assert!(!err.retryable);
    }
}
