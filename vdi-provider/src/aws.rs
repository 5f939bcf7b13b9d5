//! AWS WorkSpaces adapter.
//!
//! Drives the `aws` CLI with credentials scoped to each child process.
//! AWS reports create/start/stop/reboot/terminate outcomes as partial-
//! failure batches (`PendingRequests` / `FailedRequests` with string error
//! codes); this adapter flattens those batches for single-desktop requests
//! and classifies the error codes into the shared taxonomy.

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use vdi_core::CloudProvider;

use crate::command::{preflight, CloudCommand, CommandOutput};
use crate::{
    Bundle, CloudAdapter, ConnectionDetails, CreatedDesktop, CredentialMaterial, DesktopSnapshot,
    DesktopSpec, DesktopState, ErrorCategory, ProviderError,
};

const AWS_CLI: &str = "aws";

/// Error codes AWS may return transiently; eligible for backoff retry.
const RETRYABLE_CODES: &[&str] = &[
    "ThrottlingException",
    "RequestLimitExceeded",
    "TooManyRequestsException",
    "ServiceUnavailableException",
    "InternalServerError",
    "InternalFailure",
];

/// Transport-level markers seen in CLI stderr when no API response arrived.
const TRANSPORT_MARKERS: &[&str] = &[
    "Could not connect to the endpoint URL",
    "EndpointConnectionError",
    "ConnectionError",
    "ConnectTimeout",
    "ReadTimeoutError",
    "TimeoutError",
    "SSLError",
    "SSL validation failed",
];

pub struct AwsAdapter {
    access_key: String,
    secret_key: String,
    region: String,
    directory_id: String,
}

impl AwsAdapter {
    pub fn new(material: &CredentialMaterial) -> Result<Self, ProviderError> {
        preflight(AWS_CLI)?;

        let directory_id = material.directory_id.clone().ok_or_else(|| {
            ProviderError::bad_parameter("Directory ID is required for AWS WorkSpaces")
        })?;

        Ok(Self {
            access_key: material.access_key.clone(),
            secret_key: material.secret_key.clone(),
            region: material.region.clone(),
            directory_id,
        })
    }

    fn command(&self, subcommand: &str) -> CloudCommand {
        CloudCommand::new(AWS_CLI)
            .arg("workspaces")
            .arg(subcommand)
            .args(["--region", self.region.as_str()])
            .args(["--output", "json"])
            .env("AWS_ACCESS_KEY_ID", &self.access_key)
            .env("AWS_SECRET_ACCESS_KEY", &self.secret_key)
            .env("AWS_EC2_METADATA_DISABLED", "true")
            .env("AWS_PAGER", "")
    }

    /// Run a fire-and-acknowledge lifecycle batch command and surface the
    /// first failed request, if any.
    async fn change_state(
        &self,
        subcommand: &str,
        request_flag: &str,
        handle: &str,
    ) -> Result<(), ProviderError> {
        let requests = json!([{ "WorkspaceId": handle }]).to_string();
        let output = self
            .command(subcommand)
            .args([request_flag, requests.as_str()])
            .run()
            .await?;
        let response: ChangeResponse = parsed(&output)?;

        if let Some(failed) = response.failed_requests.first() {
            return Err(failed.to_error());
        }
        Ok(())
    }

    async fn registration_code(&self) -> Option<String> {
        let output = self
            .command("describe-workspace-directories")
            .args(["--directory-ids", self.directory_id.as_str()])
            .run()
            .await
            .ok()?;
        if !output.success {
            warn!(stderr = %output.stderr.trim(), "could not fetch directory registration code");
            return None;
        }
        let response: DescribeDirectoriesResponse = output.json().ok()?;
        response
            .directories
            .into_iter()
            .next()
            .and_then(|d| d.registration_code)
    }
}

#[async_trait]
impl CloudAdapter for AwsAdapter {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Aws
    }

    async fn create_desktop(&self, spec: &DesktopSpec) -> Result<CreatedDesktop, ProviderError> {
        let tags: Vec<_> = spec
            .tags
            .iter()
            .map(|(key, value)| json!({ "Key": key, "Value": value }))
            .collect();

        let request = json!({
            "Workspaces": [{
                "DirectoryId": self.directory_id,
                "UserName": spec.username,
                "BundleId": spec.bundle_id,
                "WorkspaceProperties": {
                    "RunningMode": "AUTO_STOP",
                    "RunningModeAutoStopTimeoutInMinutes": 60,
                },
                "Tags": tags,
            }]
        })
        .to_string();

        let output = self
            .command("create-workspaces")
            .args(["--cli-input-json", request.as_str()])
            .run()
            .await?;
        let response: CreateWorkspacesResponse = parsed(&output)?;

        if let Some(failed) = response.failed_requests.first() {
            return Err(failed.to_error());
        }

        match response
            .pending_requests
            .into_iter()
            .next()
            .and_then(|w| w.workspace_id)
        {
            Some(handle) => Ok(CreatedDesktop { handle }),
            None => Err(ProviderError::api("No response from AWS WorkSpaces API")),
        }
    }

    async fn describe_desktop(&self, handle: &str) -> Result<DesktopSnapshot, ProviderError> {
        let output = self
            .command("describe-workspaces")
            .args(["--workspace-ids", handle])
            .run()
            .await?;
        let response: DescribeWorkspacesResponse = parsed(&output)?;

        let workspace = response
            .workspaces
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::not_found(format!("Workspace {} not found", handle)))?;

        let raw_state = workspace.state.unwrap_or_default();
        Ok(DesktopSnapshot {
            state: map_aws_state(&raw_state),
            raw_state,
            ip_address: workspace.ip_address,
            computer_name: workspace.computer_name,
            error_message: workspace.error_message,
        })
    }

    async fn start_desktop(&self, handle: &str) -> Result<(), ProviderError> {
        self.change_state("start-workspaces", "--start-workspace-requests", handle)
            .await
    }

    async fn stop_desktop(&self, handle: &str) -> Result<(), ProviderError> {
        self.change_state("stop-workspaces", "--stop-workspace-requests", handle)
            .await
    }

    async fn reboot_desktop(&self, handle: &str) -> Result<(), ProviderError> {
        self.change_state("reboot-workspaces", "--reboot-workspace-requests", handle)
            .await
    }

    async fn terminate_desktop(&self, handle: &str) -> Result<(), ProviderError> {
        self.change_state(
            "terminate-workspaces",
            "--terminate-workspace-requests",
            handle,
        )
        .await
    }

    async fn connection_info(&self, handle: &str) -> Result<ConnectionDetails, ProviderError> {
        let snapshot = self.describe_desktop(handle).await?;
        Ok(ConnectionDetails {
            connection_string: format!("workspaces://{}", handle),
            registration_code: self.registration_code().await,
            ip_address: snapshot.ip_address,
            computer_name: snapshot.computer_name,
        })
    }

    async fn list_bundles(&self) -> Result<Vec<Bundle>, ProviderError> {
        let output = self
            .command("describe-workspace-bundles")
            .args(["--owner", "AMAZON"])
            .run()
            .await?;
        let response: DescribeBundlesResponse = parsed(&output)?;

        Ok(response
            .bundles
            .into_iter()
            .map(|b| Bundle {
                bundle_id: b.bundle_id,
                name: b.name.unwrap_or_default(),
                description: b.description.unwrap_or_default(),
                compute_type: b
                    .compute_type
                    .and_then(|c| c.name)
                    .unwrap_or_else(|| "STANDARD".to_string()),
                user_storage_gb: b.user_storage.and_then(|s| s.capacity?.parse().ok()),
                root_storage_gb: b.root_storage.and_then(|s| s.capacity?.parse().ok()),
                owner: b.owner.unwrap_or_else(|| "AMAZON".to_string()),
                provider: CloudProvider::Aws,
            })
            .collect())
    }

    async fn check_credentials(&self) -> Result<(), ProviderError> {
        if !self.directory_id.starts_with("d-") {
            return Err(ProviderError::bad_parameter(format!(
                "Invalid directory ID format: '{}'. AWS Directory IDs start with 'd-'",
                self.directory_id
            )));
        }

        let output = self
            .command("describe-workspaces")
            .args(["--directory-id", self.directory_id.as_str()])
            .args(["--limit", "1"])
            .run()
            .await?;

        if output.success {
            Ok(())
        } else {
            Err(classify_aws(None, output.stderr.trim()))
        }
    }
}

/// Parse CLI output, classifying the stderr of a failed invocation.
fn parsed<T: serde::de::DeserializeOwned>(output: &CommandOutput) -> Result<T, ProviderError> {
    if !output.success {
        return Err(classify_aws(None, output.stderr.trim()));
    }
    output.json()
}

/// Normalize an AWS error code/message pair into the shared taxonomy.
///
/// The retryable set matches the fixed allow-list: throttling, service
/// unavailability, internal server errors, request limits, and transport
/// failures that never reached the API.
pub fn classify_aws(code: Option<&str>, message: &str) -> ProviderError {
    let haystack = match code {
        Some(code) => format!("{}: {}", code, message),
        None => message.to_string(),
    };

    let category = if TRANSPORT_MARKERS.iter().any(|m| haystack.contains(m)) {
        ErrorCategory::Transport
    } else if RETRYABLE_CODES.iter().any(|c| haystack.contains(c)) {
        if haystack.contains("Throttling") || haystack.contains("Limit") || haystack.contains("TooManyRequests")
        {
            ErrorCategory::Throttled
        } else {
            ErrorCategory::Unavailable
        }
    } else if haystack.contains("InvalidParameterValue")
        || haystack.contains("InvalidParameterCombination")
        || haystack.contains("ValidationException")
    {
        ErrorCategory::BadParameter
    } else if haystack.contains("UnauthorizedOperation") || haystack.contains("AccessDenied") {
        ErrorCategory::AccessDenied
    } else if haystack.contains("AuthFailure")
        || haystack.contains("SignatureDoesNotMatch")
        || haystack.contains("UnrecognizedClientException")
        || haystack.contains("InvalidClientTokenId")
    {
        ErrorCategory::BadSignature
    } else if haystack.contains("ResourceLimitExceeded") {
        ErrorCategory::QuotaExceeded
    } else if haystack.contains("ResourceNotFound") {
        ErrorCategory::NotFound
    } else {
        ErrorCategory::Api
    };

    ProviderError::new(category, haystack)
}

fn map_aws_state(state: &str) -> DesktopState {
    match state {
        "PENDING" | "REBUILDING" | "RESTORING" | "UPDATING" | "MAINTENANCE"
        | "ADMIN_MAINTENANCE" => DesktopState::Pending,
        "AVAILABLE" => DesktopState::Available,
        "STARTING" => DesktopState::Starting,
        "STOPPING" => DesktopState::Stopping,
        "STOPPED" | "SUSPENDED" => DesktopState::Stopped,
        "REBOOTING" => DesktopState::Rebooting,
        "TERMINATING" | "TERMINATED" => DesktopState::Terminated,
        "ERROR" | "UNHEALTHY" => DesktopState::Error,
        _ => DesktopState::Unknown,
    }
}

// Response shapes for the subset of the WorkSpaces API this adapter uses.

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CreateWorkspacesResponse {
    #[serde(default)]
    pending_requests: Vec<AwsWorkspace>,
    #[serde(default)]
    failed_requests: Vec<FailedRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeWorkspacesResponse {
    #[serde(default)]
    workspaces: Vec<AwsWorkspace>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ChangeResponse {
    #[serde(default)]
    failed_requests: Vec<FailedRequest>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsWorkspace {
    workspace_id: Option<String>,
    state: Option<String>,
    ip_address: Option<String>,
    computer_name: Option<String>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct FailedRequest {
    error_code: Option<String>,
    error_message: Option<String>,
}

impl FailedRequest {
    fn to_error(&self) -> ProviderError {
        classify_aws(
            self.error_code.as_deref(),
            self.error_message.as_deref().unwrap_or("request failed"),
        )
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeBundlesResponse {
    #[serde(default)]
    bundles: Vec<AwsBundle>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsBundle {
    bundle_id: String,
    name: Option<String>,
    description: Option<String>,
    compute_type: Option<AwsComputeType>,
    user_storage: Option<AwsStorage>,
    root_storage: Option<AwsStorage>,
    owner: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsComputeType {
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsStorage {
    capacity: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DescribeDirectoriesResponse {
    #[serde(default)]
    directories: Vec<AwsDirectory>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct AwsDirectory {
    registration_code: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn throttling_is_retryable() {
        let err = classify_aws(Some("ThrottlingException"), "Rate exceeded");
        assert_eq!(err.category, ErrorCategory::Throttled);
        assert!(err.retryable);
    }

    #[test]
    fn internal_server_error_is_retryable() {
        let err = classify_aws(Some("InternalServerError"), "boom");
        assert_eq!(err.category, ErrorCategory::Unavailable);
        assert!(err.retryable);
    }

    #[test]
    fn access_denied_is_permanent_with_iam_hint() {
        let err = classify_aws(Some("AccessDeniedException"), "not authorized");
        assert_eq!(err.category, ErrorCategory::AccessDenied);
        assert!(!err.retryable);
        assert!(err.hint().contains("workspaces:Describe*"));
    }

    #[test]
    fn bad_signature_is_permanent() {
        let err = classify_aws(Some("SignatureDoesNotMatch"), "check your key");
        assert_eq!(err.category, ErrorCategory::BadSignature);
        assert!(!err.retryable);
    }

    #[test]
    fn endpoint_failure_is_transport() {
        let err = classify_aws(
            None,
            "Could not connect to the endpoint URL: \"https://workspaces.us-eest-1.amazonaws.com/\"",
        );
        assert_eq!(err.category, ErrorCategory::Transport);
        assert!(err.retryable);
    }

    #[test]
    fn unknown_codes_fall_back_to_api() {
        let err = classify_aws(Some("SomethingNew"), "mystery");
        assert_eq!(err.category, ErrorCategory::Api);
        assert!(!err.retryable);
    }

    #[test]
    fn state_mapping_covers_terminal_states() {
        assert_eq!(map_aws_state("AVAILABLE"), DesktopState::Available);
        assert_eq!(map_aws_state("TERMINATING"), DesktopState::Terminated);
        assert_eq!(map_aws_state("UNHEALTHY"), DesktopState::Error);
        assert_eq!(map_aws_state("PENDING"), DesktopState::Pending);
        assert_eq!(map_aws_state("SOME_FUTURE_STATE"), DesktopState::Unknown);
    }

    #[test]
    fn create_response_parses_partial_failure_batches() {
        let raw = r#"{
            "PendingRequests": [{"WorkspaceId": "ws-abc", "State": "PENDING"}],
            "FailedRequests": [{"ErrorCode": "ResourceLimitExceededException", "ErrorMessage": "quota"}]
        }"#;
        let response: CreateWorkspacesResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(
            response.pending_requests[0].workspace_id.as_deref(),
            Some("ws-abc")
        );
        let err = response.failed_requests[0].to_error();
        assert_eq!(err.category, ErrorCategory::QuotaExceeded);
    }

    #[test]
    fn describe_response_parses_connection_fields() {
        let raw = r#"{
            "Workspaces": [{
                "WorkspaceId": "ws-abc",
                "State": "AVAILABLE",
                "IpAddress": "10.0.0.5",
                "ComputerName": "WSAMZN-ABC"
            }]
        }"#;
        let response: DescribeWorkspacesResponse = serde_json::from_str(raw).unwrap();
        let ws = &response.workspaces[0];
        assert_eq!(ws.ip_address.as_deref(), Some("10.0.0.5"));
        assert_eq!(ws.computer_name.as_deref(), Some("WSAMZN-ABC"));
    }
}
