//! Azure Virtual Desktop adapter.
//!
//! Drives the `az` CLI under an isolated `AZURE_CONFIG_DIR` so that the
//! service-principal session never touches the operator's own az profile.
//! Desktops are backed by VMs joined to a host pool; the bundle id selects
//! the host pool (ids prefixed `hp-`) or falls back to the default pool
//! with a VM size derived from the bundle tier.

use async_trait::async_trait;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Deserialize;
use tempfile::TempDir;
use tokio::sync::Mutex;
use tracing::debug;

use vdi_core::{CloudProvider, DesktopOs};

use crate::command::{preflight, CloudCommand, CommandOutput};
use crate::{
    Bundle, CloudAdapter, ConnectionDetails, CreatedDesktop, CredentialMaterial, DesktopSnapshot,
    DesktopSpec, DesktopState, ErrorCategory, ProviderError,
};

const AZ_CLI: &str = "az";
const DEFAULT_HOST_POOL: &str = "default-host-pool";

pub struct AzureAdapter {
    client_id: String,
    client_secret: String,
    location: String,
    tenant_id: String,
    subscription_id: String,
    resource_group: String,
    /// Isolated az profile; removed when the adapter is dropped.
    config_dir: TempDir,
    logged_in: Mutex<bool>,
}

impl AzureAdapter {
    pub fn new(material: &CredentialMaterial) -> Result<Self, ProviderError> {
        preflight(AZ_CLI)?;

        let tenant_id = material
            .tenant_id
            .clone()
            .ok_or_else(|| ProviderError::bad_parameter("Tenant ID is required for Azure"))?;
        let subscription_id = material.subscription_id.clone().ok_or_else(|| {
            ProviderError::bad_parameter("Subscription ID is required for Azure")
        })?;
        let resource_group = material.resource_group.clone().ok_or_else(|| {
            ProviderError::bad_parameter("Resource group is required for Azure")
        })?;

        let config_dir = TempDir::new().map_err(|e| {
            ProviderError::new(
                ErrorCategory::Dependency,
                format!("Could not create az config directory: {}", e),
            )
        })?;

        Ok(Self {
            client_id: material.access_key.clone(),
            client_secret: material.secret_key.clone(),
            location: material.region.clone(),
            tenant_id,
            subscription_id,
            resource_group,
            config_dir,
            logged_in: Mutex::new(false),
        })
    }

    fn command<I, S>(&self, args: I) -> CloudCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        CloudCommand::new(AZ_CLI)
            .args(args)
            .args(["--output", "json"])
            .env("AZURE_CONFIG_DIR", self.config_dir.path().display().to_string())
            .env("AZURE_CORE_ONLY_SHOW_ERRORS", "true")
            .env("AZURE_CORE_NO_COLOR", "true")
    }

    /// Log the service principal into the isolated profile, once per
    /// adapter instance.
    async fn ensure_login(&self) -> Result<(), ProviderError> {
        let mut logged_in = self.logged_in.lock().await;
        if *logged_in {
            return Ok(());
        }

        debug!(tenant = %self.tenant_id, "logging service principal into isolated az profile");
        let output = self
            .command([
                "login",
                "--service-principal",
                "--username",
                self.client_id.as_str(),
                "--password",
                self.client_secret.as_str(),
                "--tenant",
                self.tenant_id.as_str(),
            ])
            .run()
            .await?;
        if !output.success {
            return Err(classify_azure(output.stderr.trim()));
        }

        let output = self
            .command(["account", "set", "--subscription", self.subscription_id.as_str()])
            .run()
            .await?;
        if !output.success {
            return Err(classify_azure(output.stderr.trim()));
        }

        *logged_in = true;
        Ok(())
    }

    async fn host_pool_exists(&self, host_pool: &str) -> Result<(), ProviderError> {
        let output = self
            .command([
                "desktopvirtualization",
                "hostpool",
                "show",
                "--name",
                host_pool,
                "--resource-group",
                self.resource_group.as_str(),
            ])
            .run()
            .await?;
        if output.success {
            Ok(())
        } else {
            let err = classify_azure(output.stderr.trim());
            if err.category == ErrorCategory::NotFound {
                Err(ProviderError::bad_parameter(format!(
                    "Host pool '{}' not found in resource group '{}'",
                    host_pool, self.resource_group
                )))
            } else {
                Err(err)
            }
        }
    }

    /// Fire-and-acknowledge VM lifecycle command via `--no-wait`; the real
    /// state transition is observed by later describes.
    async fn vm_command(&self, args: Vec<String>) -> Result<(), ProviderError> {
        self.ensure_login().await?;
        let output = self.command(args).run().await?;
        if output.success {
            Ok(())
        } else {
            Err(classify_azure(output.stderr.trim()))
        }
    }
}

#[async_trait]
impl CloudAdapter for AzureAdapter {
    fn provider(&self) -> CloudProvider {
        CloudProvider::Azure
    }

    async fn create_desktop(&self, spec: &DesktopSpec) -> Result<CreatedDesktop, ProviderError> {
        self.ensure_login().await?;

        let host_pool = select_host_pool(&spec.bundle_id);
        self.host_pool_exists(host_pool).await?;

        let vm_name = session_host_name(&spec.username, spec.os);
        let size = map_bundle_to_vm_size(&spec.bundle_id);
        let image = match spec.os {
            DesktopOs::Ubuntu => "Ubuntu2204",
            DesktopOs::Windows => "Win2022Datacenter",
        };

        let mut args: Vec<String> = vec![
            "vm".into(),
            "create".into(),
            "--resource-group".into(),
            self.resource_group.clone(),
            "--name".into(),
            vm_name.clone(),
            "--image".into(),
            image.into(),
            "--size".into(),
            size.into(),
            "--location".into(),
            self.location.clone(),
            "--admin-username".into(),
            "vdiadmin".into(),
            "--admin-password".into(),
            generate_admin_password(),
            "--no-wait".into(),
        ];
        if !spec.tags.is_empty() {
            args.push("--tags".into());
            for (key, value) in &spec.tags {
                args.push(format!("{}={}", key, value));
            }
        }

        let output = self.command(args).run().await?;
        if !output.success {
            return Err(classify_azure(output.stderr.trim()));
        }

        Ok(CreatedDesktop { handle: vm_name })
    }

    async fn describe_desktop(&self, handle: &str) -> Result<DesktopSnapshot, ProviderError> {
        self.ensure_login().await?;

        let output = self
            .command([
                "vm",
                "show",
                "--resource-group",
                self.resource_group.as_str(),
                "--name",
                handle,
                "--show-details",
            ])
            .run()
            .await?;
        let vm: AzureVmDetails = parsed(&output)?;

        let power_state = vm.power_state.unwrap_or_default();
        let provisioning_state = vm.provisioning_state.unwrap_or_default();
        let state = map_azure_state(&provisioning_state, &power_state);
        let raw_state = if power_state.is_empty() {
            provisioning_state.clone()
        } else {
            power_state.clone()
        };

        Ok(DesktopSnapshot {
            state,
            raw_state,
            ip_address: first_ip(vm.public_ips).or_else(|| first_ip(vm.private_ips)),
            computer_name: vm.os_profile.and_then(|p| p.computer_name),
            error_message: if state == DesktopState::Error {
                Some(format!("VM provisioning state: {}", provisioning_state))
            } else {
                None
            },
        })
    }

    async fn start_desktop(&self, handle: &str) -> Result<(), ProviderError> {
        self.vm_command(vm_args("start", &self.resource_group, handle, &[]))
            .await
    }

    async fn stop_desktop(&self, handle: &str) -> Result<(), ProviderError> {
        // Deallocate rather than power off so the stopped VM stops billing.
        self.vm_command(vm_args("deallocate", &self.resource_group, handle, &[]))
            .await
    }

    async fn reboot_desktop(&self, handle: &str) -> Result<(), ProviderError> {
        self.vm_command(vm_args("restart", &self.resource_group, handle, &[]))
            .await
    }

    async fn terminate_desktop(&self, handle: &str) -> Result<(), ProviderError> {
        self.vm_command(vm_args("delete", &self.resource_group, handle, &["--yes"]))
            .await
    }

    async fn connection_info(&self, handle: &str) -> Result<ConnectionDetails, ProviderError> {
        let snapshot = self.describe_desktop(handle).await?;
        Ok(ConnectionDetails {
            connection_string: format!("ms-avd://{}", handle),
            registration_code: None,
            ip_address: snapshot.ip_address,
            computer_name: snapshot.computer_name,
        })
    }

    /// Azure has no bundle catalog API; expose the fixed tier list mapped
    /// onto VM sizes.
    async fn list_bundles(&self) -> Result<Vec<Bundle>, ProviderError> {
        Ok(static_bundles())
    }

    async fn check_credentials(&self) -> Result<(), ProviderError> {
        self.ensure_login().await?;

        let output = self
            .command(["group", "show", "--name", self.resource_group.as_str()])
            .run()
            .await?;
        if output.success {
            Ok(())
        } else {
            Err(classify_azure(output.stderr.trim()))
        }
    }
}

fn parsed<T: serde::de::DeserializeOwned>(output: &CommandOutput) -> Result<T, ProviderError> {
    if !output.success {
        return Err(classify_azure(output.stderr.trim()));
    }
    output.json()
}

fn vm_args(verb: &str, resource_group: &str, handle: &str, extra: &[&str]) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "vm".into(),
        verb.into(),
        "--resource-group".into(),
        resource_group.into(),
        "--name".into(),
        handle.into(),
    ];
    args.extend(extra.iter().map(|s| s.to_string()));
    args.push("--no-wait".into());
    args
}

/// Bundle ids prefixed `hp-` name a host pool directly; everything else
/// lands in the shared default pool.
fn select_host_pool(bundle_id: &str) -> &str {
    if bundle_id.starts_with("hp-") {
        bundle_id
    } else {
        DEFAULT_HOST_POOL
    }
}

fn map_bundle_to_vm_size(bundle_id: &str) -> &'static str {
    let lower = bundle_id.to_lowercase();
    if lower.contains("graphics") {
        "Standard_NV12s_v3"
    } else if lower.contains("power") {
        "Standard_D8s_v3"
    } else if lower.contains("performance") {
        "Standard_D4s_v3"
    } else if lower.contains("value") {
        "Standard_B2s"
    } else {
        "Standard_D2s_v3"
    }
}

fn session_host_name(username: &str, os: DesktopOs) -> String {
    let user: String = username
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .take(12)
        .collect();
    format!(
        "vm-{}-{}-{}",
        user.to_lowercase(),
        os.as_str(),
        chrono::Utc::now().timestamp()
    )
}

/// Throwaway local admin password meeting Azure complexity rules. Access
/// goes through AVD, not this account.
fn generate_admin_password() -> String {
    let body: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(20)
        .map(char::from)
        .collect();
    format!("Vd1!{}", body)
}

fn map_azure_state(provisioning_state: &str, power_state: &str) -> DesktopState {
    match power_state {
        "VM running" => return DesktopState::Available,
        "VM starting" => return DesktopState::Starting,
        "VM stopping" | "VM deallocating" => return DesktopState::Stopping,
        "VM stopped" | "VM deallocated" => return DesktopState::Stopped,
        _ => {}
    }
    match provisioning_state {
        "Creating" | "Updating" => DesktopState::Pending,
        "Deleting" => DesktopState::Terminated,
        "Failed" => DesktopState::Error,
        "Succeeded" => DesktopState::Pending,
        _ => DesktopState::Unknown,
    }
}

fn first_ip(ips: Option<String>) -> Option<String> {
    ips.and_then(|list| {
        list.split(',')
            .map(str::trim)
            .find(|ip| !ip.is_empty())
            .map(str::to_string)
    })
}

/// Normalize an `az` failure message into the shared taxonomy.
pub fn classify_azure(message: &str) -> ProviderError {
    const TRANSPORT_MARKERS: &[&str] = &[
        "Connection aborted",
        "ConnectionError",
        "Failed to establish a new connection",
        "getaddrinfo failed",
        "ReadTimeout",
        "TimeoutError",
        "SSLError",
    ];

    let category = if TRANSPORT_MARKERS.iter().any(|m| message.contains(m)) {
        ErrorCategory::Transport
    } else if message.contains("AuthorizationFailed") {
        ErrorCategory::AccessDenied
    } else if message.contains("InvalidAuthenticationTokenTenant")
        || message.contains("AADSTS90002")
        || message.contains("SubscriptionNotFound")
        || message.contains("ResourceGroupNotFound")
    {
        ErrorCategory::BadParameter
    } else if message.contains("AuthenticationFailed")
        || message.contains("AADSTS7000215")
        || message.contains("AADSTS700016")
        || message.contains("Invalid client secret")
    {
        ErrorCategory::BadSignature
    } else if message.contains("TooManyRequests") || message.contains("RetryableError") {
        ErrorCategory::Throttled
    } else if message.contains("ServiceUnavailable")
        || message.contains("InternalServerError")
        || message.contains("ServerTimeout")
    {
        ErrorCategory::Unavailable
    } else if message.contains("QuotaExceeded") || message.contains("quota") {
        ErrorCategory::QuotaExceeded
    } else if message.contains("ResourceNotFound")
        || message.contains("NotFound")
        || message.contains("was not found")
        || message.contains("could not be found")
    {
        ErrorCategory::NotFound
    } else {
        ErrorCategory::Api
    };

    ProviderError::new(category, message)
}

fn static_bundles() -> Vec<Bundle> {
    let tiers = [
        ("avd-value", "Value", "1 vCPU burstable, 4 GB RAM", "VALUE", 64),
        ("avd-standard", "Standard", "2 vCPU, 8 GB RAM", "STANDARD", 128),
        (
            "avd-performance",
            "Performance",
            "4 vCPU, 16 GB RAM",
            "PERFORMANCE",
            256,
        ),
        ("avd-power", "Power", "8 vCPU, 32 GB RAM", "POWER", 512),
        (
            "avd-graphics",
            "Graphics",
            "12 vCPU, 112 GB RAM, GPU",
            "GRAPHICS",
            512,
        ),
    ];
    tiers
        .into_iter()
        .map(|(id, name, description, compute, storage)| Bundle {
            bundle_id: id.to_string(),
            name: name.to_string(),
            description: description.to_string(),
            compute_type: compute.to_string(),
            user_storage_gb: Some(storage),
            root_storage_gb: Some(128),
            owner: "AZURE".to_string(),
            provider: CloudProvider::Azure,
        })
        .collect()
}

// Fields used from `az vm show --show-details`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureVmDetails {
    power_state: Option<String>,
    provisioning_state: Option<String>,
    public_ips: Option<String>,
    private_ips: Option<String>,
    os_profile: Option<AzureOsProfile>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AzureOsProfile {
    computer_name: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hp_prefixed_bundles_select_their_host_pool() {
        assert_eq!(select_host_pool("hp-engineering"), "hp-engineering");
        assert_eq!(select_host_pool("avd-standard"), DEFAULT_HOST_POOL);
    }

    #[test]
    fn bundle_tiers_map_to_vm_sizes() {
        assert_eq!(map_bundle_to_vm_size("avd-value"), "Standard_B2s");
        assert_eq!(map_bundle_to_vm_size("avd-graphics"), "Standard_NV12s_v3");
        assert_eq!(map_bundle_to_vm_size("hp-unknown"), "Standard_D2s_v3");
    }

    #[test]
    fn authorization_failed_is_access_denied() {
        let err = classify_azure(
            "AuthorizationFailed: The client does not have authorization to perform action",
        );
        assert_eq!(err.category, ErrorCategory::AccessDenied);
        assert!(!err.retryable);
    }

    #[test]
    fn bad_tenant_and_subscription_are_parameter_errors() {
        for message in [
            "InvalidAuthenticationTokenTenant: The access token is from the wrong issuer",
            "SubscriptionNotFound: The subscription 'x' could not be found",
            "ResourceGroupNotFound: Resource group 'rg' could not be found",
        ] {
            assert_eq!(classify_azure(message).category, ErrorCategory::BadParameter);
        }
    }

    #[test]
    fn invalid_secret_is_bad_signature() {
        let err = classify_azure("AADSTS7000215: Invalid client secret provided");
        assert_eq!(err.category, ErrorCategory::BadSignature);
    }

    #[test]
    fn connection_failures_are_retryable_transport() {
        let err = classify_azure("ConnectionError: Failed to establish a new connection");
        assert_eq!(err.category, ErrorCategory::Transport);
        assert!(err.retryable);
    }

    #[test]
    fn power_state_wins_over_provisioning_state() {
        assert_eq!(map_azure_state("Succeeded", "VM running"), DesktopState::Available);
        assert_eq!(map_azure_state("Succeeded", "VM deallocated"), DesktopState::Stopped);
        assert_eq!(map_azure_state("Creating", ""), DesktopState::Pending);
        assert_eq!(map_azure_state("Failed", ""), DesktopState::Error);
    }

    #[test]
    fn session_host_names_are_sanitized() {
        let name = session_host_name("Jane.Doe@example.com", DesktopOs::Windows);
        assert!(name.starts_with("vm-janedoeexamp-windows-"));
    }

    #[test]
    fn vm_details_parse_show_details_output() {
        let raw = r#"{
            "powerState": "VM running",
            "provisioningState": "Succeeded",
            "publicIps": "20.1.2.3",
            "privateIps": "10.0.0.4",
            "osProfile": {"computerName": "vm-jane"}
        }"#;
        let vm: AzureVmDetails = serde_json::from_str(raw).unwrap();
        assert_eq!(vm.power_state.as_deref(), Some("VM running"));
        assert_eq!(first_ip(vm.public_ips).as_deref(), Some("20.1.2.3"));
    }
}
