//! Provisioning engine: bounded retry around provider calls and the
//! polling loop that walks a workspace from PENDING to a settled state.
//!
//! Both loops are parameterized by policy so tests can run them at
//! millisecond scale. All provider effects are at-least-once: the engine
//! persists the provider handle the moment a create is acknowledged, and a
//! startup sweep resumes monitoring for anything left in flight.

use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use vdi_provider::{
    AdapterFactory, CloudAdapter, DesktopSpec, DesktopState, ProviderError,
};

use crate::credential::CredentialStore;
use crate::error::{OrchestratorError, Result};
use crate::operation::{OperationKind, OperationLog};
use crate::workspace::{Workspace, WorkspaceState, WorkspaceStore};

/// Bounded exponential backoff for transient provider failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Retries after the first attempt; 3 means up to 4 attempts total.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following failed attempt `attempt` (1-based):
    /// base, then doubling (30s, 60s, 120s at the defaults).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

/// How long and how often to poll a desktop that is still settling.
#[derive(Debug, Clone, Copy)]
pub struct MonitorPolicy {
    pub interval: Duration,
    pub max_polls: u32,
}

impl Default for MonitorPolicy {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            max_polls: 60,
        }
    }
}

pub struct Engine {
    store: WorkspaceStore,
    creds: CredentialStore,
    ops: OperationLog,
    factory: Arc<dyn AdapterFactory>,
    retry: RetryPolicy,
    monitor: MonitorPolicy,
}

impl Engine {
    pub fn new(
        store: WorkspaceStore,
        creds: CredentialStore,
        ops: OperationLog,
        factory: Arc<dyn AdapterFactory>,
        retry: RetryPolicy,
        monitor: MonitorPolicy,
    ) -> Self {
        Self {
            store,
            creds,
            ops,
            factory,
            retry,
            monitor,
        }
    }

    async fn adapter_for(&self, workspace: &Workspace) -> Result<Arc<dyn CloudAdapter>> {
        let credential_id = workspace.credential_id.as_deref().ok_or_else(|| {
            OrchestratorError::InvalidState(format!(
                "Workspace {} has no credential; only record-level operations are possible",
                workspace.id
            ))
        })?;
        let material = self.creds.material(credential_id).await?;
        Ok(self.factory.adapter(&material)?)
    }

    /// Run one provider call under the retry policy. Returns the value and
    /// the number of attempts spent.
    async fn with_retry<T, F, Fut>(&self, mut call: F) -> (std::result::Result<T, ProviderError>, u32)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = std::result::Result<T, ProviderError>>,
    {
        let mut attempt = 1;
        loop {
            match call().await {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if err.retryable && attempt < self.retry.max_attempts() => {
                    let delay = self.retry.delay(attempt);
                    warn!(
                        attempt,
                        error = %err,
                        delay_ms = delay.as_millis() as u64,
                        "transient provider failure, backing off"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return (Err(err), attempt),
            }
        }
    }

    /// Provision a PENDING workspace: create the desktop with retry, persist
    /// the handle, then monitor until it settles.
    pub async fn provision(&self, workspace_id: &str) -> Result<Workspace> {
        let workspace = self.store.get(workspace_id).await?;

        if workspace.state != WorkspaceState::Pending {
            return Err(OrchestratorError::InvalidState(format!(
                "Workspace {} is {}, expected PENDING",
                workspace.id, workspace.state
            )));
        }
        if workspace.provider_handle.is_some() {
            // A previous run already got a handle; just pick up monitoring.
            return self.monitor_provisioning(workspace_id).await;
        }

        let adapter = self.adapter_for(&workspace).await?;
        let op_id = self.ops.record(workspace_id, OperationKind::Create).await?;

        let spec = DesktopSpec {
            username: workspace.username.clone(),
            bundle_id: workspace.bundle_id.clone(),
            os: workspace.os,
            tags: vec![
                ("vdi:workspace-id".to_string(), workspace.id.clone()),
                ("vdi:requester".to_string(), workspace.requester.clone()),
            ],
        };

        let (outcome, attempts) = self.with_retry(|| adapter.create_desktop(&spec)).await;

        match outcome {
            Ok(created) => {
                info!(workspace_id, handle = %created.handle, attempts, "desktop create acknowledged");
                self.store.set_handle(workspace_id, &created.handle).await?;
                self.ops.complete(&op_id, attempts, Ok(())).await?;
                self.monitor_provisioning(workspace_id).await
            }
            Err(err) => {
                let diagnostic = format!(
                    "Provisioning failed after {} attempt(s): {}. {}",
                    attempts,
                    err,
                    err.hint()
                );
                self.store.mark_error(workspace_id, &diagnostic).await?;
                self.ops
                    .complete(&op_id, attempts, Err(err.to_string()))
                    .await?;
                self.store.get(workspace_id).await
            }
        }
    }

    /// Poll a freshly created desktop until it becomes AVAILABLE, fails, or
    /// the poll budget runs out. On timeout the workspace stays PENDING with
    /// a diagnostic note; the desktop may still come up on its own.
    pub async fn monitor_provisioning(&self, workspace_id: &str) -> Result<Workspace> {
        self.monitor_until(
            workspace_id,
            &[DesktopState::Available],
            WorkspaceState::Available,
        )
        .await
    }

    async fn monitor_until(
        &self,
        workspace_id: &str,
        targets: &[DesktopState],
        on_target: WorkspaceState,
    ) -> Result<Workspace> {
        let workspace = self.store.get(workspace_id).await?;
        let handle = workspace.provider_handle.clone().ok_or_else(|| {
            OrchestratorError::InvalidState(format!(
                "Workspace {} has no provider handle to monitor",
                workspace.id
            ))
        })?;
        let adapter = self.adapter_for(&workspace).await?;
        // The state this monitor owns. If anything else moves the row (an
        // external terminate, a forced record termination), the monitor has
        // lost its claim and must not write over it.
        let claimed = workspace.state;

        for poll in 1..=self.monitor.max_polls {
            let current = self.store.get(workspace_id).await?;
            if current.state != claimed {
                info!(
                    workspace_id,
                    state = %current.state,
                    "workspace changed state externally; monitor exiting"
                );
                return Ok(current);
            }

            match adapter.describe_desktop(&handle).await {
                Ok(snapshot) => {
                    if targets.contains(&snapshot.state) {
                        self.store
                            .update_connection(
                                workspace_id,
                                snapshot.ip_address.as_deref(),
                                snapshot.computer_name.as_deref(),
                                None,
                                None,
                            )
                            .await?;
                        if on_target == WorkspaceState::Available {
                            self.capture_connection_details(&*adapter, workspace_id, &handle)
                                .await;
                        }
                        self.store.set_state(workspace_id, on_target).await?;
                        info!(workspace_id, polls = poll, state = %on_target, "desktop settled");
                        return self.store.get(workspace_id).await;
                    }
                    match snapshot.state {
                        DesktopState::Error => {
                            let diagnostic = snapshot.error_message.unwrap_or_else(|| {
                                format!("Desktop entered error state ({})", snapshot.raw_state)
                            });
                            self.store.mark_error(workspace_id, &diagnostic).await?;
                            return self.store.get(workspace_id).await;
                        }
                        DesktopState::Terminated => {
                            self.store
                                .set_state(workspace_id, WorkspaceState::Terminated)
                                .await?;
                            return self.store.get(workspace_id).await;
                        }
                        _ => {}
                    }
                }
                Err(err) if err.retryable => {
                    warn!(workspace_id, poll, error = %err, "describe failed transiently; continuing to poll");
                }
                Err(err) => {
                    let diagnostic = format!("Monitoring aborted: {}. {}", err, err.hint());
                    self.store.mark_error(workspace_id, &diagnostic).await?;
                    return self.store.get(workspace_id).await;
                }
            }

            if poll < self.monitor.max_polls {
                tokio::time::sleep(self.monitor.interval).await;
            }
        }

        let current = self.store.get(workspace_id).await?;
        if current.state != claimed {
            return Ok(current);
        }

        let budget = self.monitor.interval * self.monitor.max_polls;
        self.store
            .attach_diagnostic(
                workspace_id,
                &format!(
                    "Desktop did not settle within {} polls ({}s); it may still be provisioning",
                    self.monitor.max_polls,
                    budget.as_secs()
                ),
            )
            .await?;
        self.store.get(workspace_id).await
    }

    /// Persist the connection string (and registration code, when the
    /// provider hands one out) the moment a desktop first turns AVAILABLE.
    async fn capture_connection_details(
        &self,
        adapter: &dyn CloudAdapter,
        workspace_id: &str,
        handle: &str,
    ) {
        match adapter.connection_info(handle).await {
            Ok(details) => {
                if let Err(err) = self
                    .store
                    .update_connection(
                        workspace_id,
                        None,
                        None,
                        Some(&details.connection_string),
                        details.registration_code.as_deref(),
                    )
                    .await
                {
                    warn!(workspace_id, error = %err, "failed to store connection details");
                }
            }
            Err(err) => {
                warn!(workspace_id, error = %err, "could not fetch connection info");
            }
        }
    }

    /// Issue a start/stop/reboot command with retry, move the row into the
    /// transitional state, then monitor to the settled one.
    pub async fn run_transition(
        &self,
        workspace_id: &str,
        kind: OperationKind,
    ) -> Result<Workspace> {
        let workspace = self.store.get(workspace_id).await?;
        let handle = workspace.provider_handle.clone().ok_or_else(|| {
            OrchestratorError::InvalidState(format!(
                "Workspace {} has not been provisioned yet",
                workspace.id
            ))
        })?;
        let adapter = self.adapter_for(&workspace).await?;
        let op_id = self.ops.record(workspace_id, kind).await?;

        let (transitional, target_state, stored_target) = match kind {
            OperationKind::Start => (
                WorkspaceState::Starting,
                DesktopState::Available,
                WorkspaceState::Available,
            ),
            OperationKind::Stop => (
                WorkspaceState::Stopping,
                DesktopState::Stopped,
                WorkspaceState::Stopped,
            ),
            OperationKind::Reboot => (
                WorkspaceState::Rebooting,
                DesktopState::Available,
                WorkspaceState::Available,
            ),
            other => {
                return Err(OrchestratorError::InvalidInput(format!(
                    "{:?} is not a monitored transition",
                    other
                )))
            }
        };

        let (outcome, attempts) = match kind {
            OperationKind::Start => self.with_retry(|| adapter.start_desktop(&handle)).await,
            OperationKind::Stop => self.with_retry(|| adapter.stop_desktop(&handle)).await,
            OperationKind::Reboot => self.with_retry(|| adapter.reboot_desktop(&handle)).await,
            _ => unreachable!(),
        };

        match outcome {
            Ok(()) => {
                self.store.set_state(workspace_id, transitional).await?;
                self.ops.complete(&op_id, attempts, Ok(())).await?;
                self.monitor_until(workspace_id, &[target_state], stored_target)
                    .await
            }
            Err(err) => {
                let diagnostic = format!(
                    "{:?} failed after {} attempt(s): {}. {}",
                    kind,
                    attempts,
                    err,
                    err.hint()
                );
                self.store.mark_error(workspace_id, &diagnostic).await?;
                self.ops
                    .complete(&op_id, attempts, Err(err.to_string()))
                    .await?;
                self.store.get(workspace_id).await
            }
        }
    }

    /// Terminate the backing desktop. Destructive commands settle locally
    /// right away; the provider finishes tearing down on its own.
    ///
    /// Returns `Err` with the provider failure so the caller can decide
    /// whether to force a record-level termination anyway.
    pub async fn terminate(&self, workspace_id: &str) -> Result<Workspace> {
        let workspace = self.store.get(workspace_id).await?;
        let Some(handle) = workspace.provider_handle.clone() else {
            // Never reached the provider; nothing to tear down.
            self.store
                .set_state(workspace_id, WorkspaceState::Terminated)
                .await?;
            return self.store.get(workspace_id).await;
        };

        let adapter = self.adapter_for(&workspace).await?;
        let op_id = self
            .ops
            .record(workspace_id, OperationKind::Terminate)
            .await?;

        let (outcome, attempts) = self.with_retry(|| adapter.terminate_desktop(&handle)).await;

        match outcome {
            Ok(()) => {
                self.store
                    .set_state(workspace_id, WorkspaceState::Terminated)
                    .await?;
                self.ops.complete(&op_id, attempts, Ok(())).await?;
                self.store.get(workspace_id).await
            }
            Err(err) => {
                self.ops
                    .complete(&op_id, attempts, Err(err.to_string()))
                    .await?;
                Err(err.into())
            }
        }
    }

    /// One describe, mapped straight onto the stored state. Unknown vendor
    /// states leave the row untouched.
    pub async fn refresh(&self, workspace_id: &str) -> Result<Workspace> {
        let workspace = self.store.get(workspace_id).await?;
        let handle = workspace.provider_handle.clone().ok_or_else(|| {
            OrchestratorError::InvalidState(format!(
                "Workspace {} has not been provisioned yet",
                workspace.id
            ))
        })?;
        let adapter = self.adapter_for(&workspace).await?;

        let snapshot = adapter.describe_desktop(&handle).await?;
        self.store
            .update_connection(
                workspace_id,
                snapshot.ip_address.as_deref(),
                snapshot.computer_name.as_deref(),
                None,
                None,
            )
            .await?;

        match map_desktop_state(snapshot.state) {
            Some(WorkspaceState::Error) => {
                let diagnostic = snapshot
                    .error_message
                    .unwrap_or_else(|| format!("Desktop is unhealthy ({})", snapshot.raw_state));
                self.store.mark_error(workspace_id, &diagnostic).await?;
            }
            Some(state) => self.store.set_state(workspace_id, state).await?,
            None => {}
        }

        self.store.get(workspace_id).await
    }

    /// Startup sweep: resume monitoring for every workspace that was mid-
    /// transition when the process last stopped. Returns how many were
    /// picked up.
    pub async fn resume_incomplete(self: &Arc<Self>) -> Result<usize> {
        let incomplete = self.store.incomplete().await?;
        let count = incomplete.len();

        for workspace in incomplete {
            info!(workspace_id = %workspace.id, state = %workspace.state, "resuming interrupted operation");
            let engine = Arc::clone(self);
            tokio::spawn(async move {
                let result = match workspace.state {
                    WorkspaceState::Pending | WorkspaceState::Rebooting => {
                        engine.monitor_provisioning(&workspace.id).await
                    }
                    WorkspaceState::Starting => {
                        engine
                            .monitor_until(
                                &workspace.id,
                                &[DesktopState::Available],
                                WorkspaceState::Available,
                            )
                            .await
                    }
                    WorkspaceState::Stopping => {
                        engine
                            .monitor_until(
                                &workspace.id,
                                &[DesktopState::Stopped],
                                WorkspaceState::Stopped,
                            )
                            .await
                    }
                    _ => return,
                };
                if let Err(err) = result {
                    warn!(workspace_id = %workspace.id, error = %err, "resumed monitor failed");
                }
            });
        }

        Ok(count)
    }
}

/// Map an observed desktop state onto the stored one; `None` means leave
/// the stored state alone.
fn map_desktop_state(state: DesktopState) -> Option<WorkspaceState> {
    match state {
        DesktopState::Pending => Some(WorkspaceState::Pending),
        DesktopState::Available => Some(WorkspaceState::Available),
        DesktopState::Starting => Some(WorkspaceState::Starting),
        DesktopState::Stopping => Some(WorkspaceState::Stopping),
        DesktopState::Stopped => Some(WorkspaceState::Stopped),
        DesktopState::Rebooting => Some(WorkspaceState::Rebooting),
        DesktopState::Terminated => Some(WorkspaceState::Terminated),
        DesktopState::Error => Some(WorkspaceState::Error),
        DesktopState::Unknown => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_per_attempt() {
        let policy = RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(30),
        };
        assert_eq!(policy.delay(1), Duration::from_secs(30));
        assert_eq!(policy.delay(2), Duration::from_secs(60));
        assert_eq!(policy.delay(3), Duration::from_secs(120));
        assert_eq!(policy.max_attempts(), 4);
    }

    #[test]
    fn unknown_desktop_state_leaves_row_untouched() {
        assert_eq!(map_desktop_state(DesktopState::Unknown), None);
        assert_eq!(
            map_desktop_state(DesktopState::Available),
            Some(WorkspaceState::Available)
        );
    }
}
