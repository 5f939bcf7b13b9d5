//! Request-level API over the stores and the engine: validation, state
//! gating and assignment rules live here, provider mechanics live in
//! [`Engine`](crate::engine::Engine).

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

use vdi_core::{CloudProvider, DesktopOs};
use vdi_provider::{AdapterFactory, Bundle};

use crate::applications::{ApplicationDirectory, ApplicationRecord};
use crate::catalog::{self, GroupedCatalog};
use crate::credential::{CredentialStore, CredentialSummary, NewCredential};
use crate::engine::Engine;
use crate::error::{OrchestratorError, Result};
use crate::operation::{Operation, OperationKind, OperationLog};
use crate::workspace::{
    NewWorkspace, Workspace, WorkspaceFilters, WorkspaceState, WorkspaceStore,
};

#[derive(Debug, Clone)]
pub struct CreateWorkspaceRequest {
    pub credential_id: String,
    pub application_id: String,
    pub bundle_id: String,
    pub os: DesktopOs,
    pub requester: String,
}

#[derive(Debug, Clone)]
pub struct ImportWorkspaceRequest {
    pub provider: CloudProvider,
    pub provider_handle: String,
    pub requester: String,
    pub username: String,
    pub os: DesktopOs,
    /// Desktop login password for the pre-existing machine; encrypted with
    /// the vault before the record is written.
    pub password: Option<String>,
    /// Without a credential the workspace can only ever be terminated at
    /// the record level; no cloud call will work for it.
    pub credential_id: Option<String>,
    pub application_id: Option<String>,
    pub bundle_id: Option<String>,
    pub registration_code: Option<String>,
}

/// What a caller needs to reach a desktop. The password is only filled in
/// for the assigned desktop user or the creating owner.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub connection_string: String,
    pub username: String,
    pub registration_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

/// Outcome of adding a credential: the stored summary plus a remediation
/// hint when the validation probe failed.
#[derive(Debug, Clone)]
pub struct CredentialOutcome {
    pub credential: CredentialSummary,
    pub problem: Option<String>,
}

pub struct WorkspaceService {
    store: WorkspaceStore,
    creds: CredentialStore,
    ops: OperationLog,
    engine: Arc<Engine>,
    factory: Arc<dyn AdapterFactory>,
    directory: Arc<dyn ApplicationDirectory>,
}

impl WorkspaceService {
    pub fn new(
        store: WorkspaceStore,
        creds: CredentialStore,
        ops: OperationLog,
        engine: Arc<Engine>,
        factory: Arc<dyn AdapterFactory>,
        directory: Arc<dyn ApplicationDirectory>,
    ) -> Self {
        Self {
            store,
            creds,
            ops,
            engine,
            factory,
            directory,
        }
    }

    pub fn engine(&self) -> &Arc<Engine> {
        &self.engine
    }

    /// Resolve an application and check it can take a workspace: approved,
    /// owned by the requester, and not already assigned an active one.
    async fn approved_application(
        &self,
        application_id: &str,
        requester: &str,
    ) -> Result<ApplicationRecord> {
        let application = self
            .directory
            .application(application_id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("application {}", application_id)))?;

        if !application.approved {
            return Err(OrchestratorError::InvalidState(format!(
                "Application {} is not approved",
                application.id
            )));
        }
        if application.requester != requester {
            return Err(OrchestratorError::InvalidInput(format!(
                "Application {} belongs to {}, not {}",
                application.id, application.requester, requester
            )));
        }
        if let Some(existing) = self.store.active_for_application(&application.id).await? {
            return Err(OrchestratorError::Conflict(format!(
                "Application {} already has workspace {} ({})",
                application.id, existing.id, existing.state
            )));
        }

        Ok(application)
    }

    // ---- workspaces ----

    /// Create a workspace for an approved application and kick off
    /// provisioning in the background. Returns the PENDING record
    /// immediately; callers observe progress via the stored row
    /// (`get_workspace`/`refresh_workspace`).
    ///
    /// Bundle validation is soft: an id missing from the provider catalog is
    /// logged, not rejected, because catalogs lag behind newly published
    /// bundles and host-pool ids are deployment-specific.
    pub async fn create_workspace(&self, req: CreateWorkspaceRequest) -> Result<Workspace> {
        let application = self
            .approved_application(&req.application_id, &req.requester)
            .await?;

        let credential = self.creds.get(&req.credential_id).await?;

        match self.list_bundles(&req.credential_id).await {
            Ok(bundles) => {
                if !catalog::bundle_known(&bundles, &req.bundle_id) {
                    warn!(
                        bundle_id = %req.bundle_id,
                        "bundle not in provider catalog; proceeding anyway"
                    );
                }
            }
            Err(err) => warn!(error = %err, "could not fetch bundle catalog for validation"),
        }

        let workspace = self
            .store
            .create(NewWorkspace {
                credential_id: Some(credential.id.clone()),
                application_id: Some(application.id.clone()),
                requester: req.requester,
                username: application.username,
                bundle_id: req.bundle_id,
                os: req.os,
                provider: credential.provider,
                provider_handle: None,
                registration_code: None,
                password_enc: None,
                initial_state: WorkspaceState::Pending,
                imported: false,
            })
            .await?;

        info!(workspace_id = %workspace.id, provider = %workspace.provider, "workspace created; provisioning in the background");
        self.spawn_provisioning(&workspace.id);
        Ok(workspace)
    }

    /// Fire-and-forget provisioning task. The engine records every outcome
    /// on the row itself, so a task failure still leaves a diagnostic
    /// behind; the log line here is the last resort for errors that never
    /// reached the store.
    fn spawn_provisioning(&self, workspace_id: &str) {
        let engine = Arc::clone(&self.engine);
        let id = workspace_id.to_string();
        tokio::spawn(async move {
            if let Err(err) = engine.provision(&id).await {
                warn!(workspace_id = %id, error = %err, "provisioning task failed");
            }
        });
    }

    /// Adopt an already-provisioned desktop. The handle must not be tracked
    /// by any other workspace record. With a credential the desktop is
    /// described once to seed the stored state; without one the record is
    /// registered as AVAILABLE on the caller's word, and no lifecycle
    /// command will ever reach the provider for it.
    pub async fn import_workspace(&self, req: ImportWorkspaceRequest) -> Result<Workspace> {
        if let Some(existing) = self.store.get_by_handle(&req.provider_handle).await? {
            return Err(OrchestratorError::Conflict(format!(
                "Handle {} is already tracked by workspace {}",
                req.provider_handle, existing.id
            )));
        }

        let application_id = match &req.application_id {
            Some(app_id) => Some(self.approved_application(app_id, &req.requester).await?.id),
            None => None,
        };

        let password_enc = match &req.password {
            Some(password) => Some(self.creds.vault().encrypt(password)?),
            None => None,
        };

        let mut snapshot = None;
        let credential_id = match &req.credential_id {
            Some(credential_id) => {
                let credential = self.creds.get(credential_id).await?;
                if credential.provider != req.provider {
                    return Err(OrchestratorError::InvalidInput(format!(
                        "Credential {} is for {}, not {}",
                        credential.id, credential.provider, req.provider
                    )));
                }
                let material = self.creds.material(credential_id).await?;
                let adapter = self.factory.adapter(&material)?;
                snapshot = Some(adapter.describe_desktop(&req.provider_handle).await?);
                Some(credential.id)
            }
            None => None,
        };

        let initial_state = match snapshot.as_ref().map(|s| s.state) {
            Some(vdi_provider::DesktopState::Stopped) => WorkspaceState::Stopped,
            Some(vdi_provider::DesktopState::Terminated) => WorkspaceState::Terminated,
            Some(vdi_provider::DesktopState::Error) => WorkspaceState::Error,
            Some(vdi_provider::DesktopState::Available) | None => WorkspaceState::Available,
            Some(_) => WorkspaceState::Pending,
        };

        let workspace = self
            .store
            .create(NewWorkspace {
                credential_id,
                application_id,
                requester: req.requester,
                username: req.username,
                bundle_id: req.bundle_id.unwrap_or_else(|| "imported".to_string()),
                os: req.os,
                provider: req.provider,
                provider_handle: Some(req.provider_handle.clone()),
                registration_code: req.registration_code,
                password_enc,
                initial_state,
                imported: true,
            })
            .await?;

        if let Some(snapshot) = snapshot {
            if initial_state == WorkspaceState::Error {
                let diagnostic = snapshot
                    .error_message
                    .unwrap_or_else(|| format!("Imported in error state ({})", snapshot.raw_state));
                self.store.mark_error(&workspace.id, &diagnostic).await?;
            }
            self.store
                .update_connection(
                    &workspace.id,
                    snapshot.ip_address.as_deref(),
                    snapshot.computer_name.as_deref(),
                    None,
                    None,
                )
                .await?;
        }
        let op_id = self.ops.record(&workspace.id, OperationKind::Import).await?;
        self.ops.complete(&op_id, 1, Ok(())).await?;

        self.store.get(&workspace.id).await
    }

    pub async fn get_workspace(&self, id: &str) -> Result<Workspace> {
        self.store.get(id).await
    }

    pub async fn list_workspaces(&self, filters: WorkspaceFilters) -> Result<Vec<Workspace>> {
        self.store.list(filters).await
    }

    pub async fn start_workspace(&self, id: &str) -> Result<Workspace> {
        let workspace = self.store.get(id).await?;
        require_state(
            &workspace,
            &[WorkspaceState::Stopped, WorkspaceState::Available],
            "start",
        )?;
        if workspace.state == WorkspaceState::Available {
            // Already running; report as-is rather than bothering the provider.
            return Ok(workspace);
        }
        self.engine.run_transition(id, OperationKind::Start).await
    }

    pub async fn stop_workspace(&self, id: &str) -> Result<Workspace> {
        let workspace = self.store.get(id).await?;
        require_state(&workspace, &[WorkspaceState::Available], "stop")?;
        self.engine.run_transition(id, OperationKind::Stop).await
    }

    pub async fn reboot_workspace(&self, id: &str) -> Result<Workspace> {
        let workspace = self.store.get(id).await?;
        require_state(&workspace, &[WorkspaceState::Available], "reboot")?;
        self.engine.run_transition(id, OperationKind::Reboot).await
    }

    /// Terminate the desktop and mark the record TERMINATED. With `force`,
    /// a provider-side failure is logged and the record is terminated
    /// anyway, which can leave a desktop running (and billing) at the
    /// provider.
    pub async fn terminate_workspace(&self, id: &str, force: bool) -> Result<Workspace> {
        let workspace = self.store.get(id).await?;
        if workspace.state == WorkspaceState::Terminated {
            return Err(OrchestratorError::InvalidState(format!(
                "Workspace {} is already terminated",
                id
            )));
        }

        match self.engine.terminate(id).await {
            Ok(workspace) => Ok(workspace),
            Err(err) if force => {
                warn!(
                    workspace_id = id,
                    error = %err,
                    "provider terminate failed; forcing record termination. The desktop may still exist at the provider"
                );
                self.store.set_state(id, WorkspaceState::Terminated).await?;
                self.store
                    .attach_diagnostic(
                        id,
                        &format!("Forcibly terminated; provider cleanup failed: {}", err),
                    )
                    .await?;
                self.store.get(id).await
            }
            Err(err) => Err(err),
        }
    }

    /// Re-run provisioning for a workspace stuck in ERROR, re-entering the
    /// background creation path from scratch. The stored handle is dropped:
    /// if the failed attempt did leave a desktop behind, it shows up in
    /// `stale` style audits, not here. Returns the reset PENDING record.
    pub async fn retry_workspace(&self, id: &str) -> Result<Workspace> {
        let workspace = self.store.get(id).await?;
        require_state(&workspace, &[WorkspaceState::Error], "retry")?;

        let op_id = self.ops.record(id, OperationKind::Retry).await?;
        self.ops.complete(&op_id, 1, Ok(())).await?;
        self.store.reset_for_retry(id).await?;
        self.spawn_provisioning(id);
        self.store.get(id).await
    }

    pub async fn refresh_workspace(&self, id: &str) -> Result<Workspace> {
        let op_id = self.ops.record(id, OperationKind::Refresh).await?;
        let result = self.engine.refresh(id).await;
        self.ops
            .complete(
                &op_id,
                1,
                result.as_ref().map(|_| ()).map_err(|e| e.to_string()),
            )
            .await?;
        result
    }

    /// Connection details for an AVAILABLE workspace. AWS desktops connect
    /// via `workspaces://` with the directory registration code when one is
    /// known; Azure desktops via `ms-avd://` and the session host handle.
    ///
    /// The stored password of an imported workspace is only decrypted for
    /// the assigned desktop user or the requester who registered it.
    pub async fn connection_info(&self, id: &str, caller: &str) -> Result<ConnectionInfo> {
        let workspace = self.store.get(id).await?;
        require_state(&workspace, &[WorkspaceState::Available], "connect to")?;

        let handle = workspace.provider_handle.as_deref().ok_or_else(|| {
            OrchestratorError::InvalidState(format!("Workspace {} has no provider handle", id))
        })?;

        let mut connection_string;
        let mut registration_code;
        match workspace.credential_id.as_deref() {
            Some(credential_id) => {
                let material = self.creds.material(credential_id).await?;
                let adapter = self.factory.adapter(&material)?;
                let details = adapter.connection_info(handle).await?;
                connection_string = Some(details.connection_string);
                registration_code = details.registration_code;
            }
            None => {
                // Imported without a credential: the stored record is all
                // there is.
                connection_string = workspace.connection_string.clone();
                registration_code = None;
            }
        }

        // A registration code captured at import or first availability wins
        // over whatever the provider reports now.
        if workspace.registration_code.is_some() {
            registration_code = workspace.registration_code.clone();
        }
        if workspace.provider == CloudProvider::Aws {
            if let Some(code) = &registration_code {
                connection_string = Some(format!("workspaces://{}", code));
            }
        }

        let connection_string = connection_string.ok_or_else(|| {
            OrchestratorError::InvalidState(format!(
                "Workspace {} has no credential and no stored connection data",
                id
            ))
        })?;

        let authorized = caller == workspace.username || caller == workspace.requester;
        let password = match (&workspace.password_enc, authorized) {
            (Some(ciphertext), true) => Some(self.creds.vault().decrypt(ciphertext)?),
            _ => None,
        };

        Ok(ConnectionInfo {
            connection_string,
            username: workspace.username,
            registration_code,
            password,
        })
    }

    pub async fn update_assignment(
        &self,
        id: &str,
        application_id: Option<&str>,
    ) -> Result<Workspace> {
        if let Some(app_id) = application_id {
            let application = self
                .directory
                .application(app_id)?
                .ok_or_else(|| OrchestratorError::NotFound(format!("application {}", app_id)))?;
            if !application.approved {
                return Err(OrchestratorError::InvalidState(format!(
                    "Application {} is not approved",
                    app_id
                )));
            }
            if let Some(existing) = self.store.active_for_application(app_id).await? {
                if existing.id != id {
                    return Err(OrchestratorError::Conflict(format!(
                        "Application {} already has workspace {}",
                        app_id, existing.id
                    )));
                }
            }
        }

        self.store.set_assignment(id, application_id).await?;
        self.store.get(id).await
    }

    /// Administrative removal of a workspace row. Cloud teardown is
    /// attempted first when a handle and credential exist, but the local
    /// delete proceeds regardless; a teardown failure comes back as a
    /// warning, and the desktop may keep running at the provider.
    pub async fn delete_workspace(&self, id: &str) -> Result<Option<String>> {
        let workspace = self.store.get(id).await?;

        let mut warning = None;
        if workspace.provider_handle.is_some() && workspace.state != WorkspaceState::Terminated {
            if let Err(err) = self.engine.terminate(id).await {
                warn!(workspace_id = id, error = %err, "cloud teardown failed; deleting the record anyway");
                warning = Some(format!(
                    "Cloud teardown failed: {}. The desktop may still exist at the provider",
                    err
                ));
            }
        }

        self.store.delete(id).await?;
        Ok(warning)
    }

    /// Handle-less PENDING rows past the grace period: provisioning was
    /// interrupted before the provider acknowledged anything. Surfaced for
    /// operators; never auto-healed.
    pub async fn stale_pending(&self, grace_secs: i64) -> Result<Vec<Workspace>> {
        self.store.stale_pending(grace_secs).await
    }

    /// Workspaces whose provisioning monitor or transition is still in
    /// flight, for callers that need to wait on background work.
    pub async fn in_flight_workspaces(&self) -> Result<Vec<Workspace>> {
        self.store.incomplete().await
    }

    pub async fn operations_for(&self, workspace_id: &str) -> Result<Vec<Operation>> {
        self.ops.for_workspace(workspace_id).await
    }

    pub async fn failed_operations(&self) -> Result<Vec<Operation>> {
        self.ops.failed().await
    }

    // ---- credentials ----

    /// Store a credential and probe it with one read-only call. The
    /// credential is kept either way; `problem` carries the remediation
    /// hint when the probe failed.
    pub async fn add_credential(&self, new: NewCredential) -> Result<CredentialOutcome> {
        let credential = self.creds.add(new).await?;
        let problem = self.probe_credential(&credential.id).await?;
        let credential = self.creds.get(&credential.id).await?;

        Ok(CredentialOutcome {
            credential,
            problem,
        })
    }

    pub async fn verify_credential(&self, id: &str) -> Result<CredentialOutcome> {
        let problem = self.probe_credential(id).await?;
        let credential = self.creds.get(id).await?;

        Ok(CredentialOutcome {
            credential,
            problem,
        })
    }

    async fn probe_credential(&self, id: &str) -> Result<Option<String>> {
        let material = self.creds.material(id).await?;
        let problem = match self.factory.adapter(&material) {
            Ok(adapter) => match adapter.check_credentials().await {
                Ok(()) => None,
                Err(err) => Some(format!("{}. {}", err, err.hint())),
            },
            Err(err) => Some(format!("{}. {}", err, err.hint())),
        };

        self.creds.mark_checked(id, problem.is_none()).await?;
        Ok(problem)
    }

    pub async fn list_credentials(&self) -> Result<Vec<CredentialSummary>> {
        self.creds.list().await
    }

    pub async fn delete_credential(&self, id: &str) -> Result<()> {
        let active = self.store.count_active_for_credential(id).await?;
        self.creds.delete(id, active).await
    }

    // ---- bundles ----

    pub async fn list_bundles(&self, credential_id: &str) -> Result<Vec<Bundle>> {
        let material = self.creds.material(credential_id).await?;
        let adapter = self.factory.adapter(&material)?;
        Ok(adapter.list_bundles().await?)
    }

    pub async fn bundle_catalog(&self, credential_id: &str) -> Result<GroupedCatalog> {
        Ok(catalog::group_by_compute_type(
            self.list_bundles(credential_id).await?,
        ))
    }
}

fn require_state(workspace: &Workspace, allowed: &[WorkspaceState], action: &str) -> Result<()> {
    if workspace.provider_handle.is_none() && workspace.state == WorkspaceState::Pending {
        return Err(OrchestratorError::InvalidState(format!(
            "Cannot {} workspace {}: provisioning has not completed",
            action, workspace.id
        )));
    }
    if !allowed.contains(&workspace.state) {
        return Err(OrchestratorError::InvalidState(format!(
            "Cannot {} workspace {} while it is {}",
            action, workspace.id, workspace.state
        )));
    }
    Ok(())
}
