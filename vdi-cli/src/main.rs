//! `vdi` command-line interface.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::sync::Arc;
use tracing::warn;

use vdi_core::{CloudProvider, DesktopOs};
use vdi_orchestrator::applications::JsonApplicationDirectory;
use vdi_orchestrator::credential::{CredentialStore, NewCredential};
use vdi_orchestrator::engine::Engine;
use vdi_orchestrator::operation::OperationLog;
use vdi_orchestrator::service::{
    CreateWorkspaceRequest, ImportWorkspaceRequest, WorkspaceService,
};
use vdi_orchestrator::workspace::{Workspace, WorkspaceFilters, WorkspaceState, WorkspaceStore};
use vdi_orchestrator::{db, Config};
use vdi_provider::CliAdapterFactory;
use vdi_vault::Vault;

#[derive(Parser)]
#[command(name = "vdi", about = "Provision and manage cloud virtual desktops", version)]
struct Cli {
    /// Emit JSON instead of human-readable output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Manage cloud credentials
    #[command(subcommand)]
    Credential(CredentialCommand),

    /// Create and provision a workspace for an approved application
    Create(CreateArgs),

    /// Adopt an already-provisioned desktop into tracking
    Import(ImportArgs),

    /// List workspaces
    List(ListArgs),

    /// Show one workspace
    Show { id: String },

    /// Start a stopped workspace
    Start { id: String },

    /// Stop a running workspace
    Stop { id: String },

    /// Reboot a running workspace
    Reboot { id: String },

    /// Terminate a workspace and its desktop
    Terminate {
        id: String,
        /// Mark the record terminated even if the provider call fails.
        /// The desktop may keep running (and billing) at the provider.
        #[arg(long)]
        force: bool,
    },

    /// Remove a workspace record after best-effort cloud teardown
    Delete { id: String },

    /// Re-run provisioning for a workspace in ERROR
    Retry {
        id: String,
        /// Print the reset PENDING record and exit instead of waiting
        #[arg(long)]
        no_wait: bool,
    },

    /// Re-read the desktop state from the provider
    Refresh { id: String },

    /// Print connection details for an available workspace
    Connect {
        id: String,
        /// Who is asking; the stored password is only released to the
        /// desktop user or the workspace's requester. Defaults to $USER
        #[arg(long)]
        requester: Option<String>,
    },

    /// Show the operation history of a workspace
    Operations { id: String },

    /// List provisionable bundles for a credential
    Bundles {
        #[arg(long)]
        credential: String,
        /// Group by compute type
        #[arg(long)]
        grouped: bool,
    },

    /// Report PENDING workspaces stuck without a provider handle
    Stale {
        /// Minimum age in seconds before a row counts as stale
        #[arg(long, default_value_t = 3600)]
        grace_secs: i64,
    },

    /// Resume monitoring for workspaces left mid-transition
    Resume,
}

#[derive(Subcommand)]
enum CredentialCommand {
    /// Store a credential (validated with one read-only provider call)
    Add(CredentialAddArgs),
    /// List stored credentials (key material masked)
    List,
    /// Re-run the validation probe
    Check { id: String },
    /// Delete a credential with no active workspaces
    Remove { id: String },
}

#[derive(Args)]
struct CredentialAddArgs {
    #[arg(long)]
    name: String,
    #[arg(long)]
    provider: CloudProviderArg,
    #[arg(long)]
    access_key: String,
    #[arg(long)]
    secret_key: String,
    #[arg(long)]
    region: String,
    /// AWS WorkSpaces directory id (d-xxxxxxxxxx)
    #[arg(long)]
    directory_id: Option<String>,
    #[arg(long)]
    tenant_id: Option<String>,
    #[arg(long)]
    subscription_id: Option<String>,
    #[arg(long)]
    resource_group: Option<String>,
}

#[derive(Args)]
struct CreateArgs {
    #[arg(long)]
    credential: String,
    #[arg(long)]
    application: String,
    #[arg(long)]
    bundle: String,
    #[arg(long, default_value = "windows")]
    os: DesktopOsArg,
    /// Defaults to $USER
    #[arg(long)]
    requester: Option<String>,
    /// Print the PENDING record and exit instead of waiting for
    /// provisioning to settle
    #[arg(long)]
    no_wait: bool,
}

#[derive(Args)]
struct ImportArgs {
    #[arg(long)]
    provider: CloudProviderArg,
    #[arg(long)]
    handle: String,
    #[arg(long)]
    username: String,
    #[arg(long, default_value = "windows")]
    os: DesktopOsArg,
    /// Desktop login password, stored encrypted
    #[arg(long)]
    password: Option<String>,
    /// Without a credential the workspace can only be managed at the
    /// record level
    #[arg(long)]
    credential: Option<String>,
    #[arg(long)]
    application: Option<String>,
    #[arg(long)]
    bundle: Option<String>,
    #[arg(long)]
    registration_code: Option<String>,
    #[arg(long)]
    requester: Option<String>,
}

#[derive(Args)]
struct ListArgs {
    #[arg(long)]
    requester: Option<String>,
    #[arg(long)]
    state: Option<String>,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum CloudProviderArg {
    Aws,
    Azure,
}

impl From<CloudProviderArg> for CloudProvider {
    fn from(value: CloudProviderArg) -> Self {
        match value {
            CloudProviderArg::Aws => CloudProvider::Aws,
            CloudProviderArg::Azure => CloudProvider::Azure,
        }
    }
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum DesktopOsArg {
    Ubuntu,
    Windows,
}

impl From<DesktopOsArg> for DesktopOs {
    fn from(value: DesktopOsArg) -> Self {
        match value {
            DesktopOsArg::Ubuntu => DesktopOs::Ubuntu,
            DesktopOsArg::Windows => DesktopOs::Windows,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    vdi_core::logging::init("vdi=info,vdi_orchestrator=info,vdi_provider=info");

    let cli = Cli::parse();
    let config = Config::from_env();

    let pool = db::create_pool(&config.db_path).await?;
    db::run_migrations(&pool).await?;

    let passphrase = config.vault_passphrase()?;
    let vault = Arc::new(Vault::open(&config.data_dir, &passphrase)?);

    let store = WorkspaceStore::new(pool.clone());
    let creds = CredentialStore::new(pool.clone(), vault);
    let ops = OperationLog::new(pool);
    let factory = Arc::new(CliAdapterFactory);

    let engine = Arc::new(Engine::new(
        store.clone(),
        creds.clone(),
        ops.clone(),
        factory.clone(),
        config.retry_policy(),
        config.monitor_policy(),
    ));

    let directory = load_directory(&config);
    let service = WorkspaceService::new(store, creds, ops, engine, factory, directory);

    run(cli, &config, &service).await
}

fn load_directory(config: &Config) -> Arc<JsonApplicationDirectory> {
    let path = std::env::var("VDI_APPLICATIONS_FILE")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| config.data_dir.join("applications.json"));

    match JsonApplicationDirectory::load(&path) {
        Ok(directory) => Arc::new(directory),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "no application directory loaded");
            Arc::new(JsonApplicationDirectory::from_records(Vec::new()))
        }
    }
}

async fn run(cli: Cli, config: &Config, service: &WorkspaceService) -> Result<()> {
    let json = cli.json;

    match cli.command {
        Command::Credential(cmd) => run_credential(cmd, json, service).await?,

        Command::Create(args) => {
            let workspace = service
                .create_workspace(CreateWorkspaceRequest {
                    credential_id: args.credential,
                    application_id: args.application,
                    bundle_id: args.bundle,
                    os: args.os.into(),
                    requester: requester(args.requester)?,
                })
                .await?;
            if args.no_wait {
                print_workspace(&workspace, json)?;
            } else {
                let settled = watch_until_settled(service, config, &workspace.id).await?;
                print_workspace(&settled, json)?;
            }
        }

        Command::Import(args) => {
            let workspace = service
                .import_workspace(ImportWorkspaceRequest {
                    provider: args.provider.into(),
                    provider_handle: args.handle,
                    requester: requester(args.requester)?,
                    username: args.username,
                    os: args.os.into(),
                    password: args.password,
                    credential_id: args.credential,
                    application_id: args.application,
                    bundle_id: args.bundle,
                    registration_code: args.registration_code,
                })
                .await?;
            print_workspace(&workspace, json)?;
        }

        Command::List(args) => {
            let state = args
                .state
                .map(|s| parse_state(&s))
                .transpose()?;
            let workspaces = service
                .list_workspaces(WorkspaceFilters {
                    requester: args.requester,
                    state,
                    provider: None,
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&workspaces)?);
            } else {
                for ws in &workspaces {
                    println!(
                        "{}  {:<10}  {:<8}  {}  {}",
                        ws.id,
                        ws.state,
                        ws.provider,
                        ws.username,
                        ws.provider_handle.as_deref().unwrap_or("-")
                    );
                }
            }
        }

        Command::Show { id } => {
            let workspace = service.get_workspace(&id).await?;
            print_workspace(&workspace, json)?;
        }

        Command::Start { id } => print_workspace(&service.start_workspace(&id).await?, json)?,
        Command::Stop { id } => print_workspace(&service.stop_workspace(&id).await?, json)?,
        Command::Reboot { id } => print_workspace(&service.reboot_workspace(&id).await?, json)?,

        Command::Terminate { id, force } => {
            let workspace = service.terminate_workspace(&id, force).await?;
            print_workspace(&workspace, json)?;
        }

        Command::Delete { id } => {
            let warning = service.delete_workspace(&id).await?;
            println!("deleted workspace {}", id);
            if let Some(warning) = warning {
                eprintln!("warning: {}", warning);
            }
        }

        Command::Retry { id, no_wait } => {
            let workspace = service.retry_workspace(&id).await?;
            if no_wait {
                print_workspace(&workspace, json)?;
            } else {
                let settled = watch_until_settled(service, config, &id).await?;
                print_workspace(&settled, json)?;
            }
        }
        Command::Refresh { id } => print_workspace(&service.refresh_workspace(&id).await?, json)?,

        Command::Connect { id, requester: who } => {
            let caller = requester(who)?;
            let info = service.connection_info(&id, &caller).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&info)?);
            } else {
                println!("connection: {}", info.connection_string);
                println!("username:   {}", info.username);
                if let Some(code) = &info.registration_code {
                    println!("registration code: {}", code);
                }
                if let Some(password) = &info.password {
                    println!("password:   {}", password);
                }
            }
        }

        Command::Operations { id } => {
            let operations = service.operations_for(&id).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&operations)?);
            } else {
                for op in &operations {
                    println!(
                        "{}  {:?}  {:?}  attempts={}  {}",
                        op.started_at.to_rfc3339(),
                        op.kind,
                        op.status,
                        op.attempts,
                        op.error.as_deref().unwrap_or("")
                    );
                }
            }
        }

        Command::Bundles {
            credential,
            grouped,
        } => {
            if grouped {
                let catalog = service.bundle_catalog(&credential).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&catalog)?);
                } else {
                    for (compute, bundles) in &catalog.groups {
                        println!("{}:", compute);
                        for bundle in bundles {
                            println!("  {}  {}", bundle.bundle_id, bundle.name);
                        }
                    }
                }
            } else {
                let bundles = service.list_bundles(&credential).await?;
                if json {
                    println!("{}", serde_json::to_string_pretty(&bundles)?);
                } else {
                    for bundle in &bundles {
                        println!(
                            "{}  {:<24}  {}",
                            bundle.bundle_id, bundle.name, bundle.compute_type
                        );
                    }
                }
            }
        }

        Command::Stale { grace_secs } => {
            let stale = service.stale_pending(grace_secs).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&stale)?);
            } else if stale.is_empty() {
                println!("no stale pending workspaces");
            } else {
                println!("workspaces stuck in PENDING without a provider handle:");
                for ws in &stale {
                    println!(
                        "  {}  created {}  requester {}",
                        ws.id,
                        ws.created_at.to_rfc3339(),
                        ws.requester
                    );
                }
                println!(
                    "check the provider console for orphaned desktops before retrying or terminating"
                );
            }
        }

        Command::Resume => {
            let resumed = service.engine().resume_incomplete().await?;
            println!("resumed monitoring for {} workspace(s)", resumed);
            if resumed > 0 {
                // Spawned monitors run on this runtime; stay alive until
                // everything settles or the poll budget lapses.
                let interval = config.monitor_policy().interval;
                let budget = interval * config.monitor_policy().max_polls;
                let started = std::time::Instant::now();
                while started.elapsed() < budget {
                    tokio::time::sleep(interval).await;
                    let in_flight = service.in_flight_workspaces().await?;
                    if in_flight.iter().all(|ws| ws.diagnostic.is_some()) {
                        break;
                    }
                }
            }
        }
    }

    Ok(())
}

async fn run_credential(
    cmd: CredentialCommand,
    json: bool,
    service: &WorkspaceService,
) -> Result<()> {
    match cmd {
        CredentialCommand::Add(args) => {
            let outcome = service
                .add_credential(NewCredential {
                    name: args.name,
                    provider: args.provider.into(),
                    access_key: args.access_key,
                    secret_key: args.secret_key,
                    region: args.region,
                    directory_id: args.directory_id,
                    tenant_id: args.tenant_id,
                    subscription_id: args.subscription_id,
                    resource_group: args.resource_group,
                })
                .await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome.credential)?);
            } else {
                println!(
                    "stored credential {} ({})",
                    outcome.credential.id, outcome.credential.name
                );
            }
            if let Some(problem) = outcome.problem {
                eprintln!("warning: validation failed: {}", problem);
            }
        }

        CredentialCommand::List => {
            let credentials = service.list_credentials().await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&credentials)?);
            } else {
                for cred in &credentials {
                    println!(
                        "{}  {:<20}  {:<6}  {}  valid={}",
                        cred.id, cred.name, cred.provider, cred.access_key_masked, cred.valid
                    );
                }
            }
        }

        CredentialCommand::Check { id } => {
            let outcome = service.verify_credential(&id).await?;
            match outcome.problem {
                None => println!("credential {} is valid", id),
                Some(problem) => {
                    eprintln!("credential {} failed validation: {}", id, problem);
                    std::process::exit(1);
                }
            }
        }

        CredentialCommand::Remove { id } => {
            service.delete_credential(&id).await?;
            println!("deleted credential {}", id);
        }
    }

    Ok(())
}

/// Poll the stored row until background provisioning settles, then return
/// it. The provisioning task runs on this process's runtime, so exiting
/// before it finishes would abort it; a monitoring timeout shows up as a
/// diagnostic on a still-PENDING row and also ends the wait.
async fn watch_until_settled(
    service: &WorkspaceService,
    config: &Config,
    id: &str,
) -> Result<Workspace> {
    let retry = config.retry_policy();
    let monitor = config.monitor_policy();
    let mut budget =
        monitor.interval * monitor.max_polls + std::time::Duration::from_secs(60);
    for attempt in 1..=retry.max_retries {
        budget += retry.delay(attempt);
    }

    let started = std::time::Instant::now();
    loop {
        let workspace = service.get_workspace(id).await?;
        if !workspace.state.is_in_flight()
            || workspace.diagnostic.is_some()
            || started.elapsed() > budget
        {
            return Ok(workspace);
        }
        tokio::time::sleep(std::time::Duration::from_secs(2)).await;
    }
}

fn requester(flag: Option<String>) -> Result<String> {
    if let Some(requester) = flag {
        return Ok(requester);
    }
    std::env::var("USER").context("--requester not given and $USER is unset")
}

fn parse_state(raw: &str) -> Result<WorkspaceState> {
    let state = match raw.to_uppercase().as_str() {
        "PENDING" => WorkspaceState::Pending,
        "AVAILABLE" => WorkspaceState::Available,
        "STARTING" => WorkspaceState::Starting,
        "STOPPING" => WorkspaceState::Stopping,
        "STOPPED" => WorkspaceState::Stopped,
        "REBOOTING" => WorkspaceState::Rebooting,
        "TERMINATED" => WorkspaceState::Terminated,
        "ERROR" => WorkspaceState::Error,
        other => anyhow::bail!("unknown state '{}'", other),
    };
    Ok(state)
}

fn print_workspace(workspace: &Workspace, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(workspace)?);
        return Ok(());
    }

    println!("id:        {}", workspace.id);
    println!("state:     {}", workspace.state);
    println!("provider:  {}", workspace.provider);
    println!("user:      {}", workspace.username);
    println!("bundle:    {}", workspace.bundle_id);
    if let Some(handle) = &workspace.provider_handle {
        println!("handle:    {}", handle);
    }
    if let Some(connection) = &workspace.connection_string {
        println!("connect:   {}", connection);
    }
    if let Some(ip) = &workspace.ip_address {
        println!("ip:        {}", ip);
    }
    if let Some(name) = &workspace.computer_name {
        println!("computer:  {}", name);
    }
    if let Some(diagnostic) = &workspace.diagnostic {
        println!("note:      {}", diagnostic);
    }
    Ok(())
}
