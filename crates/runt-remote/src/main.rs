//! runt-remote CLI entry point.
//!
//! A terminal host for the remote-kernel library: list what a cluster
//! offers, launch a remote kernel into a notebook on disk, and keep the
//! local kernels directory mirrored from the control plane.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use log::info;
use serde::Serialize;
use tabled::{settings::Style, Table, Tabled};
use tokio::sync::Notify;

use remote_kernel::attach::SessionAttacher;
use remote_kernel::client::{HttpKernelSpecClient, KernelSpecClient};
use remote_kernel::commands::{CommandContext, RemoteKernelCommands, CHOOSE};
use remote_kernel::coordinator::{CancelHandle, LaunchCoordinator, LaunchError, LaunchTarget};
use remote_kernel::launch::{LaunchRequest, ResourceMap};
use remote_kernel::mirror::KernelspecMirror;
use remote_kernel::notebook_file::IpynbWorkspace;
use remote_kernel::registry::{KernelSpecRegistry, LocalKernelSpecRegistry};
use remote_kernel::settings::{load_settings, RemoteKernelSettings};
use remote_kernel::sync::{SpecSynchronizer, SyncPolicy};

mod prompt;

use crate::prompt::TerminalPrompt;

/// Launch remote Jupyter kernels and attach notebooks to them
#[derive(Parser, Debug)]
#[command(name = "runt-remote")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Log level
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    /// Control plane URL (default: settings.json, then RUNT_REMOTE_GATEWAY_URL)
    #[arg(long, global = true)]
    gateway_url: Option<String>,

    /// Kernels directory to mirror into and read from
    #[arg(long, global = true)]
    kernels_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List the clusters offered to a user
    Offerings {
        /// User to list for (default: configured username)
        #[arg(long)]
        user: Option<String>,
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
    /// Create a remote kernel and attach a notebook to it
    Launch(LaunchArgs),
    /// Pick a cluster and settings interactively, then launch
    Choose {
        /// Notebook to offer as the current session
        #[arg(long)]
        notebook: Option<PathBuf>,
        /// Directory for new notebooks (default: current directory)
        #[arg(long)]
        dir: Option<PathBuf>,
    },
    /// Mirror remote kernelspecs into the kernels directory
    Mirror {
        /// Run a single pass and exit
        #[arg(long)]
        once: bool,
        /// Seconds between passes (default: settings.json)
        #[arg(long)]
        interval: Option<u64>,
    },
    /// List kernelspecs in the kernels directory
    Kernelspecs {
        /// Output in JSON format
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args, Debug)]
struct LaunchArgs {
    /// Cluster to launch on (default: settings default_cluster, else the first offered)
    #[arg(long)]
    cluster: Option<String>,
    /// Working directory on the cluster
    #[arg(long)]
    workdir: Option<String>,
    /// Executable path on the cluster
    #[arg(long)]
    exec_path: Option<String>,
    /// Scripts to run before the kernel starts
    #[arg(long)]
    user_scripts: Option<String>,
    /// Override a resource value, e.g. --resource time=02:00:00
    #[arg(long = "resource", value_name = "KEY=VALUE", value_parser = parse_resource)]
    resources: Vec<(String, String)>,
    /// Switch this existing notebook to the new kernel
    #[arg(long, conflicts_with = "new")]
    notebook: Option<PathBuf>,
    /// Create a new notebook in this directory (or at this .ipynb path)
    #[arg(long)]
    new: Option<PathBuf>,
    /// Registry refresh attempts before giving up
    #[arg(long)]
    attempts: Option<u32>,
    /// Delay between refresh attempts in milliseconds
    #[arg(long)]
    delay_ms: Option<u64>,
}

fn parse_resource(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {s:?}")),
    }
}

/// Everything a launch needs, wired from settings.
struct Host {
    settings: RemoteKernelSettings,
    workspace: Arc<IpynbWorkspace>,
    coordinator: LaunchCoordinator,
}

impl Host {
    fn new(settings: RemoteKernelSettings) -> Result<Self> {
        let client = HttpKernelSpecClient::from_settings(&settings)?;
        let kernels_dir = settings.kernels_dir();
        let mirror = Arc::new(KernelspecMirror::new(
            client.clone(),
            settings.username(),
            kernels_dir.clone(),
        ));
        let registry =
            Arc::new(LocalKernelSpecRegistry::new(vec![kernels_dir]).with_mirror(mirror));
        let workspace = Arc::new(IpynbWorkspace::new(registry.clone()));
        let synchronizer =
            SpecSynchronizer::new(registry.clone(), SyncPolicy::from(&settings.sync));
        let coordinator = LaunchCoordinator::new(
            Arc::new(client),
            synchronizer,
            SessionAttacher::new(workspace.clone()),
        );
        Ok(Self {
            settings,
            workspace,
            coordinator,
        })
    }
}

#[derive(Tabled)]
struct OfferingRow {
    #[tabled(rename = "CLUSTER")]
    cluster: String,
    #[tabled(rename = "WORKDIR")]
    workdir: String,
    #[tabled(rename = "RESOURCES")]
    resources: String,
}

#[derive(Serialize)]
struct KernelspecInfo {
    name: String,
    display_name: String,
    remote: bool,
    cluster: Option<String>,
    resource_dir: Option<PathBuf>,
}

#[derive(Tabled)]
struct KernelspecRow {
    #[tabled(rename = "NAME")]
    name: String,
    #[tabled(rename = "DISPLAY NAME")]
    display_name: String,
    #[tabled(rename = "CLUSTER")]
    cluster: String,
    #[tabled(rename = "PATH")]
    path: String,
}

impl From<&KernelspecInfo> for KernelspecRow {
    fn from(info: &KernelspecInfo) -> Self {
        KernelspecRow {
            name: info.name.clone(),
            display_name: info.display_name.clone(),
            cluster: info.cluster.clone().unwrap_or_else(|| "-".to_string()),
            path: info
                .resource_dir
                .as_deref()
                .map(shorten_path)
                .unwrap_or_else(|| "-".to_string()),
        }
    }
}

/// Shorten a path for display by replacing home directory with ~
fn shorten_path(path: &std::path::Path) -> String {
    if let Some(home) = dirs::home_dir() {
        if let Ok(relative) = path.strip_prefix(&home) {
            return format!("~/{}", relative.display());
        }
    }
    path.display().to_string()
}

fn format_resources(resources: &ResourceMap) -> String {
    if resources.is_empty() {
        return "-".to_string();
    }
    resources
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Cancel `cancel` on the first Ctrl-C.
fn cancel_on_ctrl_c(cancel: CancelHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("Cancelling launch...");
            cancel.cancel();
        }
    });
}

/// Turn a failed launch into a process error naming its kind.
fn launch_failed(err: LaunchError) -> anyhow::Error {
    match err.kind() {
        Some(kind) if err.is_retryable() => {
            anyhow::anyhow!("{kind}: {err}\nThe kernel spec may still appear; retry the launch.")
        }
        Some(kind) => anyhow::anyhow!("{kind}: {err}"),
        None => anyhow::anyhow!("{err}"),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(&cli.log_level))
        .init();

    let mut settings = load_settings();
    if let Some(url) = cli.gateway_url {
        settings.gateway_url = url;
    }
    if let Some(dir) = cli.kernels_dir {
        settings.kernels_dir = Some(dir);
    }

    match cli.command {
        Commands::Offerings { user, json } => list_offerings(settings, user, json).await,
        Commands::Launch(args) => launch(settings, args).await,
        Commands::Choose { notebook, dir } => choose(settings, notebook, dir).await,
        Commands::Mirror { once, interval } => mirror(settings, once, interval).await,
        Commands::Kernelspecs { json } => list_kernelspecs(settings, json).await,
    }
}

async fn list_offerings(
    settings: RemoteKernelSettings,
    user: Option<String>,
    json_output: bool,
) -> Result<()> {
    let client = HttpKernelSpecClient::from_settings(&settings)?;
    let user = user.unwrap_or_else(|| settings.username());
    let offerings = client.list_offerings(&user).await?;

    let requests: Vec<LaunchRequest> = offerings
        .clusters()
        .filter_map(|cluster| offerings.default_request(cluster))
        .collect();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&requests)?);
        return Ok(());
    }

    if requests.is_empty() {
        println!("No clusters offered to {user}");
        return Ok(());
    }

    let rows: Vec<OfferingRow> = requests
        .iter()
        .map(|r| OfferingRow {
            cluster: r.cluster.clone(),
            workdir: r.workdir.clone(),
            resources: format_resources(&r.resources),
        })
        .collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{table}");
    Ok(())
}

async fn launch(mut settings: RemoteKernelSettings, args: LaunchArgs) -> Result<()> {
    if let Some(attempts) = args.attempts {
        settings.sync.max_attempts = attempts;
    }
    if let Some(delay_ms) = args.delay_ms {
        settings.sync.delay_ms = delay_ms;
    }
    let host = Host::new(settings)?;
    let user = host.settings.username();

    let cancel = CancelHandle::new();
    cancel_on_ctrl_c(cancel.clone());
    let mut launch = host.coordinator.begin(cancel);
    let offerings = launch.open(&user).await.map_err(launch_failed)?;

    let cluster = match args.cluster {
        Some(cluster) => cluster,
        None => match offerings.preferred_cluster(&host.settings.default_cluster) {
            Some(cluster) => cluster.to_string(),
            None => bail!("No clusters are offered to {user}"),
        },
    };
    // An unknown cluster still goes through submit so it is reported as rejected
    let mut request = offerings
        .default_request(&cluster)
        .unwrap_or_else(|| LaunchRequest {
            cluster: cluster.clone(),
            workdir: String::new(),
            exec_path: String::new(),
            user_scripts: String::new(),
            resources: ResourceMap::default(),
        });
    if let Some(workdir) = args.workdir {
        request.workdir = workdir;
    }
    if let Some(exec_path) = args.exec_path {
        request.exec_path = exec_path;
    }
    if let Some(user_scripts) = args.user_scripts {
        request.user_scripts = user_scripts;
    }
    for (key, value) in args.resources {
        request
            .set_resource(&key, value)
            .with_context(|| format!("Cluster {cluster} has no resource {key:?}"))?;
    }

    let target = match (args.notebook, args.new) {
        (Some(notebook), _) => {
            LaunchTarget::ExistingSession(Arc::new(host.workspace.session(notebook)))
        }
        (None, Some(path_hint)) => LaunchTarget::NewDocument { path_hint },
        (None, None) => LaunchTarget::NewDocument {
            path_hint: std::env::current_dir()?,
        },
    };

    info!("Launching on {} (launch {})", request.cluster, launch.id());
    let outcome = launch
        .submit(request, target)
        .await
        .map_err(launch_failed)?;

    match outcome.document {
        Some(document) => println!(
            "Created {} with kernel {}",
            document.path.display(),
            outcome.spec_name
        ),
        None => println!("Attached kernel {}", outcome.spec_name),
    }
    Ok(())
}

async fn choose(
    settings: RemoteKernelSettings,
    notebook: Option<PathBuf>,
    dir: Option<PathBuf>,
) -> Result<()> {
    let host = Host::new(settings)?;
    let commands = RemoteKernelCommands::new(
        host.coordinator.clone(),
        Arc::new(TerminalPrompt {
            has_session: notebook.is_some(),
        }),
        host.settings.default_cluster.clone(),
    );

    let working_dir = match dir {
        Some(dir) => dir,
        None => std::env::current_dir()?,
    };
    let cancel = CancelHandle::new();
    cancel_on_ctrl_c(cancel.clone());
    let mut ctx = CommandContext::new(host.settings.username(), working_dir).with_cancel(cancel);
    if let Some(path) = notebook {
        ctx = ctx.with_session(Arc::new(host.workspace.session(path)));
    }

    match commands.execute(CHOOSE, ctx).await {
        Ok(Some(outcome)) => {
            match outcome.document {
                Some(document) => println!(
                    "Created {} with kernel {}",
                    document.path.display(),
                    outcome.spec_name
                ),
                None => println!("Attached kernel {}", outcome.spec_name),
            }
            Ok(())
        }
        Ok(None) => {
            println!("Launch dismissed");
            Ok(())
        }
        Err(e) => bail!("{}: {}", e.kind_label(), e),
    }
}

async fn mirror(settings: RemoteKernelSettings, once: bool, interval: Option<u64>) -> Result<()> {
    let client = HttpKernelSpecClient::from_settings(&settings)?;
    let mirror = KernelspecMirror::new(client, settings.username(), settings.kernels_dir());

    if once {
        let report = mirror.sync_once().await?;
        println!(
            "Mirrored {} kernelspec(s) to {} ({} written, {} unchanged, {} skipped)",
            report.written + report.unchanged,
            shorten_path(mirror.kernels_dir()),
            report.written,
            report.unchanged,
            report.skipped
        );
        return Ok(());
    }

    let interval = Duration::from_secs(interval.unwrap_or(settings.mirror_interval_secs).max(1));
    let shutdown = Arc::new(Notify::new());
    let signal = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal.notify_one();
        }
    });

    mirror.run(interval, shutdown).await;
    Ok(())
}

async fn list_kernelspecs(settings: RemoteKernelSettings, json_output: bool) -> Result<()> {
    let registry = LocalKernelSpecRegistry::new(vec![settings.kernels_dir()]);
    registry.refresh().await?;

    let infos: Vec<KernelspecInfo> = registry
        .list()
        .await?
        .into_values()
        .map(|d| KernelspecInfo {
            display_name: d.display_name().to_string(),
            remote: d.spec.is_remote(),
            cluster: d
                .spec
                .provisioner_config()
                .and_then(|c| c.extra.get("cluster"))
                .and_then(|v| v.as_str())
                .map(str::to_string),
            resource_dir: d.resource_dir.clone(),
            name: d.name,
        })
        .collect();

    if json_output {
        println!("{}", serde_json::to_string_pretty(&infos)?);
        return Ok(());
    }

    if infos.is_empty() {
        println!("No kernelspecs in {}", shorten_path(&settings.kernels_dir()));
        return Ok(());
    }

    let rows: Vec<KernelspecRow> = infos.iter().map(KernelspecRow::from).collect();
    let table = Table::new(rows).with(Style::rounded()).to_string();
    println!("{table}");
    Ok(())
}
