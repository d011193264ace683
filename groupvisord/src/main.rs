use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use groupvisor_core::{GroupRegistry, GroupvisorConfig, SqliteStore, load_config};
use groupvisord::api::{AppState, router};
use groupvisord::channel::{Channel, channel_from_url};
use groupvisord::container::MountValidator;
use groupvisord::container::runner::{cleanup_orphans, ensure_runtime_available};
use groupvisord::{Orchestrator, OrchestratorContext};
use tracing::{info, warn};

const DEFAULT_CONFIG: &str = "config/groupvisor.toml";

#[derive(Parser, Debug)]
#[command(name = "groupvisord", version, about = "Sandboxed worker orchestrator for chat groups")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the orchestrator and its HTTP service.
    Serve(ServeArgs),
    /// Print effective config as JSON.
    PrintConfig(ConfigArgs),
    /// Check a registered group's extra mounts against the allowlist.
    ValidateMounts(ValidateMountsArgs),
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    #[arg(long)]
    bind: Option<String>,
}

#[derive(clap::Args, Debug)]
struct ConfigArgs {
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
}

#[derive(clap::Args, Debug)]
struct ValidateMountsArgs {
    #[arg(long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,
    /// Group folder to check.
    #[arg(long)]
    group: String,
    /// Judge as the main group even if the folder is not main.
    #[arg(long)]
    main: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let cli = Cli::parse();
    match cli.command.unwrap_or(Command::Serve(ServeArgs {
        config: PathBuf::from(DEFAULT_CONFIG),
        bind: None,
    })) {
        Command::Serve(args) => serve(args).await,
        Command::PrintConfig(args) => print_config(args),
        Command::ValidateMounts(args) => validate_mounts(args),
    }
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .init();
}

fn load(path: &Path) -> anyhow::Result<GroupvisorConfig> {
    load_config(path).with_context(|| format!("failed to load config from {}", path.display()))
}

fn open_store(config: &GroupvisorConfig) -> anyhow::Result<SqliteStore> {
    SqliteStore::open(&config.storage.database_path)
        .with_context(|| format!("failed to open database {}", config.storage.database_path))
}

async fn serve(args: ServeArgs) -> anyhow::Result<()> {
    let mut config = load(&args.config)?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }

    let bind = config.server.bind.clone();
    let enabled = config.orchestrator.enabled;
    let runtime_bin = config.container.runtime_bin.clone();

    let store = Arc::new(open_store(&config)?);
    let channel: Arc<dyn Channel> = Arc::from(channel_from_url(&config.server.host_callback_url));
    let validator = Arc::new(MountValidator::new(config.mounts.resolved_allowlist_path()));
    let ctx = OrchestratorContext::new(config, store, channel, validator);
    let orchestrator = Arc::new(Orchestrator::new(ctx));

    if enabled {
        ensure_runtime_available(&runtime_bin).await?;
        cleanup_orphans(&runtime_bin).await;
        orchestrator.start().await?;
    } else {
        info!("orchestrator disabled, serving HTTP only");
    }

    let app = router(AppState::new(orchestrator.clone()));
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind listener on {bind}"))?;

    info!(bind = %bind, "groupvisord listening");
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server exited unexpectedly");

    orchestrator.stop().await;
    served
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(err = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}

fn print_config(args: ConfigArgs) -> anyhow::Result<()> {
    let cfg = load(&args.config)?;
    println!("{}", serde_json::to_string_pretty(&cfg)?);
    Ok(())
}

fn validate_mounts(args: ValidateMountsArgs) -> anyhow::Result<()> {
    let config = load(&args.config)?;
    let store = open_store(&config)?;
    let group = store
        .get_all_groups()?
        .into_values()
        .find(|g| g.folder == args.group)
        .with_context(|| format!("no registered group with folder {:?}", args.group))?;
    let is_main = args.main || group.folder == config.orchestrator.main_group_folder;

    let validator = MountValidator::new(config.mounts.resolved_allowlist_path());
    println!(
        "allowlist: {} ({})",
        validator.allowlist_path().display(),
        if validator.allowlist().is_some() { "loaded" } else { "missing" }
    );

    let mounts = group
        .container_config
        .map(|c| c.additional_mounts)
        .unwrap_or_default();
    if mounts.is_empty() {
        println!("group {} requests no extra mounts", group.folder);
        return Ok(());
    }
    for mount in &mounts {
        match validator.validate(mount, is_main) {
            Ok(granted) => {
                let volume = granted.to_volume();
                println!(
                    "ok       {} -> {}{} (root {})",
                    granted.host_path,
                    volume.container_path,
                    if granted.readonly { " (ro)" } else { "" },
                    granted.granted_by
                );
            }
            Err(rejected) => println!("rejected {}: {rejected}", mount.host_path),
        }
    }
    Ok(())
}
