//! PostgreSQL instance manager
//!
//! Provisions new instances (`init`), repopulates data directories from
//! a remote backup (`restore`) and ships WAL segments for the instances it
//! created (`wal-archive`) inside a cluster pod.

// instancemanager/src/main.rs
mod archive;
mod bootstrap;
mod cluster;
mod config;
mod errors;
mod instance;
mod restore;
mod sidecar;
mod utils;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::process::ExitCode;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use archive::BarmanCloudWalArchive;
use bootstrap::provisioner::InitdbProvisioner;
use bootstrap::{BootstrapOrchestrator, BootstrapRequest};
use cluster::{ClusterGate, KubernetesClusterGate, NoopGate};
use config::{
    AppConfig, ClusterGateConfig, SidecarConfig, load_binaries_from_json,
    load_restore_config_from_json, load_wal_archive_config_from_json,
};
use errors::{AppError, RestoreError};
use instance::PostgresRunner;
use restore::barman::BarmanCloudRestore;
use restore::{RestoreOrchestrator, RestoreRequest};
use sidecar::{HttpSidecarNotifier, NoopNotifier, notify_best_effort};

#[derive(Parser, Debug)]
#[command(name = "manager")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Path to the JSON configuration file
    #[arg(long = "config", value_name = "FILE", env = "MANAGER_CONFIG", global = true)]
    config: Option<PathBuf>,

    /// Log filter: trace, debug, info, warn, error (RUST_LOG takes precedence)
    #[arg(
        long = "log-level",
        value_name = "LEVEL",
        env = "MANAGER_LOG_LEVEL",
        default_value = "info",
        global = true
    )]
    log_level: String,

    #[arg(long = "log-format", value_enum, default_value_t = LogFormat::Text, global = true)]
    log_format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Bootstrap a new PostgreSQL instance
    Init(InitArgs),
    /// Restore a PostgreSQL data directory from a remote backup
    Restore(RestoreArgs),
    /// Archive one WAL segment, as run by PostgreSQL's archive_command
    WalArchive(WalArchiveArgs),
}

#[derive(clap::Args, Debug)]
struct InitArgs {
    /// The PGDATA to be created
    #[arg(long = "pg-data", env = "PGDATA")]
    pg_data: PathBuf,

    /// The file containing the superuser password
    #[arg(long = "pw-file", env = "SUPERUSER_PASSWORD_FILE")]
    pw_file: PathBuf,

    /// The name of the application database
    #[arg(long = "app-db-name", env = "APP_DATABASE", default_value = "app")]
    app_db_name: String,

    /// The name of the application user
    #[arg(long = "app-user", env = "APP_USER", default_value = "app")]
    app_user: String,

    /// The file containing the application user's password
    #[arg(long = "app-pwfile", env = "APP_PASSWORD_FILE")]
    app_pwfile: PathBuf,

    /// Rules appended to pg_hba.conf
    #[arg(long = "hba-rules-file", env = "HBA_RULES_FILE")]
    hba_rules_file: Option<PathBuf>,

    /// Settings appended to postgresql.conf
    #[arg(long = "postgresql-config-file", env = "POSTGRESQL_CONFIG_FILE")]
    postgresql_config_file: Option<PathBuf>,

    /// Host of the instance this one replicates from
    #[arg(long = "parent-node", env = "PARENT_NODE")]
    parent_node: String,

    #[arg(long = "cluster-name", env = "CLUSTER_NAME")]
    cluster_name: String,

    #[arg(long = "namespace", env = "NAMESPACE")]
    namespace: String,
}

#[derive(clap::Args, Debug)]
struct RestoreArgs {
    #[arg(long = "cluster-name", env = "CLUSTER_NAME")]
    cluster_name: String,

    #[arg(long = "namespace", env = "NAMESPACE")]
    namespace: String,

    /// The PGDATA to be restored
    #[arg(long = "pg-data", env = "PGDATA")]
    pg_data: PathBuf,

    /// Separate location for the WAL files
    #[arg(long = "pg-wal", env = "PGWAL")]
    pg_wal: Option<PathBuf>,
}

#[derive(clap::Args, Debug)]
struct WalArchiveArgs {
    /// Segment path as passed by PostgreSQL (%p), relative to PGDATA
    wal_path: PathBuf,

    #[arg(long = "cluster-name", env = "CLUSTER_NAME")]
    cluster_name: Option<String>,
}

/// Main entry point for the instance manager
#[tokio::main]
async fn main() -> ExitCode {
    // .env values only fill in what the environment doesn't already set
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level, cli.log_format);

    match run_app(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Command failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json())
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer())
                .init();
        }
    }
}

async fn run_app(cli: Cli) -> Result<()> {
    let app_config = AppConfig::load(cli.config.as_deref())
        .context("Failed to load application configuration")?;

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    match cli.command {
        Commands::Init(args) => run_init(&app_config, args, cancel).await?,
        Commands::Restore(args) => run_restore(&app_config, args, cancel).await?,
        // Runs once per segment inside the instance: no gate, no sidecars.
        Commands::WalArchive(args) => return run_wal_archive(&app_config, args, cancel).await,
    }

    notify_sidecars(&app_config.sidecars).await;
    Ok(())
}

async fn run_init(app_config: &AppConfig, args: InitArgs, cancel: CancellationToken) -> Result<()> {
    wait_for_cluster(&app_config.cluster_gate, &args.cluster_name, &args.namespace, &cancel)
        .await
        .context("Cluster resource never became observable")?;

    let binaries = load_binaries_from_json(&app_config.raw_json_config)
        .context("Failed to locate PostgreSQL binaries")?;

    let request = BootstrapRequest {
        data_directory: args.pg_data,
        superuser_password_file: args.pw_file.clone(),
        application_password_file: args.app_pwfile,
        application_database: args.app_db_name,
        application_user: args.app_user,
        access_rules_file: non_empty(args.hba_rules_file),
        extra_config_file: non_empty(args.postgresql_config_file),
        upstream_host: args.parent_node,
        cluster_name: args.cluster_name,
    };
    info!(
        pgdata = %request.data_directory.display(),
        cluster = %request.cluster_name,
        "Starting bootstrap"
    );

    let provisioner = InitdbProvisioner::new(
        binaries.initdb.clone(),
        app_config.archive_executable.clone(),
    );
    let runner = PostgresRunner::new(
        binaries,
        app_config.instance.clone(),
        args.pw_file,
        cancel.clone(),
    );

    BootstrapOrchestrator::new(provisioner, runner, cancel)
        .bootstrap(&request)
        .await
        .context("Bootstrap process failed")?;

    info!("Bootstrap completed");
    Ok(())
}

async fn run_restore(
    app_config: &AppConfig,
    args: RestoreArgs,
    cancel: CancellationToken,
) -> Result<()> {
    wait_for_cluster(&app_config.cluster_gate, &args.cluster_name, &args.namespace, &cancel)
        .await
        .context("Cluster resource never became observable")?;

    let restore_config = load_restore_config_from_json(&app_config.raw_json_config)
        .map_err(|e| AppError::from(RestoreError::MissingSource(format!("{:#}", e))))?;

    let request = RestoreRequest {
        data_directory: args.pg_data,
        wal_directory: non_empty(args.pg_wal),
        cluster_name: args.cluster_name,
        namespace: args.namespace,
    };

    RestoreOrchestrator::new(BarmanCloudRestore::new(restore_config), cancel)
        .restore(&request)
        .await
        .context("Restore process failed")?;
    Ok(())
}

async fn run_wal_archive(
    app_config: &AppConfig,
    args: WalArchiveArgs,
    cancel: CancellationToken,
) -> Result<()> {
    let archive_config = load_wal_archive_config_from_json(&app_config.raw_json_config)
        .context("Failed to load WAL archive configuration from JSON")?;

    BarmanCloudWalArchive::new(archive_config)
        .archive(&args.wal_path, args.cluster_name.as_deref(), &cancel)
        .await
        .with_context(|| format!("Failed to archive {}", args.wal_path.display()))?;
    Ok(())
}

async fn wait_for_cluster(
    config: &ClusterGateConfig,
    name: &str,
    namespace: &str,
    cancel: &CancellationToken,
) -> Result<(), AppError> {
    if config.enabled {
        KubernetesClusterGate::new(config.clone())?
            .wait_for_cluster(name, namespace, cancel)
            .await
    } else {
        NoopGate.wait_for_cluster(name, namespace, cancel).await
    }
}

async fn notify_sidecars(config: &SidecarConfig) {
    if config.istio_quit_url.is_none() && config.linkerd_shutdown_url.is_none() {
        notify_best_effort(&NoopNotifier).await;
        return;
    }
    match HttpSidecarNotifier::new(config) {
        Ok(notifier) => notify_best_effort(&notifier).await,
        Err(e) => warn!(error = %e, "Sidecar notification skipped"),
    }
}

// An empty environment variable reaches clap as an empty path.
fn non_empty(path: Option<PathBuf>) -> Option<PathBuf> {
    path.filter(|p| !p.as_os_str().is_empty())
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        warn!("Shutdown signal received, cancelling the running command");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    match signal(SignalKind::terminate()) {
        Ok(mut terminate) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = terminate.recv() => {}
            }
        }
        Err(e) => {
            warn!(error = %e, "Cannot listen for SIGTERM, only SIGINT cancels");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
