// instancemanager/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use which::which;

const DEFAULT_CONFIG_FILE: &str = "config.json";
const DEFAULT_MANAGER_EXECUTABLE: &str = "/controller/manager";
const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

// Structs for deserializing config.json
#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonBinariesConfig {
    pub bin_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonInstanceConfig {
    pub port: Option<u16>,
    pub startup_timeout_seconds: Option<u64>,
    pub stop_timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonArchiveConfig {
    pub manager_executable: Option<PathBuf>,
    pub program: Option<String>,
    pub destination_path: Option<String>,
    pub endpoint_url: Option<String>,
    pub server_name: Option<String>,
    pub cloud_provider: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonRestoreConfig {
    pub program: Option<String>,
    pub destination_path: Option<String>,
    pub endpoint_url: Option<String>,
    pub server_name: Option<String>,
    pub backup_id: Option<String>,
    pub cloud_provider: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonClusterGateConfig {
    pub enabled: Option<bool>,
    pub api_server: Option<String>,
    pub token_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
    pub api_group: Option<String>,
    pub api_version: Option<String>,
    pub resource: Option<String>,
    pub attempts: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct JsonSidecarConfig {
    pub istio_quit_url: Option<String>,
    pub linkerd_shutdown_url: Option<String>,
    pub timeout_seconds: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RawJsonConfig {
    pub binaries: Option<JsonBinariesConfig>,
    pub instance: Option<JsonInstanceConfig>,
    pub archive: Option<JsonArchiveConfig>,
    pub restore: Option<JsonRestoreConfig>,
    pub cluster_gate: Option<JsonClusterGateConfig>,
    pub sidecars: Option<JsonSidecarConfig>,
}

// Application's internal configuration structs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PgBinaries {
    pub initdb: PathBuf,
    pub postgres: PathBuf,
    pub pg_ctl: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub port: u16,
    pub startup_timeout: Duration,
    pub stop_timeout: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarmanRestoreConfig {
    pub program: String,
    pub destination_path: String,
    pub endpoint_url: Option<String>,
    pub server_name: Option<String>,
    pub backup_id: String,
    pub cloud_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BarmanArchiveConfig {
    pub program: String,
    pub destination_path: String,
    pub endpoint_url: Option<String>,
    pub server_name: Option<String>,
    pub cloud_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterGateConfig {
    pub enabled: bool,
    pub api_server: String,
    pub token_file: PathBuf,
    pub ca_file: PathBuf,
    pub api_group: String,
    pub api_version: String,
    pub resource: String,
    pub attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidecarConfig {
    pub istio_quit_url: Option<String>,
    pub linkerd_shutdown_url: Option<String>,
    pub timeout: Duration,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub instance: InstanceConfig,
    pub archive_executable: PathBuf,
    pub cluster_gate: ClusterGateConfig,
    pub sidecars: SidecarConfig,
    pub raw_json_config: RawJsonConfig, // Per-operation sections are resolved lazily
}

impl AppConfig {
    /// Loads the configuration from `config_path`, or from `config.json` in
    /// the working directory when no path is given and that file exists.
    /// Without any file every setting takes its default.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let raw_json_config = match config_path {
            Some(path) => read_raw_config(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    read_raw_config(default_path)?
                } else {
                    RawJsonConfig::default()
                }
            }
        };

        Ok(Self::from_raw(raw_json_config, |name| std::env::var(name).ok()))
    }

    /// Builds the configuration from an already parsed file. `env` resolves
    /// environment variables so the Kubernetes and sidecar discovery can be
    /// exercised without touching the process environment.
    pub fn from_raw(raw_json_config: RawJsonConfig, env: impl Fn(&str) -> Option<String>) -> Self {
        let instance_raw = raw_json_config.instance.clone().unwrap_or_default();
        let instance = InstanceConfig {
            port: instance_raw.port.unwrap_or(5432),
            startup_timeout: Duration::from_secs(instance_raw.startup_timeout_seconds.unwrap_or(60)),
            stop_timeout: Duration::from_secs(instance_raw.stop_timeout_seconds.unwrap_or(30)),
        };

        let archive_executable = raw_json_config
            .archive
            .as_ref()
            .and_then(|archive| archive.manager_executable.clone())
            .or_else(|| std::env::current_exe().ok())
            .unwrap_or_else(|| PathBuf::from(DEFAULT_MANAGER_EXECUTABLE));

        let gate_raw = raw_json_config.cluster_gate.clone().unwrap_or_default();
        let in_kubernetes = env("KUBERNETES_SERVICE_HOST").filter(|s| !s.is_empty());
        let default_api_server = match (&in_kubernetes, env("KUBERNETES_SERVICE_PORT")) {
            (Some(host), Some(port)) if !port.is_empty() => format!("https://{}:{}", host, port),
            (Some(host), _) => format!("https://{}", host),
            (None, _) => "https://kubernetes.default.svc".to_string(),
        };
        let cluster_gate = ClusterGateConfig {
            enabled: gate_raw.enabled.unwrap_or(in_kubernetes.is_some()),
            api_server: gate_raw.api_server.unwrap_or(default_api_server),
            token_file: gate_raw
                .token_file
                .unwrap_or_else(|| Path::new(SERVICE_ACCOUNT_DIR).join("token")),
            ca_file: gate_raw
                .ca_file
                .unwrap_or_else(|| Path::new(SERVICE_ACCOUNT_DIR).join("ca.crt")),
            api_group: gate_raw.api_group.unwrap_or_else(|| "postgresql.cnpg.io".to_string()),
            api_version: gate_raw.api_version.unwrap_or_else(|| "v1".to_string()),
            resource: gate_raw.resource.unwrap_or_else(|| "clusters".to_string()),
            attempts: gate_raw.attempts.unwrap_or(10).max(1),
            initial_backoff: Duration::from_millis(gate_raw.initial_backoff_ms.unwrap_or(500)),
            max_backoff: Duration::from_millis(gate_raw.max_backoff_ms.unwrap_or(10_000)),
        };

        let sidecar_raw = raw_json_config.sidecars.clone().unwrap_or_default();
        let sidecars = SidecarConfig {
            istio_quit_url: sidecar_raw
                .istio_quit_url
                .or_else(|| env("ISTIO_QUIT_API"))
                .filter(|s| !s.is_empty()),
            linkerd_shutdown_url: sidecar_raw
                .linkerd_shutdown_url
                .or_else(|| env("LINKERD_SHUTDOWN_API"))
                .filter(|s| !s.is_empty()),
            timeout: Duration::from_secs(sidecar_raw.timeout_seconds.unwrap_or(10)),
        };

        AppConfig {
            instance,
            archive_executable,
            cluster_gate,
            sidecars,
            raw_json_config,
        }
    }
}

fn read_raw_config(config_path: &Path) -> Result<RawJsonConfig> {
    let config_content = fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
    serde_json::from_str(&config_content).with_context(|| {
        format!(
            "Failed to parse JSON from config file at {}",
            config_path.display()
        )
    })
}

/// Resolves the PostgreSQL server binaries used by the bootstrap path,
/// either from `binaries.bin_dir` or from PATH.
pub fn load_binaries_from_json(raw_config: &RawJsonConfig) -> Result<PgBinaries> {
    let bin_dir = raw_config
        .binaries
        .as_ref()
        .and_then(|binaries| binaries.bin_dir.clone());

    let locate = |name: &str| -> Result<PathBuf> {
        match &bin_dir {
            Some(dir) => {
                let candidate = dir.join(name);
                if candidate.is_file() {
                    Ok(candidate)
                } else {
                    Err(anyhow::anyhow!(
                        "{} not found in binaries.bin_dir ({})",
                        name,
                        dir.display()
                    ))
                }
            }
            None => which(name).with_context(|| {
                format!(
                    "{} executable not found in PATH. Please ensure the PostgreSQL server binaries are installed or set binaries.bin_dir in config.json.",
                    name
                )
            }),
        }
    };

    Ok(PgBinaries {
        initdb: locate("initdb")?,
        postgres: locate("postgres")?,
        pg_ctl: locate("pg_ctl")?,
    })
}

pub fn load_restore_config_from_json(raw_config: &RawJsonConfig) -> Result<BarmanRestoreConfig> {
    let restore_raw = raw_config
        .restore
        .as_ref()
        .context("restore section must be set in config.json for restore")?;

    let destination_path = restore_raw
        .destination_path
        .as_ref()
        .context("restore.destination_path must be set in config.json for restore")?
        .clone();

    if destination_path.trim().is_empty() {
        return Err(anyhow::anyhow!(
            "restore.destination_path cannot be empty in config.json."
        ));
    }

    Ok(BarmanRestoreConfig {
        program: restore_raw
            .program
            .clone()
            .unwrap_or_else(|| "barman-cloud-restore".to_string()),
        destination_path,
        endpoint_url: restore_raw.endpoint_url.clone().filter(|s| !s.is_empty()),
        server_name: restore_raw.server_name.clone().filter(|s| !s.is_empty()),
        backup_id: restore_raw
            .backup_id
            .clone()
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "latest".to_string()),
        cloud_provider: restore_raw.cloud_provider.clone().filter(|s| !s.is_empty()),
    })
}

/// Resolves the object store WAL segments are shipped to. Settings missing
/// from the `archive` section are taken from `restore`, since both usually
/// point at the same barman server.
pub fn load_wal_archive_config_from_json(raw_config: &RawJsonConfig) -> Result<BarmanArchiveConfig> {
    let archive_raw = raw_config.archive.clone().unwrap_or_default();
    let restore_raw = raw_config.restore.clone().unwrap_or_default();
    let pick = |own: Option<String>, shared: Option<String>| -> Option<String> {
        own.filter(|s| !s.is_empty())
            .or_else(|| shared.filter(|s| !s.is_empty()))
    };

    let destination_path = pick(archive_raw.destination_path, restore_raw.destination_path)
        .filter(|s| !s.trim().is_empty())
        .context("archive.destination_path (or restore.destination_path) must be set in config.json for wal-archive")?;

    Ok(BarmanArchiveConfig {
        program: archive_raw
            .program
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| "barman-cloud-wal-archive".to_string()),
        destination_path,
        endpoint_url: pick(archive_raw.endpoint_url, restore_raw.endpoint_url),
        server_name: pick(archive_raw.server_name, restore_raw.server_name),
        cloud_provider: pick(archive_raw.cloud_provider, restore_raw.cloud_provider),
    })
}
