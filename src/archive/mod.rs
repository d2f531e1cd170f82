// instancemanager/src/archive/mod.rs
use std::ffi::OsString;
use std::path::Path;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::BarmanArchiveConfig;
use crate::errors::{AppError, Result};
use crate::utils::process::run_captured;

/// Ships one completed WAL segment to the object store with
/// `barman-cloud-wal-archive`. This is what `archive_command` runs.
pub struct BarmanCloudWalArchive {
    config: BarmanArchiveConfig,
}

impl BarmanCloudWalArchive {
    pub fn new(config: BarmanArchiveConfig) -> Self {
        Self { config }
    }

    pub fn arguments(&self, wal_path: &Path, cluster_name: Option<&str>) -> Result<Vec<OsString>> {
        let server_name = self
            .config
            .server_name
            .as_deref()
            .or(cluster_name)
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AppError::Execution {
                context: "Error while archiving a WAL segment".to_string(),
                status: "not started".to_string(),
                output: "neither archive.server_name nor the cluster name is set".to_string(),
            })?;

        let mut arguments: Vec<OsString> = Vec::new();
        if let Some(endpoint) = &self.config.endpoint_url {
            arguments.push("--endpoint-url".into());
            arguments.push(endpoint.into());
        }
        if let Some(provider) = &self.config.cloud_provider {
            arguments.push("--cloud-provider".into());
            arguments.push(provider.into());
        }
        arguments.push(self.config.destination_path.clone().into());
        arguments.push(server_name.into());
        arguments.push(wal_path.as_os_str().to_os_string());
        Ok(arguments)
    }

    pub async fn archive(
        &self,
        wal_path: &Path,
        cluster_name: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut command = Command::new(&self.config.program);
        command.args(self.arguments(wal_path, cluster_name)?);

        let captured = run_captured(command, cancel).await?;
        if !captured.success() {
            error!(wal = %wal_path.display(), output = %captured.output, "barman-cloud-wal-archive failed");
            return Err(AppError::Execution {
                context: "Error while archiving a WAL segment".to_string(),
                status: captured.status.to_string(),
                output: captured.output,
            });
        }

        info!(wal = %wal_path.display(), "Archived WAL file");
        Ok(())
    }
}
