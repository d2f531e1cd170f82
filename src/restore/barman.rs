// instancemanager/src/restore/barman.rs
use std::ffi::OsString;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::RestoreRequest;
use crate::config::BarmanRestoreConfig;
use crate::errors::{Classification, RestoreError};
use crate::utils::process::run_captured;

/// Pulls a base backup from remote storage into the target directory.
pub trait RemoteRestore {
    async fn restore(
        &self,
        request: &RestoreRequest,
        cancel: &CancellationToken,
    ) -> Result<(), RestoreError>;
}

impl<C: RemoteRestore> RemoteRestore for &C {
    async fn restore(
        &self,
        request: &RestoreRequest,
        cancel: &CancellationToken,
    ) -> Result<(), RestoreError> {
        (**self).restore(request, cancel).await
    }
}

/// Maps `barman-cloud-restore` exit codes onto the cleanup policy.
///
/// 2 is a failed connection to the cloud provider, worth another attempt.
/// 1 (restore failed) and 3 (bad arguments) won't improve on retry.
/// Anything else, including death by signal, is unknown territory.
pub fn classify_exit_code(exit_code: Option<i32>) -> Classification {
    match exit_code {
        Some(2) => Classification::Retriable,
        Some(1) | Some(3) => Classification::Terminal,
        _ => Classification::Unclassified,
    }
}

/// [`RemoteRestore`] backed by the `barman-cloud-restore` program.
pub struct BarmanCloudRestore {
    config: BarmanRestoreConfig,
}

impl BarmanCloudRestore {
    pub fn new(config: BarmanRestoreConfig) -> Self {
        Self { config }
    }

    pub fn arguments(&self, request: &RestoreRequest) -> Vec<OsString> {
        let mut arguments: Vec<OsString> = Vec::new();
        if let Some(endpoint) = &self.config.endpoint_url {
            arguments.push("--endpoint-url".into());
            arguments.push(endpoint.into());
        }
        if let Some(provider) = &self.config.cloud_provider {
            arguments.push("--cloud-provider".into());
            arguments.push(provider.into());
        }
        let server_name = self
            .config
            .server_name
            .clone()
            .unwrap_or_else(|| request.cluster_name.clone());

        arguments.push(self.config.destination_path.clone().into());
        arguments.push(server_name.into());
        arguments.push(self.config.backup_id.clone().into());
        arguments.push(request.data_directory.clone().into_os_string());
        arguments
    }
}

impl RemoteRestore for BarmanCloudRestore {
    async fn restore(
        &self,
        request: &RestoreRequest,
        cancel: &CancellationToken,
    ) -> Result<(), RestoreError> {
        info!(
            cluster = %request.cluster_name,
            namespace = %request.namespace,
            source = %self.config.destination_path,
            backup_id = %self.config.backup_id,
            "Restoring base backup"
        );

        let mut command = Command::new(&self.config.program);
        command.args(self.arguments(request));

        let captured = run_captured(command, cancel).await?;
        if captured.success() {
            return Ok(());
        }

        let exit_code = captured.status.code();
        error!(exit_code = ?exit_code, output = %captured.output, "barman-cloud-restore failed");
        Err(RestoreError::CloudRestore {
            exit_code,
            classification: classify_exit_code(exit_code),
            output: captured.output,
        })
    }
}
