// instancemanager/src/bootstrap/provisioner.rs
use std::path::{Path, PathBuf};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use super::BootstrapRequest;
use crate::errors::{AppError, Result};
use crate::utils::process::run_captured;
use crate::utils::sql::quote_config_value;
use crate::utils::{append_file, append_string_to_file};

/// Subcommand of this executable that PostgreSQL invokes for every
/// completed WAL segment.
pub const WAL_ARCHIVE_SUBCOMMAND: &str = "wal-archive";

/// Creates the on-disk instance for a validated request.
pub trait DataDirectoryProvisioner {
    async fn create_data_directory(
        &self,
        request: &BootstrapRequest,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

impl<P: DataDirectoryProvisioner> DataDirectoryProvisioner for &P {
    async fn create_data_directory(
        &self,
        request: &BootstrapRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        (**self).create_data_directory(request, cancel).await
    }
}

/// Provisioner backed by the `initdb` program.
pub struct InitdbProvisioner {
    initdb: PathBuf,
    archive_executable: PathBuf,
}

impl InitdbProvisioner {
    pub fn new(initdb: PathBuf, archive_executable: PathBuf) -> Self {
        Self {
            initdb,
            archive_executable,
        }
    }

    async fn run_initdb(&self, request: &BootstrapRequest, cancel: &CancellationToken) -> Result<()> {
        let mut command = Command::new(&self.initdb);
        command
            .arg("--username")
            .arg("postgres")
            .arg("--pwfile")
            .arg(&request.superuser_password_file)
            .arg("-D")
            .arg(&request.data_directory);

        let captured = run_captured(command, cancel).await?;
        if !captured.success() {
            error!(output = %captured.output, "initdb output");
            return Err(AppError::Execution {
                context: "Error while creating the PostgreSQL instance".to_string(),
                status: captured.status.to_string(),
                output: captured.output,
            });
        }
        Ok(())
    }
}

impl DataDirectoryProvisioner for InitdbProvisioner {
    async fn create_data_directory(
        &self,
        request: &BootstrapRequest,
        cancel: &CancellationToken,
    ) -> Result<()> {
        info!(pgdata = %request.data_directory.display(), "Creating new data directory");

        self.run_initdb(request, cancel).await?;
        configure_data_directory(request, &self.archive_executable)
    }
}

/// The `postgresql.conf` lines every instance gets, whatever extra
/// configuration was supplied.
pub fn archive_stanza(archive_executable: &Path) -> String {
    let command = format!(
        "{} {} %p",
        archive_executable.display(),
        WAL_ARCHIVE_SUBCOMMAND
    );
    format!(
        "archive_mode = on\narchive_command = {}\n",
        quote_config_value(&command)
    )
}

/// Layers access rules and configuration onto a freshly initialised data
/// directory. Files are only ever appended to.
pub fn configure_data_directory(request: &BootstrapRequest, archive_executable: &Path) -> Result<()> {
    let hba_path = request.data_directory.join("pg_hba.conf");
    let conf_path = request.data_directory.join("postgresql.conf");

    if let Some(rules) = &request.access_rules_file {
        append_file(&hba_path, rules).map_err(|e| {
            AppError::io("appending to pg_hba.conf file resulted in an error", e)
        })?;
    }

    if let Some(extra) = &request.extra_config_file {
        append_file(&conf_path, extra).map_err(|e| {
            AppError::io("appending to postgresql.conf file resulted in an error", e)
        })?;
    }

    append_string_to_file(&conf_path, &archive_stanza(archive_executable))
        .map_err(|e| AppError::io("appending to postgresql.conf file resulted in an error", e))?;

    Ok(())
}
