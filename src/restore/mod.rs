pub(crate) mod barman;
pub(crate) mod target;

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::errors::{AppError, Classification, Result, classify};
use barman::RemoteRestore;

/// Identifies the instance to repopulate and the backup source to pull
/// from. Built once per invocation.
#[derive(Debug, Clone)]
pub struct RestoreRequest {
    pub data_directory: PathBuf,
    pub wal_directory: Option<PathBuf>,
    pub cluster_name: String,
    pub namespace: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    ValidatingTarget,
    Restoring,
    Completed,
    Failed,
}

impl fmt::Display for RestoreState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreState::ValidatingTarget => write!(f, "validating-target"),
            RestoreState::Restoring => write!(f, "restoring"),
            RestoreState::Completed => write!(f, "completed"),
            RestoreState::Failed => write!(f, "failed"),
        }
    }
}

/// Drives one restore attempt. Never retries: a retriable failure cleans the
/// target so that whoever re-runs the command starts from scratch.
pub struct RestoreOrchestrator<C> {
    collaborator: C,
    cancel: CancellationToken,
}

impl<C: RemoteRestore> RestoreOrchestrator<C> {
    pub fn new(collaborator: C, cancel: CancellationToken) -> Self {
        Self {
            collaborator,
            cancel,
        }
    }

    pub async fn restore(&self, request: &RestoreRequest) -> Result<()> {
        info!(state = %RestoreState::ValidatingTarget, pgdata = %request.data_directory.display());
        target::prepare_target_directory(&request.data_directory)?;
        if let Some(wal_directory) = &request.wal_directory {
            target::prepare_target_directory(wal_directory)?;
        }

        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled("restoring the backup"));
        }

        info!(state = %RestoreState::Restoring, cluster = %request.cluster_name);
        if let Err(restore_error) = self.collaborator.restore(request, &self.cancel).await {
            let error = AppError::from(restore_error);
            error!(
                state = %RestoreState::Failed,
                classification = %classify(&error),
                error = %error,
                "Error while restoring a backup"
            );
            cleanup_data_directory_if_needed(&error, &request.data_directory);
            return Err(error);
        }

        if let Some(wal_directory) = &request.wal_directory {
            if self.cancel.is_cancelled() {
                return Err(AppError::Cancelled("linking the WAL directory"));
            }
            target::link_wal_directory(&request.data_directory, wal_directory).map_err(|e| {
                error!(state = %RestoreState::Failed, error = %e, "Error while linking the WAL directory");
                AppError::io(
                    format!("moving pg_wal to {}", wal_directory.display()),
                    e,
                )
            })?;
        }

        info!(state = %RestoreState::Completed, "restore command execution completed without errors");
        Ok(())
    }
}

/// Removes the data directory after a retriable failure. Returns whether the
/// directory is gone; every other failure kind leaves it for inspection.
pub fn cleanup_data_directory_if_needed(error: &AppError, data_directory: &Path) -> bool {
    if classify(error) != Classification::Retriable {
        return false;
    }

    info!(directory = %data_directory.display(), "Cleaning up data directory");
    match fs::remove_dir_all(data_directory) {
        Ok(()) => true,
        Err(e) if e.kind() == io::ErrorKind::NotFound => true,
        Err(e) => {
            error!(
                directory = %data_directory.display(),
                error = %e,
                "error occurred cleaning up data directory"
            );
            false
        }
    }
}
