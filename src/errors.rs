use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// Precondition failures detected before anything is written to disk.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("superuser password file doesn't exist ({0})")]
    SuperuserPasswordFileMissing(PathBuf),

    #[error("application user's password file doesn't exist ({0})")]
    ApplicationPasswordFileMissing(PathBuf),

    #[error("data directory already exists ({0})")]
    DataDirectoryExists(PathBuf),

    #[error("hba rules file doesn't exist ({0})")]
    AccessRulesFileMissing(PathBuf),

    #[error("postgresql config file doesn't exist ({0})")]
    ExtraConfigFileMissing(PathBuf),

    #[error("the name of the application user is empty")]
    EmptyApplicationUser,

    #[error("the name of the application database is empty")]
    EmptyApplicationDatabase,

    #[error("target directory already contains a PostgreSQL instance ({0})")]
    TargetContainsInstance(PathBuf),

    #[error("target path exists but is not a directory ({0})")]
    TargetNotADirectory(PathBuf),

    #[error("cannot inspect {path}: {source}")]
    Inaccessible {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failures of the external-process runner itself, independent of the
/// program's exit status.
#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to launch {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed while waiting for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} was terminated because the command was cancelled")]
    Cancelled { program: String },
}

/// How the restore path should treat a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    /// The attempt may succeed against a clean target: remove the directory.
    Retriable,
    /// Retrying is pointless: keep the directory for inspection.
    Terminal,
    /// Unknown failure kind: keep the directory for inspection.
    Unclassified,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Retriable => write!(f, "retriable"),
            Classification::Terminal => write!(f, "terminal"),
            Classification::Unclassified => write!(f, "unclassified"),
        }
    }
}

/// Failures reported by the remote-restore collaborator.
#[derive(Error, Debug)]
pub enum RestoreError {
    #[error("cloud restore failed ({classification}, exit code {exit_code:?}): {output}")]
    CloudRestore {
        exit_code: Option<i32>,
        classification: Classification,
        output: String,
    },

    #[error("restore source is not configured: {0}")]
    MissingSource(String),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl RestoreError {
    pub fn classification(&self) -> Classification {
        match self {
            RestoreError::CloudRestore { classification, .. } => *classification,
            RestoreError::MissingSource(_) => Classification::Terminal,
            RestoreError::Process(_) => Classification::Unclassified,
        }
    }
}

#[derive(Error, Debug)]
pub enum AppError {
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("{context} ({status}): {output}")]
    Execution {
        context: String,
        status: String,
        output: String,
    },

    #[error("{stage}: {source}")]
    Configuration {
        stage: &'static str,
        #[source]
        source: sqlx::Error,
    },

    #[error("restore failed: {0}")]
    Restore(#[from] RestoreError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot detect PostgreSQL major version from {path}: {reason}")]
    Version { path: PathBuf, reason: String },

    #[error("an instance is already running against {0}")]
    InstanceBusy(PathBuf),

    #[error("PostgreSQL startup failed: {0}")]
    Startup(String),

    #[error("cluster resource not observable: {0}")]
    Gate(String),

    #[error("sidecar notification failed: {0}")]
    Sidecar(String),

    #[error("operation cancelled before {0}")]
    Cancelled(&'static str),

    #[error(transparent)]
    Process(#[from] ProcessError),
}

impl AppError {
    pub fn io(context: impl Into<String>, source: std::io::Error) -> Self {
        AppError::Io {
            context: context.into(),
            source,
        }
    }
}

/// Decides the cleanup policy for a failed restore. Only collaborator
/// failures carry a classification; every other kind stays non-destructive.
pub fn classify(error: &AppError) -> Classification {
    match error {
        AppError::Restore(restore_error) => restore_error.classification(),
        _ => Classification::Unclassified,
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_collaborator_errors_are_classified() {
        let retriable = AppError::Restore(RestoreError::CloudRestore {
            exit_code: Some(2),
            classification: Classification::Retriable,
            output: String::new(),
        });
        assert_eq!(classify(&retriable), Classification::Retriable);

        let io = AppError::io("reading", std::io::Error::other("boom"));
        assert_eq!(classify(&io), Classification::Unclassified);

        let validation = AppError::Validation(ValidationError::EmptyApplicationUser);
        assert_eq!(classify(&validation), Classification::Unclassified);
    }

    #[test]
    fn test_process_failures_during_restore_are_unclassified() {
        let error = AppError::Restore(RestoreError::Process(ProcessError::Cancelled {
            program: "barman-cloud-restore".to_string(),
        }));
        assert_eq!(classify(&error), Classification::Unclassified);
    }

    #[test]
    fn test_missing_source_is_terminal() {
        let error = RestoreError::MissingSource("restore.destination_path".to_string());
        assert_eq!(error.classification(), Classification::Terminal);
    }
}
