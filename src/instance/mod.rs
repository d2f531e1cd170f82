//! Transient PostgreSQL instances
//!
//! A transient instance is started against a data directory only to run a
//! bounded sequence of administrative statements, then stopped again. The
//! superuser session is lent to a callback and never escapes it.

pub(crate) mod runner;

use sqlx::PgConnection;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{LazyLock, Mutex, PoisonError};

use crate::errors::{AppError, Result};

pub use runner::PostgresRunner;

/// The piece of a database connection the provisioning statements need.
pub trait SqlSession {
    async fn execute(&mut self, statement: &str) -> std::result::Result<(), sqlx::Error>;
}

impl SqlSession for PgConnection {
    async fn execute(&mut self, statement: &str) -> std::result::Result<(), sqlx::Error> {
        // A plain &str without arguments goes through the simple query
        // protocol, which ALTER SYSTEM and CREATE DATABASE require.
        sqlx::Executor::execute(&mut *self, statement).await?;
        Ok(())
    }
}

/// Runs a callback against an instance that only lives for that callback.
pub trait InstanceRunner {
    type Session: SqlSession;

    async fn with_running_instance<T, F>(&self, data_directory: &Path, f: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut Self::Session) -> Result<T>;
}

impl<R: InstanceRunner> InstanceRunner for &R {
    type Session = R::Session;

    async fn with_running_instance<T, F>(&self, data_directory: &Path, f: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut Self::Session) -> Result<T>,
    {
        (**self).with_running_instance(data_directory, f).await
    }
}

/// How a transient instance is launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunningInstance {
    pub data_directory: PathBuf,
    pub listen_port: u16,
    pub startup_flags: Vec<String>,
}

impl RunningInstance {
    /// Loopback-only instance with its unix socket inside the data directory.
    pub fn transient(data_directory: &Path, listen_port: u16) -> Self {
        RunningInstance {
            data_directory: data_directory.to_path_buf(),
            listen_port,
            startup_flags: vec![
                "listen_addresses=127.0.0.1".to_string(),
                format!("port={}", listen_port),
                format!("unix_socket_directories={}", data_directory.display()),
            ],
        }
    }
}

/// Parses the content of a `PG_VERSION` file: "9.6" is 9, "13" is 13.
pub fn parse_major_version(content: &str) -> std::result::Result<u32, String> {
    let trimmed = content.trim();
    let major = trimmed.split('.').next().unwrap_or_default();
    major
        .parse::<u32>()
        .map_err(|_| format!("unexpected PG_VERSION content {:?}", trimmed))
}

pub fn detect_major_version(data_directory: &Path) -> Result<u32> {
    let path = data_directory.join("PG_VERSION");
    let content = fs::read_to_string(&path).map_err(|e| AppError::Version {
        path: path.clone(),
        reason: e.to_string(),
    })?;
    parse_major_version(&content).map_err(|reason| AppError::Version { path, reason })
}

static ACTIVE_DIRECTORIES: LazyLock<Mutex<HashSet<PathBuf>>> = LazyLock::new(Default::default);

/// Exclusive claim on a data directory for the lifetime of one transient
/// instance. Released on drop.
#[derive(Debug)]
pub struct DirectoryLock {
    path: PathBuf,
}

impl DirectoryLock {
    /// Fails immediately when this process already runs an instance on the
    /// directory, or when a postmaster lock file shows some other process does.
    pub fn acquire(data_directory: &Path) -> Result<Self> {
        let path = fs::canonicalize(data_directory).unwrap_or_else(|_| data_directory.to_path_buf());
        let mut active = ACTIVE_DIRECTORIES
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if active.contains(&path) || path.join("postmaster.pid").exists() {
            return Err(AppError::InstanceBusy(path));
        }
        active.insert(path.clone());
        Ok(DirectoryLock { path })
    }
}

impl Drop for DirectoryLock {
    fn drop(&mut self) {
        ACTIVE_DIRECTORIES
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.path);
    }
}
