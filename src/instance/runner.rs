// instancemanager/src/instance/runner.rs
use sqlx::postgres::PgConnectOptions;
use sqlx::{Connection, PgConnection};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, Command};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{DirectoryLock, InstanceRunner, RunningInstance};
use crate::config::{InstanceConfig, PgBinaries};
use crate::errors::{AppError, Result};
use crate::utils::process::run_captured;
use crate::utils::read_secret_file;

const READINESS_POLL_INTERVAL: Duration = Duration::from_millis(250);
const SUPERUSER: &str = "postgres";

/// Starts the `postgres` binary as a child process for the duration of one
/// callback and stops it on every way out of that callback.
pub struct PostgresRunner {
    binaries: PgBinaries,
    config: InstanceConfig,
    superuser_password_file: PathBuf,
    cancel: CancellationToken,
}

impl PostgresRunner {
    pub fn new(
        binaries: PgBinaries,
        config: InstanceConfig,
        superuser_password_file: PathBuf,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            binaries,
            config,
            superuser_password_file,
            cancel,
        }
    }

    fn start(&self, instance: &RunningInstance, lock: DirectoryLock) -> Result<InstanceGuard> {
        info!(
            pgdata = %instance.data_directory.display(),
            port = instance.listen_port,
            "Starting transient PostgreSQL instance"
        );

        let mut command = Command::new(&self.binaries.postgres);
        command.arg("-D").arg(&instance.data_directory);
        for flag in &instance.startup_flags {
            command.arg("-c").arg(flag);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            AppError::Startup(format!(
                "cannot launch {}: {}",
                self.binaries.postgres.display(),
                e
            ))
        })?;

        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_server_log(stderr));
        }

        Ok(InstanceGuard {
            child: Some(child),
            data_directory: instance.data_directory.clone(),
            pg_ctl: self.binaries.pg_ctl.clone(),
            _lock: lock,
        })
    }

    /// Polls until the server accepts a superuser connection, the child
    /// exits, the startup timeout elapses or the command is cancelled.
    async fn connect_when_ready(
        &self,
        instance: &RunningInstance,
        guard: &mut InstanceGuard,
    ) -> Result<PgConnection> {
        let password = read_secret_file(&self.superuser_password_file).map_err(|e| {
            AppError::io(
                format!(
                    "reading the superuser password file {}",
                    self.superuser_password_file.display()
                ),
                e,
            )
        })?;
        let options = PgConnectOptions::new()
            .host("127.0.0.1")
            .port(instance.listen_port)
            .username(SUPERUSER)
            .password(&password)
            .database(SUPERUSER);

        let deadline = Instant::now() + self.config.startup_timeout;
        loop {
            if let Some(status) = guard.exit_status()? {
                return Err(AppError::Startup(format!(
                    "postgres exited with {} before accepting connections",
                    status
                )));
            }

            match PgConnection::connect_with(&options).await {
                Ok(connection) => {
                    info!(port = instance.listen_port, "Transient instance is accepting connections");
                    return Ok(connection);
                }
                Err(e) => debug!(error = %e, "instance not ready yet"),
            }

            if Instant::now() >= deadline {
                return Err(AppError::Startup(format!(
                    "instance did not accept connections within {}s",
                    self.config.startup_timeout.as_secs()
                )));
            }

            tokio::select! {
                _ = tokio::time::sleep(READINESS_POLL_INTERVAL) => {}
                _ = self.cancel.cancelled() => {
                    return Err(AppError::Cancelled("the transient instance accepted connections"));
                }
            }
        }
    }
}

impl InstanceRunner for PostgresRunner {
    type Session = PgConnection;

    async fn with_running_instance<T, F>(&self, data_directory: &Path, f: F) -> Result<T>
    where
        F: AsyncFnOnce(&mut Self::Session) -> Result<T>,
    {
        let instance = RunningInstance::transient(data_directory, self.config.port);
        let lock = DirectoryLock::acquire(data_directory)?;

        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled("starting the transient instance"));
        }

        // From here on the guard stops the server even if `f` panics.
        let mut guard = self.start(&instance, lock)?;

        let outcome = match self.connect_when_ready(&instance, &mut guard).await {
            Ok(mut connection) => {
                let outcome = tokio::select! {
                    outcome = f(&mut connection) => outcome,
                    _ = self.cancel.cancelled() => {
                        Err(AppError::Cancelled("the transient instance session completed"))
                    }
                };
                if let Err(e) = connection.close().await {
                    warn!(error = %e, "closing the superuser connection failed");
                }
                outcome
            }
            Err(startup_error) => Err(startup_error),
        };

        let stopped = guard.stop(self.config.stop_timeout).await;

        match (outcome, stopped) {
            (Ok(value), Ok(())) => Ok(value),
            (Ok(_), Err(stop_error)) => Err(stop_error),
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(stop_error)) => {
                error!(error = %stop_error, "stopping the transient instance failed");
                Err(e)
            }
        }
    }
}

async fn forward_server_log(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        info!(target: "postgres", "{}", line);
    }
}

/// Owns the server child process. Dropping a guard that wasn't stopped
/// performs an immediate shutdown.
struct InstanceGuard {
    child: Option<Child>,
    data_directory: PathBuf,
    pg_ctl: PathBuf,
    _lock: DirectoryLock,
}

impl InstanceGuard {
    fn exit_status(&mut self) -> Result<Option<std::process::ExitStatus>> {
        match self.child.as_mut() {
            Some(child) => child
                .try_wait()
                .map_err(|e| AppError::io("checking the postgres process", e)),
            None => Ok(None),
        }
    }

    fn pg_ctl_stop(&self, mode: &str, timeout: Duration) -> Command {
        let mut command = Command::new(&self.pg_ctl);
        command
            .arg("stop")
            .arg("-D")
            .arg(&self.data_directory)
            .arg("-m")
            .arg(mode)
            .arg("-w")
            .arg("-t")
            .arg(timeout.as_secs().max(1).to_string());
        command
    }

    /// Fast shutdown first; immediate shutdown and finally SIGKILL when the
    /// server doesn't go away within `timeout`.
    async fn stop(mut self, timeout: Duration) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            warn!(status = %status, "transient instance had already exited");
            return Ok(());
        }

        info!(pgdata = %self.data_directory.display(), "Stopping transient PostgreSQL instance");

        // Shutdown must go through even when the command was cancelled.
        let shutdown = CancellationToken::new();
        let fast = run_captured(self.pg_ctl_stop("fast", timeout), &shutdown).await;
        let stopped_gracefully = matches!(&fast, Ok(captured) if captured.success());

        if !stopped_gracefully {
            match &fast {
                Ok(captured) => warn!(output = %captured.output, "fast shutdown failed, forcing"),
                Err(e) => warn!(error = %e, "fast shutdown failed, forcing"),
            }
            if let Err(e) = run_captured(self.pg_ctl_stop("immediate", timeout), &shutdown).await {
                warn!(error = %e, "immediate shutdown failed");
            }
        }

        match tokio::time::timeout(timeout, child.wait()).await {
            Ok(Ok(status)) => {
                debug!(status = %status, "postgres exited");
                Ok(())
            }
            Ok(Err(e)) => Err(AppError::io("waiting for postgres to exit", e)),
            Err(_) => {
                error!("postgres still running after shutdown, killing it");
                child
                    .kill()
                    .await
                    .map_err(|e| AppError::io("killing postgres", e))
            }
        }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let Some(child) = self.child.as_mut() else {
            return;
        };

        warn!(
            pgdata = %self.data_directory.display(),
            "transient instance left without a clean stop, shutting it down"
        );
        let status = std::process::Command::new(&self.pg_ctl)
            .arg("stop")
            .arg("-D")
            .arg(&self.data_directory)
            .args(["-m", "immediate", "-w", "-t", "10"])
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status();
        if !matches!(status, Ok(s) if s.success()) {
            let _ = child.start_kill();
        }
    }
}
