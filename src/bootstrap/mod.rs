pub(crate) mod environment;
pub(crate) mod provisioner;
pub(crate) mod validation;

use std::path::PathBuf;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::errors::{AppError, Result};
use crate::instance::{InstanceRunner, detect_major_version};
use provisioner::DataDirectoryProvisioner;

/// Everything needed to create a new instance. Built once per invocation.
#[derive(Debug, Clone)]
pub struct BootstrapRequest {
    pub data_directory: PathBuf,
    pub superuser_password_file: PathBuf,
    pub application_password_file: PathBuf,
    pub application_database: String,
    pub application_user: String,
    pub access_rules_file: Option<PathBuf>,
    pub extra_config_file: Option<PathBuf>,
    pub upstream_host: String,
    pub cluster_name: String,
}

/// First PostgreSQL major version that keeps recovery settings in
/// `postgresql.auto.conf`.
const ALTER_SYSTEM_RECOVERY_VERSION: u32 = 12;

/// Validate, create the data directory, then configure it through a
/// transient instance. A failed bootstrap leaves the data directory in place
/// for diagnosis.
pub struct BootstrapOrchestrator<P, R> {
    provisioner: P,
    runner: R,
    cancel: CancellationToken,
}

impl<P: DataDirectoryProvisioner, R: InstanceRunner> BootstrapOrchestrator<P, R> {
    pub fn new(provisioner: P, runner: R, cancel: CancellationToken) -> Self {
        Self {
            provisioner,
            runner,
            cancel,
        }
    }

    fn checkpoint(&self, next_stage: &'static str) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(AppError::Cancelled(next_stage));
        }
        Ok(())
    }

    pub async fn bootstrap(&self, request: &BootstrapRequest) -> Result<()> {
        validation::validate(request)?;

        self.checkpoint("creating the data directory")?;
        self.provisioner
            .create_data_directory(request, &self.cancel)
            .await?;

        let major_version = detect_major_version(&request.data_directory)?;
        info!(major_version, "Detected PostgreSQL version");

        self.checkpoint("starting the transient instance")?;
        self.runner
            .with_running_instance(&request.data_directory, async |session: &mut R::Session| {
                environment::configure_application_environment(session, request).await?;

                if major_version >= ALTER_SYSTEM_RECOVERY_VERSION {
                    self.checkpoint("configuring replication")?;
                    environment::configure_replication(session, &request.upstream_host).await?;
                } else {
                    info!(major_version, "Skipping replication settings for this PostgreSQL version");
                }
                Ok(())
            })
            .await?;

        info!(pgdata = %request.data_directory.display(), "Bootstrap completed");
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::errors::ValidationError;
    use crate::instance::tests::RecordingSession;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// A valid request rooted in `root`: password files exist, the data
    /// directory doesn't.
    pub(crate) fn request_in(root: &Path) -> anyhow::Result<BootstrapRequest> {
        let superuser = root.join("superuser-password");
        let application = root.join("app-password");
        fs::write(&superuser, "postgres-secret\n")?;
        fs::write(&application, "app-secret\n")?;
        Ok(BootstrapRequest {
            data_directory: root.join("pgdata"),
            superuser_password_file: superuser,
            application_password_file: application,
            application_database: "appdb".to_string(),
            application_user: "app".to_string(),
            access_rules_file: None,
            extra_config_file: None,
            upstream_host: "cluster-rw".to_string(),
            cluster_name: "cluster".to_string(),
        })
    }

    /// Creates a bare data directory reporting `version`, and counts calls.
    struct SpyProvisioner {
        version: Option<&'static str>,
        calls: AtomicUsize,
    }

    impl SpyProvisioner {
        fn reporting(version: Option<&'static str>) -> Self {
            SpyProvisioner {
                version,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl DataDirectoryProvisioner for SpyProvisioner {
        async fn create_data_directory(
            &self,
            request: &BootstrapRequest,
            _cancel: &CancellationToken,
        ) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            fs::create_dir_all(&request.data_directory)
                .map_err(|e| AppError::io("creating fake data directory", e))?;
            if let Some(version) = self.version {
                fs::write(request.data_directory.join("PG_VERSION"), format!("{}\n", version))
                    .map_err(|e| AppError::io("writing PG_VERSION", e))?;
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct FakeRunner {
        starts: AtomicUsize,
        fail_at: Option<usize>,
        statements: Mutex<Vec<String>>,
    }

    impl InstanceRunner for FakeRunner {
        type Session = RecordingSession;

        async fn with_running_instance<T, F>(&self, _data_directory: &Path, f: F) -> Result<T>
        where
            F: AsyncFnOnce(&mut Self::Session) -> Result<T>,
        {
            self.starts.fetch_add(1, Ordering::SeqCst);
            let mut session = RecordingSession {
                statements: Vec::new(),
                fail_at: self.fail_at,
            };
            let outcome = f(&mut session).await;
            self.statements
                .lock()
                .expect("statements lock")
                .extend(session.statements);
            outcome
        }
    }

    impl FakeRunner {
        fn count(&self, fragment: &str) -> usize {
            self.statements
                .lock()
                .expect("statements lock")
                .iter()
                .filter(|s| s.contains(fragment))
                .count()
        }
    }

    #[tokio::test]
    async fn test_version_13_configures_replication_once() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let request = request_in(dir.path())?;
        let provisioner = SpyProvisioner::reporting(Some("13"));
        let runner = FakeRunner::default();

        BootstrapOrchestrator::new(&provisioner, &runner, CancellationToken::new())
            .bootstrap(&request)
            .await?;

        assert_eq!(provisioner.calls.load(Ordering::SeqCst), 1);
        assert_eq!(runner.starts.load(Ordering::SeqCst), 1);
        assert_eq!(runner.count("CREATE USER"), 1);
        assert_eq!(runner.count("primary_conninfo"), 1);
        assert_eq!(runner.count("recovery_target_timeline"), 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_version_11_never_configures_replication() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let request = request_in(dir.path())?;
        let provisioner = SpyProvisioner::reporting(Some("11"));
        let runner = FakeRunner::default();

        BootstrapOrchestrator::new(&provisioner, &runner, CancellationToken::new())
            .bootstrap(&request)
            .await?;

        assert_eq!(runner.count("CREATE DATABASE"), 1);
        assert_eq!(runner.count("primary_conninfo"), 0);
        assert_eq!(runner.count("recovery_target_timeline"), 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_password_file_never_reaches_provisioner() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let request = request_in(dir.path())?;
        fs::remove_file(&request.superuser_password_file)?;
        let provisioner = SpyProvisioner::reporting(Some("16"));
        let runner = FakeRunner::default();

        let result = BootstrapOrchestrator::new(&provisioner, &runner, CancellationToken::new())
            .bootstrap(&request)
            .await;

        assert!(matches!(
            result,
            Err(AppError::Validation(ValidationError::SuperuserPasswordFileMissing(_)))
        ));
        assert_eq!(provisioner.calls.load(Ordering::SeqCst), 0);
        assert_eq!(runner.starts.load(Ordering::SeqCst), 0);
        assert!(!request.data_directory.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_unknown_version_is_fatal() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let request = request_in(dir.path())?;
        let provisioner = SpyProvisioner::reporting(None);
        let runner = FakeRunner::default();

        let result = BootstrapOrchestrator::new(&provisioner, &runner, CancellationToken::new())
            .bootstrap(&request)
            .await;

        assert!(matches!(result, Err(AppError::Version { .. })));
        assert_eq!(runner.starts.load(Ordering::SeqCst), 0);
        // left in place for diagnosis
        assert!(request.data_directory.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_sql_failure_is_surfaced_and_directory_kept() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let request = request_in(dir.path())?;
        let provisioner = SpyProvisioner::reporting(Some("16"));
        let runner = FakeRunner {
            fail_at: Some(0),
            ..FakeRunner::default()
        };

        let result = BootstrapOrchestrator::new(&provisioner, &runner, CancellationToken::new())
            .bootstrap(&request)
            .await;

        assert!(matches!(result, Err(AppError::Configuration { .. })));
        assert_eq!(runner.count("CREATE DATABASE"), 0);
        assert_eq!(runner.count("primary_conninfo"), 0);
        assert!(request.data_directory.exists());
        Ok(())
    }

    #[tokio::test]
    async fn test_cancellation_stops_before_provisioning() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let request = request_in(dir.path())?;
        let provisioner = SpyProvisioner::reporting(Some("16"));
        let runner = FakeRunner::default();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = BootstrapOrchestrator::new(&provisioner, &runner, cancel)
            .bootstrap(&request)
            .await;

        assert!(matches!(result, Err(AppError::Cancelled(_))));
        assert_eq!(provisioner.calls.load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[tokio::test]
    #[ignore = "requires PostgreSQL server binaries (PG_BIN_DIR)"]
    async fn test_end_to_end_bootstrap() -> anyhow::Result<()> {
        use crate::config::{InstanceConfig, PgBinaries};
        use crate::instance::PostgresRunner;
        use crate::bootstrap::provisioner::InitdbProvisioner;
        use sqlx::PgConnection;
        use std::time::Duration;

        let bin_dir = std::env::var("PG_BIN_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/usr/lib/postgresql/16/bin"));
        let binaries = PgBinaries {
            initdb: bin_dir.join("initdb"),
            postgres: bin_dir.join("postgres"),
            pg_ctl: bin_dir.join("pg_ctl"),
        };
        let instance_config = InstanceConfig {
            port: 54333,
            startup_timeout: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(10),
        };

        let dir = tempfile::tempdir()?;
        let request = request_in(dir.path())?;
        let cancel = CancellationToken::new();
        let runner = PostgresRunner::new(
            binaries.clone(),
            instance_config,
            request.superuser_password_file.clone(),
            cancel.clone(),
        );

        BootstrapOrchestrator::new(
            InitdbProvisioner::new(binaries.initdb.clone(), PathBuf::from("/controller/manager")),
            &runner,
            cancel,
        )
        .bootstrap(&request)
        .await?;

        let conf = fs::read_to_string(request.data_directory.join("postgresql.conf"))?;
        assert!(conf.contains("archive_mode = on"));

        let (roles, databases, conninfo) = runner
            .with_running_instance(&request.data_directory, async |session: &mut PgConnection| {
                let probe = |source| AppError::Configuration { stage: "probe", source };
                let roles: i64 =
                    sqlx::query_scalar("SELECT count(*) FROM pg_roles WHERE rolname = 'app'")
                        .fetch_one(&mut *session)
                        .await
                        .map_err(probe)?;
                let databases: i64 =
                    sqlx::query_scalar("SELECT count(*) FROM pg_database WHERE datname = 'appdb'")
                        .fetch_one(&mut *session)
                        .await
                        .map_err(probe)?;
                let conninfo: String = sqlx::query_scalar("SHOW primary_conninfo")
                    .fetch_one(&mut *session)
                    .await
                    .map_err(probe)?;
                Ok((roles, databases, conninfo))
            })
            .await?;

        assert_eq!(roles, 1);
        assert_eq!(databases, 1);
        assert!(conninfo.contains("host=cluster-rw"));
        Ok(())
    }
}
