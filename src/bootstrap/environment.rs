// instancemanager/src/bootstrap/environment.rs
use tracing::info;

use super::BootstrapRequest;
use crate::errors::{AppError, Result};
use crate::instance::SqlSession;
use crate::utils::read_secret_file;
use crate::utils::sql::{quote_conninfo_value, quote_identifier, quote_literal};

/// Database every instance connects to when following its upstream.
const UPSTREAM_SYSTEM_DATABASE: &str = "postgres";
const UPSTREAM_USER: &str = "postgres";

async fn run<S: SqlSession>(session: &mut S, stage: &'static str, statement: &str) -> Result<()> {
    session
        .execute(statement)
        .await
        .map_err(|source| AppError::Configuration { stage, source })
}

/// Creates the application role and database and records the cluster name.
/// Each statement commits on its own: a failure leaves earlier steps applied.
pub async fn configure_application_environment<S: SqlSession>(
    session: &mut S,
    request: &BootstrapRequest,
) -> Result<()> {
    let user = quote_identifier(&request.application_user);

    run(session, "creating the application user", &format!("CREATE USER {}", user)).await?;

    let password = read_secret_file(&request.application_password_file).map_err(|e| {
        AppError::io(
            format!(
                "reading the application password file {}",
                request.application_password_file.display()
            ),
            e,
        )
    })?;
    run(
        session,
        "setting the application user password",
        &format!("ALTER USER {} PASSWORD {}", user, quote_literal(&password)),
    )
    .await?;

    run(
        session,
        "creating the application database",
        &format!(
            "CREATE DATABASE {} OWNER {}",
            quote_identifier(&request.application_database),
            user
        ),
    )
    .await?;

    run(
        session,
        "setting cluster_name",
        &format!(
            "ALTER SYSTEM SET cluster_name TO {}",
            quote_literal(&request.cluster_name)
        ),
    )
    .await?;

    info!(
        user = %request.application_user,
        database = %request.application_database,
        "Application environment configured"
    );
    Ok(())
}

pub fn upstream_conninfo(upstream_host: &str) -> String {
    format!(
        "host={} user={} dbname={}",
        quote_conninfo_value(upstream_host),
        UPSTREAM_USER,
        UPSTREAM_SYSTEM_DATABASE
    )
}

/// Points the instance at its upstream and makes it follow timeline
/// switches. Only valid for PostgreSQL 12 and later, where these settings
/// live in `postgresql.auto.conf`.
pub async fn configure_replication<S: SqlSession>(session: &mut S, upstream_host: &str) -> Result<()> {
    run(
        session,
        "setting primary_conninfo",
        &format!(
            "ALTER SYSTEM SET primary_conninfo TO {}",
            quote_literal(&upstream_conninfo(upstream_host))
        ),
    )
    .await?;

    run(
        session,
        "setting recovery_target_timeline",
        "ALTER SYSTEM SET recovery_target_timeline TO 'latest'",
    )
    .await?;

    info!(upstream = %upstream_host, "Replication settings configured");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bootstrap::tests::request_in;
    use crate::instance::tests::RecordingSession;
    use std::fs;

    #[tokio::test]
    async fn test_statements_in_order_and_escaped() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let mut request = request_in(dir.path())?;
        request.application_user = "app\"user".to_string();
        request.cluster_name = "cluster-o'one".to_string();
        fs::write(&request.application_password_file, "pa'ss\n")?;

        let mut session = RecordingSession::default();
        configure_application_environment(&mut session, &request).await?;

        assert_eq!(
            session.statements,
            vec![
                "CREATE USER \"app\"\"user\"".to_string(),
                "ALTER USER \"app\"\"user\" PASSWORD 'pa''ss'".to_string(),
                "CREATE DATABASE \"appdb\" OWNER \"app\"\"user\"".to_string(),
                "ALTER SYSTEM SET cluster_name TO 'cluster-o''one'".to_string(),
            ]
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_password_read_failure_is_local() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let request = request_in(dir.path())?;
        fs::remove_file(&request.application_password_file)?;

        let mut session = RecordingSession::default();
        let result = configure_application_environment(&mut session, &request).await;

        assert!(matches!(result, Err(AppError::Io { .. })));
        // the role was already created, nothing after it ran
        assert_eq!(session.statements, vec!["CREATE USER \"app\"".to_string()]);
        Ok(())
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_statements() -> anyhow::Result<()> {
        let dir = tempfile::tempdir()?;
        let request = request_in(dir.path())?;

        let mut session = RecordingSession::failing_at(2);
        let result = configure_application_environment(&mut session, &request).await;

        match result {
            Err(AppError::Configuration { stage, .. }) => {
                assert_eq!(stage, "creating the application database")
            }
            other => panic!("unexpected result: {:?}", other),
        }
        assert_eq!(session.statements.len(), 3);
        Ok(())
    }

    #[test]
    fn test_upstream_conninfo() {
        assert_eq!(
            upstream_conninfo("cluster-example-rw"),
            "host=cluster-example-rw user=postgres dbname=postgres"
        );
    }

    #[tokio::test]
    async fn test_replication_statements() -> anyhow::Result<()> {
        let mut session = RecordingSession::default();
        configure_replication(&mut session, "pg-primary").await?;

        assert_eq!(
            session.statements,
            vec![
                "ALTER SYSTEM SET primary_conninfo TO 'host=pg-primary user=postgres dbname=postgres'"
                    .to_string(),
                "ALTER SYSTEM SET recovery_target_timeline TO 'latest'".to_string(),
            ]
        );
        Ok(())
    }
}
