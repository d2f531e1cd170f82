// instancemanager/src/sidecar/mod.rs
use tracing::{info, warn};
use url::Url;

use crate::config::SidecarConfig;
use crate::errors::{AppError, Result};
use crate::utils::url_with_segments;

/// Tells service-mesh proxies sharing the pod that the main container is done,
/// so a completed job pod can actually terminate.
pub trait SidecarNotifier {
    async fn notify_shutdown(&self) -> Result<()>;
}

pub struct NoopNotifier;

impl SidecarNotifier for NoopNotifier {
    async fn notify_shutdown(&self) -> Result<()> {
        Ok(())
    }
}

pub struct HttpSidecarNotifier {
    client: reqwest::Client,
    endpoints: Vec<Url>,
}

impl HttpSidecarNotifier {
    pub fn new(config: &SidecarConfig) -> Result<Self> {
        let mut endpoints = Vec::new();
        if let Some(base) = &config.istio_quit_url {
            endpoints.push(url_with_segments(base, &["quitquitquit"]).map_err(AppError::Sidecar)?);
        }
        if let Some(base) = &config.linkerd_shutdown_url {
            endpoints.push(url_with_segments(base, &["shutdown"]).map_err(AppError::Sidecar)?);
        }

        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AppError::Sidecar(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client, endpoints })
    }

    pub fn endpoints(&self) -> &[Url] {
        &self.endpoints
    }
}

impl SidecarNotifier for HttpSidecarNotifier {
    /// Posts to every configured endpoint, even after one fails, and reports
    /// the failures together.
    async fn notify_shutdown(&self) -> Result<()> {
        let mut failures = Vec::new();
        for endpoint in &self.endpoints {
            match self.client.post(endpoint.clone()).send().await {
                Ok(response) if response.status().is_success() => {
                    info!(endpoint = %endpoint, "Sidecar notified");
                }
                Ok(response) => failures.push(format!("{}: HTTP {}", endpoint, response.status())),
                Err(e) => failures.push(format!("{}: {}", endpoint, e)),
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(AppError::Sidecar(failures.join("; ")))
        }
    }
}

/// Runs the notifier after the command's outcome is settled. A failure is
/// logged and otherwise ignored.
pub async fn notify_best_effort<N: SidecarNotifier>(notifier: &N) {
    if let Err(e) = notifier.notify_shutdown().await {
        warn!(error = %e, "Error while notifying sidecars");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(istio: Option<&str>, linkerd: Option<&str>) -> SidecarConfig {
        SidecarConfig {
            istio_quit_url: istio.map(str::to_string),
            linkerd_shutdown_url: linkerd.map(str::to_string),
            timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn test_endpoints_follow_configuration() -> anyhow::Result<()> {
        let notifier = HttpSidecarNotifier::new(&config(None, None))?;
        assert!(notifier.endpoints().is_empty());

        let notifier = HttpSidecarNotifier::new(&config(
            Some("http://localhost:15000"),
            Some("http://localhost:4191/"),
        ))?;
        let endpoints: Vec<&str> = notifier.endpoints().iter().map(Url::as_str).collect();
        assert_eq!(
            endpoints,
            vec!["http://localhost:15000/quitquitquit", "http://localhost:4191/shutdown"]
        );
        Ok(())
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        assert!(matches!(
            HttpSidecarNotifier::new(&config(Some("localhost 15000"), None)),
            Err(AppError::Sidecar(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_sidecar_reports_error() -> anyhow::Result<()> {
        let notifier = HttpSidecarNotifier::new(&config(Some("http://127.0.0.1:9"), None))?;
        assert!(matches!(
            notifier.notify_shutdown().await,
            Err(AppError::Sidecar(_))
        ));

        // never escalated past a log line
        notify_best_effort(&notifier).await;
        Ok(())
    }

    #[tokio::test]
    async fn test_nothing_configured_is_a_noop() -> anyhow::Result<()> {
        HttpSidecarNotifier::new(&config(None, None))?
            .notify_shutdown()
            .await?;
        NoopNotifier.notify_shutdown().await?;
        Ok(())
    }
}
