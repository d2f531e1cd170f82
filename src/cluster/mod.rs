//! Start-up gate on the cluster resource
//!
//! Both commands run inside a pod created for a cluster resource that may
//! not be readable yet through the API server. The gate blocks until it is,
//! so no stage starts against a cluster the operator hasn't published.

use reqwest::StatusCode;
use std::fs;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::ClusterGateConfig;
use crate::errors::{AppError, Result};
use crate::utils::url_with_segments;

pub trait ClusterGate {
    /// Returns once the cluster `name` in `namespace` can be read.
    async fn wait_for_cluster(
        &self,
        name: &str,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<()>;
}

/// Gate for environments without an API server, such as local runs.
pub struct NoopGate;

impl ClusterGate for NoopGate {
    async fn wait_for_cluster(
        &self,
        name: &str,
        namespace: &str,
        _cancel: &CancellationToken,
    ) -> Result<()> {
        debug!(cluster = name, namespace, "Cluster gate disabled");
        Ok(())
    }
}

pub struct KubernetesClusterGate {
    client: reqwest::Client,
    config: ClusterGateConfig,
}

impl KubernetesClusterGate {
    pub fn new(config: ClusterGateConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder().timeout(Duration::from_secs(10));

        match fs::read(&config.ca_file) {
            Ok(pem) => {
                let certificate = reqwest::Certificate::from_pem(&pem).map_err(|e| {
                    AppError::Gate(format!("invalid CA bundle {}: {}", config.ca_file.display(), e))
                })?;
                builder = builder.add_root_certificate(certificate);
            }
            Err(e) => debug!(
                ca_file = %config.ca_file.display(),
                error = %e,
                "No service account CA bundle, using system roots"
            ),
        }

        let client = builder
            .build()
            .map_err(|e| AppError::Gate(format!("cannot build HTTP client: {}", e)))?;
        Ok(Self { client, config })
    }

    /// `{api_server}/apis/{group}/{version}/namespaces/{namespace}/{resource}/{name}`
    pub fn resource_url(&self, name: &str, namespace: &str) -> Result<Url> {
        url_with_segments(
            &self.config.api_server,
            &[
                "apis",
                &self.config.api_group,
                &self.config.api_version,
                "namespaces",
                namespace,
                &self.config.resource,
                name,
            ],
        )
        .map_err(AppError::Gate)
    }

    // The token is re-read on every attempt: projected tokens rotate.
    async fn fetch_once(&self, url: &Url) -> std::result::Result<(), String> {
        let mut request = self.client.get(url.clone());
        if let Ok(token) = fs::read_to_string(&self.config.token_file) {
            request = request.bearer_auth(token.trim());
        }

        let response = request
            .send()
            .await
            .map_err(|e| format!("request failed: {}", e))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            return Err("cluster resource not found yet".to_string());
        }
        let body = response.text().await.unwrap_or_default();
        Err(format!("HTTP {}: {}", status, body))
    }
}

impl ClusterGate for KubernetesClusterGate {
    async fn wait_for_cluster(
        &self,
        name: &str,
        namespace: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let url = self.resource_url(name, namespace)?;
        let mut delay = self.config.initial_backoff;
        let mut last_error = String::new();

        for attempt in 1..=self.config.attempts {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled("the cluster resource became observable"));
            }

            match self.fetch_once(&url).await {
                Ok(()) => {
                    info!(cluster = name, namespace, attempt, "Cluster resource is observable");
                    return Ok(());
                }
                Err(e) => {
                    warn!(cluster = name, namespace, attempt, error = %e, "Waiting for cluster resource");
                    last_error = e;
                }
            }

            if attempt == self.config.attempts {
                break;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(AppError::Cancelled("the cluster resource became observable"));
                }
                _ = tokio::time::sleep(delay) => {}
            }
            delay = (delay * 2).min(self.config.max_backoff);
        }

        Err(AppError::Gate(format!(
            "{}/{} after {} attempts: {}",
            namespace, name, self.config.attempts, last_error
        )))
    }
}
