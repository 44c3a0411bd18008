//! `GET {api}/api/health` probe for the reachability monitor.

use std::time::Duration;

use async_trait::async_trait;
use log::debug;

use clinicsync_core::config::HEALTH_CHECK_TIMEOUT_MS;
use clinicsync_core::health::{HealthProbe, ProbeOutcome};

use crate::error::{ApiError, Result};

#[derive(Debug, Clone)]
pub struct HttpHealthProbe {
    client: reqwest::Client,
    url: String,
}

impl HttpHealthProbe {
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_millis(HEALTH_CHECK_TIMEOUT_MS))
    }

    /// The monitor applies its own timeout as well; this one bounds the socket.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = base_url.trim().trim_end_matches('/');
        if base_url.is_empty() {
            return Err(ApiError::invalid_request("API base URL is empty"));
        }
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: format!("{}/api/health", base_url),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn probe(&self) -> ProbeOutcome {
        match self.client.get(&self.url).send().await {
            Ok(response) if response.status().is_success() => ProbeOutcome::Healthy,
            Ok(response) => {
                let status = response.status().as_u16();
                debug!("[Reachability] Health endpoint answered {}", status);
                ProbeOutcome::Unhealthy { status }
            }
            Err(err) => ProbeOutcome::NetworkError(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_server::{start_mock_server, MockOutcome};

    #[tokio::test]
    async fn classifies_status_codes() {
        let (base_url, captured, server) = start_mock_server(vec![
            MockOutcome::respond(200, r#"{"status":"ok"}"#),
            MockOutcome::respond(503, r#"{"status":"down"}"#),
        ])
        .await;
        let probe = HttpHealthProbe::new(&base_url).unwrap();

        assert_eq!(probe.probe().await, ProbeOutcome::Healthy);
        assert_eq!(probe.probe().await, ProbeOutcome::Unhealthy { status: 503 });
        let requests = captured.lock().await;
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].path, "/api/health");
        server.abort();
    }

    #[tokio::test]
    async fn refused_connection_is_a_network_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let probe = HttpHealthProbe::new(&format!("http://{}", addr)).unwrap();
        assert!(matches!(probe.probe().await, ProbeOutcome::NetworkError(_)));
    }
}
