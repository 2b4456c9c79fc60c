//! Schema catalog refresh trigger (fire-and-forget).

use async_trait::async_trait;
use reqwest::Client;
use serde::Serialize;
use tracing::info;

use chatlake_shared::{ChatlakeError, Result};

/// Default timeout in seconds for the refresh request.
const DEFAULT_TIMEOUT_SECS: u64 = 10;

/// User-Agent string for catalog requests.
const USER_AGENT: &str = concat!("chatlake/", env!("CARGO_PKG_VERSION"));

/// Schema discovery scoped to one columnar output path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CatalogRequest {
    pub target: String,
    pub path: String,
}

/// Starts a catalog refresh. Completion is observed separately, if at all.
#[async_trait]
pub trait CatalogRefresher: Send + Sync {
    async fn refresh(&self, request: &CatalogRequest) -> Result<()>;
}

/// POSTs the request as JSON to the discovery service.
#[derive(Debug, Clone)]
pub struct HttpCatalogRefresher {
    client: Client,
    endpoint: String,
}

impl HttpCatalogRefresher {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(std::time::Duration::from_secs(DEFAULT_TIMEOUT_SECS))
            .build()
            .map_err(|e| ChatlakeError::Trigger(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl CatalogRefresher for HttpCatalogRefresher {
    async fn refresh(&self, request: &CatalogRequest) -> Result<()> {
        let response = self
            .client
            .post(&self.endpoint)
            .json(request)
            .send()
            .await
            .map_err(|e| ChatlakeError::Trigger(format!("{}: {e}", self.endpoint)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ChatlakeError::Trigger(format!(
                "{}: catalog refresh rejected with HTTP {status}",
                self.endpoint
            )));
        }

        info!(target = %request.target, path = %request.path, "catalog refresh requested");
        Ok(())
    }
}

/// Used when no discovery endpoint is configured.
#[derive(Debug, Clone, Default)]
pub struct LogOnlyCatalogRefresher;

#[async_trait]
impl CatalogRefresher for LogOnlyCatalogRefresher {
    async fn refresh(&self, request: &CatalogRequest) -> Result<()> {
        info!(
            target = %request.target,
            path = %request.path,
            "no catalog endpoint configured; refresh only logged"
        );
        Ok(())
    }
}

/// Pick the refresher for an optional endpoint.
pub fn refresher_for(endpoint: Option<&str>) -> Result<Box<dyn CatalogRefresher>> {
    match endpoint {
        Some(url) => Ok(Box::new(HttpCatalogRefresher::new(url)?)),
        None => Ok(Box::new(LogOnlyCatalogRefresher)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CatalogRequest {
        CatalogRequest {
            target: "chatlake_normalized".into(),
            path: "file:///lake/reports/columnar/normalization/".into(),
        }
    }

    #[tokio::test]
    async fn posts_target_and_path() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .and(wiremock::matchers::path("/refresh"))
            .and(wiremock::matchers::body_json(serde_json::json!({
                "target": "chatlake_normalized",
                "path": "file:///lake/reports/columnar/normalization/"
            })))
            .respond_with(wiremock::ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let refresher = HttpCatalogRefresher::new(format!("{}/refresh", server.uri())).unwrap();
        refresher.refresh(&request()).await.expect("refresh");
    }

    #[tokio::test]
    async fn server_error_is_trigger_error() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("POST"))
            .respond_with(wiremock::ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let refresher = HttpCatalogRefresher::new(server.uri()).unwrap();
        let err = refresher.refresh(&request()).await.unwrap_err();
        assert!(matches!(err, ChatlakeError::Trigger(_)));
        assert!(err.to_string().contains("500"));
    }

    #[tokio::test]
    async fn log_only_always_succeeds() {
        let refresher = refresher_for(None).unwrap();
        refresher.refresh(&request()).await.expect("logged");
    }
}
