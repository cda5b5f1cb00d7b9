//! HTTP client for the primary source.

use async_trait::async_trait;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

use super::PrimarySource;
use crate::config::DashboardConfig;
use crate::error::{SyncError, SyncResult};

/// REST aggregation endpoint reached over HTTP.
#[derive(Clone)]
pub struct HttpApi {
    http: reqwest::Client,
    base_url: url::Url,
}

impl HttpApi {
    pub fn new(base_url: &str, timeout: Duration) -> SyncResult<Self> {
        // A trailing slash keeps any path prefix when endpoints are joined.
        let base_url = url::Url::parse(&format!("{}/", base_url.trim_end_matches('/')))?;
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SyncError::InvalidConfig(format!("HTTP client: {}", e)))?;

        Ok(HttpApi { http, base_url })
    }

    pub fn from_config(config: &DashboardConfig) -> SyncResult<Self> {
        Self::new(&config.primary.base_url, config.request_timeout())
    }

    pub fn base_url(&self) -> &url::Url {
        &self.base_url
    }

    /// Resolves an endpoint below the base URL, leading slash or not.
    fn url(&self, path: &str) -> SyncResult<url::Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    /// Turns a response into JSON, mapping non-2xx to [`SyncError::HttpStatus`].
    async fn into_json(resp: reqwest::Response) -> SyncResult<Value> {
        let status = resp.status();
        if !status.is_success() {
            let message = resp.text().await.unwrap_or_default();
            return Err(SyncError::HttpStatus {
                status: status.as_u16(),
                message,
            });
        }

        let body = resp.text().await?;
        if body.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&body)?)
    }
}

#[async_trait]
impl PrimarySource for HttpApi {
    async fn get_json(&self, path: &str, params: &[(&'static str, String)]) -> SyncResult<Value> {
        let url = self.url(path)?;
        debug!(%url, ?params, "GET primary");
        let resp = self.http.get(url).query(params).send().await?;
        Self::into_json(resp).await
    }

    async fn post_json(&self, path: &str, body: &Value) -> SyncResult<Value> {
        let url = self.url(path)?;
        debug!(%url, "POST primary");
        let resp = self.http.post(url).json(body).send().await?;
        Self::into_json(resp).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::endpoints;

    #[test]
    fn test_paths_join_onto_base() {
        let api = HttpApi::new("http://localhost:8000/", Duration::from_secs(1)).unwrap();
        assert_eq!(
            api.url("/api/trades").unwrap().as_str(),
            "http://localhost:8000/api/trades"
        );
    }

    #[test]
    fn test_base_path_prefix_is_kept() {
        for base in ["https://host.example/bot", "https://host.example/bot/"] {
            let api = HttpApi::new(base, Duration::from_secs(1)).unwrap();
            assert_eq!(
                api.url(endpoints::TRADES).unwrap().as_str(),
                "https://host.example/bot/api/trades"
            );
            assert_eq!(
                api.url(endpoints::SYNC_POSITIONS).unwrap().as_str(),
                "https://host.example/bot/api/positions/sync"
            );
        }
    }

    #[test]
    fn test_rejects_garbage_url() {
        assert!(matches!(
            HttpApi::new("not a url", Duration::from_secs(1)),
            Err(SyncError::InvalidUrl(_))
        ));
    }
}
