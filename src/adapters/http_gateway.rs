use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::{Client, Response};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};
use url::Url;

use crate::domain::config::BackendConfig;
use crate::domain::CoreError;
use crate::ports::HttpClient;

/// HTTP client that only talks to allow-listed hosts.
///
/// Every backend request goes through here. A host outside the list is
/// refused before any connection is made.
pub struct GuardedHttpClient {
    client: Client,
    allowed_hosts: RwLock<Vec<String>>,
}

impl GuardedHttpClient {
    pub fn new(config: &BackendConfig) -> Result<Self, CoreError> {
        Self::with_hosts(
            config.effective_allowed_hosts(),
            Duration::from_millis(config.request_timeout_ms),
        )
    }

    fn with_hosts(allowed_hosts: Vec<String>, timeout: Duration) -> Result<Self, CoreError> {
        let client = Client::builder()
            .use_rustls_tls()
            .user_agent(format!("parley/{}", env!("CARGO_PKG_VERSION")))
            .timeout(timeout)
            .build()
            .map_err(|e| CoreError::Http(format!("Failed to create HTTP client: {}", e)))?;

        debug!(allowed_hosts = ?allowed_hosts, "HTTP client initialized");

        Ok(Self {
            client,
            allowed_hosts: RwLock::new(allowed_hosts),
        })
    }

    pub fn set_allowed_hosts(&self, hosts: Vec<String>) {
        *self.allowed_hosts.write() = hosts;
    }

    fn check_url(&self, url: &str) -> Result<(), CoreError> {
        let parsed = Url::parse(url).map_err(|e| CoreError::Http(e.to_string()))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| CoreError::Http("Invalid URL: no host".to_string()))?;

        let allowed = self.allowed_hosts.read();
        if !allowed
            .iter()
            .any(|h| host == h || host.ends_with(&format!(".{}", h)))
        {
            warn!(url, host, "Request blocked: host not allowed");
            return Err(CoreError::NetworkBlocked {
                reason: format!("Host '{}' is not in the allowed list", host),
            });
        }
        Ok(())
    }

    async fn checked(response: reqwest::Result<Response>, url: &str) -> Result<Response, CoreError> {
        let response = response.map_err(|e| CoreError::Http(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(CoreError::Http(format!("HTTP {} for {}", status, url)));
        }
        Ok(response)
    }
}

#[async_trait]
impl HttpClient for GuardedHttpClient {
    async fn post_json<T: Serialize + Send + Sync, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<R, CoreError> {
        self.check_url(url)?;
        let response = Self::checked(self.client.post(url).json(body).send().await, url).await?;
        response
            .json()
            .await
            .map_err(|e| CoreError::Serialization(e.to_string()))
    }

    async fn post_ack<T: Serialize + Send + Sync>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<(), CoreError> {
        self.check_url(url)?;
        Self::checked(self.client.post(url).json(body).send().await, url).await?;
        Ok(())
    }

    fn allowed_hosts(&self) -> Vec<String> {
        self.allowed_hosts.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(hosts: &[&str]) -> GuardedHttpClient {
        GuardedHttpClient::with_hosts(
            hosts.iter().map(|h| h.to_string()).collect(),
            Duration::from_secs(5),
        )
        .unwrap()
    }

    #[test]
    fn test_base_url_host_is_allowed() {
        let config = BackendConfig {
            base_url: "https://api.parley.example/v1".to_string(),
            allowed_hosts: vec![],
            request_timeout_ms: 1_000,
        };
        let client = GuardedHttpClient::new(&config).unwrap();
        assert_eq!(client.allowed_hosts(), vec!["api.parley.example".to_string()]);
        assert!(client.check_url("https://api.parley.example/sessions").is_ok());
    }

    #[test]
    fn test_unlisted_host_is_blocked() {
        let client = client(&["localhost"]);
        assert!(matches!(
            client.check_url("https://elsewhere.example/steal"),
            Err(CoreError::NetworkBlocked { .. })
        ));
    }

    #[test]
    fn test_subdomain_allowed() {
        let client = client(&["parley.example"]);
        assert!(client.check_url("https://eu.parley.example/x").is_ok());
        assert!(client.check_url("https://notparley.example/x").is_err());
    }

    #[tokio::test]
    async fn test_post_json_roundtrip() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/echo"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"ok": true})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client(&["127.0.0.1"]);
        let reply: serde_json::Value = client
            .post_json(&format!("{}/echo", server.uri()), &serde_json::json!({"a": 1}))
            .await
            .unwrap();
        assert_eq!(reply["ok"], true);
    }

    #[tokio::test]
    async fn test_error_status_is_reported() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let client = client(&["127.0.0.1"]);
        let err = client
            .post_ack(&format!("{}/anything", server.uri()), &serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Http(msg) if msg.contains("503")));
    }
}
