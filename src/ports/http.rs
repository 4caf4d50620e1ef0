use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::domain::CoreError;

/// HTTP client port for all backend requests.
/// All network traffic must go through this interface.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Perform a POST request with JSON body.
    async fn post_json<T: Serialize + Send + Sync, R: DeserializeOwned>(
        &self,
        url: &str,
        body: &T,
    ) -> Result<R, CoreError>;

    /// Perform a POST request with JSON body, ignoring the response body.
    async fn post_ack<T: Serialize + Send + Sync>(&self, url: &str, body: &T)
        -> Result<(), CoreError>;

    /// Get the list of hosts requests may be sent to.
    fn allowed_hosts(&self) -> Vec<String>;
}
