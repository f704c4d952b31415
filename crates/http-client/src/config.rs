//! HTTP client settings.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default per-request timeout, chunk uploads included.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Connection settings of [`HttpSessionClient`](crate::HttpSessionClient).
#[derive(Clone, Serialize, Deserialize)]
pub struct HttpClientConfig {
    /// API root, e.g. `https://api.example.com`.
    pub base_url: String,
    /// Bearer token sent with every request.
    pub api_token: String,
    #[serde(default = "default_timeout_secs", rename = "request_timeout_secs")]
    timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT.as_secs()
}

impl HttpClientConfig {
    pub fn new(base_url: impl Into<String>, api_token: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            api_token: api_token.into(),
            timeout_secs: default_timeout_secs(),
        }
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl std::fmt::Debug for HttpClientConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpClientConfig")
            .field("base_url", &self.base_url)
            .field("api_token", &"<redacted>")
            .field("request_timeout", &self.request_timeout())
            .finish()
    }
}
