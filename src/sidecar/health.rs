use super::SidecarError;
use async_trait::async_trait;
use std::time::Duration;

#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Ok when the server at `host:port` reports ready
    async fn check(&self, host: &str, port: u16) -> Result<(), String>;
}

/// Any successful status from the health endpoint counts as healthy
pub struct HttpHealthProbe {
    client: reqwest::Client,
    path: String,
}

impl HttpHealthProbe {
    pub fn new(path: impl Into<String>, timeout: Duration) -> Result<Self, SidecarError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()
            .map_err(|e| SidecarError::Http(e.to_string()))?;

        Ok(Self {
            client,
            path: path.into(),
        })
    }
}

#[async_trait]
impl HealthProbe for HttpHealthProbe {
    async fn check(&self, host: &str, port: u16) -> Result<(), String> {
        let url = format!("http://{}:{}{}", host, port, self.path);
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| format!("health request failed: {e}"))?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("health check returned status {}", response.status()))
        }
    }
}
