//! Region-aware mirror preference, backed by a one-shot IP geolocation lookup
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{info, warn};

const LOOKUP_URL: &str = "https://ipapi.co/country/";
const REGION_CODE: &str = "CN";
const LOOKUP_TIMEOUT_MS: u64 = 10_000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorSettings {
    pub lookup_url: String,
    /// ISO country code served by the region mirror
    pub region_code: String,
    pub lookup_timeout_ms: u64,
    /// Preference used when the lookup fails or times out
    pub assume_region_on_failure: bool,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            lookup_url: LOOKUP_URL.to_string(),
            region_code: REGION_CODE.to_string(),
            lookup_timeout_ms: LOOKUP_TIMEOUT_MS,
            assume_region_on_failure: false,
        }
    }
}

#[async_trait]
pub trait GeoLocator: Send + Sync {
    /// Two-letter country code of the caller's public address
    async fn country_code(&self) -> Result<String, MirrorError>;
}

/// Queries an ipapi-style endpoint that answers with a bare country code
pub struct IpApiLocator {
    url: String,
    client: reqwest::Client,
}

impl IpApiLocator {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self, MirrorError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mediadeck/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MirrorError::Lookup(e.to_string()))?;

        Ok(Self {
            url: url.into(),
            client,
        })
    }
}

#[async_trait]
impl GeoLocator for IpApiLocator {
    async fn country_code(&self) -> Result<String, MirrorError> {
        let response = self
            .client
            .get(&self.url)
            .send()
            .await
            .map_err(|e| MirrorError::Lookup(e.to_string()))?;

        if !response.status().is_success() {
            return Err(MirrorError::Lookup(format!(
                "lookup returned status {}",
                response.status()
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| MirrorError::Lookup(e.to_string()))?;
        let code = body.trim().to_ascii_uppercase();

        if code.len() != 2 || !code.chars().all(|c| c.is_ascii_alphabetic()) {
            return Err(MirrorError::Lookup(format!("unexpected lookup body: {}", body.trim())));
        }

        Ok(code)
    }
}

/// Decides whether acquisitions should prefer the region catalog.
///
/// The lookup runs at most once per selector; its outcome (or the configured
/// fallback on failure) is kept for the selector's lifetime.
pub struct MirrorSelector {
    locator: Option<Arc<dyn GeoLocator>>,
    region_code: String,
    lookup_timeout: Duration,
    assume_region_on_failure: bool,
    in_region: OnceCell<bool>,
}

impl MirrorSelector {
    pub fn new(settings: &MirrorSettings) -> Result<Self, MirrorError> {
        let timeout = Duration::from_millis(settings.lookup_timeout_ms);
        let locator = IpApiLocator::new(settings.lookup_url.clone(), timeout)?;
        Ok(Self::with_locator(
            Arc::new(locator),
            &settings.region_code,
            timeout,
            settings.assume_region_on_failure,
        ))
    }

    pub fn with_locator(
        locator: Arc<dyn GeoLocator>,
        region_code: &str,
        lookup_timeout: Duration,
        assume_region_on_failure: bool,
    ) -> Self {
        Self {
            locator: Some(locator),
            region_code: region_code.to_ascii_uppercase(),
            lookup_timeout,
            assume_region_on_failure,
            in_region: OnceCell::new(),
        }
    }

    /// Selector with a known answer and no lookup
    pub fn fixed(in_region: bool) -> Self {
        Self {
            locator: None,
            region_code: REGION_CODE.to_string(),
            lookup_timeout: Duration::from_millis(LOOKUP_TIMEOUT_MS),
            assume_region_on_failure: in_region,
            in_region: OnceCell::new_with(Some(in_region)),
        }
    }

    pub async fn prefers_region(&self) -> bool {
        *self.in_region.get_or_init(|| self.lookup()).await
    }

    /// Start the lookup in the background so later acquisitions rarely wait on it
    pub fn prewarm(self: &Arc<Self>) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            let in_region = this.prefers_region().await;
            info!("Mirror preference resolved: region={}", in_region);
        });
    }

    async fn lookup(&self) -> bool {
        let Some(locator) = self.locator.as_ref() else {
            return self.assume_region_on_failure;
        };

        match tokio::time::timeout(self.lookup_timeout, locator.country_code()).await {
            Ok(Ok(code)) => {
                info!("Region lookup answered {}", code);
                code.eq_ignore_ascii_case(&self.region_code)
            }
            Ok(Err(e)) => {
                warn!(
                    "Region lookup failed ({}), assuming region={}",
                    e, self.assume_region_on_failure
                );
                self.assume_region_on_failure
            }
            Err(_) => {
                warn!(
                    "Region lookup timed out after {:?}, assuming region={}",
                    self.lookup_timeout, self.assume_region_on_failure
                );
                self.assume_region_on_failure
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    #[error("Region lookup failed: {0}")]
    Lookup(String),
}
