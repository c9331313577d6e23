//! Streamed HTTP fetch with bounded manual redirects, progress and cancellation
use futures::StreamExt;
use reqwest::header::LOCATION;
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use std::collections::VecDeque;
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

pub const MAX_REDIRECTS: usize = 5;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const READ_TIMEOUT: Duration = Duration::from_secs(30);
const EMIT_INTERVAL: Duration = Duration::from_millis(250);
const TICK_INTERVAL: Duration = Duration::from_millis(500);
const SPEED_WINDOW: Duration = Duration::from_secs(1);

/// Byte counters reported while a transfer is running
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TransferProgress {
    pub downloaded: u64,
    pub total: Option<u64>,
    pub speed: f64,
}

impl TransferProgress {
    pub fn percent(&self) -> f64 {
        match self.total {
            Some(total) if total > 0 => (self.downloaded as f64 / total as f64 * 100.0).min(100.0),
            _ => 0.0,
        }
    }

    pub fn eta_secs(&self) -> Option<u64> {
        let total = self.total?;
        if self.speed <= 0.0 {
            return None;
        }
        Some((total.saturating_sub(self.downloaded) as f64 / self.speed).ceil() as u64)
    }
}

/// Average throughput over a sliding window
pub(crate) struct SpeedMeter {
    window: Duration,
    started: Instant,
    samples: VecDeque<(Instant, u64)>,
}

impl SpeedMeter {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            started: Instant::now(),
            samples: VecDeque::new(),
        }
    }

    pub fn record(&mut self, bytes: u64) {
        self.record_at(Instant::now(), bytes);
    }

    fn record_at(&mut self, now: Instant, bytes: u64) {
        self.samples.push_back((now, bytes));
        self.prune(now);
    }

    fn prune(&mut self, now: Instant) {
        while let Some((at, _)) = self.samples.front() {
            if now.duration_since(*at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn bytes_per_sec(&mut self) -> f64 {
        self.bytes_per_sec_at(Instant::now())
    }

    fn bytes_per_sec_at(&mut self, now: Instant) -> f64 {
        self.prune(now);
        let bytes: u64 = self.samples.iter().map(|(_, n)| n).sum();
        // Before a full window has elapsed, average over the time actually observed
        let span = now.duration_since(self.started).min(self.window);
        bytes as f64 / span.as_secs_f64().max(0.001)
    }
}

pub struct Downloader {
    client: reqwest::Client,
}

impl Downloader {
    pub fn new() -> Result<Self, DownloadError> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .read_timeout(READ_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .user_agent(concat!("mediadeck/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| DownloadError::Network(e.to_string()))?;

        Ok(Self { client })
    }

    /// Download `url` into `dest`. The partial file is removed on any failure,
    /// including cancellation.
    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        expected_size: u64,
        token: &CancellationToken,
        on_progress: &mut (dyn FnMut(TransferProgress) + Send),
    ) -> Result<u64, DownloadError> {
        let response = self.send_following_redirects(url, token).await?;

        let total = response
            .content_length()
            .filter(|len| *len > 0)
            .or((expected_size > 0).then_some(expected_size));

        let result = stream_to_file(response, dest, total, token, on_progress).await;
        if result.is_err() {
            let _ = fs::remove_file(dest).await;
        }
        result
    }

    async fn send_following_redirects(
        &self,
        url: &str,
        token: &CancellationToken,
    ) -> Result<reqwest::Response, DownloadError> {
        let mut current = Url::parse(url).map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
        let mut hops = 0usize;

        loop {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }

            let response = tokio::select! {
                res = self.client.get(current.clone()).send() => {
                    res.map_err(|e| DownloadError::Network(e.to_string()))?
                }
                _ = token.cancelled() => return Err(DownloadError::Cancelled),
            };

            match response.status() {
                StatusCode::OK => return Ok(response),
                StatusCode::MOVED_PERMANENTLY | StatusCode::FOUND => {
                    hops += 1;
                    if hops > MAX_REDIRECTS {
                        return Err(DownloadError::TooManyRedirects(MAX_REDIRECTS));
                    }
                    let location = response
                        .headers()
                        .get(LOCATION)
                        .and_then(|v| v.to_str().ok())
                        .ok_or(DownloadError::MissingLocation)?;
                    let next = current
                        .join(location)
                        .map_err(|e| DownloadError::InvalidUrl(e.to_string()))?;
                    debug!("Redirect {} -> {}", current, next);
                    current = next;
                }
                status => return Err(DownloadError::Status(status.as_u16())),
            }
        }
    }
}

async fn stream_to_file(
    response: reqwest::Response,
    dest: &Path,
    total: Option<u64>,
    token: &CancellationToken,
    on_progress: &mut (dyn FnMut(TransferProgress) + Send),
) -> Result<u64, DownloadError> {
    let mut file = fs::File::create(dest).await?;
    let mut stream = response.bytes_stream();
    let mut meter = SpeedMeter::new(SPEED_WINDOW);
    let mut ticker = tokio::time::interval(TICK_INTERVAL);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut downloaded = 0u64;
    let mut last_emit = Instant::now();

    loop {
        tokio::select! {
            biased;
            _ = token.cancelled() => return Err(DownloadError::Cancelled),
            chunk = stream.next() => match chunk {
                Some(Ok(bytes)) => {
                    if token.is_cancelled() {
                        return Err(DownloadError::Cancelled);
                    }
                    file.write_all(&bytes).await?;
                    downloaded += bytes.len() as u64;
                    meter.record(bytes.len() as u64);
                    if last_emit.elapsed() >= EMIT_INTERVAL {
                        last_emit = Instant::now();
                        on_progress(TransferProgress { downloaded, total, speed: meter.bytes_per_sec() });
                    }
                }
                Some(Err(e)) => return Err(DownloadError::Network(e.to_string())),
                None => break,
            },
            _ = ticker.tick() => {
                on_progress(TransferProgress { downloaded, total, speed: meter.bytes_per_sec() });
            }
        }
    }

    file.flush().await?;
    on_progress(TransferProgress {
        downloaded,
        total: total.or(Some(downloaded)),
        speed: meter.bytes_per_sec(),
    });
    info!("Downloaded {} bytes to {:?}", downloaded, dest);
    Ok(downloaded)
}

/// Lowercase hex SHA-256 of a file
pub async fn sha256_file(path: &Path) -> std::io::Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(std::io::Error::other)?
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("HTTP status {0}")]
    Status(u16),
    #[error("Exceeded {0} redirects")]
    TooManyRedirects(usize),
    #[error("Redirect without Location header")]
    MissingLocation,
    #[error("Invalid URL: {0}")]
    InvalidUrl(String),
    #[error("Download cancelled")]
    Cancelled,
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
