//! WHIP client configuration

use std::time::Duration;

use url::Url;
use webrtc::ice_transport::ice_server::RTCIceServer;

use crate::error::{Error, Result};

/// Configuration for one WHIP publishing session
#[derive(Debug, Clone)]
pub struct WhipConfig {
    /// WHIP endpoint URL the offer is POSTed to
    pub endpoint: String,
    /// Bearer token sent with every request
    pub auth_token: Option<String>,
    /// ICE servers to use. When empty, servers advertised by the endpoint
    /// via `Link rel="ice-server"` are adopted.
    pub ice_servers: Vec<RTCIceServer>,
    /// Restrict video sections of the offer to these codec names
    /// (e.g. `["H264"]`). Empty list leaves the offer untouched.
    pub video_codecs: Vec<String>,
    /// How many reconnect attempts (ICE or full) the client makes before
    /// giving up with a terminal failure
    pub max_reconnects: u32,
    /// Base delay before restarting after a `disconnected` state; the
    /// actual delay is randomized within ±500ms. `failed` restarts
    /// immediately.
    pub restart_delay_ms: u64,
    /// Synthesize a silent audio track when the published tracks carry
    /// no audio
    pub ensure_audio: bool,
    /// Per-request timeout in milliseconds
    pub request_timeout_ms: u64,
    /// Retry schedule for transport-level request failures
    pub retry: RetryPolicy,
}

impl WhipConfig {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.into(),
            auth_token: None,
            ice_servers: Vec::new(),
            video_codecs: Vec::new(),
            max_reconnects: 3,
            restart_delay_ms: 2_000,
            ensure_audio: true,
            request_timeout_ms: 15_000,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = Some(token.into());
        self
    }

    pub fn with_video_codecs(mut self, codecs: Vec<String>) -> Self {
        self.video_codecs = codecs;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Validates the endpoint and returns it parsed
    pub fn endpoint_url(&self) -> Result<Url> {
        let url = Url::parse(&self.endpoint)
            .map_err(|e| Error::InvalidConfig(format!("endpoint: {e}")))?;
        match url.scheme() {
            "http" | "https" => Ok(url),
            other => Err(Error::InvalidConfig(format!(
                "endpoint scheme must be http(s), got {other}"
            ))),
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.endpoint_url()?;
        if self.request_timeout_ms == 0 {
            return Err(Error::InvalidConfig(
                "request_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Exponential backoff with jitter for HTTP retries. Delays double each
/// attempt, get multiplied by a random factor in `[0.75, 1.25)` and are
/// clamped to `[floor, ceiling]`.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_enabled: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_delay_ms: 500,
            min_delay_ms: 100,
            max_delay_ms: 3_000,
            jitter_enabled: true,
        }
    }
}

impl RetryPolicy {
    /// Delay before the retry following attempt `attempt` (zero-based)
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.initial_delay_ms.saturating_mul(1u64 << attempt.min(16));
        let jittered = if self.jitter_enabled {
            let factor = 0.75 + rand::random::<f64>() * 0.5;
            (base as f64 * factor) as u64
        } else {
            base
        };
        Duration::from_millis(jittered.clamp(self.min_delay_ms, self.max_delay_ms))
    }
}
