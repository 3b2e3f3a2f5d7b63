use facefeed_core::{AttemptId, ReconnectPolicy};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unsupported scheme {0:?} in service url (expected http, https, ws or wss)")]
    UnsupportedScheme(String),
    #[error("service url has no host: {0:?}")]
    MissingHost(String),
}

/// Session configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Base URL of the analysis service (e.g. `https://photos.local:8000`).
    pub service_url: String,
    /// Path segment the per-attempt identity is appended to.
    pub feed_path: String,
    /// Force `wss` (true) or `ws` (false). Unset mirrors the service URL's scheme.
    pub secure: Option<bool>,
    /// How long to wait for the `connected` event after the socket starts opening.
    pub connect_timeout: Duration,
    /// Flush window after the close notification, and the bound on local socket close.
    pub close_grace: Duration,
    /// Pause between tearing down one attempt and opening the next.
    pub reopen_grace: Duration,
    /// Delay before an automatic retry.
    pub retry_delay: Duration,
    /// Automatic retries per session.
    pub max_retries: u32,
    /// Also retry automatically when the feed drops after it started.
    pub retry_mid_stream: bool,
    /// Reject `capture()` while the latest frame shows no face.
    pub require_face_for_capture: bool,
    /// Frames buffered for a slow consumer before new ones are dropped.
    pub frame_buffer: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            service_url: "http://localhost:8000".to_string(),
            feed_path: "live-feed".to_string(),
            secure: None,
            connect_timeout: Duration::from_secs(10),
            close_grace: Duration::from_millis(100),
            reopen_grace: Duration::from_millis(500),
            retry_delay: Duration::from_millis(1500),
            max_retries: 3,
            retry_mid_stream: false,
            require_face_for_capture: false,
            frame_buffer: 32,
        }
    }
}

impl SessionConfig {
    /// Load configuration from `FACEFEED_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            service_url: std::env::var("FACEFEED_SERVICE_URL").unwrap_or(defaults.service_url),
            feed_path: std::env::var("FACEFEED_FEED_PATH").unwrap_or(defaults.feed_path),
            secure: env_bool("FACEFEED_SECURE"),
            connect_timeout: env_millis("FACEFEED_CONNECT_TIMEOUT_MS", defaults.connect_timeout),
            close_grace: env_millis("FACEFEED_CLOSE_GRACE_MS", defaults.close_grace),
            reopen_grace: env_millis("FACEFEED_REOPEN_GRACE_MS", defaults.reopen_grace),
            retry_delay: env_millis("FACEFEED_RETRY_DELAY_MS", defaults.retry_delay),
            max_retries: env_parse("FACEFEED_MAX_RETRIES", defaults.max_retries),
            retry_mid_stream: env_bool("FACEFEED_RETRY_MID_STREAM")
                .unwrap_or(defaults.retry_mid_stream),
            require_face_for_capture: env_bool("FACEFEED_REQUIRE_FACE")
                .unwrap_or(defaults.require_face_for_capture),
            frame_buffer: env_parse("FACEFEED_FRAME_BUFFER", defaults.frame_buffer).max(1),
        }
    }

    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            max_retries: self.max_retries,
            delay: self.retry_delay,
            retry_mid_stream: self.retry_mid_stream,
        }
    }

    /// WebSocket URL for one attempt:
    /// `{ws|wss}://{host}[/prefix]/{feed_path}/{client_id}-{attempt}`.
    pub fn endpoint_for(&self, attempt: &AttemptId) -> Result<String, ConfigError> {
        let raw = self.service_url.trim();
        let (scheme_secure, rest) = match raw.split_once("://") {
            Some((scheme, rest)) => match scheme.to_ascii_lowercase().as_str() {
                "https" | "wss" => (true, rest),
                "http" | "ws" => (false, rest),
                _ => return Err(ConfigError::UnsupportedScheme(scheme.to_string())),
            },
            None => (false, raw),
        };

        let authority = rest.trim_end_matches('/');
        if authority.is_empty() || authority.starts_with('/') {
            return Err(ConfigError::MissingHost(raw.to_string()));
        }

        let scheme = if self.secure.unwrap_or(scheme_secure) {
            "wss"
        } else {
            "ws"
        };
        let feed = self.feed_path.trim_matches('/');
        let segment = attempt.path_segment();
        if feed.is_empty() {
            Ok(format!("{scheme}://{authority}/{segment}"))
        } else {
            Ok(format!("{scheme}://{authority}/{feed}/{segment}"))
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_millis(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .map(Duration::from_millis)
        .unwrap_or(default)
}

fn env_bool(key: &str) -> Option<bool> {
    let value = std::env::var(key).ok()?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}
