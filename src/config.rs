//! Client configuration loaded from environment variables.
//!
//! Follows 12-factor style: all settings come from environment variables
//! (or a `.env` file via `dotenvy`). Library users can also build a
//! [`ClientConfig`] directly and skip the environment entirely.

use std::time::Duration;

use url::Url;

use crate::error::ClientError;
use crate::transport::ReconnectPolicy;

const DEFAULT_ENDPOINT: &str = "ws://localhost:8080/api/websocket";

/// Top-level client configuration.
///
/// Loaded once at startup via [`ClientConfig::from_env`].
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// WebSocket endpoint to connect to.
    pub endpoint: Url,

    /// Static bearer token, if any.
    pub token: Option<String>,

    /// Resource ids the binary subscribes to.
    pub resources: Vec<String>,

    /// First delay between reconnect attempts.
    pub reconnect_initial_delay: Duration,

    /// Upper bound for the reconnect back-off.
    pub reconnect_max_delay: Duration,

    /// Maximum consecutive reconnect attempts (`None` = unlimited).
    pub reconnect_max_attempts: Option<u32>,

    /// Capacity of each transport's event broadcast channel.
    pub event_bus_capacity: usize,

    /// Re-send channel subscriptions after a transport-level reconnect.
    pub resubscribe_on_reconnect: bool,

    /// Bound applied by the binary to the client-id handshake.
    pub request_timeout: Duration,
}

impl ClientConfig {
    /// Loads configuration from environment variables.
    ///
    /// Falls back to sensible defaults when a variable is not set.
    /// Calls `dotenvy::dotenv().ok()` to optionally load a `.env` file.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if `EVENTLINK_URL` is set but is not
    /// a valid `ws://` or `wss://` URL.
    pub fn from_env() -> Result<Self, ClientError> {
        dotenvy::dotenv().ok();

        let raw_endpoint =
            std::env::var("EVENTLINK_URL").unwrap_or_else(|_| DEFAULT_ENDPOINT.to_string());
        let endpoint = parse_endpoint(&raw_endpoint)?;

        let token = std::env::var("EVENTLINK_TOKEN")
            .ok()
            .filter(|t| !t.is_empty());

        let resources = std::env::var("EVENTLINK_RESOURCES")
            .map(|v| parse_list(&v))
            .unwrap_or_default();

        let reconnect_initial_delay =
            Duration::from_millis(parse_env("RECONNECT_INITIAL_DELAY_MS", 500));
        let reconnect_max_delay = Duration::from_millis(parse_env("RECONNECT_MAX_DELAY_MS", 30_000));
        let reconnect_max_attempts = match parse_env("RECONNECT_MAX_ATTEMPTS", 0u32) {
            0 => None,
            n => Some(n),
        };

        let event_bus_capacity = parse_env("EVENT_BUS_CAPACITY", 1024usize).max(1);
        let resubscribe_on_reconnect = parse_env_bool("RESUBSCRIBE_ON_RECONNECT", false);
        let request_timeout = Duration::from_secs(parse_env("REQUEST_TIMEOUT_SECS", 30));

        Ok(Self {
            endpoint,
            token,
            resources,
            reconnect_initial_delay,
            reconnect_max_delay,
            reconnect_max_attempts,
            event_bus_capacity,
            resubscribe_on_reconnect,
            request_timeout,
        })
    }

    /// Returns a configuration pointing at `endpoint` with every other field
    /// at its default.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if `endpoint` is not a WebSocket URL.
    pub fn for_endpoint(endpoint: &str) -> Result<Self, ClientError> {
        Ok(Self::with_endpoint(parse_endpoint(endpoint)?))
    }

    /// Every field at its default except `endpoint`.
    fn with_endpoint(endpoint: Url) -> Self {
        Self {
            endpoint,
            token: None,
            resources: Vec::new(),
            reconnect_initial_delay: Duration::from_millis(500),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_max_attempts: None,
            event_bus_capacity: 1024,
            resubscribe_on_reconnect: false,
            request_timeout: Duration::from_secs(30),
        }
    }

    /// Reconnect policy derived from the back-off settings.
    #[must_use]
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy {
            initial_delay: self.reconnect_initial_delay,
            max_delay: self.reconnect_max_delay,
            max_attempts: self.reconnect_max_attempts,
        }
    }
}

/// Parses `raw` as a URL and checks the scheme is `ws` or `wss`.
fn parse_endpoint(raw: &str) -> Result<Url, ClientError> {
    let url = Url::parse(raw).map_err(|e| ClientError::Config(format!("{raw}: {e}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(ClientError::Config(format!(
            "{raw}: unsupported scheme {other}"
        ))),
    }
}

/// Splits a comma-separated list, trimming blanks.
fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parses an environment variable as `T`, returning `default` on missing
/// or invalid values.
fn parse_env<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Parses an environment variable as a boolean. Accepts `"true"`, `"1"`,
/// `"false"`, `"0"` (case-insensitive). Returns `default` otherwise.
fn parse_env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key).ok().map(|v| v.to_ascii_lowercase()).as_deref() {
        Some("true") | Some("1") => true,
        Some("false") | Some("0") => false,
        _ => default,
    }
}
