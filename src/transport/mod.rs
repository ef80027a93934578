//! Transport layer: one physical streaming connection to one endpoint.
//!
//! A [`Transport`] connects, reconnects according to its own policy, queues
//! outbound messages until the connection is open, and publishes every
//! lifecycle change and inbound frame as a [`TransportEvent`]; frames reach
//! their consumer losslessly through an [`InboundStream`].
//!
//! Two implementations are provided:
//!
//! - [`WsTransport`]: a real WebSocket connection via `tokio-tungstenite`.
//! - [`MemoryTransport`]: an in-process peer driven by a [`MemoryServer`]
//!   handle, for tests and embedding.

pub mod event;
pub mod memory;
pub mod transport_id;
pub mod websocket;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use serde_json::Value;
use tokio::sync::broadcast;
use url::Url;

use crate::error::ClientError;

pub use event::{EventBus, InboundStream, TransportEvent};
pub use memory::{MemoryServer, MemoryTransport};
pub use transport_id::TransportId;
pub use websocket::WsTransport;

/// Close code used when [`Transport::disconnect`] is called without one.
pub const NORMAL_CLOSURE: u16 = 1000;

/// Produces the URL for each (re)connection attempt.
///
/// Invoked once per attempt so that credentials embedded in the URL can be
/// refreshed.
pub type EntrypointProvider =
    Arc<dyn Fn() -> BoxFuture<'static, Result<Url, ClientError>> + Send + Sync>;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// No connection and no attempt in progress.
    Closed,
    /// An attempt is in progress.
    Connecting,
    /// Frames can be exchanged.
    Open,
}

/// A persistent, self-reconnecting message connection.
#[async_trait]
pub trait Transport: Send + Sync + std::fmt::Debug {
    /// Connects using `entrypoint` to resolve the URL of every attempt.
    ///
    /// Resolves when the connection first opens. Reconnects after an
    /// unplanned close are reported only through [`TransportEvent`]s.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Transport`] if the first attempt fails before
    /// the connection opens.
    async fn connect(&self, entrypoint: EntrypointProvider) -> Result<(), ClientError>;

    /// Serializes and transmits `message`.
    ///
    /// Waits until the connection is open. Messages are transmitted in call
    /// order, never dropped nor reordered.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionClosed`] if the transport is torn
    /// down before the message could be written.
    async fn send(&self, message: Value) -> Result<(), ClientError>;

    /// Closes the connection with `code` (default [`NORMAL_CLOSURE`]) and
    /// suppresses automatic reconnection.
    async fn disconnect(&self, code: Option<u16>);

    /// Registers a listener for lifecycle events (open, close, error).
    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    /// Attaches the single consumer of the ordered, lossless event stream
    /// (inbound frames and lifecycle events). A previous consumer is
    /// detached.
    fn inbound(&self) -> InboundStream;

    /// Current connection state.
    fn state(&self) -> ConnectionState;

    /// Identifier used in log records.
    fn id(&self) -> TransportId;
}

/// Reconnection back-off applied after an unplanned close.
///
/// The delay doubles after each failed attempt starting from
/// `initial_delay` and never exceeds `max_delay`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnect attempt.
    pub initial_delay: Duration,
    /// Upper bound of the delay.
    pub max_delay: Duration,
    /// Give up after this many consecutive failed attempts (`None` = never).
    pub max_attempts: Option<u32>,
}

impl ReconnectPolicy {
    /// Returns the delay before attempt number `attempt` (1-based), or
    /// `None` once the attempt budget is exhausted.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Option<Duration> {
        if let Some(max) = self.max_attempts
            && attempt > max
        {
            return None;
        }
        let shift = attempt.saturating_sub(1).min(16);
        let delay = self.initial_delay.saturating_mul(1u32 << shift);
        Some(delay.min(self.max_delay))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_attempts: None,
        }
    }
}

/// Builds an [`EntrypointProvider`] that always yields `url`.
#[must_use]
pub fn fixed_entrypoint(url: Url) -> EntrypointProvider {
    Arc::new(move || {
        let url = url.clone();
        Box::pin(async move { Ok::<_, ClientError>(url) })
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = ReconnectPolicy {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
            max_attempts: None,
        };
        assert_eq!(policy.delay_for(1), Some(Duration::from_millis(100)));
        assert_eq!(policy.delay_for(2), Some(Duration::from_millis(200)));
        assert_eq!(policy.delay_for(3), Some(Duration::from_millis(350)));
        assert_eq!(policy.delay_for(40), Some(Duration::from_millis(350)));
    }

    #[test]
    fn attempt_budget_is_enforced() {
        let policy = ReconnectPolicy {
            max_attempts: Some(2),
            ..ReconnectPolicy::default()
        };
        assert!(policy.delay_for(2).is_some());
        assert_eq!(policy.delay_for(3), None);
    }

    #[tokio::test]
    async fn fixed_entrypoint_repeats_url() {
        let Ok(url) = Url::parse("ws://localhost:1/ws") else {
            return;
        };
        let provider = fixed_entrypoint(url.clone());
        assert_eq!(provider().await.ok(), Some(url.clone()));
        assert_eq!(provider().await.ok(), Some(url));
    }
}
