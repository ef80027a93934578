//! In-process transport driven by a scriptable peer.
//!
//! [`MemoryTransport`] implements [`Transport`] without any socket. The
//! paired [`MemoryServer`] plays the remote side: it decides when the
//! connection opens or drops, pushes inbound frames, and observes every
//! message the client transmitted. Used by the crate's own tests and by
//! applications that want to test code built on top of the multiplexer.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc, watch};
use url::Url;

use super::{
    ConnectionState, EntrypointProvider, EventBus, InboundStream, NORMAL_CLOSURE, Transport,
    TransportEvent, TransportId,
};
use crate::error::ClientError;

/// State shared between the transport and its server handle.
struct Shared {
    id: TransportId,
    events: EventBus,
    state: watch::Sender<ConnectionState>,
    auto_open: bool,
    fail_next: AtomicBool,
    connects: AtomicUsize,
    entrypoint: Mutex<Option<EntrypointProvider>>,
    urls: Mutex<Vec<Url>>,
    sent_tx: mpsc::UnboundedSender<Value>,
}

impl std::fmt::Debug for Shared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Shared")
            .field("id", &self.id)
            .field("state", &*self.state.borrow())
            .field("auto_open", &self.auto_open)
            .field("connects", &self.connects)
            .field("urls", &self.urls)
            .finish_non_exhaustive()
    }
}

impl Shared {
    fn set_open(&self) {
        self.state.send_replace(ConnectionState::Open);
        self.events.publish(TransportEvent::Open);
    }

    fn set_closed(&self, code: Option<u16>, reason: &str) {
        let was_open = self.state.send_replace(ConnectionState::Closed) == ConnectionState::Open;
        if was_open {
            self.events.publish(TransportEvent::Close {
                code,
                reason: reason.to_string(),
            });
        }
    }

    /// Runs the entrypoint provider and records the URL it produced.
    async fn resolve_entrypoint(&self) -> Result<Url, ClientError> {
        let provider = self.entrypoint.lock().clone();
        let Some(provider) = provider else {
            return Err(ClientError::Transport("never connected".to_string()));
        };
        let url = provider().await?;
        self.urls.lock().push(url.clone());
        Ok(url)
    }
}

/// Client half of an in-memory connection.
#[derive(Debug)]
pub struct MemoryTransport {
    shared: Arc<Shared>,
    /// Serializes senders so that queued messages keep call order.
    send_order: tokio::sync::Mutex<()>,
}

/// Remote half of an in-memory connection.
#[derive(Debug)]
pub struct MemoryServer {
    shared: Arc<Shared>,
    sent_rx: mpsc::UnboundedReceiver<Value>,
}

impl MemoryTransport {
    /// Creates a connected pair.
    ///
    /// With `auto_open`, every `connect` opens immediately; otherwise the
    /// connection stays in [`ConnectionState::Connecting`] until
    /// [`MemoryServer::open`] is called.
    #[must_use]
    pub fn pair(auto_open: bool) -> (Arc<Self>, MemoryServer) {
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Closed);
        let shared = Arc::new(Shared {
            id: TransportId::new(),
            events: EventBus::new(256),
            state,
            auto_open,
            fail_next: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            entrypoint: Mutex::new(None),
            urls: Mutex::new(Vec::new()),
            sent_tx,
        });
        let transport = Arc::new(Self {
            shared: Arc::clone(&shared),
            send_order: tokio::sync::Mutex::new(()),
        });
        (transport, MemoryServer { shared, sent_rx })
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    async fn connect(&self, entrypoint: EntrypointProvider) -> Result<(), ClientError> {
        self.shared.connects.fetch_add(1, Ordering::SeqCst);
        *self.shared.entrypoint.lock() = Some(entrypoint);
        self.shared.state.send_replace(ConnectionState::Connecting);

        let url = self.shared.resolve_entrypoint().await;
        let failed = self.shared.fail_next.swap(false, Ordering::SeqCst);
        if let Err(err) = url {
            self.shared.state.send_replace(ConnectionState::Closed);
            self.shared.events.publish(TransportEvent::Error(err.to_string()));
            return Err(err);
        }
        if failed {
            self.shared.state.send_replace(ConnectionState::Closed);
            self.shared
                .events
                .publish(TransportEvent::Error("connection refused".to_string()));
            return Err(ClientError::Transport("connection refused".to_string()));
        }

        if self.shared.auto_open {
            self.shared.set_open();
            return Ok(());
        }
        let mut state = self.shared.state.subscribe();
        state
            .wait_for(|s| *s == ConnectionState::Open)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::ConnectionClosed)
    }

    async fn send(&self, message: Value) -> Result<(), ClientError> {
        let _turn = self.send_order.lock().await;
        let mut state = self.shared.state.subscribe();
        state
            .wait_for(|s| *s == ConnectionState::Open)
            .await
            .map(|_| ())
            .map_err(|_| ClientError::ConnectionClosed)?;
        self.shared
            .sent_tx
            .send(message)
            .map_err(|_| ClientError::ConnectionClosed)
    }

    async fn disconnect(&self, code: Option<u16>) {
        self.shared
            .set_closed(Some(code.unwrap_or(NORMAL_CLOSURE)), "");
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events.subscribe()
    }

    fn inbound(&self) -> InboundStream {
        self.shared.events.attach()
    }

    fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }

    fn id(&self) -> TransportId {
        self.shared.id
    }
}

impl MemoryServer {
    /// Completes a pending connection attempt.
    pub fn open(&self) {
        self.shared.set_open();
    }

    /// Drops the connection as if the network failed.
    pub fn drop_connection(&self) {
        self.shared.set_closed(None, "connection lost");
    }

    /// Re-establishes a dropped connection the way the transport's own
    /// reconnect policy would, resolving a fresh entrypoint URL first.
    ///
    /// # Errors
    ///
    /// Returns the entrypoint provider's error, or
    /// [`ClientError::Transport`] if the client never connected.
    pub async fn reconnect(&self) -> Result<Url, ClientError> {
        self.shared.state.send_replace(ConnectionState::Connecting);
        let url = self.shared.resolve_entrypoint().await?;
        self.shared.set_open();
        Ok(url)
    }

    /// Makes the next `connect` call fail.
    pub fn fail_next_connect(&self) {
        self.shared.fail_next.store(true, Ordering::SeqCst);
    }

    /// Delivers a frame to the client.
    pub fn push(&self, message: &Value) {
        self.push_text(message.to_string());
    }

    /// Delivers a raw text frame to the client.
    pub fn push_text(&self, text: impl Into<String>) {
        self.shared.events.publish(TransportEvent::Message(text.into()));
    }

    /// Waits for the next message the client transmitted.
    pub async fn next_sent(&mut self) -> Option<Value> {
        self.sent_rx.recv().await
    }

    /// Returns the next transmitted message if one is already available.
    pub fn try_next_sent(&mut self) -> Option<Value> {
        self.sent_rx.try_recv().ok()
    }

    /// URLs resolved by every connection attempt so far.
    #[must_use]
    pub fn entrypoints(&self) -> Vec<Url> {
        self.shared.urls.lock().clone()
    }

    /// Number of times `connect` was called on the client half.
    #[must_use]
    pub fn connect_count(&self) -> usize {
        self.shared.connects.load(Ordering::SeqCst)
    }

    /// Current connection state.
    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.shared.state.borrow()
    }
}
