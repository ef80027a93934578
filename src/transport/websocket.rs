//! WebSocket transport built on `tokio-tungstenite`.
//!
//! A single background task owns the socket. It drains the outbound queue
//! only while the socket is open, which is what gives [`Transport::send`]
//! its wait-until-open and FIFO guarantees without polling.

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use super::{
    ConnectionState, EntrypointProvider, EventBus, InboundStream, NORMAL_CLOSURE, ReconnectPolicy,
    Transport, TransportEvent, TransportId,
};
use crate::error::ClientError;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Queued outbound frame and the acknowledgement sent once it is written.
#[derive(Debug)]
struct Outbound {
    text: String,
    written: oneshot::Sender<Result<(), ClientError>>,
}

type OutboundRx = mpsc::UnboundedReceiver<Outbound>;

/// How a socket session ended.
enum SessionEnd {
    /// Client asked to disconnect with this code.
    Shutdown(u16),
    /// Peer closed or the socket failed.
    Dropped { code: Option<u16>, reason: String },
}

/// Shared handles the connection task needs.
struct Driver {
    id: TransportId,
    policy: ReconnectPolicy,
    events: EventBus,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<Option<u16>>,
    entrypoint: EntrypointProvider,
}

/// WebSocket [`Transport`] with automatic reconnection.
#[derive(Debug)]
pub struct WsTransport {
    id: TransportId,
    policy: ReconnectPolicy,
    events: EventBus,
    state: watch::Sender<ConnectionState>,
    shutdown: watch::Sender<Option<u16>>,
    outbound_tx: mpsc::UnboundedSender<Outbound>,
    /// Outbound receiver while no connection task owns it.
    idle_rx: Mutex<Option<OutboundRx>>,
    task: Mutex<Option<JoinHandle<OutboundRx>>>,
}

impl WsTransport {
    /// Creates an unconnected transport.
    #[must_use]
    pub fn new(policy: ReconnectPolicy, event_capacity: usize) -> Self {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Closed);
        let (shutdown, _) = watch::channel(None);
        Self {
            id: TransportId::new(),
            policy,
            events: EventBus::new(event_capacity),
            state,
            shutdown,
            outbound_tx,
            idle_rx: Mutex::new(Some(outbound_rx)),
            task: Mutex::new(None),
        }
    }

    /// Returns the outbound queue if no connection task is running,
    /// collecting it from a task that already gave up.
    async fn reclaim_queue(&self) -> Option<OutboundRx> {
        if let Some(rx) = self.idle_rx.lock().take() {
            return Some(rx);
        }
        let finished = {
            let mut task = self.task.lock();
            match task.as_ref() {
                Some(handle) if handle.is_finished() => task.take(),
                _ => None,
            }
        };
        finished?.await.ok()
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn connect(&self, entrypoint: EntrypointProvider) -> Result<(), ClientError> {
        let Some(outbound) = self.reclaim_queue().await else {
            return Err(ClientError::Transport("already connected".to_string()));
        };

        self.shutdown.send_replace(None);
        let driver = Driver {
            id: self.id,
            policy: self.policy,
            events: self.events.clone(),
            state: self.state.clone(),
            shutdown: self.shutdown.subscribe(),
            entrypoint,
        };
        let (opened_tx, opened_rx) = oneshot::channel();
        let handle = tokio::spawn(run_connection(driver, outbound, opened_tx));
        *self.task.lock() = Some(handle);

        let result = match opened_rx.await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Transport(
                "connection task ended before opening".to_string(),
            )),
        };
        if result.is_err() {
            // The task stops right after a failed first attempt; take the
            // queue back now so a retry does not race its exit.
            let handle = self.task.lock().take();
            if let Some(handle) = handle
                && let Ok(rx) = handle.await
            {
                *self.idle_rx.lock() = Some(rx);
            }
        }
        result
    }

    async fn send(&self, message: Value) -> Result<(), ClientError> {
        let text = serde_json::to_string(&message)?;
        let (written, written_rx) = oneshot::channel();
        self.outbound_tx
            .send(Outbound { text, written })
            .map_err(|_| ClientError::ConnectionClosed)?;
        written_rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    async fn disconnect(&self, code: Option<u16>) {
        self.shutdown
            .send_replace(Some(code.unwrap_or(NORMAL_CLOSURE)));
        let handle = self.task.lock().take();
        if let Some(handle) = handle {
            match handle.await {
                Ok(outbound) => *self.idle_rx.lock() = Some(outbound),
                Err(e) => tracing::warn!(transport_id = %self.id, error = %e, "connection task failed"),
            }
        }
        self.state.send_replace(ConnectionState::Closed);
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    fn inbound(&self) -> InboundStream {
        self.events.attach()
    }

    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn id(&self) -> TransportId {
        self.id
    }
}

/// Connects, drives the socket, and reconnects until shut down or out of
/// attempts. Hands the outbound queue back when it exits so a later
/// `connect` can reuse it.
async fn run_connection(
    mut driver: Driver,
    mut outbound: OutboundRx,
    opened: oneshot::Sender<Result<(), ClientError>>,
) -> OutboundRx {
    let mut opened = Some(opened);
    let mut carry: Option<Outbound> = None;
    let mut attempt: u32 = 0;

    loop {
        driver.state.send_replace(ConnectionState::Connecting);

        let attempt_result = tokio::select! {
            res = open_socket(&driver.entrypoint) => res,
            _ = driver.shutdown.changed() => break,
        };

        match attempt_result {
            Ok(ws) => {
                attempt = 0;
                driver.state.send_replace(ConnectionState::Open);
                driver.events.publish(TransportEvent::Open);
                tracing::info!(transport_id = %driver.id, "websocket open");
                if let Some(tx) = opened.take() {
                    let _ = tx.send(Ok(()));
                }

                let end = drive_socket(ws, &mut driver, &mut outbound, &mut carry).await;
                driver.state.send_replace(ConnectionState::Closed);
                match end {
                    SessionEnd::Shutdown(code) => {
                        driver.events.publish(TransportEvent::Close {
                            code: Some(code),
                            reason: String::new(),
                        });
                        tracing::info!(transport_id = %driver.id, code, "websocket closed by client");
                        break;
                    }
                    SessionEnd::Dropped { code, reason } => {
                        tracing::warn!(transport_id = %driver.id, ?code, %reason, "websocket dropped");
                        driver
                            .events
                            .publish(TransportEvent::Close { code, reason });
                    }
                }
            }
            Err(err) => {
                driver.state.send_replace(ConnectionState::Closed);
                driver.events.publish(TransportEvent::Error(err.to_string()));
                if let Some(tx) = opened.take() {
                    tracing::warn!(transport_id = %driver.id, error = %err, "initial connect failed");
                    let _ = tx.send(Err(err));
                    break;
                }
                tracing::debug!(transport_id = %driver.id, attempt, error = %err, "reconnect attempt failed");
            }
        }

        attempt = attempt.saturating_add(1);
        let Some(delay) = driver.policy.delay_for(attempt) else {
            tracing::warn!(transport_id = %driver.id, attempt, "giving up reconnecting");
            break;
        };
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = driver.shutdown.changed() => break,
        }
    }

    driver.state.send_replace(ConnectionState::Closed);
    if let Some(item) = carry {
        let _ = item.written.send(Err(ClientError::ConnectionClosed));
    }
    outbound
}

/// Resolves the entrypoint and opens the socket.
async fn open_socket(entrypoint: &EntrypointProvider) -> Result<WsStream, ClientError> {
    let url = entrypoint().await?;
    let (ws, _response) = connect_async(url.as_str()).await?;
    Ok(ws)
}

/// Pumps frames in both directions until the session ends.
async fn drive_socket(
    ws: WsStream,
    driver: &mut Driver,
    outbound: &mut OutboundRx,
    carry: &mut Option<Outbound>,
) -> SessionEnd {
    let (mut ws_tx, mut ws_rx) = ws.split();

    if let Some(item) = carry.take() {
        if let Err(e) = ws_tx.send(Message::text(item.text.clone())).await {
            *carry = Some(item);
            driver.events.publish(TransportEvent::Error(e.to_string()));
            return SessionEnd::Dropped {
                code: None,
                reason: e.to_string(),
            };
        }
        let _ = item.written.send(Ok(()));
    }

    loop {
        tokio::select! {
            // Outgoing message from the client side
            item = outbound.recv() => {
                let Some(item) = item else {
                    return SessionEnd::Shutdown(NORMAL_CLOSURE);
                };
                match ws_tx.send(Message::text(item.text.clone())).await {
                    Ok(()) => {
                        let _ = item.written.send(Ok(()));
                    }
                    Err(e) => {
                        *carry = Some(item);
                        driver.events.publish(TransportEvent::Error(e.to_string()));
                        return SessionEnd::Dropped { code: None, reason: e.to_string() };
                    }
                }
            }
            // Incoming frame from the server
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        driver.events.publish(TransportEvent::Message(text.as_str().to_owned()));
                    }
                    Some(Ok(Message::Close(frame))) => {
                        let (code, reason) = frame
                            .map(|f| (Some(u16::from(f.code)), f.reason.as_str().to_owned()))
                            .unwrap_or((None, String::new()));
                        return SessionEnd::Dropped { code, reason };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        driver.events.publish(TransportEvent::Error(e.to_string()));
                        return SessionEnd::Dropped { code: None, reason: e.to_string() };
                    }
                    None => {
                        return SessionEnd::Dropped { code: None, reason: String::new() };
                    }
                }
            }
            // Explicit disconnect
            _ = driver.shutdown.changed() => {
                let code = (*driver.shutdown.borrow()).unwrap_or(NORMAL_CLOSURE);
                let frame = CloseFrame {
                    code: CloseCode::from(code),
                    reason: String::new().into(),
                };
                if let Err(e) = ws_tx.send(Message::Close(Some(frame))).await {
                    tracing::debug!(transport_id = %driver.id, error = %e, "close frame not sent");
                }
                return SessionEnd::Shutdown(code);
            }
        }
    }
}
