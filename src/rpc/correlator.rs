//! Request/response correlation over a [`Transport`].
//!
//! [`Correlator`] assigns every request a fresh id, parks a oneshot sender
//! under that id, and resolves it when the matching response arrives.
//! Inbound messages that do not answer a pending call are dispatched to the
//! handlers registered for their `method`.
//!
//! # Concurrency
//!
//! A single dispatch task consumes the transport's lossless inbound stream,
//! so responses and notifications are processed in arrival order and none
//! is skipped. Handler lists are cloned before invocation; handlers may add
//! or remove handlers (including themselves) while running.

use std::collections::HashMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use crate::error::ClientError;
use crate::protocol::{Inbound, Notification, Request};
use crate::transport::{InboundStream, Transport, TransportEvent, TransportId};

/// First id handed out by a fresh correlator.
pub const FIRST_REQUEST_ID: u64 = 100;

/// Callback invoked with the `params` of a notification.
pub type NotificationHandler = Arc<dyn Fn(&Value) + Send + Sync>;

type PendingTx = oneshot::Sender<Result<Value, ClientError>>;

/// Pending calls and notification handlers, shared with the dispatch task.
#[derive(Default)]
struct Tables {
    pending: Mutex<HashMap<String, PendingTx>>,
    handlers: Mutex<HashMap<String, Vec<NotificationHandler>>>,
}

impl Tables {
    /// Routes one inbound text frame.
    fn dispatch(&self, transport_id: TransportId, text: &str) {
        let mut msg = match Inbound::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::debug!(%transport_id, error = %e, "dropping malformed message");
                return;
            }
        };

        if let Some(id) = msg.id.take() {
            let pending = self.pending.lock().remove(&id);
            if let Some(tx) = pending {
                tracing::trace!(%transport_id, %id, "response matched");
                let _ = tx.send(msg.into_outcome());
                return;
            }
            if msg.method.is_none() {
                tracing::trace!(%transport_id, %id, "dropping response with unknown id");
                return;
            }
        }

        let Some(method) = msg.method else {
            tracing::debug!(%transport_id, "dropping message without id or method");
            return;
        };
        let snapshot = self.handlers.lock().get(&method).cloned().unwrap_or_default();
        if snapshot.is_empty() {
            tracing::trace!(%transport_id, %method, "no handler for notification");
            return;
        }

        let params = msg.params.unwrap_or(Value::Null);
        for handler in snapshot {
            if catch_unwind(AssertUnwindSafe(|| handler(&params))).is_err() {
                tracing::warn!(%transport_id, %method, "notification handler panicked");
            }
        }
    }

    /// Rejects every pending call with [`ClientError::ConnectionClosed`].
    fn reject_pending(&self) -> usize {
        let drained: Vec<PendingTx> = self.pending.lock().drain().map(|(_, tx)| tx).collect();
        let count = drained.len();
        for tx in drained {
            let _ = tx.send(Err(ClientError::ConnectionClosed));
        }
        count
    }
}

/// Removes the pending entry if the request future is dropped early.
struct PendingGuard<'a> {
    tables: &'a Tables,
    id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.tables.pending.lock().remove(&self.id);
    }
}

/// JSON-RPC correlator bound to one transport.
pub struct Correlator {
    transport: Arc<dyn Transport>,
    tables: Arc<Tables>,
    next_id: AtomicU64,
    dispatcher: JoinHandle<()>,
}

impl std::fmt::Debug for Correlator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Correlator")
            .field("transport", &self.transport)
            .field("next_id", &self.next_id)
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl Correlator {
    /// Creates a correlator and starts dispatching the transport's events.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        let tables = Arc::new(Tables::default());
        let events = transport.inbound();
        let dispatcher = tokio::spawn(dispatch_loop(
            events,
            Arc::clone(&tables),
            transport.id(),
        ));
        Self {
            transport,
            tables,
            next_id: AtomicU64::new(FIRST_REQUEST_ID),
            dispatcher,
        }
    }

    /// Returns the underlying transport.
    #[must_use]
    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }

    /// Sends a request and waits for its response.
    ///
    /// There is no built-in timeout: without a reply the future stays
    /// pending until the connection closes. See [`Self::request_timeout`].
    ///
    /// # Errors
    ///
    /// - [`ClientError::Rpc`] if the server answered with an error.
    /// - [`ClientError::ConnectionClosed`] if the connection closed first.
    /// - Any error returned by [`Transport::send`].
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst).to_string();
        let (tx, rx) = oneshot::channel();
        self.tables.pending.lock().insert(id.clone(), tx);
        let _guard = PendingGuard {
            tables: &self.tables,
            id: id.clone(),
        };

        let envelope = serde_json::to_value(Request::new(&id, method, params.as_ref()))?;
        tracing::debug!(transport_id = %self.transport.id(), %id, method, "sending request");
        self.transport.send(envelope).await?;

        rx.await.map_err(|_| ClientError::ConnectionClosed)?
    }

    /// Like [`Self::request`] but gives up after `timeout`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Timeout`] when the bound expires, plus every
    /// error [`Self::request`] can return.
    pub async fn request_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        tokio::time::timeout(timeout, self.request(method, params))
            .await
            .map_err(|_| ClientError::Timeout {
                method: method.to_string(),
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            })?
    }

    /// Sends a notification; no response is expected.
    ///
    /// # Errors
    ///
    /// Returns any error from [`Transport::send`].
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<(), ClientError> {
        let envelope = serde_json::to_value(Notification::new(method, params.as_ref()))?;
        tracing::debug!(transport_id = %self.transport.id(), method, "sending notification");
        self.transport.send(envelope).await
    }

    /// Registers `handler` for notifications named `method`.
    ///
    /// Handlers run in registration order.
    pub fn add_notification_handler(&self, method: &str, handler: NotificationHandler) {
        self.tables
            .handlers
            .lock()
            .entry(method.to_string())
            .or_default()
            .push(handler);
    }

    /// Removes the first registration of `handler` (compared by identity).
    ///
    /// Returns `true` if a registration was removed.
    pub fn remove_notification_handler(&self, method: &str, handler: &NotificationHandler) -> bool {
        let mut handlers = self.tables.handlers.lock();
        let Some(list) = handlers.get_mut(method) else {
            return false;
        };
        let Some(pos) = list.iter().position(|h| Arc::ptr_eq(h, handler)) else {
            return false;
        };
        list.remove(pos);
        if list.is_empty() {
            handlers.remove(method);
        }
        true
    }

    /// Removes every handler registered for `method`, returning how many
    /// were removed.
    pub fn remove_all_notification_handlers(&self, method: &str) -> usize {
        self.tables
            .handlers
            .lock()
            .remove(method)
            .map_or(0, |list| list.len())
    }

    /// Number of handlers registered for `method`.
    #[must_use]
    pub fn handler_count(&self, method: &str) -> usize {
        self.tables
            .handlers
            .lock()
            .get(method)
            .map_or(0, Vec::len)
    }

    /// Number of requests still waiting for a response.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.tables.pending.lock().len()
    }
}

impl Drop for Correlator {
    fn drop(&mut self) {
        self.dispatcher.abort();
    }
}

/// Consumes the transport's inbound stream until it ends.
async fn dispatch_loop(mut events: InboundStream, tables: Arc<Tables>, transport_id: TransportId) {
    while let Some(event) = events.recv().await {
        match event {
            TransportEvent::Message(text) => tables.dispatch(transport_id, &text),
            TransportEvent::Close { code, .. } => {
                let rejected = tables.reject_pending();
                if rejected > 0 {
                    tracing::warn!(%transport_id, ?code, rejected, "connection closed with calls in flight");
                }
            }
            TransportEvent::Open | TransportEvent::Error(_) => {}
        }
    }
    tables.reject_pending();
    tracing::debug!(%transport_id, "correlator dispatch stopped");
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::transport::{MemoryServer, MemoryTransport, fixed_entrypoint};

    const WAIT: Duration = Duration::from_secs(2);

    async fn connected() -> (Arc<Correlator>, MemoryServer) {
        let (transport, server) = MemoryTransport::pair(true);
        let transport: Arc<dyn Transport> = transport;
        let correlator = Arc::new(Correlator::new(Arc::clone(&transport)));
        let Ok(url) = url::Url::parse("ws://memory.test/ws") else {
            panic!("valid url");
        };
        let Ok(()) = transport.connect(fixed_entrypoint(url)).await else {
            panic!("connect failed");
        };
        (correlator, server)
    }

    fn recorder(tag: &'static str, tx: &mpsc::UnboundedSender<(String, Value)>) -> NotificationHandler {
        let tx = tx.clone();
        Arc::new(move |params: &Value| {
            let _ = tx.send((tag.to_string(), params.clone()));
        })
    }

    async fn next_sent(server: &mut MemoryServer) -> Value {
        let Ok(Some(msg)) = tokio::time::timeout(WAIT, server.next_sent()).await else {
            panic!("nothing sent");
        };
        msg
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<(String, Value)>) -> (String, Value) {
        let Ok(Some(event)) = tokio::time::timeout(WAIT, rx.recv()).await else {
            panic!("handler not invoked");
        };
        event
    }

    fn id_of(msg: &Value) -> String {
        let Some(id) = msg.get("id").and_then(Value::as_str) else {
            panic!("request without string id: {msg}");
        };
        id.to_string()
    }

    #[tokio::test]
    async fn responses_match_requests_in_any_order() {
        let (correlator, mut server) = connected().await;

        let mut calls = Vec::new();
        for n in 0..3 {
            let c = Arc::clone(&correlator);
            calls.push(tokio::spawn(async move {
                c.request("echo", Some(json!({ "n": n }))).await
            }));
        }

        let mut sent = Vec::new();
        for _ in 0..3 {
            sent.push(next_sent(&mut server).await);
        }
        for msg in sent.iter().rev() {
            server.push(&json!({
                "jsonrpc": "2.0",
                "id": id_of(msg),
                "result": msg["params"]["n"].clone(),
            }));
        }

        for (n, call) in calls.into_iter().enumerate() {
            let Ok(Ok(value)) = call.await else {
                panic!("call {n} failed");
            };
            assert_eq!(value, json!(n));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn ids_start_at_base_and_strictly_increase() {
        let (correlator, mut server) = connected().await;

        for _ in 0..4 {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move {
                let _ = c.request("noop", None).await;
            });
        }

        let mut ids = Vec::new();
        for _ in 0..4 {
            let msg = next_sent(&mut server).await;
            assert_eq!(msg["jsonrpc"], json!("2.0"));
            let Ok(id) = id_of(&msg).parse::<u64>() else {
                panic!("id is not numeric");
            };
            ids.push(id);
        }
        ids.sort_unstable();
        assert_eq!(ids, vec![100, 101, 102, 103]);
    }

    #[tokio::test]
    async fn error_response_rejects_only_that_call() {
        let (correlator, mut server) = connected().await;

        let c = Arc::clone(&correlator);
        let call = tokio::spawn(async move { c.request("resource/get", None).await });
        let msg = next_sent(&mut server).await;
        server.push(&json!({
            "jsonrpc": "2.0",
            "id": id_of(&msg),
            "error": {"code": -32000, "message": "boom", "data": {"why": "test"}},
        }));

        let Ok(Err(ClientError::Rpc { code, message, data })) = call.await else {
            panic!("expected rpc error");
        };
        assert_eq!(code, -32000);
        assert_eq!(message, "boom");
        assert_eq!(data, Some(json!({"why": "test"})));
    }

    #[tokio::test]
    async fn unknown_id_is_dropped_and_missing_result_resolves_null() {
        let (correlator, mut server) = connected().await;

        let c = Arc::clone(&correlator);
        let call = tokio::spawn(async move { c.request("ping", None).await });
        let msg = next_sent(&mut server).await;

        server.push(&json!({"jsonrpc": "2.0", "id": "999999", "result": "stale"}));
        server.push_text("{not json");
        server.push(&json!({"jsonrpc": "2.0", "id": id_of(&msg)}));

        let Ok(Ok(value)) = call.await else {
            panic!("call failed");
        };
        assert_eq!(value, Value::Null);
    }

    #[tokio::test]
    async fn notifications_reach_only_their_method_in_order() {
        let (correlator, server) = connected().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        correlator.add_notification_handler("status", recorder("first", &tx));
        correlator.add_notification_handler("status", recorder("second", &tx));
        correlator.add_notification_handler("log", recorder("log", &tx));

        server.push(&json!({"jsonrpc": "2.0", "method": "status", "params": {"v": 1}}));

        assert_eq!(next_event(&mut rx).await, ("first".to_string(), json!({"v": 1})));
        assert_eq!(next_event(&mut rx).await, ("second".to_string(), json!({"v": 1})));

        server.push(&json!({"jsonrpc": "2.0", "method": "log", "params": "line"}));
        assert_eq!(next_event(&mut rx).await, ("log".to_string(), json!("line")));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn removed_handler_is_not_invoked() {
        let (correlator, server) = connected().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let gone = recorder("gone", &tx);
        correlator.add_notification_handler("status", Arc::clone(&gone));
        correlator.add_notification_handler("sentinel", recorder("sentinel", &tx));
        assert!(correlator.remove_notification_handler("status", &gone));
        assert!(!correlator.remove_notification_handler("status", &gone));

        server.push(&json!({"jsonrpc": "2.0", "method": "status", "params": {}}));
        server.push(&json!({"jsonrpc": "2.0", "method": "sentinel", "params": {}}));

        assert_eq!(next_event(&mut rx).await.0, "sentinel");
    }

    #[tokio::test]
    async fn handler_may_unregister_itself_during_dispatch() {
        let (correlator, server) = connected().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        let slot: Arc<Mutex<Option<NotificationHandler>>> = Arc::new(Mutex::new(None));
        let once: NotificationHandler = {
            let correlator = Arc::downgrade(&correlator);
            let slot = Arc::clone(&slot);
            let tx = tx.clone();
            Arc::new(move |_params: &Value| {
                let _ = tx.send(("once".to_string(), Value::Null));
                let me = slot.lock().take();
                if let (Some(c), Some(me)) = (correlator.upgrade(), me) {
                    c.remove_notification_handler("tick", &me);
                }
            })
        };
        *slot.lock() = Some(Arc::clone(&once));
        correlator.add_notification_handler("tick", once);
        correlator.add_notification_handler("tick", recorder("always", &tx));

        server.push(&json!({"jsonrpc": "2.0", "method": "tick"}));
        server.push(&json!({"jsonrpc": "2.0", "method": "tick"}));

        assert_eq!(next_event(&mut rx).await.0, "once");
        assert_eq!(next_event(&mut rx).await.0, "always");
        assert_eq!(next_event(&mut rx).await.0, "always");
        assert_eq!(correlator.handler_count("tick"), 1);
    }

    #[tokio::test]
    async fn panicking_handler_does_not_block_others() {
        let (correlator, server) = connected().await;
        let (tx, mut rx) = mpsc::unbounded_channel();

        fn exploding(_: &Value) {
            panic!("handler failure");
        }
        correlator.add_notification_handler("status", Arc::new(exploding));
        correlator.add_notification_handler("status", recorder("survivor", &tx));

        server.push(&json!({"jsonrpc": "2.0", "method": "status", "params": 1}));
        assert_eq!(next_event(&mut rx).await, ("survivor".to_string(), json!(1)));
    }

    #[tokio::test]
    async fn remove_all_clears_method() {
        let (correlator, _server) = connected().await;
        let (tx, _rx) = mpsc::unbounded_channel();

        correlator.add_notification_handler("status", recorder("a", &tx));
        correlator.add_notification_handler("status", recorder("b", &tx));
        assert_eq!(correlator.handler_count("status"), 2);
        assert_eq!(correlator.remove_all_notification_handlers("status"), 2);
        assert_eq!(correlator.handler_count("status"), 0);
        assert_eq!(correlator.remove_all_notification_handlers("status"), 0);
    }

    #[tokio::test]
    async fn close_rejects_pending_calls() {
        let (correlator, mut server) = connected().await;

        let c = Arc::clone(&correlator);
        let call = tokio::spawn(async move { c.request("slow", None).await });
        let _ = next_sent(&mut server).await;
        server.drop_connection();

        let Ok(Err(err)) = call.await else {
            panic!("expected failure");
        };
        assert!(matches!(err, ClientError::ConnectionClosed));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn request_timeout_expires_and_cleans_up() {
        let (correlator, _server) = connected().await;

        let result = correlator
            .request_timeout("never", None, Duration::from_millis(50))
            .await;
        let Err(ClientError::Timeout { method, timeout_ms }) = result else {
            panic!("expected timeout");
        };
        assert_eq!(method, "never");
        assert_eq!(timeout_ms, 50);
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn notify_carries_no_id() {
        let (correlator, mut server) = connected().await;
        assert!(correlator.notify("subscribe", Some(json!({"x": 1}))).await.is_ok());

        let msg = next_sent(&mut server).await;
        assert_eq!(
            msg,
            json!({"jsonrpc": "2.0", "method": "subscribe", "params": {"x": 1}})
        );
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn burst_larger_than_event_capacity_is_delivered_in_full() {
        let (correlator, mut server) = connected().await;
        let (tx, mut rx) = mpsc::unbounded_channel();
        correlator.add_notification_handler("resource/output", recorder("log", &tx));

        let call = {
            let c = Arc::clone(&correlator);
            tokio::spawn(async move { c.request("ping", None).await })
        };
        let request = next_sent(&mut server).await;

        // Pushed without yielding, so the dispatcher sees the whole burst at once.
        server.push(&json!({"jsonrpc": "2.0", "id": id_of(&request), "result": "pong"}));
        for n in 0..1000 {
            server.push(&json!({
                "jsonrpc": "2.0",
                "method": "resource/output",
                "params": {"resourceId": "r", "text": n.to_string()},
            }));
        }

        let Ok(Ok(Ok(value))) = tokio::time::timeout(WAIT, call).await else {
            panic!("response lost");
        };
        assert_eq!(value, json!("pong"));
        for n in 0..1000 {
            let (_, params) = next_event(&mut rx).await;
            assert_eq!(params["text"], json!(n.to_string()));
        }
        assert!(rx.try_recv().is_err());
    }
}
