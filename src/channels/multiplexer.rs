//! Per-endpoint channel multiplexer.
//!
//! [`ChannelMultiplexer`] owns one transport, builds its entrypoint URL
//! (bearer token + negotiated client id), performs the client-id handshake
//! once connected, and exposes resource-scoped subscriptions for the
//! [`Channel`]s the server pushes.
//!
//! # State machine
//!
//! ```text
//! Unconnected ──connect()──▶ Connecting ──open──▶ Connected ──handshake──▶ Ready
//! ```
//!
//! `disconnect()` returns the machine to `Unconnected`; the next `connect()`
//! opens a new connection. Transport-level reconnects do not move the
//! machine backwards. Channel
//! subscriptions are re-sent after a reconnect only when
//! [`MultiplexerOptions::resubscribe_on_reconnect`] is set.

use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OnceCell, broadcast, watch};
use tokio::task::JoinHandle;
use url::Url;

use super::token::TokenSource;
use crate::error::ClientError;
use crate::protocol::{Action, Call, Channel, SubscriptionParams, resource_id_of};
use crate::rpc::{NotificationHandler, SubscriptionService};
use crate::transport::{EntrypointProvider, Transport, TransportEvent};

/// Caller-supplied callback receiving the params of a channel notification.
pub type ChannelCallback = Arc<dyn Fn(&Value) + Send + Sync>;

/// Query parameter carrying the bearer token.
pub const TOKEN_PARAM: &str = "token";

/// Query parameter carrying the negotiated client id.
pub const CLIENT_ID_PARAM: &str = "clientId";

/// Lifecycle of a multiplexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MultiplexerState {
    /// `connect` has not succeeded yet.
    Unconnected,
    /// Waiting for the transport to open.
    Connecting,
    /// Transport open, client id not known yet.
    Connected,
    /// Client id negotiated.
    Ready,
}

/// Behaviour switches of a multiplexer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiplexerOptions {
    /// Re-send `subscribe` for every active subscription after the
    /// transport reconnects on its own.
    pub resubscribe_on_reconnect: bool,
}

/// A caller callback together with the filtering handler registered for it.
struct ActiveSubscription {
    callback: ChannelCallback,
    handler: NotificationHandler,
}

type ActiveMap = BTreeMap<(Channel, String), Vec<ActiveSubscription>>;

/// Endpoint-scoped multiplexer of resource channels over one connection.
pub struct ChannelMultiplexer {
    endpoint: Url,
    tokens: Arc<dyn TokenSource>,
    service: Arc<SubscriptionService>,
    options: MultiplexerOptions,
    state: watch::Sender<MultiplexerState>,
    /// Whether the transport was opened and not explicitly disconnected
    /// since. Held for the whole of `connect`, so concurrent callers share
    /// one attempt.
    opened: AsyncMutex<bool>,
    session: Arc<OnceCell<String>>,
    active: Arc<Mutex<ActiveMap>>,
    watcher: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for ChannelMultiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChannelMultiplexer")
            .field("endpoint", &self.endpoint.as_str())
            .field("state", &self.state())
            .field("client_id", &self.session.get())
            .field("subscriptions", &self.subscription_count())
            .finish_non_exhaustive()
    }
}

impl ChannelMultiplexer {
    /// Creates an unconnected multiplexer for `endpoint` over `transport`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(
        endpoint: Url,
        tokens: Arc<dyn TokenSource>,
        transport: Arc<dyn Transport>,
        options: MultiplexerOptions,
    ) -> Self {
        let (state, _) = watch::channel(MultiplexerState::Unconnected);
        Self {
            endpoint,
            tokens,
            service: Arc::new(SubscriptionService::new(transport)),
            options,
            state,
            opened: AsyncMutex::new(false),
            session: Arc::new(OnceCell::new()),
            active: Arc::new(Mutex::new(BTreeMap::new())),
            watcher: Mutex::new(None),
        }
    }

    /// Base endpoint URL (without token or client id).
    #[must_use]
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> MultiplexerState {
        *self.state.borrow()
    }

    /// Receiver observing lifecycle changes.
    #[must_use]
    pub fn watch_state(&self) -> watch::Receiver<MultiplexerState> {
        self.state.subscribe()
    }

    /// Client id assigned by the server, once the handshake completed.
    #[must_use]
    pub fn client_id(&self) -> Option<String> {
        self.session.get().cloned()
    }

    /// Underlying subscription service.
    #[must_use]
    pub fn service(&self) -> &SubscriptionService {
        &self.service
    }

    /// Opens the connection and negotiates the client id.
    ///
    /// Idempotent: once it succeeded, further calls return immediately
    /// without touching the transport. Concurrent callers share one attempt.
    /// After [`Self::disconnect`] the next call opens a fresh connection;
    /// the client id negotiated earlier is kept and presented again.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Transport`] if the first connection attempt fails.
    /// - [`ClientError::Rpc`] or [`ClientError::Protocol`] if the handshake
    ///   fails; the connection stays open and a later call retries only
    ///   the handshake.
    pub async fn connect(&self) -> Result<(), ClientError> {
        let mut opened = self.opened.lock().await;
        if !*opened {
            self.open().await?;
            *opened = true;
        }
        self.session.get_or_try_init(|| self.handshake()).await?;
        self.state.send_replace(MultiplexerState::Ready);
        Ok(())
    }

    async fn open(&self) -> Result<(), ClientError> {
        self.state.send_replace(MultiplexerState::Connecting);
        tracing::info!(url = %self.endpoint, "connecting");
        if let Err(e) = self.service.connect(self.entrypoint_provider()).await {
            self.state.send_replace(MultiplexerState::Unconnected);
            tracing::warn!(url = %self.endpoint, error = %e, "connect failed");
            return Err(e);
        }
        self.state.send_replace(MultiplexerState::Connected);
        self.spawn_reconnect_watcher();
        Ok(())
    }

    async fn handshake(&self) -> Result<String, ClientError> {
        let result = self.service.request(Call::Handshake.as_str(), None).await?;
        let client_id = parse_client_id(&result)?;
        tracing::info!(url = %self.endpoint, %client_id, "client id negotiated");
        Ok(client_id)
    }

    /// Builds the per-attempt URL resolver handed to the transport.
    fn entrypoint_provider(&self) -> EntrypointProvider {
        let base = self.endpoint.clone();
        let tokens = Arc::clone(&self.tokens);
        let session = Arc::clone(&self.session);
        Arc::new(move || {
            let base = base.clone();
            let tokens = Arc::clone(&tokens);
            let session = Arc::clone(&session);
            Box::pin(async move {
                let token = match tokens.token().await {
                    Ok(token) => token,
                    Err(e) => {
                        tracing::warn!(url = %base, error = %e, "no token, connecting unauthenticated");
                        None
                    }
                };
                Ok::<_, ClientError>(build_entrypoint(
                    &base,
                    token.as_deref(),
                    session.get().map(String::as_str),
                ))
            })
        })
    }

    /// Watches for reconnects and re-sends subscriptions when enabled.
    fn spawn_reconnect_watcher(&self) {
        let mut events = self.service.events();
        let service: Weak<SubscriptionService> = Arc::downgrade(&self.service);
        let active = Arc::clone(&self.active);
        let resubscribe = self.options.resubscribe_on_reconnect;
        let endpoint = self.endpoint.clone();

        let handle = tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Open) => {
                        let Some(service) = service.upgrade() else { break };
                        if !resubscribe {
                            tracing::info!(url = %endpoint, "reconnected, subscriptions left to the server");
                            continue;
                        }
                        let keys: Vec<(Channel, String)> = active.lock().keys().cloned().collect();
                        tracing::info!(url = %endpoint, count = keys.len(), "reconnected, re-sending subscriptions");
                        for (channel, resource_id) in keys {
                            let params = SubscriptionParams::scoped(channel, &resource_id);
                            if let Err(e) = service.send_action(Action::Subscribe, &params).await {
                                tracing::warn!(url = %endpoint, %channel, %resource_id, error = %e, "resubscribe failed");
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(url = %endpoint, lagged = n, "reconnect watcher lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        if let Some(previous) = self.watcher.lock().replace(handle) {
            previous.abort();
        }
    }

    /// Subscribes `callback` to `channel` notifications for `resource_id`.
    ///
    /// The callback only fires for notifications whose `resourceId` equals
    /// `resource_id`.
    ///
    /// # Errors
    ///
    /// Returns any error from sending the `subscribe` notification.
    pub async fn subscribe(
        &self,
        channel: Channel,
        resource_id: &str,
        callback: ChannelCallback,
    ) -> Result<(), ClientError> {
        let handler = scoped_handler(resource_id, Arc::clone(&callback));
        self.active
            .lock()
            .entry((channel, resource_id.to_string()))
            .or_default()
            .push(ActiveSubscription {
                callback,
                handler: Arc::clone(&handler),
            });
        tracing::debug!(url = %self.endpoint, %channel, resource_id, "subscribing");
        self.service
            .subscribe(channel, handler, &SubscriptionParams::scoped(channel, resource_id))
            .await
    }

    /// Removes a subscription created by [`Self::subscribe`] with the same
    /// `callback` (compared by identity). Unknown pairs are ignored.
    ///
    /// # Errors
    ///
    /// Returns any error from sending the `unsubscribe` notification.
    pub async fn unsubscribe(
        &self,
        channel: Channel,
        resource_id: &str,
        callback: &ChannelCallback,
    ) -> Result<(), ClientError> {
        let removed = {
            let mut active = self.active.lock();
            let key = (channel, resource_id.to_string());
            let removed = active.get_mut(&key).and_then(|list| {
                let pos = list.iter().position(|s| Arc::ptr_eq(&s.callback, callback))?;
                Some(list.remove(pos))
            });
            if active.get(&key).is_some_and(Vec::is_empty) {
                active.remove(&key);
            }
            removed
        };
        let Some(subscription) = removed else {
            tracing::debug!(url = %self.endpoint, %channel, resource_id, "no such subscription");
            return Ok(());
        };
        tracing::debug!(url = %self.endpoint, %channel, resource_id, "unsubscribing");
        self.service
            .unsubscribe(
                channel,
                &subscription.handler,
                Some(&SubscriptionParams::scoped(channel, resource_id)),
            )
            .await
    }

    /// Drops every subscription of `channel`, for all resources.
    ///
    /// # Errors
    ///
    /// Returns any error from sending the `unsubscribe` notification.
    pub async fn unsubscribe_all(&self, channel: Channel) -> Result<(), ClientError> {
        self.active.lock().retain(|(c, _), _| *c != channel);
        self.service.unsubscribe_all(channel).await
    }

    /// Subscribes to status changes of `resource_id`.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`].
    pub async fn subscribe_status(
        &self,
        resource_id: &str,
        callback: ChannelCallback,
    ) -> Result<(), ClientError> {
        self.subscribe(Channel::Status, resource_id, callback).await
    }

    /// Removes a status subscription.
    ///
    /// # Errors
    ///
    /// See [`Self::unsubscribe`].
    pub async fn unsubscribe_status(
        &self,
        resource_id: &str,
        callback: &ChannelCallback,
    ) -> Result<(), ClientError> {
        self.unsubscribe(Channel::Status, resource_id, callback).await
    }

    /// Drops every status subscription.
    ///
    /// # Errors
    ///
    /// See [`Self::unsubscribe_all`].
    pub async fn unsubscribe_all_status(&self) -> Result<(), ClientError> {
        self.unsubscribe_all(Channel::Status).await
    }

    /// Subscribes to log output of `resource_id`.
    ///
    /// # Errors
    ///
    /// See [`Self::subscribe`].
    pub async fn subscribe_log(
        &self,
        resource_id: &str,
        callback: ChannelCallback,
    ) -> Result<(), ClientError> {
        self.subscribe(Channel::Log, resource_id, callback).await
    }

    /// Removes a log subscription.
    ///
    /// # Errors
    ///
    /// See [`Self::unsubscribe`].
    pub async fn unsubscribe_log(
        &self,
        resource_id: &str,
        callback: &ChannelCallback,
    ) -> Result<(), ClientError> {
        self.unsubscribe(Channel::Log, resource_id, callback).await
    }

    /// Drops every log subscription.
    ///
    /// # Errors
    ///
    /// See [`Self::unsubscribe_all`].
    pub async fn unsubscribe_all_log(&self) -> Result<(), ClientError> {
        self.unsubscribe_all(Channel::Log).await
    }

    /// Number of active `(channel, resource, callback)` subscriptions.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.active.lock().values().map(Vec::len).sum()
    }

    /// Sends a correlated request over this endpoint's connection.
    ///
    /// # Errors
    ///
    /// See [`crate::rpc::Correlator::request`].
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.service.request(method, params).await
    }

    /// Sends a correlated request bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// See [`crate::rpc::Correlator::request_timeout`].
    pub async fn request_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        self.service.request_timeout(method, params, timeout).await
    }

    /// Closes the connection without reconnecting and returns to
    /// [`MultiplexerState::Unconnected`].
    ///
    /// In-flight calls, including a pending handshake, are rejected with
    /// [`ClientError::ConnectionClosed`]. Subscriptions stay registered.
    pub async fn disconnect(&self, code: Option<u16>) {
        if let Some(watcher) = self.watcher.lock().take() {
            watcher.abort();
        }
        // Close before taking the lock: a `connect` blocked in its handshake
        // holds it until the close rejects the call.
        self.service.disconnect(code).await;
        *self.opened.lock().await = false;
        self.state.send_replace(MultiplexerState::Unconnected);
        tracing::info!(url = %self.endpoint, "disconnected");
    }
}

impl Drop for ChannelMultiplexer {
    fn drop(&mut self) {
        if let Some(watcher) = self.watcher.get_mut().take() {
            watcher.abort();
        }
    }
}

/// Appends the token and client id query parameters to `base`.
#[must_use]
pub fn build_entrypoint(base: &Url, token: Option<&str>, client_id: Option<&str>) -> Url {
    let token = token.filter(|t| !t.is_empty());
    let client_id = client_id.filter(|id| !id.is_empty());
    let mut url = base.clone();
    if token.is_none() && client_id.is_none() {
        return url;
    }
    {
        let mut query = url.query_pairs_mut();
        if let Some(token) = token {
            query.append_pair(TOKEN_PARAM, token);
        }
        if let Some(client_id) = client_id {
            query.append_pair(CLIENT_ID_PARAM, client_id);
        }
    }
    url
}

/// Extracts the client id from a handshake result: the first element of
/// an array (a bare string is accepted too).
fn parse_client_id(result: &Value) -> Result<String, ClientError> {
    let id = match result {
        Value::Array(items) => items.first().and_then(Value::as_str),
        Value::String(s) => Some(s.as_str()),
        _ => None,
    };
    id.filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| ClientError::Protocol(format!("unexpected handshake result: {result}")))
}

/// Wraps `callback` so it only sees notifications for `resource_id`.
fn scoped_handler(resource_id: &str, callback: ChannelCallback) -> NotificationHandler {
    let resource_id = resource_id.to_string();
    Arc::new(move |params: &Value| {
        if resource_id_of(params) == Some(resource_id.as_str()) {
            callback(params);
        }
    })
}
