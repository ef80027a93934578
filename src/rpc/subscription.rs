//! Subscribe/unsubscribe façade over a [`Correlator`].
//!
//! Registering a handler and telling the server about it are always done
//! together here, so callers cannot forget either half.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::broadcast;

use super::correlator::{Correlator, NotificationHandler};
use crate::error::ClientError;
use crate::protocol::{Action, Channel, SubscriptionParams};
use crate::transport::{EntrypointProvider, Transport, TransportEvent};

/// Channel subscription service bound to one correlator and its transport.
#[derive(Debug)]
pub struct SubscriptionService {
    correlator: Correlator,
}

impl SubscriptionService {
    /// Creates a service over `transport`.
    ///
    /// Must be called from within a tokio runtime.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            correlator: Correlator::new(transport),
        }
    }

    /// Returns the underlying correlator.
    #[must_use]
    pub fn correlator(&self) -> &Correlator {
        &self.correlator
    }

    /// Registers `handler` for `channel`, then asks the server to start
    /// sending it.
    ///
    /// # Errors
    ///
    /// Returns any error from sending the `subscribe` notification. The
    /// handler stays registered in that case.
    pub async fn subscribe(
        &self,
        channel: Channel,
        handler: NotificationHandler,
        params: &SubscriptionParams,
    ) -> Result<(), ClientError> {
        self.correlator
            .add_notification_handler(channel.as_str(), handler);
        self.send_action(Action::Subscribe, params).await
    }

    /// Removes `handler` from `channel`, then tells the server.
    ///
    /// Without `params` the server is told to drop the whole channel.
    ///
    /// # Errors
    ///
    /// Returns any error from sending the `unsubscribe` notification.
    pub async fn unsubscribe(
        &self,
        channel: Channel,
        handler: &NotificationHandler,
        params: Option<&SubscriptionParams>,
    ) -> Result<(), ClientError> {
        self.correlator
            .remove_notification_handler(channel.as_str(), handler);
        let channel_only = SubscriptionParams::channel_only(channel);
        self.send_action(Action::Unsubscribe, params.unwrap_or(&channel_only))
            .await
    }

    /// Removes every handler of `channel`, then tells the server.
    ///
    /// # Errors
    ///
    /// Returns any error from sending the `unsubscribe` notification.
    pub async fn unsubscribe_all(&self, channel: Channel) -> Result<(), ClientError> {
        let removed = self
            .correlator
            .remove_all_notification_handlers(channel.as_str());
        tracing::debug!(%channel, removed, "cleared channel handlers");
        self.send_action(Action::Unsubscribe, &SubscriptionParams::channel_only(channel))
            .await
    }

    /// Sends the `action` notification only, leaving handlers untouched.
    ///
    /// # Errors
    ///
    /// Returns any error from [`Correlator::notify`].
    pub async fn send_action(
        &self,
        action: Action,
        params: &SubscriptionParams,
    ) -> Result<(), ClientError> {
        self.correlator
            .notify(action.as_str(), Some(params.to_value()?))
            .await
    }

    /// Connects the transport.
    ///
    /// # Errors
    ///
    /// See [`Transport::connect`].
    pub async fn connect(&self, entrypoint: EntrypointProvider) -> Result<(), ClientError> {
        self.correlator.transport().connect(entrypoint).await
    }

    /// Closes the transport.
    pub async fn disconnect(&self, code: Option<u16>) {
        self.correlator.transport().disconnect(code).await;
    }

    /// Sends a correlated request.
    ///
    /// # Errors
    ///
    /// See [`Correlator::request`].
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value, ClientError> {
        self.correlator.request(method, params).await
    }

    /// Sends a correlated request bounded by `timeout`.
    ///
    /// # Errors
    ///
    /// See [`Correlator::request_timeout`].
    pub async fn request_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value, ClientError> {
        self.correlator
            .request_timeout(method, params, timeout)
            .await
    }

    /// Registers a transport lifecycle listener. Inbound frames are not included.
    #[must_use]
    pub fn events(&self) -> broadcast::Receiver<TransportEvent> {
        self.correlator.transport().subscribe()
    }
}
