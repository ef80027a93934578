//! Endpoint-keyed store of shared multiplexers.
//!
//! [`ConnectionRegistry`] hands out one [`ChannelMultiplexer`] per endpoint
//! URL so that every caller interested in the same server shares a single
//! connection. The registry is an ordinary owned value: create one per
//! application (or per test) and pass it around.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use url::Url;

use super::multiplexer::{ChannelMultiplexer, MultiplexerOptions};
use super::token::TokenSource;
use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::transport::{ReconnectPolicy, Transport, WsTransport};

/// Builds the transport for a newly registered endpoint.
pub type TransportFactory = Arc<dyn Fn(&Url) -> Arc<dyn Transport> + Send + Sync>;

/// Store of one multiplexer per endpoint.
///
/// Entries are keyed by the exact endpoint string, created lazily and
/// never evicted.
///
/// # Concurrency
///
/// Lookups of known endpoints share a read lock. Creation happens under the
/// write lock, so concurrent first requests for the same endpoint still end
/// up with a single instance.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, Arc<ChannelMultiplexer>>>,
    tokens: Arc<dyn TokenSource>,
    factory: TransportFactory,
    options: MultiplexerOptions,
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("tokens", &self.tokens)
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Creates a registry producing WebSocket transports configured from
    /// `config`.
    #[must_use]
    pub fn new(config: &ClientConfig, tokens: Arc<dyn TokenSource>) -> Self {
        let policy = config.reconnect_policy();
        let capacity = config.event_bus_capacity;
        let factory: TransportFactory = Arc::new(move |_: &Url| -> Arc<dyn Transport> {
            Arc::new(WsTransport::new(policy, capacity))
        });
        Self::with_transport_factory(
            tokens,
            factory,
            MultiplexerOptions {
                resubscribe_on_reconnect: config.resubscribe_on_reconnect,
            },
        )
    }

    /// Creates a registry using `factory` for every new endpoint.
    #[must_use]
    pub fn with_transport_factory(
        tokens: Arc<dyn TokenSource>,
        factory: TransportFactory,
        options: MultiplexerOptions,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            tokens,
            factory,
            options,
        }
    }

    /// Creates a WebSocket registry with default reconnect settings.
    #[must_use]
    pub fn with_tokens(tokens: Arc<dyn TokenSource>) -> Self {
        let factory: TransportFactory = Arc::new(|_: &Url| -> Arc<dyn Transport> {
            Arc::new(WsTransport::new(ReconnectPolicy::default(), 1024))
        });
        Self::with_transport_factory(tokens, factory, MultiplexerOptions::default())
    }

    /// Returns the multiplexer for `endpoint`, creating it on first use.
    ///
    /// The returned instance is not connected yet; see
    /// [`Self::connect`].
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidUrl`] if `endpoint` does not parse.
    pub async fn get(&self, endpoint: &str) -> Result<Arc<ChannelMultiplexer>, ClientError> {
        if let Some(existing) = self.connections.read().await.get(endpoint) {
            return Ok(Arc::clone(existing));
        }
        let url = Url::parse(endpoint)?;

        let mut map = self.connections.write().await;
        if let Some(existing) = map.get(endpoint) {
            return Ok(Arc::clone(existing));
        }
        let transport = (self.factory)(&url);
        tracing::debug!(url = %url, transport = %transport.id(), "registering endpoint");
        let multiplexer = Arc::new(ChannelMultiplexer::new(
            url,
            Arc::clone(&self.tokens),
            transport,
            self.options,
        ));
        map.insert(endpoint.to_string(), Arc::clone(&multiplexer));
        Ok(multiplexer)
    }

    /// Returns the multiplexer for `endpoint` once it is connected and has
    /// its client id.
    ///
    /// # Errors
    ///
    /// See [`Self::get`] and [`ChannelMultiplexer::connect`].
    pub async fn connect(&self, endpoint: &str) -> Result<Arc<ChannelMultiplexer>, ClientError> {
        let multiplexer = self.get(endpoint).await?;
        multiplexer.connect().await?;
        Ok(multiplexer)
    }

    /// Disconnects every registered multiplexer.
    ///
    /// Entries stay registered, and a later [`Self::connect`] reopens them
    /// with the client id each one negotiated before.
    pub async fn disconnect_all(&self) {
        let all: Vec<_> = self.connections.read().await.values().cloned().collect();
        for multiplexer in all {
            tracing::debug!(url = %multiplexer.endpoint(), "closing endpoint");
            multiplexer.disconnect(None).await;
        }
    }

    /// Registered endpoint URLs, sorted.
    pub async fn endpoints(&self) -> Vec<String> {
        let mut endpoints: Vec<String> = self.connections.read().await.keys().cloned().collect();
        endpoints.sort();
        endpoints
    }

    /// Returns the number of registered endpoints.
    pub async fn len(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Returns `true` if no endpoint is registered.
    pub async fn is_empty(&self) -> bool {
        self.connections.read().await.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::panic, clippy::indexing_slicing)]
mod tests {
    use std::time::Duration;

    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;
    use crate::channels::StaticToken;
    use crate::transport::{MemoryServer, MemoryTransport};

    /// Registry whose transports are in-memory; the server halves are
    /// collected in creation order.
    fn memory_registry() -> (ConnectionRegistry, Arc<Mutex<Vec<MemoryServer>>>) {
        let servers = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&servers);
        let factory: TransportFactory = Arc::new(move |_: &Url| -> Arc<dyn Transport> {
            let (transport, server) = MemoryTransport::pair(true);
            sink.lock().push(server);
            transport
        });
        let registry = ConnectionRegistry::with_transport_factory(
            Arc::new(StaticToken::none()),
            factory,
            MultiplexerOptions::default(),
        );
        (registry, servers)
    }

    #[tokio::test]
    async fn same_endpoint_yields_same_instance() {
        let (registry, servers) = memory_registry();

        let Ok(a) = registry.get("ws://host.test/api/websocket").await else {
            panic!("get failed");
        };
        let Ok(b) = registry.get("ws://host.test/api/websocket").await else {
            panic!("get failed");
        };
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len().await, 1);
        assert_eq!(servers.lock().len(), 1);
    }

    #[tokio::test]
    async fn different_endpoints_are_independent() {
        let (registry, servers) = memory_registry();

        let Ok(a) = registry.get("ws://one.test/ws").await else {
            panic!("get failed");
        };
        let Ok(b) = registry.get("ws://two.test/ws").await else {
            panic!("get failed");
        };
        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(
            registry.endpoints().await,
            vec!["ws://one.test/ws".to_string(), "ws://two.test/ws".to_string()]
        );
        assert_eq!(servers.lock().len(), 2);
    }

    #[tokio::test]
    async fn concurrent_first_use_creates_one_instance() {
        let (registry, servers) = memory_registry();
        let registry = Arc::new(registry);

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                tokio::spawn(async move { registry.get("ws://race.test/ws").await })
            })
            .collect();
        let mut instances = Vec::new();
        for task in tasks {
            let Ok(Ok(instance)) = task.await else {
                panic!("get failed");
            };
            instances.push(instance);
        }
        assert!(instances.windows(2).all(|w| match w {
            [a, b] => Arc::ptr_eq(a, b),
            _ => true,
        }));
        assert_eq!(servers.lock().len(), 1);
    }

    #[tokio::test]
    async fn connect_shares_one_connection() {
        let (registry, servers) = memory_registry();
        let registry = Arc::new(registry);

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.connect("ws://shared.test/ws").await })
        };

        let request = loop {
            let next = servers.lock().first_mut().and_then(MemoryServer::try_next_sent);
            if let Some(request) = next {
                break request;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        assert_eq!(request["method"], json!("clientIdService/getId"));
        if let Some(server) = servers.lock().first() {
            server.push(&json!({"jsonrpc": "2.0", "id": request["id"].clone(), "result": ["c-1"]}));
        }

        let Ok(Ok(first)) = first.await else {
            panic!("connect failed");
        };
        let Ok(second) = registry.connect("ws://shared.test/ws").await else {
            panic!("second connect failed");
        };
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(second.client_id().as_deref(), Some("c-1"));
        assert_eq!(servers.lock().first().map(MemoryServer::connect_count), Some(1));
    }

    #[tokio::test]
    async fn invalid_endpoint_is_rejected() {
        let (registry, _servers) = memory_registry();
        assert!(matches!(
            registry.get("not a url").await,
            Err(ClientError::InvalidUrl(_))
        ));
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn disconnect_all_keeps_entries() {
        let (registry, servers) = memory_registry();
        let Ok(a) = registry.get("ws://a.test/ws").await else {
            panic!("get failed");
        };
        assert!(registry.get("ws://b.test/ws").await.is_ok());

        registry.disconnect_all().await;
        assert_eq!(registry.len().await, 2);
        let Ok(again) = registry.get("ws://a.test/ws").await else {
            panic!("get failed");
        };
        assert!(Arc::ptr_eq(&a, &again));
        assert_eq!(servers.lock().len(), 2);
    }

    #[tokio::test]
    async fn connect_reopens_after_disconnect_all() {
        let (registry, servers) = memory_registry();
        let registry = Arc::new(registry);

        let first = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move { registry.connect("ws://again.test/ws").await })
        };
        let request = loop {
            let next = servers.lock().first_mut().and_then(MemoryServer::try_next_sent);
            if let Some(request) = next {
                break request;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        };
        if let Some(server) = servers.lock().first() {
            server.push(&json!({"jsonrpc": "2.0", "id": request["id"].clone(), "result": ["c-1"]}));
        }
        let Ok(Ok(mux)) = first.await else {
            panic!("connect failed");
        };
        registry.disconnect_all().await;

        let Ok(again) = registry.connect("ws://again.test/ws").await else {
            panic!("reconnect failed");
        };
        assert!(Arc::ptr_eq(&mux, &again));
        assert_eq!(again.client_id().as_deref(), Some("c-1"));
        let servers = servers.lock();
        let Some(server) = servers.first() else {
            panic!("no transport created");
        };
        assert_eq!(server.connect_count(), 2);
        let Some(url) = server.entrypoints().pop() else {
            panic!("no entrypoint resolved");
        };
        assert!(url.as_str().ends_with("clientId=c-1"));
    }
}
