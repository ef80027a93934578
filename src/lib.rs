//! # eventlink
//!
//! Client library for a JSON-RPC 2.0 event channel carried over a
//! persistent WebSocket connection.
//!
//! Callers subscribe to per-resource notification channels (status changes,
//! log output) and issue correlated request/response calls. One connection
//! is shared per endpoint; it reconnects on its own and re-authenticates
//! with a fresh token and the client id negotiated on first connect.
//!
//! ## Architecture
//!
//! ```text
//! Application
//!     │
//!     ├── ConnectionRegistry (channels/)    one multiplexer per endpoint
//!     ├── ChannelMultiplexer (channels/)    handshake, resource filtering
//!     │
//!     ├── SubscriptionService (rpc/)        subscribe / unsubscribe
//!     ├── Correlator (rpc/)                 request ids, handler table
//!     │
//!     ├── Transport (transport/)            connect, queue, reconnect
//!     │     ├── WsTransport                 tokio-tungstenite
//!     │     └── MemoryTransport             in-process peer
//!     │
//!     └── protocol/                         JSON-RPC frames, method names
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use eventlink::channels::{ChannelCallback, ConnectionRegistry, StaticToken};
//! use eventlink::config::ClientConfig;
//!
//! # async fn run() -> Result<(), eventlink::error::ClientError> {
//! let config = ClientConfig::from_env()?;
//! let registry = ConnectionRegistry::new(&config, Arc::new(StaticToken::from(config.token.clone())));
//! let mux = registry.connect(config.endpoint.as_str()).await?;
//!
//! let on_status: ChannelCallback = Arc::new(|params: &serde_json::Value| println!("{params}"));
//! mux.subscribe_status("resource-1", on_status).await?;
//! # Ok(())
//! # }
//! ```

pub mod channels;
pub mod config;
pub mod error;
pub mod protocol;
pub mod rpc;
pub mod transport;
