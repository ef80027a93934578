//! Endpoint-scoped channel multiplexing.
//!
//! - [`ChannelMultiplexer`]: one connection per endpoint, client-id
//!   handshake, resource-scoped subscriptions.
//! - [`ConnectionRegistry`]: hands out one multiplexer per endpoint.
//! - [`TokenSource`]: bearer token capability used on every (re)connect.

pub mod multiplexer;
pub mod registry;
pub mod token;

pub use multiplexer::{
    CLIENT_ID_PARAM, ChannelCallback, ChannelMultiplexer, MultiplexerOptions, MultiplexerState,
    TOKEN_PARAM, build_entrypoint,
};
pub use registry::{ConnectionRegistry, TransportFactory};
pub use token::{StaticToken, TokenSource};
