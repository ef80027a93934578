//! Closed sets of wire-level method names.
//!
//! Internal code always works with these enums; the raw strings appear only
//! when an envelope is built or an inbound method is matched.

use std::fmt;

/// Server-pushed notification channels, each scoped by a resource id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    /// Resource status transitions.
    Status,
    /// Log / output lines produced by a resource.
    Log,
}

impl Channel {
    /// Every channel, in a stable order.
    pub const ALL: [Self; 2] = [Self::Status, Self::Log];

    /// Wire-level method name of the channel.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Status => "resource/statusChanged",
            Self::Log => "resource/output",
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Request/response calls issued by the client itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Call {
    /// Asks the server for the identifier of this client session.
    Handshake,
}

impl Call {
    /// Wire-level method name of the call.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Handshake => "clientIdService/getId",
        }
    }
}

impl fmt::Display for Call {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outer method used to (de)activate a channel server-side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    /// Start receiving a channel.
    Subscribe,
    /// Stop receiving a channel.
    Unsubscribe,
}

impl Action {
    /// Wire-level verb.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Subscribe => "subscribe",
            Self::Unsubscribe => "unsubscribe",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
