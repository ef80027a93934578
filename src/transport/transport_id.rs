//! Per-transport log tag.

use std::fmt;

/// Random tag carried by every log record of one transport.
///
/// A transport keeps its tag across reconnects, so the records of all its
/// physical sockets group under one value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransportId(uuid::Uuid);

impl TransportId {
    /// Draws a fresh tag.
    #[must_use]
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }
}

impl Default for TransportId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransportId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}
