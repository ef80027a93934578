//! Wire protocol: JSON-RPC 2.0 envelopes, method names, channel payloads.

pub mod messages;
pub mod method;
pub mod payload;

pub use messages::{Inbound, Notification, PROTOCOL_VERSION, Request, RpcErrorObject};
pub use method::{Action, Call, Channel};
pub use payload::{LogOutput, StatusChange, SubscriptionParams, resource_id_of};
