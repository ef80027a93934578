//! JSON-RPC layer: request correlation and channel subscriptions.

pub mod correlator;
pub mod subscription;

pub use correlator::{Correlator, FIRST_REQUEST_ID, NotificationHandler};
pub use subscription::SubscriptionService;
