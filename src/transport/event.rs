//! Transport events and how they reach their consumers.
//!
//! A transport produces two kinds of events: lifecycle changes (open, close,
//! error) and inbound text frames. They travel on two paths:
//!
//! - the **inbound stream**: every event, frames included, in production
//!   order, over an unbounded `mpsc` channel to the single attached consumer
//!   (the correlator). Nothing is dropped or overwritten here.
//! - the **lifecycle broadcast**: open/close/error only, fanned out to any
//!   number of listeners. Listeners that fall behind by more than the
//!   capacity miss the oldest lifecycle events.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};

/// Lifecycle change or inbound frame observed on a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// The connection reached the open state.
    Open,
    /// A text frame arrived.
    Message(String),
    /// An open connection closed.
    Close {
        /// Close code, when the peer or the client supplied one.
        code: Option<u16>,
        /// Close reason (may be empty).
        reason: String,
    },
    /// A connection attempt failed or the socket reported an error.
    Error(String),
}

impl TransportEvent {
    /// `true` for everything except inbound frames.
    #[must_use]
    pub const fn is_lifecycle(&self) -> bool {
        !matches!(self, Self::Message(_))
    }
}

/// Ordered, lossless stream of every event, as seen by the attached consumer.
pub type InboundStream = mpsc::UnboundedReceiver<TransportEvent>;

/// Routes a transport's events to the inbound consumer and the lifecycle
/// listeners.
///
/// Cloning yields a handle to the same routes.
#[derive(Debug, Clone)]
pub struct EventBus {
    lifecycle: broadcast::Sender<TransportEvent>,
    consumer: Arc<Mutex<Option<mpsc::UnboundedSender<TransportEvent>>>>,
}

impl EventBus {
    /// Creates a bus whose lifecycle broadcast holds `capacity` events
    /// (at least one).
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (lifecycle, _) = broadcast::channel(capacity.max(1));
        Self {
            lifecycle,
            consumer: Arc::new(Mutex::new(None)),
        }
    }

    /// Routes `event`: frames go to the inbound consumer only, lifecycle
    /// events go to the consumer and to every listener.
    ///
    /// Events produced while no consumer is attached are not buffered for a
    /// later one.
    pub fn publish(&self, event: TransportEvent) {
        if event.is_lifecycle() {
            let _ = self.lifecycle.send(event.clone());
        }
        if let Some(consumer) = self.consumer.lock().as_ref() {
            let _ = consumer.send(event);
        }
    }

    /// Attaches the inbound consumer, detaching the previous one (whose
    /// stream then ends).
    #[must_use]
    pub fn attach(&self) -> InboundStream {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.consumer.lock() = Some(tx);
        rx
    }

    /// Registers a lifecycle listener. Dropping the receiver removes it.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.lifecycle.subscribe()
    }

    /// Number of lifecycle listeners.
    #[must_use]
    pub fn receiver_count(&self) -> usize {
        self.lifecycle.receiver_count()
    }
}

#[cfg(test)]
#[allow(clippy::panic)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_bypass_lifecycle_listeners() {
        let bus = EventBus::new(16);
        let mut inbound = bus.attach();
        let mut lifecycle = bus.subscribe();

        bus.publish(TransportEvent::Open);
        bus.publish(TransportEvent::Message("hello".to_string()));

        assert_eq!(inbound.recv().await, Some(TransportEvent::Open));
        assert_eq!(
            inbound.recv().await,
            Some(TransportEvent::Message("hello".to_string()))
        );
        assert!(matches!(lifecycle.recv().await, Ok(TransportEvent::Open)));
        assert!(lifecycle.try_recv().is_err());
    }

    #[tokio::test]
    async fn inbound_stream_keeps_bursts_beyond_capacity() {
        let bus = EventBus::new(4);
        let mut inbound = bus.attach();

        for n in 0..1000 {
            bus.publish(TransportEvent::Message(n.to_string()));
        }
        for n in 0..1000 {
            assert_eq!(inbound.recv().await, Some(TransportEvent::Message(n.to_string())));
        }
    }

    #[tokio::test]
    async fn attaching_again_ends_previous_stream() {
        let bus = EventBus::new(4);
        let mut first = bus.attach();
        let mut second = bus.attach();

        bus.publish(TransportEvent::Open);
        assert_eq!(first.recv().await, None);
        assert_eq!(second.recv().await, Some(TransportEvent::Open));
    }

    #[test]
    fn dropping_receiver_removes_listener() {
        let bus = EventBus::new(16);
        let rx1 = bus.subscribe();
        let _rx2 = bus.subscribe();
        assert_eq!(bus.receiver_count(), 2);

        drop(rx1);
        assert_eq!(bus.receiver_count(), 1);
    }

    #[test]
    fn zero_capacity_is_clamped() {
        let bus = EventBus::new(0);
        let mut rx = bus.subscribe();
        bus.publish(TransportEvent::Open);
        assert!(matches!(rx.try_recv(), Ok(TransportEvent::Open)));
    }
}
