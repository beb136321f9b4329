//! Broadcast hub for target lifecycle events.

use std::sync::{PoisonError, RwLock};

use tokio::sync::broadcast;

use crate::traits::TargetEvent;

/// Fan-out of [`TargetEvent`]s to live subscribers.
///
/// `Closed` is latched: once published, further events are dropped. Late
/// subscribers learn about it through [`EventHub::is_closed`].
pub struct EventHub {
    closed: RwLock<bool>,
    sender: broadcast::Sender<TargetEvent>,
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}

impl EventHub {
    /// Create an empty hub.
    #[must_use]
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(1024);
        Self {
            closed: RwLock::new(false),
            sender,
        }
    }

    /// Publish an event to live subscribers. Returns `false` if the hub is
    /// already closed and the event was dropped.
    pub fn publish(&self, event: TargetEvent) -> bool {
        let mut closed = self.closed.write().unwrap_or_else(PoisonError::into_inner);
        if *closed {
            return false;
        }
        if event == TargetEvent::Closed {
            *closed = true;
        }
        // Sent under the lock so nothing follows a `Closed`.
        let _ = self.sender.send(event);
        true
    }

    /// Whether `Closed` has been published.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        *self.closed.read().unwrap_or_else(PoisonError::into_inner)
    }

    /// Receiver for live events.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<TargetEvent> {
        self.sender.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_is_latched() {
        let hub = EventHub::new();
        let mut rx = hub.subscribe();

        assert!(hub.publish(TargetEvent::Closed));
        assert!(!hub.publish(TargetEvent::Closed));
        assert!(!hub.publish(TargetEvent::LoadFinished));
        assert!(hub.is_closed());

        assert_eq!(rx.try_recv().unwrap(), TargetEvent::Closed);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_subscribers_see_events_in_order() {
        let hub = EventHub::new();
        let mut early = hub.subscribe();

        hub.publish(TargetEvent::LoadFinished);
        let mut late = hub.subscribe();
        hub.publish(TargetEvent::Closed);

        assert_eq!(early.recv().await.unwrap(), TargetEvent::LoadFinished);
        assert_eq!(early.recv().await.unwrap(), TargetEvent::Closed);
        // Only what was published after subscribing.
        assert_eq!(late.recv().await.unwrap(), TargetEvent::Closed);
        assert!(late.try_recv().is_err());
    }
}
