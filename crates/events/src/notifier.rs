//! Notifier: fire-and-forget publication of committed lifecycle changes.

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::bus::EventBus;
use crate::notification::{EventKind, Notification};

/// Out-of-band notification sink.
///
/// Invoked *after* the state-mutating transaction commits. Delivery is
/// best-effort and at-least-once; implementations never surface errors to
/// the caller because a committed transition must not be undone by a failed
/// publish.
pub trait Notifier: Send + Sync {
    fn notify(&self, channel_id: &str, kind: EventKind, payload: JsonValue);
}

impl<N> Notifier for std::sync::Arc<N>
where
    N: Notifier + ?Sized,
{
    fn notify(&self, channel_id: &str, kind: EventKind, payload: JsonValue) {
        (**self).notify(channel_id, kind, payload)
    }
}

/// Notifier backed by an [`EventBus`] of [`Notification`]s.
#[derive(Debug, Clone)]
pub struct BusNotifier<B> {
    bus: B,
}

impl<B> BusNotifier<B> {
    pub fn new(bus: B) -> Self {
        Self { bus }
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }
}

impl<B> Notifier for BusNotifier<B>
where
    B: EventBus<Notification>,
{
    fn notify(&self, channel_id: &str, kind: EventKind, payload: JsonValue) {
        let notification = Notification::new(channel_id, kind, payload);
        let event_id = notification.event_id();
        match self.bus.publish(notification) {
            Ok(()) => debug!(channel = channel_id, kind = %kind, %event_id, "notification published"),
            Err(err) => warn!(
                channel = channel_id,
                kind = %kind,
                error = ?err,
                "notification publish failed"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::InMemoryEventBus;

    #[test]
    fn bus_notifier_publishes_envelopes() {
        let bus: Arc<InMemoryEventBus<Notification>> = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let notifier = BusNotifier::new(bus.clone());

        notifier.notify("user:42", EventKind::JobCreated, serde_json::json!({ "id": "x" }));

        let got = sub.try_recv().unwrap();
        assert_eq!(got.channel_id(), "user:42");
        assert_eq!(got.kind(), EventKind::JobCreated);
        assert_eq!(got.payload()["id"], "x");
    }
}
