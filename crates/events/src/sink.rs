//! Fire-and-forget publishing for engine components.

use std::sync::Arc;

use crate::bus::EventBus;
use crate::envelope::EventEnvelope;
use crate::event::Event;

/// Object-safe, infallible publishing surface handed to engine components.
///
/// Publishing failures are logged and dropped: events describe what already
/// happened and must never change what happens next.
pub trait EventSink<E>: Send + Sync {
    fn emit(&self, event: E);
}

impl<E, B> EventSink<E> for B
where
    E: Event,
    B: EventBus<EventEnvelope<E>>,
{
    fn emit(&self, event: E) {
        let event_type = event.event_type();
        if let Err(err) = self.publish(EventEnvelope::wrap(event)) {
            tracing::warn!(event_type, error = ?err, "failed to publish event");
        }
    }
}

/// Sink that discards every event.
#[derive(Debug, Default, Copy, Clone)]
pub struct NullSink;

impl<E: Event> EventSink<E> for NullSink {
    fn emit(&self, _event: E) {}
}

/// Convenience alias for a shared, type-erased sink.
pub type SharedSink<E> = Arc<dyn EventSink<E>>;

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use super::*;
    use crate::in_memory_bus::InMemoryEventBus;

    #[derive(Debug, Clone)]
    struct Ping(DateTime<Utc>);

    impl Event for Ping {
        fn event_type(&self) -> &'static str {
            "test.ping"
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.0
        }
    }

    #[test]
    fn bus_acts_as_sink() {
        let bus: Arc<InMemoryEventBus<EventEnvelope<Ping>>> = Arc::new(InMemoryEventBus::new());
        let sub = bus.subscribe();
        let sink: SharedSink<Ping> = bus.clone();

        sink.emit(Ping(Utc::now()));

        let envelope = sub.try_recv().unwrap();
        assert_eq!(envelope.event_type(), "test.ping");
    }
}
