//! Event mechanics for the synchronization engine.
//!
//! Events are published for **external observers** (logging, dashboards,
//! alerting). Nothing inside the engine consumes them for control flow, so
//! publishing is fire-and-forget: see [`EventSink`].

pub mod bus;
pub mod envelope;
pub mod event;
pub mod in_memory_bus;
pub mod sink;

pub use bus::{EventBus, MessageFilter, Subscription};
pub use envelope::EventEnvelope;
pub use event::Event;
pub use in_memory_bus::{InMemoryBusError, InMemoryEventBus};
pub use sink::{EventSink, NullSink, SharedSink};
