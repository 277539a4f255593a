use chrono::{DateTime, Utc};

/// A typed, observable event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (payload schema evolution)
/// - **informational** (subscribers never feed back into the engine)
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "sync.update_processed").
    fn event_type(&self) -> &'static str;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }

    /// When the event occurred (engine clock).
    fn occurred_at(&self) -> DateTime<Utc>;
}
