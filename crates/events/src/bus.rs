//! Publish/subscribe seam between the engine and its observers.
//!
//! The bus only distributes. Updates, conflicts and batches live in the
//! engine's store; a subscriber that falls behind or disconnects misses
//! events and never stalls a sync cycle.

use std::sync::Arc;
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::Duration;

/// Predicate a subscriber registers to receive only the messages it cares about.
pub type MessageFilter<M> = Box<dyn Fn(&M) -> bool + Send + Sync>;

/// Receiving end of one subscriber.
///
/// Sees every accepted message published after `subscribe`, in publish order.
/// Owned by a single consumer (an SSE forwarder, a test harness).
#[derive(Debug)]
pub struct Subscription<M> {
    inbox: Receiver<M>,
}

impl<M> Subscription<M> {
    pub fn new(inbox: Receiver<M>) -> Self {
        Self { inbox }
    }

    pub fn try_recv(&self) -> Result<M, TryRecvError> {
        self.inbox.try_recv()
    }

    /// Waits up to `timeout`; forwarders use the timeout tick for heartbeats.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<M, RecvTimeoutError> {
        self.inbox.recv_timeout(timeout)
    }

    /// Everything buffered so far, oldest first.
    pub fn drain(&self) -> Vec<M> {
        self.inbox.try_iter().collect()
    }
}

/// Transport behind [`crate::EventSink`].
///
/// `publish` is fallible so a broker-backed bus can report outages; the sink
/// logs those and carries on.
pub trait EventBus<M>: Send + Sync {
    type Error: core::fmt::Debug + Send + Sync + 'static;

    fn publish(&self, message: M) -> Result<(), Self::Error>;

    /// Subscribe to the messages `filter` accepts.
    fn subscribe_where(&self, filter: MessageFilter<M>) -> Subscription<M>;

    /// Subscribe to everything.
    fn subscribe(&self) -> Subscription<M>;
}

impl<M, B> EventBus<M> for Arc<B>
where
    B: EventBus<M> + ?Sized,
{
    type Error = B::Error;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        (**self).publish(message)
    }

    fn subscribe_where(&self, filter: MessageFilter<M>) -> Subscription<M> {
        (**self).subscribe_where(filter)
    }

    fn subscribe(&self) -> Subscription<M> {
        (**self).subscribe()
    }
}
