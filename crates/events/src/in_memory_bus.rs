//! Process-local bus backing the API's live event feed and the engine tests.

use std::fmt;
use std::sync::{Mutex, mpsc};

use crate::bus::{EventBus, MessageFilter, Subscription};

#[derive(Debug)]
pub enum InMemoryBusError {
    /// A publisher panicked while holding the subscriber list.
    Poisoned,
}

impl fmt::Display for InMemoryBusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InMemoryBusError::Poisoned => f.write_str("event bus subscriber list poisoned"),
        }
    }
}

impl std::error::Error for InMemoryBusError {}

struct Subscriber<M> {
    accepts: MessageFilter<M>,
    outbox: mpsc::Sender<M>,
}

/// Fan-out over std channels. Subscribers whose receiving end was dropped
/// are removed on the next publish.
pub struct InMemoryEventBus<M> {
    subscribers: Mutex<Vec<Subscriber<M>>>,
}

impl<M> InMemoryEventBus<M> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connected subscribers as of the last publish.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().map(|s| s.len()).unwrap_or(0)
    }
}

impl<M> Default for InMemoryEventBus<M> {
    fn default() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
        }
    }
}

impl<M> fmt::Debug for InMemoryEventBus<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryEventBus")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}

impl<M> EventBus<M> for InMemoryEventBus<M>
where
    M: Clone + Send + 'static,
{
    type Error = InMemoryBusError;

    fn publish(&self, message: M) -> Result<(), Self::Error> {
        let mut subscribers = self.subscribers.lock().map_err(|_| InMemoryBusError::Poisoned)?;
        let before = subscribers.len();

        // filtered-out subscribers stay registered; only a closed inbox removes one
        subscribers.retain(|s| !(s.accepts)(&message) || s.outbox.send(message.clone()).is_ok());

        let gone = before - subscribers.len();
        if gone > 0 {
            tracing::debug!(gone, remaining = subscribers.len(), "event subscribers disconnected");
        }
        Ok(())
    }

    fn subscribe_where(&self, accepts: MessageFilter<M>) -> Subscription<M> {
        let (outbox, inbox) = mpsc::channel();

        // with a poisoned list the subscription is valid but stays silent
        if let Ok(mut subscribers) = self.subscribers.lock() {
            subscribers.push(Subscriber { accepts, outbox });
        }

        Subscription::new(inbox)
    }

    fn subscribe(&self) -> Subscription<M> {
        self.subscribe_where(Box::new(|_: &M| true))
    }
}
