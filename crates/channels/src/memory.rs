//! In-memory connector for tests/dev.
//!
//! Stands in for a real channel: holds an inbound feed, records everything
//! sent to it, and can be told to go offline or fail the next calls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::connector::{ChannelConnector, ConnectorError, ExternalRecord};

#[derive(Debug)]
pub struct InMemoryConnector {
    name: String,
    feed: Mutex<Vec<(DateTime<Utc>, ExternalRecord)>>,
    sent: Mutex<Vec<Vec<ExternalRecord>>>,
    reachable: AtomicBool,
    send_failures: Mutex<VecDeque<ConnectorError>>,
    fetch_failures: Mutex<VecDeque<ConnectorError>>,
    fetch_calls: AtomicUsize,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryConnector {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            feed: Mutex::new(Vec::new()),
            sent: Mutex::new(Vec::new()),
            reachable: AtomicBool::new(true),
            send_failures: Mutex::new(VecDeque::new()),
            fetch_failures: Mutex::new(VecDeque::new()),
            fetch_calls: AtomicUsize::new(0),
            latency: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Add a record to the channel's inbound feed, changed at `at`.
    pub fn push_inbound(&self, at: DateTime<Utc>, record: ExternalRecord) {
        self.feed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((at, record));
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Fail the next `send_updates` call with `error`.
    pub fn fail_next_send(&self, error: ConnectorError) {
        self.send_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Fail the next `fetch_updates` call with `error`.
    pub fn fail_next_fetch(&self, error: ConnectorError) {
        self.fetch_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(error);
    }

    /// Simulated call latency.
    pub fn set_latency(&self, latency: Option<Duration>) {
        *self.latency.lock().unwrap_or_else(PoisonError::into_inner) = latency;
    }

    /// Every successful `send_updates` call, in order.
    pub fn sent_batches(&self) -> Vec<Vec<ExternalRecord>> {
        self.sent.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn sent_records(&self) -> Vec<ExternalRecord> {
        self.sent_batches().into_iter().flatten().collect()
    }

    pub fn fetch_calls(&self) -> usize {
        self.fetch_calls.load(Ordering::SeqCst)
    }

    async fn simulate_latency(&self) {
        let latency = *self.latency.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }
}

#[async_trait]
impl ChannelConnector for InMemoryConnector {
    async fn fetch_updates(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExternalRecord>, ConnectorError> {
        self.fetch_calls.fetch_add(1, Ordering::SeqCst);
        self.simulate_latency().await;

        if !self.is_reachable() {
            return Err(ConnectorError::Unavailable(format!("{} is offline", self.name)));
        }
        let scripted = self
            .fetch_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        let feed = self.feed.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(feed
            .iter()
            .filter(|(at, _)| since.is_none_or(|s| *at > s))
            .map(|(_, r)| r.clone())
            .collect())
    }

    async fn send_updates(&self, records: Vec<ExternalRecord>) -> Result<(), ConnectorError> {
        self.simulate_latency().await;

        if !self.is_reachable() {
            return Err(ConnectorError::Unavailable(format!("{} is offline", self.name)));
        }
        let scripted = self
            .send_failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front();
        if let Some(err) = scripted {
            return Err(err);
        }

        self.sent
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(records);
        Ok(())
    }

    fn is_reachable(&self) -> bool {
        self.reachable.load(Ordering::SeqCst)
    }
}
