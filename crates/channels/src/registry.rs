//! Channel registry: static configuration, live health, connector lookup.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use stocksync_core::{ChannelId, EngineError, EngineResult};

use crate::channel::{ChannelStatus, SyncChannel};
use crate::connector::ChannelConnector;
use crate::rate_limit::RateLimiter;

/// Weight of the newest sample in the exponentially weighted averages.
const EWMA_ALPHA: f64 = 0.2;

fn ewma(previous: f64, sample: f64, first: bool) -> f64 {
    if first {
        sample
    } else {
        previous * (1.0 - EWMA_ALPHA) + sample * EWMA_ALPHA
    }
}

/// Result of one inbound/outbound sync cycle, fed back into channel health.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SyncOutcome {
    pub at: DateTime<Utc>,
    /// When the cycle started reading from the channel. Becomes the next delta
    /// cursor, so records that land while a batch is still running are pulled again.
    pub watermark: DateTime<Utc>,
    /// Fully or partially successful: advances `last_successful_sync`.
    pub succeeded: bool,
    pub records: usize,
    pub failed: usize,
    pub duration_ms: u64,
}

/// Result of one active health check.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HealthReading {
    pub healthy: bool,
    pub latency_ms: f64,
}

struct Entry {
    channel: SyncChannel,
    connector: Option<Arc<dyn ChannelConnector>>,
    limiter: Arc<RateLimiter>,
}

/// Registry of synchronization channels.
///
/// Channels are registered at initialization and never removed; only their
/// status and performance fields change at runtime.
#[derive(Default)]
pub struct ChannelRegistry {
    entries: RwLock<BTreeMap<ChannelId, Entry>>,
}

impl core::fmt::Debug for ChannelRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let ids: Vec<ChannelId> = self
            .entries
            .read()
            .map(|e| e.keys().cloned().collect())
            .unwrap_or_default();
        f.debug_struct("ChannelRegistry").field("channels", &ids).finish()
    }
}

fn poisoned() -> EngineError {
    EngineError::storage("channel registry lock poisoned")
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a channel (and optionally its connector). Re-registering an id
    /// replaces its configuration but keeps the live performance snapshot.
    pub fn register(
        &self,
        channel: SyncChannel,
        connector: Option<Arc<dyn ChannelConnector>>,
    ) -> EngineResult<()> {
        channel.validate()?;
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let limiter = Arc::new(RateLimiter::new(channel.rate_limits.clone()));
        let id = channel.id.clone();

        let mut channel = channel;
        if let Some(existing) = entries.get(&id) {
            channel.performance = existing.channel.performance.clone();
        }
        entries.insert(
            id.clone(),
            Entry {
                channel,
                connector,
                limiter,
            },
        );
        debug!(channel = %id, "channel registered");
        Ok(())
    }

    pub fn get(&self, channel_id: &ChannelId) -> EngineResult<SyncChannel> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        entries
            .get(channel_id)
            .map(|e| e.channel.clone())
            .ok_or_else(|| EngineError::ChannelNotFound(channel_id.clone()))
    }

    pub fn contains(&self, channel_id: &ChannelId) -> bool {
        self.entries
            .read()
            .map(|e| e.contains_key(channel_id))
            .unwrap_or(false)
    }

    /// All channels, ordered by id.
    pub fn list(&self) -> EngineResult<Vec<SyncChannel>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries.values().map(|e| e.channel.clone()).collect())
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Change a channel's lifecycle status. Returns the previous status.
    pub fn set_status(
        &self,
        channel_id: &ChannelId,
        status: ChannelStatus,
    ) -> EngineResult<ChannelStatus> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let entry = entries
            .get_mut(channel_id)
            .ok_or_else(|| EngineError::ChannelNotFound(channel_id.clone()))?;
        let previous = entry.channel.status;
        entry.channel.status = status;
        if previous != status {
            info!(
                channel = %channel_id,
                from = previous.as_str(),
                to = status.as_str(),
                "channel status changed"
            );
        }
        Ok(previous)
    }

    pub fn connector(&self, channel_id: &ChannelId) -> EngineResult<Arc<dyn ChannelConnector>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        let entry = entries
            .get(channel_id)
            .ok_or_else(|| EngineError::ChannelNotFound(channel_id.clone()))?;
        entry
            .connector
            .clone()
            .ok_or_else(|| EngineError::ConnectorNotFound(channel_id.clone()))
    }

    pub fn rate_limiter(&self, channel_id: &ChannelId) -> EngineResult<Arc<RateLimiter>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        entries
            .get(channel_id)
            .map(|e| e.limiter.clone())
            .ok_or_else(|| EngineError::ChannelNotFound(channel_id.clone()))
    }

    /// A live connection exists: channel active, connector present and reachable,
    /// and no request cap exhausted.
    pub fn is_reachable(&self, channel_id: &ChannelId, now: DateTime<Utc>) -> bool {
        let Ok(entries) = self.entries.read() else {
            return false;
        };
        let Some(entry) = entries.get(channel_id) else {
            return false;
        };
        entry.channel.is_active()
            && entry.connector.as_ref().is_some_and(|c| c.is_reachable())
            && !entry.limiter.is_exhausted(now)
    }

    /// Channels that may receive outbound updates, excluding `exclude`.
    pub fn outbound_targets(&self, exclude: &ChannelId) -> EngineResult<Vec<ChannelId>> {
        let entries = self.entries.read().map_err(|_| poisoned())?;
        Ok(entries
            .values()
            .filter(|e| e.channel.accepts_outbound() && &e.channel.id != exclude)
            .map(|e| e.channel.id.clone())
            .collect())
    }

    /// Fold a sync cycle result into the channel's performance snapshot.
    pub fn record_sync(&self, channel_id: &ChannelId, outcome: SyncOutcome) -> EngineResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let entry = entries
            .get_mut(channel_id)
            .ok_or_else(|| EngineError::ChannelNotFound(channel_id.clone()))?;
        let perf = &mut entry.channel.performance;
        let first = perf.last_sync.is_none();

        perf.last_sync = Some(outcome.at);
        if outcome.succeeded {
            perf.last_successful_sync = Some(outcome.watermark);
        }

        let failure_ratio = if outcome.records == 0 {
            if outcome.succeeded { 0.0 } else { 1.0 }
        } else {
            outcome.failed as f64 / outcome.records as f64
        };
        perf.error_rate = ewma(perf.error_rate, failure_ratio, first);
        perf.latency_ms = ewma(perf.latency_ms, outcome.duration_ms as f64, first);
        perf.throughput = if outcome.duration_ms == 0 {
            outcome.records as f64
        } else {
            outcome.records as f64 / (outcome.duration_ms as f64 / 1000.0)
        };
        Ok(())
    }

    /// Fold a single delivery call into latency and error-rate tracking.
    pub fn record_call(&self, channel_id: &ChannelId, latency_ms: f64, success: bool) -> EngineResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let entry = entries
            .get_mut(channel_id)
            .ok_or_else(|| EngineError::ChannelNotFound(channel_id.clone()))?;
        let perf = &mut entry.channel.performance;
        perf.latency_ms = ewma(perf.latency_ms, latency_ms, perf.latency_ms == 0.0);
        perf.error_rate = ewma(perf.error_rate, if success { 0.0 } else { 1.0 }, false);
        Ok(())
    }

    pub fn record_health(&self, channel_id: &ChannelId, reading: HealthReading) -> EngineResult<()> {
        let mut entries = self.entries.write().map_err(|_| poisoned())?;
        let entry = entries
            .get_mut(channel_id)
            .ok_or_else(|| EngineError::ChannelNotFound(channel_id.clone()))?;
        let perf = &mut entry.channel.performance;
        perf.health_checks += 1;
        if reading.healthy {
            perf.healthy_checks += 1;
            perf.latency_ms = ewma(perf.latency_ms, reading.latency_ms, perf.latency_ms == 0.0);
        }
        perf.availability = perf.healthy_checks as f64 / perf.health_checks as f64 * 100.0;
        Ok(())
    }
}
