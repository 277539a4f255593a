//! Metrics Collector: read-only aggregation over a rolling window.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use stocksync_channels::{ChannelRegistry, ChannelStatus};
use stocksync_core::{ChannelId, Clock, EngineError, EngineResult, ProductId};

use crate::batch::{SyncBatch, SyncDirection};
use crate::conflict::SyncConflict;
use crate::propagation::DeliveryQueues;
use crate::store::SyncStore;
use crate::update::{Field, InventoryUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWindow {
    #[default]
    Hour,
    Day,
    Week,
}

impl TimeWindow {
    pub fn duration(&self) -> Duration {
        match self {
            TimeWindow::Hour => Duration::hours(1),
            TimeWindow::Day => Duration::days(1),
            TimeWindow::Week => Duration::weeks(1),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TimeWindow::Hour => "hour",
            TimeWindow::Day => "day",
            TimeWindow::Week => "week",
        }
    }
}

impl core::str::FromStr for TimeWindow {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "hour" | "1h" => Ok(TimeWindow::Hour),
            "day" | "24h" => Ok(TimeWindow::Day),
            "week" | "7d" => Ok(TimeWindow::Week),
            other => Err(EngineError::validation(format!(
                "unknown time window '{other}' (expected hour, day, week)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncMetrics {
    pub window: TimeWindow,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub system: SystemMetrics,
    pub channels: Vec<ChannelMetrics>,
    pub business: BusinessMetrics,
}

/// Totals across every channel. Rates are percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemMetrics {
    pub total_updates: usize,
    pub processed_updates: usize,
    pub success_rate: f64,
    pub avg_latency_ms: f64,
    pub conflict_rate: f64,
    pub throughput_per_minute: f64,
    pub error_rate: f64,
    pub uptime: f64,
    pub active_conflicts: usize,
    pub total_batches: usize,
    pub queued_deliveries: usize,
    pub dead_letters: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub channel_id: ChannelId,
    pub name: String,
    pub status: ChannelStatus,
    pub updates_originated: usize,
    pub inbound_batches: usize,
    pub outbound_batches: usize,
    pub records_synced: usize,
    pub records_failed: usize,
    pub success_rate: f64,
    pub latency_ms: f64,
    pub error_rate: f64,
    pub availability: f64,
    pub last_sync: Option<DateTime<Utc>>,
    pub last_successful_sync: Option<DateTime<Utc>>,
    pub queue_depth: usize,
    pub dead_letters: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BusinessMetrics {
    pub products_touched: usize,
    pub quantity_changes: usize,
    pub price_changes: usize,
    pub availability_changes: usize,
    /// Sum of quantity deltas across every update in the window.
    pub net_quantity_delta: f64,
    pub conflicts_by_severity: BTreeMap<String, usize>,
    pub resolutions_by_strategy: BTreeMap<String, usize>,
}

fn percentage(part: usize, whole: usize, empty: f64) -> f64 {
    if whole == 0 {
        empty
    } else {
        part as f64 / whole as f64 * 100.0
    }
}

pub struct MetricsCollector {
    registry: Arc<ChannelRegistry>,
    store: Arc<dyn SyncStore>,
    clock: Arc<dyn Clock>,
}

impl MetricsCollector {
    pub fn new(registry: Arc<ChannelRegistry>, store: Arc<dyn SyncStore>, clock: Arc<dyn Clock>) -> Self {
        Self { registry, store, clock }
    }

    /// Snapshot of the last `window`. Reads only.
    pub fn collect(&self, window: TimeWindow, queues: &DeliveryQueues) -> EngineResult<SyncMetrics> {
        let to = self.clock.now();
        let from = to - window.duration();

        let updates = self.store.updates_since(from)?;
        let conflicts = self.store.conflicts_since(from)?;
        let batches = self.store.batches_since(from, None)?;
        let active_conflicts = self.store.active_conflicts()?.len();
        let channels = self.registry.list()?;

        let channel_metrics: Vec<ChannelMetrics> = channels
            .iter()
            .map(|channel| {
                let own: Vec<&SyncBatch> = batches.iter().filter(|b| b.channel_id == channel.id).collect();
                let synced: usize = own.iter().map(|b| b.successful_records).sum();
                let failed: usize = own.iter().map(|b| b.failed_records).sum();
                ChannelMetrics {
                    channel_id: channel.id.clone(),
                    name: channel.name.clone(),
                    status: channel.status,
                    updates_originated: updates.iter().filter(|u| u.source_channel == channel.id).count(),
                    inbound_batches: own.iter().filter(|b| b.direction == SyncDirection::Inbound).count(),
                    outbound_batches: own.iter().filter(|b| b.direction == SyncDirection::Outbound).count(),
                    records_synced: synced,
                    records_failed: failed,
                    success_rate: percentage(synced, synced + failed, 100.0),
                    latency_ms: channel.performance.latency_ms,
                    error_rate: channel.performance.error_rate * 100.0,
                    availability: channel.performance.availability,
                    last_sync: channel.performance.last_sync,
                    last_successful_sync: channel.performance.last_successful_sync,
                    queue_depth: queues.depth(&channel.id),
                    dead_letters: queues.dead_letters(&channel.id).len(),
                }
            })
            .collect();

        let processed: usize = batches.iter().map(|b| b.processed_records).sum();
        let successful: usize = batches.iter().map(|b| b.successful_records).sum();
        let failed: usize = batches.iter().map(|b| b.failed_records).sum();
        let n = channels.len().max(1) as f64;
        let minutes = window.duration().num_minutes().max(1) as f64;

        let system = SystemMetrics {
            total_updates: updates.len(),
            processed_updates: updates.iter().filter(|u| u.processed).count(),
            success_rate: percentage(successful, processed, 100.0),
            avg_latency_ms: channels.iter().map(|c| c.performance.latency_ms).sum::<f64>() / n,
            conflict_rate: percentage(conflicts.len(), updates.len(), 0.0),
            throughput_per_minute: updates.len() as f64 / minutes,
            error_rate: percentage(failed, processed, 0.0),
            uptime: if channels.is_empty() {
                100.0
            } else {
                channels.iter().map(|c| c.performance.availability).sum::<f64>() / n
            },
            active_conflicts,
            total_batches: batches.len(),
            queued_deliveries: queues.total_depth(),
            dead_letters: queues.dead_letter_count(),
        };

        Ok(SyncMetrics {
            window,
            from,
            to,
            system,
            channels: channel_metrics,
            business: business_metrics(&updates, &conflicts),
        })
    }
}

fn business_metrics(updates: &[InventoryUpdate], conflicts: &[SyncConflict]) -> BusinessMetrics {
    let mut metrics = BusinessMetrics::default();
    let mut products: BTreeSet<&ProductId> = BTreeSet::new();

    for update in updates {
        products.insert(&update.product_id);
        if let Some(change) = update.changes.get(&Field::Quantity) {
            metrics.quantity_changes += 1;
            metrics.net_quantity_delta += change.delta.unwrap_or(0.0);
        }
        if update.touches(Field::Price) {
            metrics.price_changes += 1;
        }
        if update.touches(Field::Availability) {
            metrics.availability_changes += 1;
        }
    }
    metrics.products_touched = products.len();

    for conflict in conflicts {
        let severity = serde_json::to_value(conflict.severity)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .unwrap_or_default();
        *metrics.conflicts_by_severity.entry(severity).or_default() += 1;
        if let Some(resolution) = &conflict.resolution {
            *metrics
                .resolutions_by_strategy
                .entry(resolution.strategy.as_str().to_string())
                .or_default() += 1;
        }
    }
    metrics
}
