//! Observable engine events.
//!
//! Emitted for logging, dashboards and alerting. Nothing inside the engine
//! subscribes to them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stocksync_channels::ChannelStatus;
use stocksync_core::{ChannelId, ConflictId, ProductId, RuleId, UpdateId};
use stocksync_events::Event;

use crate::batch::BatchSummary;
use crate::conflict::{ConflictSeverity, ResolutionStrategy};
use crate::rules::AlertLevel;
use crate::update::Field;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum SyncEvent {
    ChannelsInitialized {
        channels: Vec<ChannelId>,
        at: DateTime<Utc>,
    },
    UpdateProcessed {
        update_id: UpdateId,
        product_id: ProductId,
        source_channel: ChannelId,
        version: u64,
        dispatched: Vec<ChannelId>,
        queued: Vec<ChannelId>,
        conflicts: usize,
        blocked: bool,
        at: DateTime<Utc>,
    },
    SyncCompleted {
        batch: BatchSummary,
        at: DateTime<Utc>,
    },
    SyncToChannelCompleted {
        batch: BatchSummary,
        at: DateTime<Utc>,
    },
    ConflictDetected {
        conflict_id: ConflictId,
        product_id: ProductId,
        field: Field,
        severity: ConflictSeverity,
        at: DateTime<Utc>,
    },
    ConflictResolved {
        conflict_id: ConflictId,
        product_id: ProductId,
        strategy: ResolutionStrategy,
        resolved_by: String,
        resolved_value: Value,
        at: DateTime<Utc>,
    },
    SyncError {
        channel_id: ChannelId,
        code: String,
        message: String,
        retryable: bool,
        at: DateTime<Utc>,
    },
    AlertRaised {
        update_id: UpdateId,
        rule_id: RuleId,
        level: AlertLevel,
        message: String,
        at: DateTime<Utc>,
    },
    ChannelStatusChanged {
        channel_id: ChannelId,
        from: ChannelStatus,
        to: ChannelStatus,
        at: DateTime<Utc>,
    },
}

impl Event for SyncEvent {
    fn event_type(&self) -> &'static str {
        match self {
            SyncEvent::ChannelsInitialized { .. } => "sync.channels_initialized",
            SyncEvent::UpdateProcessed { .. } => "sync.update_processed",
            SyncEvent::SyncCompleted { .. } => "sync.sync_completed",
            SyncEvent::SyncToChannelCompleted { .. } => "sync.sync_to_channel_completed",
            SyncEvent::ConflictDetected { .. } => "sync.conflict_detected",
            SyncEvent::ConflictResolved { .. } => "sync.conflict_resolved",
            SyncEvent::SyncError { .. } => "sync.sync_error",
            SyncEvent::AlertRaised { .. } => "sync.alert_raised",
            SyncEvent::ChannelStatusChanged { .. } => "sync.channel_status_changed",
        }
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            SyncEvent::ChannelsInitialized { at, .. }
            | SyncEvent::UpdateProcessed { at, .. }
            | SyncEvent::SyncCompleted { at, .. }
            | SyncEvent::SyncToChannelCompleted { at, .. }
            | SyncEvent::ConflictDetected { at, .. }
            | SyncEvent::ConflictResolved { at, .. }
            | SyncEvent::SyncError { at, .. }
            | SyncEvent::AlertRaised { at, .. }
            | SyncEvent::ChannelStatusChanged { at, .. } => *at,
        }
    }
}
