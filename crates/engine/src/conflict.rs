//! Conflict model and the Conflict Detector.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use stocksync_core::{ChannelId, ConflictId, ProductId, UpdateId, WarehouseId};

use crate::update::{Field, FieldChange, InventoryUpdate};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    ConcurrentUpdate,
    DataMismatch,
    VersionConflict,
    BusinessRule,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictSeverity {
    Low,
    Medium,
    High,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    LastWriteWins,
    HighestPriority,
    BusinessRule,
    Merge,
    Manual,
}

impl ResolutionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResolutionStrategy::LastWriteWins => "last_write_wins",
            ResolutionStrategy::HighestPriority => "highest_priority",
            ResolutionStrategy::BusinessRule => "business_rule",
            ResolutionStrategy::Merge => "merge",
            ResolutionStrategy::Manual => "manual",
        }
    }
}

/// One side of a conflict: what a channel wrote, when, at which version.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompetingValue {
    pub channel_id: ChannelId,
    pub update_id: UpdateId,
    /// Changes to the contended fields only.
    pub changes: BTreeMap<Field, FieldChange>,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
}

impl CompetingValue {
    pub(crate) fn from_update(update: &InventoryUpdate, fields: &[Field]) -> Self {
        Self {
            channel_id: update.source_channel.clone(),
            update_id: update.id,
            changes: fields
                .iter()
                .filter_map(|f| update.changes.get(f).map(|c| (*f, c.clone())))
                .collect(),
            timestamp: update.timestamp,
            version: update.version,
        }
    }

    pub fn value(&self, field: Field) -> Option<&Value> {
        self.changes.get(&field).map(|c| &c.current)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub strategy: ResolutionStrategy,
    pub resolved_by: String,
    pub resolved_at: DateTime<Utc>,
    /// Value chosen for the primary contended field.
    pub resolved_value: Value,
    /// Values chosen for every contended field.
    pub resolved_values: BTreeMap<Field, Value>,
    /// Version stamped on the committed outcome.
    pub version: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncConflict {
    pub id: ConflictId,
    pub conflict_type: ConflictType,
    pub severity: ConflictSeverity,
    pub product_id: ProductId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse_id: Option<WarehouseId>,
    /// First contended field in canonical order.
    pub field: Field,
    /// Every contended field.
    pub fields: Vec<Field>,
    /// Earlier update first, newly ingested update last.
    pub competing: Vec<CompetingValue>,
    pub detected_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<Resolution>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_at: Option<DateTime<Utc>>,
    /// Channels that have received the resolved value.
    #[serde(default)]
    pub propagated: BTreeSet<ChannelId>,
}

impl SyncConflict {
    pub fn is_active(&self) -> bool {
        self.resolved_at.is_none()
    }

    /// Low-severity and version conflicts are settled by the auto-resolve sweep.
    pub fn is_auto_resolvable(&self) -> bool {
        self.severity == ConflictSeverity::Low || self.conflict_type == ConflictType::VersionConflict
    }

    /// Unresolved conflicts that hold their fields back from propagation.
    pub fn blocks_propagation(&self) -> bool {
        self.is_active() && !self.is_auto_resolvable()
    }

    /// Strategy used when a caller does not name one: auto-resolvable conflicts
    /// settle by last-write-wins, everything else waits for an operator.
    pub fn default_strategy(&self) -> ResolutionStrategy {
        if self.is_auto_resolvable() {
            ResolutionStrategy::LastWriteWins
        } else {
            ResolutionStrategy::Manual
        }
    }

    pub fn involves(&self, update_id: UpdateId) -> bool {
        self.competing.iter().any(|c| c.update_id == update_id)
    }
}

/// Scans recent updates of the same product for overlapping-field writes.
#[derive(Debug, Clone)]
pub struct ConflictDetector {
    window: Duration,
}

impl ConflictDetector {
    pub fn new(window: Duration) -> Self {
        Self { window }
    }

    pub fn window(&self) -> Duration {
        self.window
    }

    /// Conflicts raised by `update` against `history` (other updates of the same
    /// product). Only evaluated from the new update's side: one conflict per
    /// overlapping pair within the window.
    pub fn detect(
        &self,
        update: &InventoryUpdate,
        history: &[InventoryUpdate],
        detected_at: DateTime<Utc>,
    ) -> Vec<SyncConflict> {
        let mut conflicts: Vec<SyncConflict> = history
            .iter()
            .filter(|other| other.id != update.id && other.product_id == update.product_id)
            .filter(|other| (update.timestamp - other.timestamp).abs() <= self.window)
            .filter_map(|other| {
                let fields = overlap(update, other);
                if fields.is_empty() {
                    return None;
                }
                let severity = classify(update, other, &fields);
                Some(self.conflict(ConflictType::ConcurrentUpdate, severity, update, other, fields, detected_at))
            })
            .collect();

        if conflicts.is_empty() {
            if let Some(conflict) = self.version_conflict(update, history, detected_at) {
                conflicts.push(conflict);
            }
        }
        conflicts
    }

    /// The source wrote on top of a stale view of the product.
    fn version_conflict(
        &self,
        update: &InventoryUpdate,
        history: &[InventoryUpdate],
        detected_at: DateTime<Utc>,
    ) -> Option<SyncConflict> {
        let base = update.base_version?;
        let latest = history
            .iter()
            .filter(|other| other.id != update.id && other.version < update.version)
            .filter(|other| other.version > base)
            .max_by_key(|other| other.version)?;

        let fields = overlap(update, latest);
        if fields.is_empty() {
            return None;
        }
        Some(self.conflict(
            ConflictType::VersionConflict,
            ConflictSeverity::Low,
            update,
            latest,
            fields,
            detected_at,
        ))
    }

    fn conflict(
        &self,
        conflict_type: ConflictType,
        severity: ConflictSeverity,
        update: &InventoryUpdate,
        other: &InventoryUpdate,
        fields: Vec<Field>,
        detected_at: DateTime<Utc>,
    ) -> SyncConflict {
        SyncConflict {
            id: ConflictId::new(),
            conflict_type,
            severity,
            product_id: update.product_id.clone(),
            warehouse_id: update.warehouse_id.clone(),
            field: fields[0],
            competing: vec![
                CompetingValue::from_update(other, &fields),
                CompetingValue::from_update(update, &fields),
            ],
            fields,
            detected_at,
            resolution: None,
            resolved_at: None,
            propagated: BTreeSet::new(),
        }
    }
}

fn overlap(a: &InventoryUpdate, b: &InventoryUpdate) -> Vec<Field> {
    Field::ALL
        .into_iter()
        .filter(|f| a.touches(*f) && b.touches(*f))
        .collect()
}

fn classify(a: &InventoryUpdate, b: &InventoryUpdate, fields: &[Field]) -> ConflictSeverity {
    if fields.iter().all(|f| a.current_value(*f) == b.current_value(*f)) {
        ConflictSeverity::Low
    } else {
        ConflictSeverity::Medium
    }
}
