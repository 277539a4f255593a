//! Conflict Resolver: picks the winning value(s) and commits them.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::{Map, Value};
use tracing::info;

use stocksync_channels::ChannelRegistry;
use stocksync_core::{Clock, ConflictId, EngineError, EngineResult, VersionManager};

use crate::conflict::{CompetingValue, Resolution, ResolutionStrategy, SyncConflict};
use crate::ingest::ProductGate;
use crate::ledger::InventoryLedger;
use crate::store::SyncStore;
use crate::update::Field;

pub struct ConflictResolver {
    registry: Arc<ChannelRegistry>,
    versions: Arc<VersionManager>,
    ledger: Arc<dyn InventoryLedger>,
    store: Arc<dyn SyncStore>,
    clock: Arc<dyn Clock>,
    gate: Arc<ProductGate>,
}

impl ConflictResolver {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        versions: Arc<VersionManager>,
        ledger: Arc<dyn InventoryLedger>,
        store: Arc<dyn SyncStore>,
        clock: Arc<dyn Clock>,
        gate: Arc<ProductGate>,
    ) -> Self {
        Self {
            registry,
            versions,
            ledger,
            store,
            clock,
            gate,
        }
    }

    /// Resolve, commit to the ledger under a fresh version, and close the conflict.
    ///
    /// `manual_value` is required by `manual` and applies to the primary field;
    /// other contended fields fall back to last-write-wins.
    pub fn resolve(
        &self,
        conflict_id: ConflictId,
        strategy: ResolutionStrategy,
        resolved_by: &str,
        manual_value: Option<Value>,
    ) -> EngineResult<SyncConflict> {
        let product_id = self
            .store
            .get_conflict(conflict_id)?
            .ok_or(EngineError::ConflictNotFound(conflict_id))?
            .product_id;

        self.gate.with(&product_id, || {
            let mut conflict = self
                .store
                .get_conflict(conflict_id)?
                .ok_or(EngineError::ConflictNotFound(conflict_id))?;
            if !conflict.is_active() {
                return Err(EngineError::ConflictAlreadyResolved(conflict_id));
            }

            let values = self.choose(&conflict, strategy, manual_value)?;
            let version = self.versions.next_version(&conflict.product_id);
            self.ledger
                .apply(&conflict.product_id, conflict.warehouse_id.as_ref(), &values, version)?;

            let now = self.clock.now();
            conflict.resolution = Some(Resolution {
                strategy,
                resolved_by: resolved_by.to_string(),
                resolved_at: now,
                resolved_value: values.get(&conflict.field).cloned().unwrap_or(Value::Null),
                resolved_values: values,
                version,
            });
            conflict.resolved_at = Some(now);
            self.store.save_conflict(&conflict)?;

            info!(
                conflict_id = %conflict.id,
                product = %conflict.product_id,
                strategy = strategy.as_str(),
                resolved_by,
                version,
                "conflict resolved"
            );
            Ok(conflict)
        })
    }

    fn choose(
        &self,
        conflict: &SyncConflict,
        strategy: ResolutionStrategy,
        manual_value: Option<Value>,
    ) -> EngineResult<BTreeMap<Field, Value>> {
        let mut values = BTreeMap::new();
        for field in &conflict.fields {
            let contenders: Vec<&CompetingValue> = conflict
                .competing
                .iter()
                .filter(|c| c.value(*field).is_some())
                .collect();
            if contenders.is_empty() {
                continue;
            }

            let value = match strategy {
                ResolutionStrategy::LastWriteWins => latest(&contenders, *field),
                ResolutionStrategy::HighestPriority => self.highest_priority(&contenders, *field),
                ResolutionStrategy::BusinessRule => business_rule(&contenders, *field),
                ResolutionStrategy::Merge => merge(&contenders, *field),
                ResolutionStrategy::Manual if *field == conflict.field => {
                    let value = manual_value
                        .clone()
                        .ok_or_else(|| EngineError::validation("manual resolution requires a value"))?;
                    check_value(*field, &value)?;
                    value
                }
                ResolutionStrategy::Manual => latest(&contenders, *field),
            };
            values.insert(*field, value);
        }
        Ok(values)
    }

    fn highest_priority(&self, contenders: &[&CompetingValue], field: Field) -> Value {
        let priority = |c: &CompetingValue| {
            self.registry
                .get(&c.channel_id)
                .map(|ch| ch.config.priority)
                .unwrap_or(0)
        };
        contenders
            .iter()
            .max_by_key(|c| (priority(c), c.timestamp, c.version))
            .and_then(|c| c.value(field).cloned())
            .unwrap_or(Value::Null)
    }
}

fn latest(contenders: &[&CompetingValue], field: Field) -> Value {
    contenders
        .iter()
        .max_by_key(|c| (c.timestamp, c.version))
        .and_then(|c| c.value(field).cloned())
        .unwrap_or(Value::Null)
}

/// quantity: lowest (never oversell), price: highest, availability: all must agree,
/// metadata: latest.
fn business_rule(contenders: &[&CompetingValue], field: Field) -> Value {
    match field {
        Field::Quantity => contenders
            .iter()
            .filter_map(|c| c.value(field).and_then(Value::as_i64))
            .min()
            .map(Value::from)
            .unwrap_or(Value::Null),
        Field::Price => contenders
            .iter()
            .filter_map(|c| c.value(field).and_then(Value::as_f64))
            .reduce(f64::max)
            .map(Value::from)
            .unwrap_or(Value::Null),
        Field::Availability => Value::Bool(and_all(contenders, field)),
        Field::Metadata => latest(contenders, field),
    }
}

/// quantity: starting level plus every contender's delta, price: latest,
/// availability: all must agree, metadata: keys merged oldest to newest.
fn merge(contenders: &[&CompetingValue], field: Field) -> Value {
    let mut ordered = contenders.to_vec();
    ordered.sort_by_key(|c| (c.timestamp, c.version));

    match field {
        Field::Quantity => {
            let base = ordered
                .iter()
                .min_by_key(|c| c.version)
                .and_then(|c| c.changes.get(&field))
                .and_then(|change| change.previous.as_f64())
                .unwrap_or(0.0);
            let deltas: f64 = ordered
                .iter()
                .filter_map(|c| c.changes.get(&field))
                .map(|change| {
                    change.delta.unwrap_or_else(|| {
                        change.current.as_f64().unwrap_or(0.0) - change.previous.as_f64().unwrap_or(0.0)
                    })
                })
                .sum();
            Value::from((base + deltas).round().max(0.0) as i64)
        }
        Field::Price => latest(contenders, field),
        Field::Availability => Value::Bool(and_all(contenders, field)),
        Field::Metadata => {
            let mut merged = Map::new();
            for c in ordered {
                if let Some(Value::Object(m)) = c.value(field) {
                    merged.extend(m.clone());
                }
            }
            Value::Object(merged)
        }
    }
}

fn and_all(contenders: &[&CompetingValue], field: Field) -> bool {
    contenders
        .iter()
        .all(|c| c.value(field).and_then(Value::as_bool).unwrap_or(false))
}

fn check_value(field: Field, value: &Value) -> EngineResult<()> {
    let ok = match field {
        Field::Quantity => value.as_i64().is_some_and(|q| q >= 0),
        Field::Price => value.as_f64().is_some_and(|p| p.is_finite() && p >= 0.0),
        Field::Availability => value.is_boolean(),
        Field::Metadata => value.is_object(),
    };
    if ok {
        Ok(())
    } else {
        Err(EngineError::validation(format!("{value} is not a valid {field}")))
    }
}
