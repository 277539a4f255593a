//! Update Ingest: turns an inbound request into a versioned canonical update.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tracing::{debug, info};

use stocksync_channels::ChannelRegistry;
use stocksync_core::{Clock, ConflictId, EngineError, EngineResult, ProductId, VersionManager};

use crate::conflict::{CompetingValue, ConflictDetector, SyncConflict};
use crate::ledger::InventoryLedger;
use crate::store::SyncStore;
use crate::update::{Field, FieldChange, InventoryUpdate, UpdateRequest};

/// Per-product critical section.
///
/// Version stamping, the conflict scan, the commit step and the store insert
/// for one product run under its gate, so two concurrent writers always see
/// each other.
/// Different products never contend.
#[derive(Debug, Default)]
pub struct ProductGate {
    locks: Mutex<HashMap<ProductId, Arc<Mutex<()>>>>,
}

impl ProductGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with<R>(&self, product_id: &ProductId, f: impl FnOnce() -> R) -> R {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
            locks.entry(product_id.clone()).or_default().clone()
        };
        let _guard = lock.lock().unwrap_or_else(PoisonError::into_inner);
        f()
    }

    /// Forget gates nobody holds. Returns how many were dropped.
    pub fn prune(&self) -> usize {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = locks.len();
        locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - locks.len()
    }
}

/// An ingested update and the conflicts it raised.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestedUpdate {
    pub update: InventoryUpdate,
    /// Conflicts detected against this update.
    pub conflicts: Vec<SyncConflict>,
    /// Unresolved conflicts on the same fields this update joined as another contender.
    pub joined: Vec<ConflictId>,
}

pub struct UpdateIngest {
    registry: Arc<ChannelRegistry>,
    versions: Arc<VersionManager>,
    ledger: Arc<dyn InventoryLedger>,
    store: Arc<dyn SyncStore>,
    clock: Arc<dyn Clock>,
    detector: ConflictDetector,
    gate: Arc<ProductGate>,
}

impl UpdateIngest {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        versions: Arc<VersionManager>,
        ledger: Arc<dyn InventoryLedger>,
        store: Arc<dyn SyncStore>,
        clock: Arc<dyn Clock>,
        detector: ConflictDetector,
        gate: Arc<ProductGate>,
    ) -> Self {
        Self {
            registry,
            versions,
            ledger,
            store,
            clock,
            detector,
            gate,
        }
    }

    pub fn ingest(&self, request: UpdateRequest) -> EngineResult<IngestedUpdate> {
        self.ingest_and_then(request, |_| Ok(())).map(|(ingested, ())| ingested)
    }

    /// Ingest, then run `then` inside the same product critical section.
    ///
    /// `then` may amend the update. The update, its new conflicts and any
    /// conflict it joined are stored only after `then` succeeds; if it fails,
    /// the store is left as it was.
    ///
    /// Fails with `CHANNEL_NOT_FOUND` / `CHANNEL_INACTIVE` for a bad source and
    /// `VALIDATION_ERROR` for a malformed request; nothing is stored in either case.
    pub fn ingest_and_then<R>(
        &self,
        request: UpdateRequest,
        then: impl FnOnce(&mut IngestedUpdate) -> EngineResult<R>,
    ) -> EngineResult<(IngestedUpdate, R)> {
        let channel = self.registry.get(&request.channel_id)?;
        if !channel.is_active() {
            return Err(EngineError::ChannelInactive(channel.id));
        }
        request.validate()?;

        let product_id = request.product_id.clone();
        self.gate.with(&product_id, || {
            let (mut ingested, joined) = self.stamp_and_detect(&request)?;
            let extra = then(&mut ingested)?;
            self.persist(&ingested, &joined)?;
            Ok((ingested, extra))
        })
    }

    /// Build the versioned update and its conflicts. Writes nothing.
    /// Also returns the open conflicts the update joined, already extended.
    fn stamp_and_detect(&self, request: &UpdateRequest) -> EngineResult<(IngestedUpdate, Vec<SyncConflict>)> {
        let snapshot = self
            .ledger
            .snapshot(&request.product_id, request.warehouse_id.as_ref())?;

        let changes: BTreeMap<Field, FieldChange> = request
            .requested_values()
            .into_iter()
            .map(|(field, current)| {
                let previous = snapshot.as_ref().map_or(Value::Null, |s| s.value(field));
                (field, FieldChange::new(previous, current))
            })
            .collect();

        let version = self.versions.next_version(&request.product_id);
        let now = self.clock.now();
        let mut update = InventoryUpdate::new(request, changes, version, now);

        let history = self.store.updates_for_product(&update.product_id)?;
        let conflicts = self.detector.detect(&update, &history, now);

        // unresolved blocking conflicts on the same fields: join as a contender
        let mut joined = Vec::new();
        let mut extended = Vec::new();
        for mut open in self.store.active_conflicts()? {
            if open.product_id != update.product_id
                || open.warehouse_id != update.warehouse_id
                || !open.blocks_propagation()
            {
                continue;
            }
            let shared: Vec<Field> = open.fields.iter().copied().filter(|f| update.touches(*f)).collect();
            if shared.is_empty() {
                continue;
            }
            open.competing.push(CompetingValue::from_update(&update, &open.fields));
            update.withheld_fields.extend(shared);
            update.conflicts.push(open.id);
            joined.push(open.id);
            extended.push(open);
        }

        for conflict in &conflicts {
            update.conflicts.push(conflict.id);
            if conflict.blocks_propagation() {
                update.withheld_fields.extend(conflict.fields.iter().copied());
            }
        }

        Ok((
            IngestedUpdate {
                update,
                conflicts,
                joined,
            },
            extended,
        ))
    }

    fn persist(&self, ingested: &IngestedUpdate, extended: &[SyncConflict]) -> EngineResult<()> {
        let update = &ingested.update;
        self.store.insert_update(update.clone())?;
        for open in extended {
            self.store.save_conflict(open)?;
        }
        for conflict in &ingested.conflicts {
            info!(
                conflict_id = %conflict.id,
                product = %conflict.product_id,
                field = %conflict.field,
                severity = ?conflict.severity,
                "conflict detected"
            );
            self.store.insert_conflict(conflict.clone())?;
        }

        debug!(
            update_id = %update.id,
            channel = %update.source_channel,
            product = %update.product_id,
            version = update.version,
            "update ingested"
        );
        Ok(())
    }
}
