//! Repository for updates, conflicts and batches.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::Serialize;

use stocksync_core::{BatchId, ChannelId, ConflictId, EngineError, EngineResult, ProductId, UpdateId};

use crate::batch::SyncBatch;
use crate::conflict::SyncConflict;
use crate::update::InventoryUpdate;

/// Counts removed by a retention purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PurgeStats {
    pub updates: usize,
    pub conflicts: usize,
    pub batches: usize,
}

impl PurgeStats {
    pub fn total(&self) -> usize {
        self.updates + self.conflicts + self.batches
    }
}

/// Store abstraction, indexed by id, product and time.
pub trait SyncStore: Send + Sync {
    fn insert_update(&self, update: InventoryUpdate) -> EngineResult<()>;

    /// Replace a stored update.
    fn save_update(&self, update: &InventoryUpdate) -> EngineResult<()>;

    fn get_update(&self, id: UpdateId) -> EngineResult<Option<InventoryUpdate>>;

    /// Updates for `product_id`, oldest version first.
    fn updates_for_product(&self, product_id: &ProductId) -> EngineResult<Vec<InventoryUpdate>>;

    fn updates_since(&self, since: DateTime<Utc>) -> EngineResult<Vec<InventoryUpdate>>;

    /// Add `channel_id` to the update's propagated set. Returns false when it was already there.
    fn mark_propagated(&self, id: UpdateId, channel_id: &ChannelId) -> EngineResult<bool>;

    fn insert_conflict(&self, conflict: SyncConflict) -> EngineResult<()>;

    fn save_conflict(&self, conflict: &SyncConflict) -> EngineResult<()>;

    fn get_conflict(&self, id: ConflictId) -> EngineResult<Option<SyncConflict>>;

    /// Unresolved conflicts, oldest first.
    fn active_conflicts(&self) -> EngineResult<Vec<SyncConflict>>;

    fn conflicts_since(&self, since: DateTime<Utc>) -> EngineResult<Vec<SyncConflict>>;

    /// Add `channel_id` to the channels that received a conflict's resolved value.
    fn mark_resolution_propagated(&self, id: ConflictId, channel_id: &ChannelId) -> EngineResult<bool>;

    /// Insert or replace a batch.
    fn save_batch(&self, batch: &SyncBatch) -> EngineResult<()>;

    fn get_batch(&self, id: BatchId) -> EngineResult<Option<SyncBatch>>;

    /// Batches started at or after `since`, newest first.
    fn batches_since(&self, since: DateTime<Utc>, channel_id: Option<&ChannelId>) -> EngineResult<Vec<SyncBatch>>;

    /// Drop updates, resolved conflicts and finished batches older than `cutoff`.
    /// Active conflicts are always kept.
    fn purge_before(&self, cutoff: DateTime<Utc>) -> EngineResult<PurgeStats>;
}

#[derive(Debug, Default)]
struct Tables {
    updates: HashMap<UpdateId, InventoryUpdate>,
    by_product: HashMap<ProductId, BTreeSet<(u64, UpdateId)>>,
    conflicts: HashMap<ConflictId, SyncConflict>,
    batches: HashMap<BatchId, SyncBatch>,
}

/// In-memory store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySyncStore {
    tables: RwLock<Tables>,
}

impl InMemorySyncStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> EngineResult<std::sync::RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| EngineError::storage("store lock poisoned"))
    }

    fn write(&self) -> EngineResult<std::sync::RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| EngineError::storage("store lock poisoned"))
    }
}

impl SyncStore for InMemorySyncStore {
    fn insert_update(&self, update: InventoryUpdate) -> EngineResult<()> {
        let mut tables = self.write()?;
        if tables.updates.contains_key(&update.id) {
            return Err(EngineError::storage(format!("update already exists: {}", update.id)));
        }
        tables
            .by_product
            .entry(update.product_id.clone())
            .or_default()
            .insert((update.version, update.id));
        tables.updates.insert(update.id, update);
        Ok(())
    }

    fn save_update(&self, update: &InventoryUpdate) -> EngineResult<()> {
        let mut tables = self.write()?;
        match tables.updates.get_mut(&update.id) {
            Some(slot) => {
                *slot = update.clone();
                Ok(())
            }
            None => Err(EngineError::UpdateNotFound(update.id)),
        }
    }

    fn get_update(&self, id: UpdateId) -> EngineResult<Option<InventoryUpdate>> {
        Ok(self.read()?.updates.get(&id).cloned())
    }

    fn updates_for_product(&self, product_id: &ProductId) -> EngineResult<Vec<InventoryUpdate>> {
        let tables = self.read()?;
        Ok(tables
            .by_product
            .get(product_id)
            .map(|index| {
                index
                    .iter()
                    .filter_map(|(_, id)| tables.updates.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    fn updates_since(&self, since: DateTime<Utc>) -> EngineResult<Vec<InventoryUpdate>> {
        let tables = self.read()?;
        let mut updates: Vec<_> = tables
            .updates
            .values()
            .filter(|u| u.timestamp >= since)
            .cloned()
            .collect();
        updates.sort_by_key(|u| (u.timestamp, u.id));
        Ok(updates)
    }

    fn mark_propagated(&self, id: UpdateId, channel_id: &ChannelId) -> EngineResult<bool> {
        let mut tables = self.write()?;
        let update = tables
            .updates
            .get_mut(&id)
            .ok_or(EngineError::UpdateNotFound(id))?;
        Ok(update.propagated.insert(channel_id.clone()))
    }

    fn insert_conflict(&self, conflict: SyncConflict) -> EngineResult<()> {
        let mut tables = self.write()?;
        if tables.conflicts.contains_key(&conflict.id) {
            return Err(EngineError::storage(format!("conflict already exists: {}", conflict.id)));
        }
        tables.conflicts.insert(conflict.id, conflict);
        Ok(())
    }

    fn save_conflict(&self, conflict: &SyncConflict) -> EngineResult<()> {
        let mut tables = self.write()?;
        match tables.conflicts.get_mut(&conflict.id) {
            Some(slot) => {
                *slot = conflict.clone();
                Ok(())
            }
            None => Err(EngineError::ConflictNotFound(conflict.id)),
        }
    }

    fn get_conflict(&self, id: ConflictId) -> EngineResult<Option<SyncConflict>> {
        Ok(self.read()?.conflicts.get(&id).cloned())
    }

    fn active_conflicts(&self) -> EngineResult<Vec<SyncConflict>> {
        let tables = self.read()?;
        let mut active: Vec<_> = tables
            .conflicts
            .values()
            .filter(|c| c.is_active())
            .cloned()
            .collect();
        active.sort_by_key(|c| (c.detected_at, c.id));
        Ok(active)
    }

    fn conflicts_since(&self, since: DateTime<Utc>) -> EngineResult<Vec<SyncConflict>> {
        let tables = self.read()?;
        let mut conflicts: Vec<_> = tables
            .conflicts
            .values()
            .filter(|c| c.detected_at >= since)
            .cloned()
            .collect();
        conflicts.sort_by_key(|c| (c.detected_at, c.id));
        Ok(conflicts)
    }

    fn mark_resolution_propagated(&self, id: ConflictId, channel_id: &ChannelId) -> EngineResult<bool> {
        let mut tables = self.write()?;
        let conflict = tables
            .conflicts
            .get_mut(&id)
            .ok_or(EngineError::ConflictNotFound(id))?;
        Ok(conflict.propagated.insert(channel_id.clone()))
    }

    fn save_batch(&self, batch: &SyncBatch) -> EngineResult<()> {
        self.write()?.batches.insert(batch.id, batch.clone());
        Ok(())
    }

    fn get_batch(&self, id: BatchId) -> EngineResult<Option<SyncBatch>> {
        Ok(self.read()?.batches.get(&id).cloned())
    }

    fn batches_since(&self, since: DateTime<Utc>, channel_id: Option<&ChannelId>) -> EngineResult<Vec<SyncBatch>> {
        let tables = self.read()?;
        let mut batches: Vec<_> = tables
            .batches
            .values()
            .filter(|b| b.started_at >= since && channel_id.is_none_or(|c| &b.channel_id == c))
            .cloned()
            .collect();
        batches.sort_by(|a, b| b.started_at.cmp(&a.started_at).then(b.id.cmp(&a.id)));
        Ok(batches)
    }

    fn purge_before(&self, cutoff: DateTime<Utc>) -> EngineResult<PurgeStats> {
        let mut tables = self.write()?;
        let Tables {
            updates,
            by_product,
            conflicts,
            batches,
        } = &mut *tables;

        let stale: Vec<(ProductId, u64, UpdateId)> = updates
            .values()
            .filter(|u| u.timestamp < cutoff)
            .map(|u| (u.product_id.clone(), u.version, u.id))
            .collect();
        for (product, version, id) in &stale {
            updates.remove(id);
            if let Some(index) = by_product.get_mut(product) {
                index.remove(&(*version, *id));
                if index.is_empty() {
                    by_product.remove(product);
                }
            }
        }

        let conflicts_before = conflicts.len();
        conflicts.retain(|_, c| c.resolved_at.is_none_or(|at| at >= cutoff));

        let batches_before = batches.len();
        batches.retain(|_, b| b.completed_at.is_none_or(|at| at >= cutoff));

        Ok(PurgeStats {
            updates: stale.len(),
            conflicts: conflicts_before - conflicts.len(),
            batches: batches_before - batches.len(),
        })
    }
}
