//! Batch Processor: bounded inbound and outbound sync cycles with per-record accounting.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use stocksync_channels::{ChannelRegistry, ConnectorError, ErrorKind, SyncChannel, SyncOutcome};
use stocksync_core::{BatchId, ChannelId, Clock, EngineError, EngineResult, ProductId, UpdateId};
use stocksync_events::SharedSink;

use crate::events::SyncEvent;
use crate::propagation::{Delivery, Propagator};
use crate::store::SyncStore;
use crate::update::{UpdateRequest, UpdateSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncDirection {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Partial,
}

/// A failure recorded against a batch, optionally pinned to one record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncError {
    pub error_type: ErrorKind,
    pub code: String,
    pub message: String,
    pub retryable: bool,
    pub retry_count: u32,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub record_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_id: Option<ProductId>,
}

impl SyncError {
    pub fn from_engine(err: &EngineError, at: DateTime<Utc>) -> Self {
        let error_type = match err {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Storage(_) | EngineError::Ledger(_) => ErrorKind::System,
            _ => ErrorKind::BusinessLogic,
        };
        Self {
            error_type,
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: false,
            retry_count: 0,
            timestamp: at,
            record_index: None,
            product_id: None,
        }
    }

    pub fn from_connector(err: &ConnectorError, at: DateTime<Utc>) -> Self {
        Self {
            error_type: err.kind(),
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
            retry_count: 0,
            timestamp: at,
            record_index: None,
            product_id: None,
        }
    }

    pub fn business(code: &str, message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            error_type: ErrorKind::BusinessLogic,
            code: code.to_string(),
            message: message.into(),
            retryable: false,
            retry_count: 0,
            timestamp: at,
            record_index: None,
            product_id: None,
        }
    }

    pub fn at_record(mut self, index: usize, product_id: Option<ProductId>) -> Self {
        self.record_index = Some(index);
        self.product_id = product_id;
        self
    }

    pub fn with_retries(mut self, retry_count: u32) -> Self {
        self.retry_count = retry_count;
        self
    }
}

/// One bounded execution of an inbound or outbound cycle for one channel.
///
/// At completion `processed_records == successful_records + failed_records`,
/// and `completed` implies no failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncBatch {
    pub id: BatchId,
    pub channel_id: ChannelId,
    pub direction: SyncDirection,
    pub status: BatchStatus,
    pub updates: Vec<UpdateId>,
    pub total_records: usize,
    pub processed_records: usize,
    pub successful_records: usize,
    pub failed_records: usize,
    pub conflicted_records: usize,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: u64,
    pub errors: Vec<SyncError>,
}

impl SyncBatch {
    pub fn new(channel_id: ChannelId, direction: SyncDirection, total_records: usize, started_at: DateTime<Utc>) -> Self {
        Self {
            id: BatchId::new(),
            channel_id,
            direction,
            status: BatchStatus::Processing,
            updates: Vec::new(),
            total_records,
            processed_records: 0,
            successful_records: 0,
            failed_records: 0,
            conflicted_records: 0,
            started_at,
            completed_at: None,
            duration_ms: 0,
            errors: Vec::new(),
        }
    }

    pub fn record_success(&mut self, update_id: Option<UpdateId>, conflicted: bool) {
        self.processed_records += 1;
        self.successful_records += 1;
        if conflicted {
            self.conflicted_records += 1;
        }
        if let Some(id) = update_id {
            self.updates.push(id);
        }
    }

    pub fn record_failure(&mut self, error: SyncError) {
        self.processed_records += 1;
        self.failed_records += 1;
        self.errors.push(error);
    }

    /// Close the batch: `completed` with no failures, `partial` otherwise.
    pub fn complete(&mut self, at: DateTime<Utc>) {
        self.status = if self.failed_records == 0 {
            BatchStatus::Completed
        } else {
            BatchStatus::Partial
        };
        self.finish(at);
    }

    /// Close the batch after a cycle-level failure (nothing could be processed).
    pub fn fail(&mut self, at: DateTime<Utc>, error: SyncError) {
        self.errors.push(error);
        self.status = BatchStatus::Failed;
        self.finish(at);
    }

    fn finish(&mut self, at: DateTime<Utc>) {
        self.completed_at = Some(at);
        self.duration_ms = (at - self.started_at).num_milliseconds().max(0) as u64;
    }

    pub fn summary(&self) -> BatchSummary {
        BatchSummary {
            batch_id: self.id,
            channel_id: self.channel_id.clone(),
            direction: self.direction,
            status: self.status,
            total_records: self.total_records,
            successful_records: self.successful_records,
            failed_records: self.failed_records,
            conflicted_records: self.conflicted_records,
            duration_ms: self.duration_ms,
        }
    }
}

/// Counters published with the sync completion events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSummary {
    pub batch_id: BatchId,
    pub channel_id: ChannelId,
    pub direction: SyncDirection,
    pub status: BatchStatus,
    pub total_records: usize,
    pub successful_records: usize,
    pub failed_records: usize,
    pub conflicted_records: usize,
    pub duration_ms: u64,
}

/// What the update pipeline reports back for one inbound record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineOutcome {
    pub update_id: UpdateId,
    pub conflicted: bool,
}

/// Ingest → rules → propagation for one request; implemented by the service.
#[async_trait]
pub trait UpdatePipeline: Send + Sync {
    async fn apply(&self, request: UpdateRequest) -> EngineResult<PipelineOutcome>;
}

pub struct BatchProcessor {
    registry: Arc<ChannelRegistry>,
    store: Arc<dyn SyncStore>,
    clock: Arc<dyn Clock>,
    events: SharedSink<SyncEvent>,
    propagator: Arc<Propagator>,
}

impl BatchProcessor {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        store: Arc<dyn SyncStore>,
        clock: Arc<dyn Clock>,
        events: SharedSink<SyncEvent>,
        propagator: Arc<Propagator>,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            events,
            propagator,
        }
    }

    fn active_channel(&self, channel_id: &ChannelId) -> EngineResult<SyncChannel> {
        let channel = self.registry.get(channel_id)?;
        if !channel.is_active() {
            return Err(EngineError::ChannelInactive(channel.id));
        }
        Ok(channel)
    }

    /// Pull changes from a channel and route each record through `pipeline`.
    ///
    /// Without `force`, fails with `SYNC_FREQUENCY_NOT_MET` until the channel's
    /// sync frequency has elapsed since its last sync. One bad record never
    /// aborts the batch; a failed fetch yields a `failed` batch.
    pub async fn sync_from_channel(
        &self,
        channel_id: &ChannelId,
        force: bool,
        pipeline: &dyn UpdatePipeline,
    ) -> EngineResult<SyncBatch> {
        let channel = self.active_channel(channel_id)?;
        let started_at = self.clock.now();

        if !force {
            if let Some(last) = channel.performance.last_sync {
                let elapsed = started_at - last;
                let frequency = channel.sync_frequency();
                if elapsed < frequency {
                    let remaining = frequency - elapsed;
                    let remaining_secs = (remaining.num_milliseconds() + 999) / 1000;
                    return Err(EngineError::SyncFrequencyNotMet {
                        channel: channel.id,
                        remaining_secs,
                    });
                }
            }
        }

        let connector = self.registry.connector(channel_id)?;
        let mut batch = SyncBatch::new(channel.id.clone(), SyncDirection::Inbound, 0, started_at);
        self.store.save_batch(&batch)?;

        let since = if channel.features.delta_sync {
            channel.performance.last_successful_sync
        } else {
            None
        };
        let timeout = channel.timeout();
        let fetched = match tokio::time::timeout(timeout, connector.fetch_updates(since)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout(timeout)),
        };

        let records = match fetched {
            Ok(records) => records,
            Err(err) => {
                let now = self.clock.now();
                warn!(channel = %channel.id, code = err.code(), error = %err, "inbound fetch failed");
                batch.fail(now, SyncError::from_connector(&err, now));
                self.store.save_batch(&batch)?;
                self.record_cycle(&batch);
                self.events.emit(SyncEvent::SyncError {
                    channel_id: channel.id.clone(),
                    code: err.code().to_string(),
                    message: err.to_string(),
                    retryable: err.retryable(),
                    at: now,
                });
                self.events.emit(SyncEvent::SyncCompleted {
                    batch: batch.summary(),
                    at: now,
                });
                return Ok(batch);
            }
        };

        batch.total_records = records.len();
        let source = UpdateSource::automatic(channel.id.as_str(), "inbound sync");
        let mapping = &channel.connectivity.field_mapping;

        for (index, record) in records.iter().enumerate() {
            let canonical = mapping.to_canonical(record);
            let result = match UpdateRequest::from_canonical_record(&channel.id, &canonical, source.clone()) {
                Ok(request) => pipeline.apply(request).await,
                Err(err) => Err(err),
            };
            match result {
                Ok(outcome) => batch.record_success(Some(outcome.update_id), outcome.conflicted),
                Err(err) => {
                    let product = canonical
                        .get("product_id")
                        .or_else(|| canonical.get("sku"))
                        .and_then(|v| v.as_str())
                        .map(ProductId::new);
                    batch.record_failure(SyncError::from_engine(&err, self.clock.now()).at_record(index, product));
                }
            }
        }

        batch.complete(self.clock.now());
        self.store.save_batch(&batch)?;
        self.record_cycle(&batch);

        info!(
            channel = %channel.id,
            batch_id = %batch.id,
            total = batch.total_records,
            successful = batch.successful_records,
            failed = batch.failed_records,
            conflicted = batch.conflicted_records,
            "inbound sync completed"
        );
        self.events.emit(SyncEvent::SyncCompleted {
            batch: batch.summary(),
            at: self.clock.now(),
        });
        Ok(batch)
    }

    fn record_cycle(&self, batch: &SyncBatch) {
        let outcome = SyncOutcome {
            at: batch.completed_at.unwrap_or(batch.started_at),
            watermark: batch.started_at,
            succeeded: batch.status != BatchStatus::Failed
                && (batch.successful_records > 0 || batch.failed_records == 0),
            records: batch.processed_records,
            failed: batch.failed_records,
            duration_ms: batch.duration_ms,
        };
        if let Err(err) = self.registry.record_sync(&batch.channel_id, outcome) {
            warn!(channel = %batch.channel_id, error = %err, "failed to record sync outcome");
        }
    }

    /// Push updates to a channel in chunk-sized calls.
    ///
    /// With `update_ids`, those updates are sent; otherwise everything ready on
    /// the channel's lane. A failed chunk marks all its members failed (they are
    /// re-queued or dead-lettered) and later chunks are still attempted.
    pub async fn sync_to_channel(
        &self,
        channel_id: &ChannelId,
        update_ids: Option<Vec<UpdateId>>,
    ) -> EngineResult<SyncBatch> {
        let channel = self.active_channel(channel_id)?;
        if !channel.accepts_outbound() {
            return Err(EngineError::ChannelReadOnly(channel.id));
        }
        let started_at = self.clock.now();

        let mut batch = SyncBatch::new(channel.id.clone(), SyncDirection::Outbound, 0, started_at);
        let deliveries = match update_ids {
            Some(ids) => {
                batch.total_records = ids.len();
                self.explicit_deliveries(&channel, ids, &mut batch)?
            }
            None => {
                let pending = self.propagator.take_pending(&channel.id, usize::MAX);
                batch.total_records = pending.len();
                pending
            }
        };
        self.store.save_batch(&batch)?;

        for chunk in deliveries.chunks(channel.chunk_size()) {
            let members: Vec<(Option<UpdateId>, ProductId, u32)> = chunk
                .iter()
                .map(|d| (d.update_id(), d.product_id.clone(), d.attempts))
                .collect();
            let outcome = self.propagator.deliver(&channel, chunk.to_vec()).await;
            match outcome.error {
                None => {
                    for (update_id, _, _) in members {
                        batch.record_success(update_id, false);
                    }
                }
                Some(err) => {
                    let now = self.clock.now();
                    let first = batch.processed_records;
                    for (offset, (_, product, attempts)) in members.into_iter().enumerate() {
                        let error = SyncError::from_connector(&err, now)
                            .with_retries(attempts + 1)
                            .at_record(first + offset, Some(product));
                        batch.record_failure(error);
                    }
                }
            }
        }

        batch.complete(self.clock.now());
        self.store.save_batch(&batch)?;

        info!(
            channel = %channel.id,
            batch_id = %batch.id,
            total = batch.total_records,
            successful = batch.successful_records,
            failed = batch.failed_records,
            "outbound sync completed"
        );
        self.events.emit(SyncEvent::SyncToChannelCompleted {
            batch: batch.summary(),
            at: self.clock.now(),
        });
        Ok(batch)
    }

    /// Resolve explicit update ids into deliveries. Ids that cannot be sent are
    /// accounted for on the batch right away.
    fn explicit_deliveries(
        &self,
        channel: &SyncChannel,
        ids: Vec<UpdateId>,
        batch: &mut SyncBatch,
    ) -> EngineResult<Vec<Delivery>> {
        let now = self.clock.now();
        let mut deliveries = Vec::new();
        for (index, id) in ids.into_iter().enumerate() {
            let Some(update) = self.store.get_update(id)? else {
                batch.record_failure(
                    SyncError::from_engine(&EngineError::UpdateNotFound(id), now).at_record(index, None),
                );
                continue;
            };
            let product = Some(update.product_id.clone());
            if update.source_channel == channel.id {
                batch.record_failure(
                    SyncError::business("SOURCE_CHANNEL", "update originated from this channel", now)
                        .at_record(index, product),
                );
                continue;
            }
            if let Some(reason) = &update.blocked_reason {
                batch.record_failure(
                    SyncError::business("UPDATE_BLOCKED", reason.clone(), now).at_record(index, product),
                );
                continue;
            }
            if update.propagated.contains(&channel.id) {
                batch.record_success(Some(id), false);
                continue;
            }

            let mut values = update.current_values();
            values.retain(|field, _| !update.withheld_fields.contains(field));
            if values.is_empty() {
                batch.record_failure(
                    SyncError::business("FIELDS_WITHHELD", "every field awaits conflict resolution", now)
                        .at_record(index, product),
                );
                continue;
            }
            deliveries.push(Delivery::for_update(&update, values, None, now));
        }
        Ok(deliveries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemorySyncStore;
    use crate::retry::RetryPolicy;
    use proptest::prelude::*;
    use serde_json::{Map, Value, json};
    use crate::update::{Field, FieldChange, InventoryUpdate};
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, Ordering};
    use stocksync_channels::{ChannelType, FieldMapping, InMemoryConnector};
    use stocksync_core::ManualClock;
    use stocksync_events::NullSink;

    /// Accepts every request, records what it saw.
    #[derive(Default)]
    struct RecordingPipeline {
        seen: Mutex<Vec<UpdateRequest>>,
    }

    #[async_trait]
    impl UpdatePipeline for RecordingPipeline {
        async fn apply(&self, request: UpdateRequest) -> EngineResult<PipelineOutcome> {
            self.seen.lock().unwrap().push(request);
            Ok(PipelineOutcome {
                update_id: UpdateId::new(),
                conflicted: false,
            })
        }
    }

    /// Lets one more record land in the feed while the first record is processed.
    struct LateArrivalPipeline {
        clock: Arc<ManualClock>,
        feed: Arc<InMemoryConnector>,
        fired: AtomicBool,
        seen: Mutex<Vec<ProductId>>,
    }

    #[async_trait]
    impl UpdatePipeline for LateArrivalPipeline {
        async fn apply(&self, request: UpdateRequest) -> EngineResult<PipelineOutcome> {
            self.seen.lock().unwrap().push(request.product_id.clone());
            if !self.fired.swap(true, Ordering::SeqCst) {
                self.clock.advance_secs(1);
                self.feed.push_inbound(self.clock.now(), stock_record("LATE", 3));
                self.clock.advance_secs(1);
            }
            Ok(PipelineOutcome {
                update_id: UpdateId::new(),
                conflicted: false,
            })
        }
    }

    fn stock_record(sku: &str, qty: i64) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert("product_id".into(), json!(sku));
        record.insert("quantity".into(), json!(qty));
        record
    }

    struct Fixture {
        processor: BatchProcessor,
        registry: Arc<ChannelRegistry>,
        store: Arc<InMemorySyncStore>,
        propagator: Arc<Propagator>,
        clock: Arc<ManualClock>,
        ebay: Arc<InMemoryConnector>,
    }

    fn fixture() -> Fixture {
        let registry = Arc::new(ChannelRegistry::new());
        let ebay = Arc::new(InMemoryConnector::new("ebay"));
        let mapping = FieldMapping::new().with("ItemID", "product_id").with("QuantityAvailable", "quantity");
        registry
            .register(
                SyncChannel::new("ebay", "eBay", ChannelType::Marketplace)
                    .with_sync_frequency(300)
                    .with_field_mapping(mapping),
                Some(ebay.clone()),
            )
            .unwrap();
        registry
            .register(
                SyncChannel::new("amazon", "Amazon", ChannelType::Marketplace).with_bidirectional(false),
                Some(Arc::new(InMemoryConnector::new("amazon"))),
            )
            .unwrap();
        let store = InMemorySyncStore::arc();
        let clock = Arc::new(ManualClock::default());
        let propagator = Arc::new(Propagator::new(
            registry.clone(),
            store.clone(),
            clock.clone(),
            Arc::new(NullSink),
            RetryPolicy::immediate(),
        ));
        Fixture {
            processor: BatchProcessor::new(
                registry.clone(),
                store.clone(),
                clock.clone(),
                Arc::new(NullSink),
                propagator.clone(),
            ),
            registry,
            store,
            propagator,
            clock,
            ebay,
        }
    }

    fn listing(sku: &str, qty: Value) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert("ItemID".into(), json!(sku));
        record.insert("QuantityAvailable".into(), qty);
        record
    }

    #[tokio::test]
    async fn bad_records_do_not_abort_the_batch() {
        let f = fixture();
        for i in 0..10 {
            let qty = if i % 4 == 0 { json!("lots") } else { json!(i) };
            f.ebay.push_inbound(f.clock.now(), listing(&format!("SKU-{i}"), qty));
        }
        let pipeline = RecordingPipeline::default();

        let batch = f
            .processor
            .sync_from_channel(&ChannelId::new("ebay"), false, &pipeline)
            .await
            .unwrap();

        assert_eq!(batch.total_records, 10);
        assert_eq!(batch.successful_records, 7);
        assert_eq!(batch.failed_records, 3);
        assert_eq!(batch.status, BatchStatus::Partial);
        assert_eq!(batch.errors[0].record_index, Some(0));
        assert_eq!(batch.errors[0].error_type, ErrorKind::Validation);
        assert_eq!(pipeline.seen.lock().unwrap()[0].product_id, ProductId::new("SKU-1"));
    }

    #[tokio::test]
    async fn frequency_is_enforced_unless_forced() {
        let f = fixture();
        let pipeline = RecordingPipeline::default();
        let ebay = ChannelId::new("ebay");
        f.processor.sync_from_channel(&ebay, false, &pipeline).await.unwrap();

        f.clock.advance_secs(100);
        let err = f.processor.sync_from_channel(&ebay, false, &pipeline).await.unwrap_err();
        assert_eq!(
            err,
            EngineError::SyncFrequencyNotMet {
                channel: ebay.clone(),
                remaining_secs: 200
            }
        );

        let forced = f.processor.sync_from_channel(&ebay, true, &pipeline).await.unwrap();
        assert_eq!(forced.status, BatchStatus::Completed);
        assert_eq!(f.ebay.fetch_calls(), 2);
    }

    #[tokio::test]
    async fn records_landing_mid_batch_are_pulled_next_cycle() {
        let f = fixture();
        let feed = Arc::new(InMemoryConnector::new("warehouse_main"));
        let mut warehouse = SyncChannel::new("warehouse_main", "Main Warehouse", ChannelType::Warehouse);
        warehouse.features.delta_sync = true;
        f.registry.register(warehouse, Some(feed.clone())).unwrap();
        feed.push_inbound(f.clock.now(), stock_record("EARLY", 5));

        let pipeline = LateArrivalPipeline {
            clock: f.clock.clone(),
            feed: feed.clone(),
            fired: AtomicBool::new(false),
            seen: Mutex::new(Vec::new()),
        };
        let id = ChannelId::new("warehouse_main");

        let first = f.processor.sync_from_channel(&id, true, &pipeline).await.unwrap();
        assert_eq!(first.total_records, 1);
        let channel = f.registry.get(&id).unwrap();
        assert_eq!(channel.performance.last_successful_sync, Some(first.started_at));
        assert!(channel.performance.last_sync > channel.performance.last_successful_sync);

        let second = f.processor.sync_from_channel(&id, true, &pipeline).await.unwrap();
        assert_eq!(second.total_records, 1);
        assert_eq!(
            *pipeline.seen.lock().unwrap(),
            vec![ProductId::new("EARLY"), ProductId::new("LATE")]
        );

        let third = f.processor.sync_from_channel(&id, true, &pipeline).await.unwrap();
        assert_eq!(third.total_records, 0);
    }

    #[tokio::test]
    async fn failed_fetch_yields_failed_batch() {
        let f = fixture();
        f.ebay.fail_next_fetch(ConnectorError::Network("reset".into()));

        let batch = f
            .processor
            .sync_from_channel(&ChannelId::new("ebay"), true, &RecordingPipeline::default())
            .await
            .unwrap();

        assert_eq!(batch.status, BatchStatus::Failed);
        assert_eq!(batch.errors[0].code, "NETWORK_ERROR");
        let channel = f.registry.get(&ChannelId::new("ebay")).unwrap();
        assert!(channel.performance.last_sync.is_some());
        assert!(channel.performance.last_successful_sync.is_none());
    }

    #[tokio::test]
    async fn receive_only_channel_rejects_push() {
        let f = fixture();
        let err = f
            .processor
            .sync_to_channel(&ChannelId::new("amazon"), None)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "CHANNEL_READ_ONLY");
    }

    #[tokio::test]
    async fn failed_chunk_fails_its_members_and_later_chunks_still_go_out() {
        let f = fixture();
        let website = Arc::new(InMemoryConnector::new("website"));
        f.registry
            .register(
                SyncChannel::new("website", "Website", ChannelType::Internal).with_batch_size(2),
                Some(website.clone()),
            )
            .unwrap();
        let id = ChannelId::new("website");

        let mut queued = Vec::new();
        for qty in 1..=5 {
            let request = UpdateRequest::new("pos_retail", format!("SKU-{qty}"), UpdateSource::automatic("pos", "sale"))
                .quantity(qty);
            let changes = BTreeMap::from([(Field::Quantity, FieldChange::new(json!(0), json!(qty)))]);
            let update = InventoryUpdate::new(&request, changes, 1, f.clock.now());
            f.store.insert_update(update.clone()).unwrap();
            let values = BTreeMap::from([(Field::Quantity, json!(qty))]);
            f.propagator
                .queues()
                .enqueue(&id, Delivery::for_update(&update, values, None, f.clock.now()));
            queued.push(update.id);
        }
        website.fail_next_send(ConnectorError::Network("reset".into()));

        let batch = f.processor.sync_to_channel(&id, None).await.unwrap();

        assert_eq!(batch.total_records, 5);
        assert_eq!(batch.failed_records, 2);
        assert_eq!(batch.successful_records, 3);
        assert_eq!(batch.status, BatchStatus::Partial);
        assert_eq!(batch.errors.len(), 2);
        assert!(batch.errors.iter().all(|e| e.code == "NETWORK_ERROR" && e.retryable));
        assert_eq!(website.sent_batches().len(), 2);
        assert_eq!(website.sent_records().len(), 3);

        let requeued: Vec<UpdateId> = f
            .propagator
            .queues()
            .pending(&id)
            .iter()
            .filter_map(Delivery::update_id)
            .collect();
        assert_eq!(requeued, queued[..2].to_vec());
        assert!(f.store.get_update(queued[4]).unwrap().unwrap().propagated.contains(&id));
    }

    #[tokio::test]
    async fn unknown_update_ids_are_failed_records() {
        let f = fixture();
        let batch = f
            .processor
            .sync_to_channel(&ChannelId::new("ebay"), Some(vec![UpdateId::new()]))
            .await
            .unwrap();
        assert_eq!(batch.failed_records, 1);
        assert_eq!(batch.errors[0].code, "UPDATE_NOT_FOUND");
        assert_eq!(batch.status, BatchStatus::Partial);
    }

    proptest! {
        #[test]
        fn accounting_holds_for_any_outcome_mix(outcomes in proptest::collection::vec(any::<(bool, bool)>(), 0..60)) {
            let now = Utc::now();
            let mut batch = SyncBatch::new(ChannelId::new("ebay"), SyncDirection::Inbound, outcomes.len(), now);
            for (ok, conflicted) in &outcomes {
                if *ok {
                    batch.record_success(Some(UpdateId::new()), *conflicted);
                } else {
                    batch.record_failure(SyncError::business("X", "x", now));
                }
            }
            batch.complete(now);

            prop_assert_eq!(batch.processed_records, batch.successful_records + batch.failed_records);
            prop_assert_eq!(batch.processed_records, batch.total_records);
            prop_assert_eq!(batch.status == BatchStatus::Completed, batch.failed_records == 0);
            prop_assert!(batch.conflicted_records <= batch.successful_records);
        }
    }
}
