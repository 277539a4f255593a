//! End-to-end pipeline tests against the default channel set.
//!
//! Ingest → detect → rules → ledger → propagation → connectors, with a manual
//! clock and in-memory connectors standing in for every channel.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use proptest::prelude::*;
use serde_json::{Map, Value, json};

use stocksync_channels::{ChannelStatus, ConnectorError, InMemoryConnector};
use stocksync_core::{ChannelId, Clock, EngineError, EngineResult, ManualClock, ProductId, WarehouseId};
use stocksync_events::{EventBus, EventEnvelope, InMemoryEventBus, Subscription};

use crate::batch::BatchStatus;
use crate::config::EngineConfig;
use crate::conflict::{ConflictSeverity, ConflictType, ResolutionStrategy};
use crate::events::SyncEvent;
use crate::ledger::{InMemoryLedger, InventoryLedger, StockSnapshot};
use crate::metrics::TimeWindow;
use crate::rules::{Operator, RuleAction, RuleCondition, SyncRule};
use crate::service::SyncService;
use crate::store::{InMemorySyncStore, SyncStore};
use crate::update::{Field, UpdateRequest, UpdateSource};

const CHANNELS: [&str; 6] = ["website", "amazon", "ebay", "pos_retail", "warehouse_main", "partner_api"];

struct Harness {
    service: Arc<SyncService>,
    clock: Arc<ManualClock>,
    ledger: Arc<InMemoryLedger>,
    connectors: HashMap<&'static str, Arc<InMemoryConnector>>,
    events: Subscription<EventEnvelope<SyncEvent>>,
}

impl Harness {
    fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    fn with_config(config: EngineConfig) -> Self {
        let clock = Arc::new(ManualClock::default());
        let ledger = Arc::new(InMemoryLedger::new());
        ledger.seed(
            ProductId::new("FLEXVOLT_9AH"),
            None,
            StockSnapshot {
                quantity: 40,
                price: Some(199.0),
                available: true,
                ..StockSnapshot::default()
            },
        );
        let bus: Arc<InMemoryEventBus<EventEnvelope<SyncEvent>>> = Arc::new(InMemoryEventBus::new());
        let events = bus.subscribe();

        let mut builder = SyncService::builder(config)
            .clock(clock.clone())
            .ledger(ledger.clone())
            .events(bus);
        let mut connectors = HashMap::new();
        for id in CHANNELS {
            let connector = Arc::new(InMemoryConnector::new(id));
            builder = builder.connector(id, connector.clone());
            connectors.insert(id, connector);
        }
        let service = Arc::new(builder.build().unwrap());
        service.initialize().unwrap();

        Self {
            service,
            clock,
            ledger,
            connectors,
            events,
        }
    }

    fn connector(&self, id: &str) -> &Arc<InMemoryConnector> {
        &self.connectors[id]
    }

    fn quantity(&self, product: &str) -> i64 {
        self.ledger
            .snapshot(&ProductId::new(product), None)
            .unwrap()
            .map_or(0, |s| s.quantity)
    }

    fn drain_events(&self) -> Vec<SyncEvent> {
        self.events.drain().into_iter().map(EventEnvelope::into_payload).collect()
    }
}

fn sale(channel: &str, product: &str, qty: i64) -> UpdateRequest {
    UpdateRequest::new(channel, product, UpdateSource::automatic(channel, "sale")).quantity(qty)
}

fn ebay_listing(sku: &str, qty: Value) -> Map<String, Value> {
    let mut record = Map::new();
    record.insert("ItemID".into(), json!(sku));
    record.insert("QuantityAvailable".into(), qty);
    record
}

fn last_sent(connector: &InMemoryConnector, key: &str) -> Option<Value> {
    connector.sent_records().last().and_then(|r| r.get(key).cloned())
}

#[tokio::test]
async fn flexvolt_conflict_resolves_last_write_wins_everywhere() {
    let h = Harness::new();

    let u1 = h.service.process_update(sale("pos_retail", "FLEXVOLT_9AH", 35)).await.unwrap();
    assert!(u1.conflicts.is_empty());
    assert_eq!(h.quantity("FLEXVOLT_9AH"), 35);

    h.clock.advance_secs(5);
    let u2 = h.service.process_update(sale("website", "FLEXVOLT_9AH", 32)).await.unwrap();

    assert_eq!(u2.conflicts.len(), 1);
    let conflict = &u2.conflicts[0];
    assert_eq!(conflict.field, Field::Quantity);
    assert_eq!(conflict.conflict_type, ConflictType::ConcurrentUpdate);
    assert_eq!(conflict.severity, ConflictSeverity::Medium);
    assert!(u2.update.version > u1.update.version);
    // contended field is held back until someone decides
    assert!(u2.propagation.dispatched.is_empty());
    assert_eq!(h.quantity("FLEXVOLT_9AH"), 35);
    assert_eq!(h.service.active_conflicts().unwrap().len(), 1);

    let resolved = h
        .service
        .resolve_conflict(conflict.id, ResolutionStrategy::LastWriteWins, "ops@example.com", None)
        .await
        .unwrap();

    assert!(resolved.resolved_at.is_some());
    assert!(resolved.involves(u1.update.id) && resolved.involves(u2.update.id));
    assert_eq!(resolved.resolution.as_ref().unwrap().resolved_value, json!(32));
    assert!(h.service.active_conflicts().unwrap().is_empty());
    assert_eq!(h.quantity("FLEXVOLT_9AH"), 32);

    let expected: BTreeSet<ChannelId> = ["website", "ebay", "pos_retail", "warehouse_main", "partner_api"]
        .into_iter()
        .map(ChannelId::new)
        .collect();
    assert_eq!(resolved.propagated, expected);
    assert_eq!(last_sent(h.connector("pos_retail"), "quantity"), Some(json!(32)));
    assert_eq!(last_sent(h.connector("website"), "quantity"), Some(json!(32)));
    assert_eq!(last_sent(h.connector("ebay"), "QuantityAvailable"), Some(json!(32)));
    assert!(h.connector("amazon").sent_records().is_empty());

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(e, SyncEvent::ChannelsInitialized { channels, .. } if channels.len() == 6)));
    assert!(events.iter().any(|e| matches!(e, SyncEvent::ConflictDetected { .. })));
    assert!(events.iter().any(
        |e| matches!(e, SyncEvent::ConflictResolved { resolved_value, .. } if *resolved_value == json!(32))
    ));
}

#[tokio::test]
async fn resolving_twice_is_rejected_and_manual_needs_a_value() {
    let h = Harness::new();
    h.service.process_update(sale("pos_retail", "FLEXVOLT_9AH", 35)).await.unwrap();
    h.clock.advance_secs(5);
    let id = h
        .service
        .process_update(sale("website", "FLEXVOLT_9AH", 32))
        .await
        .unwrap()
        .conflicts[0]
        .id;

    let err = h
        .service
        .resolve_conflict(id, ResolutionStrategy::Manual, "ops", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "VALIDATION_ERROR");

    h.service
        .resolve_conflict(id, ResolutionStrategy::Manual, "ops", Some(json!(30)))
        .await
        .unwrap();
    assert_eq!(h.quantity("FLEXVOLT_9AH"), 30);

    let err = h
        .service
        .resolve_conflict(id, ResolutionStrategy::LastWriteWins, "ops", None)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONFLICT_ALREADY_RESOLVED");
}

#[tokio::test]
async fn receive_only_channel_is_never_a_target() {
    let h = Harness::new();

    let from_amazon = h.service.process_update(sale("amazon", "DCB609", 12)).await.unwrap();
    h.clock.advance_secs(60);
    let from_pos = h.service.process_update(sale("pos_retail", "DCB609", 11)).await.unwrap();

    for processed in [&from_amazon, &from_pos] {
        assert!(!processed.propagation.dispatched.contains(&ChannelId::new("amazon")));
        assert!(!processed.update.propagated.contains(&ChannelId::new("amazon")));
        assert!(!processed.update.propagated.contains(&processed.update.source_channel));
    }
    assert_eq!(from_pos.update.propagated.len(), 4);
    assert!(h.connector("amazon").sent_records().is_empty());
    assert_eq!(h.connector("pos_retail").sent_records().len(), 1);
}

#[tokio::test]
async fn inbound_batch_accounts_for_bad_records() {
    let h = Harness::new();
    let ebay = h.connector("ebay");
    for i in 0..50 {
        let qty = if [7, 21, 42].contains(&i) { json!("n/a") } else { json!(100 + i) };
        ebay.push_inbound(h.clock.now(), ebay_listing(&format!("DCB{i:03}"), qty));
    }

    let batch = h
        .service
        .sync_from_channel(&ChannelId::new("ebay"), false)
        .await
        .unwrap();

    assert_eq!(batch.total_records, 50);
    assert_eq!(batch.successful_records, 47);
    assert_eq!(batch.failed_records, 3);
    assert_eq!(batch.processed_records, batch.successful_records + batch.failed_records);
    assert_eq!(batch.status, BatchStatus::Partial);
    let failed: Vec<usize> = batch.errors.iter().filter_map(|e| e.record_index).collect();
    assert_eq!(failed, vec![7, 21, 42]);
    assert_eq!(h.quantity("DCB000"), 100);
    assert!(!h.connector("website").sent_records().is_empty());
    assert!(h.connector("ebay").sent_records().is_empty());

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(
        e,
        SyncEvent::SyncCompleted { batch, .. } if batch.failed_records == 3 && batch.status == BatchStatus::Partial
    )));
}

#[tokio::test]
async fn sync_frequency_gate_and_force() {
    let h = Harness::new();
    let ebay = ChannelId::new("ebay");
    h.service.sync_from_channel(&ebay, false).await.unwrap();

    h.clock.advance_secs(120);
    let err = h.service.sync_from_channel(&ebay, false).await.unwrap_err();
    assert_eq!(err.code(), "SYNC_FREQUENCY_NOT_MET");

    let forced = h.service.sync_from_channel(&ebay, true).await.unwrap();
    assert_eq!(forced.status, BatchStatus::Completed);

    h.clock.advance_secs(601);
    h.service.sync_from_channel(&ebay, false).await.unwrap();
    assert_eq!(h.connector("ebay").fetch_calls(), 3);
}

#[tokio::test]
async fn unreachable_channel_queues_then_drains_once() {
    let h = Harness::new();
    let website = h.connector("website");
    website.set_reachable(false);

    let processed = h.service.process_update(sale("pos_retail", "DWST1", 8)).await.unwrap();
    assert!(processed.propagation.queued.contains(&ChannelId::new("website")));

    let reports = h.service.drain_queues().await;
    let report = reports.iter().find(|r| r.channel_id.as_str() == "website").unwrap();
    assert!(report.skipped);
    assert_eq!(report.remaining, 1);

    website.set_reachable(true);
    h.service.drain_queues().await;
    h.service.drain_queues().await;
    assert_eq!(website.sent_records().len(), 1);

    let stored = h.service.get_update(processed.update.id).unwrap();
    assert!(stored.propagated.contains(&ChannelId::new("website")));
    assert!(!stored.propagated.contains(&ChannelId::new("pos_retail")));
}

#[tokio::test]
async fn transport_failure_is_retried_after_backoff() {
    let h = Harness::new();
    let ebay = h.connector("ebay");
    ebay.fail_next_send(ConnectorError::Network("connection reset".into()));

    let processed = h.service.process_update(sale("pos_retail", "DCB205", 3)).await.unwrap();
    assert!(processed.propagation.queued.contains(&ChannelId::new("ebay")));
    let status = h.service.queue_status(&ChannelId::new("ebay")).unwrap();
    assert_eq!(status.depth, 1);
    assert_eq!(status.pending[0].attempts, 1);

    // backoff not elapsed yet
    h.service.drain_queues().await;
    assert!(ebay.sent_records().is_empty());

    h.clock.advance_secs(5);
    h.service.drain_queues().await;
    assert_eq!(ebay.sent_records().len(), 1);

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(e, SyncEvent::SyncError { retryable: true, .. })));
}

#[tokio::test]
async fn permanent_failure_dead_letters_until_requeued() {
    let h = Harness::new();
    let ebay = h.connector("ebay");
    ebay.fail_next_send(ConnectorError::Authentication("token expired".into()));

    h.service.process_update(sale("pos_retail", "DCB205", 3)).await.unwrap();
    let channel = ChannelId::new("ebay");
    let status = h.service.queue_status(&channel).unwrap();
    assert_eq!(status.depth, 0);
    assert_eq!(status.dead_letters.len(), 1);
    assert_eq!(status.dead_letters[0].code, "AUTHENTICATION_FAILED");

    assert_eq!(h.service.requeue_dead_letters(&channel).unwrap(), 1);
    h.service.drain_queues().await;
    assert_eq!(ebay.sent_records().len(), 1);
    assert!(h.service.queue_status(&channel).unwrap().dead_letters.is_empty());
}

#[tokio::test]
async fn blocking_rule_stops_commit_and_delivery() {
    let mut config = EngineConfig::default();
    config.rules.push(
        SyncRule::new("hold audit corrections", 1)
            .when(RuleCondition::new("source.reason", Operator::Eq, json!("audit")))
            .then(RuleAction::Block {
                reason: Some("audit corrections need review".into()),
            }),
    );
    let h = Harness::with_config(config);

    let request = UpdateRequest::new("warehouse_main", "FLEXVOLT_9AH", UpdateSource::automatic("wms", "audit")).quantity(12);
    let processed = h.service.process_update(request).await.unwrap();

    assert_eq!(processed.update.blocked_reason.as_deref(), Some("audit corrections need review"));
    assert!(processed.update.processed);
    assert_eq!(processed.propagation, Default::default());
    assert_eq!(h.quantity("FLEXVOLT_9AH"), 40);
    assert!(h.connector("website").sent_records().is_empty());

    let pushed = h
        .service
        .sync_to_channel(&ChannelId::new("website"), Some(vec![processed.update.id]))
        .await
        .unwrap();
    assert_eq!(pushed.errors[0].code, "UPDATE_BLOCKED");
}

#[tokio::test]
async fn price_transform_and_stockout_alert_apply() {
    let h = Harness::new();

    let request = UpdateRequest::new("website", "FLEXVOLT_9AH", UpdateSource::user("admin", "u-17", "repricing"))
        .price(189.994)
        .quantity(0);
    let processed = h.service.process_update(request).await.unwrap();

    assert!(processed.decision.immediate);
    assert_eq!(processed.decision.alerts.len(), 1);
    let snapshot = h.ledger.snapshot(&ProductId::new("FLEXVOLT_9AH"), None).unwrap().unwrap();
    assert_eq!(snapshot.price, Some(189.99));
    assert_eq!(last_sent(h.connector("ebay"), "StartPrice"), Some(json!(189.99)));

    let events = h.drain_events();
    assert!(events.iter().any(|e| matches!(e, SyncEvent::AlertRaised { .. })));
}

#[tokio::test]
async fn queue_rule_defers_to_drain_cycle() {
    let mut config = EngineConfig::default();
    config.rules.push(
        SyncRule::new("partner feed waits for drain", 5)
            .for_channels(["partner_api"])
            .then(RuleAction::Queue),
    );
    let h = Harness::with_config(config);

    let processed = h.service.process_update(sale("partner_api", "DCS391", 4)).await.unwrap();
    assert!(processed.propagation.dispatched.is_empty());
    assert_eq!(processed.propagation.queued.len(), 4);
    assert_eq!(processed.decision.retry_limit, Some(8));

    h.service.drain_queues().await;
    assert_eq!(h.connector("website").sent_records().len(), 1);
    assert_eq!(h.service.get_update(processed.update.id).unwrap().propagated.len(), 4);
}

#[tokio::test]
async fn outbound_sync_pushes_explicit_updates_once() {
    let h = Harness::new();
    let website = h.connector("website");
    website.set_reachable(false);
    let processed = h.service.process_update(sale("pos_retail", "DCB112", 9)).await.unwrap();
    website.set_reachable(true);

    let batch = h.service.sync_to_channel(&ChannelId::new("website"), None).await.unwrap();
    assert_eq!(batch.total_records, 1);
    assert_eq!(batch.successful_records, 1);
    assert_eq!(batch.status, BatchStatus::Completed);

    // already delivered: counted, not resent
    let again = h
        .service
        .sync_to_channel(&ChannelId::new("website"), Some(vec![processed.update.id]))
        .await
        .unwrap();
    assert_eq!(again.successful_records, 1);
    assert_eq!(website.sent_records().len(), 1);

    // never back to the source
    let source = h
        .service
        .sync_to_channel(&ChannelId::new("pos_retail"), Some(vec![processed.update.id]))
        .await
        .unwrap();
    assert_eq!(source.errors[0].code, "SOURCE_CHANNEL");

    let err = h.service.sync_to_channel(&ChannelId::new("amazon"), None).await.unwrap_err();
    assert_eq!(err.code(), "CHANNEL_READ_ONLY");
}

#[tokio::test]
async fn duplicate_writes_auto_resolve() {
    let h = Harness::new();
    h.service.process_update(sale("pos_retail", "FLEXVOLT_9AH", 35)).await.unwrap();
    h.clock.advance_secs(3);
    let dup = h.service.process_update(sale("website", "FLEXVOLT_9AH", 35)).await.unwrap();

    assert_eq!(dup.conflicts[0].severity, ConflictSeverity::Low);
    assert!(dup.update.withheld_fields.is_empty());

    assert_eq!(h.service.auto_resolve_conflicts().await.unwrap(), 1);
    let settled = h.service.get_conflict(dup.conflicts[0].id).unwrap();
    assert_eq!(settled.resolution.unwrap().resolved_by, "system");
    assert_eq!(h.service.auto_resolve_conflicts().await.unwrap(), 0);
}

#[tokio::test]
async fn stale_base_version_raises_version_conflict() {
    let h = Harness::new();
    h.service.process_update(sale("pos_retail", "FLEXVOLT_9AH", 35)).await.unwrap();
    h.clock.advance_secs(40);
    h.service.process_update(sale("pos_retail", "FLEXVOLT_9AH", 34)).await.unwrap();
    h.clock.advance_secs(40);

    let stale = h
        .service
        .process_update(
            UpdateRequest::new("warehouse_main", "FLEXVOLT_9AH", UpdateSource::automatic("wms", "recount"))
                .quantity(30)
                .base_version(1),
        )
        .await
        .unwrap();

    assert_eq!(stale.conflicts.len(), 1);
    assert_eq!(stale.conflicts[0].conflict_type, ConflictType::VersionConflict);
    assert!(stale.conflicts[0].is_auto_resolvable());
    assert!(stale.update.withheld_fields.is_empty());
    assert_eq!(h.quantity("FLEXVOLT_9AH"), 30);
    assert!(!stale.propagation.dispatched.is_empty());
}

#[tokio::test]
async fn health_check_flips_status_and_back() {
    let h = Harness::new();
    let ebay = ChannelId::new("ebay");
    h.connector("ebay").set_reachable(false);

    let reports = h.service.check_channel_health().await.unwrap();
    let report = reports.iter().find(|r| r.channel_id == ebay).unwrap();
    assert!(!report.healthy);
    assert_eq!(h.service.channel(&ebay).unwrap().status, ChannelStatus::Error);

    let err = h.service.process_update(sale("ebay", "DCB609", 1)).await.unwrap_err();
    assert_eq!(err.code(), "CHANNEL_INACTIVE");

    h.connector("ebay").set_reachable(true);
    h.service.check_channel_health().await.unwrap();
    let channel = h.service.channel(&ebay).unwrap();
    assert_eq!(channel.status, ChannelStatus::Active);
    assert!(channel.performance.availability < 100.0);

    let changes = h
        .drain_events()
        .into_iter()
        .filter(|e| matches!(e, SyncEvent::ChannelStatusChanged { .. }))
        .count();
    assert_eq!(changes, 2);
}

#[tokio::test]
async fn cleanup_purges_history_but_keeps_open_conflicts() {
    let h = Harness::new();
    h.service.process_update(sale("pos_retail", "FLEXVOLT_9AH", 35)).await.unwrap();
    h.clock.advance_secs(5);
    h.service.process_update(sale("website", "FLEXVOLT_9AH", 32)).await.unwrap();
    h.service.sync_from_channel(&ChannelId::new("ebay"), true).await.unwrap();

    h.clock.advance_secs(25 * 3600);
    let stats = h.service.cleanup_stale_data().unwrap();

    assert_eq!(stats.updates, 2);
    assert_eq!(stats.batches, 1);
    assert_eq!(h.service.active_conflicts().unwrap().len(), 1);
}

#[tokio::test]
async fn metrics_reflect_activity() {
    let h = Harness::new();
    h.service.process_update(sale("pos_retail", "FLEXVOLT_9AH", 35)).await.unwrap();
    h.clock.advance_secs(5);
    h.service.process_update(sale("website", "FLEXVOLT_9AH", 32)).await.unwrap();

    let metrics = h.service.metrics(TimeWindow::Hour).unwrap();
    assert_eq!(metrics.system.total_updates, 2);
    assert_eq!(metrics.system.processed_updates, 2);
    assert_eq!(metrics.system.conflict_rate, 50.0);
    assert_eq!(metrics.system.active_conflicts, 1);
    assert_eq!(metrics.channels.len(), 6);
    let pos = metrics.channels.iter().find(|c| c.channel_id.as_str() == "pos_retail").unwrap();
    assert_eq!(pos.updates_originated, 1);
}

#[tokio::test]
async fn unknown_channel_and_update_are_not_found() {
    let h = Harness::new();
    let err = h.service.process_update(sale("shopify", "X", 1)).await.unwrap_err();
    assert_eq!(err.code(), "CHANNEL_NOT_FOUND");
    let err = h.service.get_update(stocksync_core::UpdateId::new()).unwrap_err();
    assert_eq!(err.code(), "UPDATE_NOT_FOUND");
    let err = h.service.sync_from_channel(&ChannelId::new("shopify"), true).await.unwrap_err();
    assert_eq!(err.code(), "CHANNEL_NOT_FOUND");
}

/// Ledger whose writes can be switched off.
#[derive(Default)]
struct FlakyLedger {
    inner: InMemoryLedger,
    down: AtomicBool,
}

impl InventoryLedger for FlakyLedger {
    fn snapshot(
        &self,
        product_id: &ProductId,
        warehouse_id: Option<&WarehouseId>,
    ) -> EngineResult<Option<StockSnapshot>> {
        self.inner.snapshot(product_id, warehouse_id)
    }

    fn apply(
        &self,
        product_id: &ProductId,
        warehouse_id: Option<&WarehouseId>,
        values: &BTreeMap<Field, Value>,
        version: u64,
    ) -> EngineResult<StockSnapshot> {
        if self.down.load(Ordering::SeqCst) {
            return Err(EngineError::ledger("ledger offline"));
        }
        self.inner.apply(product_id, warehouse_id, values, version)
    }
}

#[tokio::test]
async fn failed_ledger_commit_stores_nothing() {
    let clock = Arc::new(ManualClock::default());
    let ledger = Arc::new(FlakyLedger::default());
    let store = InMemorySyncStore::arc();
    let website = Arc::new(InMemoryConnector::new("website"));
    let service = SyncService::builder(EngineConfig::default())
        .clock(clock.clone())
        .ledger(ledger.clone())
        .store(store.clone())
        .connector("website", website.clone())
        .build()
        .unwrap();
    let product = ProductId::new("DCB205");

    service.process_update(sale("pos_retail", "DCB205", 12)).await.unwrap();
    clock.advance_secs(5);

    ledger.down.store(true, Ordering::SeqCst);
    let err = service.process_update(sale("warehouse_main", "DCB205", 9)).await.unwrap_err();
    assert_eq!(err.code(), "LEDGER_ERROR");
    assert_eq!(store.updates_for_product(&product).unwrap().len(), 1);
    assert!(service.active_conflicts().unwrap().is_empty());
    assert_eq!(website.sent_records().len(), 1);

    // the retried write is detected against the first one exactly once
    ledger.down.store(false, Ordering::SeqCst);
    let retried = service.process_update(sale("warehouse_main", "DCB205", 9)).await.unwrap();
    assert_eq!(retried.conflicts.len(), 1);
    assert_eq!(service.active_conflicts().unwrap().len(), 1);
    let stored = store.updates_for_product(&product).unwrap();
    assert_eq!(stored.len(), 2);
    assert!(stored.iter().all(|u| u.processed));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn versions_strictly_increase_per_product(steps in proptest::collection::vec((0usize..3, 0i64..500, 0i64..90), 1..30)) {
        let runtime = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let h = Harness::new();
        let products = ["FLEXVOLT_9AH", "DCB609", "DCS391"];
        let channels = ["website", "pos_retail", "warehouse_main"];
        let mut last: HashMap<&str, u64> = HashMap::new();

        for (i, (product, qty, gap)) in steps.into_iter().enumerate() {
            h.clock.advance_secs(gap);
            let request = sale(channels[i % channels.len()], products[product], qty);
            let processed = runtime.block_on(h.service.process_update(request)).unwrap();
            let previous = last.insert(products[product], processed.update.version).unwrap_or(0);
            prop_assert!(processed.update.version > previous);
        }
    }
}
