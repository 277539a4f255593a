//! `SyncService`: the orchestrator wiring every component together.
//!
//! Constructed once at process start through [`SyncServiceBuilder`]; all
//! collaborators are injected so tests can swap in fakes and a manual clock.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::Duration;
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use stocksync_channels::{ChannelConnector, ChannelRegistry, ChannelStatus, HealthReading, SyncChannel};
use stocksync_core::{
    ChannelId, Clock, ConflictId, EngineError, EngineResult, SystemClock, UpdateId, VersionManager,
};
use stocksync_events::{EventSink, NullSink, SharedSink};

use crate::batch::{BatchProcessor, PipelineOutcome, SyncBatch, UpdatePipeline};
use crate::config::EngineConfig;
use crate::conflict::{ConflictDetector, ResolutionStrategy, SyncConflict};
use crate::events::SyncEvent;
use crate::ingest::{ProductGate, UpdateIngest};
use crate::ledger::{InMemoryLedger, InventoryLedger};
use crate::metrics::{MetricsCollector, SyncMetrics, TimeWindow};
use crate::propagation::{DeadLetter, Delivery, DrainReport, PropagationReport, Propagator};
use crate::resolver::ConflictResolver;
use crate::rules::{PropagationDecision, RuleEngine};
use crate::store::{InMemorySyncStore, PurgeStats, SyncStore};
use crate::update::{InventoryUpdate, UpdateRequest};

/// Everything `process_update` did with one request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedUpdate {
    pub update: InventoryUpdate,
    pub conflicts: Vec<SyncConflict>,
    /// Unresolved conflicts the update joined as another contender.
    pub joined: Vec<ConflictId>,
    pub decision: PropagationDecision,
    pub propagation: PropagationReport,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HealthReport {
    pub channel_id: ChannelId,
    pub healthy: bool,
    pub latency_ms: f64,
    pub status: ChannelStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub channel_id: ChannelId,
    pub depth: usize,
    pub pending: Vec<Delivery>,
    pub dead_letters: Vec<DeadLetter>,
}

pub struct SyncServiceBuilder {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    store: Arc<dyn SyncStore>,
    ledger: Arc<dyn InventoryLedger>,
    events: SharedSink<SyncEvent>,
    connectors: HashMap<ChannelId, Arc<dyn ChannelConnector>>,
}

impl SyncServiceBuilder {
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn store(mut self, store: Arc<dyn SyncStore>) -> Self {
        self.store = store;
        self
    }

    pub fn ledger(mut self, ledger: Arc<dyn InventoryLedger>) -> Self {
        self.ledger = ledger;
        self
    }

    pub fn events(mut self, events: SharedSink<SyncEvent>) -> Self {
        self.events = events;
        self
    }

    /// Attach the connector for a configured channel.
    pub fn connector(mut self, channel_id: impl Into<String>, connector: Arc<dyn ChannelConnector>) -> Self {
        self.connectors.insert(ChannelId::new(channel_id), connector);
        self
    }

    pub fn build(mut self) -> EngineResult<SyncService> {
        self.config
            .validate()
            .map_err(|e| EngineError::validation(e.to_string()))?;

        let registry = Arc::new(ChannelRegistry::new());
        for channel in &self.config.channels {
            let connector = self.connectors.remove(&channel.id);
            if connector.is_none() {
                warn!(channel = %channel.id, "no connector attached; channel will queue outbound work");
            }
            registry.register(channel.clone(), connector)?;
        }
        if let Some(extra) = self.connectors.keys().next() {
            return Err(EngineError::ChannelNotFound(extra.clone()));
        }

        let versions = Arc::new(VersionManager::new());
        let gate = Arc::new(ProductGate::new());
        let detector = ConflictDetector::new(self.config.detection_window());
        let rules = RuleEngine::new(self.config.rules.clone())?;

        let propagator = Arc::new(Propagator::new(
            registry.clone(),
            self.store.clone(),
            self.clock.clone(),
            self.events.clone(),
            self.config.retry.clone(),
        ));

        Ok(SyncService {
            ingest: UpdateIngest::new(
                registry.clone(),
                versions.clone(),
                self.ledger.clone(),
                self.store.clone(),
                self.clock.clone(),
                detector,
                gate.clone(),
            ),
            resolver: ConflictResolver::new(
                registry.clone(),
                versions,
                self.ledger.clone(),
                self.store.clone(),
                self.clock.clone(),
                gate.clone(),
            ),
            batches: BatchProcessor::new(
                registry.clone(),
                self.store.clone(),
                self.clock.clone(),
                self.events.clone(),
                propagator.clone(),
            ),
            metrics: MetricsCollector::new(registry.clone(), self.store.clone(), self.clock.clone()),
            retention: self.config.retention(),
            config: self.config,
            rules,
            registry,
            ledger: self.ledger,
            store: self.store,
            clock: self.clock,
            events: self.events,
            gate,
            propagator,
        })
    }
}

pub struct SyncService {
    config: EngineConfig,
    registry: Arc<ChannelRegistry>,
    ledger: Arc<dyn InventoryLedger>,
    store: Arc<dyn SyncStore>,
    clock: Arc<dyn Clock>,
    events: SharedSink<SyncEvent>,
    gate: Arc<ProductGate>,
    ingest: UpdateIngest,
    rules: RuleEngine,
    resolver: ConflictResolver,
    propagator: Arc<Propagator>,
    batches: BatchProcessor,
    metrics: MetricsCollector,
    retention: Duration,
}

impl core::fmt::Debug for SyncService {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncService")
            .field("registry", &self.registry)
            .field("rules", &self.rules.rules().len())
            .finish_non_exhaustive()
    }
}

impl SyncService {
    /// Builder with in-memory store and ledger, wall clock and no event sink.
    pub fn builder(config: EngineConfig) -> SyncServiceBuilder {
        SyncServiceBuilder {
            config,
            clock: Arc::new(SystemClock),
            store: InMemorySyncStore::arc(),
            ledger: Arc::new(InMemoryLedger::new()),
            events: Arc::new(NullSink),
            connectors: HashMap::new(),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    pub fn ledger(&self) -> &Arc<dyn InventoryLedger> {
        &self.ledger
    }

    pub fn propagator(&self) -> &Arc<Propagator> {
        &self.propagator
    }

    /// Announce the registered channels. Safe to call more than once.
    pub fn initialize(&self) -> EngineResult<Vec<ChannelId>> {
        let channels: Vec<ChannelId> = self.registry.list()?.into_iter().map(|c| c.id).collect();
        info!(count = channels.len(), "channels initialized");
        self.events.emit(SyncEvent::ChannelsInitialized {
            channels: channels.clone(),
            at: self.clock.now(),
        });
        Ok(channels)
    }

    // --- updates -------------------------------------------------------------

    /// Ingest → detect → rules → ledger commit → propagate.
    ///
    /// A rule-blocked update is stored but neither committed nor propagated.
    /// Fields held by a blocking conflict are withheld from both until resolution.
    pub async fn process_update(&self, request: UpdateRequest) -> EngineResult<ProcessedUpdate> {
        let now = self.clock.now();
        let (ingested, (decision, values)) = self.ingest.ingest_and_then(request, |ingested| {
            let update = &mut ingested.update;
            let decision = self.rules.evaluate(update, now);

            let values = if let Some(reason) = &decision.blocked {
                update.blocked_reason = Some(reason.clone());
                BTreeMap::new()
            } else {
                let mut values = update.current_values();
                values.retain(|field, _| !update.withheld_fields.contains(field));
                decision.apply_transforms(&mut values);
                if !values.is_empty() {
                    self.ledger.apply(
                        &update.product_id,
                        update.warehouse_id.as_ref(),
                        &values,
                        update.version,
                    )?;
                }
                values
            };
            update.processed = true;
            Ok((decision, values))
        })?;
        let update = ingested.update.clone();

        for conflict in &ingested.conflicts {
            self.events.emit(SyncEvent::ConflictDetected {
                conflict_id: conflict.id,
                product_id: conflict.product_id.clone(),
                field: conflict.field,
                severity: conflict.severity,
                at: now,
            });
        }
        for alert in &decision.alerts {
            warn!(
                update_id = %update.id,
                product = %update.product_id,
                rule_id = %alert.rule_id,
                level = ?alert.level,
                "{}", alert.message
            );
            self.events.emit(SyncEvent::AlertRaised {
                update_id: update.id,
                rule_id: alert.rule_id,
                level: alert.level,
                message: alert.message.clone(),
                at: now,
            });
        }
        if let Some(reason) = &update.blocked_reason {
            info!(update_id = %update.id, product = %update.product_id, reason, "update blocked by rule");
        }

        let propagation = self.propagator.propagate_update(&update, &decision, values).await?;

        self.events.emit(SyncEvent::UpdateProcessed {
            update_id: update.id,
            product_id: update.product_id.clone(),
            source_channel: update.source_channel.clone(),
            version: update.version,
            dispatched: propagation.dispatched.clone(),
            queued: propagation.queued.clone(),
            conflicts: update.conflicts.len(),
            blocked: update.blocked_reason.is_some(),
            at: self.clock.now(),
        });
        debug!(
            update_id = %update.id,
            dispatched = propagation.dispatched.len(),
            queued = propagation.queued.len(),
            "update processed"
        );

        let update = self.store.get_update(update.id)?.unwrap_or(update);
        Ok(ProcessedUpdate {
            update,
            conflicts: ingested.conflicts,
            joined: ingested.joined,
            decision,
            propagation,
        })
    }

    pub fn get_update(&self, id: UpdateId) -> EngineResult<InventoryUpdate> {
        self.store.get_update(id)?.ok_or(EngineError::UpdateNotFound(id))
    }

    // --- conflicts -----------------------------------------------------------

    pub fn active_conflicts(&self) -> EngineResult<Vec<SyncConflict>> {
        self.store.active_conflicts()
    }

    pub fn get_conflict(&self, id: ConflictId) -> EngineResult<SyncConflict> {
        self.store.get_conflict(id)?.ok_or(EngineError::ConflictNotFound(id))
    }

    /// Resolve, commit, and re-propagate the outcome to every bidirectional
    /// channel, including ones holding a superseded value.
    pub async fn resolve_conflict(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        resolved_by: &str,
        manual_value: Option<Value>,
    ) -> EngineResult<SyncConflict> {
        let conflict = self.resolver.resolve(id, strategy, resolved_by, manual_value)?;
        let report = self.propagator.propagate_resolution(&conflict).await?;

        let resolved_value = conflict
            .resolution
            .as_ref()
            .map(|r| r.resolved_value.clone())
            .unwrap_or(Value::Null);
        self.events.emit(SyncEvent::ConflictResolved {
            conflict_id: conflict.id,
            product_id: conflict.product_id.clone(),
            strategy,
            resolved_by: resolved_by.to_string(),
            resolved_value,
            at: self.clock.now(),
        });
        debug!(
            conflict_id = %conflict.id,
            dispatched = report.dispatched.len(),
            queued = report.queued.len(),
            "resolution propagated"
        );
        Ok(self.store.get_conflict(id)?.unwrap_or(conflict))
    }

    /// Settle every active low-severity or version conflict by last-write-wins.
    pub async fn auto_resolve_conflicts(&self) -> EngineResult<usize> {
        let mut resolved = 0;
        for conflict in self.store.active_conflicts()? {
            if !conflict.is_auto_resolvable() {
                continue;
            }
            match self
                .resolve_conflict(conflict.id, ResolutionStrategy::LastWriteWins, "system", None)
                .await
            {
                Ok(_) => resolved += 1,
                Err(EngineError::ConflictAlreadyResolved(_)) => {}
                Err(err) => warn!(conflict_id = %conflict.id, error = %err, "auto-resolution failed"),
            }
        }
        if resolved > 0 {
            info!(resolved, "conflicts auto-resolved");
        }
        Ok(resolved)
    }

    // --- batch sync ----------------------------------------------------------

    pub async fn sync_from_channel(&self, channel_id: &ChannelId, force: bool) -> EngineResult<SyncBatch> {
        self.batches.sync_from_channel(channel_id, force, self).await
    }

    pub async fn sync_to_channel(
        &self,
        channel_id: &ChannelId,
        update_ids: Option<Vec<UpdateId>>,
    ) -> EngineResult<SyncBatch> {
        self.batches.sync_to_channel(channel_id, update_ids).await
    }

    /// Batches started within `window`, newest first.
    pub fn batches(&self, window: TimeWindow, channel_id: Option<&ChannelId>) -> EngineResult<Vec<SyncBatch>> {
        self.store
            .batches_since(self.clock.now() - window.duration(), channel_id)
    }

    // --- maintenance ---------------------------------------------------------

    pub async fn drain_queues(&self) -> Vec<DrainReport> {
        self.propagator.drain_all().await
    }

    /// Health-check every active or errored channel; flip status on failure/recovery.
    pub async fn check_channel_health(&self) -> EngineResult<Vec<HealthReport>> {
        let mut reports = Vec::new();
        for channel in self.registry.list()? {
            if !matches!(channel.status, ChannelStatus::Active | ChannelStatus::Error) {
                continue;
            }
            let Ok(connector) = self.registry.connector(&channel.id) else {
                continue;
            };

            let started = Instant::now();
            let healthy = matches!(
                tokio::time::timeout(channel.timeout(), connector.health_check()).await,
                Ok(Ok(()))
            );
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            self.registry
                .record_health(&channel.id, HealthReading { healthy, latency_ms })?;

            let status = match (channel.status, healthy) {
                (ChannelStatus::Active, false) => {
                    warn!(channel = %channel.id, "channel failed health check");
                    self.set_channel_status(&channel.id, ChannelStatus::Error)?.status
                }
                (ChannelStatus::Error, true) => {
                    info!(channel = %channel.id, "channel recovered");
                    self.set_channel_status(&channel.id, ChannelStatus::Active)?.status
                }
                (status, _) => status,
            };
            reports.push(HealthReport {
                channel_id: channel.id,
                healthy,
                latency_ms,
                status,
            });
        }
        Ok(reports)
    }

    /// Purge data older than the retention window. Active conflicts are kept.
    pub fn cleanup_stale_data(&self) -> EngineResult<PurgeStats> {
        let cutoff = self.clock.now() - self.retention;
        let stats = self.store.purge_before(cutoff)?;
        let gates = self.gate.prune();
        if stats.total() > 0 {
            info!(
                updates = stats.updates,
                conflicts = stats.conflicts,
                batches = stats.batches,
                gates,
                "stale data purged"
            );
        }
        Ok(stats)
    }

    // --- reporting & channels ------------------------------------------------

    pub fn metrics(&self, window: TimeWindow) -> EngineResult<SyncMetrics> {
        self.metrics.collect(window, self.propagator.queues())
    }

    pub fn channels(&self) -> EngineResult<Vec<SyncChannel>> {
        self.registry.list()
    }

    pub fn channel(&self, channel_id: &ChannelId) -> EngineResult<SyncChannel> {
        self.registry.get(channel_id)
    }

    pub fn set_channel_status(&self, channel_id: &ChannelId, status: ChannelStatus) -> EngineResult<SyncChannel> {
        let previous = self.registry.set_status(channel_id, status)?;
        if previous != status {
            self.events.emit(SyncEvent::ChannelStatusChanged {
                channel_id: channel_id.clone(),
                from: previous,
                to: status,
                at: self.clock.now(),
            });
        }
        self.registry.get(channel_id)
    }

    pub fn queue_status(&self, channel_id: &ChannelId) -> EngineResult<QueueStatus> {
        self.registry.get(channel_id)?;
        let queues = self.propagator.queues();
        Ok(QueueStatus {
            channel_id: channel_id.clone(),
            depth: queues.depth(channel_id),
            pending: queues.pending(channel_id),
            dead_letters: queues.dead_letters(channel_id),
        })
    }

    /// Move a channel's dead letters back onto its lane with fresh attempt counters.
    pub fn requeue_dead_letters(&self, channel_id: &ChannelId) -> EngineResult<usize> {
        self.registry.get(channel_id)?;
        let count = self.propagator.queues().requeue_dead_letters(channel_id);
        if count > 0 {
            info!(channel = %channel_id, count, "dead letters re-queued");
        }
        Ok(count)
    }
}

#[async_trait]
impl UpdatePipeline for SyncService {
    async fn apply(&self, request: UpdateRequest) -> EngineResult<PipelineOutcome> {
        let processed = self.process_update(request).await?;
        Ok(PipelineOutcome {
            update_id: processed.update.id,
            conflicted: !processed.update.conflicts.is_empty(),
        })
    }
}
