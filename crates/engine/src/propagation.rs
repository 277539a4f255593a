//! Propagation and per-channel delivery queues.
//!
//! Every accepted change becomes one [`Delivery`] per target channel. A
//! delivery is either sent right away (channel reachable, lane empty) or
//! parked on that channel's lane until the drain cycle. Sends to one channel
//! are serialized and paced by its rate limiter; channels never wait on each
//! other.
//!
//! Failure bookkeeping:
//! - retryable failures go back to the front of the lane with an attempt
//!   counter and a backoff
//! - exhausted or non-retryable deliveries move to the channel's dead-letter list
//! - nothing is dropped
//!
//! A lane is strictly FIFO: a delivery waiting out its backoff holds back
//! everything behind it, and a drain never sends a field the channel already
//! holds at a newer version.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use stocksync_channels::{ChannelRegistry, ConnectorError, ExternalRecord, SyncChannel};
use stocksync_core::{
    ChannelId, Clock, ConflictId, DeliveryId, EngineResult, ProductId, UpdateId, WarehouseId,
};
use stocksync_events::SharedSink;

use crate::conflict::{Resolution, SyncConflict};
use crate::events::SyncEvent;
use crate::retry::RetryPolicy;
use crate::rules::PropagationDecision;
use crate::store::SyncStore;
use crate::update::{Field, InventoryUpdate};

/// What a delivery carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeliverySource {
    Update { update_id: UpdateId },
    Resolution { conflict_id: ConflictId },
}

/// One change bound for one channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Delivery {
    pub id: DeliveryId,
    pub source: DeliverySource,
    /// Channel the change came from, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<ChannelId>,
    pub product_id: ProductId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warehouse_id: Option<WarehouseId>,
    pub version: u64,
    pub values: BTreeMap<Field, Value>,
    pub attempts: u32,
    /// Attempt limit overriding the channel's `retry_attempts`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest time of the next attempt (backoff).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

impl Delivery {
    pub fn for_update(
        update: &InventoryUpdate,
        values: BTreeMap<Field, Value>,
        max_attempts: Option<u32>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeliveryId::new(),
            source: DeliverySource::Update { update_id: update.id },
            origin: Some(update.source_channel.clone()),
            product_id: update.product_id.clone(),
            warehouse_id: update.warehouse_id.clone(),
            version: update.version,
            values,
            attempts: 0,
            max_attempts,
            enqueued_at: now,
            not_before: None,
            last_error: None,
        }
    }

    pub fn for_resolution(conflict: &SyncConflict, resolution: &Resolution, now: DateTime<Utc>) -> Self {
        Self {
            id: DeliveryId::new(),
            source: DeliverySource::Resolution { conflict_id: conflict.id },
            origin: None,
            product_id: conflict.product_id.clone(),
            warehouse_id: conflict.warehouse_id.clone(),
            version: resolution.version,
            values: resolution.resolved_values.clone(),
            attempts: 0,
            max_attempts: None,
            enqueued_at: now,
            not_before: None,
            last_error: None,
        }
    }

    /// Same payload, fresh identity, for another target.
    fn fork(&self) -> Self {
        Self {
            id: DeliveryId::new(),
            ..self.clone()
        }
    }

    pub fn update_id(&self) -> Option<UpdateId> {
        match self.source {
            DeliverySource::Update { update_id } => Some(update_id),
            DeliverySource::Resolution { .. } => None,
        }
    }

    pub fn is_ready(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_none_or(|at| at <= now)
    }

    /// The record in canonical field names.
    pub fn canonical_record(&self) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert("product_id".into(), Value::String(self.product_id.to_string()));
        if let Some(wh) = &self.warehouse_id {
            record.insert("warehouse_id".into(), Value::String(wh.to_string()));
        }
        record.insert("version".into(), Value::from(self.version));
        for (field, value) in &self.values {
            record.insert(field.as_str().to_string(), value.clone());
        }
        record
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub delivery: Delivery,
    pub channel_id: ChannelId,
    pub code: String,
    pub error: String,
    pub dead_lettered_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Lane {
    pending: VecDeque<Delivery>,
    dead: Vec<DeadLetter>,
}

/// Per-channel FIFO lanes plus dead-letter lists.
#[derive(Debug, Default)]
pub struct DeliveryQueues {
    lanes: Mutex<HashMap<ChannelId, Lane>>,
}

impl DeliveryQueues {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_lanes<R>(&self, f: impl FnOnce(&mut HashMap<ChannelId, Lane>) -> R) -> R {
        let mut lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut lanes)
    }

    pub fn enqueue(&self, channel_id: &ChannelId, delivery: Delivery) {
        self.with_lanes(|lanes| {
            lanes
                .entry(channel_id.clone())
                .or_default()
                .pending
                .push_back(delivery)
        });
    }

    /// Put deliveries back at the head of the lane, keeping their order.
    fn requeue_front(&self, channel_id: &ChannelId, deliveries: Vec<Delivery>) {
        if deliveries.is_empty() {
            return;
        }
        self.with_lanes(|lanes| {
            let lane = lanes.entry(channel_id.clone()).or_default();
            for d in deliveries.into_iter().rev() {
                lane.pending.push_front(d);
            }
        });
    }

    /// Remove up to `limit` deliveries from the head of the lane, stopping at
    /// the first one still in backoff.
    pub fn take_ready(&self, channel_id: &ChannelId, limit: usize, now: DateTime<Utc>) -> Vec<Delivery> {
        self.with_lanes(|lanes| {
            let Some(lane) = lanes.get_mut(channel_id) else {
                return Vec::new();
            };
            let mut taken = Vec::new();
            while taken.len() < limit && lane.pending.front().is_some_and(|d| d.is_ready(now)) {
                if let Some(d) = lane.pending.pop_front() {
                    taken.push(d);
                }
            }
            taken
        })
    }

    pub fn depth(&self, channel_id: &ChannelId) -> usize {
        self.with_lanes(|lanes| lanes.get(channel_id).map_or(0, |l| l.pending.len()))
    }

    pub fn total_depth(&self) -> usize {
        self.with_lanes(|lanes| lanes.values().map(|l| l.pending.len()).sum())
    }

    pub fn pending(&self, channel_id: &ChannelId) -> Vec<Delivery> {
        self.with_lanes(|lanes| {
            lanes
                .get(channel_id)
                .map(|l| l.pending.iter().cloned().collect())
                .unwrap_or_default()
        })
    }

    /// Channels with at least one pending delivery, ordered by id.
    pub fn channels_with_work(&self) -> Vec<ChannelId> {
        let mut ids: Vec<ChannelId> = self.with_lanes(|lanes| {
            lanes
                .iter()
                .filter(|(_, l)| !l.pending.is_empty())
                .map(|(id, _)| id.clone())
                .collect()
        });
        ids.sort();
        ids
    }

    fn dead_letter(&self, letter: DeadLetter) {
        self.with_lanes(|lanes| {
            lanes
                .entry(letter.channel_id.clone())
                .or_default()
                .dead
                .push(letter)
        });
    }

    pub fn dead_letters(&self, channel_id: &ChannelId) -> Vec<DeadLetter> {
        self.with_lanes(|lanes| lanes.get(channel_id).map(|l| l.dead.clone()).unwrap_or_default())
    }

    pub fn dead_letter_count(&self) -> usize {
        self.with_lanes(|lanes| lanes.values().map(|l| l.dead.len()).sum())
    }

    /// Move every dead letter of a channel back onto its lane with a fresh attempt budget.
    pub fn requeue_dead_letters(&self, channel_id: &ChannelId) -> usize {
        self.with_lanes(|lanes| {
            let Some(lane) = lanes.get_mut(channel_id) else {
                return 0;
            };
            let letters = std::mem::take(&mut lane.dead);
            let count = letters.len();
            for letter in letters {
                let mut d = letter.delivery;
                d.attempts = 0;
                d.not_before = None;
                lane.pending.push_back(d);
            }
            count
        })
    }
}

/// Where a propagated change went.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropagationReport {
    pub dispatched: Vec<ChannelId>,
    pub queued: Vec<ChannelId>,
    pub dead_lettered: Vec<ChannelId>,
}

/// Result of sending one chunk to one channel.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChunkOutcome {
    pub delivered: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub error: Option<ConnectorError>,
}

impl ChunkOutcome {
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrainReport {
    pub channel_id: ChannelId,
    /// Channel unreachable: lane left intact.
    pub skipped: bool,
    pub delivered: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    pub remaining: usize,
}

/// Target selection, immediate dispatch and lane draining.
pub struct Propagator {
    registry: Arc<ChannelRegistry>,
    store: Arc<dyn SyncStore>,
    clock: Arc<dyn Clock>,
    events: SharedSink<SyncEvent>,
    retry: RetryPolicy,
    queues: DeliveryQueues,
    send_locks: Mutex<HashMap<ChannelId, Arc<tokio::sync::Mutex<()>>>>,
    /// Newest version each channel holds, per product and field.
    held: Mutex<HashMap<HeldKey, BTreeMap<Field, u64>>>,
}

type HeldKey = (ChannelId, ProductId, Option<WarehouseId>);

impl core::fmt::Debug for Propagator {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Propagator")
            .field("retry", &self.retry)
            .field("queues", &self.queues)
            .finish_non_exhaustive()
    }
}

impl Propagator {
    pub fn new(
        registry: Arc<ChannelRegistry>,
        store: Arc<dyn SyncStore>,
        clock: Arc<dyn Clock>,
        events: SharedSink<SyncEvent>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            registry,
            store,
            clock,
            events,
            retry,
            queues: DeliveryQueues::new(),
            send_locks: Mutex::new(HashMap::new()),
            held: Mutex::new(HashMap::new()),
        }
    }

    pub fn queues(&self) -> &DeliveryQueues {
        &self.queues
    }

    /// Channels an update may be delivered to: explicit targets or every
    /// bidirectional channel, never the source, never twice.
    pub fn targets_for(
        &self,
        update: &InventoryUpdate,
        decision: &PropagationDecision,
    ) -> EngineResult<Vec<ChannelId>> {
        let candidates = if decision.targets.is_empty() {
            self.registry.outbound_targets(&update.source_channel)?
        } else {
            decision.targets.clone()
        };

        let mut seen = BTreeSet::new();
        Ok(candidates
            .into_iter()
            .filter(|c| *c != update.source_channel && !update.propagated.contains(c))
            .filter(|c| match self.registry.get(c) {
                Ok(channel) => channel.accepts_outbound(),
                Err(_) => {
                    warn!(update_id = %update.id, channel = %c, "rule targets unknown channel");
                    false
                }
            })
            .filter(|c| seen.insert(c.clone()))
            .collect())
    }

    /// Deliver an accepted update's `values` according to the rule decision.
    pub async fn propagate_update(
        &self,
        update: &InventoryUpdate,
        decision: &PropagationDecision,
        values: BTreeMap<Field, Value>,
    ) -> EngineResult<PropagationReport> {
        if decision.is_blocked() || values.is_empty() {
            return Ok(PropagationReport::default());
        }
        let targets = self.targets_for(update, decision)?;
        let template = Delivery::for_update(update, values, decision.retry_limit, self.clock.now());
        Ok(self
            .dispatch(targets, template, decision.queued, decision.immediate)
            .await)
    }

    /// Send a resolved value to every bidirectional channel, including the
    /// ones that already hold a superseded value.
    pub async fn propagate_resolution(&self, conflict: &SyncConflict) -> EngineResult<PropagationReport> {
        let Some(resolution) = &conflict.resolution else {
            return Ok(PropagationReport::default());
        };
        let targets: Vec<ChannelId> = self
            .registry
            .list()?
            .into_iter()
            .filter(|c| c.accepts_outbound() && !conflict.propagated.contains(&c.id))
            .map(|c| c.id)
            .collect();
        let template = Delivery::for_resolution(conflict, resolution, self.clock.now());
        Ok(self.dispatch(targets, template, false, false).await)
    }

    async fn dispatch(
        &self,
        targets: Vec<ChannelId>,
        template: Delivery,
        defer: bool,
        immediate: bool,
    ) -> PropagationReport {
        let mut report = PropagationReport::default();
        for target in targets {
            let delivery = template.fork();
            let now = self.clock.now();
            let reachable = self.registry.is_reachable(&target, now);

            // a lane with backlog keeps per-channel order: join it
            if defer || !reachable || self.queues.depth(&target) > 0 {
                self.queues.enqueue(&target, delivery);
                debug!(channel = %target, product = %template.product_id, "delivery queued");
                if immediate && reachable && !defer {
                    if let Err(err) = self.drain_channel(&target).await {
                        warn!(channel = %target, error = %err, "immediate drain failed");
                    }
                }
                report.queued.push(target);
                continue;
            }

            let channel = match self.registry.get(&target) {
                Ok(channel) => channel,
                Err(err) => {
                    warn!(channel = %target, error = %err, "target vanished");
                    continue;
                }
            };
            let outcome = self.deliver(&channel, vec![delivery]).await;
            if outcome.delivered > 0 {
                report.dispatched.push(target);
            } else if outcome.dead_lettered > 0 {
                report.dead_lettered.push(target);
            } else {
                report.queued.push(target);
            }
        }
        report
    }

    fn send_lock(&self, channel_id: &ChannelId) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.send_locks.lock().unwrap_or_else(PoisonError::into_inner);
        locks.entry(channel_id.clone()).or_default().clone()
    }

    /// One connector call for `deliveries`, serialized per channel and paced by
    /// its rate limiter, bounded by the channel timeout.
    async fn send(&self, channel: &SyncChannel, deliveries: &[Delivery]) -> Result<(), ConnectorError> {
        let lock = self.send_lock(&channel.id);
        let _serialized = lock.lock().await;

        let connector = self
            .registry
            .connector(&channel.id)
            .map_err(|e| ConnectorError::Unavailable(e.to_string()))?;
        let limiter = self
            .registry
            .rate_limiter(&channel.id)
            .map_err(|e| ConnectorError::Unavailable(e.to_string()))?;

        let wait = limiter
            .acquire(self.clock.now(), Instant::now())
            .map_err(|_| ConnectorError::RateLimited { retry_after: None })?;
        if !wait.is_zero() {
            tokio::time::sleep(wait).await;
        }

        let mapping = &channel.connectivity.field_mapping;
        let records: Vec<ExternalRecord> = deliveries
            .iter()
            .map(|d| mapping.to_external(&d.canonical_record()))
            .collect();

        let started = Instant::now();
        let timeout = channel.timeout();
        let result = match tokio::time::timeout(timeout, connector.send_updates(records)).await {
            Ok(result) => result,
            Err(_) => Err(ConnectorError::Timeout(timeout)),
        };
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
        if let Err(err) = self.registry.record_call(&channel.id, latency_ms, result.is_ok()) {
            warn!(channel = %channel.id, error = %err, "failed to record call");
        }
        result
    }

    /// Send a chunk and do all bookkeeping: propagated sets on success,
    /// requeue or dead-letter on failure.
    pub async fn deliver(&self, channel: &SyncChannel, deliveries: Vec<Delivery>) -> ChunkOutcome {
        if deliveries.is_empty() {
            return ChunkOutcome::default();
        }
        match self.send(channel, &deliveries).await {
            Ok(()) => {
                for d in &deliveries {
                    self.mark_delivered(&channel.id, d);
                }
                debug!(channel = %channel.id, count = deliveries.len(), "deliveries sent");
                ChunkOutcome {
                    delivered: deliveries.len(),
                    ..ChunkOutcome::default()
                }
            }
            Err(err) => self.handle_failure(channel, deliveries, err),
        }
    }

    fn mark_delivered(&self, channel_id: &ChannelId, delivery: &Delivery) {
        self.record_held(channel_id, delivery);
        let result = match delivery.source {
            DeliverySource::Update { update_id } => self.store.mark_propagated(update_id, channel_id),
            DeliverySource::Resolution { conflict_id } => {
                self.store.mark_resolution_propagated(conflict_id, channel_id)
            }
        };
        if let Err(err) = result {
            // purged between send and bookkeeping
            debug!(channel = %channel_id, delivery = %delivery.id, error = %err, "delivery bookkeeping skipped");
        }
    }

    fn record_held(&self, channel_id: &ChannelId, delivery: &Delivery) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let versions = held
            .entry((channel_id.clone(), delivery.product_id.clone(), delivery.warehouse_id.clone()))
            .or_default();
        for field in delivery.values.keys() {
            let version = versions.entry(*field).or_insert(0);
            *version = (*version).max(delivery.version);
        }
    }

    /// Drop the fields the channel already holds at a newer version.
    /// Returns `false` when nothing is left to send.
    fn strip_superseded(&self, channel_id: &ChannelId, delivery: &mut Delivery) -> bool {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let key = (channel_id.clone(), delivery.product_id.clone(), delivery.warehouse_id.clone());
        if let Some(versions) = held.get(&key) {
            let version = delivery.version;
            delivery
                .values
                .retain(|field, _| versions.get(field).is_none_or(|held| *held <= version));
        }
        !delivery.values.is_empty()
    }

    fn handle_failure(&self, channel: &SyncChannel, deliveries: Vec<Delivery>, err: ConnectorError) -> ChunkOutcome {
        let now = self.clock.now();
        let mut requeue = Vec::new();
        let mut dead = 0;

        for mut d in deliveries {
            d.attempts += 1;
            d.last_error = Some(err.to_string());
            let limit = d.max_attempts.unwrap_or(channel.config.retry_attempts);

            if err.retryable() && channel.features.auto_retry && d.attempts <= limit {
                let backoff = chrono::Duration::from_std(self.retry.delay_for_attempt(d.attempts))
                    .unwrap_or_else(|_| chrono::Duration::zero());
                d.not_before = Some(now + backoff);
                requeue.push(d);
            } else {
                warn!(
                    channel = %channel.id,
                    delivery = %d.id,
                    product = %d.product_id,
                    attempts = d.attempts,
                    code = err.code(),
                    "delivery dead-lettered"
                );
                self.queues.dead_letter(DeadLetter {
                    channel_id: channel.id.clone(),
                    code: err.code().to_string(),
                    error: err.to_string(),
                    dead_lettered_at: now,
                    delivery: d,
                });
                dead += 1;
            }
        }

        let requeued = requeue.len();
        self.queues.requeue_front(&channel.id, requeue);

        warn!(channel = %channel.id, code = err.code(), requeued, dead, "delivery failed");
        self.events.emit(SyncEvent::SyncError {
            channel_id: channel.id.clone(),
            code: err.code().to_string(),
            message: err.to_string(),
            retryable: err.retryable(),
            at: now,
        });

        ChunkOutcome {
            delivered: 0,
            requeued,
            dead_lettered: dead,
            error: Some(err),
        }
    }

    fn already_delivered(&self, channel_id: &ChannelId, delivery: &Delivery) -> bool {
        let delivered = match delivery.source {
            DeliverySource::Update { update_id } => self
                .store
                .get_update(update_id)
                .ok()
                .flatten()
                .map(|u| u.propagated.contains(channel_id)),
            DeliverySource::Resolution { conflict_id } => self
                .store
                .get_conflict(conflict_id)
                .ok()
                .flatten()
                .map(|c| c.propagated.contains(channel_id)),
        };
        delivered.unwrap_or(false)
    }

    /// Take up to `limit` ready deliveries off a lane, minus any the channel
    /// already has or holds a newer value for.
    pub fn take_pending(&self, channel_id: &ChannelId, limit: usize) -> Vec<Delivery> {
        loop {
            let mut taken = self.queues.take_ready(channel_id, limit, self.clock.now());
            if taken.is_empty() {
                return taken;
            }
            taken.retain_mut(|d| {
                if self.already_delivered(channel_id, d) {
                    return false;
                }
                if self.strip_superseded(channel_id, d) {
                    return true;
                }
                debug!(channel = %channel_id, delivery = %d.id, product = %d.product_id, "superseded delivery skipped");
                self.mark_delivered(channel_id, d);
                false
            });
            if !taken.is_empty() {
                return taken;
            }
        }
    }

    /// Flush one channel's lane in chunk-sized calls. Stops at the first
    /// failure; unreachable channels are skipped with the lane left intact.
    pub async fn drain_channel(&self, channel_id: &ChannelId) -> EngineResult<DrainReport> {
        let mut report = DrainReport {
            channel_id: channel_id.clone(),
            skipped: false,
            delivered: 0,
            requeued: 0,
            dead_lettered: 0,
            remaining: 0,
        };
        if !self.registry.is_reachable(channel_id, self.clock.now()) {
            report.skipped = true;
            report.remaining = self.queues.depth(channel_id);
            return Ok(report);
        }
        let channel = self.registry.get(channel_id)?;

        loop {
            let chunk = self.take_pending(channel_id, channel.chunk_size());
            if chunk.is_empty() {
                break;
            }
            let outcome = self.deliver(&channel, chunk).await;
            report.delivered += outcome.delivered;
            report.requeued += outcome.requeued;
            report.dead_lettered += outcome.dead_lettered;
            if !outcome.is_success() {
                break;
            }
        }

        report.remaining = self.queues.depth(channel_id);
        if report.delivered > 0 || report.requeued > 0 {
            info!(
                channel = %channel_id,
                delivered = report.delivered,
                requeued = report.requeued,
                remaining = report.remaining,
                "lane drained"
            );
        }
        Ok(report)
    }

    /// Drain every lane with pending work, channels in parallel.
    pub async fn drain_all(self: &Arc<Self>) -> Vec<DrainReport> {
        let mut tasks = JoinSet::new();
        for channel_id in self.queues.channels_with_work() {
            let this = Arc::clone(self);
            tasks.spawn(async move { this.drain_channel(&channel_id).await });
        }

        let mut reports = Vec::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(report)) => reports.push(report),
                Ok(Err(err)) => warn!(error = %err, "lane drain failed"),
                Err(err) => error!(error = %err, "lane drain task panicked"),
            }
        }
        reports.sort_by(|a, b| a.channel_id.cmp(&b.channel_id));
        reports
    }
}
