//! Synchronization engine: ingest, conflict handling, rules, propagation and batch sync.
//!
//! Data flow for one change:
//! Update Ingest (version stamp) → Conflict Detector → Rule Engine →
//! ledger commit → Propagator → channel connectors.
//! The Batch Processor drives the same pipeline for bulk cycles, and the
//! scheduler runs the recurring maintenance tasks.

pub mod batch;
pub mod config;
pub mod conflict;
pub mod events;
pub mod ingest;
pub mod ledger;
pub mod metrics;
pub mod propagation;
pub mod resolver;
pub mod retry;
pub mod rules;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod update;

#[cfg(test)]
mod integration_tests;

pub use batch::{BatchStatus, BatchSummary, SyncBatch, SyncDirection, SyncError};
pub use config::{ConfigError, EngineConfig};
pub use conflict::{ConflictSeverity, ConflictType, ResolutionStrategy, SyncConflict};
pub use events::SyncEvent;
pub use ledger::{InMemoryLedger, InventoryLedger, StockSnapshot};
pub use metrics::{SyncMetrics, TimeWindow};
pub use rules::{RuleAction, RuleCondition, SyncRule};
pub use scheduler::{MaintenanceTask, Scheduler, SchedulerHandle};
pub use service::{ProcessedUpdate, SyncService, SyncServiceBuilder};
pub use store::{InMemorySyncStore, SyncStore};
pub use update::{Field, InventoryUpdate, UpdateRequest, UpdateSource};
