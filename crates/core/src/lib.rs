//! `stocksync-core`: shared building blocks for the synchronization engine.
//!
//! This crate contains **pure** primitives (no IO): identifiers, the error
//! taxonomy, the per-product version counter and the clock abstraction.

pub mod clock;
pub mod error;
pub mod id;
pub mod version;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{EngineError, EngineResult};
pub use id::{BatchId, ChannelId, ConflictId, DeliveryId, ProductId, RuleId, UpdateId, WarehouseId};
pub use version::VersionManager;
