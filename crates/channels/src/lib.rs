//! Channel registry and connector interface.
//!
//! A *channel* is an external or internal system holding its own copy of
//! inventory state (storefront, marketplace, POS, warehouse, partner API).
//! This crate owns:
//! - the static + live channel model ([`SyncChannel`])
//! - the [`ChannelRegistry`], the only place connectors are looked up
//! - the [`ChannelConnector`] capability interface (the only network IO surface)
//! - field mapping between external record shapes and canonical fields
//! - per-channel rate limiting

pub mod channel;
pub mod connector;
pub mod mapping;
pub mod memory;
pub mod rate_limit;
pub mod registry;

pub use channel::{
    AuthDescriptor, AuthKind, ChannelConfig, ChannelFeatures, ChannelPerformance, ChannelStatus,
    ChannelType, Connectivity, Protocol, RateLimits, SyncChannel,
};
pub use connector::{ChannelConnector, ConnectorError, ErrorKind, ExternalRecord};
pub use mapping::FieldMapping;
pub use memory::InMemoryConnector;
pub use rate_limit::{RateLimitExceeded, RateLimiter};
pub use registry::{ChannelRegistry, HealthReading, SyncOutcome};
