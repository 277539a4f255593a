//! Synchronization channel model: static configuration + live health snapshot.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use stocksync_core::{ChannelId, EngineError, EngineResult};

use crate::mapping::FieldMapping;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelType {
    Marketplace,
    Pos,
    Warehouse,
    Api,
    Partner,
    Internal,
}

/// Lifecycle status. Channels are never deleted at runtime, only deactivated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelStatus {
    Active,
    Inactive,
    Error,
    Maintenance,
}

impl ChannelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelStatus::Active => "active",
            ChannelStatus::Inactive => "inactive",
            ChannelStatus::Error => "error",
            ChannelStatus::Maintenance => "maintenance",
        }
    }
}

impl core::str::FromStr for ChannelStatus {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "active" => Ok(ChannelStatus::Active),
            "inactive" => Ok(ChannelStatus::Inactive),
            "error" => Ok(ChannelStatus::Error),
            "maintenance" => Ok(ChannelStatus::Maintenance),
            other => Err(EngineError::validation(format!(
                "unknown channel status '{other}' (expected active, inactive, error, maintenance)"
            ))),
        }
    }
}

/// Sync cadence and delivery tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Minimum seconds between two non-forced inbound syncs.
    pub sync_frequency_secs: u64,
    /// Records per outbound chunk.
    pub batch_size: usize,
    /// Delivery attempts before a record is dead-lettered.
    pub retry_attempts: u32,
    /// Per connector call timeout.
    pub timeout_ms: u64,
    /// 1 (lowest) to 10 (highest); used by the `highest_priority` strategy.
    pub priority: u8,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            sync_frequency_secs: 300,
            batch_size: 100,
            retry_attempts: 3,
            timeout_ms: 30_000,
            priority: 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
    Rest,
    Graphql,
    Soap,
    Webhook,
    Sftp,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthKind {
    #[default]
    None,
    ApiKey,
    Oauth2,
    Basic,
    Certificate,
}

/// How to authenticate against the channel. Secrets are referenced, never inlined.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AuthDescriptor {
    #[serde(default)]
    pub kind: AuthKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connectivity {
    pub protocol: Protocol,
    #[serde(default)]
    pub auth: AuthDescriptor,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub field_mapping: FieldMapping,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self {
            protocol: Protocol::Internal,
            auth: AuthDescriptor::default(),
            endpoint: None,
            field_mapping: FieldMapping::default(),
        }
    }
}

/// Capability flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelFeatures {
    /// Channel accepts outbound updates. Without it the channel is receive-only
    /// and is never a propagation target.
    pub bidirectional_sync: bool,
    pub real_time_sync: bool,
    pub batch_sync: bool,
    pub delta_sync: bool,
    pub conflict_resolution: bool,
    pub auto_retry: bool,
}

impl Default for ChannelFeatures {
    fn default() -> Self {
        Self {
            bidirectional_sync: true,
            real_time_sync: false,
            batch_sync: true,
            delta_sync: false,
            conflict_resolution: true,
            auto_retry: true,
        }
    }
}

/// Live performance snapshot, mutated by sync cycles, deliveries and health checks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelPerformance {
    pub last_sync: Option<DateTime<Utc>>,
    pub last_successful_sync: Option<DateTime<Utc>>,
    /// Exponentially weighted average call latency.
    pub latency_ms: f64,
    /// Exponentially weighted failure ratio (0.0-1.0).
    pub error_rate: f64,
    /// Records per second observed in the last sync cycle.
    pub throughput: f64,
    /// Percentage of successful health checks.
    pub availability: f64,
    pub health_checks: u64,
    pub healthy_checks: u64,
}

impl Default for ChannelPerformance {
    fn default() -> Self {
        Self {
            last_sync: None,
            last_successful_sync: None,
            latency_ms: 0.0,
            error_rate: 0.0,
            throughput: 0.0,
            availability: 100.0,
            health_checks: 0,
            healthy_checks: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimits {
    /// `None` means unthrottled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_requests_per_second: Option<f64>,
    pub max_batch_size: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub daily_limit: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub monthly_limit: Option<u64>,
}

impl Default for RateLimits {
    fn default() -> Self {
        Self {
            max_requests_per_second: None,
            max_batch_size: 500,
            daily_limit: None,
            monthly_limit: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncChannel {
    pub id: ChannelId,
    pub name: String,
    #[serde(rename = "type")]
    pub channel_type: ChannelType,
    pub status: ChannelStatus,
    #[serde(default)]
    pub config: ChannelConfig,
    #[serde(default)]
    pub connectivity: Connectivity,
    #[serde(default)]
    pub features: ChannelFeatures,
    #[serde(default)]
    pub performance: ChannelPerformance,
    #[serde(default)]
    pub rate_limits: RateLimits,
}

impl SyncChannel {
    pub fn new(id: impl Into<String>, name: impl Into<String>, channel_type: ChannelType) -> Self {
        Self {
            id: ChannelId::new(id),
            name: name.into(),
            channel_type,
            status: ChannelStatus::Active,
            config: ChannelConfig::default(),
            connectivity: Connectivity::default(),
            features: ChannelFeatures::default(),
            performance: ChannelPerformance::default(),
            rate_limits: RateLimits::default(),
        }
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.config.priority = priority;
        self
    }

    pub fn with_bidirectional(mut self, bidirectional: bool) -> Self {
        self.features.bidirectional_sync = bidirectional;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.config.batch_size = batch_size;
        self
    }

    pub fn with_sync_frequency(mut self, secs: u64) -> Self {
        self.config.sync_frequency_secs = secs;
        self
    }

    pub fn with_field_mapping(mut self, mapping: FieldMapping) -> Self {
        self.connectivity.field_mapping = mapping;
        self
    }

    pub fn is_active(&self) -> bool {
        self.status == ChannelStatus::Active
    }

    /// Whether the channel may ever be selected as a propagation target.
    pub fn accepts_outbound(&self) -> bool {
        self.features.bidirectional_sync
    }

    /// Outbound chunk size: configured batch size capped by the channel's rate limit.
    pub fn chunk_size(&self) -> usize {
        self.config
            .batch_size
            .min(self.rate_limits.max_batch_size)
            .max(1)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }

    pub fn sync_frequency(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.config.sync_frequency_secs as i64)
    }

    /// Validate static configuration (called when channels are loaded).
    pub fn validate(&self) -> EngineResult<()> {
        if self.name.trim().is_empty() {
            return Err(EngineError::validation(format!("channel {}: name cannot be empty", self.id)));
        }
        if !(1..=10).contains(&self.config.priority) {
            return Err(EngineError::validation(format!(
                "channel {}: priority must be within 1..=10 (got {})",
                self.id, self.config.priority
            )));
        }
        if self.config.batch_size == 0 {
            return Err(EngineError::validation(format!("channel {}: batch_size must be > 0", self.id)));
        }
        if self.config.timeout_ms == 0 {
            return Err(EngineError::validation(format!("channel {}: timeout_ms must be > 0", self.id)));
        }
        if let Some(rps) = self.rate_limits.max_requests_per_second {
            if !(rps > 0.0) {
                return Err(EngineError::validation(format!(
                    "channel {}: max_requests_per_second must be positive",
                    self.id
                )));
            }
        }
        Ok(())
    }
}
