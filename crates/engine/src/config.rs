//! Engine configuration: timers, windows, channels and rules.
//!
//! Loaded once at startup from a JSON file (`STOCKSYNC_CONFIG`), otherwise the
//! built-in demo setup. Only channel status and performance change afterwards.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use stocksync_channels::{ChannelType, FieldMapping, Protocol, SyncChannel};

use crate::retry::RetryPolicy;
use crate::rules::{AlertLevel, Operator, RuleAction, RuleCondition, SyncRule, TransformOp};
use crate::update::Field;

pub const CONFIG_ENV: &str = "STOCKSYNC_CONFIG";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    /// Lookback for concurrent-update detection.
    pub detection_window_secs: u64,
    /// Updates, resolved conflicts and finished batches older than this are purged.
    pub retention_hours: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            detection_window_secs: 30,
            retention_hours: 24,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimerSettings {
    pub queue_drain_secs: u64,
    pub health_check_secs: u64,
    pub auto_resolve_secs: u64,
    pub cleanup_secs: u64,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            queue_drain_secs: 10,
            health_check_secs: 60,
            auto_resolve_secs: 30,
            cleanup_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sync: SyncSettings,
    pub timers: TimerSettings,
    pub retry: RetryPolicy,
    pub channels: Vec<SyncChannel>,
    pub rules: Vec<SyncRule>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sync: SyncSettings::default(),
            timers: TimerSettings::default(),
            retry: RetryPolicy::default(),
            channels: default_channels(),
            rules: default_rules(),
        }
    }
}

impl EngineConfig {
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_json::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// File named by `STOCKSYNC_CONFIG`, or the built-in defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(std::env::var_os(CONFIG_ENV).map(PathBuf::from).as_deref())
    }

    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::from_path(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sync.detection_window_secs == 0 {
            return Err(ConfigError::Invalid("detection_window_secs must be > 0".into()));
        }
        let timers = &self.timers;
        if [timers.queue_drain_secs, timers.health_check_secs, timers.auto_resolve_secs, timers.cleanup_secs]
            .contains(&0)
        {
            return Err(ConfigError::Invalid("timer intervals must be > 0".into()));
        }

        let mut seen = BTreeSet::new();
        for channel in &self.channels {
            channel.validate().map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if !seen.insert(channel.id.clone()) {
                return Err(ConfigError::Invalid(format!("duplicate channel id {}", channel.id)));
            }
        }
        for rule in &self.rules {
            rule.validate().map_err(|e| ConfigError::Invalid(e.to_string()))?;
            if let Some(unknown) = rule.channels.iter().find(|c| !seen.contains(*c)) {
                return Err(ConfigError::Invalid(format!(
                    "rule '{}' references unknown channel {unknown}",
                    rule.name
                )));
            }
        }
        Ok(())
    }

    pub fn detection_window(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.sync.detection_window_secs as i64)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::hours(self.sync.retention_hours as i64)
    }
}

/// Demo channel set: storefront, two marketplaces (amazon receive-only), POS,
/// main warehouse and a partner feed.
pub fn default_channels() -> Vec<SyncChannel> {
    let mut website = SyncChannel::new("website", "Online Store", ChannelType::Internal)
        .with_priority(8)
        .with_sync_frequency(60);
    website.features.real_time_sync = true;

    let mut amazon = SyncChannel::new("amazon", "Amazon Marketplace", ChannelType::Marketplace)
        .with_priority(6)
        .with_bidirectional(false)
        .with_sync_frequency(900)
        .with_batch_size(50)
        .with_field_mapping(
            FieldMapping::new()
                .with("seller_sku", "product_id")
                .with("fulfillable_quantity", "quantity")
                .with("listing_price", "price"),
        );
    amazon.connectivity.protocol = Protocol::Rest;
    amazon.features.delta_sync = true;
    amazon.rate_limits.max_requests_per_second = Some(2.0);
    amazon.rate_limits.max_batch_size = 50;

    let mut ebay = SyncChannel::new("ebay", "eBay", ChannelType::Marketplace)
        .with_priority(5)
        .with_sync_frequency(600)
        .with_batch_size(25)
        .with_field_mapping(
            FieldMapping::new()
                .with("ItemID", "product_id")
                .with("QuantityAvailable", "quantity")
                .with("StartPrice", "price"),
        );
    ebay.connectivity.protocol = Protocol::Soap;
    ebay.rate_limits.daily_limit = Some(5_000);

    let mut pos = SyncChannel::new("pos_retail", "Retail POS", ChannelType::Pos)
        .with_priority(9)
        .with_sync_frequency(30);
    pos.features.real_time_sync = true;

    let mut warehouse = SyncChannel::new("warehouse_main", "Main Warehouse", ChannelType::Warehouse)
        .with_priority(10)
        .with_sync_frequency(120)
        .with_batch_size(500);
    warehouse.features.delta_sync = true;

    let mut partner = SyncChannel::new("partner_api", "Partner API", ChannelType::Partner)
        .with_priority(4)
        .with_sync_frequency(1800)
        .with_batch_size(200);
    partner.connectivity.protocol = Protocol::Rest;
    partner.config.retry_attempts = 5;

    vec![website, amazon, ebay, pos, warehouse, partner]
}

pub fn default_rules() -> Vec<SyncRule> {
    vec![
        SyncRule::new("round prices to cents", 10)
            .when(RuleCondition::new("changes.price", Operator::Changed, json!(null)))
            .then(RuleAction::Transform {
                field: Field::Price,
                op: TransformOp::Round { decimals: 2 },
            }),
        SyncRule::new("stockout goes out immediately", 20)
            .when(RuleCondition::new("changes.quantity.current", Operator::Lte, json!(0)))
            .then(RuleAction::Propagate {
                immediate: true,
                channels: Vec::new(),
            })
            .then(RuleAction::Alert {
                level: AlertLevel::Warning,
                message: "product sold out".into(),
            }),
        SyncRule::new("large quantity drop", 30)
            .when(RuleCondition::new("changes.quantity.delta", Operator::Lte, json!(-100)))
            .then(RuleAction::Alert {
                level: AlertLevel::Critical,
                message: "quantity dropped by 100 or more in one update".into(),
            }),
        SyncRule::new("partner feed retries longer", 40)
            .for_channels(["partner_api"])
            .then(RuleAction::Retry { max_attempts: 8 }),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.channels.len(), 6);
        assert_eq!(config.detection_window(), chrono::Duration::seconds(30));
        let amazon = config.channels.iter().find(|c| c.id.as_str() == "amazon").unwrap();
        assert!(!amazon.accepts_outbound());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config = EngineConfig::from_json_str(r#"{"sync": {"detection_window_secs": 45}}"#).unwrap();
        assert_eq!(config.sync.detection_window_secs, 45);
        assert_eq!(config.sync.retention_hours, 24);
        assert_eq!(config.timers.queue_drain_secs, 10);
    }

    #[test]
    fn explicit_channels_and_rules_parse() {
        let raw = r#"{
            "channels": [
                {"id": "shop", "name": "Shop", "type": "internal", "status": "active",
                 "config": {"sync_frequency_secs": 60, "batch_size": 10, "retry_attempts": 2, "timeout_ms": 1000, "priority": 7}}
            ],
            "rules": [
                {"name": "hold", "channels": ["shop"],
                 "conditions": [{"field": "changes.quantity.current", "operator": "lt", "value": 0}],
                 "actions": [{"type": "block", "reason": "negative"}]}
            ]
        }"#;
        let config = EngineConfig::from_json_str(raw).unwrap();
        assert_eq!(config.channels[0].config.priority, 7);
        assert_eq!(config.rules[0].actions[0], RuleAction::Block { reason: Some("negative".into()) });
    }

    #[test]
    fn rejects_bad_config() {
        let dup = r#"{"channels": [
            {"id": "a", "name": "A", "type": "api", "status": "active"},
            {"id": "a", "name": "A2", "type": "api", "status": "active"}
        ], "rules": []}"#;
        assert!(matches!(EngineConfig::from_json_str(dup), Err(ConfigError::Invalid(_))));

        let orphan = r#"{"channels": [], "rules": [{"name": "r", "channels": ["ghost"], "actions": [{"type": "queue"}]}]}"#;
        assert!(matches!(EngineConfig::from_json_str(orphan), Err(ConfigError::Invalid(_))));

        assert!(matches!(EngineConfig::from_json_str("{"), Err(ConfigError::Parse(_))));
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = EngineConfig::load(Some(Path::new("/nonexistent/stocksync.json"))).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
        assert_eq!(EngineConfig::load(None).unwrap().channels, default_channels());
    }
}
