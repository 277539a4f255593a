//! Channel connector capability interface.
//!
//! One implementation per channel type, selected through the
//! [`crate::ChannelRegistry`]. Connectors are the only components allowed to
//! perform network IO.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// A record in the channel's own shape (field names per its mapping table).
pub type ExternalRecord = Map<String, Value>;

/// Failure classification, shared with batch error records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Network,
    Authentication,
    Validation,
    BusinessLogic,
    System,
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConnectorError {
    #[error("network error: {0}")]
    Network(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("channel rejected payload: {0}")]
    Validation(String),

    #[error("channel refused update: {0}")]
    Rejected(String),

    #[error("rate limited by channel")]
    RateLimited { retry_after: Option<Duration> },

    #[error("channel unavailable: {0}")]
    Unavailable(String),
}

impl ConnectorError {
    /// Whether the same call may succeed later (the item is re-queued, not failed).
    pub fn retryable(&self) -> bool {
        matches!(
            self,
            ConnectorError::Network(_)
                | ConnectorError::Timeout(_)
                | ConnectorError::RateLimited { .. }
                | ConnectorError::Unavailable(_)
        )
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ConnectorError::Network(_)
            | ConnectorError::Timeout(_)
            | ConnectorError::RateLimited { .. }
            | ConnectorError::Unavailable(_) => ErrorKind::Network,
            ConnectorError::Authentication(_) => ErrorKind::Authentication,
            ConnectorError::Validation(_) => ErrorKind::Validation,
            ConnectorError::Rejected(_) => ErrorKind::BusinessLogic,
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            ConnectorError::Network(_) => "NETWORK_ERROR",
            ConnectorError::Timeout(_) => "TIMEOUT",
            ConnectorError::Authentication(_) => "AUTHENTICATION_FAILED",
            ConnectorError::Validation(_) => "PAYLOAD_REJECTED",
            ConnectorError::Rejected(_) => "UPDATE_REFUSED",
            ConnectorError::RateLimited { .. } => "RATE_LIMITED",
            ConnectorError::Unavailable(_) => "CHANNEL_UNAVAILABLE",
        }
    }
}

/// Capability set every channel connector provides.
#[async_trait]
pub trait ChannelConnector: Send + Sync {
    /// Pull records changed since `since` (or everything when `None`).
    async fn fetch_updates(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> Result<Vec<ExternalRecord>, ConnectorError>;

    /// Push records to the channel. All-or-nothing per call.
    async fn send_updates(&self, records: Vec<ExternalRecord>) -> Result<(), ConnectorError>;

    /// Cheap, non-blocking view of whether a live connection exists.
    fn is_reachable(&self) -> bool {
        true
    }

    /// Active check used by the health task.
    async fn health_check(&self) -> Result<(), ConnectorError> {
        if self.is_reachable() {
            Ok(())
        } else {
            Err(ConnectorError::Unavailable("connection down".to_string()))
        }
    }
}
