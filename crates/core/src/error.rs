//! Engine error model.

use thiserror::Error;

use crate::id::{ChannelId, ConflictId, UpdateId};

/// Result type used across the synchronization engine.
pub type EngineResult<T> = Result<T, EngineError>;

/// Engine-level error.
///
/// Variants fall into three groups:
/// - **not-found**: fatal for the single call, other in-flight work is unaffected
/// - **state**: recoverable, the caller may retry later (or force)
/// - **validation / infrastructure**: recorded against the offending record
///
/// Every variant carries a stable machine-readable code (see [`EngineError::code`]).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum EngineError {
    #[error("channel not found: {0}")]
    ChannelNotFound(ChannelId),

    #[error("no connector registered for channel: {0}")]
    ConnectorNotFound(ChannelId),

    #[error("conflict not found: {0}")]
    ConflictNotFound(ConflictId),

    #[error("update not found: {0}")]
    UpdateNotFound(UpdateId),

    /// The channel exists but its status is not `active`.
    #[error("channel is not active: {0}")]
    ChannelInactive(ChannelId),

    /// The channel does not accept outbound updates (`bidirectional_sync = false`).
    #[error("channel is receive-only: {0}")]
    ChannelReadOnly(ChannelId),

    /// A non-forced sync was requested before the channel's sync frequency elapsed.
    #[error("sync frequency not met for channel {channel} (next sync in {remaining_secs}s)")]
    SyncFrequencyNotMet {
        channel: ChannelId,
        remaining_secs: i64,
    },

    #[error("conflict already resolved: {0}")]
    ConflictAlreadyResolved(ConflictId),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("ledger error: {0}")]
    Ledger(String),
}

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn ledger(msg: impl Into<String>) -> Self {
        Self::Ledger(msg.into())
    }

    /// Stable error code, suitable for API responses and batch error records.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::ChannelNotFound(_) => "CHANNEL_NOT_FOUND",
            EngineError::ConnectorNotFound(_) => "CONNECTOR_NOT_FOUND",
            EngineError::ConflictNotFound(_) => "CONFLICT_NOT_FOUND",
            EngineError::UpdateNotFound(_) => "UPDATE_NOT_FOUND",
            EngineError::ChannelInactive(_) => "CHANNEL_INACTIVE",
            EngineError::ChannelReadOnly(_) => "CHANNEL_READ_ONLY",
            EngineError::SyncFrequencyNotMet { .. } => "SYNC_FREQUENCY_NOT_MET",
            EngineError::ConflictAlreadyResolved(_) => "CONFLICT_ALREADY_RESOLVED",
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::Storage(_) => "STORAGE_ERROR",
            EngineError::Ledger(_) => "LEDGER_ERROR",
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            EngineError::ChannelNotFound(_)
                | EngineError::ConnectorNotFound(_)
                | EngineError::ConflictNotFound(_)
                | EngineError::UpdateNotFound(_)
        )
    }

    /// State errors are recoverable: retry later, or force.
    pub fn is_state(&self) -> bool {
        matches!(
            self,
            EngineError::ChannelInactive(_)
                | EngineError::ChannelReadOnly(_)
                | EngineError::SyncFrequencyNotMet { .. }
                | EngineError::ConflictAlreadyResolved(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        let channel = ChannelId::new("pos_retail");
        assert_eq!(EngineError::ChannelNotFound(channel.clone()).code(), "CHANNEL_NOT_FOUND");
        assert_eq!(EngineError::ChannelInactive(channel.clone()).code(), "CHANNEL_INACTIVE");
        assert_eq!(
            EngineError::SyncFrequencyNotMet {
                channel,
                remaining_secs: 12
            }
            .code(),
            "SYNC_FREQUENCY_NOT_MET"
        );
    }

    #[test]
    fn taxonomy_groups() {
        let channel = ChannelId::new("ebay");
        assert!(EngineError::ConnectorNotFound(channel.clone()).is_not_found());
        assert!(EngineError::ChannelInactive(channel).is_state());
        assert!(!EngineError::validation("bad").is_state());
    }
}
