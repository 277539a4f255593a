//! Request bodies and query parameters.

use serde::Deserialize;
use serde_json::Value;

use stocksync_channels::ChannelStatus;
use stocksync_core::{ChannelId, EngineError, ProductId, UpdateId, WarehouseId};
use stocksync_engine::{ResolutionStrategy, TimeWindow, UpdateRequest, UpdateSource};

#[derive(Debug, Deserialize)]
pub struct SubmitUpdateRequest {
    pub channel_id: ChannelId,
    pub product_id: ProductId,
    #[serde(default)]
    pub warehouse_id: Option<WarehouseId>,
    #[serde(default)]
    pub quantity: Option<i64>,
    #[serde(default)]
    pub price: Option<f64>,
    #[serde(default)]
    pub availability: Option<bool>,
    #[serde(default)]
    pub metadata: Option<Value>,
    #[serde(default)]
    pub base_version: Option<u64>,
    /// Defaults to an automatic change attributed to the API.
    #[serde(default)]
    pub source: Option<UpdateSource>,
}

impl SubmitUpdateRequest {
    pub fn into_request(self) -> UpdateRequest {
        UpdateRequest {
            channel_id: self.channel_id,
            product_id: self.product_id,
            warehouse_id: self.warehouse_id,
            quantity: self.quantity,
            price: self.price,
            availability: self.availability,
            metadata: self.metadata,
            base_version: self.base_version,
            source: self
                .source
                .unwrap_or_else(|| UpdateSource::automatic("api", "submitted over http")),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SetStatusRequest {
    pub status: ChannelStatus,
}

#[derive(Debug, Default, Deserialize)]
pub struct SyncParams {
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Default, Deserialize)]
pub struct PushRequest {
    /// Omitted: everything pending on the channel's lane.
    #[serde(default)]
    pub update_ids: Option<Vec<UpdateId>>,
}

#[derive(Debug, Default, Deserialize)]
pub struct ResolveRequest {
    /// Omitted: last-write-wins for auto-resolvable conflicts, manual otherwise.
    #[serde(default)]
    pub strategy: Option<ResolutionStrategy>,
    #[serde(default)]
    pub resolved_by: Option<String>,
    /// Required for `manual`.
    #[serde(default)]
    pub value: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
pub struct WindowParams {
    #[serde(default)]
    pub window: Option<String>,
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
}

impl WindowParams {
    pub fn window(&self) -> Result<TimeWindow, EngineError> {
        self.window.as_deref().map_or(Ok(TimeWindow::default()), str::parse)
    }
}
