use std::sync::Arc;

use axum::{Json, extract::Extension};
use serde_json::{Value, json};

use stocksync_channels::ChannelStatus;

use crate::app::errors::ApiResult;
use crate::app::services::AppServices;

/// GET /health
pub async fn health(Extension(services): Extension<Arc<AppServices>>) -> ApiResult<Json<Value>> {
    let channels = services.sync.channels()?;
    let active = channels.iter().filter(|c| c.status == ChannelStatus::Active).count();
    let queues = services.sync.propagator().queues();

    Ok(Json(json!({
        "status": "ok",
        "channels": channels.len(),
        "active_channels": active,
        "active_conflicts": services.sync.active_conflicts()?.len(),
        "queued_deliveries": queues.total_depth(),
        "dead_letters": queues.dead_letter_count(),
        "event_subscribers": services.event_bus.subscriber_count(),
    })))
}
