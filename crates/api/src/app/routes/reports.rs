use std::sync::Arc;

use axum::{
    Json,
    extract::{Extension, Query},
};

use stocksync_engine::{SyncBatch, SyncMetrics};

use crate::app::dto;
use crate::app::errors::ApiResult;
use crate::app::services::AppServices;

/// GET /batches?window=day&channel_id=ebay
pub async fn list_batches(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<dto::WindowParams>,
) -> ApiResult<Json<Vec<SyncBatch>>> {
    let window = params.window()?;
    Ok(Json(services.sync.batches(window, params.channel_id.as_ref())?))
}

/// GET /metrics?window=hour|day|week
pub async fn metrics(
    Extension(services): Extension<Arc<AppServices>>,
    Query(params): Query<dto::WindowParams>,
) -> ApiResult<Json<SyncMetrics>> {
    Ok(Json(services.sync.metrics(params.window()?)?))
}
