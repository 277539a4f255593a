use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query},
    routing::{get, post},
};
use serde_json::{Value, json};

use stocksync_channels::SyncChannel;
use stocksync_core::ChannelId;
use stocksync_engine::SyncBatch;
use stocksync_engine::service::QueueStatus;

use crate::app::dto;
use crate::app::errors::ApiResult;
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", get(list_channels))
        .route("/:id", get(get_channel))
        .route("/:id/status", post(set_status))
        .route("/:id/sync", post(sync_from_channel))
        .route("/:id/push", post(sync_to_channel))
        .route("/:id/queue", get(queue_status))
        .route("/:id/queue/requeue", post(requeue_dead_letters))
}

pub async fn list_channels(Extension(services): Extension<Arc<AppServices>>) -> ApiResult<Json<Vec<SyncChannel>>> {
    Ok(Json(services.sync.channels()?))
}

pub async fn get_channel(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> ApiResult<Json<SyncChannel>> {
    Ok(Json(services.sync.channel(&ChannelId::new(id))?))
}

pub async fn set_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Json(body): Json<dto::SetStatusRequest>,
) -> ApiResult<Json<SyncChannel>> {
    Ok(Json(services.sync.set_channel_status(&ChannelId::new(id), body.status)?))
}

/// POST /channels/:id/sync?force=true
///
/// Runs one inbound cycle. A failed fetch still answers 200 with a `failed` batch.
pub async fn sync_from_channel(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    Query(params): Query<dto::SyncParams>,
) -> ApiResult<Json<SyncBatch>> {
    let batch = services
        .sync
        .sync_from_channel(&ChannelId::new(id), params.force)
        .await?;
    Ok(Json(batch))
}

/// POST /channels/:id/push
///
/// Body `{ "update_ids": [...] }` is optional; without it the channel's lane is flushed.
pub async fn sync_to_channel(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::PushRequest>>,
) -> ApiResult<Json<SyncBatch>> {
    let update_ids = body.and_then(|Json(b)| b.update_ids);
    let batch = services
        .sync
        .sync_to_channel(&ChannelId::new(id), update_ids)
        .await?;
    Ok(Json(batch))
}

pub async fn queue_status(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> ApiResult<Json<QueueStatus>> {
    Ok(Json(services.sync.queue_status(&ChannelId::new(id))?))
}

pub async fn requeue_dead_letters(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let requeued = services.sync.requeue_dead_letters(&ChannelId::new(id))?;
    Ok(Json(json!({ "requeued": requeued })))
}
