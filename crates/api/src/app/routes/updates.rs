use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use stocksync_core::UpdateId;

use crate::app::dto;
use crate::app::errors::{self, ApiError};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/", post(submit_update))
        .route("/:id", get(get_update))
}

/// POST /updates
///
/// Runs the full pipeline; `201` with the stored update, its conflicts, the rule
/// decision and where it was delivered.
pub async fn submit_update(
    Extension(services): Extension<Arc<AppServices>>,
    Json(body): Json<dto::SubmitUpdateRequest>,
) -> Response {
    match services.sync.process_update(body.into_request()).await {
        Ok(processed) => (StatusCode::CREATED, Json(processed)).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

pub async fn get_update(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> Response {
    let id: UpdateId = match id.parse() {
        Ok(v) => v,
        Err(_) => return errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid update id"),
    };
    match services.sync.get_update(id) {
        Ok(update) => Json(update).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}
