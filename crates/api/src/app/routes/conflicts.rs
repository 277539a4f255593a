use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Extension, Path},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};

use stocksync_core::ConflictId;
use stocksync_engine::SyncConflict;

use crate::app::dto;
use crate::app::errors::{self, ApiError, ApiResult};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/active", get(active_conflicts))
        .route("/:id", get(get_conflict))
        .route("/:id/resolve", post(resolve_conflict))
}

pub async fn active_conflicts(
    Extension(services): Extension<Arc<AppServices>>,
) -> ApiResult<Json<Vec<SyncConflict>>> {
    Ok(Json(services.sync.active_conflicts()?))
}

fn parse_id(raw: &str) -> Result<ConflictId, Response> {
    raw.parse()
        .map_err(|_| errors::json_error(StatusCode::BAD_REQUEST, "invalid_id", "invalid conflict id"))
}

pub async fn get_conflict(Extension(services): Extension<Arc<AppServices>>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match services.sync.get_conflict(id) {
        Ok(conflict) => Json(conflict).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}

/// POST /conflicts/:id/resolve
///
/// `{ "strategy": "merge", "resolved_by": "ops@example.com" }`; `value` is
/// required for `manual`. Without a strategy the conflict's default applies.
pub async fn resolve_conflict(
    Extension(services): Extension<Arc<AppServices>>,
    Path(id): Path<String>,
    body: Option<Json<dto::ResolveRequest>>,
) -> Response {
    let id = match parse_id(&id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let strategy = match body.strategy {
        Some(strategy) => strategy,
        None => match services.sync.get_conflict(id) {
            Ok(conflict) => conflict.default_strategy(),
            Err(err) => return ApiError(err).into_response(),
        },
    };
    let resolved_by = body.resolved_by.unwrap_or_else(|| "api".to_string());

    match services
        .sync
        .resolve_conflict(id, strategy, &resolved_by, body.value)
        .await
    {
        Ok(conflict) => Json(conflict).into_response(),
        Err(err) => ApiError(err).into_response(),
    }
}
