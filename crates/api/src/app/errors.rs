use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

use stocksync_core::EngineError;

/// Engine failure surfaced over HTTP as `{error: CODE, message}`.
#[derive(Debug)]
pub struct ApiError(pub EngineError);

pub type ApiResult<T> = Result<T, ApiError>;

impl From<EngineError> for ApiError {
    fn from(err: EngineError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        engine_error_to_response(self.0)
    }
}

pub fn status_for(err: &EngineError) -> StatusCode {
    match err {
        EngineError::ChannelNotFound(_)
        | EngineError::ConnectorNotFound(_)
        | EngineError::ConflictNotFound(_)
        | EngineError::UpdateNotFound(_) => StatusCode::NOT_FOUND,
        EngineError::Validation(_) => StatusCode::BAD_REQUEST,
        EngineError::SyncFrequencyNotMet { .. } => StatusCode::TOO_MANY_REQUESTS,
        EngineError::ChannelInactive(_)
        | EngineError::ChannelReadOnly(_)
        | EngineError::ConflictAlreadyResolved(_) => StatusCode::CONFLICT,
        EngineError::Storage(_) | EngineError::Ledger(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub fn engine_error_to_response(err: EngineError) -> Response {
    let status = status_for(&err);
    if status.is_server_error() {
        tracing::error!(code = err.code(), error = %err, "request failed");
    }
    json_error(status, err.code(), err.to_string())
}

pub fn json_error(status: StatusCode, code: &str, message: impl Into<String>) -> Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
