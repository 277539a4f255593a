use axum::{Router, routing::get};

pub mod channels;
pub mod conflicts;
pub mod event_stream;
pub mod reports;
pub mod system;
pub mod updates;

/// Router for every engine endpoint.
pub fn router() -> Router {
    Router::new()
        .route("/batches", get(reports::list_batches))
        .route("/metrics", get(reports::metrics))
        .nest("/channels", channels::router())
        .nest("/updates", updates::router())
        .nest("/conflicts", conflicts::router())
        .nest("/events", event_stream::router())
}
