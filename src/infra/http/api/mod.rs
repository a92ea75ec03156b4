pub mod error;
pub mod handlers;
pub mod models;
pub mod state;

pub use state::ApiState;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post},
};

use crate::infra::http::middleware::log_responses;

pub fn build_api_router(state: ApiState) -> Router {
    Router::new()
        .route("/", post(handlers::submit))
        .route("/status", get(handlers::health))
        .route("/{source_id}/{checksum}/{format}", get(handlers::get_status))
        .route(
            "/{source_id}/{checksum}/{format}/content",
            get(handlers::get_content),
        )
        .route(
            "/{source_id}/{checksum}/{format}/log",
            get(handlers::get_log),
        )
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
}
