pub mod api;
mod middleware;

pub use api::{ApiState, build_api_router};

use axum::{Router, middleware as axum_middleware};

/// The full HTTP surface with request context applied outermost.
pub fn build_router(state: ApiState) -> Router {
    build_api_router(state).layer(axum_middleware::from_fn(middleware::set_request_context))
}
