//! HTTP surface: mutation and init ingress, the WebSocket endpoint and a
//! health probe.

mod ingress;
mod middleware;

use std::sync::Arc;

use axum::{
    Router,
    http::StatusCode,
    middleware as axum_middleware,
    routing::{get, post},
};

use crate::application::registry::Registry;
use crate::infra::transport::{Hub, ws_handler};

pub use middleware::RequestContext;

#[derive(Clone)]
pub struct HttpState {
    pub registry: Arc<Registry>,
    pub hub: Hub,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/health", get(|| async { StatusCode::NO_CONTENT }))
        .route("/socket", get(ws_handler))
        .route("/{namespace}/{*event}", post(ingress::handle_post))
        .with_state(state)
        .layer(axum_middleware::from_fn(middleware::log_responses))
        .layer(axum_middleware::from_fn(middleware::set_request_context))
}
