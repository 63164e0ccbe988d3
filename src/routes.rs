//! The router: every endpoint plus the shared middleware stack.

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    routing::get,
    Router,
};
use tower::ServiceBuilder;
use tower_http::cors::CorsLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::{db::AppState, handlers, handlers_config, tuf::MAX_DOWNLOAD_SIZE};

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route(
            "/v2/*rest",
            get(handlers::tuf_get)
                .post(handlers::tuf_post)
                .delete(handlers::tuf_delete),
        )
        .route(
            "/api/configurations",
            get(handlers_config::get_configurations).put(handlers_config::put_configurations),
        )
        .route(
            "/api/internal/configurations",
            get(handlers_config::get_internal_configurations)
                .put(handlers_config::put_internal_configurations),
        )
        .layer(DefaultBodyLimit::max(MAX_DOWNLOAD_SIZE))
        .layer(
            ServiceBuilder::new()
                .layer(TraceLayer::new_for_http())
                .layer(CorsLayer::permissive())
                .layer(TimeoutLayer::new(state.request_timeout)),
        )
        .with_state(state)
}
