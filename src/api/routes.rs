//! Router construction

use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::api::handlers;
use crate::middleware::timing::RequestTimingLayer;
use crate::AppState;

/// Build the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let output_prefix = state.settings.storage.output_url_prefix.clone();
    let outputs = ServeDir::new(state.outputs.root());

    Router::new()
        .route("/txt2img", post(handlers::txt2img))
        .route("/upload", post(handlers::upload))
        .route("/img2img", post(handlers::img2img))
        .route("/v1/images/generations", post(handlers::generate_images))
        .route("/health", get(handlers::health))
        .route("/metrics", get(handlers::metrics))
        .nest_service(&output_prefix, outputs)
        .layer(DefaultBodyLimit::max(state.settings.server.max_upload_bytes))
        .layer(RequestTimingLayer::new().with_metrics(state.metrics.clone()))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
