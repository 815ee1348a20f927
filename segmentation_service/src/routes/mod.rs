mod error;
mod health;
mod segment;

use crate::{model_service::SegmentationModel, server::SharedState};
use axum::{
    routing::{get, post},
    Router,
};

pub use error::ApiError;

pub const ENDPOINTS: &[&str] = &[
    "GET /",
    "GET /health",
    "GET /info",
    "POST /api/segment",
    "POST /api/segment-with-stats",
];

pub fn api_routes<M: SegmentationModel>() -> Router<SharedState<M>> {
    Router::new()
        .route("/", get(health::root))
        .route("/health", get(health::healthcheck))
        .route("/info", get(health::service_info::<M>))
        .route("/api/segment", post(segment::segment::<M>))
        .route(
            "/api/segment-with-stats",
            post(segment::segment_with_stats::<M>),
        )
}
