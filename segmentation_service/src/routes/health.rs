use crate::{
    inference_service::InferenceStats,
    model_service::SegmentationModel,
    server::{ServiceInfo, SharedState},
};
use axum::{extract::State, response::IntoResponse, response::Json};
use serde::Serialize;

#[derive(Serialize)]
pub struct Status {
    status: String,
    message: String,
    /// RFC 3339, UTC.
    timestamp: String,
}

pub async fn healthcheck() -> impl IntoResponse {
    Json(Status {
        status: "healthy".into(),
        message: "Segmentation service is running".into(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

#[derive(Serialize)]
pub struct Welcome {
    message: &'static str,
    version: &'static str,
    health_check: &'static str,
    info: &'static str,
    endpoints: &'static [&'static str],
}

pub async fn root() -> Json<Welcome> {
    Json(Welcome {
        message: "Cityscapes semantic segmentation API",
        version: env!("CARGO_PKG_VERSION"),
        health_check: "/health",
        info: "/info",
        endpoints: super::ENDPOINTS,
    })
}

#[derive(Serialize)]
pub struct InfoResponse {
    #[serde(flatten)]
    info: ServiceInfo,
    inference: InferenceStats,
}

pub async fn service_info<M: SegmentationModel>(
    State(state): State<SharedState<M>>,
) -> Json<InfoResponse> {
    Json(InfoResponse {
        info: state.info.as_ref().clone(),
        inference: state.pipeline.inference().stats(),
    })
}
