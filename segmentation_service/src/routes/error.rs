use crate::{error::SegmentationError, pipeline::PipelineError};
use axum::{
    extract::multipart::MultipartError,
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Missing multipart field `file`")]
    MissingFile,
    #[error("Failed to read upload: {0}")]
    Multipart(#[from] MultipartError),
    #[error(transparent)]
    Pipeline(#[from] PipelineError),
    #[error("HTTP builder failed: {0}")]
    HttpBuilder(String),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::MissingFile => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Multipart(err) => err.status(),
            ApiError::Pipeline(err) => match &err.source {
                SegmentationError::InvalidImage(_) => StatusCode::BAD_REQUEST,
                SegmentationError::ImageTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
                SegmentationError::Inference(inference) if inference.is_timeout() => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            },
            ApiError::HttpBuilder(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn detail(&self) -> String {
        match self {
            ApiError::Pipeline(err) => err.source.to_string(),
            other => other.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if let ApiError::HttpBuilder(_) = self {
            tracing::error!("{}", self);
        }
        (status, Json(json!({ "detail": self.detail() }))).into_response()
    }
}
