use super::ApiError;
use crate::{
    codec::RawImage,
    model_service::SegmentationModel,
    response::{ResponseMode, SegmentationResponse},
    server::SharedState,
};
use axum::{
    body::Body,
    extract::{Multipart, State},
    http::header,
    response::{IntoResponse, Json, Response},
};
use tracing::instrument;

const UPLOAD_FIELD: &str = "file";

async fn read_upload(mut multipart: Multipart) -> Result<RawImage, ApiError> {
    while let Some(field) = multipart.next_field().await? {
        if field.name() != Some(UPLOAD_FIELD) {
            continue;
        }
        let content_type = field.content_type().map(str::to_string);
        let bytes = field.bytes().await?;
        return Ok(RawImage::new(bytes.to_vec(), content_type));
    }
    Err(ApiError::MissingFile)
}

async fn run<M: SegmentationModel>(
    state: &SharedState<M>,
    multipart: Multipart,
    mode: ResponseMode,
) -> Result<Response, ApiError> {
    let raw = read_upload(multipart).await?;
    let response = state.pipeline.run(raw, mode).await?;

    match response {
        SegmentationResponse::Image(image) => {
            let mut builder = Response::builder().header(header::CONTENT_TYPE, "image/png");
            for (name, value) in image.metadata {
                builder = builder.header(name, value);
            }
            builder
                .body(Body::from(image.png))
                .map_err(|e| ApiError::HttpBuilder(e.to_string()))
        }
        SegmentationResponse::Report(report) => Ok(Json(report).into_response()),
    }
}

#[instrument(skip_all)]
pub async fn segment<M: SegmentationModel>(
    State(state): State<SharedState<M>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    run(&state, multipart, ResponseMode::Image).await
}

#[instrument(skip_all)]
pub async fn segment_with_stats<M: SegmentationModel>(
    State(state): State<SharedState<M>>,
    multipart: Multipart,
) -> Result<Response, ApiError> {
    run(&state, multipart, ResponseMode::Report).await
}
