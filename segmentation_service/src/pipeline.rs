use crate::{
    codec::{decode_image, ImageLimits, RawImage},
    error::SegmentationError,
    inference_service::InferenceService,
    mask::{argmax, colorize, resize_nearest},
    model_service::SegmentationModel,
    palette::ClassPalette,
    preprocess::Preprocessor,
    response::{build_image_response, build_report, ResponseMode, SegmentationResponse},
    stats::aggregate_stats,
};
use serde::{Deserialize, Serialize};
use std::{fmt, sync::Arc, time::Instant};
use thiserror::Error;
use tracing::instrument;

/// Resolution of the returned mask.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputResolution {
    /// The model's working resolution.
    #[default]
    Model,
    /// Class ids are upscaled with nearest-neighbour to the uploaded image size.
    Original,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineStage {
    Received,
    Decoded,
    Preprocessed,
    Inferred,
    MaskDecoded,
    Aggregated,
    Responded,
}

impl PipelineStage {
    fn successor(self) -> Self {
        match self {
            PipelineStage::Received => PipelineStage::Decoded,
            PipelineStage::Decoded => PipelineStage::Preprocessed,
            PipelineStage::Preprocessed => PipelineStage::Inferred,
            PipelineStage::Inferred => PipelineStage::MaskDecoded,
            PipelineStage::MaskDecoded => PipelineStage::Aggregated,
            PipelineStage::Aggregated | PipelineStage::Responded => PipelineStage::Responded,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PipelineStage::Received => "received",
            PipelineStage::Decoded => "decoded",
            PipelineStage::Preprocessed => "preprocessed",
            PipelineStage::Inferred => "inferred",
            PipelineStage::MaskDecoded => "mask_decoded",
            PipelineStage::Aggregated => "aggregated",
            PipelineStage::Responded => "responded",
        }
    }
}

impl fmt::Display for PipelineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal failure of a request, tagged with the last stage it reached.
#[derive(Error, Debug)]
#[error("segmentation failed at stage `{stage}`: {source}")]
pub struct PipelineError {
    pub stage: PipelineStage,
    #[source]
    pub source: SegmentationError,
}

#[derive(Debug, Clone, Copy)]
struct StageTracker {
    stage: PipelineStage,
}

impl StageTracker {
    fn new() -> Self {
        Self {
            stage: PipelineStage::Received,
        }
    }

    fn advance(&mut self) {
        let next = self.stage.successor();
        tracing::debug!(from = %self.stage, to = %next, "Pipeline transition");
        self.stage = next;
    }

    fn fail(&self, source: SegmentationError) -> PipelineError {
        if source.is_client_error() {
            tracing::warn!(stage = %self.stage, kind = source.kind(), "Rejected upload: {}", source);
        } else {
            tracing::error!(stage = %self.stage, kind = source.kind(), "Segmentation failed: {}", source);
        }
        PipelineError {
            stage: self.stage,
            source,
        }
    }
}

/// Runs one upload through decode, preprocess, inference, mask decoding,
/// statistics and response building. The model and palette are injected so
/// tests can substitute stub models.
pub struct SegmentationPipeline<M: SegmentationModel> {
    inference: Arc<InferenceService<M>>,
    palette: Arc<ClassPalette>,
    preprocessor: Preprocessor,
    limits: ImageLimits,
    output_resolution: OutputResolution,
}

impl<M: SegmentationModel> SegmentationPipeline<M> {
    pub fn new(
        inference: Arc<InferenceService<M>>,
        palette: Arc<ClassPalette>,
        preprocessor: Preprocessor,
        limits: ImageLimits,
        output_resolution: OutputResolution,
    ) -> Self {
        Self {
            inference,
            palette,
            preprocessor,
            limits,
            output_resolution,
        }
    }

    pub fn inference(&self) -> &InferenceService<M> {
        &self.inference
    }

    pub fn palette(&self) -> &ClassPalette {
        &self.palette
    }

    pub fn limits(&self) -> ImageLimits {
        self.limits
    }

    pub fn output_resolution(&self) -> OutputResolution {
        self.output_resolution
    }

    #[instrument(skip(self, raw), fields(bytes = raw.len()))]
    pub async fn run(
        &self,
        raw: RawImage,
        mode: ResponseMode,
    ) -> Result<SegmentationResponse, PipelineError> {
        let started = Instant::now();
        let mut tracker = StageTracker::new();

        let limits = self.limits;
        let preprocessor = self.preprocessor.clone();
        let (width, height, tensor) = run_blocking(&mut tracker, move |tracker| {
            let image = decode_image(&raw, &limits).map_err(|e| tracker.fail(e))?;
            drop(raw);
            tracker.advance();

            let tensor = preprocessor
                .preprocess(&image)
                .map_err(|e| tracker.fail(e))?;
            tracker.advance();

            Ok((image.width(), image.height(), tensor))
        })
        .await?;

        let probabilities = self
            .inference
            .infer(tensor)
            .await
            .map_err(|e| tracker.fail(e.into()))?;
        tracker.advance();

        let palette = self.palette.clone();
        let output_resolution = self.output_resolution;
        let response = run_blocking(&mut tracker, move |tracker| {
            let mut mask = argmax(&probabilities);
            drop(probabilities);
            if output_resolution == OutputResolution::Original {
                mask = resize_nearest(&mask, width, height);
            }
            tracker.advance();

            let stats = aggregate_stats(&mask, &palette);
            tracker.advance();

            let response = match mode {
                ResponseMode::Image => {
                    let colored = colorize(&mask, &palette);
                    build_image_response(&colored, &stats, started)
                        .map(SegmentationResponse::Image)
                }
                ResponseMode::Report => Ok(SegmentationResponse::Report(build_report(
                    stats, width, height, started,
                ))),
            }
            .map_err(|e| tracker.fail(e))?;
            tracker.advance();

            Ok(response)
        })
        .await?;

        tracing::info!(
            "Segmented {}x{} image in {:.3}s",
            width,
            height,
            started.elapsed().as_secs_f64()
        );

        Ok(response)
    }
}

/// Runs CPU-bound stages on the blocking pool so large uploads do not stall
/// the runtime. The tracker travels with the work and comes back updated.
async fn run_blocking<T, F>(tracker: &mut StageTracker, work: F) -> Result<T, PipelineError>
where
    T: Send + 'static,
    F: FnOnce(&mut StageTracker) -> Result<T, PipelineError> + Send + 'static,
{
    let span = tracing::Span::current();
    let mut moved = *tracker;
    let (returned, result) = tokio::task::spawn_blocking(move || {
        let result = span.in_scope(|| work(&mut moved));
        (moved, result)
    })
    .await
    .map_err(|e| tracker.fail(SegmentationError::Worker(e.to_string())))?;

    *tracker = returned;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        error::InferenceError,
        mask::ClassMask,
        preprocess::{Interpolation, NormalizationRange},
        response::{ImageResponse, IMAGE_STATS_HEADER},
        test_utils::{
            encode_png, test_palette, BrightnessModel, ConstantModel, InstrumentedModel,
            MODEL_SHAPE,
        },
    };
    use futures::future::join_all;
    use image::{ImageFormat, Rgb, RgbImage};
    use std::{io::Cursor, time::Duration};

    const LIMITS: ImageLimits = ImageLimits {
        max_bytes: 4 * 1024 * 1024,
        max_pixels: 4_000_000,
    };

    fn pipeline<M: SegmentationModel>(
        replicas: Vec<M>,
        background: usize,
        output_resolution: OutputResolution,
    ) -> SegmentationPipeline<M> {
        let palette = Arc::new(test_palette(background));
        let inference = Arc::new(
            InferenceService::new(replicas, MODEL_SHAPE, palette.len(), Duration::from_secs(5))
                .unwrap(),
        );
        SegmentationPipeline::new(
            inference,
            palette,
            Preprocessor::new(
                MODEL_SHAPE,
                Interpolation::Bilinear,
                NormalizationRange::UnitInterval,
            ),
            LIMITS,
            output_resolution,
        )
    }

    fn upload(bytes: Vec<u8>) -> RawImage {
        RawImage::new(bytes, Some("image/png".to_string()))
    }

    fn stats_header(image: &ImageResponse) -> serde_json::Value {
        let (_, value) = image
            .metadata
            .iter()
            .find(|(name, _)| *name == IMAGE_STATS_HEADER)
            .unwrap();
        serde_json::from_str(value).unwrap()
    }

    fn report(response: SegmentationResponse) -> crate::response::SegmentationReport {
        match response {
            SegmentationResponse::Report(report) => report,
            SegmentationResponse::Image(_) => panic!("expected a report"),
        }
    }

    #[tokio::test]
    async fn test_black_image_is_all_background() {
        let pipeline = pipeline(vec![ConstantModel::new(0, 8)], 0, OutputResolution::Model);

        let response = pipeline
            .run(upload(encode_png(64, 64, [0, 0, 0])), ResponseMode::Report)
            .await
            .unwrap();
        let report = report(response);

        assert_eq!(report.stats.unique_classes, 1);
        assert_eq!(report.stats.segmentation_ratio, 0.0);
        assert_eq!(report.stats.total_pixels, 16 * 32);
        assert_eq!(report.image_size, "64x64");
    }

    #[tokio::test]
    async fn test_oversized_upload_fails_before_preprocessing() {
        let model = InstrumentedModel::new(0, 8, Duration::ZERO);
        let probe = model.probe();
        let pipeline = pipeline(vec![model], 0, OutputResolution::Model);

        let err = pipeline
            .run(upload(vec![0u8; LIMITS.max_bytes + 1]), ResponseMode::Report)
            .await
            .unwrap_err();

        assert!(matches!(err.source, SegmentationError::ImageTooLarge(_)));
        assert_eq!(err.stage, PipelineStage::Received);
        assert_eq!(probe.calls(), 0);
    }

    #[tokio::test]
    async fn test_invalid_upload_fails_at_decode() {
        let pipeline = pipeline(vec![ConstantModel::new(0, 8)], 0, OutputResolution::Model);

        let err = pipeline
            .run(upload(b"\x89PNG\r\n\x1a\n".to_vec()), ResponseMode::Image)
            .await
            .unwrap_err();

        assert!(matches!(err.source, SegmentationError::InvalidImage(_)));
        assert_eq!(err.stage, PipelineStage::Received);
    }

    #[tokio::test]
    async fn test_inference_timeout_fails_request() {
        let palette = Arc::new(test_palette(0));
        let model = InstrumentedModel::new(0, 8, Duration::from_millis(300));
        let inference = Arc::new(
            InferenceService::new(vec![model], MODEL_SHAPE, 8, Duration::from_millis(20)).unwrap(),
        );
        let pipeline = SegmentationPipeline::new(
            inference,
            palette,
            Preprocessor::new(MODEL_SHAPE, Interpolation::Bilinear, NormalizationRange::UnitInterval),
            LIMITS,
            OutputResolution::Model,
        );

        let err = pipeline
            .run(upload(encode_png(8, 8, [1, 2, 3])), ResponseMode::Report)
            .await
            .unwrap_err();

        assert_eq!(err.stage, PipelineStage::Preprocessed);
        assert!(matches!(
            err.source,
            SegmentationError::Inference(InferenceError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_image_response_at_model_resolution() {
        let pipeline = pipeline(vec![ConstantModel::new(2, 8)], 0, OutputResolution::Model);

        let response = pipeline
            .run(upload(encode_png(100, 40, [9, 9, 9])), ResponseMode::Image)
            .await
            .unwrap();
        let SegmentationResponse::Image(image) = response else {
            panic!("expected an image response");
        };

        let decoded = image::load_from_memory_with_format(&image.png, ImageFormat::Png)
            .unwrap()
            .to_rgb8();
        assert_eq!(decoded.dimensions(), (MODEL_SHAPE.width, MODEL_SHAPE.height));
        assert_eq!(
            decoded.get_pixel(0, 0),
            &Rgb(pipeline.palette().color(2))
        );
        assert_eq!(stats_header(&image)["segmentation_ratio"], 1.0);
    }

    #[tokio::test]
    async fn test_original_resolution_upscales_class_ids() {
        let pipeline = pipeline(vec![ConstantModel::new(5, 8)], 0, OutputResolution::Original);

        let response = pipeline
            .run(upload(encode_png(70, 45, [9, 9, 9])), ResponseMode::Image)
            .await
            .unwrap();
        let SegmentationResponse::Image(image) = response else {
            panic!("expected an image response");
        };

        let decoded = image::load_from_memory_with_format(&image.png, ImageFormat::Png)
            .unwrap()
            .to_rgb8();
        let expected = Rgb(pipeline.palette().color(5));
        assert_eq!(decoded.dimensions(), (70, 45));
        assert!(decoded.pixels().all(|pixel| *pixel == expected));
        assert_eq!(stats_header(&image)["total_pixels"], 70 * 45);
    }

    #[tokio::test]
    async fn test_same_image_yields_identical_masks() {
        let mut image = RgbImage::new(90, 50);
        for (x, y, pixel) in image.enumerate_pixels_mut() {
            *pixel = Rgb([((x * 255) / 89) as u8, (y * 5) as u8, 0]);
        }
        let mut bytes = Vec::new();
        image
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Png)
            .unwrap();

        let palette = test_palette(0);
        let pipeline = pipeline(vec![BrightnessModel { num_classes: 8 }], 0, OutputResolution::Model);

        let mut masks: Vec<ClassMask> = Vec::new();
        for _ in 0..2 {
            let decoded = decode_image(&upload(bytes.clone()), &LIMITS).unwrap();
            let tensor = pipeline.preprocessor.preprocess(&decoded).unwrap();
            let scores = pipeline.inference().infer(tensor).await.unwrap();
            masks.push(argmax(&scores));
        }

        assert_eq!(masks[0], masks[1]);
        let stats = aggregate_stats(&masks[0], &palette);
        assert!(stats.unique_classes > 1);
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_model() {
        let model = InstrumentedModel::new(3, 8, Duration::from_millis(5));
        let probe = model.probe();
        let pipeline = Arc::new(pipeline(vec![model], 0, OutputResolution::Model));

        let requests = (0..6).map(|i| {
            let pipeline = pipeline.clone();
            let bytes = encode_png(20 + i, 30, [i as u8, 0, 0]);
            async move { pipeline.run(upload(bytes), ResponseMode::Report).await }
        });
        let reports: Vec<_> = join_all(requests)
            .await
            .into_iter()
            .map(|result| report(result.unwrap()))
            .collect();

        assert_eq!(probe.calls(), 6);
        assert_eq!(probe.max_concurrent(), 1);
        for report in &reports {
            assert_eq!(report.stats.class_pixel_counts.get("car"), Some(&(16 * 32)));
        }
    }

    #[tokio::test]
    async fn test_replica_pool_bounds_concurrency() {
        let first = InstrumentedModel::new(1, 8, Duration::from_millis(20));
        let probe = first.probe();
        let second = InstrumentedModel::sharing(&probe, 1, 8);
        let pipeline = Arc::new(pipeline(vec![first, second], 0, OutputResolution::Model));

        let requests = (0..6).map(|_| {
            let pipeline = pipeline.clone();
            async move {
                pipeline
                    .run(upload(encode_png(8, 8, [0, 0, 0])), ResponseMode::Image)
                    .await
            }
        });
        let results = join_all(requests).await;

        assert!(results.iter().all(|result| result.is_ok()));
        assert_eq!(probe.calls(), 6);
        assert!(probe.max_concurrent() <= 2);
    }

    #[tokio::test]
    async fn test_cpu_stages_run_off_the_runtime_thread() {
        let caller = std::thread::current().id();
        let mut tracker = StageTracker::new();

        let worker = run_blocking(&mut tracker, |tracker| {
            tracker.advance();
            Ok(std::thread::current().id())
        })
        .await
        .unwrap();

        assert_ne!(worker, caller);
        assert_eq!(tracker.stage, PipelineStage::Decoded);
    }

    #[tokio::test]
    async fn test_failed_blocking_stage_keeps_its_stage() {
        let mut tracker = StageTracker::new();

        let err = run_blocking(&mut tracker, |tracker| -> Result<(), PipelineError> {
            tracker.advance();
            Err(tracker.fail(SegmentationError::Preprocessing("bad buffer".into())))
        })
        .await
        .unwrap_err();

        assert_eq!(err.stage, PipelineStage::Decoded);
        assert_eq!(tracker.stage, PipelineStage::Decoded);
    }

    #[test]
    fn test_stage_order() {
        let mut stage = PipelineStage::Received;
        let mut visited = vec![stage];
        while stage != PipelineStage::Responded {
            stage = stage.successor();
            visited.push(stage);
        }

        assert_eq!(
            visited,
            vec![
                PipelineStage::Received,
                PipelineStage::Decoded,
                PipelineStage::Preprocessed,
                PipelineStage::Inferred,
                PipelineStage::MaskDecoded,
                PipelineStage::Aggregated,
                PipelineStage::Responded,
            ]
        );
    }
}
