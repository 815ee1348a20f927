use crate::{
    error::SegmentationError,
    stats::SegmentationStats,
};
use image::{ImageFormat, RgbImage};
use serde::Serialize;
use std::{io::Cursor, time::Instant};

pub const SUCCESS_MESSAGE: &str = "Segmentation performed successfully";
pub const PROCESSING_TIME_HEADER: &str = "x-processing-time";
pub const IMAGE_STATS_HEADER: &str = "x-image-stats";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseMode {
    /// PNG mask with statistics in the metadata.
    Image,
    /// Structured statistics document.
    Report,
}

#[derive(Debug, Clone)]
pub struct ImageResponse {
    pub png: Vec<u8>,
    /// Header name/value pairs, names lowercase.
    pub metadata: Vec<(&'static str, String)>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SegmentationReport {
    pub message: String,
    pub stats: SegmentationStats,
    pub image_size: String,
    pub processing_time: f64,
}

#[derive(Debug, Clone)]
pub enum SegmentationResponse {
    Image(ImageResponse),
    Report(SegmentationReport),
}

pub fn build_image_response(
    colored: &RgbImage,
    stats: &SegmentationStats,
    started: Instant,
) -> Result<ImageResponse, SegmentationError> {
    let mut png = Vec::new();
    colored
        .write_to(&mut Cursor::new(&mut png), ImageFormat::Png)
        .map_err(|e| SegmentationError::Encoding(format!("PNG encoding failed: {}", e)))?;

    let summary_json = serde_json::to_string(&stats.summary())
        .map_err(|e| SegmentationError::Encoding(format!("stats summary: {}", e)))?;

    let processing_time = started.elapsed().as_secs_f64();
    let metadata = vec![
        (PROCESSING_TIME_HEADER, format!("{:.3}", processing_time)),
        (IMAGE_STATS_HEADER, summary_json),
    ];

    Ok(ImageResponse { png, metadata })
}

pub fn build_report(
    stats: SegmentationStats,
    width: u32,
    height: u32,
    started: Instant,
) -> SegmentationReport {
    SegmentationReport {
        message: SUCCESS_MESSAGE.to_string(),
        stats,
        image_size: format!("{}x{}", width, height),
        processing_time: started.elapsed().as_secs_f64(),
    }
}
