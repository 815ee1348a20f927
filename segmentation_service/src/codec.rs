use crate::error::SegmentationError;
use image::{ImageReader, RgbImage};
use std::io::Cursor;

/// An upload as received from the transport: raw bytes plus the declared
/// content type, if the client sent one.
#[derive(Debug, Clone)]
pub struct RawImage {
    bytes: Vec<u8>,
    content_type: Option<String>,
}

impl RawImage {
    pub fn new(bytes: impl Into<Vec<u8>>, content_type: Option<String>) -> Self {
        Self {
            bytes: bytes.into(),
            content_type,
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn content_type(&self) -> Option<&str> {
        self.content_type.as_deref()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageLimits {
    pub max_bytes: usize,
    pub max_pixels: u64,
}

/// RGB8 pixel grid with non-zero dimensions.
#[derive(Debug, Clone)]
pub struct DecodedImage {
    pixels: RgbImage,
}

impl DecodedImage {
    pub fn from_rgb(pixels: RgbImage) -> Result<Self, SegmentationError> {
        if pixels.width() == 0 || pixels.height() == 0 {
            return Err(SegmentationError::InvalidImage(format!(
                "image has empty dimensions {}x{}",
                pixels.width(),
                pixels.height()
            )));
        }
        Ok(Self { pixels })
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }
}

pub fn decode_image(raw: &RawImage, limits: &ImageLimits) -> Result<DecodedImage, SegmentationError> {
    if raw.is_empty() {
        return Err(SegmentationError::InvalidImage("upload is empty".to_string()));
    }

    if raw.len() > limits.max_bytes {
        return Err(SegmentationError::ImageTooLarge(format!(
            "{} bytes exceeds the limit of {} bytes",
            raw.len(),
            limits.max_bytes
        )));
    }

    if let Some(content_type) = raw.content_type() {
        if !content_type.starts_with("image/") {
            return Err(SegmentationError::InvalidImage(format!(
                "content type `{}` is not an image",
                content_type
            )));
        }
    }

    let image_reader = ImageReader::new(Cursor::new(raw.bytes.as_slice()))
        .with_guessed_format()
        .map_err(|e| SegmentationError::InvalidImage(format!("Error reading image: {}", e)))?;

    let format = image_reader
        .format()
        .ok_or_else(|| SegmentationError::InvalidImage("unrecognized image format".to_string()))?;

    let (width, height) = image_reader
        .into_dimensions()
        .map_err(|e| SegmentationError::InvalidImage(format!("Error reading header: {}", e)))?;

    if width == 0 || height == 0 {
        return Err(SegmentationError::InvalidImage(format!(
            "image has empty dimensions {}x{}",
            width, height
        )));
    }

    let pixel_count = u64::from(width) * u64::from(height);
    if pixel_count > limits.max_pixels {
        return Err(SegmentationError::ImageTooLarge(format!(
            "{}x{} ({} pixels) exceeds the limit of {} pixels",
            width, height, pixel_count, limits.max_pixels
        )));
    }

    let decoded = ImageReader::with_format(Cursor::new(raw.bytes.as_slice()), format)
        .decode()
        .map_err(|e| SegmentationError::InvalidImage(format!("Error decoding image: {}", e)))?;

    tracing::debug!(width, height, ?format, "Decoded upload");

    DecodedImage::from_rgb(decoded.to_rgb8())
}
