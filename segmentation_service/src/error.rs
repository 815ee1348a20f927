use std::time::Duration;
use thiserror::Error;

/// Failure kinds of a single segmentation request.
///
/// `InvalidImage` and `ImageTooLarge` are faults in the client's upload.
/// Every other variant is a server-side fault and is logged with context.
#[derive(Error, Debug)]
pub enum SegmentationError {
    #[error("Invalid image: {0}")]
    InvalidImage(String),

    #[error("Image too large: {0}")]
    ImageTooLarge(String),

    #[error("Preprocessing failed: {0}")]
    Preprocessing(String),

    #[error("Inference failed: {0}")]
    Inference(#[from] InferenceError),

    #[error("Encoding failed: {0}")]
    Encoding(String),

    #[error("Worker task failed: {0}")]
    Worker(String),
}

impl SegmentationError {
    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidImage(_) | Self::ImageTooLarge(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidImage(_) => "invalid_image",
            Self::ImageTooLarge(_) => "image_too_large",
            Self::Preprocessing(_) => "preprocessing",
            Self::Inference(InferenceError::Timeout(_)) => "inference_timeout",
            Self::Inference(_) => "inference",
            Self::Encoding(_) => "encoding",
            Self::Worker(_) => "worker",
        }
    }
}

/// Errors raised by the inference service. A timeout is kept apart from model
/// failures so capacity problems can be told from correctness problems.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InferenceError {
    #[error("timed out after {}ms waiting for the model", .0.as_millis())]
    Timeout(Duration),

    #[error("model failure: {0}")]
    Model(String),

    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
}

impl InferenceError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }
}
