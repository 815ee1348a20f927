use ndarray::{Array3, ArrayView4};
use std::fmt::Display;
use thiserror::Error;

#[derive(Error, Debug)]
#[error("{operation} failed: {message}")]
pub struct ModelError {
    pub operation: String,
    pub message: String,
}

impl ModelError {
    pub fn new(operation: impl Into<String>, err: impl Display) -> Self {
        Self {
            operation: operation.into(),
            message: err.to_string(),
        }
    }
}

/// A loaded segmentation network.
///
/// Takes a `(1, H, W, 3)` tensor and returns per-pixel class scores shaped
/// `(H, W, num_classes)`. `infer` takes `&mut self`: a model instance is never
/// invoked from two threads at once, the inference service guards each one.
pub trait SegmentationModel: Send + 'static {
    fn infer(&mut self, input: ArrayView4<'_, f32>) -> Result<Array3<f32>, ModelError>;
}
