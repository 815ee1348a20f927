use crate::{codec::DecodedImage, error::SegmentationError};
use image::imageops::{self, FilterType};
use ndarray::{Array4, ArrayView4};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Spatial size of the network input. Batch size and channel count are fixed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TensorShape {
    pub height: u32,
    pub width: u32,
}

impl TensorShape {
    pub const CHANNELS: usize = 3;

    pub const fn new(height: u32, width: u32) -> Self {
        Self { height, width }
    }

    /// NHWC dimensions of the input tensor.
    pub fn input_dims(&self) -> [usize; 4] {
        [1, self.height as usize, self.width as usize, Self::CHANNELS]
    }

    pub fn output_dims(&self, num_classes: usize) -> [usize; 3] {
        [self.height as usize, self.width as usize, num_classes]
    }
}

impl fmt::Display for TensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Interpolation {
    Nearest,
    #[default]
    Bilinear,
    CatmullRom,
    Lanczos3,
}

impl Interpolation {
    fn filter(self) -> FilterType {
        match self {
            Interpolation::Nearest => FilterType::Nearest,
            Interpolation::Bilinear => FilterType::Triangle,
            Interpolation::CatmullRom => FilterType::CatmullRom,
            Interpolation::Lanczos3 => FilterType::Lanczos3,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NormalizationRange {
    /// `[0, 1]`
    #[default]
    UnitInterval,
    /// `[-1, 1]`
    Symmetric,
}

impl NormalizationRange {
    pub fn apply(self, value: u8) -> f32 {
        match self {
            NormalizationRange::UnitInterval => f32::from(value) / 255.,
            NormalizationRange::Symmetric => f32::from(value) / 127.5 - 1.,
        }
    }
}

/// Normalized `(1, H, W, 3)` network input, owned by one request.
#[derive(Debug, Clone, PartialEq)]
pub struct InputTensor(Array4<f32>);

impl InputTensor {
    #[cfg(test)]
    pub fn new(data: Array4<f32>) -> Self {
        Self(data)
    }

    pub fn shape(&self) -> &[usize] {
        self.0.shape()
    }

    pub fn view(&self) -> ArrayView4<'_, f32> {
        self.0.view()
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    shape: TensorShape,
    interpolation: Interpolation,
    normalization: NormalizationRange,
}

impl Preprocessor {
    pub fn new(
        shape: TensorShape,
        interpolation: Interpolation,
        normalization: NormalizationRange,
    ) -> Self {
        Self {
            shape,
            interpolation,
            normalization,
        }
    }

    /// Stretches the image to the model shape and scales every channel into
    /// the configured range. Aspect ratio is not preserved.
    pub fn preprocess(&self, image: &DecodedImage) -> Result<InputTensor, SegmentationError> {
        let TensorShape { height, width } = self.shape;
        let pixels = image.pixels();

        let resized = if pixels.dimensions() == (width, height) {
            pixels.clone()
        } else {
            imageops::resize(pixels, width, height, self.interpolation.filter())
        };

        let (resized_width, resized_height) = resized.dimensions();
        if (resized_width, resized_height) != (width, height) {
            return Err(SegmentationError::Preprocessing(format!(
                "resize produced {}x{}, expected {}",
                resized_width, resized_height, self.shape
            )));
        }

        let array = Array4::from_shape_vec(
            (1, height as usize, width as usize, TensorShape::CHANNELS),
            resized.into_raw(),
        )
        .map_err(|e| {
            SegmentationError::Preprocessing(format!(
                "pixel buffer does not match tensor shape: {}",
                e
            ))
        })?;

        let normalization = self.normalization;
        Ok(InputTensor(array.mapv(|value| normalization.apply(value))))
    }
}
