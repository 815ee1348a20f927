//! Deterministic model stubs and fixtures shared by the unit tests.

use crate::{
    model_service::{ModelError, SegmentationModel},
    palette::{ClassLabel, ClassPalette},
    preprocess::TensorShape,
};
use image::{ImageFormat, Rgb, RgbImage};
use ndarray::{Array3, ArrayView4, Axis};
use std::{
    io::Cursor,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// Small working resolution so tests stay fast.
pub const MODEL_SHAPE: TensorShape = TensorShape::new(16, 32);

pub fn encode_png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
    let img = RgbImage::from_pixel(width, height, Rgb(color));
    let mut image_data: Vec<u8> = Vec::new();
    img.write_to(&mut Cursor::new(&mut image_data), ImageFormat::Png)
        .unwrap();
    image_data
}

pub fn palette_with_background(background: &[usize]) -> ClassPalette {
    let classes = vec![
        ClassLabel::new("background", [0, 0, 0]),
        ClassLabel::new("road", [128, 64, 128]),
        ClassLabel::new("building", [220, 20, 60]),
        ClassLabel::new("car", [0, 0, 142]),
        ClassLabel::new("person", [190, 153, 153]),
        ClassLabel::new("vegetation", [107, 142, 35]),
        ClassLabel::new("sky", [70, 130, 180]),
        ClassLabel::new("traffic_sign", [70, 70, 70]),
    ];
    ClassPalette::new(classes, background).unwrap()
}

pub fn test_palette(background: usize) -> ClassPalette {
    palette_with_background(&[background])
}

fn one_hot(height: usize, width: usize, num_classes: usize, class: usize) -> Array3<f32> {
    let mut scores = Array3::<f32>::zeros((height, width, num_classes));
    scores.index_axis_mut(Axis(2), class).fill(1.0);
    scores
}

/// Scores `class` highest at every pixel.
#[derive(Debug, Clone)]
pub struct ConstantModel {
    class: usize,
    num_classes: usize,
}

impl ConstantModel {
    pub fn new(class: usize, num_classes: usize) -> Self {
        Self { class, num_classes }
    }
}

impl SegmentationModel for ConstantModel {
    fn infer(&mut self, input: ArrayView4<'_, f32>) -> Result<Array3<f32>, ModelError> {
        let (_, height, width, _) = input.dim();
        Ok(one_hot(height, width, self.num_classes, self.class))
    }
}

/// Picks the class from the red channel, so the output depends on the input.
#[derive(Debug, Clone)]
pub struct BrightnessModel {
    pub num_classes: usize,
}

impl SegmentationModel for BrightnessModel {
    fn infer(&mut self, input: ArrayView4<'_, f32>) -> Result<Array3<f32>, ModelError> {
        let (_, height, width, _) = input.dim();
        let steps = (self.num_classes - 1) as f32;
        Ok(Array3::from_shape_fn(
            (height, width, self.num_classes),
            |(y, x, class)| {
                let target = input[[0, y, x, 0]] * steps;
                1.0 - (target - class as f32).abs()
            },
        ))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct FailingModel;

impl SegmentationModel for FailingModel {
    fn infer(&mut self, _input: ArrayView4<'_, f32>) -> Result<Array3<f32>, ModelError> {
        Err(ModelError::new("session run", "backend exploded"))
    }
}

#[derive(Debug, Default)]
struct ProbeState {
    calls: AtomicUsize,
    current: AtomicUsize,
    max_concurrent: AtomicUsize,
    delay_ms: AtomicU64,
}

/// Observes an [`InstrumentedModel`] from the test body.
#[derive(Debug, Clone)]
pub struct ModelProbe(Arc<ProbeState>);

impl ModelProbe {
    pub fn calls(&self) -> usize {
        self.0.calls.load(Ordering::SeqCst)
    }

    pub fn max_concurrent(&self) -> usize {
        self.0.max_concurrent.load(Ordering::SeqCst)
    }

    pub fn set_delay(&self, delay: Duration) {
        self.0
            .delay_ms
            .store(delay.as_millis() as u64, Ordering::SeqCst);
    }
}

/// Constant model that sleeps for a configurable time and records how many
/// calls overlap. The probe is shared, so overlap is counted across replicas
/// created with [`InstrumentedModel::sharing`].
#[derive(Debug)]
pub struct InstrumentedModel {
    inner: ConstantModel,
    state: Arc<ProbeState>,
}

impl InstrumentedModel {
    pub fn new(class: usize, num_classes: usize, delay: Duration) -> Self {
        let model = Self {
            inner: ConstantModel::new(class, num_classes),
            state: Arc::new(ProbeState::default()),
        };
        model.probe().set_delay(delay);
        model
    }

    pub fn sharing(probe: &ModelProbe, class: usize, num_classes: usize) -> Self {
        Self {
            inner: ConstantModel::new(class, num_classes),
            state: probe.0.clone(),
        }
    }

    pub fn probe(&self) -> ModelProbe {
        ModelProbe(self.state.clone())
    }
}

impl SegmentationModel for InstrumentedModel {
    fn infer(&mut self, input: ArrayView4<'_, f32>) -> Result<Array3<f32>, ModelError> {
        self.state.calls.fetch_add(1, Ordering::SeqCst);
        let current = self.state.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.state.max_concurrent.fetch_max(current, Ordering::SeqCst);

        let delay = self.state.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            std::thread::sleep(Duration::from_millis(delay));
        }

        let result = self.inner.infer(input);
        self.state.current.fetch_sub(1, Ordering::SeqCst);
        result
    }
}
