use crate::{
    config::ModelConfig,
    model_service::{ModelError, SegmentationModel},
    preprocess::TensorShape,
};
use ndarray::{Array3, Array4, ArrayD, ArrayView4, Axis, Ix4};
use ort::{
    session::{builder::GraphOptimizationLevel, Session},
    value::TensorRef,
};

/// ONNX Runtime backed model. Each instance owns its own session.
pub struct OrtSegmentationModel {
    session: Session,
    output_name: String,
}

impl OrtSegmentationModel {
    pub fn new(model_config: &ModelConfig) -> Result<Self, ModelError> {
        let model_path = model_config.get_path();
        let session = Session::builder()
            .map_err(|e| ModelError::new("session builder", e))?
            .with_optimization_level(GraphOptimizationLevel::Level3)
            .map_err(|e| ModelError::new("optimization level", e))?
            .commit_from_file(&model_path)
            .map_err(|e| ModelError::new(format!("loading {}", model_path.display()), e))?;

        let available: Vec<&str> = session
            .outputs
            .iter()
            .map(|output| output.name.as_str())
            .collect();
        let output_name = resolve_output_name(&model_config.output_name, &available)?;

        let mut model = Self {
            session,
            output_name,
        };
        model.warm_up(model_config.get_input_shape())?;

        Ok(model)
    }

    fn warm_up(&mut self, shape: TensorShape) -> Result<(), ModelError> {
        let data = Array4::<f32>::zeros(shape.input_dims());
        let output = self.infer(data.view())?;
        tracing::debug!("Warm-up run produced output of shape {:?}", output.shape());
        Ok(())
    }
}

impl SegmentationModel for OrtSegmentationModel {
    fn infer(&mut self, input: ArrayView4<'_, f32>) -> Result<Array3<f32>, ModelError> {
        let input = input.as_standard_layout();
        let tensor_ref = TensorRef::from_array_view(input.view())
            .map_err(|e| ModelError::new("build input tensor", e))?;

        let outputs = self
            .session
            .run(ort::inputs![tensor_ref])
            .map_err(|e| ModelError::new("session run", e))?;

        let output = outputs.get(self.output_name.as_str()).ok_or_else(|| {
            ModelError::new(
                "select output",
                format!("session produced no output named `{}`", self.output_name),
            )
        })?;
        let (shape, data) = output
            .try_extract_tensor::<f32>()
            .map_err(|e| ModelError::new("extract output tensor", e))?;

        let array = ArrayD::from_shape_vec(shape.to_ixdyn(), data.to_vec())
            .map_err(|e| ModelError::new("reshape output tensor", e))?
            .into_dimensionality::<Ix4>()
            .map_err(|e| ModelError::new("output rank", e))?;

        if array.len_of(Axis(0)) != 1 {
            return Err(ModelError::new(
                "output batch",
                format!("expected a batch of 1, got {}", array.len_of(Axis(0))),
            ));
        }

        Ok(array.index_axis_move(Axis(0), 0))
    }
}

/// Checks the configured output against the graph's outputs before the first run.
fn resolve_output_name(configured: &str, available: &[&str]) -> Result<String, ModelError> {
    if available.contains(&configured) {
        return Ok(configured.to_string());
    }
    Err(ModelError::new(
        "select output",
        format!(
            "model has no output named `{}`, available outputs: {:?}",
            configured, available
        ),
    ))
}
