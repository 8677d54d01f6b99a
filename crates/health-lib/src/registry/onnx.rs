//! ONNX inference using tract
//!
//! Trained networks are exported to ONNX and compiled by tract against the
//! exact input shape the orchestrator feeds them. A zero-valued probe run
//! at load time proves the output width before the model is installed.
//! tract panics on some malformed graphs (an input without a type, for
//! instance); those panics are caught and reported as load errors.

use super::network::NeuralModel;
use super::ModelError;
use anyhow::{anyhow, Context, Result};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tract_onnx::prelude::*;
use tracing::{debug, warn};

/// Inference latency above which a warning is logged
const MAX_INFERENCE_MS: u128 = 50;

type TractModel = SimplePlan<TypedFact, Box<dyn TypedOp>, Graph<TypedFact, Box<dyn TypedOp>>>;

/// Trained network compiled with tract
pub struct OnnxModel {
    name: String,
    model: TractModel,
    input_shape: Vec<usize>,
    output_len: usize,
    inference_count: AtomicU64,
    slow_inference_count: AtomicU64,
}

impl OnnxModel {
    /// Compile a model from ONNX bytes and verify its output width
    pub fn from_bytes(
        name: impl Into<String>,
        model_bytes: &[u8],
        input_shape: &[usize],
        output_len: usize,
    ) -> Result<Self> {
        let name = name.into();
        let compiled = panic::catch_unwind(AssertUnwindSafe(|| {
            Self::compile(name.clone(), model_bytes, input_shape, output_len)
        }));
        match compiled {
            Ok(result) => result,
            Err(payload) => Err(anyhow!(
                "tract panicked while loading {} model: {}",
                name,
                panic_message(payload.as_ref())
            )),
        }
    }

    fn compile(name: String, model_bytes: &[u8], input_shape: &[usize], output_len: usize) -> Result<Self> {
        let model = Self::load_model(model_bytes, input_shape)
            .with_context(|| format!("Failed to compile {} model", name))?;
        let onnx = Self {
            name,
            model,
            input_shape: input_shape.to_vec(),
            output_len,
            inference_count: AtomicU64::new(0),
            slow_inference_count: AtomicU64::new(0),
        };

        let probe = tract_ndarray::ArrayD::<f32>::zeros(tract_ndarray::IxDyn(input_shape));
        onnx.predict(probe)
            .with_context(|| format!("Probe inference failed for {} model", onnx.name))?;
        Ok(onnx)
    }

    fn load_model(model_bytes: &[u8], input_shape: &[usize]) -> Result<TractModel> {
        let model = tract_onnx::onnx()
            .model_for_read(&mut std::io::Cursor::new(model_bytes))
            .context("Failed to parse ONNX model")?
            .with_input_fact(0, f32::fact(input_shape.to_vec()).into())
            .context("Failed to set input shape")?
            .into_optimized()
            .context("Failed to optimize model")?
            .into_runnable()
            .context("Failed to create runnable model")?;
        Ok(model)
    }

    pub fn inference_count(&self) -> u64 {
        self.inference_count.load(Ordering::Relaxed)
    }

    pub fn slow_inference_count(&self) -> u64 {
        self.slow_inference_count.load(Ordering::Relaxed)
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}

impl NeuralModel for OnnxModel {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_len(&self) -> usize {
        self.output_len
    }

    fn forward(&self, input: tract_ndarray::ArrayD<f32>) -> Result<Vec<f32>, ModelError> {
        let start = Instant::now();

        let tensor: Tensor = input.into();
        let result = self.model.run(tvec!(tensor.into()))?;
        let output = result.first().context("No output from model")?;
        let values: Vec<f32> = output.to_array_view::<f32>()?.iter().copied().collect();

        let elapsed = start.elapsed();
        self.inference_count.fetch_add(1, Ordering::Relaxed);

        if elapsed.as_millis() > MAX_INFERENCE_MS {
            self.slow_inference_count.fetch_add(1, Ordering::Relaxed);
            warn!(
                model = %self.name,
                elapsed_ms = elapsed.as_millis(),
                "Inference exceeded {}ms target",
                MAX_INFERENCE_MS
            );
        } else {
            debug!(model = %self.name, elapsed_us = elapsed.as_micros(), "Inference completed");
        }

        Ok(values)
    }
}

/// Minimal ONNX graphs for exercising the loader
#[cfg(test)]
pub(crate) mod fixtures {
    use prost::Message;
    use tract_onnx::pb;

    fn tensor_type(dims: &[i64]) -> pb::TypeProto {
        let dim = dims
            .iter()
            .map(|d| pb::tensor_shape_proto::Dimension {
                value: Some(pb::tensor_shape_proto::dimension::Value::DimValue(*d)),
                ..Default::default()
            })
            .collect();
        pb::TypeProto {
            value: Some(pb::type_proto::Value::TensorType(pb::type_proto::Tensor {
                elem_type: pb::tensor_proto::DataType::Float as i32,
                shape: Some(pb::TensorShapeProto { dim }),
            })),
            ..Default::default()
        }
    }

    /// Serialized `y = Identity(x)`; `dims: None` leaves the input untyped
    pub(crate) fn identity_model(dims: Option<&[i64]>) -> Vec<u8> {
        let value_info = |name: &str, r#type: Option<pb::TypeProto>| pb::ValueInfoProto {
            name: name.to_string(),
            r#type,
            ..Default::default()
        };
        let graph = pb::GraphProto {
            name: "identity".to_string(),
            node: vec![pb::NodeProto {
                input: vec!["x".to_string()],
                output: vec!["y".to_string()],
                name: "identity".to_string(),
                op_type: "Identity".to_string(),
                ..Default::default()
            }],
            input: vec![value_info("x", dims.map(tensor_type))],
            output: vec![value_info("y", dims.map(tensor_type))],
            ..Default::default()
        };
        pb::ModelProto {
            ir_version: 7,
            opset_import: vec![pb::OperatorSetIdProto {
                domain: String::new(),
                version: 13,
            }],
            producer_name: "health-lib-tests".to_string(),
            graph: Some(graph),
            ..Default::default()
        }
        .encode_to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::identity_model;
    use super::*;

    #[test]
    fn test_garbage_bytes_rejected() {
        let result = OnnxModel::from_bytes("autoencoder", b"not an onnx model", &[1, 11], 11);
        let err = result.err().expect("garbage must not compile");
        assert!(format!("{:#}", err).contains("autoencoder"));
    }

    #[test]
    fn test_typed_identity_compiles_and_runs() {
        let model = OnnxModel::from_bytes("autoencoder", &identity_model(Some(&[1, 11])), &[1, 11], 11).unwrap();
        assert_eq!(model.inference_count(), 1);

        let input = tract_ndarray::ArrayD::from_elem(tract_ndarray::IxDyn(&[1, 11]), 0.25f32);
        let output = model.predict(input).unwrap();
        assert_eq!(output, vec![0.25; 11]);
        assert_eq!(model.inference_count(), 2);
    }

    #[test]
    fn test_output_width_mismatch_rejected() {
        let err = OnnxModel::from_bytes("rul", &identity_model(Some(&[1, 11, 11])), &[1, 11, 11], 1)
            .err()
            .expect("identity emits 121 values, not 1");
        let message = format!("{:#}", err);
        assert!(message.contains("rul model"));
        assert!(message.contains("expected 1, got 121"));
    }

    #[test]
    fn test_untyped_input_is_an_error() {
        let err = OnnxModel::from_bytes("autoencoder", &identity_model(None), &[1, 11], 11)
            .err()
            .expect("untyped input must not compile");
        assert!(format!("{:#}", err).contains("autoencoder"));
    }
}
