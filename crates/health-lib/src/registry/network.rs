//! Neural model abstraction and native fallback networks
//!
//! Trained networks are loaded from ONNX artifacts (see `onnx.rs`). When an
//! artifact is missing or unusable the registry installs one of the
//! architecturally equivalent networks built here: same input shape, same
//! output width, deterministic Xavier-initialized weights.

use super::ModelError;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tract_onnx::prelude::tract_ndarray::{Array1, Array2, ArrayD, ArrayView1, Axis, Ix2, Ix3};

/// A feed-forward or recurrent model with a fixed input shape
pub trait NeuralModel: Send + Sync {
    /// Short identifier used in logs
    fn name(&self) -> &str;

    /// Exact input shape, batch dimension included
    fn input_shape(&self) -> &[usize];

    /// Number of values produced for a single input
    fn output_len(&self) -> usize;

    /// Run the model on an input already known to match `input_shape`
    fn forward(&self, input: ArrayD<f32>) -> Result<Vec<f32>, ModelError>;

    /// Validate the input shape, run the model and validate the output width
    fn predict(&self, input: ArrayD<f32>) -> Result<Vec<f32>, ModelError> {
        if input.shape() != self.input_shape() {
            return Err(ModelError::ShapeMismatch {
                expected: self.input_shape().to_vec(),
                got: input.shape().to_vec(),
            });
        }
        let output = self.forward(input)?;
        if output.len() != self.output_len() {
            return Err(ModelError::OutputSize {
                expected: self.output_len(),
                got: output.len(),
            });
        }
        Ok(output)
    }
}

/// Element-wise activation applied after a dense layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Activation {
    Identity,
    Relu,
    Tanh,
    Sigmoid,
    Softmax,
}

impl Activation {
    fn apply(self, mut values: Array1<f32>) -> Array1<f32> {
        match self {
            Activation::Identity => values,
            Activation::Relu => values.mapv(|v| v.max(0.0)),
            Activation::Tanh => values.mapv(f32::tanh),
            Activation::Sigmoid => values.mapv(sigmoid),
            Activation::Softmax => {
                let max = values.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
                values.mapv_inplace(|v| (v - max).exp());
                let sum = values.sum();
                if sum > 0.0 {
                    values /= sum;
                }
                values
            }
        }
    }
}

fn sigmoid(v: f32) -> f32 {
    1.0 / (1.0 + (-v).exp())
}

/// Fully connected layer, weights laid out as (inputs, outputs)
#[derive(Debug, Clone)]
pub struct DenseLayer {
    weights: Array2<f32>,
    bias: Array1<f32>,
    activation: Activation,
}

impl DenseLayer {
    pub fn new(weights: Array2<f32>, bias: Array1<f32>, activation: Activation) -> Self {
        Self {
            weights,
            bias,
            activation,
        }
    }

    fn xavier(rng: &mut StdRng, n_in: usize, n_out: usize, activation: Activation) -> Self {
        Self {
            weights: xavier_matrix(rng, n_in, n_out),
            bias: Array1::zeros(n_out),
            activation,
        }
    }

    fn forward(&self, input: ArrayView1<f32>) -> Array1<f32> {
        self.activation.apply(input.dot(&self.weights) + &self.bias)
    }
}

/// Single LSTM layer with gates packed as [input, forget, cell, output]
#[derive(Debug, Clone)]
pub struct LstmLayer {
    input_weights: Array2<f32>,
    recurrent_weights: Array2<f32>,
    bias: Array1<f32>,
    hidden: usize,
}

impl LstmLayer {
    fn xavier(rng: &mut StdRng, n_in: usize, hidden: usize) -> Self {
        let mut bias = Array1::zeros(4 * hidden);
        // forget gate starts open
        for j in hidden..2 * hidden {
            bias[j] = 1.0;
        }
        Self {
            input_weights: xavier_matrix(rng, n_in, 4 * hidden),
            recurrent_weights: xavier_matrix(rng, hidden, 4 * hidden),
            bias,
            hidden,
        }
    }

    /// Returns the hidden state for every timestep, shape (steps, hidden)
    fn forward(&self, sequence: &Array2<f32>) -> Array2<f32> {
        let h = self.hidden;
        let steps = sequence.nrows();
        let mut hidden_state = Array1::<f32>::zeros(h);
        let mut cell = Array1::<f32>::zeros(h);
        let mut outputs = Array2::<f32>::zeros((steps, h));

        for (t, x) in sequence.axis_iter(Axis(0)).enumerate() {
            let z = x.dot(&self.input_weights) + hidden_state.dot(&self.recurrent_weights) + &self.bias;
            for j in 0..h {
                let input_gate = sigmoid(z[j]);
                let forget_gate = sigmoid(z[h + j]);
                let candidate = z[2 * h + j].tanh();
                let output_gate = sigmoid(z[3 * h + j]);
                cell[j] = forget_gate * cell[j] + input_gate * candidate;
                hidden_state[j] = output_gate * cell[j].tanh();
            }
            outputs.row_mut(t).assign(&hidden_state);
        }
        outputs
    }
}

fn xavier_matrix(rng: &mut StdRng, n_in: usize, n_out: usize) -> Array2<f32> {
    let limit = (6.0 / (n_in + n_out) as f32).sqrt();
    Array2::from_shape_fn((n_in, n_out), |_| rng.gen_range(-limit..limit))
}

#[derive(Debug, Clone)]
pub enum Layer {
    Dense(DenseLayer),
    Lstm(LstmLayer),
}

/// In-process network used when no trained artifact is available
///
/// Inputs of rank 2 (`[1, features]`) are treated as a single vector;
/// inputs of rank 3 (`[1, steps, features]`) as a sequence. A dense layer
/// following recurrent layers consumes the last timestep.
#[derive(Debug, Clone)]
pub struct NativeNetwork {
    name: String,
    input_shape: Vec<usize>,
    output_len: usize,
    layers: Vec<Layer>,
}

enum Activations {
    Vector(Array1<f32>),
    Sequence(Array2<f32>),
}

impl NativeNetwork {
    pub fn new(name: impl Into<String>, input_shape: Vec<usize>, output_len: usize, layers: Vec<Layer>) -> Self {
        Self {
            name: name.into(),
            input_shape,
            output_len,
            layers,
        }
    }

    /// Dense autoencoder 11 → 8 → 4 → 8 → 11
    pub fn fallback_autoencoder(features: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(0x0a07_0e0c);
        let layers = vec![
            Layer::Dense(DenseLayer::xavier(&mut rng, features, 8, Activation::Relu)),
            Layer::Dense(DenseLayer::xavier(&mut rng, 8, 4, Activation::Relu)),
            Layer::Dense(DenseLayer::xavier(&mut rng, 4, 8, Activation::Relu)),
            Layer::Dense(DenseLayer::xavier(&mut rng, 8, features, Activation::Identity)),
        ];
        Self::new("autoencoder", vec![1, features], features, layers)
    }

    /// LSTM(64) → LSTM(32) → dense 16 relu → dense 1
    pub fn fallback_rul(steps: usize, features: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(0x0000_52c1);
        let layers = vec![
            Layer::Lstm(LstmLayer::xavier(&mut rng, features, 64)),
            Layer::Lstm(LstmLayer::xavier(&mut rng, 64, 32)),
            Layer::Dense(DenseLayer::xavier(&mut rng, 32, 16, Activation::Relu)),
            Layer::Dense(DenseLayer::xavier(&mut rng, 16, 1, Activation::Identity)),
        ];
        Self::new("rul", vec![1, steps, features], 1, layers)
    }

    /// Dense 32 relu → softmax over the part classes
    pub fn fallback_part_risk(features: usize, classes: usize) -> Self {
        let mut rng = StdRng::seed_from_u64(0x0000_9a27);
        let layers = vec![
            Layer::Dense(DenseLayer::xavier(&mut rng, features, 32, Activation::Relu)),
            Layer::Dense(DenseLayer::xavier(&mut rng, 32, classes, Activation::Softmax)),
        ];
        Self::new("part_risk", vec![1, features], classes, layers)
    }

    fn initial_activations(&self, input: ArrayD<f32>) -> Result<Activations, ModelError> {
        match input.ndim() {
            2 => {
                let matrix = input
                    .into_dimensionality::<Ix2>()
                    .map_err(|e| ModelError::Runtime(e.into()))?;
                Ok(Activations::Vector(matrix.row(0).to_owned()))
            }
            3 => {
                let tensor = input
                    .into_dimensionality::<Ix3>()
                    .map_err(|e| ModelError::Runtime(e.into()))?;
                Ok(Activations::Sequence(tensor.index_axis(Axis(0), 0).to_owned()))
            }
            n => Err(ModelError::Runtime(anyhow::anyhow!("unsupported input rank {}", n))),
        }
    }
}

impl NeuralModel for NativeNetwork {
    fn name(&self) -> &str {
        &self.name
    }

    fn input_shape(&self) -> &[usize] {
        &self.input_shape
    }

    fn output_len(&self) -> usize {
        self.output_len
    }

    fn forward(&self, input: ArrayD<f32>) -> Result<Vec<f32>, ModelError> {
        let mut activations = self.initial_activations(input)?;

        for layer in &self.layers {
            activations = match (layer, activations) {
                (Layer::Lstm(lstm), Activations::Sequence(seq)) => Activations::Sequence(lstm.forward(&seq)),
                (Layer::Lstm(_), Activations::Vector(_)) => {
                    return Err(ModelError::Runtime(anyhow::anyhow!(
                        "recurrent layer received a non-sequence input"
                    )))
                }
                (Layer::Dense(dense), Activations::Vector(v)) => Activations::Vector(dense.forward(v.view())),
                (Layer::Dense(dense), Activations::Sequence(seq)) => {
                    let last = seq
                        .axis_iter(Axis(0))
                        .last()
                        .ok_or_else(|| ModelError::Runtime(anyhow::anyhow!("empty sequence")))?;
                    Activations::Vector(dense.forward(last))
                }
            };
        }

        match activations {
            Activations::Vector(v) => Ok(v.to_vec()),
            Activations::Sequence(seq) => Ok(seq.iter().copied().collect()),
        }
    }
}
