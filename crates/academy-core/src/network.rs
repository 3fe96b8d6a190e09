//! Twin-network similarity model implemented directly over `ndarray`.
//!
//! Both images pass through the same encoder (convolution + max-pool
//! stages, then a sigmoid dense layer producing the embedding). The two
//! embeddings are combined with [`l1_distance`] and reduced by a sigmoid
//! head to a similarity in [0, 1].

use ndarray::{s, Array1, Array2, Array3, ArrayView1, Axis};
use rand::distributions::{Distribution, Uniform};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use crate::model::{ModelLoadError, PredictionError};
use crate::preprocess::{FaceTensor, INPUT_CHANNELS, INPUT_SIZE};

pub const EMBEDDING_DIM: usize = 4096;
const POOL_SIZE: usize = 2;

/// One convolution (stride 1, valid padding, ReLU), optionally followed by a
/// 2x2 max-pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConvStage {
    pub filters: usize,
    pub kernel: usize,
    pub pool: bool,
}

/// Encoder layout. The default is the canonical face network.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Architecture {
    pub stages: Vec<ConvStage>,
    pub embedding_dim: usize,
}

impl Default for Architecture {
    fn default() -> Self {
        Self {
            stages: vec![
                ConvStage { filters: 64, kernel: 10, pool: true },
                ConvStage { filters: 128, kernel: 7, pool: true },
                ConvStage { filters: 128, kernel: 4, pool: true },
                ConvStage { filters: 256, kernel: 4, pool: false },
            ],
            embedding_dim: EMBEDDING_DIM,
        }
    }
}

impl Architecture {
    /// Spatial size and channel count after the last stage, or `None` if a
    /// kernel no longer fits.
    pub fn feature_shape(&self) -> Option<(usize, usize)> {
        let mut size = INPUT_SIZE;
        let mut channels = INPUT_CHANNELS;
        for stage in &self.stages {
            if stage.kernel == 0 || stage.filters == 0 || stage.kernel > size {
                return None;
            }
            size = size - stage.kernel + 1;
            if stage.pool {
                if size < POOL_SIZE {
                    return None;
                }
                size /= POOL_SIZE;
            }
            channels = stage.filters;
        }
        Some((size, channels))
    }

    /// Width of the flattened feature map feeding the embedding layer.
    pub fn flatten_len(&self) -> Option<usize> {
        self.feature_shape().map(|(size, channels)| size * size * channels)
    }

    /// Trainable parameters (weights + biases) of encoder and head.
    pub fn parameter_count(&self) -> Option<u64> {
        let mut channels = INPUT_CHANNELS;
        let mut total = 0u64;
        for stage in &self.stages {
            let fan_in = stage.kernel * stage.kernel * channels;
            total += (fan_in * stage.filters + stage.filters) as u64;
            channels = stage.filters;
        }
        let flatten = self.flatten_len()?;
        total += (flatten * self.embedding_dim + self.embedding_dim) as u64;
        total += (self.embedding_dim + 1) as u64;
        Some(total)
    }

    /// Convolutions, pools, flatten, embedding, distance and head.
    pub fn layer_count(&self) -> usize {
        let pools = self.stages.iter().filter(|s| s.pool).count();
        self.stages.len() + pools + 4
    }
}

#[derive(Debug, Clone)]
struct ConvLayer {
    kernel: usize,
    /// Flattened `(ky, kx, in_channel)` rows by output-channel columns.
    weights: Array2<f32>,
    bias: Array1<f32>,
    pool: bool,
}

/// Fully connected layer with sigmoid activation.
#[derive(Debug, Clone)]
pub struct DenseLayer {
    weights: Array2<f32>,
    bias: Array1<f32>,
}

impl DenseLayer {
    /// `weights` is `(inputs, outputs)`; `bias` has one entry per output.
    pub fn new(weights: Array2<f32>, bias: Array1<f32>) -> Result<Self, ModelLoadError> {
        if weights.ncols() != bias.len() {
            return Err(ModelLoadError::InvalidArchitecture(format!(
                "dense layer has {} outputs but {} biases",
                weights.ncols(),
                bias.len()
            )));
        }
        Ok(Self { weights, bias })
    }

    pub fn inputs(&self) -> usize {
        self.weights.nrows()
    }

    pub fn outputs(&self) -> usize {
        self.weights.ncols()
    }

    fn forward(&self, input: ArrayView1<'_, f32>) -> Result<Array1<f32>, PredictionError> {
        if input.len() != self.inputs() {
            return Err(PredictionError::DimensionMismatch {
                left: input.len(),
                right: self.inputs(),
            });
        }
        let mut out = input.dot(&self.weights) + &self.bias;
        out.mapv_inplace(sigmoid);
        Ok(out)
    }
}

/// Shared-encoder twin network.
#[derive(Debug, Clone)]
pub struct SiameseNetwork {
    architecture: Architecture,
    convs: Vec<ConvLayer>,
    embedding: DenseLayer,
    head: DenseLayer,
}

impl SiameseNetwork {
    /// Build the network with Glorot-uniform weights from a seeded RNG and
    /// zero biases. Same seed, same weights.
    pub fn untrained(architecture: &Architecture, seed: u64) -> Result<Self, ModelLoadError> {
        let flatten = architecture.flatten_len().ok_or_else(|| {
            ModelLoadError::InvalidArchitecture(format!(
                "stages {:?} do not fit a {INPUT_SIZE}x{INPUT_SIZE} input",
                architecture.stages
            ))
        })?;
        if architecture.embedding_dim == 0 {
            return Err(ModelLoadError::InvalidArchitecture(
                "embedding dimension must be non-zero".into(),
            ));
        }

        let mut rng = StdRng::seed_from_u64(seed);
        let mut channels = INPUT_CHANNELS;
        let mut convs = Vec::with_capacity(architecture.stages.len());

        for stage in &architecture.stages {
            let area = stage.kernel * stage.kernel;
            let rows = area * channels;
            convs.push(ConvLayer {
                kernel: stage.kernel,
                weights: glorot(&mut rng, (rows, stage.filters), rows, area * stage.filters),
                bias: Array1::zeros(stage.filters),
                pool: stage.pool,
            });
            channels = stage.filters;
        }

        let dim = architecture.embedding_dim;
        let embedding = DenseLayer::new(glorot(&mut rng, (flatten, dim), flatten, dim), Array1::zeros(dim))?;
        let head = DenseLayer::new(glorot(&mut rng, (dim, 1), dim, 1), Array1::zeros(1))?;

        Ok(Self {
            architecture: architecture.clone(),
            convs,
            embedding,
            head,
        })
    }

    /// Replace the scoring head, e.g. with trained weights.
    pub fn with_head(mut self, head: DenseLayer) -> Result<Self, ModelLoadError> {
        if head.inputs() != self.architecture.embedding_dim || head.outputs() != 1 {
            return Err(ModelLoadError::InvalidArchitecture(format!(
                "head must map {} inputs to 1 output, got {}x{}",
                self.architecture.embedding_dim,
                head.inputs(),
                head.outputs()
            )));
        }
        self.head = head;
        Ok(self)
    }

    pub fn architecture(&self) -> &Architecture {
        &self.architecture
    }

    /// Encode one image into its embedding vector.
    pub fn embed(&self, tensor: &FaceTensor) -> Result<Array1<f32>, PredictionError> {
        let mut features: Array3<f32> = tensor.view().index_axis(Axis(0), 0).to_owned();

        for layer in &self.convs {
            features = conv2d_relu(&features, layer)?;
            if layer.pool {
                features = max_pool(&features);
            }
        }

        let flat: Array1<f32> = features.iter().copied().collect();
        self.embedding.forward(flat.view())
    }

    /// Similarity of two images in [0, 1].
    pub fn similarity(&self, a: &FaceTensor, b: &FaceTensor) -> Result<f32, PredictionError> {
        let left = self.embed(a)?;
        let right = self.embed(b)?;
        let distance = l1_distance(left.view(), right.view())?;
        let out = self.head.forward(distance.view())?;
        out.first()
            .copied()
            .ok_or_else(|| PredictionError::Inference("head produced no output".into()))
    }
}

/// Element-wise absolute difference of two embeddings.
pub fn l1_distance(
    a: ArrayView1<'_, f32>,
    b: ArrayView1<'_, f32>,
) -> Result<Array1<f32>, PredictionError> {
    if a.len() != b.len() {
        return Err(PredictionError::DimensionMismatch {
            left: a.len(),
            right: b.len(),
        });
    }
    Ok((&a - &b).mapv(f32::abs))
}

fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

fn glorot(rng: &mut StdRng, shape: (usize, usize), fan_in: usize, fan_out: usize) -> Array2<f32> {
    let limit = (6.0 / (fan_in + fan_out) as f32).sqrt();
    let dist = Uniform::new_inclusive(-limit, limit);
    Array2::from_shape_simple_fn(shape, || dist.sample(&mut *rng))
}

/// Valid, stride-1 convolution with ReLU via im2col + matmul.
fn conv2d_relu(input: &Array3<f32>, layer: &ConvLayer) -> Result<Array3<f32>, PredictionError> {
    let (height, width, channels) = input.dim();
    let k = layer.kernel;
    let patch = k * k * channels;

    if k > height || k > width || patch != layer.weights.nrows() {
        return Err(PredictionError::Inference(format!(
            "conv kernel {k}x{k}x{} does not fit input {height}x{width}x{channels}",
            layer.weights.nrows() / (k * k).max(1)
        )));
    }

    let out_h = height - k + 1;
    let out_w = width - k + 1;
    let mut cols = Array2::<f32>::zeros((out_h * out_w, patch));

    for oy in 0..out_h {
        for ox in 0..out_w {
            let window = input.slice(s![oy..oy + k, ox..ox + k, ..]);
            for (dst, src) in cols.row_mut(oy * out_w + ox).iter_mut().zip(window.iter()) {
                *dst = *src;
            }
        }
    }

    let mut out = cols.dot(&layer.weights) + &layer.bias;
    out.mapv_inplace(|v| v.max(0.0));

    let filters = layer.weights.ncols();
    out.into_shape_with_order((out_h, out_w, filters))
        .map_err(|e| PredictionError::Inference(format!("conv output reshape: {e}")))
}

/// 2x2 max-pool, stride 2, valid padding.
fn max_pool(input: &Array3<f32>) -> Array3<f32> {
    let (height, width, channels) = input.dim();
    let out_h = height / POOL_SIZE;
    let out_w = width / POOL_SIZE;

    Array3::from_shape_fn((out_h, out_w, channels), |(y, x, c)| {
        let (y0, x0) = (y * POOL_SIZE, x * POOL_SIZE);
        input[[y0, x0, c]]
            .max(input[[y0 + 1, x0, c]])
            .max(input[[y0, x0 + 1, c]])
            .max(input[[y0 + 1, x0 + 1, c]])
    })
}
