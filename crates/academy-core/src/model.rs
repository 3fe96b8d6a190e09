//! Similarity models and how they are loaded.
//!
//! A pretrained twin network exported to ONNX is preferred. When no artifact
//! is available the loader builds the same architecture with deterministic,
//! untrained weights so the pipeline stays exercisable, and flags it through
//! [`ModelVariant::UntrainedFallback`].

use ort::session::Session;
use ort::value::TensorRef;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

use crate::network::{Architecture, SiameseNetwork};
use crate::preprocess::{FaceTensor, INPUT_SHAPE};

pub const DEFAULT_FALLBACK_SEED: u64 = 42;
const ONNX_INTRA_THREADS: usize = 2;
const ONNX_INPUT_COUNT: usize = 2;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelLoadError {
    #[error("model artifact not found: {0}")]
    ArtifactNotFound(String),
    #[error("failed to load model artifact {path}: {reason}")]
    Artifact { path: String, reason: String },
    #[error("invalid network architecture: {0}")]
    InvalidArchitecture(String),
    #[error("no usable model: artifact ({artifact}); fallback ({fallback})")]
    Exhausted { artifact: String, fallback: String },
    #[error("model handle has been disposed")]
    Disposed,
    #[error("model load task failed: {0}")]
    TaskFailed(String),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum PredictionError {
    #[error("tensor shape mismatch: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("vector length mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },
    #[error("similarity {0} outside [0, 1]")]
    ScoreOutOfRange(f32),
    #[error("inference failed: {0}")]
    Inference(String),
}

/// Which network is actually answering.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelVariant {
    Pretrained { artifact: String, sha256: String },
    /// Structurally correct but untrained. Scores are close to arbitrary.
    UntrainedFallback { seed: u64 },
}

impl ModelVariant {
    pub fn is_trained(&self) -> bool {
        matches!(self, Self::Pretrained { .. })
    }
}

/// Static description of a loaded model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub variant: ModelVariant,
    pub input_shapes: Vec<Vec<usize>>,
    pub output_shape: Vec<usize>,
    /// Unknown for opaque ONNX graphs.
    pub layers: Option<usize>,
    pub parameters: Option<u64>,
    pub embedding_dim: Option<usize>,
}

/// Scores a pair of face tensors.
///
/// Implementations are read-only once loaded and may be shared across tasks.
pub trait SimilarityModel: Send + Sync {
    fn variant(&self) -> &ModelVariant;

    /// Raw similarity for one pair. Callers go through [`checked_score`].
    fn score(&self, a: &FaceTensor, b: &FaceTensor) -> Result<f32, PredictionError>;

    fn info(&self) -> ModelInfo;
}

/// Produces a ready model. Runs on the blocking pool.
pub trait ModelLoader: Send + Sync + 'static {
    fn load(&self) -> Result<Arc<dyn SimilarityModel>, ModelLoadError>;
}

/// Score a pair, enforcing the tensor-shape and [0, 1] contracts.
///
/// Out-of-range output (including NaN) is a model fault and is reported, not clamped.
pub fn checked_score(
    model: &dyn SimilarityModel,
    a: &FaceTensor,
    b: &FaceTensor,
) -> Result<f32, PredictionError> {
    for tensor in [a, b] {
        if tensor.shape() != INPUT_SHAPE {
            return Err(PredictionError::ShapeMismatch {
                expected: INPUT_SHAPE.to_vec(),
                actual: tensor.shape().to_vec(),
            });
        }
    }

    let score = model.score(a, b)?;
    if !(0.0..=1.0).contains(&score) {
        return Err(PredictionError::ScoreOutOfRange(score));
    }
    Ok(score)
}

/// Pretrained twin network exported to ONNX.
///
/// Expects two `[1, 100, 100, 3]` f32 inputs and one scalar output.
pub struct OnnxSiamese {
    session: Mutex<Session>,
    variant: ModelVariant,
}

impl OnnxSiamese {
    /// Load the ONNX artifact from the given path.
    pub fn load(path: &Path) -> Result<Self, ModelLoadError> {
        let display = path.display().to_string();
        if !path.exists() {
            return Err(ModelLoadError::ArtifactNotFound(display));
        }

        let artifact_err = |reason: String| ModelLoadError::Artifact {
            path: display.clone(),
            reason,
        };

        let sha256 = artifact_digest(path).map_err(|e| artifact_err(format!("read: {e}")))?;

        let session = open_session(path).map_err(|e| artifact_err(e.to_string()))?;

        let input_count = session.inputs().len();
        if input_count != ONNX_INPUT_COUNT {
            return Err(artifact_err(format!(
                "twin network needs {ONNX_INPUT_COUNT} inputs, graph has {input_count}"
            )));
        }

        tracing::info!(
            path = %path.display(),
            sha256 = %sha256,
            inputs = ?session.inputs().iter().map(|i| i.name()).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded pretrained siamese model"
        );

        Ok(Self {
            session: Mutex::new(session),
            variant: ModelVariant::Pretrained {
                artifact: display,
                sha256,
            },
        })
    }
}

impl SimilarityModel for OnnxSiamese {
    fn variant(&self) -> &ModelVariant {
        &self.variant
    }

    fn score(&self, a: &FaceTensor, b: &FaceTensor) -> Result<f32, PredictionError> {
        let inference = |e: String| PredictionError::Inference(e);

        let left = TensorRef::from_array_view(a.view()).map_err(|e| inference(e.to_string()))?;
        let right = TensorRef::from_array_view(b.view()).map_err(|e| inference(e.to_string()))?;

        let mut session = self
            .session
            .lock()
            .map_err(|_| inference("session lock poisoned".into()))?;

        let outputs = session
            .run(ort::inputs![left, right])
            .map_err(|e| inference(e.to_string()))?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| inference(format!("similarity extraction: {e}")))?;

        let score = data.first().copied();
        score.ok_or_else(|| inference("empty similarity output".into()))
    }

    fn info(&self) -> ModelInfo {
        ModelInfo {
            variant: self.variant.clone(),
            input_shapes: vec![INPUT_SHAPE.to_vec(); ONNX_INPUT_COUNT],
            output_shape: vec![1, 1],
            layers: None,
            parameters: None,
            embedding_dim: None,
        }
    }
}

/// Untrained twin network built from a seed.
pub struct FallbackSiamese {
    network: SiameseNetwork,
    variant: ModelVariant,
}

impl FallbackSiamese {
    pub fn build(architecture: &Architecture, seed: u64) -> Result<Self, ModelLoadError> {
        let network = SiameseNetwork::untrained(architecture, seed)?;
        Ok(Self {
            network,
            variant: ModelVariant::UntrainedFallback { seed },
        })
    }
}

impl SimilarityModel for FallbackSiamese {
    fn variant(&self) -> &ModelVariant {
        &self.variant
    }

    fn score(&self, a: &FaceTensor, b: &FaceTensor) -> Result<f32, PredictionError> {
        self.network.similarity(a, b)
    }

    fn info(&self) -> ModelInfo {
        let architecture = self.network.architecture();
        ModelInfo {
            variant: self.variant.clone(),
            input_shapes: vec![INPUT_SHAPE.to_vec(); 2],
            output_shape: vec![1, 1],
            layers: Some(architecture.layer_count()),
            parameters: architecture.parameter_count(),
            embedding_dim: Some(architecture.embedding_dim),
        }
    }
}

/// Loads the pretrained artifact, falling back to an untrained network.
#[derive(Debug, Clone)]
pub struct ArtifactLoader {
    artifact_path: PathBuf,
    architecture: Architecture,
    seed: u64,
}

impl ArtifactLoader {
    pub fn new(artifact_path: impl Into<PathBuf>) -> Self {
        Self {
            artifact_path: artifact_path.into(),
            architecture: Architecture::default(),
            seed: DEFAULT_FALLBACK_SEED,
        }
    }

    /// Architecture of the fallback network.
    pub fn with_architecture(mut self, architecture: Architecture) -> Self {
        self.architecture = architecture;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn artifact_path(&self) -> &Path {
        &self.artifact_path
    }
}

impl ModelLoader for ArtifactLoader {
    fn load(&self) -> Result<Arc<dyn SimilarityModel>, ModelLoadError> {
        let artifact_err = match OnnxSiamese::load(&self.artifact_path) {
            Ok(model) => return Ok(Arc::new(model)),
            Err(e) => e,
        };

        tracing::warn!(
            error = %artifact_err,
            seed = self.seed,
            "pretrained siamese model unavailable; using UNTRAINED fallback network, recognition scores will be unreliable"
        );

        match FallbackSiamese::build(&self.architecture, self.seed) {
            Ok(model) => {
                tracing::info!(
                    parameters = ?self.architecture.parameter_count(),
                    embedding_dim = self.architecture.embedding_dim,
                    "fallback siamese network constructed"
                );
                Ok(Arc::new(model))
            }
            Err(fallback_err) => Err(ModelLoadError::Exhausted {
                artifact: artifact_err.to_string(),
                fallback: fallback_err.to_string(),
            }),
        }
    }
}

fn open_session(path: &Path) -> ort::Result<Session> {
    Ok(Session::builder()?
        .with_intra_threads(ONNX_INTRA_THREADS)?
        .commit_from_file(path)?)
}

/// Hex SHA-256 of the artifact file.
fn artifact_digest(path: &Path) -> std::io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::ConvStage;
    use ndarray::Array4;
    use std::io::Write;

    fn tiny_architecture() -> Architecture {
        Architecture {
            stages: vec![ConvStage { filters: 2, kernel: 4, pool: true }],
            embedding_dim: 8,
        }
    }

    fn tensor(value: f32) -> FaceTensor {
        FaceTensor::from_array(Array4::from_elem(INPUT_SHAPE, value)).unwrap()
    }

    struct Constant(f32, ModelVariant);

    impl SimilarityModel for Constant {
        fn variant(&self) -> &ModelVariant {
            &self.1
        }
        fn score(&self, _: &FaceTensor, _: &FaceTensor) -> Result<f32, PredictionError> {
            Ok(self.0)
        }
        fn info(&self) -> ModelInfo {
            unimplemented!()
        }
    }

    #[test]
    fn test_checked_score_rejects_out_of_range() {
        let variant = ModelVariant::UntrainedFallback { seed: 0 };
        for bad in [1.5, -0.1, f32::NAN] {
            let model = Constant(bad, variant.clone());
            let err = checked_score(&model, &tensor(0.1), &tensor(0.2)).unwrap_err();
            assert!(matches!(err, PredictionError::ScoreOutOfRange(_)), "{bad}: {err:?}");
        }
        let model = Constant(1.0, variant);
        assert_eq!(checked_score(&model, &tensor(0.1), &tensor(0.2)).unwrap(), 1.0);
    }

    #[test]
    fn test_loader_falls_back_without_artifact() {
        let loader = ArtifactLoader::new("/nonexistent/siamese_model.onnx")
            .with_architecture(tiny_architecture())
            .with_seed(9);
        let model = loader.load().unwrap();

        assert_eq!(model.variant(), &ModelVariant::UntrainedFallback { seed: 9 });
        assert!(!model.variant().is_trained());

        let score = checked_score(model.as_ref(), &tensor(0.3), &tensor(0.7)).unwrap();
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn test_loader_exhausted_when_fallback_invalid() {
        let broken = Architecture {
            stages: vec![ConvStage { filters: 2, kernel: 500, pool: false }],
            embedding_dim: 8,
        };
        let err = ArtifactLoader::new("/nonexistent/siamese_model.onnx")
            .with_architecture(broken)
            .load()
            .err()
            .unwrap();
        assert!(matches!(err, ModelLoadError::Exhausted { .. }), "got {err:?}");
    }

    #[test]
    fn test_corrupt_artifact_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"not an onnx graph").unwrap();
        let err = OnnxSiamese::load(file.path()).err().unwrap();
        assert!(matches!(err, ModelLoadError::Artifact { .. }), "got {err:?}");
    }

    #[test]
    fn test_artifact_digest() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"abc").unwrap();
        assert_eq!(
            artifact_digest(file.path()).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_fallback_info_reports_architecture() {
        let model = FallbackSiamese::build(&tiny_architecture(), 1).unwrap();
        let info = model.info();
        assert_eq!(info.input_shapes, vec![vec![1, 100, 100, 3]; 2]);
        assert_eq!(info.embedding_dim, Some(8));
        assert_eq!(info.parameters, tiny_architecture().parameter_count());
        assert_eq!(info.layers, Some(6));
    }
}
