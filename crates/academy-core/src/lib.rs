//! academy-core: Face similarity scoring for Face Academy.
//!
//! A probe image is compared against a user's reference photos with a
//! twin (Siamese) network: shared encoder, L1 distance, sigmoid head.
//! Pair scores are aggregated and a consistency-aware threshold decides
//! whether the user is recognized.

pub mod aggregate;
pub mod decision;
pub mod lifecycle;
pub mod model;
pub mod network;
pub mod preprocess;
pub mod recognizer;
pub mod types;

use std::path::PathBuf;

pub use aggregate::{aggregate, RecognitionError, DEFAULT_MAX_COMPARED};
pub use decision::{decide, DecisionPolicy};
pub use lifecycle::{ModelManager, ModelState};
pub use model::{
    ArtifactLoader, ModelInfo, ModelLoadError, ModelLoader, ModelVariant, PredictionError,
    SimilarityModel,
};
pub use network::{l1_distance, Architecture, SiameseNetwork};
pub use preprocess::{FaceTensor, ImageLoadError, Preprocessor, PreprocessorError};
pub use recognizer::{PairError, Recognizer, RuntimeInfo};
pub use types::{
    ImageSource, MemoryUsage, RecognitionOutcome, RecognitionReport, SimilarityStats, Verdict,
};

const MODEL_FILENAME: &str = "siamese_model.onnx";

/// Default location of the pretrained artifact:
/// `$XDG_DATA_HOME/face-academy/models/siamese_model.onnx`.
pub fn default_model_path() -> PathBuf {
    let data_dir = std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        });
    data_dir.join("face-academy").join("models").join(MODEL_FILENAME)
}
