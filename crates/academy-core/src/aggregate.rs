//! Probe-vs-references scoring and summary statistics.

use thiserror::Error;

use crate::model::{checked_score, ModelLoadError, PredictionError, SimilarityModel};
use crate::preprocess::{FaceFrame, ImageLoadError, Preprocessor};
use crate::types::{ImageSource, SimilarityStats, SkippedReference};

/// References compared per attempt unless configured otherwise.
pub const DEFAULT_MAX_COMPARED: usize = 8;

#[derive(Error, Debug, Clone)]
pub enum RecognitionError {
    #[error("no reference images available; capture training photos first")]
    NoReferenceData,
    #[error("all {attempted} reference comparisons failed")]
    AllComparisonsFailed {
        attempted: usize,
        skipped: Vec<SkippedReference>,
    },
    #[error("probe image unreadable: {0}")]
    ProbeUnreadable(#[source] ImageLoadError),
    #[error("model unavailable: {0}")]
    ModelLoad(#[from] ModelLoadError),
}

/// Why a single reference was excluded.
#[derive(Error, Debug)]
enum ComparisonError {
    #[error(transparent)]
    Load(#[from] ImageLoadError),
    #[error(transparent)]
    Prediction(#[from] PredictionError),
}

/// Score `probe` against the first `max_compared` references, in order.
///
/// A failing reference is logged and skipped; the attempt only fails when
/// the probe is unreadable or no reference produced a score. A
/// `max_compared` of 0 is treated as 1.
pub async fn aggregate(
    preprocessor: &Preprocessor,
    model: &dyn SimilarityModel,
    probe: &ImageSource,
    references: &[ImageSource],
    max_compared: usize,
) -> Result<SimilarityStats, RecognitionError> {
    if references.is_empty() {
        return Err(RecognitionError::NoReferenceData);
    }

    let probe_frame = preprocessor
        .load(probe)
        .await
        .map_err(RecognitionError::ProbeUnreadable)?;

    let attempted = references.len().min(max_compared.max(1));
    tracing::info!(
        available = references.len(),
        attempted,
        "comparing probe against references"
    );

    let mut scores = Vec::with_capacity(attempted);
    let mut skipped = Vec::new();

    for (index, reference) in references.iter().take(attempted).enumerate() {
        match compare(preprocessor, model, &probe_frame, reference).await {
            Ok(score) => {
                tracing::debug!(index, score, "reference scored");
                scores.push(score);
            }
            Err(e) => {
                let source = reference.preview();
                tracing::warn!(index, source = %source, error = %e, "reference comparison failed; excluded from statistics");
                skipped.push(SkippedReference {
                    index,
                    source,
                    reason: e.to_string(),
                });
            }
        }
    }

    let stats = match SimilarityStats::from_scores(scores, skipped) {
        Ok(stats) => stats,
        Err(skipped) => {
            tracing::warn!(attempted, "every reference comparison failed");
            return Err(RecognitionError::AllComparisonsFailed { attempted, skipped });
        }
    };

    tracing::info!(
        scored = stats.scores.len(),
        skipped = stats.skipped.len(),
        average = stats.average,
        maximum = stats.maximum,
        minimum = stats.minimum,
        spread = stats.spread,
        "similarity statistics"
    );

    Ok(stats)
}

/// One comparison. Both tensors are released before returning.
async fn compare(
    preprocessor: &Preprocessor,
    model: &dyn SimilarityModel,
    probe: &FaceFrame,
    reference: &ImageSource,
) -> Result<f32, ComparisonError> {
    let reference = preprocessor.preprocess(reference).await?;
    let probe = probe.to_tensor();
    Ok(checked_score(model, &probe, &reference)?)
}
