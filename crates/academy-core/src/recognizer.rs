//! Recognition facade.
//!
//! Lazily loads the model, scores the probe against the references, applies
//! the decision policy and always hands back a [`RecognitionReport`].

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::Instrument;
use uuid::Uuid;

use crate::aggregate::{aggregate, RecognitionError, DEFAULT_MAX_COMPARED};
use crate::decision::DecisionPolicy;
use crate::lifecycle::{ModelManager, ModelState};
use crate::model::{checked_score, ModelInfo, ModelLoadError, ModelVariant, PredictionError};
use crate::preprocess::{ImageLoadError, Preprocessor};
use crate::types::{
    ImageSource, MemoryUsage, RecognitionOutcome, RecognitionReport, SimilarityStats, Verdict,
};

#[derive(Error, Debug)]
pub enum PairError {
    #[error("model unavailable: {0}")]
    Model(#[from] ModelLoadError),
    #[error(transparent)]
    Image(#[from] ImageLoadError),
    #[error(transparent)]
    Prediction(#[from] PredictionError),
}

/// Model description plus live runtime state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeInfo {
    pub state: ModelState,
    pub model: ModelInfo,
    pub memory: MemoryUsage,
}

pub struct Recognizer {
    models: Arc<ModelManager>,
    preprocessor: Preprocessor,
    policy: DecisionPolicy,
    max_compared: usize,
}

impl Recognizer {
    pub fn new(models: Arc<ModelManager>, preprocessor: Preprocessor) -> Self {
        Self {
            models,
            preprocessor,
            policy: DecisionPolicy::default(),
            max_compared: DEFAULT_MAX_COMPARED,
        }
    }

    pub fn with_policy(mut self, policy: DecisionPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_max_compared(mut self, max_compared: usize) -> Self {
        self.max_compared = max_compared;
        self
    }

    pub fn models(&self) -> &Arc<ModelManager> {
        &self.models
    }

    pub fn preprocessor(&self) -> &Preprocessor {
        &self.preprocessor
    }

    /// Run one recognition attempt. Never fails: errors become a rejected
    /// outcome with a verdict saying what went wrong.
    pub async fn recognize(
        &self,
        probe: &ImageSource,
        references: &[ImageSource],
    ) -> RecognitionReport {
        let attempt_id = Uuid::new_v4();
        let span = tracing::info_span!("recognition", attempt = %attempt_id);

        async {
            let (verdict, outcome, stats, model_variant, failure) =
                match self.try_recognize(probe, references).await {
                    Ok((stats, outcome, variant)) => {
                        let verdict = if outcome.is_recognized {
                            Verdict::Recognized
                        } else {
                            Verdict::LowConfidence
                        };
                        (verdict, outcome, Some(stats), Some(variant), None)
                    }
                    Err(e) => {
                        let verdict = verdict_for(&e);
                        tracing::warn!(?verdict, error = %e, "recognition attempt could not be scored");
                        let variant = self.models.variant().await;
                        (verdict, RecognitionOutcome::rejected(), None, variant, Some(e.to_string()))
                    }
                };

            tracing::info!(
                ?verdict,
                recognized = outcome.is_recognized,
                confidence = outcome.confidence,
                threshold = outcome.threshold,
                "recognition complete"
            );

            RecognitionReport {
                attempt_id,
                evaluated_at: Utc::now(),
                verdict,
                outcome,
                stats,
                model_variant,
                failure,
            }
        }
        .instrument(span)
        .await
    }

    /// Recognition with errors surfaced instead of folded into a report.
    pub async fn try_recognize(
        &self,
        probe: &ImageSource,
        references: &[ImageSource],
    ) -> Result<(SimilarityStats, RecognitionOutcome, ModelVariant), RecognitionError> {
        // No references: report it without loading the model.
        if references.is_empty() {
            return Err(RecognitionError::NoReferenceData);
        }

        let model = self.models.load_model().await?;
        if !model.variant().is_trained() {
            tracing::warn!(variant = ?model.variant(), "scoring with untrained fallback model");
        }

        let stats = aggregate(
            &self.preprocessor,
            model.as_ref(),
            probe,
            references,
            self.max_compared,
        )
        .await?;
        let outcome = self.policy.decide(&stats);

        Ok((stats, outcome, model.variant().clone()))
    }

    /// Similarity of a single pair of images.
    pub async fn score_pair(&self, a: &ImageSource, b: &ImageSource) -> Result<f32, PairError> {
        let model = self.models.load_model().await?;
        let left = self.preprocessor.preprocess(a).await?;
        let right = self.preprocessor.preprocess(b).await?;
        let score = checked_score(model.as_ref(), &left, &right)?;
        tracing::debug!(score, variant = ?model.variant(), "pair scored");
        Ok(score)
    }

    /// Load the model if needed and describe it.
    pub async fn info(&self) -> Result<RuntimeInfo, ModelLoadError> {
        let model = self.models.load_model().await?;
        Ok(RuntimeInfo {
            state: self.models.state().await,
            model: model.info(),
            memory: self.preprocessor.ledger().usage(),
        })
    }
}

fn verdict_for(error: &RecognitionError) -> Verdict {
    match error {
        RecognitionError::NoReferenceData => Verdict::NoTrainingData,
        RecognitionError::AllComparisonsFailed { .. } => Verdict::ComparisonsFailed,
        RecognitionError::ProbeUnreadable(_) => Verdict::ProbeUnreadable,
        RecognitionError::ModelLoad(_) => Verdict::ModelUnavailable,
    }
}
