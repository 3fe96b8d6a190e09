use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::model::ModelVariant;

/// Characters of an inline payload or URL kept in logs and error messages.
const SOURCE_PREVIEW_CHARS: usize = 64;

/// Where a face image comes from.
///
/// Inline payloads are either `data:<mime>;base64,<payload>` URIs or bare
/// base64 (assumed JPEG). `Debug` prints only a truncated preview so webcam
/// frames never end up in logs wholesale.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum ImageSource {
    Inline(String),
    Url(String),
    /// Encoded image bytes already held in memory (JPEG, PNG, ...).
    Encoded(Vec<u8>),
}

impl ImageSource {
    /// Classify a string source: `http...` is fetched, everything else is
    /// decoded inline.
    pub fn parse(source: impl Into<String>) -> Self {
        let source = source.into();
        if source.starts_with("http") {
            Self::Url(source)
        } else {
            Self::Inline(source)
        }
    }

    /// Short, log-safe identifier for this source.
    pub fn preview(&self) -> String {
        match self {
            Self::Inline(s) | Self::Url(s) => {
                let mut chars = s.chars();
                let head: String = chars.by_ref().take(SOURCE_PREVIEW_CHARS).collect();
                if chars.next().is_some() {
                    format!("{head}...")
                } else {
                    head
                }
            }
            Self::Encoded(bytes) => format!("<{} encoded bytes>", bytes.len()),
        }
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = match self {
            Self::Inline(_) => "Inline",
            Self::Url(_) => "Url",
            Self::Encoded(_) => "Encoded",
        };
        f.debug_tuple(kind).field(&self.preview()).finish()
    }
}

impl From<&str> for ImageSource {
    fn from(source: &str) -> Self {
        Self::parse(source)
    }
}

impl From<String> for ImageSource {
    fn from(source: String) -> Self {
        Self::parse(source)
    }
}

/// A reference that was excluded from the statistics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkippedReference {
    /// Position in the caller-supplied reference list.
    pub index: usize,
    pub source: String,
    pub reason: String,
}

/// Summary of all pairwise scores from one recognition attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimilarityStats {
    /// Scores in reference order, failed comparisons omitted.
    pub scores: Vec<f32>,
    pub average: f32,
    pub maximum: f32,
    pub minimum: f32,
    /// `maximum - minimum`.
    pub spread: f32,
    pub skipped: Vec<SkippedReference>,
}

impl SimilarityStats {
    /// Build statistics from the scores that survived. With no scores the
    /// skipped list is handed back unchanged.
    pub fn from_scores(
        scores: Vec<f32>,
        skipped: Vec<SkippedReference>,
    ) -> Result<Self, Vec<SkippedReference>> {
        if scores.is_empty() {
            return Err(skipped);
        }

        let maximum = scores.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let minimum = scores.iter().copied().fold(f32::INFINITY, f32::min);
        let sum: f64 = scores.iter().map(|&s| f64::from(s)).sum();
        // Rounding must not push the mean outside the observed range.
        let average = ((sum / scores.len() as f64) as f32).clamp(minimum, maximum);

        Ok(Self {
            scores,
            average,
            maximum,
            minimum,
            spread: maximum - minimum,
            skipped,
        })
    }
}

/// Accept/reject decision for one attempt.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RecognitionOutcome {
    pub is_recognized: bool,
    /// Weighted confidence in [0, 1].
    pub confidence: f32,
    /// Threshold the confidence had to exceed.
    pub threshold: f32,
    /// Whether the reference scores agreed closely enough for the lower bar.
    pub consistent: bool,
}

impl RecognitionOutcome {
    /// Outcome reported when no usable score exists.
    pub fn rejected() -> Self {
        Self {
            is_recognized: false,
            confidence: 0.0,
            threshold: 0.0,
            consistent: false,
        }
    }
}

/// What the UI should tell the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Recognized,
    /// Scored fine, but below the threshold. Retry with better lighting.
    LowConfidence,
    /// No reference images. Retrain.
    NoTrainingData,
    /// Every reference comparison failed. Retry.
    ComparisonsFailed,
    ProbeUnreadable,
    ModelUnavailable,
}

/// Everything the result sink gets back from a recognition attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecognitionReport {
    pub attempt_id: Uuid,
    pub evaluated_at: DateTime<Utc>,
    pub verdict: Verdict,
    pub outcome: RecognitionOutcome,
    pub stats: Option<SimilarityStats>,
    pub model_variant: Option<ModelVariant>,
    /// Human-readable reason when the attempt could not be scored.
    pub failure: Option<String>,
}

impl RecognitionReport {
    pub fn is_recognized(&self) -> bool {
        self.outcome.is_recognized
    }

    pub fn confidence(&self) -> f32 {
        self.outcome.confidence
    }
}

/// Tensor memory currently held through one preprocessor.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryUsage {
    pub live_tensors: usize,
    pub live_bytes: usize,
    /// Tensors created over the preprocessor's lifetime.
    pub total_allocated: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_classifies_sources() {
        assert!(matches!(ImageSource::parse("https://cdn.example/a.jpg"), ImageSource::Url(_)));
        assert!(matches!(ImageSource::parse("http://localhost/a.jpg"), ImageSource::Url(_)));
        assert!(matches!(
            ImageSource::parse("data:image/png;base64,AAAA"),
            ImageSource::Inline(_)
        ));
        assert!(matches!(ImageSource::parse("/9j/4AAQSkZJRg"), ImageSource::Inline(_)));
    }

    #[test]
    fn test_preview_truncates_long_payloads() {
        let payload = format!("data:image/jpeg;base64,{}", "A".repeat(10_000));
        let preview = ImageSource::parse(payload).preview();
        assert_eq!(preview.chars().count(), SOURCE_PREVIEW_CHARS + 3);
        assert!(preview.ends_with("..."));
    }

    #[test]
    fn test_preview_keeps_short_sources() {
        let source = ImageSource::parse("https://cdn.example/a.jpg");
        assert_eq!(source.preview(), "https://cdn.example/a.jpg");
        assert_eq!(ImageSource::Encoded(vec![0; 12]).preview(), "<12 encoded bytes>");
    }

    #[test]
    fn test_debug_does_not_leak_payload() {
        let payload = format!("data:image/jpeg;base64,{}", "Q".repeat(500));
        let debug = format!("{:?}", ImageSource::parse(payload));
        assert!(debug.starts_with("Inline("));
        assert!(debug.len() < 100, "debug output too long: {debug}");
    }

    #[test]
    fn test_stats_empty_returns_skipped() {
        let skipped = vec![SkippedReference {
            index: 0,
            source: "<3 encoded bytes>".into(),
            reason: "decode failed".into(),
        }];
        assert_eq!(
            SimilarityStats::from_scores(vec![], skipped.clone()).unwrap_err(),
            skipped
        );
    }

    #[test]
    fn test_stats_summary() {
        let stats = SimilarityStats::from_scores(vec![0.9, 0.2, 0.9, 0.2], vec![]).unwrap();
        assert!((stats.average - 0.55).abs() < 1e-6);
        assert!((stats.maximum - 0.9).abs() < 1e-6);
        assert!((stats.minimum - 0.2).abs() < 1e-6);
        assert!((stats.spread - 0.7).abs() < 1e-6);
    }

    #[test]
    fn test_stats_average_within_range() {
        let lists: [&[f32]; 5] = [
            &[0.1],
            &[0.3333, 0.3333, 0.3333],
            &[0.0, 1.0],
            &[0.75; 8],
            &[0.12, 0.98, 0.47, 0.47, 0.05, 0.61],
        ];
        for scores in lists {
            let stats = SimilarityStats::from_scores(scores.to_vec(), vec![]).unwrap();
            assert!(stats.average >= stats.minimum && stats.average <= stats.maximum);
            assert!(stats.spread >= 0.0);
            assert_eq!(stats.spread, stats.maximum - stats.minimum);
        }
    }

    #[test]
    fn test_verdict_serializes_snake_case() {
        let json = serde_json::to_string(&Verdict::NoTrainingData).unwrap();
        assert_eq!(json, "\"no_training_data\"");
    }
}
