//! Adaptive-threshold recognition decision.
//!
//! Confidence blends the average score (a consistently similar reference set)
//! with the maximum (at least one strong match). A tight spread of scores
//! earns the lower acceptance threshold; a wide spread signals noisy input
//! and requires the higher one.

use serde::{Deserialize, Serialize};

use crate::types::{RecognitionOutcome, SimilarityStats};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionPolicy {
    pub average_weight: f32,
    pub maximum_weight: f32,
    /// Spreads strictly below this count as consistent.
    pub consistency_spread: f32,
    pub consistent_threshold: f32,
    pub inconsistent_threshold: f32,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self {
            average_weight: 0.7,
            maximum_weight: 0.3,
            consistency_spread: 0.3,
            consistent_threshold: 0.4,
            inconsistent_threshold: 0.6,
        }
    }
}

impl DecisionPolicy {
    pub fn weighted_confidence(&self, average: f32, maximum: f32) -> f32 {
        self.average_weight * average + self.maximum_weight * maximum
    }

    pub fn is_consistent(&self, spread: f32) -> bool {
        spread < self.consistency_spread
    }

    pub fn threshold(&self, consistent: bool) -> f32 {
        if consistent {
            self.consistent_threshold
        } else {
            self.inconsistent_threshold
        }
    }

    pub fn decide(&self, stats: &SimilarityStats) -> RecognitionOutcome {
        let confidence = self.weighted_confidence(stats.average, stats.maximum);
        let consistent = self.is_consistent(stats.spread);
        let threshold = self.threshold(consistent);

        RecognitionOutcome {
            is_recognized: confidence > threshold,
            confidence,
            threshold,
            consistent,
        }
    }
}

/// Decide with the default policy.
pub fn decide(stats: &SimilarityStats) -> RecognitionOutcome {
    DecisionPolicy::default().decide(stats)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(average: f32, maximum: f32, spread: f32) -> SimilarityStats {
        SimilarityStats {
            scores: vec![],
            average,
            maximum,
            minimum: maximum - spread,
            spread,
            skipped: vec![],
        }
    }

    #[test]
    fn test_consistent_uses_lower_threshold() {
        // 0.7 * 0.5 + 0.3 * 0.5 = 0.5 in both cases
        let consistent = decide(&stats(0.5, 0.5, 0.1));
        assert!(consistent.consistent);
        assert!(consistent.is_recognized);
        assert!((consistent.threshold - 0.4).abs() < 1e-6);

        let inconsistent = decide(&stats(0.5, 0.5, 0.5));
        assert!(!inconsistent.consistent);
        assert!(!inconsistent.is_recognized);
        assert!((inconsistent.threshold - 0.6).abs() < 1e-6);

        assert!((consistent.confidence - inconsistent.confidence).abs() < 1e-6);
    }

    #[test]
    fn test_spread_at_boundary_is_inconsistent() {
        let policy = DecisionPolicy::default();
        assert!(policy.is_consistent(0.29));
        assert!(!policy.is_consistent(policy.consistency_spread));
    }

    #[test]
    fn test_threshold_is_strict() {
        let policy = DecisionPolicy {
            average_weight: 1.0,
            maximum_weight: 0.0,
            ..DecisionPolicy::default()
        };
        let outcome = policy.decide(&stats(0.4, 0.4, 0.0));
        assert_eq!(outcome.confidence, 0.4);
        assert!(!outcome.is_recognized);
    }

    #[test]
    fn test_uniform_scores_scenario() {
        let stats = SimilarityStats::from_scores(vec![0.75; 8], vec![]).unwrap();
        let outcome = decide(&stats);
        assert!(outcome.is_recognized);
        assert!((outcome.confidence - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_split_scores_scenario() {
        let stats = SimilarityStats::from_scores(vec![0.9, 0.2, 0.9, 0.2], vec![]).unwrap();
        let outcome = decide(&stats);
        assert!(!outcome.consistent);
        assert!(outcome.is_recognized);
        assert!((outcome.confidence - 0.655).abs() < 1e-5, "got {}", outcome.confidence);
    }

    #[test]
    fn test_confidence_monotonic_in_each_input() {
        let policy = DecisionPolicy::default();
        let steps: Vec<f32> = (0..=20).map(|i| i as f32 / 20.0).collect();

        for &fixed in &steps {
            for pair in steps.windows(2) {
                let (lo, hi) = (pair[0], pair[1]);
                assert!(policy.weighted_confidence(lo, fixed) <= policy.weighted_confidence(hi, fixed));
                assert!(policy.weighted_confidence(fixed, lo) <= policy.weighted_confidence(fixed, hi));
            }
        }
    }

    #[test]
    fn test_policy_deserializes_with_defaults() {
        let policy: DecisionPolicy =
            serde_json::from_str(r#"{"consistent_threshold": 0.45}"#).unwrap();
        assert_eq!(policy.consistent_threshold, 0.45);
        assert_eq!(policy.inconsistent_threshold, 0.6);
    }
}
