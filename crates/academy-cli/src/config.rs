use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use academy_core::model::DEFAULT_FALLBACK_SEED;
use academy_core::{DecisionPolicy, DEFAULT_MAX_COMPARED};

/// CLI configuration: optional TOML file, then `FACE_ACADEMY_*` overrides.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Pretrained ONNX artifact. Missing file means the untrained fallback.
    pub model_path: PathBuf,
    /// Seed for the fallback network's weight initialisation.
    pub fallback_seed: u64,
    /// References compared per attempt.
    pub max_compared: usize,
    /// Timeout for remote image fetches.
    pub fetch_timeout_secs: u64,
    /// Wall-clock budget for one recognize call.
    pub recognize_timeout_secs: u64,
    pub decision: DecisionPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model_path: academy_core::default_model_path(),
            fallback_seed: DEFAULT_FALLBACK_SEED,
            max_compared: DEFAULT_MAX_COMPARED,
            fetch_timeout_secs: 10,
            recognize_timeout_secs: 30,
            decision: DecisionPolicy::default(),
        }
    }
}

impl Config {
    /// Load from `FACE_ACADEMY_CONFIG` (if set) and the process environment.
    pub fn load() -> Result<Self> {
        Self::load_with(|key| std::env::var(key).ok())
    }

    fn load_with(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let base = match lookup("FACE_ACADEMY_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        Ok(base.with_overrides(lookup))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;
        let config: Self = toml::from_str(&raw)
            .with_context(|| format!("parsing config file {}", path.display()))?;
        tracing::debug!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    fn with_overrides(self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        let d = self.decision;
        Self {
            model_path: lookup("FACE_ACADEMY_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(self.model_path),
            fallback_seed: env_u64(&lookup, "FACE_ACADEMY_FALLBACK_SEED", self.fallback_seed),
            max_compared: env_usize(&lookup, "FACE_ACADEMY_MAX_COMPARED", self.max_compared),
            fetch_timeout_secs: env_u64(
                &lookup,
                "FACE_ACADEMY_FETCH_TIMEOUT_SECS",
                self.fetch_timeout_secs,
            ),
            recognize_timeout_secs: env_u64(
                &lookup,
                "FACE_ACADEMY_RECOGNIZE_TIMEOUT_SECS",
                self.recognize_timeout_secs,
            ),
            decision: DecisionPolicy {
                average_weight: env_f32(&lookup, "FACE_ACADEMY_AVERAGE_WEIGHT", d.average_weight),
                maximum_weight: env_f32(&lookup, "FACE_ACADEMY_MAXIMUM_WEIGHT", d.maximum_weight),
                consistency_spread: env_f32(
                    &lookup,
                    "FACE_ACADEMY_CONSISTENCY_SPREAD",
                    d.consistency_spread,
                ),
                consistent_threshold: env_f32(
                    &lookup,
                    "FACE_ACADEMY_CONSISTENT_THRESHOLD",
                    d.consistent_threshold,
                ),
                inconsistent_threshold: env_f32(
                    &lookup,
                    "FACE_ACADEMY_INCONSISTENT_THRESHOLD",
                    d.inconsistent_threshold,
                ),
            },
        }
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn recognize_timeout(&self) -> Duration {
        Duration::from_secs(self.recognize_timeout_secs)
    }
}

fn env_f32(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: f32) -> f32 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: u64) -> u64 {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: usize) -> usize {
    lookup(key).and_then(|v| v.parse().ok()).unwrap_or(default)
}
