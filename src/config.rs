//! Configuration for activation sampling and result lookup

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Configuration for a feature activation sampling pass
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    /// Model hook point the encoder reads from, e.g. `blocks.3.hook_resid_post`
    pub hook_point: String,
    /// Token budget for the whole pass
    pub total_analyzing_tokens: u64,
    /// Number of contexts pulled from the batch source per step
    pub store_batch_size: usize,
    /// Tokens per context window
    pub context_size: usize,
    /// Top samples retained per channel (N)
    pub n_samples: usize,
    /// Exponent applied to the per-context max activation to form the weight
    pub sample_weight_exponent: f32,
    /// Weighted random sampling; when false, keep the top-N contexts by weight
    pub enable_sampling: bool,
    /// Histogram values are collected on every `histogram_interval`-th step
    pub histogram_interval: u64,
    /// Per-channel histogram cap (`None` = keep every collected value)
    pub histogram_capacity: Option<usize>,
    /// Random seed for reproducibility
    pub seed: u64,
    /// Directory the finalized result set is written to
    pub analysis_save_path: PathBuf,
    /// Number of storage shards
    pub n_shards: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            hook_point: "blocks.0.hook_resid_post".to_string(),
            total_analyzing_tokens: 10_000_000,
            store_batch_size: 32,
            context_size: 128,
            n_samples: 128,
            sample_weight_exponent: 2.0,
            enable_sampling: true,
            histogram_interval: 10,
            histogram_capacity: None,
            seed: 42,
            analysis_save_path: PathBuf::from("results/analysis/top_activations"),
            n_shards: 1024,
        }
    }
}

impl AnalysisConfig {
    /// Load a config from a JSON file. Missing fields take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject configurations the sampler cannot run with
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.hook_point.is_empty(), "hook_point must be set");
        anyhow::ensure!(
            self.total_analyzing_tokens > 0,
            "total_analyzing_tokens must be positive"
        );
        anyhow::ensure!(self.store_batch_size > 0, "store_batch_size must be positive");
        anyhow::ensure!(self.context_size > 0, "context_size must be positive");
        anyhow::ensure!(self.n_samples > 0, "n_samples must be positive");
        anyhow::ensure!(
            self.histogram_interval > 0,
            "histogram_interval must be positive"
        );
        anyhow::ensure!(
            self.sample_weight_exponent.is_finite() && self.sample_weight_exponent > 0.0,
            "sample_weight_exponent must be finite and positive, got {}",
            self.sample_weight_exponent
        );
        anyhow::ensure!(self.n_shards > 0, "n_shards must be positive");
        if let Some(cap) = self.histogram_capacity {
            anyhow::ensure!(cap > 0, "histogram_capacity must be positive when set");
        }
        Ok(())
    }

    /// Tokens consumed by one full batch
    pub fn tokens_per_batch(&self) -> u64 {
        (self.store_batch_size * self.context_size) as u64
    }

    /// Number of full batches the token budget corresponds to
    pub fn total_analyzing_steps(&self) -> u64 {
        self.total_analyzing_tokens / self.store_batch_size as u64 / self.context_size as u64
    }
}

/// Configuration for the read-side lookup service
#[derive(Debug, Clone)]
pub struct LookupConfig {
    /// Directory holding one subdirectory per dictionary
    pub result_dir: PathBuf,
    /// Maximum number of result sets kept in memory
    pub cache_capacity: usize,
    /// Seed for random feature selection
    pub seed: u64,
}

impl Default for LookupConfig {
    fn default() -> Self {
        let result_dir = std::env::var("RESULT_DIR").unwrap_or_else(|_| "results".to_string());
        Self {
            result_dir: PathBuf::from(result_dir),
            cache_capacity: 4,
            seed: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults_validate() {
        let config = AnalysisConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.histogram_interval, 10);
        assert!(config.histogram_capacity.is_none());
        assert!(config.enable_sampling);
    }

    #[test]
    fn test_total_steps() {
        let config = AnalysisConfig {
            total_analyzing_tokens: 1000,
            store_batch_size: 4,
            context_size: 10,
            ..Default::default()
        };
        assert_eq!(config.tokens_per_batch(), 40);
        assert_eq!(config.total_analyzing_steps(), 25);
    }

    #[test]
    fn test_validate_rejects_bad_exponent() {
        let config = AnalysisConfig {
            sample_weight_exponent: f32::NAN,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AnalysisConfig {
            sample_weight_exponent: 0.0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let config = AnalysisConfig {
            n_samples: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AnalysisConfig {
            histogram_capacity: Some(0),
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = AnalysisConfig {
            hook_point: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_partial_json() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, r#"{{"n_samples": 16, "enable_sampling": false}}"#).unwrap();

        let config = AnalysisConfig::load(file.path()).unwrap();
        assert_eq!(config.n_samples, 16);
        assert!(!config.enable_sampling);
        assert_eq!(config.context_size, 128);
    }
}
