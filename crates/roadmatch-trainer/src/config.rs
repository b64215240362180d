//! Training configuration.

use std::path::Path;

use anyhow::Context;
use roadmatch_core::{CrfConfig, DecodeStrategy};
use serde::{Deserialize, Serialize};

/// Hyper-parameters of a training run.
///
/// Every field has a default, so a JSON file only needs the values it changes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub eval_batch_size: usize,
    pub epochs: usize,
    pub lr: f64,
    pub weight_decay: f64,
    /// Negative tags sampled per normalizer call.
    pub neg_nums: usize,
    /// Decode with a beam of this width; exhaustive when unset.
    pub beam_size: Option<usize>,
    pub seed: u64,
    /// Log the running loss every this many steps.
    pub log_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            eval_batch_size: 256,
            epochs: 30,
            lr: 0.001,
            weight_decay: 0.0,
            neg_nums: 500,
            beam_size: None,
            seed: 0,
            log_every: 100,
        }
    }
}

impl TrainConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load a configuration from a JSON file.
    pub fn from_json_file<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_epochs(mut self, epochs: usize) -> Self {
        self.epochs = epochs;
        self
    }

    pub fn with_lr(mut self, lr: f64) -> Self {
        self.lr = lr;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f64) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn with_neg_nums(mut self, neg_nums: usize) -> Self {
        self.neg_nums = neg_nums;
        self
    }

    pub fn with_beam_size(mut self, beam_size: Option<usize>) -> Self {
        self.beam_size = beam_size;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// CRF configuration for a road network of `num_tags` segments.
    pub fn crf_config(&self, num_tags: usize, emb_dim: usize) -> CrfConfig {
        let decode = match self.beam_size {
            Some(width) => DecodeStrategy::Beam { width },
            None => DecodeStrategy::Exhaustive,
        };
        CrfConfig::new(num_tags, emb_dim)
            .with_neg_nums(self.neg_nums)
            .with_decode_strategy(decode)
    }
}
