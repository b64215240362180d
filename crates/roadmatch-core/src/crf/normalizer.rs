//! # Sampled Normalizer
//!
//! Approximates the CRF log-partition `log Σ_y exp S(y)` over a road vocabulary
//! too large for the exact forward algorithm. A random subset of tags is drawn
//! once per call; the forward recursion runs over that subset only, the gold
//! path score is appended to the final scores, and the result is rescaled by
//! `ln(num_tags / (sample_size + 1))`.
//!
//! The estimate is biased. It is a training surrogate and is not meant to
//! match the exact partition function.

use std::collections::HashSet;

use candle_core::{IndexOp, Tensor};
use oorandom::Rand32;
use tracing::debug;

use crate::crf::batch::binary_mask;
use crate::crf::transition::Transitions;
use crate::error::{Result, RoadMatchError};

/// Negative-sampling approximation of the log-partition function.
#[derive(Debug, Clone)]
pub struct SampledNormalizer {
    num_tags: usize,
    sample_size: usize,
}

impl SampledNormalizer {
    /// Create a normalizer drawing `sample_size` negatives out of `num_tags`.
    ///
    /// Fails with [`RoadMatchError::SampleSizeTooLarge`] when the sample cannot
    /// be drawn without replacement.
    pub fn new(num_tags: usize, sample_size: usize) -> Result<Self> {
        if sample_size >= num_tags {
            return Err(RoadMatchError::SampleSizeTooLarge {
                sample_size,
                num_tags,
            });
        }
        if sample_size == 0 {
            return Err(RoadMatchError::InvalidConfig(
                "sample size must be at least 1".into(),
            ));
        }
        if u32::try_from(num_tags).is_err() {
            return Err(RoadMatchError::InvalidConfig(format!(
                "{num_tags} tags do not fit in u32 tag ids"
            )));
        }
        Ok(Self {
            num_tags,
            sample_size,
        })
    }

    pub fn num_tags(&self) -> usize {
        self.num_tags
    }

    pub fn sample_size(&self) -> usize {
        self.sample_size
    }

    /// Additive correction `ln(num_tags / (sample_size + 1))`; the `+ 1`
    /// accounts for the appended gold term.
    pub fn correction(&self) -> f64 {
        (self.num_tags as f64 / (self.sample_size + 1) as f64).ln()
    }

    /// Draw `sample_size` distinct tags uniformly at random (Floyd's algorithm).
    pub fn sample_tags(&self, rng: &mut Rand32) -> Vec<u32> {
        let n = self.num_tags as u32;
        let k = self.sample_size as u32;

        let mut chosen = HashSet::with_capacity(self.sample_size);
        let mut sample = Vec::with_capacity(self.sample_size);
        for j in (n - k)..n {
            let candidate = rng.rand_range(0..j + 1);
            let pick = if chosen.insert(candidate) {
                candidate
            } else {
                chosen.insert(j);
                j
            };
            sample.push(pick);
        }
        sample
    }

    /// Approximate log-partition for each sequence of the batch.
    ///
    /// # Arguments
    /// * `emissions` - time-major `[seq_len, batch, num_tags]`
    /// * `mask` - validity mask of shape `[seq_len, batch]`
    /// * `gold_score` - `[batch]` score of the gold path
    /// * `rng` - source of the negative sample, shared by the whole batch
    pub fn log_partition(
        &self,
        emissions: &Tensor,
        mask: &Tensor,
        gold_score: &Tensor,
        transitions: &Transitions<'_>,
        rng: &mut Rand32,
    ) -> Result<Tensor> {
        let sample = self.sample_tags(rng);
        debug!(
            sample_size = self.sample_size,
            num_tags = self.num_tags,
            "drew negative tag sample"
        );
        self.log_partition_with(emissions, mask, gold_score, transitions, &sample)
    }

    /// Same as [`Self::log_partition`] with a caller-provided tag sample.
    pub fn log_partition_with(
        &self,
        emissions: &Tensor,
        mask: &Tensor,
        gold_score: &Tensor,
        transitions: &Transitions<'_>,
        sample: &[u32],
    ) -> Result<Tensor> {
        let (seq_len, batch_size, num_tags) = emissions.dims3()?;
        if num_tags != self.num_tags {
            return Err(RoadMatchError::shape(
                "emissions",
                (seq_len, batch_size, self.num_tags),
                (seq_len, batch_size, num_tags),
            ));
        }
        if sample.len() != self.sample_size {
            return Err(RoadMatchError::shape(
                "tag sample",
                self.sample_size,
                sample.len(),
            ));
        }
        let mask_dims = mask.dims2()?;
        if mask_dims != (seq_len, batch_size) {
            return Err(RoadMatchError::shape("mask", (seq_len, batch_size), mask_dims));
        }
        let gold_dims = gold_score.dims1()?;
        if gold_dims != batch_size {
            return Err(RoadMatchError::shape("gold score", batch_size, gold_dims));
        }

        let ids = Tensor::from_slice(sample, sample.len(), emissions.device())?;
        // [k, k]
        let trans = transitions.submatrix(&ids)?.to_dtype(emissions.dtype())?;
        let mask = binary_mask(mask)?;

        // [batch, k]: for each sequence, column j scores paths ending in sample[j]
        let mut score = emissions.i(0)?.index_select(&ids, 1)?;

        for i in 1..seq_len {
            // [batch, k, 1]
            let broadcast_score = score.unsqueeze(2)?;
            // [batch, 1, k]
            let broadcast_emissions = emissions.i(i)?.index_select(&ids, 1)?.unsqueeze(1)?;

            // [batch, k, k] -> log-sum-exp over the previous tag -> [batch, k]
            let next_score = broadcast_score
                .broadcast_add(&trans)?
                .broadcast_add(&broadcast_emissions)?
                .log_sum_exp(1)?;

            let valid = mask.i(i)?.unsqueeze(1)?.broadcast_as(next_score.shape())?;
            score = valid.where_cond(&next_score, &score)?;
        }

        let gold = gold_score
            .to_dtype(score.dtype())?
            .reshape((batch_size, 1))?;
        let score = Tensor::cat(&[&score, &gold], 1)?;

        Ok(score.log_sum_exp(1)?.affine(1.0, self.correction())?)
    }
}
