//! # Road CRF Model
//!
//! Configuration and the combined CRF: training through the sampled
//! log-likelihood, inference through Viterbi decoding.

use candle_core::Tensor;
use candle_nn::VarBuilder;
use oorandom::Rand32;
use serde::{Deserialize, Serialize};

use crate::crf::batch::CrfBatch;
use crate::crf::normalizer::SampledNormalizer;
use crate::crf::score::SequenceScorer;
use crate::crf::transition::{TransitionModel, Transitions};
use crate::crf::viterbi::{DecodeStrategy, ViterbiDecoder};
use crate::error::{Result, RoadMatchError};
use crate::graph::Adjacency;

/// Default number of negative tags drawn per normalizer call.
pub const DEFAULT_NEG_NUMS: usize = 500;

/// Configuration for [`RoadCrf`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CrfConfig {
    /// Number of road-segment tags.
    pub num_tags: usize,
    /// Dimension of the road embeddings.
    pub emb_dim: usize,
    /// Negative tags sampled by the normalizer.
    #[serde(default = "default_neg_nums")]
    pub neg_nums: usize,
    /// Whether inputs are `[batch, seq_len, ...]` rather than `[seq_len, batch, ...]`.
    #[serde(default = "default_batch_first")]
    pub batch_first: bool,
    /// Search used by [`RoadCrf::decode`].
    #[serde(default)]
    pub decode: DecodeStrategy,
}

fn default_neg_nums() -> usize {
    DEFAULT_NEG_NUMS
}

fn default_batch_first() -> bool {
    true
}

impl CrfConfig {
    /// Create a configuration with default sampling, batch-first layout and
    /// exhaustive decoding.
    pub fn new(num_tags: usize, emb_dim: usize) -> Self {
        Self {
            num_tags,
            emb_dim,
            neg_nums: DEFAULT_NEG_NUMS,
            batch_first: true,
            decode: DecodeStrategy::Exhaustive,
        }
    }

    /// Set the number of sampled negative tags.
    pub fn with_neg_nums(mut self, neg_nums: usize) -> Self {
        self.neg_nums = neg_nums;
        self
    }

    pub fn with_batch_first(mut self, batch_first: bool) -> Self {
        self.batch_first = batch_first;
        self
    }

    /// Restrict decoding to a beam of `width` tags.
    pub fn with_beam(mut self, width: usize) -> Self {
        self.decode = DecodeStrategy::Beam { width };
        self
    }

    pub fn with_decode_strategy(mut self, strategy: DecodeStrategy) -> Self {
        self.decode = strategy;
        self
    }

    /// Check that the configuration can build a model.
    pub fn validate(&self) -> Result<()> {
        if self.num_tags == 0 {
            return Err(RoadMatchError::InvalidConfig("num_tags must be positive".into()));
        }
        if self.emb_dim == 0 {
            return Err(RoadMatchError::InvalidConfig("emb_dim must be positive".into()));
        }
        if let DecodeStrategy::Beam { width: 0 } = self.decode {
            return Err(RoadMatchError::InvalidConfig(
                "beam width must be at least 1".into(),
            ));
        }
        SampledNormalizer::new(self.num_tags, self.neg_nums).map(|_| ())
    }
}

/// Graph-gated linear-chain CRF over road segments.
///
/// Training goes through [`RoadCrf::log_likelihood`], inference through
/// [`RoadCrf::decode`]. The only learned parameters are the transition
/// projection, stored under the `W` prefix of the var builder.
#[derive(Debug, Clone)]
pub struct RoadCrf {
    config: CrfConfig,
    transition: TransitionModel,
    scorer: SequenceScorer,
    normalizer: SampledNormalizer,
    decoder: ViterbiDecoder,
}

impl RoadCrf {
    pub fn new(config: CrfConfig, vb: VarBuilder) -> Result<Self> {
        config.validate()?;
        let transition = TransitionModel::new(config.emb_dim, vb.pp("W"))?;
        let normalizer = SampledNormalizer::new(config.num_tags, config.neg_nums)?;
        let decoder = ViterbiDecoder::new(config.num_tags).with_strategy(config.decode);

        Ok(Self {
            config,
            transition,
            scorer: SequenceScorer::new(),
            normalizer,
            decoder,
        })
    }

    pub fn config(&self) -> &CrfConfig {
        &self.config
    }

    pub fn transition(&self) -> &TransitionModel {
        &self.transition
    }

    pub fn normalizer(&self) -> &SampledNormalizer {
        &self.normalizer
    }

    /// Approximate log-likelihood of the gold tags, averaged over valid positions.
    ///
    /// # Arguments
    /// * `emissions` - `[batch, seq_len, num_tags]` (or time-major when not `batch_first`)
    /// * `tags` - gold tags, `[batch, seq_len]`
    /// * `embeddings` - `[num_tags, emb_dim]` road embedding table
    /// * `mask` - `[batch, seq_len]`, ones followed by padding zeros
    /// * `rng` - source of the negative tag sample
    ///
    /// # Returns
    /// A scalar `sum(score(gold) - log Z) / sum(mask)`. Negate it for a loss.
    pub fn log_likelihood(
        &self,
        emissions: &Tensor,
        tags: &Tensor,
        embeddings: &Tensor,
        adjacency: &Adjacency,
        mask: &Tensor,
        rng: &mut Rand32,
    ) -> Result<Tensor> {
        let sample = self.normalizer.sample_tags(rng);
        self.log_likelihood_with(emissions, tags, embeddings, adjacency, mask, &sample)
    }

    /// Same as [`Self::log_likelihood`] with a caller-provided negative sample.
    pub fn log_likelihood_with(
        &self,
        emissions: &Tensor,
        tags: &Tensor,
        embeddings: &Tensor,
        adjacency: &Adjacency,
        mask: &Tensor,
        sample: &[u32],
    ) -> Result<Tensor> {
        self.check_adjacency(adjacency)?;
        let batch = CrfBatch::prepare(
            emissions,
            Some(tags),
            mask,
            self.config.num_tags,
            self.config.batch_first,
        )?;
        let gold_tags = batch.tags.as_ref().ok_or_else(|| {
            RoadMatchError::InvalidConfig("gold tags missing after validation".into())
        })?;
        let transitions = Transitions::new(&self.transition, embeddings, adjacency);

        let numerator = self
            .scorer
            .score(&batch.emissions, gold_tags, &batch.mask, &transitions)?;
        let denominator = self.normalizer.log_partition_with(
            &batch.emissions,
            &batch.mask,
            &numerator,
            &transitions,
            sample,
        )?;

        let llh = numerator.sub(&denominator)?;
        let valid = batch.valid_positions() as f64;
        Ok(llh.sum_all()?.affine(1.0 / valid, 0.0)?)
    }

    /// Most likely road-segment path for every trajectory.
    ///
    /// # Returns
    /// One `seq_len`-long path per batch element, padded with
    /// [`crate::crf::PAD_TAG`] past its valid length.
    pub fn decode(
        &self,
        emissions: &Tensor,
        embeddings: &Tensor,
        adjacency: &Adjacency,
        mask: &Tensor,
    ) -> Result<Vec<Vec<i64>>> {
        self.check_adjacency(adjacency)?;
        let batch = CrfBatch::prepare(
            emissions,
            None,
            mask,
            self.config.num_tags,
            self.config.batch_first,
        )?;
        let transitions = Transitions::new(&self.transition, embeddings, adjacency);
        self.decoder
            .decode(&batch.emissions, &batch.mask, &transitions)
    }

    fn check_adjacency(&self, adjacency: &Adjacency) -> Result<()> {
        if adjacency.num_tags() != self.config.num_tags {
            return Err(RoadMatchError::shape(
                "adjacency",
                (self.config.num_tags, self.config.num_tags),
                (adjacency.num_tags(), adjacency.num_tags()),
            ));
        }
        Ok(())
    }
}
