//! # Road CRF
//!
//! Linear-chain CRF whose transition energies come from road embeddings gated
//! by road-graph adjacency. Training uses a negative-sampling approximation of
//! the partition function; inference uses Viterbi decoding.

mod batch;
pub mod model;
pub mod normalizer;
pub mod score;
pub mod transition;
pub mod viterbi;

pub use batch::sequence_lengths;
pub use model::{CrfConfig, RoadCrf, DEFAULT_NEG_NUMS};
pub use normalizer::SampledNormalizer;
pub use score::SequenceScorer;
pub use transition::{TransitionModel, Transitions};
pub use viterbi::{DecodeStrategy, ViterbiDecoder, PAD_TAG};
