//! # Roadmatch
//!
//! Map matching with a linear-chain CRF whose transitions are learned from
//! road embeddings and restricted to the road graph.
//!
//! - [`roadmatch_core`]: the CRF (scoring, sampled normalizer, Viterbi decoding) and accuracy metrics
//! - [`roadmatch_trainer`]: data loading, the training loop and checkpoints

pub use roadmatch_core;
pub use roadmatch_trainer;

pub use roadmatch_core::{
    AccuracyReport, Adjacency, CrfConfig, DecodeStrategy, Result, RoadCrf, RoadMatchError,
    PAD_TAG,
};
pub use roadmatch_trainer::{TrainConfig, Trainer};
