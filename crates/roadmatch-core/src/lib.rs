//! # Roadmatch Core
//!
//! Structured-prediction core of a neural map-matching model. Trajectory
//! observations are labelled with road-segment ids by a linear-chain CRF whose
//! transition energies are learned from road embeddings and gated by the road
//! graph.
//!
//! ## Quick Start
//!
//! ```rust
//! use candle_core::{DType, Device, Tensor};
//! use candle_nn::{VarBuilder, VarMap};
//! use roadmatch_core::{Adjacency, CrfConfig, RoadCrf};
//!
//! let dev = Device::Cpu;
//! let varmap = VarMap::new();
//! let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
//! let crf = RoadCrf::new(CrfConfig::new(4, 8).with_neg_nums(2), vb).unwrap();
//!
//! let adjacency = Adjacency::from_edges(4, &[(0, 1), (1, 2), (2, 3)], &dev).unwrap();
//! let embeddings = Tensor::randn(0f32, 1.0, (4, 8), &dev).unwrap();
//! // [batch = 1, seq_len = 3, num_tags = 4]
//! let emissions = Tensor::randn(0f32, 1.0, (1, 3, 4), &dev).unwrap();
//! let mask = Tensor::ones((1, 3), DType::U8, &dev).unwrap();
//!
//! let paths = crf.decode(&emissions, &embeddings, &adjacency, &mask).unwrap();
//! assert_eq!(paths[0].len(), 3);
//! ```
pub mod crf;
pub mod error;
pub mod graph;
pub mod metrics;

// Re-export primary API
pub use crf::{
    CrfConfig, DecodeStrategy, RoadCrf, SampledNormalizer, SequenceScorer, TransitionModel,
    Transitions, ViterbiDecoder, PAD_TAG,
};
pub use error::{Result, RoadMatchError};
pub use graph::Adjacency;
pub use metrics::{AccuracyReport, AccuracyTracker, SequenceAccuracy};
