//! # Roadmatch Trainer
//!
//! Offline training and evaluation of the road-matching CRF: loads
//! trajectories, road embeddings and the road graph from disk, fits the
//! transition projection with AdamW and reports matching accuracy.

pub mod config;
pub mod data;
pub mod trainer;

pub use config::TrainConfig;
pub use data::{collate, load_road_embeddings, load_trajectories, Batch, RoadGraph, Trajectory};
pub use trainer::{load_crf_config, TrainSummary, Trainer};
