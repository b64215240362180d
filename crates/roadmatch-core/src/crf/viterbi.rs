//! # Viterbi Decoding for the Road CRF
//!
//! Finds the highest-scoring road-segment sequence for every trajectory of a
//! batch, given emission scores and the graph-gated transition matrix.
//!
//! Batch elements are independent and decoded in parallel. Each one runs only
//! up to its own valid length, which is equivalent to carrying the score
//! forward through masked steps. Results are padded with [`PAD_TAG`] to the
//! shared maximum length.
//!
//! Ties are broken towards the lowest tag index, both for backpointers and for
//! the best final tag.

use std::cmp::Ordering;

use candle_core::{DType, Tensor};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::crf::batch::sequence_lengths;
use crate::crf::transition::Transitions;
use crate::error::{Result, RoadMatchError};
use crate::graph::Adjacency;

/// Sentinel used to pad decoded paths past their valid length.
pub const PAD_TAG: i64 = -1;

/// How many predecessor tags the search keeps alive between steps.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecodeStrategy {
    /// Every tag is a candidate at every step.
    #[default]
    Exhaustive,
    /// Only the `width` best tags survive each step; the next step considers
    /// their road-graph neighbours.
    Beam { width: usize },
}

/// Viterbi decoder over road-segment tags.
#[derive(Debug, Clone)]
pub struct ViterbiDecoder {
    num_tags: usize,
    strategy: DecodeStrategy,
}

impl ViterbiDecoder {
    /// Create an exhaustive decoder.
    ///
    /// # Arguments
    /// * `num_tags` - Number of road-segment tags
    pub fn new(num_tags: usize) -> Self {
        Self {
            num_tags,
            strategy: DecodeStrategy::Exhaustive,
        }
    }

    pub fn with_strategy(mut self, strategy: DecodeStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn strategy(&self) -> DecodeStrategy {
        self.strategy
    }

    /// Decode a time-major batch.
    ///
    /// # Arguments
    /// * `emissions` - `[seq_len, batch, num_tags]` emission scores
    /// * `mask` - `[seq_len, batch]` validity mask, a prefix of ones per column
    ///
    /// # Returns
    /// One path per batch element, `seq_len` long, padded with [`PAD_TAG`].
    pub fn decode(
        &self,
        emissions: &Tensor,
        mask: &Tensor,
        transitions: &Transitions<'_>,
    ) -> Result<Vec<Vec<i64>>> {
        if let DecodeStrategy::Beam { width: 0 } = self.strategy {
            return Err(RoadMatchError::InvalidConfig(
                "beam width must be at least 1".into(),
            ));
        }

        let (seq_len, batch_size, num_tags) = emissions.dims3()?;
        if num_tags != self.num_tags || transitions.num_tags() != self.num_tags {
            return Err(RoadMatchError::shape(
                "emissions",
                (seq_len, batch_size, self.num_tags),
                (seq_len, batch_size, num_tags),
            ));
        }
        let mask_dims = mask.dims2()?;
        if mask_dims != (seq_len, batch_size) {
            return Err(RoadMatchError::shape("mask", (seq_len, batch_size), mask_dims));
        }
        let lengths = sequence_lengths(mask)?;

        let emissions = emissions.to_dtype(DType::F32)?.to_vec3::<f32>()?;

        debug!(
            batch_size,
            seq_len,
            num_tags,
            strategy = ?self.strategy,
            "viterbi decode"
        );

        let paths = match self.strategy {
            DecodeStrategy::Exhaustive => {
                let trans: Vec<f32> = transitions
                    .matrix()?
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1()?;
                decode_each(&emissions, &lengths, seq_len, |steps| {
                    viterbi_exhaustive(steps, &trans, num_tags)
                })
            }
            // energies for (beam tag, neighbour) pairs only
            DecodeStrategy::Beam { width } => {
                let energy = FactoredEnergy::new(transitions)?;
                let adjacency = transitions.adjacency;
                decode_each(&emissions, &lengths, seq_len, |steps| {
                    viterbi_beam(steps, &energy, num_tags, width, adjacency)
                })
            }
        };

        Ok(paths)
    }

    /// Decode a single unpadded sequence exhaustively.
    ///
    /// # Arguments
    /// * `emission_scores` - `seq_len` rows of `num_tags` scores
    /// * `transition_matrix` - `num_tags` rows of `num_tags` energies, `[from][to]`
    pub fn decode_sequence(
        &self,
        emission_scores: &[Vec<f32>],
        transition_matrix: &[Vec<f32>],
    ) -> Result<Vec<u32>> {
        if emission_scores.is_empty() {
            return Ok(Vec::new());
        }
        if let Some(row) = emission_scores.iter().find(|r| r.len() != self.num_tags) {
            return Err(RoadMatchError::shape(
                "emission row",
                self.num_tags,
                row.len(),
            ));
        }
        if transition_matrix.len() != self.num_tags
            || transition_matrix.iter().any(|r| r.len() != self.num_tags)
        {
            return Err(RoadMatchError::shape(
                "transition matrix",
                (self.num_tags, self.num_tags),
                (
                    transition_matrix.len(),
                    transition_matrix.first().map_or(0, Vec::len),
                ),
            ));
        }

        let trans: Vec<f32> = transition_matrix.iter().flatten().copied().collect();
        let steps: Vec<&[f32]> = emission_scores.iter().map(Vec::as_slice).collect();
        Ok(viterbi_exhaustive(&steps, &trans, self.num_tags))
    }
}

/// Run `decode_one` over every batch element in parallel and pad the results.
fn decode_each<F>(
    emissions: &[Vec<Vec<f32>>],
    lengths: &[usize],
    seq_len: usize,
    decode_one: F,
) -> Vec<Vec<i64>>
where
    F: Fn(&[&[f32]]) -> Vec<u32> + Sync,
{
    (0..lengths.len())
        .into_par_iter()
        .map(|b| {
            let steps: Vec<&[f32]> = emissions[..lengths[b]]
                .iter()
                .map(|step| step[b].as_slice())
                .collect();
            pad_path(&decode_one(&steps), seq_len)
        })
        .collect()
}

/// Host copy of `W(E)` and `E`, evaluating single transition energies on demand.
///
/// Only meaningful for adjacent pairs; the graph gate is not applied.
struct FactoredEnergy {
    projected: Vec<f32>,
    targets: Vec<f32>,
    emb_dim: usize,
}

impl FactoredEnergy {
    fn new(transitions: &Transitions<'_>) -> Result<Self> {
        let projected = transitions.projected()?.to_dtype(DType::F32)?;
        let (_, emb_dim) = projected.dims2()?;
        Ok(Self {
            projected: projected.flatten_all()?.to_vec1()?,
            targets: transitions
                .embeddings
                .to_dtype(DType::F32)?
                .flatten_all()?
                .to_vec1()?,
            emb_dim,
        })
    }

    fn energy(&self, from: u32, to: u32) -> f32 {
        let d = self.emb_dim;
        let (from, to) = (from as usize, to as usize);
        let a = &self.projected[from * d..(from + 1) * d];
        let b = &self.targets[to * d..(to + 1) * d];
        a.iter().zip(b).map(|(x, y)| x * y).sum::<f32>().max(0.0)
    }
}

fn viterbi_exhaustive(steps: &[&[f32]], trans: &[f32], num_tags: usize) -> Vec<u32> {
    let mut score = steps[0].to_vec();
    let mut next = vec![f32::NEG_INFINITY; num_tags];
    let mut history: Vec<Vec<u32>> = Vec::with_capacity(steps.len() - 1);

    for emission in &steps[1..] {
        let mut backptr = vec![0u32; num_tags];
        next.fill(f32::NEG_INFINITY);

        // Scanning predecessors in increasing order with a strict `>` keeps the
        // lowest index on ties.
        for (prev, &prev_score) in score.iter().enumerate() {
            let row = &trans[prev * num_tags..(prev + 1) * num_tags];
            for (curr, &energy) in row.iter().enumerate() {
                let candidate = prev_score + energy;
                if candidate > next[curr] {
                    next[curr] = candidate;
                    backptr[curr] = prev as u32;
                }
            }
        }
        for (curr, e) in emission.iter().enumerate() {
            next[curr] += e;
        }

        std::mem::swap(&mut score, &mut next);
        history.push(backptr);
    }

    backtrack(&score, &history)
}

fn viterbi_beam(
    steps: &[&[f32]],
    energy: &FactoredEnergy,
    num_tags: usize,
    width: usize,
    adjacency: &Adjacency,
) -> Vec<u32> {
    let mut score = steps[0].to_vec();
    let mut history: Vec<Vec<u32>> = Vec::with_capacity(steps.len() - 1);

    for emission in &steps[1..] {
        let beam = top_tags(&score, width);
        let mut next = vec![f32::NEG_INFINITY; num_tags];
        let mut backptr = vec![0u32; num_tags];

        for &prev in &beam {
            let prev_score = score[prev as usize];
            for &curr in adjacency.neighbors(prev) {
                let candidate = prev_score + energy.energy(prev, curr);
                if candidate > next[curr as usize] {
                    next[curr as usize] = candidate;
                    backptr[curr as usize] = prev;
                }
            }
        }
        for (curr, e) in emission.iter().enumerate() {
            if next[curr].is_finite() {
                next[curr] += e;
            }
        }

        score = next;
        history.push(backptr);
    }

    backtrack(&score, &history)
}

/// The `width` best finite-scoring tags, returned in increasing index order.
fn top_tags(score: &[f32], width: usize) -> Vec<u32> {
    let by_rank = |a: &u32, b: &u32| {
        score[*b as usize]
            .total_cmp(&score[*a as usize])
            .then(a.cmp(b))
    };

    let mut tags: Vec<u32> = (0..score.len() as u32)
        .filter(|&t| score[t as usize].is_finite())
        .collect();
    if tags.len() > width {
        tags.select_nth_unstable_by(width - 1, by_rank);
        tags.truncate(width);
    }
    tags.sort_unstable();
    tags
}

/// Index of the first maximum.
fn best_tag(score: &[f32]) -> u32 {
    let mut best = 0usize;
    for (tag, value) in score.iter().enumerate() {
        if value.partial_cmp(&score[best]) == Some(Ordering::Greater) {
            best = tag;
        }
    }
    best as u32
}

fn backtrack(score: &[f32], history: &[Vec<u32>]) -> Vec<u32> {
    let mut tag = best_tag(score);
    let mut path = Vec::with_capacity(history.len() + 1);
    path.push(tag);

    for backptr in history.iter().rev() {
        tag = backptr[tag as usize];
        path.push(tag);
    }

    path.reverse();
    path
}

fn pad_path(path: &[u32], seq_len: usize) -> Vec<i64> {
    let mut padded: Vec<i64> = path.iter().map(|&t| i64::from(t)).collect();
    padded.resize(seq_len, PAD_TAG);
    padded
}
