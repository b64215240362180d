//! # Matching Accuracy
//!
//! Compares decoded road-segment paths with ground truth:
//!
//! - `acc(T)`: mean over trajectories of the fraction of positions matched
//! - `acc(G)`: matched positions over all positions in the dataset
//! - `acc(LCS)`: mean over trajectories of the longest common subsequence
//!   between prediction and truth, relative to the true length

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::crf::PAD_TAG;
use crate::error::{Result, RoadMatchError};

/// Accuracy of a single decoded trajectory.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SequenceAccuracy {
    pub matched: usize,
    pub length: usize,
    pub lcs: usize,
}

impl SequenceAccuracy {
    /// Compare the first `length` positions of `predicted` and `target`.
    pub fn compute(predicted: &[i64], target: &[u32], length: usize) -> Result<Self> {
        if predicted.len() < length || target.len() < length {
            return Err(RoadMatchError::shape(
                "decoded path",
                length,
                predicted.len().min(target.len()),
            ));
        }
        let predicted = &predicted[..length];
        let target = &target[..length];

        let matched = predicted
            .iter()
            .zip(target)
            .filter(|&(&p, &t)| p == i64::from(t))
            .count();

        let decoded: Vec<i64> = predicted.iter().copied().filter(|&p| p != PAD_TAG).collect();
        let truth: Vec<i64> = target.iter().map(|&t| i64::from(t)).collect();

        Ok(Self {
            matched,
            length,
            lcs: lcs_len(&decoded, &truth),
        })
    }

    pub fn accuracy(&self) -> f64 {
        ratio(self.matched, self.length)
    }

    pub fn lcs_accuracy(&self) -> f64 {
        ratio(self.lcs, self.length)
    }
}

/// Running accuracy over many batches.
#[derive(Debug, Clone, Default)]
pub struct AccuracyTracker {
    trajectories: usize,
    positions: usize,
    matched: usize,
    accuracy_sum: f64,
    lcs_sum: f64,
}

impl AccuracyTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one batch of decoded paths.
    ///
    /// # Arguments
    /// * `predicted` - padded decoder output
    /// * `targets` - gold tags, padded arbitrarily past `lengths`
    /// * `lengths` - true length of every trajectory
    pub fn update(
        &mut self,
        predicted: &[Vec<i64>],
        targets: &[Vec<u32>],
        lengths: &[usize],
    ) -> Result<()> {
        if predicted.len() != targets.len() || predicted.len() != lengths.len() {
            return Err(RoadMatchError::shape(
                "accuracy batch",
                (predicted.len(), predicted.len()),
                (targets.len(), lengths.len()),
            ));
        }

        for ((pred, target), &length) in predicted.iter().zip(targets).zip(lengths) {
            let seq = SequenceAccuracy::compute(pred, target, length)?;
            self.trajectories += 1;
            self.positions += seq.length;
            self.matched += seq.matched;
            self.accuracy_sum += seq.accuracy();
            self.lcs_sum += seq.lcs_accuracy();
        }
        Ok(())
    }

    pub fn report(&self) -> AccuracyReport {
        let trajectories = self.trajectories as f64;
        let mean = |sum: f64| if self.trajectories == 0 { 0.0 } else { sum / trajectories };
        AccuracyReport {
            acc_t: mean(self.accuracy_sum),
            acc_g: ratio(self.matched, self.positions),
            acc_lcs: mean(self.lcs_sum),
            trajectories: self.trajectories,
            positions: self.positions,
        }
    }
}

/// Aggregated accuracy figures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AccuracyReport {
    pub acc_t: f64,
    pub acc_g: f64,
    pub acc_lcs: f64,
    pub trajectories: usize,
    pub positions: usize,
}

impl fmt::Display for AccuracyReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "acc(T)({:.4}) acc(G)({:.4}) acc(LCS)({:.4})",
            self.acc_t, self.acc_g, self.acc_lcs
        )
    }
}

fn ratio(num: usize, den: usize) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

fn lcs_len(a: &[i64], b: &[i64]) -> usize {
    let mut prev = vec![0usize; b.len() + 1];
    let mut curr = vec![0usize; b.len() + 1];
    for x in a {
        for (j, y) in b.iter().enumerate() {
            curr[j + 1] = if x == y {
                prev[j] + 1
            } else {
                curr[j].max(prev[j + 1])
            };
        }
        std::mem::swap(&mut prev, &mut curr);
    }
    prev[b.len()]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lcs_len() {
        assert_eq!(lcs_len(&[1, 2, 3, 4], &[1, 3, 4]), 3);
        assert_eq!(lcs_len(&[], &[1, 2]), 0);
        assert_eq!(lcs_len(&[5, 6], &[6, 5]), 1);
    }

    #[test]
    fn test_sequence_accuracy() {
        let seq = SequenceAccuracy::compute(&[1, 2, 9, 3, PAD_TAG], &[1, 2, 3, 4, 0], 4).unwrap();
        assert_eq!(seq.matched, 2);
        assert_eq!(seq.lcs, 3);
        assert!((seq.accuracy() - 0.5).abs() < 1e-12);
        assert!((seq.lcs_accuracy() - 0.75).abs() < 1e-12);
    }

    #[test]
    fn test_sequence_accuracy_rejects_short_path() {
        assert!(SequenceAccuracy::compute(&[1], &[1, 2], 2).is_err());
    }

    #[test]
    fn test_tracker_report() {
        let mut tracker = AccuracyTracker::new();
        tracker
            .update(
                &[vec![0, 1, 2, 3], vec![7, PAD_TAG, PAD_TAG, PAD_TAG]],
                &[vec![0, 1, 2, 3], vec![6, 0, 0, 0]],
                &[4, 1],
            )
            .unwrap();
        tracker
            .update(&[vec![4, 4]], &[vec![4, 5]], &[2])
            .unwrap();

        let report = tracker.report();
        assert_eq!(report.trajectories, 3);
        assert_eq!(report.positions, 7);
        // per-trajectory: 1.0, 0.0, 0.5
        assert!((report.acc_t - 0.5).abs() < 1e-12);
        // globally 5 of 7 positions
        assert!((report.acc_g - 5.0 / 7.0).abs() < 1e-12);
        assert!((report.acc_lcs - 0.5).abs() < 1e-12);
        assert!(report.to_string().starts_with("acc(T)(0.5000)"));
    }

    #[test]
    fn test_empty_tracker() {
        let report = AccuracyTracker::new().report();
        assert_eq!(report.acc_t, 0.0);
        assert_eq!(report.acc_g, 0.0);
        assert!(AccuracyTracker::new().update(&[vec![0]], &[], &[1]).is_err());
    }
}
