//! # Road-Graph Adjacency
//!
//! Symmetric road-segment adjacency used to gate transition energies. Two
//! segments are adjacent when they share a node in the road graph; every
//! segment is adjacent to itself.

use std::collections::BTreeSet;

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, RoadMatchError};

/// Immutable adjacency relation over road-segment tags.
///
/// Keeps both a dense `(num_tags, num_tags)` indicator for batched tensor
/// maths and sorted neighbour lists for sparse lookups.
#[derive(Debug, Clone)]
pub struct Adjacency {
    neighbors: Vec<Vec<u32>>,
    dense: Tensor,
}

impl Adjacency {
    /// Build the relation from an undirected edge list.
    ///
    /// Each edge is inserted in both directions and the diagonal is always set.
    pub fn from_edges(num_tags: usize, edges: &[(u32, u32)], device: &Device) -> Result<Self> {
        if num_tags == 0 {
            return Err(RoadMatchError::InvalidConfig(
                "adjacency needs at least one tag".into(),
            ));
        }

        let mut sets: Vec<BTreeSet<u32>> = (0..num_tags as u32)
            .map(|tag| BTreeSet::from([tag]))
            .collect();

        for &(a, b) in edges {
            for tag in [a, b] {
                if tag as usize >= num_tags {
                    return Err(RoadMatchError::InvalidTagIndex {
                        index: i64::from(tag),
                        num_tags,
                    });
                }
            }
            sets[a as usize].insert(b);
            sets[b as usize].insert(a);
        }

        Self::from_sets(sets, device)
    }

    /// Build the relation from a square `{0, 1}` indicator tensor.
    ///
    /// Any non-zero entry counts as adjacent. The result is symmetrised and the
    /// diagonal set.
    pub fn from_dense(indicator: &Tensor) -> Result<Self> {
        let (rows, cols) = indicator.dims2()?;
        if rows != cols {
            return Err(RoadMatchError::shape(
                "adjacency",
                (rows, rows),
                (rows, cols),
            ));
        }
        if rows == 0 {
            return Err(RoadMatchError::InvalidConfig(
                "adjacency needs at least one tag".into(),
            ));
        }

        let values = indicator.to_dtype(DType::F32)?.to_vec2::<f32>()?;
        let mut sets: Vec<BTreeSet<u32>> = (0..rows as u32)
            .map(|tag| BTreeSet::from([tag]))
            .collect();
        for (i, row) in values.iter().enumerate() {
            for (j, &v) in row.iter().enumerate() {
                if v != 0.0 {
                    sets[i].insert(j as u32);
                    sets[j].insert(i as u32);
                }
            }
        }

        Self::from_sets(sets, indicator.device())
    }

    fn from_sets(sets: Vec<BTreeSet<u32>>, device: &Device) -> Result<Self> {
        let n = sets.len();
        let mut flat = vec![0.0f32; n * n];
        for (i, set) in sets.iter().enumerate() {
            for &j in set {
                flat[i * n + j as usize] = 1.0;
            }
        }
        let dense = Tensor::from_vec(flat, (n, n), device)?;
        let neighbors = sets
            .into_iter()
            .map(|set| set.into_iter().collect())
            .collect();

        Ok(Self { neighbors, dense })
    }

    /// Number of road-segment tags.
    pub fn num_tags(&self) -> usize {
        self.neighbors.len()
    }

    /// Dense `f32` indicator of shape `(num_tags, num_tags)`.
    pub fn dense(&self) -> &Tensor {
        &self.dense
    }

    pub fn device(&self) -> &Device {
        self.dense.device()
    }

    /// Sorted neighbours of `tag`, including `tag` itself.
    ///
    /// Out-of-range tags have no neighbours.
    pub fn neighbors(&self, tag: u32) -> &[u32] {
        self.neighbors
            .get(tag as usize)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_adjacent(&self, a: u32, b: u32) -> bool {
        self.neighbors(a).binary_search(&b).is_ok()
    }

    /// Fail with [`RoadMatchError::InvalidTagIndex`] unless `tag` is in range.
    pub fn check_tag(&self, tag: u32) -> Result<()> {
        if (tag as usize) < self.num_tags() {
            Ok(())
        } else {
            Err(RoadMatchError::InvalidTagIndex {
                index: i64::from(tag),
                num_tags: self.num_tags(),
            })
        }
    }

    /// Per-pair `{0, 1}` gate for `(from[k], to[k])`, as an `f32` tensor.
    pub fn gate(&self, from: &[u32], to: &[u32]) -> Result<Tensor> {
        if from.len() != to.len() {
            return Err(RoadMatchError::shape("tag pairs", from.len(), to.len()));
        }
        let mut values = Vec::with_capacity(from.len());
        for (&a, &b) in from.iter().zip(to) {
            self.check_tag(a)?;
            self.check_tag(b)?;
            values.push(if self.is_adjacent(a, b) { 1.0f32 } else { 0.0 });
        }
        Ok(Tensor::from_vec(values, from.len(), self.device())?)
    }

    /// Indicator restricted to `tags` on both axes, shape `(k, k)`.
    pub fn restrict(&self, tags: &Tensor) -> Result<Tensor> {
        Ok(self
            .dense
            .index_select(tags, 0)?
            .index_select(tags, 1)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_edges_is_symmetric_with_self_loops() {
        let adj = Adjacency::from_edges(4, &[(0, 1), (2, 1)], &Device::Cpu).unwrap();

        assert_eq!(adj.num_tags(), 4);
        assert_eq!(adj.neighbors(1), &[0, 1, 2]);
        assert_eq!(adj.neighbors(3), &[3]);
        assert!(adj.is_adjacent(1, 0));
        assert!(adj.is_adjacent(0, 1));
        assert!(!adj.is_adjacent(0, 2));

        let dense = adj.dense().to_vec2::<f32>().unwrap();
        for i in 0..4 {
            assert_eq!(dense[i][i], 1.0);
            for j in 0..4 {
                assert_eq!(dense[i][j], dense[j][i]);
            }
        }
        assert_eq!(dense[2][1], 1.0);
        assert_eq!(dense[3][0], 0.0);
    }

    #[test]
    fn test_from_edges_rejects_out_of_range() {
        let err = Adjacency::from_edges(3, &[(0, 3)], &Device::Cpu).unwrap_err();
        assert!(matches!(
            err,
            RoadMatchError::InvalidTagIndex {
                index: 3,
                num_tags: 3
            }
        ));
    }

    #[test]
    fn test_from_dense_symmetrises() {
        let indicator = Tensor::new(&[[0u8, 1, 0], [0, 0, 0], [0, 0, 0]], &Device::Cpu).unwrap();
        let adj = Adjacency::from_dense(&indicator).unwrap();

        assert!(adj.is_adjacent(1, 0));
        assert!(adj.is_adjacent(2, 2));
        assert!(!adj.is_adjacent(2, 0));
    }

    #[test]
    fn test_from_dense_rejects_non_square() {
        let indicator = Tensor::zeros((2, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            Adjacency::from_dense(&indicator),
            Err(RoadMatchError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_gate_and_restrict() {
        let adj = Adjacency::from_edges(4, &[(0, 1), (2, 3)], &Device::Cpu).unwrap();

        let gate = adj.gate(&[0, 0, 2], &[1, 2, 2]).unwrap();
        assert_eq!(gate.to_vec1::<f32>().unwrap(), vec![1.0, 0.0, 1.0]);
        assert!(adj.gate(&[0], &[4]).is_err());

        let tags = Tensor::new(&[3u32, 2, 0], &Device::Cpu).unwrap();
        let sub = adj.restrict(&tags).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(
            sub,
            vec![
                vec![1.0, 1.0, 0.0],
                vec![1.0, 1.0, 0.0],
                vec![0.0, 0.0, 1.0],
            ]
        );
    }

    #[test]
    fn test_out_of_range_neighbors_are_empty() {
        let adj = Adjacency::from_edges(2, &[], &Device::Cpu).unwrap();
        assert!(adj.neighbors(5).is_empty());
        assert!(adj.check_tag(2).is_err());
        assert!(adj.check_tag(1).is_ok());
    }
}
