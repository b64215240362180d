//! # Transition Energy
//!
//! Learned pairwise compatibility between road segments. The energy of moving
//! from segment `a` to segment `b` is `relu(W·e_a · e_b)`, gated to zero when
//! the two segments are not adjacent in the road graph.

use candle_core::{DType, Module, Tensor};
use candle_nn::{Linear, VarBuilder};

use crate::error::{Result, RoadMatchError};
use crate::graph::Adjacency;

/// Graph-gated bilinear transition model.
#[derive(Debug, Clone)]
pub struct TransitionModel {
    proj: Linear,
    emb_dim: usize,
}

impl TransitionModel {
    /// Create the projection (`emb_dim -> emb_dim`, with bias) from `vb`.
    pub fn new(emb_dim: usize, vb: VarBuilder) -> Result<Self> {
        let proj = candle_nn::linear(emb_dim, emb_dim, vb)?;
        Ok(Self { proj, emb_dim })
    }

    /// Wrap an existing projection.
    pub fn from_linear(proj: Linear) -> Result<Self> {
        let (out_dim, in_dim) = proj.weight().dims2()?;
        if out_dim != in_dim {
            return Err(RoadMatchError::shape(
                "transition projection",
                (in_dim, in_dim),
                (out_dim, in_dim),
            ));
        }
        Ok(Self {
            proj,
            emb_dim: in_dim,
        })
    }

    pub fn emb_dim(&self) -> usize {
        self.emb_dim
    }

    /// Energy for each `(from[k], to[k])` pair.
    ///
    /// # Arguments
    /// * `from`, `to` - `u32` tag tensors of shape `[batch]`
    /// * `embeddings` - road embedding table of shape `[num_tags, emb_dim]`
    ///
    /// # Returns
    /// A `[batch]` tensor of non-negative energies.
    pub fn transition_pair(
        &self,
        from: &Tensor,
        to: &Tensor,
        embeddings: &Tensor,
        adjacency: &Adjacency,
    ) -> Result<Tensor> {
        self.check_embeddings(embeddings, adjacency)?;
        let from_ids = from.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        let to_ids = to.to_dtype(DType::U32)?.to_vec1::<u32>()?;
        // also validates the indices before they reach index_select
        let gate = adjacency.gate(&from_ids, &to_ids)?;

        let projected = self.proj.forward(&embeddings.index_select(from, 0)?)?;
        let target = embeddings.index_select(to, 0)?;
        let energy = projected.mul(&target)?.sum(1)?.relu()?;

        Ok(energy.mul(&gate.to_dtype(energy.dtype())?)?)
    }

    /// Full `[num_tags, num_tags]` energy matrix `relu(W(E) · Eᵀ) ⊙ A`.
    pub fn transition_matrix(&self, embeddings: &Tensor, adjacency: &Adjacency) -> Result<Tensor> {
        self.check_embeddings(embeddings, adjacency)?;
        let attention = self.proj.forward(embeddings)?.matmul(&embeddings.t()?)?;
        let gate = adjacency.dense().to_dtype(attention.dtype())?;
        Ok(attention.relu()?.mul(&gate)?)
    }

    /// Projected embedding table `W(E)`, shape `[num_tags, emb_dim]`.
    ///
    /// Row `a` dotted with `embeddings[b]` is the pre-activation energy of
    /// `a -> b`, so single entries can be evaluated without the full matrix.
    pub fn project(&self, embeddings: &Tensor, adjacency: &Adjacency) -> Result<Tensor> {
        self.check_embeddings(embeddings, adjacency)?;
        Ok(self.proj.forward(embeddings)?)
    }

    /// Energy matrix over the tag subset `tags`, shape `[k, k]`.
    ///
    /// Computed directly on the restricted embedding table; entry `(p, q)`
    /// equals `transition_matrix[tags[p], tags[q]]`.
    pub fn transition_submatrix(
        &self,
        embeddings: &Tensor,
        adjacency: &Adjacency,
        tags: &Tensor,
    ) -> Result<Tensor> {
        self.check_embeddings(embeddings, adjacency)?;
        for tag in tags.to_dtype(DType::U32)?.to_vec1::<u32>()? {
            adjacency.check_tag(tag)?;
        }
        let sub = embeddings.index_select(tags, 0)?;
        let attention = self.proj.forward(&sub)?.matmul(&sub.t()?)?;
        let gate = adjacency.restrict(tags)?.to_dtype(attention.dtype())?;
        Ok(attention.relu()?.mul(&gate)?)
    }

    fn check_embeddings(&self, embeddings: &Tensor, adjacency: &Adjacency) -> Result<()> {
        let dims = embeddings.dims2()?;
        let expected = (adjacency.num_tags(), self.emb_dim);
        if dims != expected {
            return Err(RoadMatchError::shape("road embeddings", expected, dims));
        }
        Ok(())
    }
}

/// A transition model bound to the embedding table and adjacency of one pass.
#[derive(Debug, Clone, Copy)]
pub struct Transitions<'a> {
    pub model: &'a TransitionModel,
    pub embeddings: &'a Tensor,
    pub adjacency: &'a Adjacency,
}

impl<'a> Transitions<'a> {
    pub fn new(model: &'a TransitionModel, embeddings: &'a Tensor, adjacency: &'a Adjacency) -> Self {
        Self {
            model,
            embeddings,
            adjacency,
        }
    }

    pub fn num_tags(&self) -> usize {
        self.adjacency.num_tags()
    }

    pub fn pair(&self, from: &Tensor, to: &Tensor) -> Result<Tensor> {
        self.model
            .transition_pair(from, to, self.embeddings, self.adjacency)
    }

    pub fn matrix(&self) -> Result<Tensor> {
        self.model.transition_matrix(self.embeddings, self.adjacency)
    }

    pub fn projected(&self) -> Result<Tensor> {
        self.model.project(self.embeddings, self.adjacency)
    }

    pub fn submatrix(&self, tags: &Tensor) -> Result<Tensor> {
        self.model
            .transition_submatrix(self.embeddings, self.adjacency, tags)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use candle_core::Device;

    /// Identity projection without bias: energies reduce to `relu(e_a · e_b)`.
    pub(crate) fn identity_model(emb_dim: usize) -> TransitionModel {
        let mut values = vec![0.0f32; emb_dim * emb_dim];
        for i in 0..emb_dim {
            values[i * emb_dim + i] = 1.0;
        }
        let w = Tensor::from_vec(values, (emb_dim, emb_dim), &Device::Cpu).unwrap();
        TransitionModel::from_linear(Linear::new(w, None)).unwrap()
    }

    /// Projection with a fixed weight so that energies are easy to compute by hand.
    fn model(weight: &[[f32; 2]; 2], bias: [f32; 2]) -> TransitionModel {
        let dev = Device::Cpu;
        let w = Tensor::new(weight, &dev).unwrap();
        let b = Tensor::new(&bias, &dev).unwrap();
        TransitionModel::from_linear(Linear::new(w, Some(b))).unwrap()
    }

    fn embeddings() -> Tensor {
        Tensor::new(
            &[[1.0f32, 0.0], [0.0, 1.0], [1.0, 1.0], [-1.0, 0.5]],
            &Device::Cpu,
        )
        .unwrap()
    }

    fn tags(ids: &[u32]) -> Tensor {
        Tensor::new(ids, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_pair_matches_hand_computation() {
        // W = identity, no bias: energy is relu(e_a · e_b)
        let m = model(&[[1.0, 0.0], [0.0, 1.0]], [0.0, 0.0]);
        let adj = Adjacency::from_edges(4, &[(0, 2), (1, 2), (0, 3)], &Device::Cpu).unwrap();

        let energy = m
            .transition_pair(&tags(&[0, 2, 0, 0]), &tags(&[2, 2, 3, 1]), &embeddings(), &adj)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        // 0->2: 1, 2->2: 2, 0->3: relu(-1) = 0, 0->1: not adjacent
        assert_eq!(energy, vec![1.0, 2.0, 0.0, 0.0]);
    }

    #[test]
    fn test_pair_agrees_with_matrix() {
        let m = model(&[[0.5, -0.2], [0.3, 1.1]], [0.1, -0.4]);
        let adj = Adjacency::from_edges(4, &[(0, 1), (1, 2), (2, 3)], &Device::Cpu).unwrap();
        let emb = embeddings();

        let matrix = m.transition_matrix(&emb, &adj).unwrap().to_vec2::<f32>().unwrap();

        let mut from = Vec::new();
        let mut to = Vec::new();
        for a in 0..4u32 {
            for b in 0..4u32 {
                from.push(a);
                to.push(b);
            }
        }
        let pairs = m
            .transition_pair(&tags(&from), &tags(&to), &emb, &adj)
            .unwrap()
            .to_vec1::<f32>()
            .unwrap();

        for (k, (&a, &b)) in from.iter().zip(&to).enumerate() {
            let expected = matrix[a as usize][b as usize];
            assert!(
                (pairs[k] - expected).abs() < 1e-6,
                "pair ({a}, {b}): {} vs {}",
                pairs[k],
                expected
            );
        }
    }

    #[test]
    fn test_energy_non_negative_and_gated() {
        let m = model(&[[-2.0, 0.7], [0.4, -1.3]], [0.2, 0.2]);
        let adj = Adjacency::from_edges(4, &[(0, 1), (2, 3)], &Device::Cpu).unwrap();

        let matrix = m
            .transition_matrix(&embeddings(), &adj)
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        for a in 0..4u32 {
            for b in 0..4u32 {
                let e = matrix[a as usize][b as usize];
                assert!(e >= 0.0);
                if !adj.is_adjacent(a, b) {
                    assert_eq!(e, 0.0);
                }
            }
        }
    }

    #[test]
    fn test_submatrix_equals_sliced_matrix() {
        let m = model(&[[0.9, 0.1], [-0.3, 0.8]], [0.05, 0.0]);
        let adj = Adjacency::from_edges(4, &[(0, 1), (1, 3), (2, 3)], &Device::Cpu).unwrap();
        let emb = embeddings();
        let subset = [3u32, 1, 2];

        let full = m.transition_matrix(&emb, &adj).unwrap().to_vec2::<f32>().unwrap();
        let sub = m
            .transition_submatrix(&emb, &adj, &tags(&subset))
            .unwrap()
            .to_vec2::<f32>()
            .unwrap();

        for (p, &a) in subset.iter().enumerate() {
            for (q, &b) in subset.iter().enumerate() {
                assert!((sub[p][q] - full[a as usize][b as usize]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_rejects_bad_inputs() {
        let m = model(&[[1.0, 0.0], [0.0, 1.0]], [0.0, 0.0]);
        let adj = Adjacency::from_edges(4, &[], &Device::Cpu).unwrap();

        let err = m
            .transition_pair(&tags(&[0]), &tags(&[9]), &embeddings(), &adj)
            .unwrap_err();
        assert!(matches!(err, RoadMatchError::InvalidTagIndex { index: 9, .. }));

        let small = Adjacency::from_edges(3, &[], &Device::Cpu).unwrap();
        let err = m.transition_matrix(&embeddings(), &small).unwrap_err();
        assert!(matches!(err, RoadMatchError::ShapeMismatch { .. }));
    }
}
