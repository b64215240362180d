//! Path score `S(y | x)` of a tag sequence.

use candle_core::{IndexOp, Tensor};

use crate::crf::batch::{binary_mask, check_tags};
use crate::crf::transition::Transitions;
use crate::error::{Result, RoadMatchError};

/// Sums emissions and graph-gated transition energies along a tag path.
#[derive(Debug, Clone, Copy, Default)]
pub struct SequenceScorer;

impl SequenceScorer {
    pub fn new() -> Self {
        Self
    }

    /// Score each sequence of the batch.
    ///
    /// # Arguments
    /// * `emissions` - time-major `[seq_len, batch, num_tags]`
    /// * `tags` - `u32` tags of shape `[seq_len, batch]`
    /// * `mask` - validity mask of shape `[seq_len, batch]`
    ///
    /// # Returns
    /// A `[batch]` tensor. The first step always counts; later steps
    /// contribute only where the mask is set.
    pub fn score(
        &self,
        emissions: &Tensor,
        tags: &Tensor,
        mask: &Tensor,
        transitions: &Transitions<'_>,
    ) -> Result<Tensor> {
        let (seq_len, batch_size, num_tags) = emissions.dims3()?;
        let dims = tags.dims2()?;
        if dims != (seq_len, batch_size) {
            return Err(RoadMatchError::shape("tags", (seq_len, batch_size), dims));
        }
        let mask_dims = mask.dims2()?;
        if mask_dims != (seq_len, batch_size) {
            return Err(RoadMatchError::shape("mask", (seq_len, batch_size), mask_dims));
        }
        check_tags(tags, num_tags)?;

        let mask = binary_mask(mask)?.to_dtype(emissions.dtype())?;
        let mut score = gather_tags(&emissions.i(0)?, &tags.i(0)?)?;

        for i in 1..seq_len {
            let step_mask = mask.i(i)?;

            let energy = transitions
                .pair(&tags.i(i - 1)?, &tags.i(i)?)?
                .to_dtype(score.dtype())?;
            score = score.add(&energy.mul(&step_mask)?)?;

            let emitted = gather_tags(&emissions.i(i)?, &tags.i(i)?)?;
            score = score.add(&emitted.mul(&step_mask)?)?;
        }

        Ok(score)
    }
}

/// `src[b, tags[b]]` for a `[batch, num_tags]` source.
fn gather_tags(src: &Tensor, tags: &Tensor) -> Result<Tensor> {
    let index = tags.unsqueeze(1)?.contiguous()?;
    Ok(src.contiguous()?.gather(&index, 1)?.squeeze(1)?)
}
