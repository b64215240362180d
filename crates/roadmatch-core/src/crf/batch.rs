//! Input validation and layout normalisation for CRF calls.
//!
//! Everything downstream works on time-major tensors: emissions
//! `[seq_len, batch, num_tags]`, tags and mask `[seq_len, batch]`.

use candle_core::{DType, Tensor};

use crate::error::{Result, RoadMatchError};

/// A validated, time-major batch.
#[derive(Debug, Clone)]
pub(crate) struct CrfBatch {
    pub emissions: Tensor,
    pub tags: Option<Tensor>,
    /// Canonical `u8` mask holding only zeros and ones.
    pub mask: Tensor,
    pub lengths: Vec<usize>,
}

impl CrfBatch {
    pub fn prepare(
        emissions: &Tensor,
        tags: Option<&Tensor>,
        mask: &Tensor,
        num_tags: usize,
        batch_first: bool,
    ) -> Result<Self> {
        let layout = |seq_len: usize, batch: usize| {
            if batch_first {
                (batch, seq_len)
            } else {
                (seq_len, batch)
            }
        };

        let (emissions, tags, mask) = if batch_first {
            (
                emissions.transpose(0, 1)?,
                tags.map(|t| t.t()).transpose()?,
                mask.t()?,
            )
        } else {
            (emissions.clone(), tags.cloned(), mask.clone())
        };

        let (seq_len, batch_size, last) = emissions.dims3()?;
        if last != num_tags {
            let (a, b) = layout(seq_len, batch_size);
            return Err(RoadMatchError::shape(
                "emissions",
                (a, b, num_tags),
                (a, b, last),
            ));
        }
        if seq_len == 0 || batch_size == 0 {
            return Err(RoadMatchError::shape(
                "emissions",
                "non-empty batch and sequence",
                emissions.dims(),
            ));
        }

        let mask_dims = mask.dims2()?;
        if mask_dims != (seq_len, batch_size) {
            let (a, b) = mask_dims;
            return Err(RoadMatchError::shape(
                "mask",
                layout(seq_len, batch_size),
                layout(a, b),
            ));
        }
        let lengths = sequence_lengths(&mask)?;
        let mut canonical = vec![0u8; seq_len * batch_size];
        for (b, &len) in lengths.iter().enumerate() {
            for t in 0..len {
                canonical[t * batch_size + b] = 1;
            }
        }
        let mask = Tensor::from_vec(canonical, (seq_len, batch_size), emissions.device())?;

        let tags = match tags {
            Some(tags) => {
                let dims = tags.dims2()?;
                if dims != (seq_len, batch_size) {
                    let (a, b) = dims;
                    return Err(RoadMatchError::shape(
                        "tags",
                        layout(seq_len, batch_size),
                        layout(a, b),
                    ));
                }
                check_tags(&tags, num_tags)?;
                Some(tags.to_dtype(DType::U32)?.contiguous()?)
            }
            None => None,
        };

        Ok(Self {
            emissions: emissions.contiguous()?,
            tags,
            mask,
            lengths,
        })
    }

    /// Number of non-padding positions across the batch.
    pub fn valid_positions(&self) -> usize {
        self.lengths.iter().sum()
    }
}

/// Fail with [`RoadMatchError::InvalidTagIndex`] unless every entry of `tags`
/// lies in `[0, num_tags)`.
pub(crate) fn check_tags(tags: &Tensor, num_tags: usize) -> Result<()> {
    let ids = tags.to_dtype(DType::I64)?.flatten_all()?.to_vec1::<i64>()?;
    match ids.into_iter().find(|&t| t < 0 || t as usize >= num_tags) {
        Some(index) => Err(RoadMatchError::InvalidTagIndex { index, num_tags }),
        None => Ok(()),
    }
}

/// `{0, 1}` copy of `mask`: any non-zero value counts as a valid step.
pub(crate) fn binary_mask(mask: &Tensor) -> Result<Tensor> {
    Ok(mask.ne(0f64)?)
}

/// True length of every sequence in a time-major `[seq_len, batch]` mask.
///
/// Fails unless each column is a (non-empty) run of valid steps followed only
/// by padding.
pub fn sequence_lengths(mask: &Tensor) -> Result<Vec<usize>> {
    let (seq_len, batch_size) = mask.dims2()?;
    let rows = binary_mask(mask)?.to_vec2::<u8>()?;

    let mut lengths = Vec::with_capacity(batch_size);
    for b in 0..batch_size {
        let len = (0..seq_len).take_while(|&t| rows[t][b] != 0).count();
        if len == 0 {
            return Err(RoadMatchError::InvalidMask(format!(
                "first timestep of sequence {b} must be valid"
            )));
        }
        if let Some(t) = (len..seq_len).find(|&t| rows[t][b] != 0) {
            return Err(RoadMatchError::InvalidMask(format!(
                "sequence {b} has a valid step at {t} after padding at {len}"
            )));
        }
        lengths.push(len);
    }

    Ok(lengths)
}
