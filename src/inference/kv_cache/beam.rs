//! Beam reordering
//!
//! After a beam-search step the surviving beams may descend from any earlier
//! beam, so the next past is gathered row by row out of the present. A row is
//! one beam's `[heads, sequence, head_size]` block; the gather is a single
//! `index_select` along the row axis.

use crate::error::{Error, Result};
use crate::ops::traits::CopyOps;
use crate::tensor::{KvRuntime, KvTensor};

/// Geometry of a gather
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BeamLayout {
    /// Axis holding batch × beam rows
    pub row_axis: usize,
    pub rows: usize,
}

impl BeamLayout {
    /// Layout of a combined `[2, rows, heads, seq, head_size]` tensor.
    ///
    /// Gathering along axis 1 reorders the key and value halves with the
    /// same indices.
    pub fn combined(shape: &[usize]) -> Result<Self> {
        match shape {
            &[2, rows, _, _, _] => Ok(Self { row_axis: 1, rows }),
            _ => Err(Error::InvalidArgument {
                arg: "shape",
                reason: format!("expected [2, rows, heads, seq, head_size], got {:?}", shape),
            }),
        }
    }

    /// Layout of a split `[rows, heads, seq, head_size]` tensor.
    pub fn split(shape: &[usize]) -> Result<Self> {
        match shape {
            &[rows, _, _, _] => Ok(Self { row_axis: 0, rows }),
            _ => Err(Error::InvalidArgument {
                arg: "shape",
                reason: format!("expected [rows, heads, seq, head_size], got {:?}", shape),
            }),
        }
    }
}

/// Check that `indices` maps each of `rows` new rows onto an old row.
pub fn validate_beam_indices(indices: &[i32], rows: usize) -> Result<()> {
    if indices.len() != rows {
        return Err(Error::InvalidArgument {
            arg: "beam_indices",
            reason: format!("{} beam indices for {} rows", indices.len(), rows),
        });
    }
    for (position, &index) in indices.iter().enumerate() {
        if index < 0 || index as usize >= rows {
            return Err(Error::BeamIndex {
                position,
                index,
                rows,
            });
        }
    }
    Ok(())
}

/// Build a fresh tensor whose row `j` is row `indices[j]` of `src`.
pub fn gather_beams<R: KvRuntime>(
    copy: &dyn CopyOps<R>,
    src: &KvTensor<R>,
    indices: &[i32],
    layout: BeamLayout,
) -> Result<KvTensor<R>> {
    validate_beam_indices(indices, layout.rows)?;
    if src.shape().get(layout.row_axis) != Some(&layout.rows) {
        return Err(Error::InvalidArgument {
            arg: "src",
            reason: format!("shape {:?} for beam layout {:?}", src.shape(), layout),
        });
    }
    let out = copy.gather_rows(src.tensor(), layout.row_axis, indices)?;
    Ok(KvTensor::new(out, R::MEMORY_SPACE))
}
