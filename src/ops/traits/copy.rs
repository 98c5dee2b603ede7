//! Backend copy strategy
//!
//! The caches gather rows of a tensor into a fresh tensor and fill buffers
//! with a byte pattern. Where the bytes live decides how: host work finishes
//! before the call returns, device work is queued on the runtime client.

use crate::error::{Error, Result};
use crate::tensor::{KvRuntime, KvTensor};
use numr::ops::IndexingOps;
use numr::runtime::{Runtime, RuntimeClient};
use numr::tensor::Tensor;

/// Copy capability for one numr runtime
pub trait CopyOps<R: Runtime>: Send + Sync {
    /// Short backend name, used in log events.
    fn name(&self) -> &'static str;

    /// Whether issued work may still be in flight when a call returns.
    fn is_async(&self) -> bool;

    /// Build a tensor whose row `j` along `dim` is row `indices[j]` of `src`.
    fn gather_rows(&self, src: &Tensor<R>, dim: usize, indices: &[i32]) -> Result<Tensor<R>>;

    /// Set every byte of `tensor` to `value`.
    fn fill(&self, tensor: &KvTensor<R>, value: u8) -> Result<()>;

    /// Block until every previously issued operation has landed.
    fn synchronize(&self) -> Result<()>;
}

/// `index_select` of `indices` along `dim`, with the index list uploaded as
/// an I32 tensor on `client`'s device.
pub(crate) fn index_select_rows<R: KvRuntime>(
    client: &R::Client,
    src: &Tensor<R>,
    dim: usize,
    indices: &[i32],
) -> Result<Tensor<R>> {
    let rows = src.shape().get(dim).copied().ok_or_else(|| Error::InvalidArgument {
        arg: "dim",
        reason: format!("no axis {} in shape {:?}", dim, src.shape()),
    })?;
    if let Some((position, &index)) = indices
        .iter()
        .enumerate()
        .find(|(_, i)| **i < 0 || **i as usize >= rows)
    {
        return Err(Error::BeamIndex {
            position,
            index,
            rows,
        });
    }
    let index = Tensor::<R>::try_from_slice(indices, &[indices.len()], client.device())?;
    Ok(client.index_select(src, dim, &index)?)
}

/// Overwrite `tensor` with `value` through a host upload.
pub(crate) fn fill_bytes<R: Runtime>(tensor: &KvTensor<R>, value: u8) -> Result<()> {
    tensor.write_bytes(&vec![value; tensor.size_in_bytes()])
}
