//! Tensor handles and memory spaces
//!
//! A [`KvTensor`] is a numr [`Tensor`] plus the two facts a cache slot needs on
//! top of it: a [`TensorId`] that every clone of the handle shares, and the
//! [`MemorySpace`] its bytes live in. The cache slot that created a tensor owns
//! it; everything else (the execution request in particular) holds a clone.

pub mod allocator;
pub mod runtime;

pub use allocator::{AllocatorStats, HostAllocator, RuntimeAllocator, StaticBacking, TensorAllocator};
#[cfg(feature = "cuda")]
pub use allocator::CudaAllocator;
#[cfg(feature = "wgpu")]
pub use allocator::WgpuAllocator;
pub use runtime::KvRuntime;

use crate::error::{Error, Result};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::tensor::{Storage, Tensor};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Where a tensor's bytes physically live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemorySpace {
    /// Ordinary host memory
    Host,
    /// Device-resident memory in a separate address space
    Device,
    /// Device-resident memory carved out of a preallocated static backing
    DeviceStatic,
}

impl MemorySpace {
    /// Whether the host CPU can address the bytes directly.
    pub fn is_host_addressable(self) -> bool {
        matches!(self, MemorySpace::Host)
    }
}

/// Stable identity of a cache tensor, shared by all clones of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TensorId(u64);

impl TensorId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        TensorId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

/// Cache-owned handle over a numr tensor
pub struct KvTensor<R: Runtime> {
    id: TensorId,
    space: MemorySpace,
    tensor: Tensor<R>,
    /// Owning storage behind a non-owning static-backing view
    backing: Option<Storage<R>>,
}

impl<R: Runtime> KvTensor<R> {
    pub fn new(tensor: Tensor<R>, space: MemorySpace) -> Self {
        Self {
            id: TensorId::next(),
            space,
            tensor,
            backing: None,
        }
    }

    pub(crate) fn on_backing(tensor: Tensor<R>, space: MemorySpace, backing: Storage<R>) -> Self {
        Self {
            backing: Some(backing),
            ..Self::new(tensor, space)
        }
    }

    pub fn id(&self) -> TensorId {
        self.id
    }

    /// The numr tensor behind this handle.
    pub fn tensor(&self) -> &Tensor<R> {
        &self.tensor
    }

    pub fn shape(&self) -> &[usize] {
        self.tensor.shape()
    }

    pub fn dtype(&self) -> DType {
        self.tensor.dtype()
    }

    pub fn memory_space(&self) -> MemorySpace {
        self.space
    }

    pub fn is_static_backed(&self) -> bool {
        self.backing.is_some()
    }

    pub fn numel(&self) -> usize {
        self.tensor.numel()
    }

    pub fn size_in_bytes(&self) -> usize {
        self.numel() * self.dtype().size_in_bytes()
    }

    /// Whether two handles address the same device memory.
    pub fn shares_storage_with(&self, other: &KvTensor<R>) -> bool {
        let (a, b) = (self.tensor.storage().ptr(), other.tensor.storage().ptr());
        self.id == other.id || (a != 0 && a == b)
    }

    /// Copy the contents into a typed host vector.
    pub fn to_vec<T: bytemuck::Pod>(&self) -> Result<Vec<T>> {
        if std::mem::size_of::<T>() != self.dtype().size_in_bytes() {
            return Err(Error::InvalidArgument {
                arg: "T",
                reason: format!(
                    "{} read out of a tensor of {:?}",
                    std::any::type_name::<T>(),
                    self.dtype()
                ),
            });
        }
        Ok(self.tensor.contiguous().to_vec::<T>())
    }

    /// Overwrite every byte of the tensor from host memory.
    pub fn write_bytes(&self, bytes: &[u8]) -> Result<()> {
        if bytes.len() != self.size_in_bytes() {
            return Err(Error::InvalidArgument {
                arg: "bytes",
                reason: format!(
                    "{} bytes written into tensor {:?} of {} bytes",
                    bytes.len(),
                    self.shape(),
                    self.size_in_bytes()
                ),
            });
        }
        if bytes.is_empty() {
            return Ok(());
        }
        self.check_dense("write_bytes")?;
        R::copy_to_device(bytes, self.tensor.storage().ptr(), self.tensor.device())?;
        Ok(())
    }

    /// Replace the contents in place with those of `src`, keeping this
    /// handle's storage and identity.
    pub(crate) fn assign(&self, src: &Tensor<R>) -> Result<()> {
        if src.shape() != self.shape() || src.dtype() != self.dtype() {
            return Err(Error::InvalidArgument {
                arg: "src",
                reason: format!(
                    "{:?} of {:?} assigned to {:?} of {:?}",
                    src.shape(),
                    src.dtype(),
                    self.shape(),
                    self.dtype()
                ),
            });
        }
        let bytes = self.size_in_bytes();
        if bytes == 0 {
            return Ok(());
        }
        self.check_dense("assign")?;
        if !src.is_contiguous() || src.layout().offset() != 0 {
            return Err(Error::InvalidArgument {
                arg: "src",
                reason: "assignment source must be a dense tensor".into(),
            });
        }
        R::copy_within_device(
            src.storage().ptr(),
            self.tensor.storage().ptr(),
            bytes,
            self.tensor.device(),
        )?;
        Ok(())
    }

    fn check_dense(&self, op: &str) -> Result<()> {
        if !self.tensor.is_contiguous() || self.tensor.layout().offset() != 0 {
            return Err(Error::Backend {
                reason: format!("{op} on tensor {:?} that is not a dense view", self.id),
            });
        }
        Ok(())
    }
}

impl<R: Runtime> Clone for KvTensor<R> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            space: self.space,
            tensor: self.tensor.clone(),
            backing: self.backing.clone(),
        }
    }
}

impl<R: Runtime> fmt::Debug for KvTensor<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KvTensor")
            .field("id", &self.id)
            .field("shape", &self.shape())
            .field("dtype", &self.dtype())
            .field("space", &self.space)
            .finish()
    }
}

/// Bytes needed for `shape` elements of `dtype`, with overflow checking.
pub fn size_in_bytes(shape: &[usize], dtype: DType) -> Result<usize> {
    shape
        .iter()
        .try_fold(dtype.size_in_bytes(), |acc, &d| acc.checked_mul(d))
        .ok_or_else(|| Error::Allocation {
            bytes: usize::MAX,
            reason: format!("size overflow for shape {:?} of {:?}", shape, dtype),
        })
}
