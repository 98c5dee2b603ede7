//! Tensor allocator adapter
//!
//! Caches never allocate memory themselves; they ask a [`TensorAllocator`] for
//! ready-to-use tensors on the allocator's numr device. The allocator also
//! hands out the copy strategy of its runtime (see
//! [`crate::ops::select_copy_ops`]).

use super::{KvRuntime, KvTensor, MemorySpace};
use crate::error::{Error, Result};
use crate::ops::traits::CopyOps;
use numr::dtype::{DType, Element};
use numr::runtime::Runtime;
use numr::runtime::cpu::{CpuDevice, CpuRuntime};
use numr::tensor::{Layout, Storage, Tensor};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Preallocated storage that tensors can be placed on without reallocating.
///
/// Used for shared past/present buffers whose addresses must stay fixed for
/// the whole generation (e.g. when the decoder graph was captured).
pub struct StaticBacking<R: Runtime> {
    storage: Storage<R>,
}

impl<R: Runtime> StaticBacking<R> {
    pub fn new(storage: Storage<R>) -> Self {
        Self { storage }
    }

    pub fn capacity(&self) -> usize {
        self.storage.size_in_bytes()
    }

    pub fn storage(&self) -> &Storage<R> {
        &self.storage
    }
}

impl<R: Runtime> Clone for StaticBacking<R> {
    fn clone(&self) -> Self {
        Self {
            storage: self.storage.clone(),
        }
    }
}

/// Produces owned tensors on one numr device
pub trait TensorAllocator<R: KvRuntime>: Send + Sync {
    /// Memory space every tensor from this allocator lives in.
    fn memory_space(&self) -> MemorySpace {
        R::MEMORY_SPACE
    }

    fn device(&self) -> &R::Device;

    fn client(&self) -> &R::Client;

    /// Allocate a zeroed tensor.
    fn create_tensor(&self, shape: &[usize], dtype: DType) -> Result<KvTensor<R>>;

    /// Reserve `bytes` of zeroed storage for later static placement.
    fn allocate_static_backing(&self, bytes: usize) -> Result<StaticBacking<R>>;

    /// Place a tensor at the front of a static backing. No memory is allocated.
    fn create_tensor_on_static_backing(
        &self,
        shape: &[usize],
        dtype: DType,
        backing: &StaticBacking<R>,
    ) -> Result<KvTensor<R>> {
        let needed = super::size_in_bytes(shape, dtype)?;
        if needed > backing.capacity() {
            return Err(Error::Allocation {
                bytes: needed,
                reason: format!(
                    "static backing holds {} bytes, tensor {:?} needs {}",
                    backing.capacity(),
                    shape,
                    needed
                ),
            });
        }
        let numel = shape.iter().product();
        // SAFETY: the view covers `needed <= capacity` bytes from the start of
        // the backing, and the returned handle keeps the backing storage alive
        // for as long as the view exists.
        let view = unsafe {
            Storage::<R>::from_ptr(backing.storage().ptr(), numel, dtype, self.device())
        };
        let space = match self.memory_space() {
            MemorySpace::Host => MemorySpace::Host,
            MemorySpace::Device | MemorySpace::DeviceStatic => MemorySpace::DeviceStatic,
        };
        Ok(KvTensor::on_backing(
            Tensor::from_parts(view, Layout::contiguous(shape)),
            space,
            backing.storage().clone(),
        ))
    }

    /// Copy strategy for this allocator's tensors.
    fn copy_ops(&self) -> Arc<dyn CopyOps<R>> {
        R::copy_ops(self.client())
    }
}

/// Allocation counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AllocatorStats {
    pub tensors_created: usize,
    pub static_backings: usize,
    pub bytes_allocated: usize,
}

/// [`TensorAllocator`] over a numr runtime device
pub struct RuntimeAllocator<R: Runtime> {
    device: R::Device,
    client: R::Client,
    tensors_created: AtomicUsize,
    static_backings: AtomicUsize,
    bytes_allocated: AtomicUsize,
}

/// Allocator for host tensors on the numr CPU runtime
pub type HostAllocator = RuntimeAllocator<CpuRuntime>;

#[cfg(feature = "cuda")]
pub type CudaAllocator = RuntimeAllocator<numr::runtime::cuda::CudaRuntime>;

#[cfg(feature = "wgpu")]
pub type WgpuAllocator = RuntimeAllocator<numr::runtime::wgpu::WgpuRuntime>;

impl<R: KvRuntime> RuntimeAllocator<R> {
    pub fn with_device(device: R::Device) -> Self {
        let client = R::default_client(&device);
        Self {
            device,
            client,
            tensors_created: AtomicUsize::new(0),
            static_backings: AtomicUsize::new(0),
            bytes_allocated: AtomicUsize::new(0),
        }
    }

    /// Create a tensor initialised from typed data.
    pub fn tensor_from_slice<T: Element>(&self, data: &[T], shape: &[usize]) -> Result<KvTensor<R>> {
        let tensor = Tensor::<R>::try_from_slice(data, shape, &self.device)?;
        self.record(std::mem::size_of_val(data));
        Ok(KvTensor::new(tensor, self.memory_space()))
    }

    pub fn stats(&self) -> AllocatorStats {
        AllocatorStats {
            tensors_created: self.tensors_created.load(Ordering::Relaxed),
            static_backings: self.static_backings.load(Ordering::Relaxed),
            bytes_allocated: self.bytes_allocated.load(Ordering::Relaxed),
        }
    }

    fn record(&self, bytes: usize) {
        self.tensors_created.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
    }
}

impl RuntimeAllocator<CpuRuntime> {
    pub fn new() -> Self {
        Self::with_device(CpuDevice::new())
    }
}

impl Default for RuntimeAllocator<CpuRuntime> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(feature = "cuda")]
impl RuntimeAllocator<numr::runtime::cuda::CudaRuntime> {
    pub fn cuda(ordinal: usize) -> Self {
        Self::with_device(numr::runtime::cuda::CudaDevice::new(ordinal))
    }
}

#[cfg(feature = "wgpu")]
impl RuntimeAllocator<numr::runtime::wgpu::WgpuRuntime> {
    pub fn wgpu(index: usize) -> Self {
        Self::with_device(numr::runtime::wgpu::WgpuDevice::new(index))
    }
}

impl<R: KvRuntime> TensorAllocator<R> for RuntimeAllocator<R> {
    fn device(&self) -> &R::Device {
        &self.device
    }

    fn client(&self) -> &R::Client {
        &self.client
    }

    fn create_tensor(&self, shape: &[usize], dtype: DType) -> Result<KvTensor<R>> {
        let bytes = super::size_in_bytes(shape, dtype)?;
        let tensor = Tensor::<R>::try_zeros(shape, dtype, &self.device).map_err(|e| {
            Error::Allocation {
                bytes,
                reason: e.to_string(),
            }
        })?;
        self.record(bytes);
        Ok(KvTensor::new(tensor, self.memory_space()))
    }

    fn allocate_static_backing(&self, bytes: usize) -> Result<StaticBacking<R>> {
        let zeroed = Tensor::<R>::try_zeros(&[bytes], DType::U8, &self.device).map_err(|e| {
            Error::Allocation {
                bytes,
                reason: e.to_string(),
            }
        })?;
        self.static_backings.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated.fetch_add(bytes, Ordering::Relaxed);
        Ok(StaticBacking::new(zeroed.storage().clone()))
    }
}
