//! numr runtimes a cache can run on
//!
//! Each runtime declares where its memory lives and which copy strategy moves
//! cache rows on it. Caches are generic over [`KvRuntime`]; the strategy is
//! resolved once from the runtime type, never from a runtime check.

use super::MemorySpace;
use crate::ops::traits::CopyOps;
use crate::ops::HostCopy;
use numr::ops::{IndexingOps, ShapeOps};
use numr::runtime::Runtime;
use numr::runtime::cpu::CpuRuntime;
use std::sync::Arc;

/// A numr runtime with the tensor ops the caches use
pub trait KvRuntime: Runtime<Client: IndexingOps<Self> + ShapeOps<Self>> {
    /// Memory space of every buffer this runtime allocates.
    const MEMORY_SPACE: MemorySpace;

    /// Copy strategy for tensors on `client`'s device.
    fn copy_ops(client: &Self::Client) -> Arc<dyn CopyOps<Self>>;
}

impl KvRuntime for CpuRuntime {
    const MEMORY_SPACE: MemorySpace = MemorySpace::Host;

    fn copy_ops(client: &Self::Client) -> Arc<dyn CopyOps<Self>> {
        Arc::new(HostCopy::new(client.clone()))
    }
}

#[cfg(feature = "cuda")]
impl KvRuntime for numr::runtime::cuda::CudaRuntime {
    const MEMORY_SPACE: MemorySpace = MemorySpace::Device;

    fn copy_ops(client: &Self::Client) -> Arc<dyn CopyOps<Self>> {
        Arc::new(crate::ops::DeviceCopy::new(client.clone()))
    }
}

#[cfg(feature = "wgpu")]
impl KvRuntime for numr::runtime::wgpu::WgpuRuntime {
    const MEMORY_SPACE: MemorySpace = MemorySpace::Device;

    fn copy_ops(client: &Self::Client) -> Arc<dyn CopyOps<Self>> {
        Arc::new(crate::ops::DeviceCopy::new(client.clone()))
    }
}
