//! Backend copy and readback operations
//!
//! Traits live in [`traits`]; each backend directory provides its
//! implementations. A cache picks its copy path once, at construction, with
//! [`select_copy_ops`].

pub mod cpu;
pub mod device;
pub mod traits;
#[cfg(feature = "wgpu")]
pub mod wgpu;

pub use cpu::{CpuReadbackQueue, CpuReadbackStats, CpuStaging, HostCopy};
pub use device::DeviceCopy;
pub use traits::{CopyOps, ReadbackDevice, ReadbackRegion};
#[cfg(feature = "wgpu")]
pub use wgpu::WgpuReadback;

use crate::tensor::{KvRuntime, TensorAllocator};
use std::sync::Arc;

/// Choose the copy strategy for tensors produced by `allocator`.
///
/// The numr runtime decides: the CPU runtime gets the synchronous
/// [`HostCopy`], accelerator runtimes get a [`DeviceCopy`] on the
/// allocator's client.
pub fn select_copy_ops<R: KvRuntime>(allocator: &dyn TensorAllocator<R>) -> Arc<dyn CopyOps<R>> {
    allocator.copy_ops()
}
