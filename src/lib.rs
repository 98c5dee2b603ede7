//! # kvrt
//!
//! **Attention KV-cache runtime for autoregressive decoders.**
//!
//! kvrt owns the past/present key-value tensors a transformer decoder reads
//! and writes at every decoding step. It allocates them, carries them forward,
//! reorders them for beam search and slides fixed windows, on host memory or
//! on a device with its own address space.
//!
//! ## Layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │ inference::kv_cache   combined · split · cross · sliding  │
//! │ inference::readback   staging heap for device readback    │
//! └──────────────────────────┬────────────────────────────────┘
//! ┌──────────────────────────┴────────────────────────────────┐
//! │ ops      CopyOps (host / device) · ReadbackDevice (cpu/wgpu)│
//! │ tensor   KvTensor over numr · TensorAllocator per runtime   │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Design
//!
//! - **Collaborators as traits**: graph execution is an [`ExecutionRequest`]
//!   slot list, the loaded graph is a [`ModelInfo`]
//! - **Generic over the numr runtime**: caches take any [`KvRuntime`]; the
//!   runtime type picks the [`CopyOps`] implementation through
//!   [`ops::select_copy_ops`]
//! - **Atomic advance**: every new tensor of a step is built before any is
//!   installed
//! - **Backends behind features**: `cuda` and `wgpu`, both through numr

pub mod error;
pub mod inference;
pub mod ops;
pub mod tensor;

pub use error::{Error, Result};
pub use inference::{
    CacheContext, CombinedKvCache, CrossCache, ExecutionRequest, GeneratorParams, KeyValueCache,
    KvElement, ModelConfig, ModelInfo, ReadbackHeap, SessionInfo, SlidingWindowKvCache, SlotList,
    SplitKvCache, create_kv_cache,
};
pub use ops::{CopyOps, CpuReadbackQueue, DeviceCopy, HostCopy, ReadbackDevice, ReadbackRegion};
pub use tensor::{
    HostAllocator, KvRuntime, KvTensor, MemorySpace, RuntimeAllocator, TensorAllocator, TensorId,
};

// Element-type vocabulary shared with numr
pub use numr::dtype::DType;
