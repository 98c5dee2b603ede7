//! Synchronous host copy

use crate::error::Result;
use crate::ops::traits::CopyOps;
use crate::ops::traits::copy::{fill_bytes, index_select_rows};
use crate::tensor::KvTensor;
use numr::runtime::cpu::{CpuClient, CpuRuntime};
use numr::tensor::Tensor;

/// Gathers and fills CPU-runtime tensors on the calling thread
#[derive(Clone)]
pub struct HostCopy {
    client: CpuClient,
}

impl HostCopy {
    pub fn new(client: CpuClient) -> Self {
        Self { client }
    }
}

impl CopyOps<CpuRuntime> for HostCopy {
    fn name(&self) -> &'static str {
        "host"
    }

    fn is_async(&self) -> bool {
        false
    }

    fn gather_rows(
        &self,
        src: &Tensor<CpuRuntime>,
        dim: usize,
        indices: &[i32],
    ) -> Result<Tensor<CpuRuntime>> {
        index_select_rows::<CpuRuntime>(&self.client, src, dim, indices)
    }

    fn fill(&self, tensor: &KvTensor<CpuRuntime>, value: u8) -> Result<()> {
        fill_bytes(tensor, value)
    }

    fn synchronize(&self) -> Result<()> {
        Ok(())
    }
}
