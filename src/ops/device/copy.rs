//! Asynchronous copy on an accelerator runtime
//!
//! The numr client queues `index_select` kernels on its stream; nothing here
//! waits unless [`CopyOps::synchronize`] is called.

use crate::error::Result;
use crate::ops::traits::CopyOps;
use crate::ops::traits::copy::{fill_bytes, index_select_rows};
use crate::tensor::{KvRuntime, KvTensor};
use numr::runtime::RuntimeClient;
use numr::tensor::Tensor;

/// Queues gathers on one runtime client
pub struct DeviceCopy<R: KvRuntime> {
    client: R::Client,
}

impl<R: KvRuntime> DeviceCopy<R> {
    pub fn new(client: R::Client) -> Self {
        Self { client }
    }

    pub fn client(&self) -> &R::Client {
        &self.client
    }
}

impl<R: KvRuntime> CopyOps<R> for DeviceCopy<R> {
    fn name(&self) -> &'static str {
        R::name()
    }

    fn is_async(&self) -> bool {
        true
    }

    fn gather_rows(&self, src: &Tensor<R>, dim: usize, indices: &[i32]) -> Result<Tensor<R>> {
        index_select_rows::<R>(&self.client, src, dim, indices)
    }

    fn fill(&self, tensor: &KvTensor<R>, value: u8) -> Result<()> {
        fill_bytes(tensor, value)
    }

    fn synchronize(&self) -> Result<()> {
        self.client.synchronize();
        Ok(())
    }
}
