//! Host emulation of a deferred device queue
//!
//! Behaves like a real accelerator queue as far as ordering goes: a recorded
//! copy is invisible until it has been flushed and waited for, and mapping a
//! staging buffer that still has copies in flight fails. Sources are numr CPU
//! tensors; staging is a zeroed `U8` tensor on the same device.

use crate::error::{Error, Result};
use crate::ops::traits::{ReadbackDevice, ReadbackRegion};
use numr::dtype::DType;
use numr::runtime::Runtime;
use numr::runtime::cpu::{CpuDevice, CpuRuntime};
use numr::tensor::Tensor;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Staging buffer of a [`CpuReadbackQueue`]
pub struct CpuStaging {
    bytes: Tensor<CpuRuntime>,
    pending: Arc<AtomicUsize>,
}

impl CpuStaging {
    pub fn capacity(&self) -> usize {
        self.bytes.numel()
    }
}

struct PendingCopy {
    staging: Tensor<CpuRuntime>,
    pending: Arc<AtomicUsize>,
    offset: usize,
    data: Vec<u8>,
}

/// Counters of queue activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CpuReadbackStats {
    pub submissions: usize,
    /// Waits that drained at least one in-flight copy
    pub waits: usize,
    pub bytes_copied: usize,
    pub staging_created: usize,
    pub discarded: usize,
}

/// Deferred copy queue over numr CPU memory
#[derive(Default)]
pub struct CpuReadbackQueue {
    device: CpuDevice,
    recorded: Mutex<Vec<PendingCopy>>,
    in_flight: Mutex<Vec<PendingCopy>>,
    submissions: AtomicUsize,
    waits: AtomicUsize,
    bytes_copied: AtomicUsize,
    staging_created: AtomicUsize,
    discarded: AtomicUsize,
}

impl CpuReadbackQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn device(&self) -> &CpuDevice {
        &self.device
    }

    pub fn stats(&self) -> CpuReadbackStats {
        CpuReadbackStats {
            submissions: self.submissions.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            bytes_copied: self.bytes_copied.load(Ordering::Relaxed),
            staging_created: self.staging_created.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
        }
    }
}

fn addressable(value: u64, arg: &'static str) -> Result<usize> {
    usize::try_from(value).map_err(|_| Error::InvalidArgument {
        arg,
        reason: format!("offset {} is not addressable", value),
    })
}

/// Host address of byte `offset` of a dense tensor.
fn byte_address(tensor: &Tensor<CpuRuntime>, offset: usize) -> Result<u64> {
    if !tensor.is_contiguous() {
        return Err(Error::InvalidArgument {
            arg: "region",
            reason: "readback source must be contiguous".into(),
        });
    }
    let base = tensor.layout().offset() * tensor.dtype().size_in_bytes();
    Ok(tensor.storage().ptr() + (base + offset) as u64)
}

impl ReadbackDevice for CpuReadbackQueue {
    type Buffer = Tensor<CpuRuntime>;
    type Staging = CpuStaging;

    fn create_staging(&self, capacity: usize) -> Result<CpuStaging> {
        let bytes = Tensor::<CpuRuntime>::try_zeros(&[capacity], DType::U8, &self.device)?;
        self.staging_created.fetch_add(1, Ordering::Relaxed);
        Ok(CpuStaging {
            bytes,
            pending: Arc::new(AtomicUsize::new(0)),
        })
    }

    fn copy_to_staging(
        &self,
        staging: &CpuStaging,
        staging_offset: u64,
        region: &ReadbackRegion<'_, Tensor<CpuRuntime>>,
    ) -> Result<()> {
        let src_start = addressable(region.offset, "offset")?;
        let dst_start = addressable(staging_offset, "staging_offset")?;
        let src_len = region.buffer.numel() * region.buffer.dtype().size_in_bytes();
        if src_start.checked_add(region.len).is_none_or(|end| end > src_len) {
            return Err(Error::InvalidArgument {
                arg: "region",
                reason: format!(
                    "{} bytes at offset {} exceed source buffer of {} bytes",
                    region.len, src_start, src_len
                ),
            });
        }
        if dst_start.checked_add(region.len).is_none_or(|end| end > staging.capacity()) {
            return Err(Error::InvalidArgument {
                arg: "staging_offset",
                reason: format!(
                    "{} bytes at offset {} exceed staging capacity {}",
                    region.len,
                    dst_start,
                    staging.capacity()
                ),
            });
        }

        let mut data = vec![0u8; region.len];
        if !data.is_empty() {
            CpuRuntime::copy_from_device(
                byte_address(region.buffer, src_start)?,
                &mut data,
                &self.device,
            )?;
        }
        staging.pending.fetch_add(1, Ordering::AcqRel);
        self.recorded.lock().push(PendingCopy {
            staging: staging.bytes.clone(),
            pending: staging.pending.clone(),
            offset: dst_start,
            data,
        });
        Ok(())
    }

    fn discard_pending(&self) -> Result<()> {
        let dropped = std::mem::take(&mut *self.recorded.lock());
        for copy in &dropped {
            copy.pending.fetch_sub(1, Ordering::AcqRel);
        }
        self.discarded.fetch_add(dropped.len(), Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        let mut recorded = self.recorded.lock();
        if recorded.is_empty() {
            return Ok(());
        }
        self.in_flight.lock().append(&mut recorded);
        self.submissions.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn wait_for_completion(&self) -> Result<()> {
        let completed = std::mem::take(&mut *self.in_flight.lock());
        if completed.is_empty() {
            return Ok(());
        }
        for copy in completed {
            if !copy.data.is_empty() {
                CpuRuntime::copy_to_device(
                    &copy.data,
                    byte_address(&copy.staging, copy.offset)?,
                    &self.device,
                )?;
            }
            self.bytes_copied.fetch_add(copy.data.len(), Ordering::Relaxed);
            copy.pending.fetch_sub(1, Ordering::AcqRel);
        }
        self.waits.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn release_completed(&self) -> Result<()> {
        Ok(())
    }

    fn read_mapped(
        &self,
        staging: &CpuStaging,
        len: usize,
        f: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        let pending = staging.pending.load(Ordering::Acquire);
        if pending != 0 {
            return Err(Error::Backend {
                reason: format!("staging buffer mapped with {} unsynchronized copies", pending),
            });
        }
        if len > staging.capacity() {
            return Err(Error::InvalidArgument {
                arg: "len",
                reason: format!("{} bytes mapped from staging of {}", len, staging.capacity()),
            });
        }
        let mut mapped = vec![0u8; len];
        if len > 0 {
            CpuRuntime::copy_from_device(byte_address(&staging.bytes, 0)?, &mut mapped, &self.device)?;
        }
        f(&mapped);
        Ok(())
    }
}
