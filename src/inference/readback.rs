//! Reusable staging buffer for device readback
//!
//! Grows geometrically and never shrinks. Every read is a full pipeline
//! barrier: record copies, flush, wait, release, then map.

use crate::error::{Error, Result};
use crate::ops::traits::{ReadbackDevice, ReadbackRegion};

/// Capacity of the first staging buffer
pub const DEFAULT_INITIAL_CAPACITY: usize = 1 << 20;

/// Smallest `capacity × 2^k` that holds `desired` bytes.
pub fn compute_new_capacity(capacity: usize, desired: usize) -> Result<usize> {
    let mut new_capacity = capacity;
    while new_capacity < desired {
        if new_capacity >= usize::MAX / 2 {
            return Err(Error::CapacityOverflow {
                requested: desired,
                capacity: new_capacity,
            });
        }
        new_capacity *= 2;
    }
    Ok(new_capacity)
}

/// Staging buffer owner for one [`ReadbackDevice`]
pub struct ReadbackHeap<D: ReadbackDevice> {
    device: D,
    initial_capacity: usize,
    staging: Option<D::Staging>,
    capacity: usize,
}

impl<D: ReadbackDevice> ReadbackHeap<D> {
    pub fn new(device: D) -> Self {
        Self {
            device,
            initial_capacity: DEFAULT_INITIAL_CAPACITY,
            staging: None,
            capacity: 0,
        }
    }

    pub fn with_initial_capacity(device: D, initial_capacity: usize) -> Result<Self> {
        if initial_capacity == 0 {
            return Err(Error::InvalidConfig {
                reason: "readback initial capacity must be > 0".into(),
            });
        }
        Ok(Self {
            device,
            initial_capacity,
            staging: None,
            capacity: 0,
        })
    }

    pub fn device(&self) -> &D {
        &self.device
    }

    /// Current staging size in bytes; 0 before the first read.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Make sure the staging buffer holds at least `min_bytes`.
    pub fn ensure_capacity(&mut self, min_bytes: usize) -> Result<()> {
        let base = match self.staging {
            Some(_) if self.capacity >= min_bytes => return Ok(()),
            Some(_) => self.capacity,
            None => self.initial_capacity,
        };
        let new_capacity = compute_new_capacity(base, min_bytes)?;
        // Release the old buffer before creating its replacement.
        self.staging = None;
        self.staging = Some(self.device.create_staging(new_capacity)?);
        tracing::debug!(
            old_capacity = self.capacity,
            new_capacity,
            min_bytes,
            "readback staging grown"
        );
        self.capacity = new_capacity;
        Ok(())
    }

    /// Read one device region into `dst`.
    pub fn read_back(
        &mut self,
        dst: &mut [u8],
        src: ReadbackRegion<'_, D::Buffer>,
    ) -> Result<()> {
        if dst.is_empty() {
            return Err(Error::InvalidArgument {
                arg: "dst",
                reason: "readback destination is empty".into(),
            });
        }
        if src.len != dst.len() {
            return Err(Error::InvalidArgument {
                arg: "src",
                reason: format!(
                    "source region of {} bytes for a {} byte destination",
                    src.len,
                    dst.len()
                ),
            });
        }
        self.ensure_capacity(dst.len())?;
        let staging = self.staging_ref()?;

        self.record(staging, std::iter::once((0, &src)))?;
        self.barrier()?;
        self.device
            .read_mapped(staging, dst.len(), &mut |bytes| dst.copy_from_slice(bytes))
    }

    /// Read many device regions with a single barrier.
    ///
    /// `dsts[i]` receives `srcs[i]`. Regions are packed into staging at
    /// offsets aligned to the device's copy alignment.
    pub fn read_back_many(
        &mut self,
        dsts: &mut [&mut [u8]],
        srcs: &[ReadbackRegion<'_, D::Buffer>],
    ) -> Result<()> {
        if dsts.len() != srcs.len() {
            return Err(Error::InvalidArgument {
                arg: "srcs",
                reason: format!(
                    "{} source regions for {} destinations",
                    srcs.len(),
                    dsts.len()
                ),
            });
        }
        if dsts.is_empty() {
            return Ok(());
        }

        let align = self.device.copy_alignment().max(1);
        let mut offsets = Vec::with_capacity(srcs.len());
        let mut total = 0usize;
        for (i, (dst, src)) in dsts.iter().zip(srcs).enumerate() {
            if src.len != dst.len() {
                return Err(Error::InvalidArgument {
                    arg: "srcs",
                    reason: format!(
                        "region {} is {} bytes for a {} byte destination",
                        i,
                        src.len,
                        dst.len()
                    ),
                });
            }
            offsets.push(total);
            total = src
                .len
                .checked_next_multiple_of(align)
                .and_then(|aligned| total.checked_add(aligned))
                .ok_or(Error::CapacityOverflow {
                    requested: usize::MAX,
                    capacity: self.capacity,
                })?;
        }

        self.ensure_capacity(total)?;
        let staging = self.staging_ref()?;
        self.record(staging, offsets.iter().map(|&o| o as u64).zip(srcs))?;
        self.barrier()?;

        let mapped_len = offsets.last().copied().unwrap_or(0) + srcs[srcs.len() - 1].len;
        self.device.read_mapped(staging, mapped_len, &mut |bytes| {
            for (dst, &offset) in dsts.iter_mut().zip(&offsets) {
                let len = dst.len();
                dst.copy_from_slice(&bytes[offset..offset + len]);
            }
        })
    }

    fn staging_ref(&self) -> Result<&D::Staging> {
        self.staging.as_ref().ok_or_else(|| Error::Backend {
            reason: "readback staging buffer missing after allocation".into(),
        })
    }

    /// Record every copy, or none of them: a failure discards the copies
    /// already recorded for this batch.
    fn record<'r, 'b: 'r>(
        &self,
        staging: &D::Staging,
        copies: impl IntoIterator<Item = (u64, &'r ReadbackRegion<'b, D::Buffer>)>,
    ) -> Result<()>
    where
        D::Buffer: 'b,
    {
        let recorded = copies
            .into_iter()
            .try_for_each(|(offset, src)| self.device.copy_to_staging(staging, offset, src));
        if let Err(e) = recorded {
            self.device.discard_pending()?;
            return Err(e);
        }
        Ok(())
    }

    fn barrier(&self) -> Result<()> {
        self.device.flush()?;
        self.device.wait_for_completion()?;
        self.device.release_completed()
    }
}
