//! Device readback capability
//!
//! A [`ReadbackDevice`] is a backend whose buffers the host cannot read
//! directly. Bytes come out through a host-visible staging buffer: record a
//! device-side copy into staging, drain the queue, then map staging memory.
//! [`crate::inference::ReadbackHeap`] drives this sequence.

use crate::error::Result;

/// Byte range of a device buffer to read back
pub struct ReadbackRegion<'a, B: ?Sized> {
    pub buffer: &'a B,
    /// Byte offset into `buffer`
    pub offset: u64,
    /// Bytes to read
    pub len: usize,
}

impl<'a, B: ?Sized> ReadbackRegion<'a, B> {
    pub fn new(buffer: &'a B, offset: u64, len: usize) -> Self {
        Self {
            buffer,
            offset,
            len,
        }
    }
}

impl<B: ?Sized> Clone for ReadbackRegion<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B: ?Sized> Copy for ReadbackRegion<'_, B> {}

/// Backend operations needed to stream bytes out through a staging buffer
pub trait ReadbackDevice {
    /// Device buffer type that regions are read from.
    type Buffer: ?Sized;
    /// Host-visible staging buffer type.
    type Staging;

    /// Create a staging buffer of at least `capacity` bytes.
    fn create_staging(&self, capacity: usize) -> Result<Self::Staging>;

    /// Record a copy of `region` into `staging` at `staging_offset`.
    ///
    /// Recording does not execute anything; the copy lands after
    /// [`flush`](Self::flush) and [`wait_for_completion`](Self::wait_for_completion).
    fn copy_to_staging(
        &self,
        staging: &Self::Staging,
        staging_offset: u64,
        region: &ReadbackRegion<'_, Self::Buffer>,
    ) -> Result<()>;

    /// Drop copies recorded since the last [`flush`](Self::flush) without
    /// running them.
    ///
    /// Called when a batch fails half-way through recording, so the partial
    /// batch never reaches a later submission.
    fn discard_pending(&self) -> Result<()>;

    /// Submit all recorded work.
    fn flush(&self) -> Result<()>;

    /// Block until all submitted work has completed.
    fn wait_for_completion(&self) -> Result<()>;

    /// Drop references held by completed work.
    fn release_completed(&self) -> Result<()>;

    /// Map the first `len` bytes of `staging` and pass them to `f`.
    ///
    /// The mapping is released before this returns.
    fn read_mapped(
        &self,
        staging: &Self::Staging,
        len: usize,
        f: &mut dyn FnMut(&[u8]),
    ) -> Result<()>;

    /// Required alignment of staging offsets, in bytes.
    fn copy_alignment(&self) -> usize {
        1
    }
}
