//! wgpu readback device

use crate::error::{Error, Result};
use crate::ops::traits::{ReadbackDevice, ReadbackRegion};
use parking_lot::Mutex;
use std::time::Duration;
use wgpu::BufferUsages;

const POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// Streams bytes out of wgpu buffers through a MAP_READ staging buffer.
///
/// Copies are recorded into one pending command encoder and submitted
/// together on [`flush`](ReadbackDevice::flush).
pub struct WgpuReadback {
    device: wgpu::Device,
    queue: wgpu::Queue,
    encoder: Mutex<Option<wgpu::CommandEncoder>>,
}

impl WgpuReadback {
    pub fn new(device: wgpu::Device, queue: wgpu::Queue) -> Self {
        Self {
            device,
            queue,
            encoder: Mutex::new(None),
        }
    }

    /// Read back through the device and queue of a numr wgpu client.
    pub fn from_client(client: &numr::runtime::wgpu::WgpuClient) -> Self {
        Self::new(client.wgpu_device().clone(), client.wgpu_queue().clone())
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    fn poll_wait(&self) -> Result<()> {
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: Some(POLL_TIMEOUT),
            })
            .map_err(|e| Error::Backend {
                reason: format!("wgpu poll: {:?}", e),
            })?;
        Ok(())
    }
}

impl ReadbackDevice for WgpuReadback {
    type Buffer = wgpu::Buffer;
    type Staging = wgpu::Buffer;

    fn create_staging(&self, capacity: usize) -> Result<wgpu::Buffer> {
        let size = (capacity as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        Ok(self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("kv_readback_staging"),
            size,
            usage: BufferUsages::MAP_READ | BufferUsages::COPY_DST,
            mapped_at_creation: false,
        }))
    }

    fn copy_to_staging(
        &self,
        staging: &wgpu::Buffer,
        staging_offset: u64,
        region: &ReadbackRegion<'_, wgpu::Buffer>,
    ) -> Result<()> {
        // Copy sizes must be a multiple of COPY_BUFFER_ALIGNMENT; the padding
        // bytes are never handed to the caller.
        let size = (region.len as u64).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT);
        if region.offset % wgpu::COPY_BUFFER_ALIGNMENT != 0
            || region.offset + size > region.buffer.size()
        {
            return Err(Error::InvalidArgument {
                arg: "region",
                reason: format!(
                    "{} bytes at offset {} of a {} byte buffer break copy alignment {}",
                    region.len,
                    region.offset,
                    region.buffer.size(),
                    wgpu::COPY_BUFFER_ALIGNMENT
                ),
            });
        }
        if size == 0 {
            return Ok(());
        }
        let mut pending = self.encoder.lock();
        let encoder = pending.get_or_insert_with(|| {
            self.device
                .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                    label: Some("kv_readback"),
                })
        });
        encoder.copy_buffer_to_buffer(region.buffer, region.offset, staging, staging_offset, size);
        Ok(())
    }

    fn discard_pending(&self) -> Result<()> {
        // An unfinished encoder is dropped without submission.
        self.encoder.lock().take();
        Ok(())
    }

    fn flush(&self) -> Result<()> {
        if let Some(encoder) = self.encoder.lock().take() {
            self.queue.submit(std::iter::once(encoder.finish()));
        }
        Ok(())
    }

    fn wait_for_completion(&self) -> Result<()> {
        self.poll_wait()
    }

    fn release_completed(&self) -> Result<()> {
        Ok(())
    }

    fn read_mapped(
        &self,
        staging: &wgpu::Buffer,
        len: usize,
        f: &mut dyn FnMut(&[u8]),
    ) -> Result<()> {
        if len as u64 > staging.size() {
            return Err(Error::InvalidArgument {
                arg: "len",
                reason: format!("{} bytes mapped from staging of {}", len, staging.size()),
            });
        }
        let slice = staging.slice(..);
        let (tx, rx) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            tx.send(result).ok();
        });
        self.poll_wait()?;
        rx.recv()
            .map_err(|e| Error::Backend {
                reason: format!("readback channel error: {:?}", e),
            })?
            .map_err(|e| Error::Backend {
                reason: format!("readback map error: {:?}", e),
            })?;

        let data = slice.get_mapped_range();
        f(&data[..len]);
        drop(data);
        staging.unmap();
        Ok(())
    }

    fn copy_alignment(&self) -> usize {
        wgpu::COPY_BUFFER_ALIGNMENT as usize
    }
}
