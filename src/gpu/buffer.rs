//! GPU buffer management
//!
//! `GpuBuffer` wraps a wgpu storage buffer of f32 elements and handles the
//! copies between host and device.

use super::context::{GpuSyncError, sync_timeout};
use super::get_gpu_context;
use std::sync::mpsc;
use wgpu::util::DeviceExt;

/// A buffer that lives on the GPU
///
/// Analogous to a `Vec<f32>` whose data lives in GPU memory. Reading it back
/// goes through a mappable staging buffer.
pub struct GpuBuffer {
    buffer: wgpu::Buffer,
    /// Size in number of f32 elements
    len: usize,
}

const USAGE: wgpu::BufferUsages = wgpu::BufferUsages::STORAGE
    .union(wgpu::BufferUsages::COPY_SRC)
    .union(wgpu::BufferUsages::COPY_DST);

impl GpuBuffer {
    /// Create a new GPU buffer from CPU data
    #[must_use]
    pub fn from_slice(data: &[f32]) -> Option<Self> {
        let ctx = get_gpu_context()?;
        // Zero-sized bindings are invalid, so empty buffers hold one padding element
        let padded;
        let contents = if data.is_empty() {
            padded = [0.0f32];
            &padded[..]
        } else {
            data
        };
        let buffer = ctx
            .device()
            .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some("Tensor Buffer"),
                contents: bytemuck::cast_slice(contents),
                usage: USAGE,
            });
        Some(GpuBuffer {
            buffer,
            len: data.len(),
        })
    }

    /// Create a zero-filled GPU buffer of `len` elements
    #[must_use]
    pub fn zeros(len: usize) -> Option<Self> {
        let ctx = get_gpu_context()?;
        // wgpu zero-initializes new buffers
        let buffer = ctx.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("Tensor Buffer (zeros)"),
            size: (len.max(1) * std::mem::size_of::<f32>()) as u64,
            usage: USAGE,
            mapped_at_creation: false,
        });
        Some(GpuBuffer { buffer, len })
    }

    /// Copy data from GPU back to CPU
    ///
    /// # Errors
    /// `GpuSyncError` when the device does not finish in time or the staging
    /// buffer cannot be mapped.
    pub fn try_to_vec(&self) -> Result<Vec<f32>, GpuSyncError> {
        if self.len == 0 {
            return Ok(Vec::new());
        }
        let ctx = get_gpu_context()
            .ok_or_else(|| GpuSyncError::Map("GPU context missing".to_string()))?;
        let byte_size = (self.len * std::mem::size_of::<f32>()) as u64;

        // STORAGE buffers can't be mapped directly
        let staging_buffer = ctx.device().create_buffer(&wgpu::BufferDescriptor {
            label: Some("Staging Buffer"),
            size: byte_size,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = ctx
            .device()
            .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                label: Some("Read Buffer Encoder"),
            });
        encoder.copy_buffer_to_buffer(&self.buffer, 0, &staging_buffer, 0, byte_size);
        ctx.queue().submit(Some(encoder.finish()));
        ctx.increment_pending();

        let buffer_slice = staging_buffer.slice(..);
        let (sender, receiver) = mpsc::channel();
        buffer_slice.map_async(wgpu::MapMode::Read, move |result| {
            // Receiver outlives the poll below
            let _ = sender.send(result);
        });

        ctx.sync_checked()?;

        receiver
            .recv_timeout(sync_timeout())
            .map_err(|e| GpuSyncError::Timeout(e.to_string()))?
            .map_err(|e| GpuSyncError::Map(e.to_string()))?;

        let data = buffer_slice.get_mapped_range();
        let result: Vec<f32> = bytemuck::cast_slice(&data).to_vec();
        drop(data);
        staging_buffer.unmap();
        Ok(result)
    }

    /// Copy data from GPU back to CPU
    ///
    /// # Panics
    /// Panics if the readback fails; use `try_to_vec` to handle that case.
    #[must_use]
    pub fn to_vec(&self) -> Vec<f32> {
        self.try_to_vec().expect("GPU readback failed")
    }

    /// Get the underlying wgpu buffer (for use in compute passes)
    #[must_use]
    pub fn buffer(&self) -> &wgpu::Buffer {
        &self.buffer
    }

    /// Get the number of elements
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::fmt::Debug for GpuBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GpuBuffer").field("len", &self.len).finish()
    }
}
