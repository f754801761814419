//! GPU context management
//!
//! The `GpuContext` holds the wgpu device and queue plus the compiled
//! deconvolution pipelines.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use wgpu::PipelineCompilationOptions;

/// Default timeout for GPU sync and readback
const DEFAULT_SYNC_TIMEOUT_SECS: u64 = 5;

/// Sync timeout from `DECONV_GPU_SYNC_TIMEOUT` (seconds), or the default
///
/// ```bash
/// DECONV_GPU_SYNC_TIMEOUT=30 cargo test --features gpu
/// ```
pub(crate) fn sync_timeout() -> Duration {
    let secs = std::env::var("DECONV_GPU_SYNC_TIMEOUT")
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
        .unwrap_or(DEFAULT_SYNC_TIMEOUT_SECS);
    Duration::from_secs(secs)
}

/// GPU synchronization errors
#[derive(Debug)]
pub enum GpuSyncError {
    /// Wait for the device timed out
    Timeout(String),
    /// Mapping a buffer for readback failed
    Map(String),
}

impl std::fmt::Display for GpuSyncError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Self::Timeout(msg) => write!(f, "GPU sync timeout: {msg}"),
            Self::Map(msg) => write!(f, "GPU buffer map failed: {msg}"),
        }
    }
}

impl std::error::Error for GpuSyncError {}

/// Manages the GPU device, queue, and compiled compute pipelines
pub struct GpuContext {
    /// The GPU device - represents the actual hardware
    device: wgpu::Device,
    /// Command queue - where we submit work to the GPU
    queue: wgpu::Queue,
    /// Adapter info for debugging
    adapter_info: wgpu::AdapterInfo,
    /// Pre-compiled compute pipelines
    pipelines: ComputePipelines,
    /// Submissions not yet waited on
    pending_submissions: AtomicU32,
}

/// Pre-compiled compute pipelines, one per shader entry point
pub struct ComputePipelines {
    // Gradient accumulation
    pub add: wgpu::ComputePipeline,

    // Forward, column-buffer path
    pub deconv_col2im_gemm: wgpu::ComputePipeline,
    pub deconv_col2im_fold: wgpu::ComputePipeline,

    // Forward, direct gather path
    pub deconv_fused: wgpu::ComputePipeline,

    // Backward
    pub conv_backward_input: wgpu::ComputePipeline,
    pub deconv_backward_weight: wgpu::ComputePipeline,
    pub deconv_backward_bias: wgpu::ComputePipeline,
}

impl GpuContext {
    /// Initialize the GPU context
    ///
    /// Finds an adapter, creates a device and queue, and compiles the shaders.
    ///
    /// # Errors
    /// A description of the failing step when no adapter or device is available.
    pub fn new() -> Result<Self, String> {
        // wgpu is async, but we want a sync API for simplicity
        pollster::block_on(Self::new_async())
    }

    async fn new_async() -> Result<Self, String> {
        let instance = wgpu::Instance::new(&wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None, // compute only
                force_fallback_adapter: false,
            })
            .await
            .map_err(|e| format!("No suitable GPU adapter found: {e}"))?;

        let adapter_info = adapter.get_info();

        let device_descriptor = wgpu::DeviceDescriptor {
            label: Some("Deconv GPU Device"),
            required_features: wgpu::Features::empty(),
            required_limits: wgpu::Limits::default(),
            memory_hints: wgpu::MemoryHints::Performance,
            ..Default::default()
        };

        let (device, queue) = adapter
            .request_device(&device_descriptor)
            .await
            .map_err(|e| format!("Failed to create device: {e}"))?;

        let pipelines = Self::create_pipelines(&device);

        Ok(Self {
            device,
            queue,
            adapter_info,
            pipelines,
            pending_submissions: AtomicU32::new(0),
        })
    }

    /// Get the GPU device name for display
    pub fn device_name(&self) -> &str {
        &self.adapter_info.name
    }

    pub const fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub const fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    pub const fn pipelines(&self) -> &ComputePipelines {
        &self.pipelines
    }

    /// Call after each `queue.submit()`
    pub fn increment_pending(&self) {
        let count = self.pending_submissions.fetch_add(1, Ordering::Relaxed) + 1;
        log::trace!("GPU pending submissions: {count}");
    }

    /// Wait for all pending commands to complete.
    ///
    /// Returns false on timeout. The pending counter is reset either way.
    pub fn sync(&self) -> bool {
        match self.sync_checked() {
            Ok(()) => true,
            Err(e) => {
                log::warn!("{e}");
                false
            }
        }
    }

    /// Like `sync`, but reports the failure
    ///
    /// # Errors
    /// `GpuSyncError::Timeout` when the device does not finish in time.
    pub fn sync_checked(&self) -> Result<(), GpuSyncError> {
        let pending = self.pending_submissions.swap(0, Ordering::Relaxed);
        if pending == 0 {
            return Ok(());
        }
        log::trace!("GPU syncing {pending} pending submissions");
        let timeout = sync_timeout();
        self.device
            .poll(wgpu::PollType::Wait {
                submission_index: None,
                timeout: Some(timeout),
            })
            .map(|_| ())
            .map_err(|e| GpuSyncError::Timeout(format!("{e:?} after {}s", timeout.as_secs())))
    }

    fn create_pipelines(device: &wgpu::Device) -> ComputePipelines {
        let shader = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("Deconvolution Shader"),
            source: wgpu::ShaderSource::Wgsl(include_str!("shaders/deconv.wgsl").into()),
        });

        // Layouts are derived from the bindings each entry point uses
        let create_pipeline = |entry_point: &str, label: &str| {
            device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                label: Some(label),
                layout: None,
                module: &shader,
                entry_point: Some(entry_point),
                compilation_options: PipelineCompilationOptions::default(),
                cache: None,
            })
        };

        ComputePipelines {
            add: create_pipeline("add", "Add Pipeline"),
            deconv_col2im_gemm: create_pipeline("deconv_col2im_gemm", "Deconv GEMM Pipeline"),
            deconv_col2im_fold: create_pipeline("deconv_col2im_fold", "Deconv Col2im Pipeline"),
            deconv_fused: create_pipeline("deconv_fused", "Deconv Fused Pipeline"),
            conv_backward_input: create_pipeline(
                "conv_backward_input",
                "Conv Backward Input Pipeline",
            ),
            deconv_backward_weight: create_pipeline(
                "deconv_backward_weight",
                "Deconv Backward Weight Pipeline",
            ),
            deconv_backward_bias: create_pipeline(
                "deconv_backward_bias",
                "Deconv Backward Bias Pipeline",
            ),
        }
    }
}
