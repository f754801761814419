//! GPU executor using wgpu
//!
//! - `GpuContext`: device, queue and the compiled deconvolution pipelines
//! - `GpuBuffer`: f32 data resident on the GPU
//! - `GpuKernels`: dispatch of the compute shaders in `shaders/deconv.wgsl`

mod buffer;
mod context;
mod kernels;

pub use buffer::GpuBuffer;
pub use context::{GpuContext, GpuSyncError};
pub use kernels::{DeconvParams, GpuKernels};

use std::sync::OnceLock;

// Global GPU context - initialized lazily on first use
static GPU_CONTEXT: OnceLock<Option<GpuContext>> = OnceLock::new();

/// Get the global GPU context, initializing it if necessary
/// Returns None if GPU is not available
pub fn get_gpu_context() -> Option<&'static GpuContext> {
    GPU_CONTEXT
        .get_or_init(|| match GpuContext::new() {
            Ok(ctx) => {
                log::info!("GPU initialized: {}", ctx.device_name());
                Some(ctx)
            }
            Err(e) => {
                log::warn!("GPU initialization failed: {e}");
                None
            }
        })
        .as_ref()
}

/// Check if GPU is available
pub fn is_gpu_available() -> bool {
    get_gpu_context().is_some()
}
