//! Deconvolution executors
//!
//! `DeconvBackend` is the one contract every executor implements. The operator
//! picks an implementation from its device through `Executor`.

pub mod cpu;
pub mod geometry;

pub use geometry::{DeconvGeometry, Pair, get_conv_outsize, get_deconv_outsize};

use crate::device::Device;
use crate::dtype::DType;
use crate::error::{DeconvError, Result};
use crate::storage::Storage;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

// ===== ALGORITHM SELECTION =====

/// Forward algorithm for the deconvolution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeconvAlgo {
    /// Direct per-output-pixel gather, no intermediate buffer
    #[default]
    Fused,
    /// GEMM into a column buffer followed by a col2im scatter
    Col2im,
}

impl fmt::Display for DeconvAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeconvAlgo::Fused => write!(f, "fused"),
            DeconvAlgo::Col2im => write!(f, "col2im"),
        }
    }
}

impl FromStr for DeconvAlgo {
    type Err = DeconvError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fused" => Ok(DeconvAlgo::Fused),
            "col2im" => Ok(DeconvAlgo::Col2im),
            other => Err(DeconvError::Config(format!(
                "unknown deconvolution algorithm '{other}' (expected 'fused' or 'col2im')"
            ))),
        }
    }
}

// ===== BACKEND CONTRACT =====

/// Kernels a deconvolution executor must provide
///
/// All storages must live on the executor's device and match `g`.
pub trait DeconvBackend {
    /// `y = deconv(x, w) + b`
    fn deconv_forward(
        &self,
        x: &Storage,
        w: &Storage,
        bias: Option<&Storage>,
        g: &DeconvGeometry,
        algo: DeconvAlgo,
    ) -> Result<Storage>;

    /// `gx = conv2d(gy, w)` with the deconvolution's stride and padding
    fn conv2d_backward_input(&self, gy: &Storage, w: &Storage, g: &DeconvGeometry)
    -> Result<Storage>;

    /// `gW` for one backward call (not accumulated)
    fn weight_grad(&self, x: &Storage, gy: &Storage, g: &DeconvGeometry) -> Result<Storage>;

    /// `gb` for one backward call (not accumulated)
    fn bias_grad(&self, gy: &Storage, g: &DeconvGeometry) -> Result<Storage>;
}

fn check_len(context: &'static str, s: &Storage, expected: usize) -> Result<()> {
    if s.len() != expected {
        return Err(DeconvError::shape(context, &[expected], &[s.len()]));
    }
    Ok(())
}

// ===== CPU =====

/// Reference executor over host memory
#[derive(Debug, Clone, Copy, Default)]
pub struct CpuBackend;

impl CpuBackend {
    fn host<'a>(s: &'a Storage, context: &'static str, expected: usize) -> Result<&'a [f32]> {
        check_len(context, s, expected)?;
        DType::ensure_f32(s.dtype())?;
        if s.is_gpu() {
            return Err(DeconvError::DeviceMismatch {
                expected: Device::CPU,
                actual: s.device_kind(),
            });
        }
        s.as_slice().ok_or_else(|| DeconvError::DeviceMismatch {
            expected: Device::CPU,
            actual: s.device_kind(),
        })
    }
}

impl DeconvBackend for CpuBackend {
    fn deconv_forward(
        &self,
        x: &Storage,
        w: &Storage,
        bias: Option<&Storage>,
        g: &DeconvGeometry,
        algo: DeconvAlgo,
    ) -> Result<Storage> {
        let x = Self::host(x, "deconv input", g.x_len())?;
        let w = Self::host(w, "deconv weight", g.w_len())?;
        let b = bias
            .map(|b| Self::host(b, "deconv bias", g.out_channels))
            .transpose()?;
        log::debug!("cpu deconv forward ({algo}) {:?} -> {:?}", g.x_shape(), g.y_shape());
        let y = match algo {
            DeconvAlgo::Fused => cpu::deconv_forward_fused(x, w, b, g),
            DeconvAlgo::Col2im => cpu::deconv_forward_col2im(x, w, b, g),
        };
        Ok(Storage::cpu(y))
    }

    fn conv2d_backward_input(
        &self,
        gy: &Storage,
        w: &Storage,
        g: &DeconvGeometry,
    ) -> Result<Storage> {
        let gy = Self::host(gy, "output gradient", g.y_len())?;
        let w = Self::host(w, "deconv weight", g.w_len())?;
        Ok(Storage::cpu(cpu::conv2d_backward_input(gy, w, g)))
    }

    fn weight_grad(&self, x: &Storage, gy: &Storage, g: &DeconvGeometry) -> Result<Storage> {
        let x = Self::host(x, "deconv input", g.x_len())?;
        let gy = Self::host(gy, "output gradient", g.y_len())?;
        Ok(Storage::cpu(cpu::weight_grad(x, gy, g)))
    }

    fn bias_grad(&self, gy: &Storage, g: &DeconvGeometry) -> Result<Storage> {
        let gy = Self::host(gy, "output gradient", g.y_len())?;
        Ok(Storage::cpu(cpu::bias_grad(gy, g)))
    }
}

// ===== GPU =====

/// Executor over wgpu buffers
#[cfg(feature = "gpu")]
#[derive(Debug, Clone, Copy, Default)]
pub struct GpuBackend;

#[cfg(feature = "gpu")]
impl GpuBackend {
    fn device_buf<'a>(
        s: &'a Storage,
        context: &'static str,
        expected: usize,
    ) -> Result<&'a crate::gpu::GpuBuffer> {
        check_len(context, s, expected)?;
        DType::ensure_f32(s.dtype())?;
        s.gpu_buffer().ok_or_else(|| DeconvError::DeviceMismatch {
            expected: Device::GPU(String::new()),
            actual: s.device_kind(),
        })
    }

    /// `DeviceError` unless the shader's 32-bit indices can address `g`
    fn check_indexable(g: &DeconvGeometry) -> Result<()> {
        if !crate::gpu::GpuKernels::fits_u32(g) {
            return Err(DeconvError::DeviceError(format!(
                "deconvolution {:?} -> {:?} exceeds 32-bit GPU indexing",
                g.x_shape(),
                g.y_shape()
            )));
        }
        Ok(())
    }

    fn launched(result: Option<crate::gpu::GpuBuffer>, what: &str) -> Result<Storage> {
        result
            .map(Storage::from_gpu_buffer)
            .ok_or_else(|| DeconvError::DeviceError(format!("GPU {what} kernel failed")))
    }
}

#[cfg(feature = "gpu")]
impl DeconvBackend for GpuBackend {
    fn deconv_forward(
        &self,
        x: &Storage,
        w: &Storage,
        bias: Option<&Storage>,
        g: &DeconvGeometry,
        algo: DeconvAlgo,
    ) -> Result<Storage> {
        use crate::gpu::GpuKernels;
        Self::check_indexable(g)?;
        let x = Self::device_buf(x, "deconv input", g.x_len())?;
        let w = Self::device_buf(w, "deconv weight", g.w_len())?;
        let b = bias
            .map(|b| Self::device_buf(b, "deconv bias", g.out_channels))
            .transpose()?;
        log::debug!("gpu deconv forward ({algo}) {:?} -> {:?}", g.x_shape(), g.y_shape());
        Self::launched(GpuKernels::deconv_forward(x, w, b, g, algo), "forward")
    }

    fn conv2d_backward_input(
        &self,
        gy: &Storage,
        w: &Storage,
        g: &DeconvGeometry,
    ) -> Result<Storage> {
        use crate::gpu::GpuKernels;
        Self::check_indexable(g)?;
        let gy = Self::device_buf(gy, "output gradient", g.y_len())?;
        let w = Self::device_buf(w, "deconv weight", g.w_len())?;
        Self::launched(GpuKernels::conv_backward_input(gy, w, g), "input gradient")
    }

    fn weight_grad(&self, x: &Storage, gy: &Storage, g: &DeconvGeometry) -> Result<Storage> {
        use crate::gpu::GpuKernels;
        Self::check_indexable(g)?;
        let x = Self::device_buf(x, "deconv input", g.x_len())?;
        let gy = Self::device_buf(gy, "output gradient", g.y_len())?;
        Self::launched(GpuKernels::weight_grad(x, gy, g), "weight gradient")
    }

    fn bias_grad(&self, gy: &Storage, g: &DeconvGeometry) -> Result<Storage> {
        use crate::gpu::GpuKernels;
        Self::check_indexable(g)?;
        let gy = Self::device_buf(gy, "output gradient", g.y_len())?;
        Self::launched(GpuKernels::bias_grad(gy, g), "bias gradient")
    }
}

// ===== DISPATCH =====

/// The executor for a device
#[derive(Debug, Clone, Copy)]
pub enum Executor {
    Cpu(CpuBackend),
    #[cfg(feature = "gpu")]
    Gpu(GpuBackend),
}

impl Executor {
    /// # Errors
    /// `DeviceError` for a GPU device when the `gpu` feature is disabled or no
    /// adapter is available.
    pub fn for_device(device: &Device) -> Result<Self> {
        match device {
            Device::CPU => Ok(Executor::Cpu(CpuBackend)),
            #[cfg(feature = "gpu")]
            Device::GPU(_) if crate::gpu::is_gpu_available() => Ok(Executor::Gpu(GpuBackend)),
            Device::GPU(name) => Err(DeconvError::DeviceError(format!(
                "GPU executor unavailable for {name}"
            ))),
        }
    }
}

impl DeconvBackend for Executor {
    fn deconv_forward(
        &self,
        x: &Storage,
        w: &Storage,
        bias: Option<&Storage>,
        g: &DeconvGeometry,
        algo: DeconvAlgo,
    ) -> Result<Storage> {
        match self {
            Executor::Cpu(b) => b.deconv_forward(x, w, bias, g, algo),
            #[cfg(feature = "gpu")]
            Executor::Gpu(b) => b.deconv_forward(x, w, bias, g, algo),
        }
    }

    fn conv2d_backward_input(
        &self,
        gy: &Storage,
        w: &Storage,
        g: &DeconvGeometry,
    ) -> Result<Storage> {
        match self {
            Executor::Cpu(b) => b.conv2d_backward_input(gy, w, g),
            #[cfg(feature = "gpu")]
            Executor::Gpu(b) => b.conv2d_backward_input(gy, w, g),
        }
    }

    fn weight_grad(&self, x: &Storage, gy: &Storage, g: &DeconvGeometry) -> Result<Storage> {
        match self {
            Executor::Cpu(b) => b.weight_grad(x, gy, g),
            #[cfg(feature = "gpu")]
            Executor::Gpu(b) => b.weight_grad(x, gy, g),
        }
    }

    fn bias_grad(&self, gy: &Storage, g: &DeconvGeometry) -> Result<Storage> {
        match self {
            Executor::Cpu(b) => b.bias_grad(gy, g),
            #[cfg(feature = "gpu")]
            Executor::Gpu(b) => b.bias_grad(gy, g),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn geometry() -> DeconvGeometry {
        DeconvGeometry::new(&[1, 2, 2, 2], &[2, 1, 3, 3], Pair::from(2), Pair::from(1)).unwrap()
    }

    #[test]
    fn test_algo_parse() {
        assert_eq!("fused".parse::<DeconvAlgo>().unwrap(), DeconvAlgo::Fused);
        assert_eq!(" Col2im ".parse::<DeconvAlgo>().unwrap(), DeconvAlgo::Col2im);
        assert!("winograd".parse::<DeconvAlgo>().is_err());
        assert_eq!(DeconvAlgo::Col2im.to_string(), "col2im");
    }

    #[test]
    fn test_algo_serde() {
        let a: DeconvAlgo = serde_json::from_str("\"col2im\"").unwrap();
        assert_eq!(a, DeconvAlgo::Col2im);
        assert_eq!(serde_json::to_string(&DeconvAlgo::Fused).unwrap(), "\"fused\"");
    }

    #[test]
    fn test_cpu_backend_rejects_f64() {
        let g = geometry();
        let x = Storage::cpu_f64(vec![0.0; g.x_len()]);
        let w = Storage::cpu(vec![0.0; g.w_len()]);
        let err = CpuBackend
            .deconv_forward(&x, &w, None, &g, DeconvAlgo::Fused)
            .unwrap_err();
        assert!(matches!(err, DeconvError::UnsupportedDtype { .. }));
    }

    #[test]
    fn test_cpu_backend_checks_lengths() {
        let g = geometry();
        let x = Storage::cpu(vec![0.0; g.x_len()]);
        let gy = Storage::cpu(vec![0.0; g.y_len() + 1]);
        let err = CpuBackend.weight_grad(&x, &gy, &g).unwrap_err();
        assert!(matches!(err, DeconvError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_executor_dispatch_matches_backend() {
        let g = geometry();
        let x = Storage::cpu((0..g.x_len()).map(|i| i as f32 * 0.1).collect());
        let w = Storage::cpu((0..g.w_len()).map(|i| 0.5 - i as f32 * 0.05).collect());
        let exec = Executor::for_device(&Device::CPU).unwrap();
        let a = exec
            .deconv_forward(&x, &w, None, &g, DeconvAlgo::Col2im)
            .unwrap();
        let b = CpuBackend
            .deconv_forward(&x, &w, None, &g, DeconvAlgo::Col2im)
            .unwrap();
        assert_eq!(a.to_vec(), b.to_vec());
    }

    #[cfg(feature = "gpu")]
    #[test]
    fn test_gpu_backend_rejects_unindexable_geometry() {
        // Checked before any buffer is touched, so no adapter is needed
        let g = DeconvGeometry {
            batch: 1 << 16,
            out_channels: 1 << 16,
            ..geometry()
        };
        let empty = Storage::cpu(Vec::new());
        let results = [
            GpuBackend.deconv_forward(&empty, &empty, None, &g, DeconvAlgo::Col2im),
            GpuBackend.conv2d_backward_input(&empty, &empty, &g),
            GpuBackend.weight_grad(&empty, &empty, &g),
            GpuBackend.bias_grad(&empty, &g),
        ];
        for result in results {
            assert!(matches!(result, Err(DeconvError::DeviceError(_))));
        }
    }

    #[cfg(not(feature = "gpu"))]
    #[test]
    fn test_gpu_executor_unavailable_without_feature() {
        let err = Executor::for_device(&Device::GPU("any".into())).unwrap_err();
        assert!(matches!(err, DeconvError::DeviceError(_)));
    }
}
