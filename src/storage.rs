//! Tensor storage abstraction
//!
//! This module provides a unified interface for tensor data storage
//! that can be backed by either CPU memory or GPU buffers.

#[cfg(feature = "gpu")]
use crate::gpu::{GpuBuffer, GpuKernels};

use crate::device::Device;
use crate::dtype::DType;
use crate::error::{DeconvError, Result};

/// Storage backend for tensor data
///
/// CPU storage is a plain `Vec`. GPU storage holds a `GpuBuffer` plus an
/// optional host copy that is populated when the data originated on the host.
#[derive(Clone)]
pub enum Storage {
    /// f32 data in main memory
    Cpu(Vec<f32>),

    /// f64 data in main memory. Never accepted by the operator.
    CpuF64(Vec<f64>),

    /// f32 data in GPU memory
    #[cfg(feature = "gpu")]
    Gpu {
        /// The GPU buffer (wrapped in Arc for cheap cloning)
        buffer: std::sync::Arc<GpuBuffer>,
        /// Host copy of the buffer contents, if one is known
        cpu_cache: Option<Vec<f32>>,
    },
}

impl Storage {
    /// Create new CPU storage from data
    pub fn cpu(data: Vec<f32>) -> Self {
        Storage::Cpu(data)
    }

    pub fn cpu_f64(data: Vec<f64>) -> Self {
        Storage::CpuF64(data)
    }

    /// Upload data to the GPU
    ///
    /// # Errors
    /// `DeviceError` when the `gpu` feature is disabled or no adapter exists.
    #[cfg(feature = "gpu")]
    pub fn gpu(data: Vec<f32>) -> Result<Self> {
        let buffer = GpuBuffer::from_slice(&data)
            .ok_or_else(|| DeconvError::DeviceError("GPU not available".to_string()))?;
        Ok(Storage::Gpu {
            buffer: std::sync::Arc::new(buffer),
            cpu_cache: Some(data),
        })
    }

    #[cfg(not(feature = "gpu"))]
    pub fn gpu(_data: Vec<f32>) -> Result<Self> {
        Err(DeconvError::DeviceError(
            "GPU feature not enabled".to_string(),
        ))
    }

    /// Wrap a freshly computed GPU buffer
    #[cfg(feature = "gpu")]
    pub(crate) fn from_gpu_buffer(buffer: GpuBuffer) -> Self {
        Storage::Gpu {
            buffer: std::sync::Arc::new(buffer),
            cpu_cache: None,
        }
    }

    /// Element type of this storage
    pub fn dtype(&self) -> DType {
        match self {
            Storage::Cpu(_) => DType::F32,
            Storage::CpuF64(_) => DType::F64,
            #[cfg(feature = "gpu")]
            Storage::Gpu { .. } => DType::F32,
        }
    }

    /// Host f32 view, available for CPU storage and for GPU storage with a
    /// populated host copy
    pub fn as_slice(&self) -> Option<&[f32]> {
        match self {
            Storage::Cpu(data) => Some(data),
            Storage::CpuF64(_) => None,
            #[cfg(feature = "gpu")]
            Storage::Gpu { cpu_cache, .. } => cpu_cache.as_deref(),
        }
    }

    /// Convert to Vec<f32> (triggers GPU->CPU transfer if needed)
    ///
    /// f64 storage is narrowed; this is for inspection only.
    pub fn to_vec(&self) -> Vec<f32> {
        match self {
            Storage::Cpu(data) => data.clone(),
            Storage::CpuF64(data) => data.iter().map(|&v| v as f32).collect(),
            #[cfg(feature = "gpu")]
            Storage::Gpu { buffer, cpu_cache } => {
                cpu_cache.clone().unwrap_or_else(|| buffer.to_vec())
            }
        }
    }

    /// Get the length
    pub fn len(&self) -> usize {
        match self {
            Storage::Cpu(data) => data.len(),
            Storage::CpuF64(data) => data.len(),
            #[cfg(feature = "gpu")]
            Storage::Gpu { buffer, .. } => buffer.len(),
        }
    }

    /// Check if empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Check if this is GPU storage
    pub fn is_gpu(&self) -> bool {
        match self {
            Storage::Cpu(_) | Storage::CpuF64(_) => false,
            #[cfg(feature = "gpu")]
            Storage::Gpu { .. } => true,
        }
    }

    /// Copy to a specific device. The source is left untouched.
    ///
    /// # Errors
    /// `UnsupportedDtype` when moving f64 data to the GPU, `DeviceError` when
    /// the GPU is unavailable.
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        match (self, device) {
            (Storage::CpuF64(data), Device::CPU) => Ok(Storage::CpuF64(data.clone())),
            (Storage::CpuF64(_), Device::GPU(_)) => Err(DeconvError::UnsupportedDtype {
                expected: DType::F32,
                actual: DType::F64,
            }),
            (_, Device::CPU) => Ok(Storage::Cpu(self.to_vec())),
            (_, Device::GPU(_)) => Storage::gpu(self.to_vec()),
        }
    }

    /// Zero-filled storage of the same length, dtype and device
    pub fn zeros_like(&self) -> Result<Self> {
        match self {
            Storage::Cpu(data) => Ok(Storage::Cpu(vec![0.0; data.len()])),
            Storage::CpuF64(data) => Ok(Storage::CpuF64(vec![0.0; data.len()])),
            #[cfg(feature = "gpu")]
            Storage::Gpu { buffer, .. } => Storage::gpu(vec![0.0; buffer.len()]),
        }
    }

    /// `self += other`, element-wise, on whichever device both live on
    ///
    /// # Errors
    /// `ShapeMismatch` on length disagreement, `DeviceMismatch` when the
    /// storages live in different memory spaces.
    pub fn accumulate(&mut self, other: &Storage) -> Result<()> {
        if self.len() != other.len() {
            return Err(DeconvError::shape(
                "gradient accumulation",
                &[self.len()],
                &[other.len()],
            ));
        }
        #[cfg(feature = "gpu")]
        if let (Some(acc), Some(add)) = (self.gpu_buffer(), other.gpu_buffer()) {
            let sum = GpuKernels::add(acc, add).ok_or_else(|| {
                DeconvError::DeviceError("GPU gradient accumulation failed".to_string())
            })?;
            *self = Storage::from_gpu_buffer(sum);
            return Ok(());
        }
        match (self, other) {
            (Storage::Cpu(acc), Storage::Cpu(add)) => {
                for (a, b) in acc.iter_mut().zip(add.iter()) {
                    *a += *b;
                }
                Ok(())
            }
            (acc, add) => Err(DeconvError::DeviceMismatch {
                expected: acc.device_kind(),
                actual: add.device_kind(),
            }),
        }
    }

    /// Coarse device of this storage, for error reporting
    pub(crate) fn device_kind(&self) -> Device {
        if self.is_gpu() {
            Device::GPU(String::new())
        } else {
            Device::CPU
        }
    }

    /// Get the GPU buffer if this is GPU storage
    #[cfg(feature = "gpu")]
    pub fn gpu_buffer(&self) -> Option<&GpuBuffer> {
        match self {
            Storage::Gpu { buffer, .. } => Some(buffer.as_ref()),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Storage::Cpu(data) => write!(f, "Storage::Cpu({} elements)", data.len()),
            Storage::CpuF64(data) => write!(f, "Storage::CpuF64({} elements)", data.len()),
            #[cfg(feature = "gpu")]
            Storage::Gpu { buffer, .. } => write!(f, "Storage::Gpu({} elements)", buffer.len()),
        }
    }
}
