use std::fmt;

/// Compute device for tensor storage and operator execution
///
/// `CPU` is the reference executor. `GPU` carries the adapter name and is
/// only reachable when the `gpu` feature is enabled and an adapter exists.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Device {
    #[default]
    CPU,
    GPU(String),
}

impl Device {
    /// The first available GPU, if any
    #[cfg(feature = "gpu")]
    #[must_use]
    pub fn gpu() -> Option<Device> {
        crate::gpu::get_gpu_context().map(|ctx| Device::GPU(ctx.device_name().to_string()))
    }

    #[cfg(not(feature = "gpu"))]
    #[must_use]
    pub fn gpu() -> Option<Device> {
        None
    }

    #[must_use]
    pub fn is_gpu(&self) -> bool {
        matches!(self, Device::GPU(_))
    }

    #[must_use]
    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::CPU)
    }

    /// Two devices share a memory space. All GPU handles point at the single
    /// process-wide context, so adapter names are not compared.
    #[must_use]
    pub fn same_space(&self, other: &Device) -> bool {
        self.is_gpu() == other.is_gpu()
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::CPU => write!(f, "cpu"),
            Device::GPU(name) => write!(f, "gpu({name})"),
        }
    }
}
