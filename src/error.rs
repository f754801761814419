use crate::device::Device;
use crate::dtype::DType;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeconvError {
    #[error("Shape mismatch in {context}: expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        context: &'static str,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },

    #[error("Unsupported dtype: expected {expected}, got {actual}")]
    UnsupportedDtype { expected: DType, actual: DType },

    #[error("Device mismatch: operator lives on {expected}, tensor lives on {actual}")]
    DeviceMismatch { expected: Device, actual: Device },

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Device error: {0}")]
    DeviceError(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl DeconvError {
    pub(crate) fn shape(context: &'static str, expected: &[usize], actual: &[usize]) -> Self {
        DeconvError::ShapeMismatch {
            context,
            expected: expected.to_vec(),
            actual: actual.to_vec(),
        }
    }
}

impl From<serde_json::Error> for DeconvError {
    fn from(e: serde_json::Error) -> Self {
        DeconvError::Config(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DeconvError>;
