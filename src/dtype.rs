//! Data type tags for tensor storage
//!
//! The operator computes in 32-bit floats only. `F64` exists so that callers
//! can hand in double-precision data and get a clean `UnsupportedDtype`
//! error instead of a silent conversion.

use crate::error::{DeconvError, Result};
use std::fmt;

/// Element type of a tensor's storage
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum DType {
    /// 32-bit floating point (the only compute type)
    #[default]
    F32 = 0,
    /// 64-bit floating point
    F64 = 1,
}

impl DType {
    /// Returns the name of this dtype as a string
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            DType::F32 => "f32",
            DType::F64 => "f64",
        }
    }

    /// Fail unless `actual` is f32.
    pub fn ensure_f32(actual: DType) -> Result<()> {
        if actual == DType::F32 {
            Ok(())
        } else {
            Err(DeconvError::UnsupportedDtype {
                expected: DType::F32,
                actual,
            })
        }
    }
}

impl fmt::Display for DType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}
