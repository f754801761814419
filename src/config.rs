//! Constructor-time configuration for `Deconvolution2D`
//!
//! ```json
//! { "in_channels": 3, "out_channels": 2, "ksize": 3, "stride": 2, "pad": 1,
//!   "algo": "col2im", "initializer": { "kind": "he_normal" }, "seed": 0 }
//! ```

use crate::error::{DeconvError, Result};
use crate::init::Initializer;
use crate::ops::{DeconvAlgo, Pair};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable that overrides `algo`
pub const ALGO_ENV: &str = "DECONV_ALGO";

fn default_one() -> Pair {
    Pair::from(1)
}

fn default_zero() -> Pair {
    Pair::from(0)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeconvConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub ksize: Pair,
    #[serde(default = "default_one")]
    pub stride: Pair,
    #[serde(default = "default_zero")]
    pub pad: Pair,
    #[serde(default)]
    pub nobias: bool,
    #[serde(default)]
    pub algo: DeconvAlgo,
    /// Weight initializer
    #[serde(default)]
    pub initializer: Initializer,
    #[serde(default = "Initializer::zeros")]
    pub bias_initializer: Initializer,
    /// Seed for both initializers; random when absent
    #[serde(default)]
    pub seed: Option<u64>,
}

impl DeconvConfig {
    /// Square kernel, stride and padding, with every other field defaulted
    pub fn new(
        in_channels: usize,
        out_channels: usize,
        ksize: impl Into<Pair>,
        stride: impl Into<Pair>,
        pad: impl Into<Pair>,
    ) -> Self {
        DeconvConfig {
            in_channels,
            out_channels,
            ksize: ksize.into(),
            stride: stride.into(),
            pad: pad.into(),
            nobias: false,
            algo: DeconvAlgo::default(),
            initializer: Initializer::default(),
            bias_initializer: Initializer::Zeros,
            seed: None,
        }
    }

    pub fn with_nobias(mut self, nobias: bool) -> Self {
        self.nobias = nobias;
        self
    }

    pub fn with_algo(mut self, algo: DeconvAlgo) -> Self {
        self.algo = algo;
        self
    }

    pub fn with_initializer(mut self, initializer: Initializer) -> Self {
        self.initializer = initializer;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Parse and validate a JSON document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: DeconvConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Check that the operator can be built from this configuration
    ///
    /// # Errors
    /// `InvalidParameter` for zero channels, kernel or stride, or a bad
    /// initializer. Padding is checked per call against the input size.
    pub fn validate(&self) -> Result<()> {
        if self.in_channels == 0 || self.out_channels == 0 {
            return Err(DeconvError::InvalidParameter(format!(
                "channels must be positive, got in={} out={}",
                self.in_channels, self.out_channels
            )));
        }
        for (name, p) in [("ksize", self.ksize), ("stride", self.stride)] {
            if p.h == 0 || p.w == 0 {
                return Err(DeconvError::InvalidParameter(format!(
                    "{name} must be positive, got {p:?}"
                )));
            }
        }
        self.initializer.validate()?;
        self.bias_initializer.validate()
    }

    /// Apply `DECONV_ALGO` when it is set
    ///
    /// # Errors
    /// `Config` when the variable holds an unknown algorithm name.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if let Ok(value) = std::env::var(ALGO_ENV) {
            self.algo = value.parse()?;
            log::debug!("{ALGO_ENV} overrides algorithm to {}", self.algo);
        }
        Ok(self)
    }
}
