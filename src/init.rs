//! Parameter initializers
//!
//! Fans follow the deconvolution weight layout `[C_in, C_out, kH, kW]`:
//! `fan_in = C_out * kH * kW` and `fan_out = C_in * kH * kW`.

use crate::error::{DeconvError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};

/// How to fill a parameter tensor
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Initializer {
    /// U[low, high)
    Uniform { low: f32, high: f32 },
    /// N(mean, std²)
    Normal { mean: f32, std: f32 },
    Constant { value: f32 },
    Zeros,
    /// N(0, 2 / fan_in)
    HeNormal,
    /// U[-limit, limit] with limit = sqrt(6 / (fan_in + fan_out))
    #[default]
    GlorotUniform,
}

/// `(fan_in, fan_out)` of a parameter shape
///
/// 1-D shapes (biases) count as both fans.
pub fn fans(shape: &[usize]) -> (usize, usize) {
    match shape {
        [] => (1, 1),
        [n] => (*n, *n),
        [first, second, rest @ ..] => {
            let receptive: usize = rest.iter().product();
            (second * receptive, first * receptive)
        }
    }
}

impl Initializer {
    /// Zero-fill, for use as a serde default
    pub fn zeros() -> Self {
        Initializer::Zeros
    }

    /// Reject parameters no distribution can be built from
    pub fn validate(&self) -> Result<()> {
        match *self {
            Initializer::Uniform { low, high }
                if !(low.is_finite() && high.is_finite() && low < high) => Err(
                DeconvError::InvalidParameter(format!("uniform range [{low}, {high}) is empty")),
            ),
            Initializer::Normal { std, .. } if !(std.is_finite() && std >= 0.0) => Err(
                DeconvError::InvalidParameter(format!("normal std {std} must be finite and >= 0")),
            ),
            _ => Ok(()),
        }
    }

    /// Draw `shape.product()` values from `rng`
    pub fn sample<R: Rng>(&self, shape: &[usize], rng: &mut R) -> Result<Vec<f32>> {
        self.validate()?;
        let size: usize = shape.iter().product();
        let (fan_in, fan_out) = fans(shape);
        let data = match *self {
            Initializer::Uniform { low, high } => {
                (0..size).map(|_| rng.random_range(low..high)).collect()
            }
            Initializer::Normal { mean, std } => normal(mean, std, size, rng)?,
            Initializer::Constant { value } => vec![value; size],
            Initializer::Zeros => vec![0.0; size],
            Initializer::HeNormal => {
                let std = (2.0 / fan_in.max(1) as f32).sqrt();
                normal(0.0, std, size, rng)?
            }
            Initializer::GlorotUniform => {
                let limit = (6.0 / (fan_in + fan_out).max(1) as f32).sqrt();
                (0..size).map(|_| rng.random_range(-limit..=limit)).collect()
            }
        };
        Ok(data)
    }

    /// Draw from a fresh generator, seeded when `seed` is given
    pub fn init(&self, shape: &[usize], seed: Option<u64>) -> Result<Vec<f32>> {
        let mut rng = seeded_rng(seed);
        self.sample(shape, &mut rng)
    }
}

fn normal<R: Rng>(mean: f32, std: f32, size: usize, rng: &mut R) -> Result<Vec<f32>> {
    let dist =
        Normal::new(mean, std).map_err(|e| DeconvError::InvalidParameter(e.to_string()))?;
    Ok((0..size).map(|_| dist.sample(rng)).collect())
}

/// A `StdRng` from `seed`, or from the thread generator when absent
pub fn seeded_rng(seed: Option<u64>) -> StdRng {
    match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_rng(&mut rand::rng()),
    }
}
