//! Output-size laws and validated shape bundles
//!
//! Convolution:   out = floor((in + 2*pad - k) / stride) + 1
//! Deconvolution: out = stride * (in - 1) + k - 2*pad
//!
//! The second is the inverse of the first on every input size for which the
//! convolution's division is exact.

use crate::error::{DeconvError, Result};
use serde::{Deserialize, Serialize};

/// A scalar-or-pair spatial parameter (kernel size, stride, padding)
///
/// Deserializes from either `3` or `[3, 2]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "PairRepr", into = "[usize; 2]")]
pub struct Pair {
    pub h: usize,
    pub w: usize,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum PairRepr {
    Scalar(usize),
    Pair([usize; 2]),
}

impl From<PairRepr> for Pair {
    fn from(r: PairRepr) -> Self {
        match r {
            PairRepr::Scalar(v) => Pair::from(v),
            PairRepr::Pair(p) => Pair::from(p),
        }
    }
}

impl From<usize> for Pair {
    fn from(v: usize) -> Self {
        Pair { h: v, w: v }
    }
}

impl From<(usize, usize)> for Pair {
    fn from((h, w): (usize, usize)) -> Self {
        Pair { h, w }
    }
}

impl From<[usize; 2]> for Pair {
    fn from([h, w]: [usize; 2]) -> Self {
        Pair { h, w }
    }
}

impl From<Pair> for [usize; 2] {
    fn from(p: Pair) -> Self {
        [p.h, p.w]
    }
}

fn overflow(size: usize, k: usize, s: usize, p: usize) -> DeconvError {
    DeconvError::InvalidParameter(format!(
        "size {size} with kernel {k}, stride {s}, pad {p} overflows usize"
    ))
}

/// Output size of a convolution along one spatial axis
///
/// # Errors
/// `InvalidParameter` for a zero stride, a kernel larger than the padded
/// input, or sizes whose arithmetic overflows.
pub fn get_conv_outsize(size: usize, k: usize, s: usize, p: usize) -> Result<usize> {
    if s == 0 {
        return Err(DeconvError::InvalidParameter("stride must be positive".into()));
    }
    let padded = p
        .checked_mul(2)
        .and_then(|d| size.checked_add(d))
        .ok_or_else(|| overflow(size, k, s, p))?;
    if padded < k {
        return Err(DeconvError::InvalidParameter(format!(
            "kernel {k} larger than padded input {size}+2*{p}"
        )));
    }
    Ok((padded - k) / s + 1)
}

/// Output size of a deconvolution along one spatial axis
///
/// # Errors
/// `InvalidParameter` for a zero stride, an empty input, padding that crops
/// the whole output away, or sizes whose arithmetic overflows.
pub fn get_deconv_outsize(size: usize, k: usize, s: usize, p: usize) -> Result<usize> {
    if s == 0 {
        return Err(DeconvError::InvalidParameter("stride must be positive".into()));
    }
    if size == 0 {
        return Err(DeconvError::InvalidParameter("input size must be positive".into()));
    }
    let full = s
        .checked_mul(size - 1)
        .and_then(|v| v.checked_add(k))
        .ok_or_else(|| overflow(size, k, s, p))?;
    let crop = p.checked_mul(2).ok_or_else(|| overflow(size, k, s, p))?;
    if full <= crop {
        return Err(DeconvError::InvalidParameter(format!(
            "padding {p} crops the whole output of size {full}"
        )));
    }
    Ok(full - crop)
}

/// Every size a deconvolution kernel needs, validated once
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeconvGeometry {
    pub batch: usize,
    pub in_channels: usize,
    pub out_channels: usize,
    pub in_h: usize,
    pub in_w: usize,
    pub out_h: usize,
    pub out_w: usize,
    pub kernel: Pair,
    pub stride: Pair,
    pub pad: Pair,
}

impl DeconvGeometry {
    /// Build the geometry from an input shape `(N, C_in, H, W)` and a weight
    /// shape `(C_in, C_out, kH, kW)`.
    ///
    /// # Errors
    /// `ShapeMismatch` for non-4-D shapes or disagreeing channel counts,
    /// `InvalidParameter` when the output size law has no solution.
    pub fn new(x_shape: &[usize], w_shape: &[usize], stride: Pair, pad: Pair) -> Result<Self> {
        let [batch, in_channels, in_h, in_w] = *x_shape else {
            return Err(DeconvError::shape("deconv input rank", &[0; 4], x_shape));
        };
        let [w_in, out_channels, kh, kw] = *w_shape else {
            return Err(DeconvError::shape("deconv weight rank", &[0; 4], w_shape));
        };
        if w_in != in_channels {
            return Err(DeconvError::ShapeMismatch {
                context: "deconv input channels",
                expected: vec![batch, w_in, in_h, in_w],
                actual: x_shape.to_vec(),
            });
        }
        let out_h = get_deconv_outsize(in_h, kh, stride.h, pad.h)?;
        let out_w = get_deconv_outsize(in_w, kw, stride.w, pad.w)?;
        Ok(DeconvGeometry {
            batch,
            in_channels,
            out_channels,
            in_h,
            in_w,
            out_h,
            out_w,
            kernel: Pair { h: kh, w: kw },
            stride,
            pad,
        })
    }

    pub fn x_shape(&self) -> [usize; 4] {
        [self.batch, self.in_channels, self.in_h, self.in_w]
    }

    pub fn w_shape(&self) -> [usize; 4] {
        [self.in_channels, self.out_channels, self.kernel.h, self.kernel.w]
    }

    pub fn y_shape(&self) -> [usize; 4] {
        [self.batch, self.out_channels, self.out_h, self.out_w]
    }

    pub fn x_len(&self) -> usize {
        self.x_shape().iter().product()
    }

    pub fn w_len(&self) -> usize {
        self.w_shape().iter().product()
    }

    pub fn y_len(&self) -> usize {
        self.y_shape().iter().product()
    }

    /// Fail unless `gy_shape` equals the forward output shape
    pub fn check_output_grad(&self, gy_shape: &[usize]) -> Result<()> {
        if gy_shape != self.y_shape() {
            return Err(DeconvError::shape("output gradient", &self.y_shape(), gy_shape));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deconv_outsize_formula() {
        for size in 1..8 {
            for k in 1..5 {
                for s in 1..4 {
                    for p in 0..k {
                        let full = s * (size - 1) + k;
                        match get_deconv_outsize(size, k, s, p) {
                            Ok(out) => assert_eq!(out, full - 2 * p),
                            Err(_) => assert!(full <= 2 * p),
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_deconv_inverts_conv_on_admissible_sizes() {
        for n in 1..20 {
            for k in 1..6 {
                for s in 1..4 {
                    for p in 0..3 {
                        if n + 2 * p < k || (n + 2 * p - k) % s != 0 {
                            continue;
                        }
                        let c = get_conv_outsize(n, k, s, p).unwrap();
                        assert_eq!(get_deconv_outsize(c, k, s, p).unwrap(), n, "n={n} k={k} s={s} p={p}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_reference_case() {
        // h=3, w=2, k=3, s=2, p=1
        assert_eq!(get_deconv_outsize(3, 3, 2, 1).unwrap(), 5);
        assert_eq!(get_deconv_outsize(2, 3, 2, 1).unwrap(), 3);
    }

    #[test]
    fn test_zero_stride_rejected() {
        assert!(get_deconv_outsize(3, 3, 0, 0).is_err());
        assert!(get_conv_outsize(3, 3, 0, 0).is_err());
    }

    #[test]
    fn test_overflowing_sizes_rejected() {
        for result in [
            get_deconv_outsize(usize::MAX, 3, 2, 0),
            get_deconv_outsize(2, usize::MAX, 1, 0),
            get_deconv_outsize(3, 3, 1, usize::MAX / 2 + 1),
            get_conv_outsize(3, 3, 1, usize::MAX / 2 + 1),
            get_conv_outsize(usize::MAX, 1, 1, 1),
        ] {
            assert!(matches!(result, Err(DeconvError::InvalidParameter(_))));
        }
        let err = DeconvGeometry::new(&[1, 1, usize::MAX, 2], &[1, 1, 3, 3], 2.into(), 0.into()).unwrap_err();
        assert!(matches!(err, DeconvError::InvalidParameter(_)));
        // Largest sizes that still fit are accepted
        assert_eq!(get_deconv_outsize(usize::MAX - 2, 3, 1, 0).unwrap(), usize::MAX);
    }

    #[test]
    fn test_geometry_channel_mismatch() {
        let err = DeconvGeometry::new(&[2, 4, 3, 3], &[3, 2, 3, 3], 1.into(), 0.into()).unwrap_err();
        assert!(matches!(err, DeconvError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_geometry_shapes() {
        let g = DeconvGeometry::new(&[2, 3, 3, 2], &[3, 2, 3, 3], 2.into(), 1.into()).unwrap();
        assert_eq!(g.y_shape(), [2, 2, 5, 3]);
        assert!(g.check_output_grad(&[2, 2, 5, 3]).is_ok());
        assert!(g.check_output_grad(&[2, 2, 5, 4]).is_err());
    }

    #[test]
    fn test_pair_deserialize() {
        let a: Pair = serde_json::from_str("3").unwrap();
        let b: Pair = serde_json::from_str("[3, 2]").unwrap();
        assert_eq!(a, Pair { h: 3, w: 3 });
        assert_eq!(b, Pair { h: 3, w: 2 });
    }
}
