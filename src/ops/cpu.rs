//! Reference CPU kernels
//!
//! Layouts are row-major throughout:
//! - x:   [N, C_in, H, W]
//! - w:   [C_in, C_out, kH, kW]
//! - y:   [N, C_out, out_H, out_W]
//! - col: [C_out*kH*kW, H*W] per batch item
//!
//! Every function here assumes its slices already match the geometry; the
//! backend layer checks lengths before calling in.

use super::geometry::DeconvGeometry;

// ===== DENSE HELPERS =====

/// Transpose a row-major [m, n] matrix into [n, m]
pub fn transpose_2d(data: &[f32], m: usize, n: usize) -> Vec<f32> {
    let mut result = vec![0.0; m * n];
    for i in 0..m {
        for j in 0..n {
            result[j * m + i] = data[i * n + j];
        }
    }
    result
}

/// Raw matrix multiplication: (m,k) @ (k,n) -> (m,n)
///
/// Naive O(mnk), i-p-j loop order so the inner loop walks both `b` and the
/// output contiguously.
pub fn matmul_raw(a: &[f32], b: &[f32], m: usize, k: usize, n: usize) -> Vec<f32> {
    let mut result = vec![0.0; m * n];
    for i in 0..m {
        let out_row = &mut result[i * n..(i + 1) * n];
        for p in 0..k {
            let a_ip = a[i * k + p];
            if a_ip == 0.0 {
                continue;
            }
            let b_row = &b[p * n..(p + 1) * n];
            for (o, &bv) in out_row.iter_mut().zip(b_row) {
                *o += a_ip * bv;
            }
        }
    }
    result
}

// ===== IM2COL / COL2IM =====

/// Unfold one image [C, H, W] into a column matrix [C*kH*kW, out_H*out_W]
///
/// `col[(c, ky, kx), (oy, ox)] = img[c, oy*s + ky - p, ox*s + kx - p]`, zero
/// where the window hangs over the padding.
#[allow(clippy::too_many_arguments)]
pub fn im2col(
    img: &[f32],
    channels: usize,
    (h, w): (usize, usize),
    (out_h, out_w): (usize, usize),
    (kh, kw): (usize, usize),
    (sh, sw): (usize, usize),
    (ph, pw): (usize, usize),
) -> Vec<f32> {
    let cols = out_h * out_w;
    let mut col = vec![0.0; channels * kh * kw * cols];
    for c in 0..channels {
        for ky in 0..kh {
            for kx in 0..kw {
                let row = (c * kh + ky) * kw + kx;
                for oy in 0..out_h {
                    let Some(iy) = (oy * sh + ky).checked_sub(ph).filter(|&v| v < h) else {
                        continue;
                    };
                    for ox in 0..out_w {
                        let Some(ix) = (ox * sw + kx).checked_sub(pw).filter(|&v| v < w) else {
                            continue;
                        };
                        col[row * cols + oy * out_w + ox] = img[(c * h + iy) * w + ix];
                    }
                }
            }
        }
    }
    col
}

/// Scatter-add a column matrix [C_out*kH*kW, H*W] into one output image
/// [C_out, out_H, out_W], cropping the `pad` border
pub fn col2im(col: &[f32], g: &DeconvGeometry, out: &mut [f32]) {
    let (kh, kw) = (g.kernel.h, g.kernel.w);
    let hw = g.in_h * g.in_w;
    for co in 0..g.out_channels {
        let plane = &mut out[co * g.out_h * g.out_w..(co + 1) * g.out_h * g.out_w];
        for ky in 0..kh {
            for kx in 0..kw {
                let row = (co * kh + ky) * kw + kx;
                let src = &col[row * hw..(row + 1) * hw];
                for iy in 0..g.in_h {
                    let Some(oy) = (iy * g.stride.h + ky)
                        .checked_sub(g.pad.h)
                        .filter(|&v| v < g.out_h)
                    else {
                        continue;
                    };
                    for ix in 0..g.in_w {
                        let Some(ox) = (ix * g.stride.w + kx)
                            .checked_sub(g.pad.w)
                            .filter(|&v| v < g.out_w)
                        else {
                            continue;
                        };
                        plane[oy * g.out_w + ox] += src[iy * g.in_w + ix];
                    }
                }
            }
        }
    }
}

fn add_bias(y: &mut [f32], bias: Option<&[f32]>, g: &DeconvGeometry) {
    let Some(bias) = bias else {
        return;
    };
    let plane = g.out_h * g.out_w;
    for (i, chunk) in y.chunks_mut(plane).enumerate() {
        let b = bias[i % g.out_channels];
        for v in chunk {
            *v += b;
        }
    }
}

// ===== FORWARD =====

/// Deconvolution forward through an explicit column buffer:
/// `col = Wᵀ · x` per batch item, then `col2im`.
pub fn deconv_forward_col2im(
    x: &[f32],
    w: &[f32],
    bias: Option<&[f32]>,
    g: &DeconvGeometry,
) -> Vec<f32> {
    let hw = g.in_h * g.in_w;
    let rows = g.out_channels * g.kernel.h * g.kernel.w;
    let wt = transpose_2d(w, g.in_channels, rows);
    let x_item = g.in_channels * hw;
    let y_item = g.out_channels * g.out_h * g.out_w;

    let mut y = vec![0.0; g.y_len()];
    for n in 0..g.batch {
        let col = matmul_raw(&wt, &x[n * x_item..(n + 1) * x_item], rows, g.in_channels, hw);
        col2im(&col, g, &mut y[n * y_item..(n + 1) * y_item]);
    }
    add_bias(&mut y, bias, g);
    y
}

/// Deconvolution forward as a direct gather: each output pixel pulls from the
/// input pixels whose kernel footprint covers it. No column buffer.
pub fn deconv_forward_fused(
    x: &[f32],
    w: &[f32],
    bias: Option<&[f32]>,
    g: &DeconvGeometry,
) -> Vec<f32> {
    let (kh, kw) = (g.kernel.h, g.kernel.w);
    let mut y = vec![0.0; g.y_len()];
    for n in 0..g.batch {
        for co in 0..g.out_channels {
            let base = bias.map_or(0.0, |b| b[co]);
            for oy in 0..g.out_h {
                for ox in 0..g.out_w {
                    let mut acc = 0.0;
                    for ky in 0..kh {
                        let Some(iy) = source_index(oy, ky, g.stride.h, g.pad.h, g.in_h) else {
                            continue;
                        };
                        for kx in 0..kw {
                            let Some(ix) = source_index(ox, kx, g.stride.w, g.pad.w, g.in_w)
                            else {
                                continue;
                            };
                            for ci in 0..g.in_channels {
                                let xv = x[((n * g.in_channels + ci) * g.in_h + iy) * g.in_w + ix];
                                let wv = w[((ci * g.out_channels + co) * kh + ky) * kw + kx];
                                acc += xv * wv;
                            }
                        }
                    }
                    y[((n * g.out_channels + co) * g.out_h + oy) * g.out_w + ox] = base + acc;
                }
            }
        }
    }
    y
}

/// Input index that lands on output index `o` through kernel tap `k`, if any:
/// solves `i*s + k - p == o` for `0 <= i < size`.
#[inline]
fn source_index(o: usize, k: usize, s: usize, p: usize, size: usize) -> Option<usize> {
    let t = (o + p).checked_sub(k)?;
    if t % s != 0 {
        return None;
    }
    Some(t / s).filter(|&i| i < size)
}

// ===== BACKWARD =====

fn unfold_output_grad(gy_item: &[f32], g: &DeconvGeometry) -> Vec<f32> {
    im2col(
        gy_item,
        g.out_channels,
        (g.out_h, g.out_w),
        (g.in_h, g.in_w),
        (g.kernel.h, g.kernel.w),
        (g.stride.h, g.stride.w),
        (g.pad.h, g.pad.w),
    )
}

/// Input gradient: an ordinary convolution of `gy` with `W`, same stride and
/// padding. Its output size is exactly the deconvolution's input size.
pub fn conv2d_backward_input(gy: &[f32], w: &[f32], g: &DeconvGeometry) -> Vec<f32> {
    let hw = g.in_h * g.in_w;
    let rows = g.out_channels * g.kernel.h * g.kernel.w;
    let y_item = g.out_channels * g.out_h * g.out_w;

    let mut gx = Vec::with_capacity(g.x_len());
    for n in 0..g.batch {
        let col = unfold_output_grad(&gy[n * y_item..(n + 1) * y_item], g);
        gx.extend(matmul_raw(w, &col, g.in_channels, rows, hw));
    }
    gx
}

/// Weight gradient: `gW[ci, co, ky, kx] = Σ x[n, ci, iy, ix] · gy[n, co, iy*s+ky-p, ix*s+kx-p]`
pub fn weight_grad(x: &[f32], gy: &[f32], g: &DeconvGeometry) -> Vec<f32> {
    let hw = g.in_h * g.in_w;
    let rows = g.out_channels * g.kernel.h * g.kernel.w;
    let x_item = g.in_channels * hw;
    let y_item = g.out_channels * g.out_h * g.out_w;

    let mut gw = vec![0.0; g.w_len()];
    for n in 0..g.batch {
        let col = unfold_output_grad(&gy[n * y_item..(n + 1) * y_item], g);
        let col_t = transpose_2d(&col, rows, hw);
        let part = matmul_raw(&x[n * x_item..(n + 1) * x_item], &col_t, g.in_channels, hw, rows);
        for (acc, v) in gw.iter_mut().zip(part) {
            *acc += v;
        }
    }
    gw
}

/// Bias gradient: `gy` summed over batch and both spatial axes
pub fn bias_grad(gy: &[f32], g: &DeconvGeometry) -> Vec<f32> {
    let plane = g.out_h * g.out_w;
    let mut gb = vec![0.0; g.out_channels];
    for (i, chunk) in gy.chunks(plane).enumerate() {
        gb[i % g.out_channels] += chunk.iter().sum::<f32>();
    }
    gb
}
