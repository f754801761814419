//! Finite-difference gradient checking
//!
//! Used by the test suite to validate the analytic backward pass:
//! perturb each input element by ±eps, rerun the forward function, and
//! contract the output difference with the upstream gradient.

use crate::error::{DeconvError, Result};
use crate::tensor::{Tensor, TensorOps};
use std::panic::{AssertUnwindSafe, catch_unwind, resume_unwind};

/// Default absolute tolerance of `assert_allclose`
pub const DEFAULT_ATOL: f32 = 1e-5;
/// Default relative tolerance of `assert_allclose`
pub const DEFAULT_RTOL: f32 = 1e-4;

/// Central-difference gradients of `f` with respect to every tensor in `inputs`
///
/// `f` returns one host vector per output; `grad_outputs` holds the upstream
/// gradient for each. For every input element `i`:
///
/// `grad[i] = Σ_k <f_k(x + eps·e_i) - f_k(x - eps·e_i), gy_k> / (2·eps)`
///
/// Inputs are perturbed in place through their shared handles (so `f` may
/// capture them) and restored before returning. The contraction is done in
/// f64.
pub fn numerical_grad<F>(
    f: F,
    inputs: &[Tensor],
    grad_outputs: &[Vec<f32>],
    eps: f32,
) -> Result<Vec<Vec<f32>>>
where
    F: Fn() -> Result<Vec<Vec<f32>>>,
{
    if !(eps.is_finite() && eps > 0.0) {
        return Err(DeconvError::InvalidParameter(format!(
            "eps must be positive, got {eps}"
        )));
    }

    let contract = |outputs: &[Vec<f32>]| -> Result<f64> {
        if outputs.len() != grad_outputs.len() {
            return Err(DeconvError::shape(
                "numerical_grad outputs",
                &[grad_outputs.len()],
                &[outputs.len()],
            ));
        }
        let mut total = 0.0f64;
        for (y, gy) in outputs.iter().zip(grad_outputs) {
            if y.len() != gy.len() {
                return Err(DeconvError::shape("numerical_grad output", &[gy.len()], &[y.len()]));
            }
            total += y
                .iter()
                .zip(gy)
                .map(|(&a, &b)| f64::from(a) * f64::from(b))
                .sum::<f64>();
        }
        Ok(total)
    };

    let mut grads = Vec::with_capacity(inputs.len());
    for input in inputs {
        let original = input.to_vec();
        let mut grad = vec![0.0; original.len()];
        let mut perturbed = original.clone();

        let result = (|| -> Result<()> {
            for i in 0..original.len() {
                perturbed[i] = original[i] + eps;
                input.set_data(perturbed.clone())?;
                let plus = contract(&f()?)?;

                perturbed[i] = original[i] - eps;
                input.set_data(perturbed.clone())?;
                let minus = contract(&f()?)?;

                perturbed[i] = original[i];
                grad[i] = ((plus - minus) / (2.0 * f64::from(eps))) as f32;
            }
            Ok(())
        })();

        // Restore even when f failed part-way
        input.set_data(original)?;
        result?;
        grads.push(grad);
    }
    Ok(grads)
}

/// Whether `|a - b| <= atol + rtol·|b|` holds element-wise
pub fn allclose(a: &[f32], b: &[f32], atol: f32, rtol: f32) -> bool {
    a.len() == b.len()
        && a
            .iter()
            .zip(b)
            .all(|(&x, &y)| (x - y).abs() <= atol + rtol * y.abs())
}

/// Largest element-wise absolute difference
pub fn max_abs_diff(a: &[f32], b: &[f32]) -> f32 {
    a.iter()
        .zip(b)
        .map(|(x, y)| (x - y).abs())
        .fold(0.0, f32::max)
}

/// Panic unless `a` and `b` agree within the default tolerances
///
/// # Panics
/// On length mismatch or any element outside `atol + rtol·|b|`.
#[track_caller]
pub fn assert_allclose(a: &[f32], b: &[f32]) {
    assert_allclose_tol(a, b, DEFAULT_ATOL, DEFAULT_RTOL);
}

/// `assert_allclose` with explicit tolerances
///
/// # Panics
/// On length mismatch or any element outside `atol + rtol·|b|`.
#[track_caller]
pub fn assert_allclose_tol(a: &[f32], b: &[f32], atol: f32, rtol: f32) {
    assert_eq!(a.len(), b.len(), "length mismatch");
    if let Some((i, (x, y))) = a
        .iter()
        .zip(b)
        .enumerate()
        .find(|(_, (x, y))| (*x - *y).abs() > atol + rtol * y.abs())
    {
        panic!(
            "not close at index {i}: {x} vs {y} (atol={atol}, rtol={rtol}, max abs diff={})",
            max_abs_diff(a, b)
        );
    }
}

/// Compare analytic gradients against `numerical_grad`
///
/// Returns `(max_error, mean_error, passed)` where the error of an element
/// is its excess over `atol + rtol·|numerical|` (zero when within tolerance).
pub fn check_gradients<F>(
    f: F,
    inputs: &[Tensor],
    analytic: &[Vec<f32>],
    grad_outputs: &[Vec<f32>],
    eps: f32,
    atol: f32,
    rtol: f32,
) -> Result<(f32, f32, bool)>
where
    F: Fn() -> Result<Vec<Vec<f32>>>,
{
    if analytic.len() != inputs.len() {
        return Err(DeconvError::shape("analytic gradients", &[inputs.len()], &[analytic.len()]));
    }
    let numerical = numerical_grad(f, inputs, grad_outputs, eps)?;

    let mut max_error: f32 = 0.0;
    let mut total_error: f32 = 0.0;
    let mut count = 0usize;
    for (k, (a, n)) in analytic.iter().zip(&numerical).enumerate() {
        if a.len() != n.len() {
            return Err(DeconvError::shape("analytic gradient", &[n.len()], &[a.len()]));
        }
        for (i, (&x, &y)) in a.iter().zip(n).enumerate() {
            let error = ((x - y).abs() - (atol + rtol * y.abs())).max(0.0);
            if error > 0.0 {
                log::warn!(
                    "Gradient mismatch in input {k} at index {i}: analytical={x:.6e}, numerical={y:.6e}"
                );
            }
            max_error = max_error.max(error);
            total_error += error;
            count += 1;
        }
    }
    let mean_error = if count == 0 { 0.0 } else { total_error / count as f32 };
    Ok((max_error, mean_error, max_error == 0.0))
}

/// Run `f` up to `times` times, returning after the first run that does not
/// panic. The last panic is propagated.
///
/// Absorbs the occasional float-tolerance miss in tests over random data.
pub fn retry<F: Fn()>(times: usize, f: F) {
    let times = times.max(1);
    for attempt in 1..=times {
        match catch_unwind(AssertUnwindSafe(&f)) {
            Ok(()) => return,
            Err(panic) if attempt == times => resume_unwind(panic),
            Err(_) => log::warn!("attempt {attempt}/{times} failed, retrying"),
        }
    }
}
