//! Dense Gaussian-process reference computation.
//!
//! Builds the full `n × n` Gram matrix from the kernel's stationary
//! autocovariance and evaluates the exact log marginal likelihood through a
//! dense Cholesky. O(n³), single spatial block, Gaussian likelihood only;
//! this exists so the state-space recursion can be checked against the
//! textbook expression on small problems.

use crate::kernels::{KernelHyper, MaternKernel};
use crate::linalg::FaerCholesky;
use crate::model::EngineError;
use faer::Side;
use ndarray::{Array1, Array2};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Exact Gaussian-likelihood log marginal likelihood,
/// `ln N(y | 0, K + σₙ² I)`.
pub fn dense_log_marginal(
    kernel: &MaternKernel,
    hyp: &KernelHyper<f64>,
    noise_variance: f64,
    t: &[f64],
    y: &[f64],
) -> Result<f64, EngineError> {
    let n = t.len();
    if y.len() != n {
        return Err(EngineError::InvalidInput(format!(
            "{} observations for {} grid times",
            y.len(),
            n
        )));
    }
    if !(noise_variance > 0.0) {
        return Err(EngineError::InvalidInput(format!(
            "noise variance must be positive, got {noise_variance}"
        )));
    }

    let mut gram = Array2::zeros((n, n));
    for i in 0..n {
        for j in 0..n {
            gram[[i, j]] = kernel.autocovariance(hyp, (t[i] - t[j]).abs());
        }
        gram[[i, i]] += noise_variance;
    }

    let chol = gram.cholesky(Side::Lower)?;
    let yv = Array1::from_iter(y.iter().copied());
    let alpha = chol.solve_vec(&yv);

    let mut quad = 0.0;
    for i in 0..n {
        quad += y[i] * alpha[i];
    }
    Ok(-0.5 * quad - 0.5 * chol.log_det() - 0.5 * n as f64 * LN_2PI)
}
