//! Gauss-Hermite quadrature for Gaussian expectations.
//!
//! Nodes and weights come from the Golub-Welsch algorithm: the eigenvalues
//! of the symmetric tridiagonal Jacobi matrix of the physicist's Hermite
//! recurrence are the nodes, and the squared first eigenvector components
//! scaled by `μ₀ = √π` are the weights. The tridiagonal eigensolver is the
//! implicit symmetric QR iteration with Wilkinson shifts.
//!
//! Expectation propagation matches tilted moments with this rule, and the
//! predictive-density path integrates the likelihood against the posterior
//! marginal with it.

use crate::scalar::Scalar;

/// Gauss-Hermite rule with weight function `exp(-x²)`.
#[derive(Debug, Clone)]
pub struct GaussHermite {
    nodes: Vec<f64>,
    weights: Vec<f64>,
}

impl GaussHermite {
    /// Build an `n`-point rule (exact for polynomials up to degree `2n-1`).
    pub fn new(n: usize) -> Self {
        assert!(n >= 1, "quadrature rule needs at least one node");

        // Jacobi matrix for physicist's Hermite: zero diagonal,
        // off-diagonal[i] = sqrt((i+1)/2).
        let mut diag = vec![0.0f64; n];
        let mut off_diag = vec![0.0f64; n.saturating_sub(1)];
        for (i, e) in off_diag.iter_mut().enumerate() {
            *e = (((i + 1) as f64) / 2.0).sqrt();
        }

        let (eigenvalues, first_components) = symmetric_tridiagonal_eigen(&mut diag, &mut off_diag);

        let mu0 = std::f64::consts::PI.sqrt();
        let mut pairs: Vec<(f64, f64)> = eigenvalues
            .iter()
            .zip(first_components.iter())
            .map(|(&x, &v0)| (x, mu0 * v0 * v0))
            .collect();
        pairs.sort_by(|a, b| a.0.partial_cmp(&b.0).expect("nodes are finite"));

        Self {
            nodes: pairs.iter().map(|p| p.0).collect(),
            weights: pairs.iter().map(|p| p.1).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Abscissas for integrating against `N(mean, var)`:
    /// `f_i = mean + sqrt(2 var) x_i`, paired with normalized weights
    /// `w_i / √π` that sum to one.
    pub fn gaussian_abscissas<S: Scalar>(
        &self,
        mean: S,
        var: S,
    ) -> impl Iterator<Item = (S, f64)> + '_ {
        let sd = (var.max_s(S::from_f64(f64::MIN_POSITIVE)) * S::from_f64(2.0)).sqrt();
        let inv_sqrt_pi = std::f64::consts::PI.sqrt().recip();
        self.nodes
            .iter()
            .zip(self.weights.iter())
            .map(move |(&x, &w)| (mean + sd * S::from_f64(x), w * inv_sqrt_pi))
    }

    /// `E[g(f)]` under `f ~ N(mean, var)`.
    pub fn expect<S: Scalar>(&self, mean: S, var: S, g: impl Fn(S) -> S) -> S {
        let mut acc = S::zero();
        for (f, w) in self.gaussian_abscissas(mean, var) {
            acc = acc + S::from_f64(w) * g(f);
        }
        acc
    }
}

/// Implicit symmetric QR with Wilkinson shifts on a tridiagonal matrix.
/// Returns the eigenvalues and the first component of each eigenvector
/// (all Golub-Welsch needs).
fn symmetric_tridiagonal_eigen(diag: &mut [f64], off_diag: &mut [f64]) -> (Vec<f64>, Vec<f64>) {
    let n_total = diag.len();
    // Track only the first row of the accumulated rotation product.
    let mut first_row = vec![0.0f64; n_total];
    if n_total > 0 {
        first_row[0] = 1.0;
    }

    let eps = 1e-15;
    let max_iter = 100;

    let mut n = n_total;
    while n > 1 {
        let mut converged = false;
        for _ in 0..max_iter {
            let mut m = n - 1;
            while m > 0 {
                if off_diag[m - 1].abs() <= eps * (diag[m - 1].abs() + diag[m].abs()) {
                    off_diag[m - 1] = 0.0;
                    break;
                }
                m -= 1;
            }

            if m == n - 1 {
                n -= 1;
                converged = true;
                break;
            }

            let shift = wilkinson_shift(diag[n - 2], diag[n - 1], off_diag[n - 2]);
            let mut x = diag[m] - shift;
            let mut y = off_diag[m];

            for k in m..(n - 1) {
                let (c, s) = if y.abs() > eps {
                    let r = x.hypot(y);
                    if r > 0.0 && r.is_finite() {
                        (x / r, -y / r)
                    } else {
                        (1.0, 0.0)
                    }
                } else {
                    (1.0, 0.0)
                };

                if k > m {
                    off_diag[k - 1] = x.hypot(y);
                }

                let d1 = diag[k];
                let d2 = diag[k + 1];
                let e_k = off_diag[k];

                diag[k] = c * c * d1 + s * s * d2 - 2.0 * c * s * e_k;
                diag[k + 1] = s * s * d1 + c * c * d2 + 2.0 * c * s * e_k;
                off_diag[k] = c * s * (d1 - d2) + (c * c - s * s) * e_k;

                if k < n - 2 {
                    x = off_diag[k];
                    y = -s * off_diag[k + 1];
                    off_diag[k + 1] *= c;
                }

                let t = first_row[k];
                first_row[k] = c * t - s * first_row[k + 1];
                first_row[k + 1] = s * t + c * first_row[k + 1];
            }
        }
        if !converged {
            // Force trailing deflation so the loop always terminates; for
            // the small Jacobi matrices used here this is essentially
            // unreachable.
            off_diag[n - 2] = 0.0;
            n -= 1;
        }
    }

    (diag.to_vec(), first_row)
}

/// Eigenvalue of the trailing 2x2 block closer to `d2`. Uses sign(0) = +1
/// to avoid a zero denominator when the diagonal gap vanishes.
fn wilkinson_shift(d1: f64, d2: f64, e: f64) -> f64 {
    let delta = (d1 - d2) / 2.0;
    let sign = if delta >= 0.0 { 1.0 } else { -1.0 };
    let denom = delta.abs() + (delta * delta + e * e).sqrt();
    if denom == 0.0 {
        d2 - e.abs()
    } else {
        d2 - sign * e * e / denom
    }
}
