//! Observation models and the derivative information the site strategies
//! consume.
//!
//! A likelihood exposes its log-density and the first two derivatives with
//! respect to the latent function value; the extended strategy linearizes
//! with these, while expectation propagation only needs the log-density
//! under quadrature. Latent values feeding an exponential link are clamped
//! to ±30 before exponentiation.

use crate::quadrature::GaussHermite;
use crate::scalar::{Scalar, softplus};

const LINK_CLAMP: f64 = 30.0;

/// An observation model for a single latent value.
///
/// `hyp` carries the likelihood's constrained hyperparameters (already
/// mapped through softplus); its length must equal [`Likelihood::hyper_len`].
pub trait Likelihood: Send + Sync {
    /// Number of likelihood hyperparameters.
    fn hyper_len(&self) -> usize;

    /// Log observation density `ln p(y | f)`.
    fn log_density<S: Scalar>(&self, y: f64, f: S, hyp: &[S]) -> S;

    /// First derivative of the log-density with respect to the latent.
    fn d1<S: Scalar>(&self, y: f64, f: S, hyp: &[S]) -> S;

    /// Second derivative of the log-density with respect to the latent.
    fn d2<S: Scalar>(&self, y: f64, f: S, hyp: &[S]) -> S;

    /// Link from the latent to the observation distribution's mean.
    fn link<S: Scalar>(&self, f: S) -> S;

    /// Check observations before any recursion starts.
    fn validate(&self, y_finite: &[f64]) -> Result<(), String> {
        let _ = y_finite;
        Ok(())
    }
}

/// Gaussian likelihood with one hyperparameter, the noise variance.
///
/// Its local Gaussian approximation is exact, so the engine reduces to
/// exact Kalman filtering and the log marginal likelihood matches the
/// dense GP expression.
#[derive(Debug, Clone, Copy, Default)]
pub struct GaussianLikelihood;

impl Likelihood for GaussianLikelihood {
    fn hyper_len(&self) -> usize {
        1
    }

    fn log_density<S: Scalar>(&self, y: f64, f: S, hyp: &[S]) -> S {
        let v = hyp[0];
        let resid = S::from_f64(y) - f;
        let two = S::from_f64(2.0);
        S::from_f64(-0.5) * (S::from_f64(2.0 * std::f64::consts::PI) * v).ln()
            - resid * resid / (two * v)
    }

    fn d1<S: Scalar>(&self, y: f64, f: S, hyp: &[S]) -> S {
        (S::from_f64(y) - f) / hyp[0]
    }

    fn d2<S: Scalar>(&self, _y: f64, _f: S, hyp: &[S]) -> S {
        S::zero() - hyp[0].recip()
    }

    fn link<S: Scalar>(&self, f: S) -> S {
        f
    }
}

/// Poisson likelihood with an exponential (positivity-enforcing) link:
/// `y | f ~ Poisson(binsize · e^f)`. No hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct PoissonLikelihood {
    /// Cell area/duration scaling of the rate; 1.0 for unit cells.
    pub binsize: f64,
}

impl Default for PoissonLikelihood {
    fn default() -> Self {
        Self { binsize: 1.0 }
    }
}

impl PoissonLikelihood {
    fn rate<S: Scalar>(&self, f: S) -> S {
        self.link(f)
    }
}

impl Likelihood for PoissonLikelihood {
    fn hyper_len(&self) -> usize {
        0
    }

    fn log_density<S: Scalar>(&self, y: f64, f: S, _hyp: &[S]) -> S {
        let fc = f.clamp_c(-LINK_CLAMP, LINK_CLAMP);
        // y (f + ln b) − b e^f − ln y!
        S::from_f64(y) * (fc + S::from_f64(self.binsize.ln()))
            - self.rate(fc)
            - S::from_f64(ln_factorial(y))
    }

    fn d1<S: Scalar>(&self, y: f64, f: S, _hyp: &[S]) -> S {
        S::from_f64(y) - self.rate(f.clamp_c(-LINK_CLAMP, LINK_CLAMP))
    }

    fn d2<S: Scalar>(&self, _y: f64, f: S, _hyp: &[S]) -> S {
        S::zero() - self.rate(f.clamp_c(-LINK_CLAMP, LINK_CLAMP))
    }

    fn link<S: Scalar>(&self, f: S) -> S {
        S::from_f64(self.binsize) * f.clamp_c(-LINK_CLAMP, LINK_CLAMP).exp()
    }

    fn validate(&self, y_finite: &[f64]) -> Result<(), String> {
        if !(self.binsize > 0.0 && self.binsize.is_finite()) {
            return Err(format!(
                "Poisson bin size must be positive and finite, got {}",
                self.binsize
            ));
        }
        for (i, &yi) in y_finite.iter().enumerate() {
            if yi < 0.0 || (yi - yi.round()).abs() > 1e-9 {
                return Err(format!(
                    "Poisson observations must be non-negative counts; found y[{i}] = {yi}"
                ));
            }
        }
        Ok(())
    }
}

/// `ln y!` for a count stored as f64.
fn ln_factorial(y: f64) -> f64 {
    let n = y.round().max(0.0) as u64;
    let mut acc = 0.0;
    for k in 2..=n {
        acc += (k as f64).ln();
    }
    acc
}

/// Map unconstrained likelihood hyperparameters through softplus.
pub fn constrain_hyp<S: Scalar>(raw: &[S]) -> Vec<S> {
    raw.iter().map(|&r| softplus(r)).collect()
}

/// Log predictive density `ln ∫ p(y|f) N(f | mean, var) df` by Gauss-Hermite
/// quadrature, stabilized around the largest log-integrand.
pub fn log_predictive_density<L: Likelihood>(
    lik: &L,
    hyp: &[f64],
    y: f64,
    mean: f64,
    var: f64,
    quad: &GaussHermite,
) -> f64 {
    let mut terms: Vec<(f64, f64)> = Vec::with_capacity(quad.len());
    let mut max_lp = f64::NEG_INFINITY;
    for (f, w) in quad.gaussian_abscissas(mean, var) {
        let lp = lik.log_density(y, f, hyp);
        if lp > max_lp {
            max_lp = lp;
        }
        terms.push((lp, w));
    }
    let mut z = 0.0;
    for (lp, w) in terms {
        z += w * (lp - max_lp).exp();
    }
    max_lp + z.ln()
}
