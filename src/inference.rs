//! Gaussian pseudo-observations (sites) and the strategies that refine them.
//!
//! A site is a per-step, per-spatial-block Gaussian approximation to the
//! true likelihood factor, stored in natural form (`precision`, `shift`)
//! so a vacuous site is just zeros and damped blends are linear. The filter
//! consumes a site as the pseudo-observation `z = shift / precision` with
//! noise `1 / precision`.
//!
//! Two refinement strategies exist:
//! - `Extended`: second-order linearization of the log-likelihood at the
//!   current anchor mean (the predicted mean on the first pass, the
//!   smoothed mean afterwards);
//! - `ExpectationPropagation`: moment matching of the tilted distribution
//!   `likelihood × cavity` by Gauss-Hermite quadrature.
//!
//! Both blend new and previous natural parameters with a damping factor
//! `α ∈ (0, 1]`; `α = 1` is the undamped Newton-type update.

use crate::likelihoods::Likelihood;
use crate::quadrature::GaussHermite;
use crate::scalar::Scalar;
use serde::{Deserialize, Serialize};

/// Natural-form Gaussian site. Zero precision means no pseudo-observation.
#[derive(Debug, Clone, Copy)]
pub struct Site<S> {
    pub precision: S,
    pub shift: S,
}

impl<S: Scalar> Site<S> {
    pub fn vacuous() -> Self {
        Self {
            precision: S::zero(),
            shift: S::zero(),
        }
    }

    pub fn is_vacuous(&self) -> bool {
        self.precision.value() <= 0.0
    }
}

/// Dense `(nt × nr)` storage of sites; recomputed fresh on every engine
/// evaluation, never persisted across optimizer iterations.
#[derive(Debug, Clone)]
pub struct SiteGrid<S> {
    sites: Vec<Site<S>>,
    nr: usize,
}

impl<S: Scalar> SiteGrid<S> {
    pub fn vacuous(nt: usize, nr: usize) -> Self {
        Self {
            sites: vec![Site::vacuous(); nt * nr],
            nr,
        }
    }

    #[inline]
    pub fn get(&self, step: usize, block: usize) -> Site<S> {
        self.sites[step * self.nr + block]
    }

    #[inline]
    pub fn set(&mut self, step: usize, block: usize, site: Site<S>) {
        self.sites[step * self.nr + block] = site;
    }

    /// Largest primal-value change between two site grids, the quantity the
    /// pass loop monitors for convergence.
    pub fn max_delta(&self, other: &Self) -> f64 {
        self.sites
            .iter()
            .zip(other.sites.iter())
            .map(|(a, b)| {
                let dp = (a.precision.value() - b.precision.value()).abs();
                let ds = (a.shift.value() - b.shift.value()).abs();
                dp.max(ds)
            })
            .fold(0.0, f64::max)
    }
}

/// Policy turning a non-Gaussian likelihood factor into a Gaussian site.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum SiteStrategy {
    /// Linearize the log-likelihood at the anchor mean.
    Extended { damping: f64 },
    /// Match the first two tilted moments by quadrature.
    ExpectationPropagation { damping: f64 },
}

impl Default for SiteStrategy {
    fn default() -> Self {
        SiteStrategy::Extended { damping: 1.0 }
    }
}

impl SiteStrategy {
    pub fn damping(&self) -> f64 {
        match *self {
            SiteStrategy::Extended { damping } => damping,
            SiteStrategy::ExpectationPropagation { damping } => damping,
        }
    }

    /// Check the damping factor before any recursion starts. Zero damping
    /// would freeze every site at its previous (initially vacuous) value,
    /// so all observations would be skipped without any error.
    pub fn validate(&self) -> Result<(), String> {
        let alpha = self.damping();
        if !(alpha > 0.0 && alpha <= 1.0) {
            return Err(format!("damping must lie in (0, 1], got {alpha}"));
        }
        Ok(())
    }

    /// Refine one site given the marginal belief of its latent value
    /// (`marg_mean`, `marg_var`: the predicted marginal on the first pass,
    /// the smoothed marginal afterwards) and the previous site.
    pub fn refine<S: Scalar, L: Likelihood>(
        &self,
        lik: &L,
        lhyp: &[S],
        y: f64,
        marg_mean: S,
        marg_var: S,
        prev: Site<S>,
        quad: &GaussHermite,
    ) -> Site<S> {
        let proposed = match *self {
            SiteStrategy::Extended { .. } => extended_site(lik, lhyp, y, marg_mean),
            SiteStrategy::ExpectationPropagation { .. } => {
                ep_site(lik, lhyp, y, marg_mean, marg_var, prev, quad)
            }
        };
        match proposed {
            Some(new) => damp(new, prev, self.damping()),
            None => prev,
        }
    }
}

/// `α · new + (1 − α) · prev` in natural parameters.
fn damp<S: Scalar>(new: Site<S>, prev: Site<S>, alpha: f64) -> Site<S> {
    if alpha >= 1.0 {
        return new;
    }
    let a = S::from_f64(alpha);
    let b = S::from_f64(1.0 - alpha);
    Site {
        precision: a * new.precision + b * prev.precision,
        shift: a * new.shift + b * prev.shift,
    }
}

/// Second-order expansion of `ln p(y|f)` around the anchor `m`:
/// precision `= −∂²`, shift `= precision · m + ∂¹`.
fn extended_site<S: Scalar, L: Likelihood>(lik: &L, lhyp: &[S], y: f64, m: S) -> Option<Site<S>> {
    let j1 = lik.d1(y, m, lhyp);
    let j2 = lik.d2(y, m, lhyp);
    let precision = S::zero() - j2;
    if !precision.is_finite_value() || precision.value() <= 0.0 {
        return None;
    }
    let shift = precision * m + j1;
    if !shift.is_finite_value() {
        return None;
    }
    Some(Site { precision, shift })
}

/// Moment matching of the tilted distribution `p(y|f) N(f | cavity)` where
/// the cavity is the marginal with the previous site divided out. A
/// non-positive cavity precision or degenerate tilted variance keeps the
/// previous site.
fn ep_site<S: Scalar, L: Likelihood>(
    lik: &L,
    lhyp: &[S],
    y: f64,
    marg_mean: S,
    marg_var: S,
    prev: Site<S>,
    quad: &GaussHermite,
) -> Option<Site<S>> {
    if marg_var.value() <= 0.0 {
        return None;
    }
    let marg_prec = marg_var.recip();
    let cav_prec = marg_prec - prev.precision;
    if !cav_prec.is_finite_value() || cav_prec.value() <= 0.0 {
        return None;
    }
    let cav_var = cav_prec.recip();
    let cav_mean = (marg_mean * marg_prec - prev.shift) * cav_var;

    // Tilted moments, stabilized around the largest log-integrand. The
    // constant shift cancels in the ratios, so gradients are unaffected.
    let mut evals: Vec<(S, S, f64)> = Vec::with_capacity(quad.len());
    let mut max_lp = f64::NEG_INFINITY;
    for (f, w) in quad.gaussian_abscissas(cav_mean, cav_var) {
        let lp = lik.log_density(y, f, lhyp);
        if lp.value() > max_lp {
            max_lp = lp.value();
        }
        evals.push((f, lp, w));
    }
    if !max_lp.is_finite() {
        return None;
    }

    let mut z = S::zero();
    let mut m1 = S::zero();
    let mut m2 = S::zero();
    for (f, lp, w) in evals {
        let t = S::from_f64(w) * (lp - S::from_f64(max_lp)).exp();
        z = z + t;
        m1 = m1 + t * f;
        m2 = m2 + t * f * f;
    }
    if !z.is_finite_value() || z.value() <= 0.0 {
        return None;
    }
    let tilted_mean = m1 / z;
    let tilted_var = m2 / z - tilted_mean * tilted_mean;
    if !tilted_var.is_finite_value() || tilted_var.value() <= 0.0 {
        return None;
    }

    let tilted_prec = tilted_var.recip();
    let precision = tilted_prec - cav_prec;
    if !precision.is_finite_value() || precision.value() <= 0.0 {
        return None;
    }
    let shift = tilted_mean * tilted_prec - cav_mean * cav_prec;
    if !shift.is_finite_value() {
        return None;
    }
    Some(Site { precision, shift })
}
