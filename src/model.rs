//! Model façade tying discretization, filtering, smoothing and site
//! refinement into the operations an optimizer consumes.
//!
//! Hyperparameters live outside the model in an immutable [`HyperParams`]
//! struct of unconstrained values; every evaluation maps them through
//! softplus, rebuilds the per-step transitions and runs the iterated
//! filter/smoother from vacuous sites. Evaluations are pure: no site state
//! or factorization survives between calls, so `nlml` and `nlml_with_grad`
//! can be called in any order at any point.

use crate::filter::{Belief, FilterInputs, SitePass, filter_pass};
use crate::inference::{SiteGrid, SiteStrategy};
use crate::kernels::{KERNEL_HYPER_LEN, KernelHyper, MaternKernel};
use crate::likelihoods::{Likelihood, constrain_hyp, log_predictive_density};
use crate::linalg::LinalgError;
use crate::quadrature::GaussHermite;
use crate::scalar::{Dual, Scalar, softplus, softplus_inv};
use crate::smoother::smooth_pass;
use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Largest total hyperparameter count the gradient dispatch covers
/// (two kernel parameters plus up to two likelihood parameters).
pub const MAX_HYPER_LEN: usize = 4;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("numerical failure at step {step}: {what}")]
    NumericalFailure { step: usize, what: String },

    #[error(transparent)]
    Linalg(#[from] LinalgError),

    #[error("expected {expected} hyperparameters, got {got}")]
    HyperLengthMismatch { expected: usize, got: usize },

    #[error("gradients support at most {max} hyperparameters, got {got}")]
    TooManyHyperparameters { max: usize, got: usize },
}

/// Order of the filter/smoother/refinement stages in one inference pass.
/// Both variants refine sites from the same stored smoothed marginals and
/// produce identical results; `Fused` folds the refinement into the
/// forward pass, `TwoStage` runs it standalone and filters with frozen
/// sites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Pipeline {
    Fused,
    TwoStage,
}

/// Knobs of the iterated inference loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Total forward/backward passes per evaluation (at least 1).
    pub passes: usize,
    /// Early-stop threshold on the largest site parameter change.
    pub site_tolerance: f64,
    pub pipeline: Pipeline,
    /// Minimum number of spatial blocks before rayon is used.
    pub parallel_threshold: usize,
    /// Gauss-Hermite order for EP moments and predictive densities.
    pub quad_points: usize,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            passes: 5,
            site_tolerance: 1e-8,
            pipeline: Pipeline::Fused,
            parallel_threshold: 8,
            quad_points: 20,
        }
    }
}

/// Unconstrained hyperparameters, kernel first then likelihood. The
/// positive-constrained values are recovered through softplus; the engine
/// never mutates these.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HyperParams {
    pub kernel: Vec<f64>,
    pub likelihood: Vec<f64>,
}

impl HyperParams {
    /// Build from positive-constrained values via the inverse softplus.
    pub fn from_constrained(variance: f64, lengthscale: f64, likelihood: &[f64]) -> Self {
        Self {
            kernel: vec![softplus_inv(variance), softplus_inv(lengthscale)],
            likelihood: likelihood.iter().map(|&v| softplus_inv(v)).collect(),
        }
    }

    /// Constrained `(variance, lengthscale)` pair, for reporting.
    pub fn constrained_kernel(&self) -> (f64, f64) {
        (softplus(self.kernel[0]), softplus(self.kernel[1]))
    }

    pub fn len(&self) -> usize {
        self.kernel.len() + self.likelihood.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flat unconstrained vector, kernel first. The gradient returned by
    /// [`StateSpaceGp::nlml_with_grad`] uses the same order.
    pub fn flat(&self) -> Vec<f64> {
        self.kernel
            .iter()
            .chain(self.likelihood.iter())
            .copied()
            .collect()
    }

    /// Overwrite from a flat vector in [`Self::flat`] order.
    pub fn set_flat(&mut self, raw: &[f64]) {
        debug_assert_eq!(raw.len(), self.len());
        let nk = self.kernel.len();
        self.kernel.copy_from_slice(&raw[..nk]);
        self.likelihood.copy_from_slice(&raw[nk..]);
    }
}

/// Posterior summary on the training grid.
#[derive(Debug, Clone)]
pub struct Posterior {
    /// Latent posterior mean, `nt × nr`.
    pub mean: Array2<f64>,
    /// Latent posterior marginal variance, `nt × nr`.
    pub variance: Array2<f64>,
    pub log_marginal: f64,
    /// Whether site refinement reached the tolerance within the pass
    /// budget. Non-convergence is reported, not fatal.
    pub converged: bool,
}

/// Latent posterior marginals at query times, `nq × nr`.
#[derive(Debug, Clone)]
pub struct Prediction {
    pub mean: Array2<f64>,
    pub variance: Array2<f64>,
}

struct RunOutput<S> {
    log_marginal: S,
    smoothed: Vec<Vec<Belief<S>>>,
    converged: bool,
}

/// State-space Gaussian process over a strictly increasing temporal grid,
/// with independent spatial blocks sharing one kernel.
#[derive(Debug)]
pub struct StateSpaceGp<L: Likelihood> {
    kernel: MaternKernel,
    likelihood: L,
    strategy: SiteStrategy,
    t: Vec<f64>,
    y: Array2<f64>,
    config: InferenceConfig,
    quad: GaussHermite,
}

impl<L: Likelihood> StateSpaceGp<L> {
    pub fn new(
        kernel: MaternKernel,
        likelihood: L,
        strategy: SiteStrategy,
        t: Vec<f64>,
        y: Array2<f64>,
        config: InferenceConfig,
    ) -> Result<Self, EngineError> {
        if t.is_empty() {
            return Err(EngineError::InvalidInput(
                "the temporal grid is empty".to_string(),
            ));
        }
        if t.len() != y.nrows() {
            return Err(EngineError::InvalidInput(format!(
                "grid has {} times but observations have {} rows",
                t.len(),
                y.nrows()
            )));
        }
        if y.ncols() == 0 {
            return Err(EngineError::InvalidInput(
                "observations have zero spatial blocks".to_string(),
            ));
        }
        for w in t.windows(2) {
            if !(w[1] > w[0]) {
                return Err(EngineError::InvalidInput(format!(
                    "grid times must be finite and strictly increasing (got {} then {})",
                    w[0], w[1]
                )));
            }
        }
        if !t[0].is_finite() {
            return Err(EngineError::InvalidInput(format!(
                "grid time {} is not finite",
                t[0]
            )));
        }
        if config.passes == 0 {
            return Err(EngineError::InvalidInput(
                "at least one inference pass is required".to_string(),
            ));
        }
        strategy.validate().map_err(EngineError::InvalidInput)?;
        let finite: Vec<f64> = y.iter().copied().filter(|v| v.is_finite()).collect();
        likelihood
            .validate(&finite)
            .map_err(EngineError::InvalidInput)?;

        let quad = GaussHermite::new(config.quad_points.max(2));
        Ok(Self {
            kernel,
            likelihood,
            strategy,
            t,
            y,
            config,
            quad,
        })
    }

    pub fn times(&self) -> &[f64] {
        &self.t
    }

    pub fn observations(&self) -> &Array2<f64> {
        &self.y
    }

    pub fn likelihood(&self) -> &L {
        &self.likelihood
    }

    /// Negative log marginal likelihood at the given hyperparameters.
    pub fn nlml(&self, hyp: &HyperParams) -> Result<f64, EngineError> {
        let raw = self.flat_checked(hyp)?;
        let run = self.run_generic::<f64>(&self.t, &self.y, &raw)?;
        Ok(-run.log_marginal)
    }

    /// NLML and its gradient with respect to the unconstrained
    /// hyperparameters (kernel first, then likelihood), by forward-mode
    /// dual numbers threaded through the whole recursion. A numerical
    /// failure aborts the evaluation; no partial gradient is returned.
    pub fn nlml_with_grad(&self, hyp: &HyperParams) -> Result<(f64, Vec<f64>), EngineError> {
        let raw = self.flat_checked(hyp)?;
        match raw.len() {
            2 => self.grad_impl::<2>(&raw),
            3 => self.grad_impl::<3>(&raw),
            4 => self.grad_impl::<4>(&raw),
            got => Err(EngineError::TooManyHyperparameters {
                max: MAX_HYPER_LEN,
                got,
            }),
        }
    }

    fn grad_impl<const N: usize>(&self, raw: &[f64]) -> Result<(f64, Vec<f64>), EngineError> {
        let seeded: Vec<Dual<N>> = raw
            .iter()
            .enumerate()
            .map(|(k, &v)| Dual::seeded(v, k))
            .collect();
        let run = self.run_generic::<Dual<N>>(&self.t, &self.y, &seeded)?;
        let grad = run.log_marginal.dot.iter().map(|&d| -d).collect();
        Ok((-run.log_marginal.val, grad))
    }

    /// Posterior latent marginals on the training grid.
    pub fn posterior(&self, hyp: &HyperParams) -> Result<Posterior, EngineError> {
        let raw = self.flat_checked(hyp)?;
        let run = self.run_generic::<f64>(&self.t, &self.y, &raw)?;
        let (mean, variance) = marginal_grids(&run.smoothed);
        Ok(Posterior {
            mean,
            variance,
            log_marginal: run.log_marginal,
            converged: run.converged,
        })
    }

    /// Posterior latent marginals at arbitrary finite query times. The
    /// queries are merged into the grid as missing observations, so a
    /// single filter/smooth run covers training and query points.
    pub fn predict_at(
        &self,
        hyp: &HyperParams,
        t_query: &[f64],
    ) -> Result<Prediction, EngineError> {
        for &tq in t_query {
            if !tq.is_finite() {
                return Err(EngineError::InvalidInput(format!(
                    "query time {tq} is not finite"
                )));
            }
        }
        let raw = self.flat_checked(hyp)?;
        let (merged, y_aug) = self.augmented_grid(t_query);
        let run = self.run_generic::<f64>(&merged, &y_aug, &raw)?;

        let nr = self.y.ncols();
        let mut mean = Array2::zeros((t_query.len(), nr));
        let mut variance = Array2::zeros((t_query.len(), nr));
        for (qi, &tq) in t_query.iter().enumerate() {
            let row = merged_row(&merged, tq)?;
            for j in 0..nr {
                let (m, v) = run.smoothed[row][j].marginal();
                mean[[qi, j]] = m;
                variance[[qi, j]] = v;
            }
        }
        Ok(Prediction { mean, variance })
    }

    /// Mean negative log predictive density over the finite cells of a
    /// held-out `(t_test.len() × nr)` observation grid.
    pub fn nlpd(
        &self,
        hyp: &HyperParams,
        t_test: &[f64],
        y_test: &Array2<f64>,
    ) -> Result<f64, EngineError> {
        if y_test.dim() != (t_test.len(), self.y.ncols()) {
            return Err(EngineError::InvalidInput(format!(
                "held-out observations have shape {:?}, expected ({}, {})",
                y_test.dim(),
                t_test.len(),
                self.y.ncols()
            )));
        }
        let pred = self.predict_at(hyp, t_test)?;
        let lhyp = constrain_hyp(&hyp.likelihood);

        let mut acc = 0.0;
        let mut n = 0usize;
        for k in 0..t_test.len() {
            for j in 0..self.y.ncols() {
                let yv = y_test[[k, j]];
                if !yv.is_finite() {
                    continue;
                }
                acc += log_predictive_density(
                    &self.likelihood,
                    &lhyp,
                    yv,
                    pred.mean[[k, j]],
                    pred.variance[[k, j]],
                    &self.quad,
                );
                n += 1;
            }
        }
        if n == 0 {
            return Err(EngineError::InvalidInput(
                "held-out grid contains no finite observations".to_string(),
            ));
        }
        Ok(-acc / n as f64)
    }

    /// The iterated inference loop, generic over the scalar so the same
    /// code path produces values and dual-number gradients.
    fn run_generic<S: Scalar>(
        &self,
        t: &[f64],
        y: &Array2<f64>,
        raw: &[S],
    ) -> Result<RunOutput<S>, EngineError> {
        let khyp = KernelHyper::from_unconstrained(&raw[..KERNEL_HYPER_LEN]);
        let lhyp = constrain_hyp(&raw[KERNEL_HYPER_LEN..]);

        let steps = t
            .windows(2)
            .map(|w| self.kernel.discretize(&khyp, w[1] - w[0]))
            .collect::<Result<Vec<_>, _>>()?;
        let pinf = self.kernel.stationary_covariance(&khyp);

        let inputs = FilterInputs {
            y,
            steps: &steps,
            pinf: &pinf,
            likelihood: &self.likelihood,
            lik_hyp: &lhyp,
            strategy: self.strategy,
            quad: &self.quad,
            parallel_threshold: self.config.parallel_threshold,
        };

        let (nt, nr) = y.dim();
        let mut sites = SiteGrid::vacuous(nt, nr);

        // Pass 0 refines each site at its predicted marginal; no smoothed
        // marginals exist yet.
        let mut out = filter_pass(&inputs, &mut sites, SitePass::AtPrediction)?;
        let mut smoothed = smooth_pass(&steps, &out, self.config.parallel_threshold)?;
        let mut converged = false;

        for pass in 1..self.config.passes {
            let marginals: Vec<Vec<(S, S)>> = smoothed
                .iter()
                .map(|row| row.iter().map(Belief::marginal).collect())
                .collect();
            let prev_sites = sites.clone();

            out = match self.config.pipeline {
                Pipeline::Fused => {
                    filter_pass(&inputs, &mut sites, SitePass::AtMarginals(&marginals))?
                }
                Pipeline::TwoStage => {
                    self.refine_sites(&lhyp, y, &mut sites, &marginals);
                    filter_pass(&inputs, &mut sites, SitePass::Frozen)?
                }
            };
            smoothed = smooth_pass(&steps, &out, self.config.parallel_threshold)?;

            let delta = sites.max_delta(&prev_sites);
            log::debug!(
                "pass {pass}: max site delta {delta:.3e}, log marginal {:.6}",
                out.log_marginal.value()
            );
            if delta < self.config.site_tolerance {
                converged = true;
                break;
            }
        }
        if !converged && self.config.passes > 1 {
            log::debug!(
                "site refinement did not reach {:.1e} within {} passes",
                self.config.site_tolerance,
                self.config.passes
            );
        }

        Ok(RunOutput {
            log_marginal: out.log_marginal,
            smoothed,
            converged,
        })
    }

    /// Standalone site refinement for the two-stage pipeline.
    fn refine_sites<S: Scalar>(
        &self,
        lhyp: &[S],
        y: &Array2<f64>,
        sites: &mut SiteGrid<S>,
        marginals: &[Vec<(S, S)>],
    ) {
        let (nt, nr) = y.dim();
        for k in 0..nt {
            for j in 0..nr {
                let yv = y[[k, j]];
                if !yv.is_finite() {
                    continue;
                }
                let (m, v) = marginals[k][j];
                let prev = sites.get(k, j);
                let new =
                    self.strategy
                        .refine(&self.likelihood, lhyp, yv, m, v, prev, &self.quad);
                sites.set(k, j, new);
            }
        }
    }

    fn flat_checked(&self, hyp: &HyperParams) -> Result<Vec<f64>, EngineError> {
        if hyp.kernel.len() != KERNEL_HYPER_LEN {
            return Err(EngineError::HyperLengthMismatch {
                expected: KERNEL_HYPER_LEN,
                got: hyp.kernel.len(),
            });
        }
        if hyp.likelihood.len() != self.likelihood.hyper_len() {
            return Err(EngineError::HyperLengthMismatch {
                expected: self.likelihood.hyper_len(),
                got: hyp.likelihood.len(),
            });
        }
        Ok(hyp.flat())
    }

    /// Merge query times into the training grid, with NaN (missing) cells
    /// at query-only rows.
    fn augmented_grid(&self, t_query: &[f64]) -> (Vec<f64>, Array2<f64>) {
        let mut merged: Vec<f64> = self
            .t
            .iter()
            .chain(t_query.iter())
            .copied()
            .collect();
        merged.sort_by(f64::total_cmp);
        merged.dedup();

        let nr = self.y.ncols();
        let mut y_aug = Array2::from_elem((merged.len(), nr), f64::NAN);
        let mut row = 0usize;
        for (k, &tk) in self.t.iter().enumerate() {
            // Training times are strictly increasing, so a linear scan
            // through the merged grid finds each row.
            while merged[row] < tk {
                row += 1;
            }
            for j in 0..nr {
                y_aug[[row, j]] = self.y[[k, j]];
            }
        }
        (merged, y_aug)
    }
}

fn merged_row(merged: &[f64], t: f64) -> Result<usize, EngineError> {
    merged
        .binary_search_by(|p| p.total_cmp(&t))
        .map_err(|_| EngineError::InvalidInput(format!("time {t} is missing from the merged grid")))
}

fn marginal_grids(smoothed: &[Vec<Belief<f64>>]) -> (Array2<f64>, Array2<f64>) {
    let nt = smoothed.len();
    let nr = if nt == 0 { 0 } else { smoothed[0].len() };
    let mut mean = Array2::zeros((nt, nr));
    let mut variance = Array2::zeros((nt, nr));
    for (k, row) in smoothed.iter().enumerate() {
        for (j, bel) in row.iter().enumerate() {
            let (m, v) = bel.marginal();
            mean[[k, j]] = m;
            variance[[k, j]] = v;
        }
    }
    (mean, variance)
}
