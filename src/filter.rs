//! Forward Kalman recursion over the temporal grid.
//!
//! The state is block-diagonal across spatial sites (one independent,
//! identically parameterized SDE block per site), so beliefs are stored per
//! block and each time step's update is embarrassingly parallel across
//! blocks while the recursion itself stays sequential in time. Observations
//! enter through the scalar measurement of each block's first state
//! component; the update consumes the block's Gaussian site as a
//! pseudo-observation and accumulates its log-predictive term into the log
//! marginal likelihood.

use crate::inference::{Site, SiteGrid, SiteStrategy};
use crate::likelihoods::Likelihood;
use crate::linalg::{mat_vec, sandwich, symmetrize};
use crate::model::EngineError;
use crate::quadrature::GaussHermite;
use crate::scalar::Scalar;
use ndarray::{Array1, Array2};
use rayon::iter::{IntoParallelIterator, ParallelIterator};

const LN_2PI: f64 = 1.837_877_066_409_345_5;

/// Gaussian belief over one spatial block's state.
#[derive(Debug, Clone)]
pub struct Belief<S> {
    pub mean: Array1<S>,
    pub cov: Array2<S>,
}

impl<S: Scalar> Belief<S> {
    /// Marginal of the measured (first) state component.
    #[inline]
    pub fn marginal(&self) -> (S, S) {
        (self.mean[0], self.cov[[0, 0]])
    }
}

/// Everything one forward pass produces. Predicted beliefs are retained for
/// the smoother's gain computation; this is the dominant memory cost,
/// `O(nt · nr · d²)`.
#[derive(Debug)]
pub struct FilterOutput<S> {
    pub log_marginal: S,
    pub predicted: Vec<Vec<Belief<S>>>,
    pub filtered: Vec<Vec<Belief<S>>>,
}

/// How sites are treated during a forward pass.
#[derive(Clone, Copy)]
pub enum SitePass<'a, S> {
    /// Use the stored sites as they are.
    Frozen,
    /// Refine each site at its predicted marginal before the update
    /// (first pass, when no sites exist yet).
    AtPrediction,
    /// Refine each site at a stored `(mean, var)` marginal from the
    /// previous smoothing pass (the fused pipeline's in-loop refinement).
    AtMarginals(&'a [Vec<(S, S)>]),
}

pub(crate) struct FilterInputs<'a, S, L> {
    /// Observations, `nt × nr`; NaN marks a missing cell.
    pub y: &'a Array2<f64>,
    /// Per-step transitions `(A_k, Q_k)`, `steps[k]` maps step `k` to `k+1`.
    pub steps: &'a [(Array2<S>, Array2<S>)],
    /// Stationary covariance, the prior belief of every block.
    pub pinf: &'a Array2<S>,
    pub likelihood: &'a L,
    pub lik_hyp: &'a [S],
    pub strategy: SiteStrategy,
    pub quad: &'a GaussHermite,
    /// Minimum number of spatial blocks before rayon kicks in.
    pub parallel_threshold: usize,
}

struct BlockStep<S> {
    filtered: Belief<S>,
    site: Site<S>,
    log_term: S,
}

/// One Kalman forward pass. Refines sites according to `pass`, writes the
/// refreshed sites back into `sites`, and returns predicted and filtered
/// beliefs plus the accumulated log marginal likelihood.
pub(crate) fn filter_pass<S: Scalar, L: Likelihood>(
    inputs: &FilterInputs<'_, S, L>,
    sites: &mut SiteGrid<S>,
    pass: SitePass<'_, S>,
) -> Result<FilterOutput<S>, EngineError> {
    let (nt, nr) = inputs.y.dim();
    let mut predicted: Vec<Vec<Belief<S>>> = Vec::with_capacity(nt);
    let mut filtered: Vec<Vec<Belief<S>>> = Vec::with_capacity(nt);
    let mut log_marginal = S::zero();

    let prior = Belief {
        mean: Array1::from_elem(inputs.pinf.nrows(), S::zero()),
        cov: inputs.pinf.clone(),
    };

    for k in 0..nt {
        // Predict: propagate each block through (A, Q); step 0 starts at
        // the stationary prior.
        let pred_row: Vec<Belief<S>> = if k == 0 {
            vec![prior.clone(); nr]
        } else {
            let (a, q) = &inputs.steps[k - 1];
            filtered[k - 1]
                .iter()
                .map(|bel| {
                    let mut cov = sandwich(a, &bel.cov);
                    for (c, qv) in cov.iter_mut().zip(q.iter()) {
                        *c = *c + *qv;
                    }
                    symmetrize(&mut cov);
                    Belief {
                        mean: mat_vec(a, &bel.mean),
                        cov,
                    }
                })
                .collect()
        };

        let step_block = |j: usize| -> Result<BlockStep<S>, EngineError> {
            update_block(inputs, sites.get(k, j), pass, k, j, &pred_row[j])
        };

        let results: Vec<Result<BlockStep<S>, EngineError>> = if nr >= inputs.parallel_threshold {
            (0..nr).into_par_iter().map(step_block).collect()
        } else {
            (0..nr).map(step_block).collect()
        };

        let mut filt_row = Vec::with_capacity(nr);
        for (j, res) in results.into_iter().enumerate() {
            let block = res?;
            sites.set(k, j, block.site);
            log_marginal = log_marginal + block.log_term;
            filt_row.push(block.filtered);
        }

        predicted.push(pred_row);
        filtered.push(filt_row);
    }

    Ok(FilterOutput {
        log_marginal,
        predicted,
        filtered,
    })
}

/// Site refinement (per the pass schedule) and measurement update for a
/// single block at step `k`.
fn update_block<S: Scalar, L: Likelihood>(
    inputs: &FilterInputs<'_, S, L>,
    prev_site: Site<S>,
    pass: SitePass<'_, S>,
    k: usize,
    j: usize,
    pred: &Belief<S>,
) -> Result<BlockStep<S>, EngineError> {
    let y = inputs.y[[k, j]];

    // Missing observation: belief passes through unchanged.
    if !y.is_finite() {
        return Ok(BlockStep {
            filtered: pred.clone(),
            site: Site::vacuous(),
            log_term: S::zero(),
        });
    }

    let site = match pass {
        SitePass::Frozen => prev_site,
        SitePass::AtPrediction => {
            let (m, v) = pred.marginal();
            inputs.strategy.refine(
                inputs.likelihood,
                inputs.lik_hyp,
                y,
                m,
                v,
                prev_site,
                inputs.quad,
            )
        }
        SitePass::AtMarginals(marginals) => {
            let (m, v) = marginals[k][j];
            inputs.strategy.refine(
                inputs.likelihood,
                inputs.lik_hyp,
                y,
                m,
                v,
                prev_site,
                inputs.quad,
            )
        }
    };

    if site.is_vacuous() {
        return Ok(BlockStep {
            filtered: pred.clone(),
            site,
            log_term: S::zero(),
        });
    }

    let (mu, var) = pred.marginal();
    let noise = site.precision.recip();
    let innov_var = var + noise;
    let iv = innov_var.value();
    if !iv.is_finite() || iv <= 0.0 {
        return Err(EngineError::NumericalFailure {
            step: k,
            what: format!("innovation variance {iv:.4e} in spatial block {j}"),
        });
    }

    let z = site.shift * noise;
    let resid = z - mu;

    // Gain is the first covariance column over the innovation variance.
    let d = pred.mean.len();
    let mut gain = Array1::from_elem(d, S::zero());
    for i in 0..d {
        gain[i] = pred.cov[[i, 0]] / innov_var;
    }

    let mut mean = pred.mean.clone();
    for i in 0..d {
        mean[i] = mean[i] + gain[i] * resid;
    }

    let mut cov = pred.cov.clone();
    for i in 0..d {
        for l in 0..d {
            cov[[i, l]] = cov[[i, l]] - gain[i] * innov_var * gain[l];
        }
    }
    symmetrize(&mut cov);

    for i in 0..d {
        let pv = cov[[i, i]].value();
        if !pv.is_finite() {
            return Err(EngineError::NumericalFailure {
                step: k,
                what: format!("filtered variance became non-finite in spatial block {j}"),
            });
        }
    }

    let log_term = S::from_f64(-0.5) * (S::from_f64(LN_2PI) + innov_var.ln())
        - S::from_f64(0.5) * resid * resid / innov_var;

    Ok(BlockStep {
        filtered: Belief { mean, cov },
        site,
        log_term,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::SiteStrategy;
    use crate::kernels::{KernelHyper, MaternKernel, MaternNu};
    use crate::likelihoods::GaussianLikelihood;

    fn toy_inputs(
        kernel: &MaternKernel,
        hyp: &KernelHyper<f64>,
        t: &[f64],
    ) -> (Vec<(Array2<f64>, Array2<f64>)>, Array2<f64>) {
        let steps: Vec<_> = t
            .windows(2)
            .map(|w| kernel.discretize(hyp, w[1] - w[0]).unwrap())
            .collect();
        let pinf = kernel.stationary_covariance(hyp);
        (steps, pinf)
    }

    #[test]
    fn gaussian_filter_matches_scalar_kalman_by_hand() {
        // Matérn-1/2 is a scalar AR(1) state, so the filter can be checked
        // against a hand-rolled recursion.
        let kernel = MaternKernel::new(MaternNu::OneHalf);
        let hyp = KernelHyper {
            variance: 1.3,
            lengthscale: 2.0,
        };
        let t = [0.0, 0.5, 1.7, 2.0];
        let y_vals = [0.3, -0.4, 0.9, 0.1];
        let noise = 0.25;

        let (steps, pinf) = toy_inputs(&kernel, &hyp, &t);
        let y = Array2::from_shape_fn((4, 1), |(k, _)| y_vals[k]);
        let quad = GaussHermite::new(10);
        let lik = GaussianLikelihood;
        let inputs = FilterInputs {
            y: &y,
            steps: &steps,
            pinf: &pinf,
            likelihood: &lik,
            lik_hyp: &[noise],
            strategy: SiteStrategy::Extended { damping: 1.0 },
            quad: &quad,
            parallel_threshold: usize::MAX,
        };
        let mut sites = SiteGrid::vacuous(4, 1);
        let out = filter_pass(&inputs, &mut sites, SitePass::AtPrediction).unwrap();

        // hand recursion
        let mut lml = 0.0;
        let mut m = 0.0;
        let mut p = hyp.variance;
        for k in 0..4 {
            if k > 0 {
                let a = steps[k - 1].0[[0, 0]];
                let q = steps[k - 1].1[[0, 0]];
                m = a * m;
                p = a * p * a + q;
            }
            let s = p + noise;
            let r = y_vals[k] - m;
            lml += -0.5 * (LN_2PI + s.ln()) - 0.5 * r * r / s;
            let gain = p / s;
            m += gain * r;
            p -= gain * s * gain;

            assert!((out.filtered[k][0].mean[0] - m).abs() < 1e-12);
            assert!((out.filtered[k][0].cov[[0, 0]] - p).abs() < 1e-12);
        }
        assert!((out.log_marginal - lml).abs() < 1e-12);
    }

    #[test]
    fn degenerate_site_precision_aborts_the_pass() {
        // A subnormal precision overflows to an infinite pseudo-noise, so
        // the innovation check must abort the evaluation instead of
        // letting NaN reach the log marginal.
        let kernel = MaternKernel::new(MaternNu::OneHalf);
        let hyp = KernelHyper {
            variance: 1.0,
            lengthscale: 1.0,
        };
        let t = [0.0, 1.0];
        let (steps, pinf) = toy_inputs(&kernel, &hyp, &t);
        let y = Array2::from_elem((2, 1), 0.5);
        let quad = GaussHermite::new(10);
        let lik = GaussianLikelihood;
        let inputs = FilterInputs {
            y: &y,
            steps: &steps,
            pinf: &pinf,
            likelihood: &lik,
            lik_hyp: &[0.1],
            strategy: SiteStrategy::Extended { damping: 1.0 },
            quad: &quad,
            parallel_threshold: usize::MAX,
        };
        let mut sites = SiteGrid::vacuous(2, 1);
        sites.set(
            1,
            0,
            Site {
                precision: 1e-320,
                shift: 0.0,
            },
        );
        let err = filter_pass(&inputs, &mut sites, SitePass::Frozen).unwrap_err();
        match err {
            EngineError::NumericalFailure { step, .. } => assert_eq!(step, 1),
            other => panic!("expected a numerical failure, got {other}"),
        }
    }

    #[test]
    fn missing_observations_leave_belief_untouched() {
        let kernel = MaternKernel::new(MaternNu::ThreeHalves);
        let hyp = KernelHyper {
            variance: 0.9,
            lengthscale: 1.0,
        };
        let t = [0.0, 1.0];
        let (steps, pinf) = toy_inputs(&kernel, &hyp, &t);
        let y = Array2::from_elem((2, 1), f64::NAN);
        let quad = GaussHermite::new(10);
        let lik = GaussianLikelihood;
        let inputs = FilterInputs {
            y: &y,
            steps: &steps,
            pinf: &pinf,
            likelihood: &lik,
            lik_hyp: &[0.1],
            strategy: SiteStrategy::Extended { damping: 1.0 },
            quad: &quad,
            parallel_threshold: usize::MAX,
        };
        let mut sites = SiteGrid::vacuous(2, 1);
        let out = filter_pass(&inputs, &mut sites, SitePass::AtPrediction).unwrap();

        assert_eq!(out.log_marginal, 0.0);
        for k in 0..2 {
            for (f, p) in out.filtered[k][0]
                .cov
                .iter()
                .zip(out.predicted[k][0].cov.iter())
            {
                assert_eq!(f, p);
            }
        }
    }
}
