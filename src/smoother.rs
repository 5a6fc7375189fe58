//! Rauch-Tung-Striebel backward smoothing.
//!
//! Refines the filter's beliefs with future data: for each step `k`,
//! `G = P_k A_{k+1}ᵀ (P⁻_{k+1})⁻¹`, `mˢ_k = m_k + G (mˢ_{k+1} − m⁻_{k+1})`,
//! `Pˢ_k = P_k + G (Pˢ_{k+1} − P⁻_{k+1}) Gᵀ`. Every covariance is
//! symmetrized after its update; the gain solve goes through the generic
//! Cholesky so an indefinite predicted covariance surfaces as a numerical
//! failure rather than silent NaN.

use crate::filter::{Belief, FilterOutput};
use crate::linalg::{Cholesky, mat_mul, symmetrize};
use crate::model::EngineError;
use crate::scalar::Scalar;
use ndarray::Array2;
use rayon::iter::{IndexedParallelIterator, IntoParallelIterator, ParallelIterator};

/// Backward pass over the filter's output. `steps[k]` is the transition
/// from step `k` to `k+1`, as in the filter.
pub(crate) fn smooth_pass<S: Scalar>(
    steps: &[(Array2<S>, Array2<S>)],
    out: &FilterOutput<S>,
    parallel_threshold: usize,
) -> Result<Vec<Vec<Belief<S>>>, EngineError> {
    let nt = out.filtered.len();
    if nt == 0 {
        return Ok(Vec::new());
    }
    let nr = out.filtered[0].len();

    let mut smoothed: Vec<Vec<Belief<S>>> = Vec::with_capacity(nt);
    smoothed.push(out.filtered[nt - 1].clone());

    for k in (0..nt.saturating_sub(1)).rev() {
        let a = &steps[k].0;
        let next_smoothed = &smoothed[smoothed.len() - 1];

        let smooth_one = |(j, next): (usize, &Belief<S>)| -> Result<Belief<S>, EngineError> {
            smooth_block(
                a,
                &out.filtered[k][j],
                &out.predicted[k + 1][j],
                next,
            )
            .map_err(|err| match err {
                EngineError::Linalg(inner) => EngineError::NumericalFailure {
                    step: k,
                    what: format!("smoother gain solve failed in spatial block {j}: {inner}"),
                },
                other => other,
            })
        };

        let row: Result<Vec<Belief<S>>, EngineError> = if nr >= parallel_threshold {
            (0..nr)
                .into_par_iter()
                .zip(next_smoothed.as_slice().into_par_iter())
                .map(smooth_one)
                .collect()
        } else {
            next_smoothed
                .iter()
                .enumerate()
                .map(smooth_one)
                .collect()
        };
        smoothed.push(row?);
    }

    smoothed.reverse();
    Ok(smoothed)
}

fn smooth_block<S: Scalar>(
    a: &Array2<S>,
    filtered: &Belief<S>,
    predicted_next: &Belief<S>,
    smoothed_next: &Belief<S>,
) -> Result<Belief<S>, EngineError> {
    let d = filtered.mean.len();

    // G = P_f Aᵀ (P⁻)⁻¹, computed as (P⁻)⁻¹ (A P_f) transposed; P_f is
    // symmetric so A P_f = A P_fᵀ.
    let apf = mat_mul(a, &filtered.cov);
    let chol = Cholesky::new(&predicted_next.cov)?;
    let gain_t = chol.solve_mat(&apf);

    let mut mean_diff = smoothed_next.mean.clone();
    for i in 0..d {
        mean_diff[i] = mean_diff[i] - predicted_next.mean[i];
    }

    let mut mean = filtered.mean.clone();
    let corr = {
        // G v = (gain_tᵀ) v
        let mut out = mean.clone();
        for i in 0..d {
            let mut acc = S::zero();
            for l in 0..d {
                acc = acc + gain_t[[l, i]] * mean_diff[l];
            }
            out[i] = acc;
        }
        out
    };
    for i in 0..d {
        mean[i] = mean[i] + corr[i];
    }

    let mut cov_diff = smoothed_next.cov.clone();
    for i in 0..d {
        for l in 0..d {
            cov_diff[[i, l]] = cov_diff[[i, l]] - predicted_next.cov[[i, l]];
        }
    }

    // G (Pˢ − P⁻) Gᵀ = gain_tᵀ (Pˢ − P⁻) gain_t
    let tmp = mat_mul(&cov_diff, &gain_t);
    let mut cov = filtered.cov.clone();
    for i in 0..d {
        for l in 0..d {
            let mut acc = S::zero();
            for s in 0..d {
                acc = acc + gain_t[[s, i]] * tmp[[s, l]];
            }
            cov[[i, l]] = cov[[i, l]] + acc;
        }
    }
    symmetrize(&mut cov);

    for i in 0..d {
        if !cov[[i, i]].is_finite_value() {
            return Err(EngineError::NumericalFailure {
                step: 0,
                what: "smoothed variance became non-finite".to_string(),
            });
        }
    }

    Ok(Belief { mean, cov })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filter::{FilterInputs, SitePass, filter_pass};
    use crate::inference::{SiteGrid, SiteStrategy};
    use crate::kernels::{KernelHyper, MaternKernel, MaternNu};
    use crate::likelihoods::GaussianLikelihood;
    use crate::quadrature::GaussHermite;
    use ndarray::{Array1, Array2};

    fn run_filter_smoother(
        nu: MaternNu,
        t: &[f64],
        y_vals: &[f64],
        noise: f64,
    ) -> (FilterOutput<f64>, Vec<Vec<Belief<f64>>>) {
        let kernel = MaternKernel::new(nu);
        let hyp = KernelHyper {
            variance: 1.0,
            lengthscale: 1.5,
        };
        let steps: Vec<_> = t
            .windows(2)
            .map(|w| kernel.discretize(&hyp, w[1] - w[0]).unwrap())
            .collect();
        let pinf = kernel.stationary_covariance(&hyp);
        let y = Array2::from_shape_fn((t.len(), 1), |(k, _)| y_vals[k]);
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
        let mut sites = SiteGrid::vacuous(t.len(), 1);
        let out = filter_pass(&inputs, &mut sites, SitePass::AtPrediction).unwrap();
        let smoothed = smooth_pass(&steps, &out, usize::MAX).unwrap();
        (out, smoothed)
    }

    #[test]
    fn final_smoothed_state_equals_final_filtered_state() {
        let t = [0.0, 0.4, 1.0, 1.9];
        let y = [0.1, -0.3, 0.8, 0.2];
        let (out, smoothed) = run_filter_smoother(MaternNu::FiveHalves, &t, &y, 0.2);
        let last = t.len() - 1;
        for i in 0..3 {
            assert_eq!(smoothed[last][0].mean[i], out.filtered[last][0].mean[i]);
        }
    }

    #[test]
    fn smoothing_never_inflates_marginal_variance() {
        let t = [0.0, 0.5, 1.0, 1.5, 2.0];
        let y = [0.0, 0.4, -0.2, 0.6, 0.1];
        let (out, smoothed) = run_filter_smoother(MaternNu::ThreeHalves, &t, &y, 0.3);
        for k in 0..t.len() {
            let (_, vf) = out.filtered[k][0].marginal();
            let (_, vs) = smoothed[k][0].marginal();
            assert!(vs <= vf + 1e-12, "k={k}: {vs} > {vf}");
        }
    }

    #[test]
    fn indefinite_predicted_covariance_fails_the_gain_solve() {
        let kernel = MaternKernel::new(MaternNu::OneHalf);
        let hyp = KernelHyper {
            variance: 1.0,
            lengthscale: 1.0,
        };
        let steps = vec![kernel.discretize(&hyp, 0.5).unwrap()];
        let bel = |m: f64, v: f64| Belief {
            mean: Array1::from_elem(1, m),
            cov: Array2::from_elem((1, 1), v),
        };
        let out = FilterOutput {
            log_marginal: 0.0,
            predicted: vec![vec![bel(0.0, 1.0)], vec![bel(0.0, -1.0)]],
            filtered: vec![vec![bel(0.1, 0.8)], vec![bel(0.2, 0.7)]],
        };
        let err = smooth_pass(&steps, &out, usize::MAX).unwrap_err();
        assert!(matches!(
            err,
            EngineError::NumericalFailure { step: 0, .. }
        ));
    }

    #[test]
    fn smoothed_covariances_stay_symmetric_and_psd() {
        let t = [0.0, 0.3, 0.9, 1.4, 2.5];
        let y = [1.0, -0.5, 0.2, 0.8, -0.1];
        let (_, smoothed) = run_filter_smoother(MaternNu::FiveHalves, &t, &y, 0.05);
        for row in &smoothed {
            let cov = &row[0].cov;
            for i in 0..3 {
                for j in 0..3 {
                    assert_eq!(cov[[i, j]], cov[[j, i]]);
                }
            }
            let mut ridged = cov.clone();
            for i in 0..3 {
                ridged[[i, i]] += 1e-10;
            }
            assert!(Cholesky::new(&ridged).is_ok());
        }
    }
}
