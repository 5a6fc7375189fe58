//! Matérn kernels and their linear SDE representations.
//!
//! A stationary Matérn kernel with half-integer smoothness is the
//! autocovariance of a linear time-invariant SDE, which is what lets the
//! engine replace dense Gram-matrix inversion with a sequential filter. For
//! ν = p + 1/2 the state dimension is `d = p + 1` and the feedback matrix
//! `F` has the single eigenvalue `-λ` with multiplicity `d`, so
//! `N = F + λI` is nilpotent and the matrix exponential truncates exactly:
//!
//! `A(Δt) = e^{-λΔt} Σ_{k<d} Nᵏ Δtᵏ / k!`
//!
//! The stationary discretization `Q(Δt) = Pinf − A Pinf Aᵀ` then reproduces
//! the kernel autocovariance at every lag, so there is no discretization
//! bias and the semigroup property `A(Δt₁)A(Δt₂) = A(Δt₁+Δt₂)` holds.

use crate::linalg::{sandwich, symmetrize};
use crate::model::EngineError;
use crate::scalar::{Scalar, softplus};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Number of kernel hyperparameters (variance, lengthscale).
pub const KERNEL_HYPER_LEN: usize = 2;

/// Matérn smoothness selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MaternNu {
    OneHalf,
    ThreeHalves,
    FiveHalves,
}

/// Constrained kernel hyperparameters.
#[derive(Debug, Clone, Copy)]
pub struct KernelHyper<S> {
    pub variance: S,
    pub lengthscale: S,
}

impl<S: Scalar> KernelHyper<S> {
    /// Map the unconstrained pair through softplus.
    pub fn from_unconstrained(raw: &[S]) -> Self {
        debug_assert_eq!(raw.len(), KERNEL_HYPER_LEN);
        Self {
            variance: softplus(raw[0]),
            lengthscale: softplus(raw[1]),
        }
    }
}

/// A Markov-equivalent stationary kernel on the temporal axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MaternKernel {
    pub nu: MaternNu,
}

impl MaternKernel {
    pub fn new(nu: MaternNu) -> Self {
        Self { nu }
    }

    /// SDE state dimension per spatial site.
    pub fn state_dim(&self) -> usize {
        match self.nu {
            MaternNu::OneHalf => 1,
            MaternNu::ThreeHalves => 2,
            MaternNu::FiveHalves => 3,
        }
    }

    /// Decay rate `λ = sqrt(2ν) / lengthscale`.
    fn lambda<S: Scalar>(&self, hyp: &KernelHyper<S>) -> S {
        let sqrt_2nu = match self.nu {
            MaternNu::OneHalf => 1.0,
            MaternNu::ThreeHalves => 3.0_f64.sqrt(),
            MaternNu::FiveHalves => 5.0_f64.sqrt(),
        };
        S::from_f64(sqrt_2nu) / hyp.lengthscale
    }

    /// Stationary state covariance `Pinf` (the prior covariance of the
    /// state vector; its (0,0) entry is the kernel variance).
    pub fn stationary_covariance<S: Scalar>(&self, hyp: &KernelHyper<S>) -> Array2<S> {
        let var = hyp.variance;
        let lam = self.lambda(hyp);
        match self.nu {
            MaternNu::OneHalf => {
                let mut p = Array2::from_elem((1, 1), S::zero());
                p[[0, 0]] = var;
                p
            }
            MaternNu::ThreeHalves => {
                let mut p = Array2::from_elem((2, 2), S::zero());
                p[[0, 0]] = var;
                p[[1, 1]] = lam * lam * var;
                p
            }
            MaternNu::FiveHalves => {
                let lam2 = lam * lam;
                let kappa = lam2 * var / S::from_f64(3.0);
                let mut p = Array2::from_elem((3, 3), S::zero());
                p[[0, 0]] = var;
                p[[1, 1]] = kappa;
                p[[2, 2]] = lam2 * lam2 * var;
                p[[0, 2]] = S::zero() - kappa;
                p[[2, 0]] = S::zero() - kappa;
                p
            }
        }
    }

    /// Exact transition matrix over a step of length `dt > 0`.
    pub fn transition<S: Scalar>(
        &self,
        hyp: &KernelHyper<S>,
        dt: f64,
    ) -> Result<Array2<S>, EngineError> {
        if !(dt.is_finite() && dt > 0.0) {
            return Err(EngineError::InvalidInput(format!(
                "step spacing must be positive and finite, got {dt}"
            )));
        }
        let lam = self.lambda(hyp);
        let dt_s = S::from_f64(dt);
        let decay = (S::zero() - lam * dt_s).exp();

        let a = match self.nu {
            MaternNu::OneHalf => {
                let mut a = Array2::from_elem((1, 1), S::zero());
                a[[0, 0]] = S::one();
                a
            }
            MaternNu::ThreeHalves => {
                // N = F + λI for F = [[0,1],[-λ², -2λ]]; N² = 0.
                let mut a = Array2::from_elem((2, 2), S::zero());
                a[[0, 0]] = S::one() + lam * dt_s;
                a[[0, 1]] = dt_s;
                a[[1, 0]] = S::zero() - lam * lam * dt_s;
                a[[1, 1]] = S::one() - lam * dt_s;
                a
            }
            MaternNu::FiveHalves => {
                // N = F + λI for F with last row [-λ³, -3λ², -3λ]; N³ = 0.
                let lam2 = lam * lam;
                let lam3 = lam2 * lam;
                let mut n = Array2::from_elem((3, 3), S::zero());
                n[[0, 0]] = lam;
                n[[0, 1]] = S::one();
                n[[1, 1]] = lam;
                n[[1, 2]] = S::one();
                n[[2, 0]] = S::zero() - lam3;
                n[[2, 1]] = S::from_f64(-3.0) * lam2;
                n[[2, 2]] = S::from_f64(-2.0) * lam;

                let n2 = crate::linalg::mat_mul(&n, &n);
                let half_dt2 = S::from_f64(0.5 * dt * dt);
                let mut a = Array2::from_elem((3, 3), S::zero());
                for i in 0..3 {
                    a[[i, i]] = S::one();
                    for j in 0..3 {
                        a[[i, j]] = a[[i, j]] + n[[i, j]] * dt_s + n2[[i, j]] * half_dt2;
                    }
                }
                a
            }
        };

        // common e^{-λΔt} factor
        let mut out = a;
        for v in out.iter_mut() {
            *v = *v * decay;
        }
        Ok(out)
    }

    /// Process noise of the stationary discretization,
    /// `Q = Pinf − A Pinf Aᵀ`, symmetrized.
    pub fn process_noise<S: Scalar>(&self, hyp: &KernelHyper<S>, a: &Array2<S>) -> Array2<S> {
        let pinf = self.stationary_covariance(hyp);
        let propagated = sandwich(a, &pinf);
        let mut q = Array2::from_elem(pinf.dim(), S::zero());
        for (i, v) in q.iter_mut().enumerate() {
            let (r, c) = (i / pinf.ncols(), i % pinf.ncols());
            *v = pinf[[r, c]] - propagated[[r, c]];
        }
        symmetrize(&mut q);
        q
    }

    /// `(A, Q)` for one step.
    pub fn discretize<S: Scalar>(
        &self,
        hyp: &KernelHyper<S>,
        dt: f64,
    ) -> Result<(Array2<S>, Array2<S>), EngineError> {
        let a = self.transition(hyp, dt)?;
        let q = self.process_noise(hyp, &a);
        Ok((a, q))
    }

    /// Kernel autocovariance `k(τ)` (used by the dense oracle).
    pub fn autocovariance<S: Scalar>(&self, hyp: &KernelHyper<S>, tau: f64) -> S {
        let lam = self.lambda(hyp);
        let t = S::from_f64(tau.abs());
        let decay = (S::zero() - lam * t).exp();
        match self.nu {
            MaternNu::OneHalf => hyp.variance * decay,
            MaternNu::ThreeHalves => hyp.variance * (S::one() + lam * t) * decay,
            MaternNu::FiveHalves => {
                let lt = lam * t;
                hyp.variance * (S::one() + lt + lt * lt / S::from_f64(3.0)) * decay
            }
        }
    }
}
