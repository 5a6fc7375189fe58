//! The discretization is exact for Markov kernels: transitions compose
//! over time and the discretized process reproduces the stationary
//! autocovariance.

use sdegp::{KernelHyper, MaternKernel, MaternNu};

const ALL_NUS: [MaternNu; 3] = [
    MaternNu::OneHalf,
    MaternNu::ThreeHalves,
    MaternNu::FiveHalves,
];

fn hyper() -> KernelHyper<f64> {
    KernelHyper {
        variance: 1.8,
        lengthscale: 0.9,
    }
}

#[test]
fn transitions_compose_over_time() {
    let hyp = hyper();
    for nu in ALL_NUS {
        let kernel = MaternKernel::new(nu);
        let d = kernel.state_dim();
        for (dt1, dt2) in [(0.3, 0.7), (0.05, 1.9), (2.4, 2.4)] {
            let a1 = kernel.transition(&hyp, dt1).unwrap();
            let a2 = kernel.transition(&hyp, dt2).unwrap();
            let a12 = kernel.transition(&hyp, dt1 + dt2).unwrap();
            for i in 0..d {
                for j in 0..d {
                    let mut composed = 0.0;
                    for l in 0..d {
                        composed += a2[[i, l]] * a1[[l, j]];
                    }
                    assert!(
                        (composed - a12[[i, j]]).abs() < 1e-12,
                        "{nu:?} [{i},{j}]: {composed} vs {}",
                        a12[[i, j]]
                    );
                }
            }
        }
    }
}

#[test]
fn process_noise_composes_over_time() {
    // Q(dt1 + dt2) = A(dt2) Q(dt1) A(dt2)ᵀ + Q(dt2)
    let hyp = hyper();
    for nu in ALL_NUS {
        let kernel = MaternKernel::new(nu);
        let d = kernel.state_dim();
        let (dt1, dt2) = (0.4, 1.1);
        let (a2, q2) = kernel.discretize(&hyp, dt2).unwrap();
        let (_, q1) = kernel.discretize(&hyp, dt1).unwrap();
        let (_, q12) = kernel.discretize(&hyp, dt1 + dt2).unwrap();

        for i in 0..d {
            for j in 0..d {
                let mut prop = q2[[i, j]];
                for l in 0..d {
                    for s in 0..d {
                        prop += a2[[i, l]] * q1[[l, s]] * a2[[j, s]];
                    }
                }
                assert!(
                    (prop - q12[[i, j]]).abs() < 1e-11,
                    "{nu:?} [{i},{j}]: {prop} vs {}",
                    q12[[i, j]]
                );
            }
        }
    }
}

#[test]
fn discretized_process_reproduces_the_autocovariance() {
    // cov(f(t+τ), f(t)) at stationarity is the first entry of A(τ) Pinf.
    let hyp = hyper();
    for nu in ALL_NUS {
        let kernel = MaternKernel::new(nu);
        let d = kernel.state_dim();
        let pinf = kernel.stationary_covariance(&hyp);
        for tau in [0.1, 0.8, 2.5, 7.0] {
            let a = kernel.transition(&hyp, tau).unwrap();
            let mut cov = 0.0;
            for l in 0..d {
                cov += a[[0, l]] * pinf[[l, 0]];
            }
            let k_tau = kernel.autocovariance(&hyp, tau);
            assert!(
                (cov - k_tau).abs() < 1e-12,
                "{nu:?} τ={tau}: {cov} vs {k_tau}"
            );
        }
    }
}

#[test]
fn stationary_variance_matches_the_kernel_variance() {
    let hyp = hyper();
    for nu in ALL_NUS {
        let kernel = MaternKernel::new(nu);
        let pinf = kernel.stationary_covariance(&hyp);
        assert!((pinf[[0, 0]] - hyp.variance).abs() < 1e-14);
        assert!((kernel.autocovariance(&hyp, 0.0) - hyp.variance).abs() < 1e-14);
    }
}

#[test]
fn non_positive_or_nan_steps_are_rejected() {
    let hyp = hyper();
    for nu in ALL_NUS {
        let kernel = MaternKernel::new(nu);
        assert!(kernel.transition(&hyp, 0.0).is_err());
        assert!(kernel.transition(&hyp, -0.5).is_err());
        assert!(kernel.transition(&hyp, f64::NAN).is_err());
    }
}
