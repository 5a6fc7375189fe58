//! End-to-end behavior on a synthetic spatio-temporal log-Gaussian Cox
//! process: gradients agree with finite differences, gradient descent
//! improves the objective, pipelines and strategies are consistent, and
//! held-out scoring is well defined.

use ndarray::Array2;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand_distr::{Distribution, Poisson};
use sdegp::{
    HyperParams, InferenceConfig, MaternKernel, MaternNu, Pipeline, PoissonLikelihood,
    SiteStrategy, StateSpaceGp,
};

fn simulate_counts(nt: usize, nr: usize, seed: u64) -> (Vec<f64>, Array2<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let t: Vec<f64> = (0..nt).map(|k| 0.5 * k as f64).collect();
    let mut y = Array2::zeros((nt, nr));
    for k in 0..nt {
        for j in 0..nr {
            let latent = 0.8 * (0.4 * t[k]).sin() + 0.4 * (1.3 * j as f64).cos();
            let count = Poisson::new(latent.exp()).unwrap().sample(&mut rng);
            y[[k, j]] = count;
        }
    }
    (t, y)
}

fn poisson_model(
    t: Vec<f64>,
    y: Array2<f64>,
    strategy: SiteStrategy,
    config: InferenceConfig,
) -> StateSpaceGp<PoissonLikelihood> {
    StateSpaceGp::new(
        MaternKernel::new(MaternNu::ThreeHalves),
        PoissonLikelihood::default(),
        strategy,
        t,
        y,
        config,
    )
    .unwrap()
}

/// Fixed pass count: early stopping off so the objective is a smooth
/// deterministic function of the hyperparameters.
fn fixed_pass_config(passes: usize) -> InferenceConfig {
    InferenceConfig {
        passes,
        site_tolerance: 0.0,
        ..InferenceConfig::default()
    }
}

#[test]
fn gradient_matches_central_differences() {
    let (t, y) = simulate_counts(20, 3, 11);
    let model = poisson_model(
        t,
        y,
        SiteStrategy::Extended { damping: 0.5 },
        fixed_pass_config(5),
    );
    let hyp = HyperParams::from_constrained(0.9, 1.6, &[]);

    let (nlml, grad) = model.nlml_with_grad(&hyp).unwrap();
    assert!(nlml.is_finite());

    let flat = hyp.flat();
    let h = 1e-5;
    for i in 0..flat.len() {
        let mut hp = hyp.clone();
        let mut shifted = flat.clone();
        shifted[i] += h;
        hp.set_flat(&shifted);
        let up = model.nlml(&hp).unwrap();
        shifted[i] -= 2.0 * h;
        hp.set_flat(&shifted);
        let down = model.nlml(&hp).unwrap();
        let fd = (up - down) / (2.0 * h);
        assert!(
            (grad[i] - fd).abs() < 1e-4 * (1.0 + fd.abs()),
            "param {i}: ad {} vs fd {fd}",
            grad[i]
        );
    }
}

#[test]
fn nlml_decreases_under_small_gradient_steps() {
    let (t, y) = simulate_counts(25, 4, 3);
    let model = poisson_model(
        t,
        y,
        SiteStrategy::Extended { damping: 0.5 },
        fixed_pass_config(5),
    );
    let mut hyp = HyperParams::from_constrained(2.0, 0.6, &[]);

    let mut theta = hyp.flat();
    let (mut prev, _) = model.nlml_with_grad(&hyp).unwrap();
    for _ in 0..4 {
        let (_, grad) = model.nlml_with_grad(&hyp).unwrap();
        for (ti, gi) in theta.iter_mut().zip(grad.iter()) {
            *ti -= 1e-3 * gi;
        }
        hyp.set_flat(&theta);
        let next = model.nlml(&hyp).unwrap();
        assert!(next < prev, "objective rose from {prev} to {next}");
        prev = next;
    }
}

#[test]
fn fused_and_two_stage_pipelines_agree() {
    let (t, y) = simulate_counts(18, 3, 21);
    let hyp = HyperParams::from_constrained(1.1, 1.2, &[]);

    let fused = poisson_model(
        t.clone(),
        y.clone(),
        SiteStrategy::Extended { damping: 0.7 },
        fixed_pass_config(6),
    );
    let two_stage = poisson_model(
        t,
        y,
        SiteStrategy::Extended { damping: 0.7 },
        InferenceConfig {
            pipeline: Pipeline::TwoStage,
            ..fixed_pass_config(6)
        },
    );

    let a = fused.nlml(&hyp).unwrap();
    let b = two_stage.nlml(&hyp).unwrap();
    assert!((a - b).abs() < 1e-9, "fused {a} vs two-stage {b}");

    let pa = fused.posterior(&hyp).unwrap();
    let pb = two_stage.posterior(&hyp).unwrap();
    for (ma, mb) in pa.mean.iter().zip(pb.mean.iter()) {
        assert!((ma - mb).abs() < 1e-9);
    }
}

#[test]
fn damped_iteration_reaches_the_undamped_fixed_point() {
    let (t, y) = simulate_counts(15, 2, 8);
    let hyp = HyperParams::from_constrained(0.8, 1.5, &[]);

    let converged = |damping: f64| {
        let config = InferenceConfig {
            passes: 60,
            site_tolerance: 1e-12,
            ..InferenceConfig::default()
        };
        let model = poisson_model(
            t.clone(),
            y.clone(),
            SiteStrategy::Extended { damping },
            config,
        );
        model.nlml(&hyp).unwrap()
    };

    let undamped = converged(1.0);
    let damped = converged(0.5);
    assert!(
        (undamped - damped).abs() < 1e-6,
        "undamped {undamped} vs damped {damped}"
    );
}

#[test]
fn expectation_propagation_runs_and_stays_close_to_the_linearized_strategy() {
    let (t, y) = simulate_counts(15, 2, 14);
    let hyp = HyperParams::from_constrained(0.8, 1.5, &[]);
    let config = InferenceConfig {
        passes: 30,
        site_tolerance: 1e-10,
        ..InferenceConfig::default()
    };

    let extended = poisson_model(
        t.clone(),
        y.clone(),
        SiteStrategy::Extended { damping: 0.8 },
        config.clone(),
    );
    let ep = poisson_model(
        t,
        y,
        SiteStrategy::ExpectationPropagation { damping: 0.8 },
        config,
    );

    let a = extended.nlml(&hyp).unwrap();
    let b = ep.nlml(&hyp).unwrap();
    assert!(a.is_finite() && b.is_finite());
    // Different approximations of the same posterior, so close but not equal.
    assert!((a - b).abs() < 0.5 * (1.0 + a.abs()), "extended {a} vs ep {b}");

    let post = ep.posterior(&hyp).unwrap();
    for v in post.variance.iter() {
        assert!(*v > 0.0 && v.is_finite());
    }
}

#[test]
fn held_out_nlpd_is_finite() {
    let (t, y) = simulate_counts(24, 3, 5);
    let (train_t, test_t) = t.split_at(18);
    let train_y = y.slice(ndarray::s![..18, ..]).to_owned();
    let test_y = y.slice(ndarray::s![18.., ..]).to_owned();

    let model = poisson_model(
        train_t.to_vec(),
        train_y,
        SiteStrategy::Extended { damping: 0.5 },
        fixed_pass_config(6),
    );
    let hyp = HyperParams::from_constrained(1.0, 1.5, &[]);

    let nlpd = model.nlpd(&hyp, test_t, &test_y).unwrap();
    assert!(nlpd.is_finite());
    assert!(nlpd > 0.0);
}

#[test]
fn missing_cells_are_skipped_without_breaking_gradients() {
    let (t, mut y) = simulate_counts(16, 2, 30);
    y[[3, 0]] = f64::NAN;
    y[[7, 1]] = f64::NAN;
    y[[8, 0]] = f64::NAN;

    let model = poisson_model(
        t,
        y,
        SiteStrategy::Extended { damping: 0.6 },
        fixed_pass_config(5),
    );
    let hyp = HyperParams::from_constrained(1.0, 1.0, &[]);
    let (nlml, grad) = model.nlml_with_grad(&hyp).unwrap();
    assert!(nlml.is_finite());
    assert!(grad.iter().all(|g| g.is_finite()));
}
