use clap::{Parser, ValueEnum};
use csv::{ReaderBuilder, WriterBuilder};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::{Distribution, Poisson};
use sdegp::{
    BinnedGrid, HyperParams, InferenceConfig, MaternKernel, MaternNu, Pipeline,
    PoissonLikelihood, SiteStrategy, StateSpaceGp, discretize_points,
};
use std::path::PathBuf;
use std::time::Instant;

#[derive(Parser, Debug)]
#[command(name = "sdegp")]
#[command(about = "State-space GP inference for log-Gaussian Cox processes", long_about = None)]
struct Cli {
    /// CSV of event points with two columns `t,r`; a synthetic point
    /// pattern is simulated when omitted.
    #[arg(long)]
    data: Option<PathBuf>,

    /// Temporal cells.
    #[arg(long, default_value_t = 50)]
    nt: usize,

    /// Spatial cells.
    #[arg(long, default_value_t = 5)]
    nr: usize,

    /// Domain bounds: t_min,t_max,r_min,r_max.
    #[arg(long, value_delimiter = ',', num_args = 4, default_values_t = vec![0.0, 10.0, 0.0, 1.0])]
    bounds: Vec<f64>,

    #[arg(long, value_enum, default_value_t = KernelArg::Matern52)]
    kernel: KernelArg,

    #[arg(long, value_enum, default_value_t = StrategyArg::Extended)]
    strategy: StrategyArg,

    /// Site damping factor in (0, 1].
    #[arg(long, default_value_t = 0.5)]
    damping: f64,

    /// Filter/smoother passes per marginal-likelihood evaluation.
    #[arg(long, default_value_t = 5)]
    passes: usize,

    /// Adam iterations.
    #[arg(long, default_value_t = 100)]
    iters: usize,

    /// Adam learning rate.
    #[arg(long, default_value_t = 0.1)]
    lr: f64,

    /// Seed for the synthetic point pattern.
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Posterior output CSV (t, r, mean, variance, intensity).
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KernelArg {
    Matern12,
    Matern32,
    Matern52,
}

impl From<KernelArg> for MaternNu {
    fn from(arg: KernelArg) -> Self {
        match arg {
            KernelArg::Matern12 => MaternNu::OneHalf,
            KernelArg::Matern32 => MaternNu::ThreeHalves,
            KernelArg::Matern52 => MaternNu::FiveHalves,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StrategyArg {
    Extended,
    Ep,
}

fn main() {
    if let Err(e) = run() {
        eprintln!("error: {e}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), String> {
    env_logger::init();
    let cli = Cli::parse();

    let bounds: [f64; 4] = cli
        .bounds
        .clone()
        .try_into()
        .map_err(|_| "expected four bound values".to_string())?;

    let points = match &cli.data {
        Some(path) => load_points(path)?,
        None => {
            let pts = simulate_points(bounds, cli.seed)?;
            log::info!("simulated {} events", pts.len());
            pts
        }
    };

    let grid = discretize_points(&points, bounds, cli.nt, cli.nr).map_err(|e| e.to_string())?;
    let total: f64 = grid.counts.iter().sum();
    log::info!(
        "binned {total} events onto a {} x {} grid (cell area {:.4})",
        cli.nt,
        cli.nr,
        grid.cell_area
    );

    let strategy = match cli.strategy {
        StrategyArg::Extended => SiteStrategy::Extended {
            damping: cli.damping,
        },
        StrategyArg::Ep => SiteStrategy::ExpectationPropagation {
            damping: cli.damping,
        },
    };
    let config = InferenceConfig {
        passes: cli.passes,
        pipeline: Pipeline::Fused,
        ..InferenceConfig::default()
    };
    let model = StateSpaceGp::new(
        MaternKernel::new(cli.kernel.into()),
        PoissonLikelihood {
            binsize: grid.cell_area,
        },
        strategy,
        grid.t_centers.clone(),
        grid.counts.clone(),
        config,
    )
    .map_err(|e| e.to_string())?;

    // Initial lengthscale at a fifth of the temporal extent.
    let mut hyp = HyperParams::from_constrained(1.0, (bounds[1] - bounds[0]) / 5.0, &[]);
    let start = Instant::now();
    optimize(&model, &mut hyp, cli.iters, cli.lr)?;
    log::info!("optimization took {:.2?}", start.elapsed());

    let posterior = model.posterior(&hyp).map_err(|e| e.to_string())?;
    let (variance, lengthscale) = hyp.constrained_kernel();
    log::info!(
        "final nlml {:.4}, variance {variance:.4}, lengthscale {lengthscale:.4}, converged: {}",
        -posterior.log_marginal,
        posterior.converged
    );

    if let Some(out) = &cli.out {
        write_posterior(out, &grid, &posterior.mean, &posterior.variance)?;
        log::info!("posterior written to {}", out.display());
    }
    Ok(())
}

/// Adam over the unconstrained hyperparameters. A numerical failure inside
/// an evaluation halves the learning rate and retries from the current
/// iterate instead of aborting.
fn optimize(
    model: &StateSpaceGp<PoissonLikelihood>,
    hyp: &mut HyperParams,
    iters: usize,
    lr0: f64,
) -> Result<(), String> {
    const BETA1: f64 = 0.9;
    const BETA2: f64 = 0.999;
    const EPS: f64 = 1e-8;

    let mut theta = hyp.flat();
    let mut last_good = theta.clone();
    let mut m = vec![0.0; theta.len()];
    let mut v = vec![0.0; theta.len()];
    let mut lr = lr0;
    let mut step = 0usize;

    for iter in 0..iters {
        hyp.set_flat(&theta);
        let (nlml, grad) = match model.nlml_with_grad(hyp) {
            Ok(pair) => pair,
            Err(sdegp::EngineError::NumericalFailure { step, what }) => {
                // Roll back to the last iterate that evaluated cleanly and
                // take smaller steps from there.
                lr /= 2.0;
                theta = last_good.clone();
                log::warn!(
                    "iter {iter}: numerical failure at step {step} ({what}); halved learning rate to {lr:.3e}"
                );
                if lr < 1e-12 {
                    return Err("learning rate collapsed without recovering".to_string());
                }
                continue;
            }
            Err(e) => return Err(e.to_string()),
        };

        last_good = theta.clone();
        step += 1;
        let t = step as f64;
        for i in 0..theta.len() {
            m[i] = BETA1 * m[i] + (1.0 - BETA1) * grad[i];
            v[i] = BETA2 * v[i] + (1.0 - BETA2) * grad[i] * grad[i];
            let m_hat = m[i] / (1.0 - BETA1.powf(t));
            let v_hat = v[i] / (1.0 - BETA2.powf(t));
            theta[i] -= lr * m_hat / (v_hat.sqrt() + EPS);
        }

        hyp.set_flat(&theta);
        let (variance, lengthscale) = hyp.constrained_kernel();
        log::info!(
            "iter {iter}: nlml {nlml:.4}, variance {variance:.4}, lengthscale {lengthscale:.4}"
        );
    }
    hyp.set_flat(&theta);
    Ok(())
}

fn load_points(path: &PathBuf) -> Result<Vec<(f64, f64)>, String> {
    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_path(path)
        .map_err(|e| format!("cannot open {}: {e}", path.display()))?;

    let mut points = Vec::new();
    for (i, record) in reader.records().enumerate() {
        let record = record.map_err(|e| format!("bad CSV record: {e}"))?;
        if record.len() < 2 {
            return Err(format!("record {i} has fewer than two fields"));
        }
        let t = record[0].trim().parse::<f64>();
        let r = record[1].trim().parse::<f64>();
        match (t, r) {
            (Ok(t), Ok(r)) => points.push((t, r)),
            // A non-numeric first record is a header row.
            _ if i == 0 => continue,
            _ => return Err(format!("record {i} is not a pair of numbers")),
        }
    }
    Ok(points)
}

/// Inhomogeneous Poisson point pattern from a smooth log-intensity,
/// simulated on a fine grid of subcells.
fn simulate_points(bounds: [f64; 4], seed: u64) -> Result<Vec<(f64, f64)>, String> {
    const SUB_T: usize = 400;
    const SUB_R: usize = 40;

    let [t_min, t_max, r_min, r_max] = bounds;
    let dt = (t_max - t_min) / SUB_T as f64;
    let dr = (r_max - r_min) / SUB_R as f64;
    let area = dt * dr;

    let mut rng = StdRng::seed_from_u64(seed);
    let mut points = Vec::new();
    for k in 0..SUB_T {
        let t = t_min + (k as f64 + 0.5) * dt;
        for j in 0..SUB_R {
            let r = r_min + (j as f64 + 0.5) * dr;
            let log_intensity = 1.5 + 0.8 * (0.7 * t).sin() + 0.5 * (3.0 * r).cos();
            let rate = area * log_intensity.exp();
            let poisson = Poisson::new(rate).map_err(|e| e.to_string())?;
            let count = poisson.sample(&mut rng) as usize;
            for _ in 0..count {
                points.push((
                    t + dt * (rng.random_range(0.0..1.0) - 0.5),
                    r + dr * (rng.random_range(0.0..1.0) - 0.5),
                ));
            }
        }
    }
    Ok(points)
}

fn write_posterior(
    path: &PathBuf,
    grid: &BinnedGrid,
    mean: &ndarray::Array2<f64>,
    variance: &ndarray::Array2<f64>,
) -> Result<(), String> {
    let mut writer = WriterBuilder::new()
        .from_path(path)
        .map_err(|e| format!("cannot write {}: {e}", path.display()))?;
    writer
        .write_record(["t", "r", "mean", "variance", "intensity"])
        .map_err(|e| e.to_string())?;
    for (k, &t) in grid.t_centers.iter().enumerate() {
        for (j, &r) in grid.r_centers.iter().enumerate() {
            let m = mean[[k, j]];
            let v = variance[[k, j]];
            // Posterior mean of the intensity per unit area, E[e^f].
            let intensity = (m + 0.5 * v).exp();
            writer
                .write_record([
                    t.to_string(),
                    r.to_string(),
                    m.to_string(),
                    v.to_string(),
                    intensity.to_string(),
                ])
                .map_err(|e| e.to_string())?;
        }
    }
    writer.flush().map_err(|e| e.to_string())
}
