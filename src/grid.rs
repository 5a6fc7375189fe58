//! Binning of raw event points onto a regular space-time grid.
//!
//! Count data for the Poisson engine comes from discretizing a point
//! pattern: the domain is split into `nt × nr` equal cells and each cell's
//! observation is the number of events falling inside it. Cell centers
//! become the temporal grid and spatial coordinates; the cell area is the
//! Poisson bin size.

use crate::model::EngineError;
use ndarray::Array2;

/// Events binned onto a regular grid.
#[derive(Debug, Clone)]
pub struct BinnedGrid {
    /// Temporal cell centers, strictly increasing, length `nt`.
    pub t_centers: Vec<f64>,
    /// Spatial cell centers, strictly increasing, length `nr`.
    pub r_centers: Vec<f64>,
    /// Event counts per cell, `nt × nr`.
    pub counts: Array2<f64>,
    /// Cell area, the Poisson bin size.
    pub cell_area: f64,
}

/// Bin `(t, r)` event points into `nt × nr` equal cells over
/// `bounds = [t_min, t_max, r_min, r_max]`. Points on the upper edges land
/// in the last cell; points outside the bounds are dropped.
pub fn discretize_points(
    points: &[(f64, f64)],
    bounds: [f64; 4],
    nt: usize,
    nr: usize,
) -> Result<BinnedGrid, EngineError> {
    let [t_min, t_max, r_min, r_max] = bounds;
    if nt == 0 || nr == 0 {
        return Err(EngineError::InvalidInput(format!(
            "grid must have at least one cell per axis, got {nt} × {nr}"
        )));
    }
    if !(t_max > t_min) || !(r_max > r_min) {
        return Err(EngineError::InvalidInput(format!(
            "degenerate bounds [{t_min}, {t_max}] × [{r_min}, {r_max}]"
        )));
    }

    let dt = (t_max - t_min) / nt as f64;
    let dr = (r_max - r_min) / nr as f64;
    let t_centers: Vec<f64> = (0..nt).map(|k| t_min + (k as f64 + 0.5) * dt).collect();
    let r_centers: Vec<f64> = (0..nr).map(|j| r_min + (j as f64 + 0.5) * dr).collect();

    let mut counts = Array2::zeros((nt, nr));
    let mut dropped = 0usize;
    for &(t, r) in points {
        if !(t_min..=t_max).contains(&t) || !(r_min..=r_max).contains(&r) {
            dropped += 1;
            continue;
        }
        let k = (((t - t_min) / dt) as usize).min(nt - 1);
        let j = (((r - r_min) / dr) as usize).min(nr - 1);
        counts[[k, j]] += 1.0;
    }
    if dropped > 0 {
        log::warn!("{dropped} of {} points fell outside the grid bounds", points.len());
    }

    Ok(BinnedGrid {
        t_centers,
        r_centers,
        counts,
        cell_area: dt * dr,
    })
}
