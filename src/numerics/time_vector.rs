//! Output time grids for the transient solver.
//!
//! Every constructor returns a strictly increasing vector whose first entry is
//! exactly `0` and whose last entry is exactly the requested duration.

use serde::{Deserialize, Serialize};

use crate::error::SimulationError;

fn check(duration: f64, n_points: usize) -> Result<(), SimulationError> {
    if !(duration.is_finite() && duration > 0.0) {
        return Err(SimulationError::InvalidTimeVector(format!(
            "duration must be positive and finite, got {duration}"
        )));
    }
    if n_points < 2 {
        return Err(SimulationError::InvalidTimeVector(format!(
            "need at least 2 time points, got {n_points}"
        )));
    }
    Ok(())
}

pub fn uniform(duration: f64, n_points: usize) -> Result<Vec<f64>, SimulationError> {
    check(duration, n_points)?;
    let dt = duration / (n_points - 1) as f64;
    let mut tvec: Vec<f64> = (0..n_points).map(|i| i as f64 * dt).collect();
    tvec[n_points - 1] = duration;
    Ok(tvec)
}

/// Log-spaced grid `t_i = (1 + T)^(i/(n-1)) - 1`, dense at early times.
pub fn logarithmic(duration: f64, n_points: usize) -> Result<Vec<f64>, SimulationError> {
    check(duration, n_points)?;
    let base = duration.ln_1p();
    let mut tvec: Vec<f64> = (0..n_points)
        .map(|i| (base * i as f64 / (n_points - 1) as f64).exp_m1())
        .collect();
    tvec[0] = 0.0;
    tvec[n_points - 1] = duration;
    Ok(tvec)
}

/// Re-space an existing grid logarithmically, keeping its length and end time.
pub fn to_log_scale(tvec: &[f64]) -> Result<Vec<f64>, SimulationError> {
    let duration = tvec.last().copied().unwrap_or(0.0);
    logarithmic(duration, tvec.len())
}

/// Bounds for [`optimal`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct OptimalTvecConfig {
    pub min_points: usize,
    pub max_points: usize,
    /// Fraction of the diffusive time scale `h²/D` used as the reference step.
    pub step_fraction: f64,
}

impl Default for OptimalTvecConfig {
    fn default() -> Self {
        Self {
            min_points: 100,
            max_points: 3000,
            step_fraction: 0.1,
        }
    }
}

/// Log-spaced grid whose length balances the diffusive time scale of the
/// smallest cell (`h_min²/D`) against the total duration.
pub fn optimal(
    duration: f64,
    h_min: f64,
    diffusion: f64,
    cfg: &OptimalTvecConfig,
) -> Result<Vec<f64>, SimulationError> {
    if !(h_min > 0.0 && diffusion > 0.0) {
        return Err(SimulationError::InvalidTimeVector(format!(
            "optimal time vector needs positive cell size and D, got h={h_min}, D={diffusion}"
        )));
    }
    let dt_ref = cfg.step_fraction * h_min * h_min / diffusion;
    let n = ((duration / dt_ref).round() as usize + 1).clamp(cfg.min_points, cfg.max_points);
    logarithmic(duration, n)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_grid_keeps_endpoints_and_is_increasing() {
        let t = logarithmic(1500.0, 301).unwrap();
        assert_eq!(t[0], 0.0);
        assert_eq!(*t.last().unwrap(), 1500.0);
        assert!(t.windows(2).all(|w| w[1] > w[0]));
        assert!(t[1] - t[0] < t[300] - t[299]);
    }

    #[test]
    fn log_grid_stays_increasing_for_tiny_durations() {
        let t = logarithmic(1e-17, 5).unwrap();
        assert_eq!(t[0], 0.0);
        assert_eq!(t[4], 1e-17);
        assert!(t.windows(2).all(|w| w[1] > w[0]), "{t:?}");
    }

    #[test]
    fn optimal_grid_respects_bounds() {
        let cfg = OptimalTvecConfig::default();
        let t = optimal(10.0, 100.0, 1.0, &cfg).unwrap();
        assert_eq!(t.len(), cfg.min_points);
        let t = optimal(1e6, 1.0, 100.0, &cfg).unwrap();
        assert_eq!(t.len(), cfg.max_points);
        assert_eq!(*t.last().unwrap(), 1e6);
    }

    #[test]
    fn rejects_degenerate_requests() {
        assert!(uniform(0.0, 10).is_err());
        assert!(uniform(1.0, 1).is_err());
    }
}
