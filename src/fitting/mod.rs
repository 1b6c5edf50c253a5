//! Nonlinear fits of simulated ROI series against measured ones.
//!
//! A [`Fit`] selects ROIs, a parameter box over `[D, production, degradation,
//! time offset]` and an objective strategy, then drives an [`Optimizer`]
//! that repeatedly runs a trial [`Simulation`].

pub mod optimizer;
pub mod pinning;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::discretization::Mesh;
use crate::error::{FitError, FitFailure, OutOfRangeError, RoiError, SimulationError};
use crate::models::ReactionDiffusionParams;
use crate::numerics::interp::interp_linear;
use crate::processing::summary::FitReport;
use crate::roi::{RoiSet, ALL, BLEACHED_SQUARE};
use crate::simulation::Simulation;

pub use optimizer::{NelderMead, OptimizeResult, Optimizer};
pub use pinning::{pin_rois, PinValues, Series};

pub const PARAM_NAMES: [&str; 4] = ["diffusion", "production", "degradation", "time_offset"];

/// Start value and box of one parameter. A fixed parameter stays at `x0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParameterSpec {
    pub x0: f64,
    pub lower: f64,
    pub upper: f64,
    pub free: bool,
}

impl ParameterSpec {
    pub fn free(x0: f64, lower: f64, upper: f64) -> Self {
        Self {
            x0,
            lower,
            upper,
            free: true,
        }
    }

    pub fn fixed(value: f64) -> Self {
        Self {
            x0: value,
            lower: value,
            upper: value,
            free: false,
        }
    }

    /// Range the parameter can take during the fit.
    fn range(&self) -> (f64, f64) {
        if self.free {
            (self.lower, self.upper)
        } else {
            (self.x0, self.x0)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitParameters {
    pub diffusion: ParameterSpec,
    pub production: ParameterSpec,
    pub degradation: ParameterSpec,
    pub time_offset: ParameterSpec,
}

impl Default for FitParameters {
    fn default() -> Self {
        Self {
            diffusion: ParameterSpec::free(50.0, 0.01, 1.0e4),
            production: ParameterSpec::fixed(0.0),
            degradation: ParameterSpec::fixed(0.0),
            time_offset: ParameterSpec::fixed(0.0),
        }
    }
}

impl FitParameters {
    pub fn specs(&self) -> [ParameterSpec; 4] {
        [
            self.diffusion,
            self.production,
            self.degradation,
            self.time_offset,
        ]
    }

    fn validate(&self) -> Result<(), FitError> {
        for (name, p) in PARAM_NAMES.iter().zip(self.specs()) {
            if !(p.x0.is_finite() && p.lower.is_finite() && p.upper.is_finite()) {
                return Err(FitError::InvalidBounds(format!("{name}: non-finite value")));
            }
            if p.free && !(p.lower <= p.x0 && p.x0 <= p.upper) {
                return Err(FitError::InvalidBounds(format!(
                    "{name}: x0 = {} outside [{}, {}]",
                    p.x0, p.lower, p.upper
                )));
            }
        }
        let (d_lo, _) = self.diffusion.range();
        if d_lo < 0.0 {
            return Err(FitError::InvalidBounds(format!(
                "diffusion lower bound {d_lo} is negative"
            )));
        }
        Ok(())
    }
}

/// How a trial parameter vector is turned into simulated series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FitStrategy {
    /// One simulation run per objective evaluation.
    FullSimulation,
    /// One reference run at `D_ref`; trial series are read off it at
    /// rescaled times `t · D / D_ref`. Pure diffusion only.
    TimeScaling,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorNorm {
    L2,
    L1,
}

impl ErrorNorm {
    fn apply(self, diff: f64) -> f64 {
        match self {
            ErrorNorm::L2 => diff * diff,
            ErrorNorm::L1 => diff.abs(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FitResult {
    /// Full `[D, production, degradation, time_offset]` vector.
    pub x: [f64; 4],
    pub residual: f64,
    pub iterations: usize,
    pub evaluations: usize,
    pub success: bool,
    /// Simulated series at the data time points, pinned if the fit was.
    pub fitted: Vec<(String, Vec<f64>)>,
}

impl FitResult {
    pub fn params(&self) -> ReactionDiffusionParams {
        ReactionDiffusionParams {
            diffusion: self.x[0],
            production: self.x[1],
            degradation: self.x[2],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fit {
    pub name: String,
    pub rois: Vec<String>,
    pub params: FitParameters,
    /// Start from the ideal bleach profile instead of the first image frame.
    pub equ: bool,
    pub fit_pinned: bool,
    pub strategy: FitStrategy,
    pub norm: ErrorNorm,
    /// ROI whose first sample pins to 0.
    pub pin_bkgd_roi: String,
    /// ROI whose last sample pins to 1.
    pub pin_norm_roi: String,
    pub result: Option<FitResult>,
}

impl Fit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            rois: Vec::new(),
            params: FitParameters::default(),
            equ: true,
            fit_pinned: false,
            strategy: FitStrategy::FullSimulation,
            norm: ErrorNorm::L2,
            pin_bkgd_roi: BLEACHED_SQUARE.into(),
            pin_norm_roi: ALL.into(),
            result: None,
        }
    }

    /// Register an existing ROI for the objective. Adding a name twice is a no-op.
    pub fn add_roi_by_name(&mut self, rois: &RoiSet, name: &str) -> Result<(), FitError> {
        rois.get(name)?;
        if !self.rois.iter().any(|r| r == name) {
            self.rois.push(name.to_string());
        }
        Ok(())
    }

    pub fn set_equ(&mut self, equ: bool) {
        self.equ = equ;
    }

    pub fn set_fit_pinned(&mut self, pinned: bool) {
        self.fit_pinned = pinned;
    }

    /// Fit the selected ROIs' data series, sampled at `data_tvec`, starting
    /// from the initial condition already built in `simulation`.
    ///
    /// `simulation` is used as a template and left untouched; `rois` receive
    /// the simulated series of the last evaluated parameter vector. A fit
    /// that runs out of budget stores its result and returns
    /// [`FitError::NotConverged`].
    pub fn run(
        &mut self,
        mesh: &Mesh,
        rois: &mut RoiSet,
        simulation: &Simulation,
        data_tvec: &[f64],
        optimizer: &dyn Optimizer,
        debug: bool,
    ) -> Result<&FitResult, FitError> {
        if self.rois.is_empty() {
            return Err(FitError::NoRois);
        }
        self.params.validate()?;
        if simulation.initial_condition().is_none() {
            return Err(SimulationError::MissingInitialCondition.into());
        }
        if data_tvec.is_empty() {
            return Err(FitError::MissingData("empty data time vector".into()));
        }
        for name in &self.rois {
            let n = rois.get(name)?.data_vec.len();
            if n != data_tvec.len() {
                return Err(FitError::MissingData(format!(
                    "ROI `{name}` has {n} data samples, expected {}",
                    data_tvec.len()
                )));
            }
        }
        let pin = if self.fit_pinned {
            pin_rois(rois, Series::Data, &self.pin_bkgd_roi, &self.pin_norm_roi)?;
            Some((self.pin_bkgd_roi.clone(), self.pin_norm_roi.clone()))
        } else {
            None
        };
        let targets = self
            .rois
            .iter()
            .map(|name| -> Result<_, RoiError> {
                let roi = rois.get(name)?;
                let v = if pin.is_some() {
                    roi.data_vec_pinned.clone()
                } else {
                    roi.data_vec.clone()
                };
                Ok((name.clone(), v))
            })
            .collect::<Result<Vec<_>, RoiError>>()?;

        let mut needed: Vec<String> = self.rois.clone();
        if let Some((b, n)) = &pin {
            for name in [b, n] {
                rois.get(name)?;
                if !needed.contains(name) {
                    needed.push(name.clone());
                }
            }
        }

        let d_ref = match self.strategy {
            FitStrategy::FullSimulation => None,
            FitStrategy::TimeScaling => Some(self.time_scaling_reference()?),
        };
        self.check_time_range(simulation, data_tvec, d_ref)?;

        let mut trial = simulation.clone();
        trial.store_snapshots = false;
        let reference = match d_ref {
            Some(d_ref) => {
                trial.params = ReactionDiffusionParams::pure_diffusion(d_ref);
                trial.run(mesh, rois, debug)?;
                let series = needed
                    .iter()
                    .map(|name| -> Result<_, RoiError> {
                        Ok((name.clone(), rois.get(name)?.sim_vec.clone()))
                    })
                    .collect::<Result<Vec<_>, RoiError>>()?;
                info!(d_ref, "reference run for time-rescaled fit");
                Some(Reference {
                    d_ref,
                    times: trial.completed_times.clone(),
                    series,
                })
            }
            None => None,
        };

        let specs = self.params.specs();
        let mut eval = Evaluator {
            mesh,
            rois,
            trial,
            data_t: data_tvec,
            targets,
            needed,
            pin,
            norm: self.norm,
            reference,
            debug,
        };

        let x0_full = specs.map(|p| p.x0);
        let (f0, _) = eval.evaluate(&x0_full)?;
        info!(fit = %self.name, residual = f0, x0 = ?x0_full, "fit started");

        let free: Vec<usize> = (0..specs.len()).filter(|&i| specs[i].free).collect();
        let x0: Vec<f64> = free.iter().map(|&i| specs[i].x0).collect();
        let bounds: Vec<(f64, f64)> = free.iter().map(|&i| (specs[i].lower, specs[i].upper)).collect();
        let expand = |x: &[f64]| {
            let mut full = x0_full;
            for (&i, &v) in free.iter().zip(x) {
                full[i] = v;
            }
            full
        };

        let mut objective = |x: &[f64]| {
            let full = expand(x);
            match eval.evaluate(&full) {
                Ok((f, _)) => {
                    if debug {
                        info!(x = ?full, residual = f, "objective");
                    } else {
                        debug!(x = ?full, residual = f, "objective");
                    }
                    f
                }
                Err(e) => {
                    warn!(x = ?full, error = %e, "trial evaluation failed");
                    f64::INFINITY
                }
            }
        };
        let opt = optimizer.minimize(&mut objective, &x0, &bounds);

        let x = expand(&opt.x);
        let (residual, fitted) = eval.evaluate(&x)?;
        let result = FitResult {
            x,
            residual,
            iterations: opt.iterations,
            evaluations: opt.evaluations + 2,
            success: opt.success,
            fitted,
        };
        info!(
            fit = %self.name,
            diffusion = x[0],
            production = x[1],
            degradation = x[2],
            time_offset = x[3],
            residual,
            iterations = result.iterations,
            success = result.success,
            "fit finished"
        );

        let stored = self.result.insert(result);
        if !stored.success {
            return Err(FitFailure {
                x: stored.x.to_vec(),
                residual: stored.residual,
                iterations: stored.iterations,
            }
            .into());
        }
        Ok(&*stored)
    }

    fn time_scaling_reference(&self) -> Result<f64, FitError> {
        for (name, p) in [
            ("production", self.params.production),
            ("degradation", self.params.degradation),
        ] {
            if p.free || p.x0 != 0.0 {
                return Err(FitError::ShortcutUnavailable(format!(
                    "{name} must be fixed at zero"
                )));
            }
        }
        let (d_lo, d_hi) = self.params.diffusion.range();
        if d_lo <= 0.0 {
            return Err(FitError::ShortcutUnavailable(
                "diffusion range must be strictly positive".into(),
            ));
        }
        Ok(d_hi)
    }

    /// Reject the fit up front if any admissible parameter vector would query
    /// the simulation outside its time range.
    fn check_time_range(
        &self,
        simulation: &Simulation,
        data_tvec: &[f64],
        d_ref: Option<f64>,
    ) -> Result<(), FitError> {
        let (Some(&sim_lo), Some(&sim_hi)) = (simulation.tvec.first(), simulation.tvec.last()) else {
            return Err(SimulationError::InvalidTimeVector("empty time vector".into()).into());
        };
        let t_lo = data_tvec.iter().copied().fold(f64::INFINITY, f64::min);
        let t_hi = data_tvec.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let (off_lo, off_hi) = self.params.time_offset.range();
        let (lo, hi) = (t_lo + off_lo, t_hi + off_hi);
        let (q_lo, q_hi) = match d_ref {
            None => (lo, hi),
            Some(d_ref) => {
                let (d_lo, d_hi) = self.params.diffusion.range();
                let q = [lo * d_lo, lo * d_hi, hi * d_lo, hi * d_hi].map(|v| v / d_ref);
                (
                    q.iter().copied().fold(f64::INFINITY, f64::min),
                    q.iter().copied().fold(f64::NEG_INFINITY, f64::max),
                )
            }
        };
        for t in [q_lo, q_hi] {
            if t < sim_lo || t > sim_hi {
                return Err(OutOfRangeError {
                    t,
                    min: sim_lo,
                    max: sim_hi,
                }
                .into());
            }
        }
        Ok(())
    }

    pub fn print_results(&self) {
        println!("{}", FitReport(self));
    }
}

struct Reference {
    d_ref: f64,
    times: Vec<f64>,
    series: Vec<(String, Vec<f64>)>,
}

/// State shared by all objective evaluations of one fit.
struct Evaluator<'a> {
    mesh: &'a Mesh,
    rois: &'a mut RoiSet,
    trial: Simulation,
    data_t: &'a [f64],
    targets: Vec<(String, Vec<f64>)>,
    needed: Vec<String>,
    pin: Option<(String, String)>,
    norm: ErrorNorm,
    reference: Option<Reference>,
    debug: bool,
}

impl Evaluator<'_> {
    /// Residual and fitted series for the full parameter vector `x`.
    fn evaluate(&mut self, x: &[f64; 4]) -> Result<(f64, Vec<(String, Vec<f64>)>), FitError> {
        let mut sampled = self.sample(x)?;
        if let Some((bkgd, norm)) = &self.pin {
            let find = |name: &str| {
                sampled
                    .iter()
                    .find(|(n, _)| n == name)
                    .map(|(_, s)| s.as_slice())
                    .unwrap_or_default()
            };
            let pins = PinValues::from_series(find(bkgd), find(norm))?;
            for (_, s) in sampled.iter_mut() {
                *s = pins.apply(s);
            }
        }

        let mut residual = 0.0;
        let mut fitted = Vec::with_capacity(self.targets.len());
        for (name, data) in &self.targets {
            let sim = sampled
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, s)| s.clone())
                .unwrap_or_default();
            let err: f64 = data
                .iter()
                .zip(&sim)
                .map(|(d, s)| self.norm.apply(d - s))
                .sum();
            residual += err / data.len() as f64;
            fitted.push((name.clone(), sim));
        }
        if residual.is_nan() {
            residual = f64::INFINITY;
        }
        Ok((residual, fitted))
    }

    /// Simulated series of every needed ROI at the data time points.
    fn sample(&mut self, x: &[f64; 4]) -> Result<Vec<(String, Vec<f64>)>, FitError> {
        let offset = x[3];
        match &self.reference {
            Some(reference) => {
                let scale = x[0] / reference.d_ref;
                let query: Vec<f64> = self.data_t.iter().map(|t| (t + offset) * scale).collect();
                reference
                    .series
                    .iter()
                    .map(|(name, s)| -> Result<_, FitError> {
                        Ok((name.clone(), interp_linear(&reference.times, s, &query)?))
                    })
                    .collect()
            }
            None => {
                self.trial.params = ReactionDiffusionParams {
                    diffusion: x[0],
                    production: x[1],
                    degradation: x[2],
                };
                self.trial.run(self.mesh, self.rois, self.debug)?;
                let query: Vec<f64> = self.data_t.iter().map(|t| t + offset).collect();
                let times = &self.trial.completed_times;
                self.needed
                    .iter()
                    .map(|name| -> Result<_, FitError> {
                        let s = &self.rois.get(name)?.sim_vec;
                        Ok((name.clone(), interp_linear(times, s, &query)?))
                    })
                    .collect()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::mesh::tests::square_mesh;
    use crate::geometry::LengthUnit;
    use crate::numerics::time_vector;
    use crate::roi::{Roi, RoiShape};
    use crate::simulation::IcMode;

    const BLEACH: &str = "bleach";

    /// Synthetic experiment: a bleached square in a 6x6 domain, data series
    /// produced by the simulator itself at `d_true`.
    fn synthetic(d_true: f64) -> (Mesh, RoiSet, Simulation, Vec<f64>) {
        let mesh = square_mesh(6, 6.0);
        let mut rois = RoiSet::new();
        rois.add(Roi::new(ALL, RoiShape::All)).unwrap();
        rois.add(Roi::new(
            BLEACH,
            RoiShape::Square {
                offset: [2.0, 2.0],
                side: 2.0,
            },
        ))
        .unwrap();
        rois.compute_roi_idxs(&mesh).unwrap();

        let tvec = time_vector::uniform(1.0, 21).unwrap();
        let mut sim = Simulation::new(
            ReactionDiffusionParams::pure_diffusion(d_true),
            LengthUnit::Pixel,
            tvec.clone(),
            IcMode::Ideal {
                bleached_roi: BLEACH.into(),
                val_in: 0.0,
                val_out: 1.0,
            },
        );
        sim.bind_mesh(&mesh);
        sim.build_ic(&mesh, &rois).unwrap();
        sim.run(&mesh, &mut rois, false).unwrap();
        for roi in rois.iter_mut() {
            roi.data_vec = roi.sim_vec.clone();
        }
        (mesh, rois, sim, tvec)
    }

    fn diffusion_fit(x0: f64) -> Fit {
        let mut fit = Fit::new("recovery");
        fit.rois.push(BLEACH.into());
        fit.params.diffusion = ParameterSpec::free(x0, 0.1, 20.0);
        fit
    }

    #[test]
    fn recovers_diffusion_coefficient() {
        let (mesh, mut rois, sim, tvec) = synthetic(2.0);
        let mut fit = diffusion_fit(8.0);
        let result = fit
            .run(&mesh, &mut rois, &sim, &tvec, &NelderMead::default(), false)
            .unwrap();
        assert!(result.success);
        assert!((result.x[0] - 2.0).abs() / 2.0 < 0.05, "D = {}", result.x[0]);
        assert!(result.residual < 1e-6);
    }

    #[test]
    fn pinned_fit_recovers_diffusion_coefficient() {
        let (mesh, mut rois, sim, tvec) = synthetic(2.0);
        let mut fit = diffusion_fit(8.0);
        fit.set_fit_pinned(true);
        fit.pin_bkgd_roi = BLEACH.into();
        let result = fit
            .run(&mesh, &mut rois, &sim, &tvec, &NelderMead::default(), false)
            .unwrap();
        assert!((result.x[0] - 2.0).abs() / 2.0 < 0.05, "D = {}", result.x[0]);
        let fitted = &result.fitted[0].1;
        assert!(fitted[0].abs() < 1e-12);
    }

    #[test]
    fn time_scaling_agrees_with_full_simulation() {
        // Data at D = 2 read off a D = 5 run at rescaled times t * 2/5.
        let (mesh, mut rois, sim, tvec) = synthetic(5.0);
        let data_t: Vec<f64> = tvec.iter().map(|t| t * 0.8).collect();
        let scaled: Vec<f64> = data_t.iter().map(|t| t * 2.0 / 5.0).collect();
        let data = interp_linear(&tvec, &rois.get(BLEACH).unwrap().sim_vec, &scaled).unwrap();
        rois.get_mut(BLEACH).unwrap().data_vec = data;
        let mut fit = diffusion_fit(4.0);
        fit.strategy = FitStrategy::TimeScaling;
        fit.params.diffusion = ParameterSpec::free(4.0, 0.5, 5.0);
        let result = fit
            .run(&mesh, &mut rois, &sim, &data_t, &NelderMead::default(), false)
            .unwrap();
        assert!(result.success);
        assert!((result.x[0] - 2.0).abs() / 2.0 < 0.05, "D = {}", result.x[0]);
    }

    #[test]
    fn time_scaling_needs_pure_diffusion() {
        let (mesh, mut rois, sim, tvec) = synthetic(2.0);
        let mut fit = diffusion_fit(4.0);
        fit.strategy = FitStrategy::TimeScaling;
        fit.params.degradation = ParameterSpec::free(0.1, 0.0, 1.0);
        let err = fit
            .run(&mesh, &mut rois, &sim, &tvec, &NelderMead::default(), false)
            .unwrap_err();
        assert!(matches!(err, FitError::ShortcutUnavailable(_)));
    }

    #[test]
    fn rejects_offsets_beyond_simulated_range() {
        let (mesh, mut rois, sim, tvec) = synthetic(2.0);
        let mut fit = diffusion_fit(4.0);
        fit.params.time_offset = ParameterSpec::free(0.0, 0.0, 0.5);
        let err = fit
            .run(&mesh, &mut rois, &sim, &tvec, &NelderMead::default(), false)
            .unwrap_err();
        assert!(matches!(err, FitError::OutOfRange(_)));
        assert!(fit.result.is_none());
    }

    #[test]
    fn preconditions() {
        let (mesh, mut rois, sim, tvec) = synthetic(2.0);
        let mut fit = Fit::new("empty");
        assert!(matches!(
            fit.run(&mesh, &mut rois, &sim, &tvec, &NelderMead::default(), false),
            Err(FitError::NoRois)
        ));
        assert!(matches!(
            fit.add_roi_by_name(&rois, "nope"),
            Err(FitError::Roi(RoiError::Unknown(_)))
        ));
        fit.add_roi_by_name(&rois, BLEACH).unwrap();
        fit.add_roi_by_name(&rois, BLEACH).unwrap();
        assert_eq!(fit.rois.len(), 1);
        assert!(matches!(
            fit.run(&mesh, &mut rois, &sim, &tvec[..5], &NelderMead::default(), false),
            Err(FitError::MissingData(_))
        ));
        fit.params.diffusion = ParameterSpec::free(50.0, 0.1, 20.0);
        assert!(matches!(
            fit.run(&mesh, &mut rois, &sim, &tvec, &NelderMead::default(), false),
            Err(FitError::InvalidBounds(_))
        ));
    }

    #[test]
    fn exhausted_budget_keeps_diagnostics() {
        let (mesh, mut rois, sim, tvec) = synthetic(2.0);
        let mut fit = diffusion_fit(8.0);
        let nm = NelderMead {
            max_iterations_per_dim: 1,
            ..NelderMead::default()
        };
        let err = fit.run(&mesh, &mut rois, &sim, &tvec, &nm, false).unwrap_err();
        let FitError::NotConverged(failure) = err else {
            panic!("expected NotConverged, got {err:?}");
        };
        assert_eq!(failure.x.len(), 4);
        let stored = fit.result.as_ref().unwrap();
        assert!(!stored.success);
        assert_eq!(stored.x.to_vec(), failure.x);
    }
}
