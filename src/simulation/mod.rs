//! Reaction-diffusion runs over a bound mesh.
//!
//! A [`Simulation`] moves through `Unconfigured → MeshBound → IcBuilt →
//! Running → Completed | Failed`. It does not own the mesh: it remembers the
//! [`MeshId`] it was bound to and rejects any other mesh at run time.

pub mod initial_condition;

use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::discretization::{Mesh, MeshId};
use crate::error::SimulationError;
use crate::geometry::LengthUnit;
use crate::models::{setup_reaction_diffusion_physics, ReactionDiffusionParams};
use crate::numerics::time_vector::{self, OptimalTvecConfig};
use crate::numerics::transient::TransientSolver;
use crate::roi::RoiSet;

pub use initial_condition::IcMode;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SimulationState {
    Unconfigured,
    MeshBound,
    IcBuilt,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Simulation {
    pub params: ReactionDiffusionParams,
    /// Length unit of `params.diffusion`; must match the mesh frame.
    pub diffusion_unit: LengthUnit,
    pub tvec: Vec<f64>,
    pub ic_mode: IcMode,
    pub solver: TransientSolver,
    /// Keep the full solution after every step.
    pub store_snapshots: bool,

    state: SimulationState,
    mesh: Option<MeshId>,
    ic: Option<DVector<f64>>,
    pub interpolation_error: Option<f64>,

    /// Times reached by the last run, starting with `tvec[0]`.
    pub completed_times: Vec<f64>,
    /// Total amount `Σ V_k u_k` at each completed time.
    pub mass_history: Vec<f64>,
    pub snapshots: Vec<DVector<f64>>,
    pub final_state: Option<DVector<f64>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimulationSummary {
    pub state: SimulationState,
    pub cells: usize,
    pub steps_requested: usize,
    pub steps_completed: usize,
    pub final_time: Option<f64>,
    pub mass_initial: Option<f64>,
    pub mass_final: Option<f64>,
    pub relative_mass_drift: Option<f64>,
    pub interpolation_error: Option<f64>,
}

fn check_tvec(tvec: &[f64]) -> Result<(), SimulationError> {
    if tvec.len() < 2 {
        return Err(SimulationError::InvalidTimeVector(format!(
            "need at least 2 time points, got {}",
            tvec.len()
        )));
    }
    if let Some(w) = tvec.windows(2).find(|w| !(w[1] > w[0]) || !w[1].is_finite()) {
        return Err(SimulationError::InvalidTimeVector(format!(
            "time points must be finite and strictly increasing, found {} then {}",
            w[0], w[1]
        )));
    }
    Ok(())
}

impl Simulation {
    pub fn new(
        params: ReactionDiffusionParams,
        diffusion_unit: LengthUnit,
        tvec: Vec<f64>,
        ic_mode: IcMode,
    ) -> Self {
        Self {
            params,
            diffusion_unit,
            tvec,
            ic_mode,
            solver: TransientSolver::default(),
            store_snapshots: false,
            state: SimulationState::Unconfigured,
            mesh: None,
            ic: None,
            interpolation_error: None,
            completed_times: Vec::new(),
            mass_history: Vec::new(),
            snapshots: Vec::new(),
            final_state: None,
        }
    }

    pub fn state(&self) -> SimulationState {
        self.state
    }

    pub fn bound_mesh(&self) -> Option<MeshId> {
        self.mesh
    }

    pub fn initial_condition(&self) -> Option<&DVector<f64>> {
        self.ic.as_ref()
    }

    fn clear_results(&mut self) {
        self.completed_times.clear();
        self.mass_history.clear();
        self.snapshots.clear();
        self.final_state = None;
    }

    /// Bind to `mesh`, discarding any initial condition and results.
    pub fn bind_mesh(&mut self, mesh: &Mesh) {
        self.mesh = Some(mesh.id);
        self.ic = None;
        self.interpolation_error = None;
        self.clear_results();
        self.state = SimulationState::MeshBound;
        debug!(mesh = mesh.id.value(), cells = mesh.num_cells(), "simulation bound to mesh");
    }

    fn check_mesh(&self, mesh: &Mesh) -> Result<(), SimulationError> {
        match self.mesh {
            None => Err(SimulationError::MissingMesh),
            Some(bound) if bound != mesh.id => Err(SimulationError::MeshMismatch {
                bound,
                given: mesh.id,
            }),
            Some(_) => Ok(()),
        }
    }

    /// Replace the IC mode. A built initial condition is dropped.
    pub fn set_ic_mode(&mut self, mode: IcMode) {
        self.ic_mode = mode;
        if self.ic.take().is_some() {
            self.state = SimulationState::MeshBound;
        }
    }

    /// Build the initial condition from the current [`IcMode`]. Image mode also
    /// records the interpolation error over `rois`.
    pub fn build_ic(&mut self, mesh: &Mesh, rois: &RoiSet) -> Result<(), SimulationError> {
        self.check_mesh(mesh)?;
        let (ic, error) = match &self.ic_mode {
            IcMode::Ideal {
                bleached_roi,
                val_in,
                val_out,
            } => (
                initial_condition::ideal(mesh, rois, bleached_roi, *val_in, *val_out)?,
                None,
            ),
            IcMode::Image { frame } => {
                let ic = initial_condition::from_image(mesh, frame);
                let err = initial_condition::interpolation_error(mesh, rois, frame, &ic)?;
                (ic, err)
            }
        };
        if let Some(err) = error {
            info!(interpolation_error = err, "built image initial condition");
        }
        self.ic = Some(ic);
        self.interpolation_error = error;
        self.clear_results();
        self.state = SimulationState::IcBuilt;
        Ok(())
    }

    /// Use an externally computed initial condition.
    pub fn set_initial_condition(&mut self, mesh: &Mesh, ic: DVector<f64>) -> Result<(), SimulationError> {
        self.check_mesh(mesh)?;
        if ic.len() != mesh.num_cells() {
            return Err(SimulationError::MissingInitialCondition);
        }
        self.ic = Some(ic);
        self.interpolation_error = None;
        self.clear_results();
        self.state = SimulationState::IcBuilt;
        Ok(())
    }

    pub fn set_uniform_tvec(&mut self, duration: f64, n_points: usize) -> Result<(), SimulationError> {
        self.tvec = time_vector::uniform(duration, n_points)?;
        Ok(())
    }

    /// Re-space the time vector logarithmically, keeping its length and end.
    pub fn to_log_time_scale(&mut self) -> Result<(), SimulationError> {
        self.tvec = time_vector::to_log_scale(&self.tvec)?;
        Ok(())
    }

    pub fn set_opt_tvec(
        &mut self,
        mesh: &Mesh,
        duration: f64,
        cfg: &OptimalTvecConfig,
    ) -> Result<(), SimulationError> {
        self.tvec = time_vector::optimal(duration, mesh.min_cell_size(), self.params.diffusion, cfg)?;
        debug!(points = self.tvec.len(), duration, "optimal time vector");
        Ok(())
    }

    /// Integrate over `tvec`, writing the volume-weighted mean of every ROI in
    /// `rois` to its `sim_vec`. On a failed step the series and mass history
    /// hold the completed steps.
    pub fn run(&mut self, mesh: &Mesh, rois: &mut RoiSet, debug: bool) -> Result<(), SimulationError> {
        self.check_mesh(mesh)?;
        let ic = self.ic.clone().ok_or(SimulationError::MissingInitialCondition)?;
        if ic.len() != mesh.num_cells() {
            return Err(SimulationError::MissingInitialCondition);
        }
        if mesh.frame.unit != self.diffusion_unit {
            return Err(SimulationError::InconsistentUnits {
                mesh: mesh.frame.unit,
                diffusion: self.diffusion_unit,
            });
        }
        check_tvec(&self.tvec)?;
        let tracked: Vec<Vec<usize>> = rois
            .iter()
            .map(|r| r.mesh_idx(mesh).map(<[usize]>::to_vec))
            .collect::<Result<_, _>>()?;

        let volumes = mesh.cell_volumes();
        let mean = |cells: &[usize], u: &DVector<f64>| {
            let (s, v) = cells
                .iter()
                .fold((0.0, 0.0), |(s, v), &i| (s + volumes[i] * u[i], v + volumes[i]));
            if v > 0.0 {
                s / v
            } else {
                f64::NAN
            }
        };
        let mass = |u: &DVector<f64>| volumes.iter().zip(u.iter()).map(|(v, x)| v * x).sum::<f64>();

        self.clear_results();
        let mut times = vec![self.tvec[0]];
        let mut masses = vec![mass(&ic)];
        let mut series: Vec<Vec<f64>> = tracked.iter().map(|c| vec![mean(c, &ic)]).collect();
        let mut snapshots = if self.store_snapshots { vec![ic.clone()] } else { Vec::new() };
        let store = self.store_snapshots;

        let mut model = setup_reaction_diffusion_physics(self.params);
        model.calibrate_tolerances(mesh);
        self.state = SimulationState::Running;
        info!(
            cells = mesh.num_cells(),
            steps = self.tvec.len() - 1,
            diffusion = self.params.diffusion,
            production = self.params.production,
            degradation = self.params.degradation,
            "simulation started"
        );

        let result = self.solver.solve(&mut model, mesh, ic, &self.tvec, debug, |_, t, u| {
            times.push(t);
            masses.push(mass(u));
            for (s, cells) in series.iter_mut().zip(&tracked) {
                s.push(mean(cells, u));
            }
            if store {
                snapshots.push(u.clone());
            }
        });

        for (roi, s) in rois.iter_mut().zip(series) {
            roi.sim_vec = s;
            roi.sim_vec_pinned.clear();
        }
        self.completed_times = times;
        self.mass_history = masses;
        self.snapshots = snapshots;

        match result {
            Ok(u) => {
                self.final_state = Some(u);
                self.state = SimulationState::Completed;
                info!(
                    relative_mass_drift = self.summary().relative_mass_drift,
                    "simulation completed"
                );
                Ok(())
            }
            Err(failure) => {
                self.state = SimulationState::Failed;
                warn!(step = failure.step, time = failure.time, error = %failure.source, "simulation failed");
                Err(SimulationError::NonConvergence {
                    step: failure.step,
                    time: failure.time,
                    completed: failure.completed,
                    source: failure.source,
                })
            }
        }
    }

    pub fn summary(&self) -> SimulationSummary {
        let mass_initial = self.mass_history.first().copied();
        let mass_final = self.mass_history.last().copied();
        let relative_mass_drift = match (mass_initial, mass_final) {
            (Some(a), Some(b)) if a.abs() > 0.0 => Some((b - a).abs() / a.abs()),
            (Some(_), Some(b)) => Some(b.abs()),
            _ => None,
        };
        SimulationSummary {
            state: self.state,
            cells: self.ic.as_ref().map_or(0, |ic| ic.len()),
            steps_requested: self.tvec.len().saturating_sub(1),
            steps_completed: self.completed_times.len().saturating_sub(1),
            final_time: self.completed_times.last().copied(),
            mass_initial,
            mass_final,
            relative_mass_drift,
            interpolation_error: self.interpolation_error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::mesh::tests::square_mesh;
    use crate::roi::{Roi, RoiShape};

    fn setup() -> (Mesh, RoiSet, Simulation) {
        let mesh = square_mesh(8, 4.0);
        let mut rois = RoiSet::new();
        rois.add(Roi::new("all", RoiShape::All)).unwrap();
        rois.add(Roi::new(
            "spot",
            RoiShape::Square {
                offset: [1.5, 1.5],
                side: 1.0,
            },
        ))
        .unwrap();
        rois.compute_roi_idxs(&mesh).unwrap();
        let sim = Simulation::new(
            ReactionDiffusionParams::pure_diffusion(1.0),
            LengthUnit::Pixel,
            time_vector::uniform(2.0, 41).unwrap(),
            IcMode::Ideal {
                bleached_roi: "spot".into(),
                val_in: 0.0,
                val_out: 1.0,
            },
        );
        (mesh, rois, sim)
    }

    #[test]
    fn run_without_mesh_fails() {
        let (mesh, mut rois, mut sim) = setup();
        assert!(matches!(
            sim.run(&mesh, &mut rois, false),
            Err(SimulationError::MissingMesh)
        ));
        assert_eq!(sim.state(), SimulationState::Unconfigured);
    }

    #[test]
    fn explicit_initial_condition_must_cover_the_mesh() {
        let (mesh, mut rois, mut sim) = setup();
        sim.bind_mesh(&mesh);
        assert!(matches!(
            sim.set_initial_condition(&mesh, DVector::zeros(3)),
            Err(SimulationError::MissingInitialCondition)
        ));
        let ic = DVector::from_fn(mesh.num_cells(), |i, _| if i % 2 == 0 { 1.0 } else { 0.0 });
        sim.set_initial_condition(&mesh, ic).unwrap();
        assert_eq!(sim.state(), SimulationState::IcBuilt);
        assert_eq!(sim.interpolation_error, None);

        sim.set_uniform_tvec(1.0, 11).unwrap();
        sim.run(&mesh, &mut rois, false).unwrap();
        let all = &rois.get("all").unwrap().sim_vec;
        assert_eq!(all.len(), 11);
        approx::assert_relative_eq!(all[0], all[10], max_relative = 1e-9);
    }

    #[test]
    fn run_without_ic_fails() {
        let (mesh, mut rois, mut sim) = setup();
        sim.bind_mesh(&mesh);
        assert!(matches!(
            sim.run(&mesh, &mut rois, false),
            Err(SimulationError::MissingInitialCondition)
        ));
    }

    #[test]
    fn other_mesh_is_rejected() {
        let (mesh, mut rois, mut sim) = setup();
        sim.bind_mesh(&mesh);
        sim.build_ic(&mesh, &rois).unwrap();
        let other = square_mesh(8, 4.0);
        assert!(matches!(
            sim.run(&other, &mut rois, false),
            Err(SimulationError::MeshMismatch { .. })
        ));
    }

    #[test]
    fn unit_mismatch_is_rejected() {
        let (mesh, mut rois, mut sim) = setup();
        sim.diffusion_unit = LengthUnit::Micron;
        sim.bind_mesh(&mesh);
        sim.build_ic(&mesh, &rois).unwrap();
        assert!(matches!(
            sim.run(&mesh, &mut rois, false),
            Err(SimulationError::InconsistentUnits { .. })
        ));
    }

    #[test]
    fn recovery_conserves_mass() {
        let (mesh, mut rois, mut sim) = setup();
        sim.bind_mesh(&mesh);
        sim.build_ic(&mesh, &rois).unwrap();
        sim.run(&mesh, &mut rois, false).unwrap();
        assert_eq!(sim.state(), SimulationState::Completed);
        let spot = &rois.get("spot").unwrap().sim_vec;
        assert_eq!(spot.len(), sim.tvec.len());
        assert_eq!(spot[0], 0.0);
        assert!(spot.windows(2).all(|w| w[1] >= w[0] - 1e-12));
        let summary = sim.summary();
        assert!(summary.relative_mass_drift.unwrap() < 1e-8);
        assert_eq!(summary.steps_completed, 40);
    }

    #[test]
    fn invalid_tvec_is_rejected() {
        let (mesh, mut rois, mut sim) = setup();
        sim.bind_mesh(&mesh);
        sim.build_ic(&mesh, &rois).unwrap();
        sim.tvec = vec![0.0, 1.0, 1.0];
        assert!(matches!(
            sim.run(&mesh, &mut rois, false),
            Err(SimulationError::InvalidTimeVector(_))
        ));
    }

    #[test]
    fn stale_roi_blocks_run() {
        let (mesh, mut rois, mut sim) = setup();
        sim.bind_mesh(&mesh);
        sim.build_ic(&mesh, &rois).unwrap();
        rois.get_mut("all").unwrap().invalidate();
        assert!(matches!(
            sim.run(&mesh, &mut rois, false),
            Err(SimulationError::IndexStale(_))
        ));
    }
}
