use crate::discretization::mesh::Mesh;
use crate::numerics::newton::{NewtonArmijoSolver, SolverError, SolverResult};
use crate::numerics::Tolerance;
use crate::physics::functional::FunctionalPhysics;
use nalgebra::DVector;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

/// A time step that could not be completed, even after the half-step retry.
#[derive(Debug, Clone, Error)]
#[error("step {step} (t = {time}) failed after {completed} completed steps: {source}")]
pub struct StepFailure {
    pub step: usize,
    pub time: f64,
    pub completed: usize,
    #[source]
    pub source: SolverError,
}

/// Theta-scheme integrator over a prescribed, possibly non-uniform, time vector.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransientSolver {
    /// 1.0 = backward Euler, 0.5 = Crank-Nicolson.
    pub theta: f64,
    /// Absolute Newton tolerance, scaled per step by `max(1, |S(u_old)| / dt)`.
    pub abs_tolerance: f64,
    pub rel_tolerance: f64,
    /// Retry a failed step once as two half steps.
    pub retry_half_step: bool,
    pub newton: NewtonArmijoSolver,
}

impl Default for TransientSolver {
    fn default() -> Self {
        Self {
            theta: 1.0,
            abs_tolerance: 1e-11,
            rel_tolerance: 1e-10,
            retry_half_step: true,
            newton: NewtonArmijoSolver::default(),
        }
    }
}

impl TransientSolver {
    /// Integrate from `tvec[0]` through every entry of `tvec`, calling
    /// `callback(step, t, u)` after each completed step (step counts from 1).
    /// Returns the final state.
    pub fn solve<D>(
        &self,
        model: &mut FunctionalPhysics<D>,
        mesh: &Mesh,
        initial_condition: DVector<f64>,
        tvec: &[f64],
        logging: bool,
        mut callback: impl FnMut(usize, f64, &DVector<f64>),
    ) -> Result<DVector<f64>, StepFailure> {
        model.theta = self.theta;

        let mut u = initial_condition;
        let (Some(&t_start), Some(&t_end)) = (tvec.first(), tvec.last()) else {
            return Ok(u);
        };

        if logging {
            info!(
                "starting transient simulation: T={:.3} -> {:.3}, {} steps",
                t_start,
                t_end,
                tvec.len().saturating_sub(1)
            );
        }

        for (step, w) in tvec.windows(2).enumerate() {
            let step = step + 1;
            let (t_prev, t) = (w[0], w[1]);
            let dt = t - t_prev;

            match self.advance(model, mesh, &u, t_prev, dt) {
                Ok(result) => {
                    u = result.solution;
                    if logging {
                        info!(
                            "step {:>5} | t = {:.4e} | dt = {:.3e} | iters = {}",
                            step, t, dt, result.iterations
                        );
                    } else {
                        debug!(step, t, dt, iterations = result.iterations, "step accepted");
                    }
                }
                Err(e) if self.retry_half_step => {
                    warn!(step, t, dt, error = %e, "step failed, retrying as two half steps");
                    let half = 0.5 * dt;
                    let failure = |source| StepFailure {
                        step,
                        time: t,
                        completed: step - 1,
                        source,
                    };
                    let mid = self.advance(model, mesh, &u, t_prev, half).map_err(failure)?;
                    let end = self
                        .advance(model, mesh, &mid.solution, t_prev + half, half)
                        .map_err(failure)?;
                    u = end.solution;
                }
                Err(source) => {
                    return Err(StepFailure {
                        step,
                        time: t,
                        completed: step - 1,
                        source,
                    });
                }
            }

            callback(step, t, &u);
        }

        model.clear_time_step();
        Ok(u)
    }

    /// One Newton-solved step of size `dt` starting from `u_old` at `t_old`.
    fn advance<D>(
        &self,
        model: &mut FunctionalPhysics<D>,
        mesh: &Mesh,
        u_old: &DVector<f64>,
        t_old: f64,
        dt: f64,
    ) -> Result<SolverResult, SolverError> {
        model.prepare_time_step(mesh, u_old, dt);
        model.current_time = Some(t_old + dt);

        let storage_scale = model
            .s_old_cache
            .as_ref()
            .map(|s| s.amax() / dt)
            .unwrap_or(1.0)
            .max(1.0);
        let solver = self.newton.clone().with_tolerance(Tolerance::Combined(
            self.abs_tolerance * storage_scale,
            self.rel_tolerance,
        ));

        solver.solve(model, mesh, u_old.clone(), false)
    }
}
