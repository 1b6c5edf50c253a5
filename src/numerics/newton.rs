use nalgebra::{DMatrix, DVector};
use nalgebra_sparse::factorization::{CholeskyError, CscCholesky};
use nalgebra_sparse::{CooMatrix, CscMatrix};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::discretization::mesh::Mesh;
use crate::numerics::{Convergence, ConvergenceCriteria, Tolerance};
use crate::physics::functional::FunctionalPhysics;

/// Systems at most this large fall back to a dense LU when Cholesky fails.
const DENSE_FALLBACK_LIMIT: usize = 2000;

#[derive(Debug, Clone, Error)]
pub enum SolverError {
    #[error("linear solve failed: {0}")]
    LinearSolveFailed(String),
    #[error("residual contains NaN or Inf at iteration {iteration}")]
    NonFinite { iteration: u32 },
    #[error("line search found no sufficient decrease at iteration {iteration} (residual {residual:.4e})")]
    LineSearchFailed { iteration: u32, residual: f64 },
    #[error("Newton's method failed to converge in {iterations} iterations (residual {residual:.4e})")]
    NonConvergence { iterations: u32, residual: f64 },
}

impl From<CholeskyError> for SolverError {
    fn from(e: CholeskyError) -> Self {
        SolverError::LinearSolveFailed(e.to_string())
    }
}

/// One accepted Newton step: (iteration, residual, residual / initial, step length alpha).
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct IterationRecord {
    pub iteration: u32,
    pub residual: f64,
    pub fraction: f64,
    pub alpha: f64,
}

#[derive(Debug, Clone)]
pub struct SolverResult {
    pub solution: DVector<f64>,
    pub iterations: u32,
    pub final_residual: f64,
    pub history: Vec<IterationRecord>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewtonArmijoSolver {
    pub convergence: Convergence,
    pub max_iterations: u32,
    /// Minimum step size before we give up (prevents infinite loops)
    pub min_step_size: f64,
    /// Parameter for sufficient decrease (usually 1e-4)
    pub armijo_param: f64,
    /// Maximum step size to prevent large jumps (None = no limit)
    pub max_step: Option<f64>,
}

impl Default for NewtonArmijoSolver {
    fn default() -> Self {
        Self {
            convergence: Convergence::default(),
            max_iterations: 50,
            min_step_size: 1e-3,
            armijo_param: 1e-4,
            max_step: None,
        }
    }
}

impl NewtonArmijoSolver {
    pub fn with_tolerance(mut self, tolerance: Tolerance) -> Self {
        self.convergence.tolerance = tolerance;
        self
    }

    pub fn solve<D>(
        &self,
        model: &FunctionalPhysics<D>,
        mesh: &Mesh,
        initial_guess: DVector<f64>,
        logging: bool,
    ) -> Result<SolverResult, SolverError> {
        let mut u = initial_guess;
        let mut history: Vec<IterationRecord> = Vec::new();

        let initial_res_vec = self.compute_residual_only(model, mesh, &u);
        let mut current_res_norm = self.convergence.norm(&initial_res_vec);
        let initial_residual_norm = current_res_norm;

        if logging {
            info!(
                unknowns = u.len(),
                initial_residual = initial_residual_norm,
                "Newton-Armijo solver started"
            );
        }

        let mut initial_update_norm: Option<f64> = None;
        for i in 0..self.max_iterations {
            let (residual, jacobian) = self.compute_residual_and_jacobian(model, mesh, &u);

            if !residual.iter().all(|x| x.is_finite()) {
                warn!(iteration = i, "residual contains NaN or Inf");
                return Err(SolverError::NonFinite { iteration: i });
            }

            current_res_norm = self.convergence.norm(&residual);

            if self.convergence.criteria == ConvergenceCriteria::Residual
                && self
                    .convergence
                    .check_tolerance(current_res_norm, initial_residual_norm)
            {
                return Ok(Self::success(u, i, current_res_norm, history));
            }

            let mut delta_u = Self::linear_solve(&jacobian, &residual)?;

            // Optionally limit the max norm of delta_u
            if let Some(max_step) = self.max_step {
                let max_update = delta_u.amax();
                if max_update > max_step {
                    delta_u *= max_step / max_update;
                }
            }

            // Backtracking line search
            let mut alpha = 1.0;
            let mut accepted = false;
            let mut next_res_norm = current_res_norm;
            let mut next_res = residual.clone();

            while alpha > self.min_step_size {
                let next_u = &u + &delta_u * alpha;
                next_res = self.compute_residual_only(model, mesh, &next_u);
                next_res_norm = self.convergence.norm(&next_res);

                // ||F_new|| <= (1 - alpha * t) * ||F_old||
                let target_norm = (1.0 - alpha * self.armijo_param) * current_res_norm;

                if next_res_norm < target_norm {
                    accepted = true;
                    u = next_u;
                    break;
                }
                alpha *= 0.5;
            }

            if !accepted {
                // A full step that cannot decrease the residual any further has hit round-off.
                if self
                    .convergence
                    .check_tolerance(next_res_norm.min(current_res_norm), initial_residual_norm)
                {
                    return Ok(Self::success(u, i, current_res_norm, history));
                }
                if logging {
                    info!(iteration = i, "line search failed to find sufficient decrease");
                }
                return Err(SolverError::LineSearchFailed {
                    iteration: i,
                    residual: current_res_norm,
                });
            }

            history.push(IterationRecord {
                iteration: i,
                residual: next_res_norm,
                fraction: if initial_residual_norm > 0.0 {
                    next_res_norm / initial_residual_norm
                } else {
                    0.0
                },
                alpha,
            });

            if logging {
                info!(
                    "  {:4} | {:.4e} | {:.4e} | {:.3}",
                    i,
                    next_res_norm,
                    delta_u.norm(),
                    alpha
                );
            } else {
                debug!(iteration = i, residual = next_res_norm, alpha, "newton step");
            }
            current_res_norm = next_res_norm;

            if self.convergence.criteria != ConvergenceCriteria::Residual {
                let step = &delta_u * alpha;
                let first_update = *initial_update_norm.get_or_insert(self.convergence.norm(&step));
                if self.convergence.check_convergence(
                    &next_res,
                    &step,
                    initial_residual_norm,
                    first_update,
                ) {
                    return Ok(Self::success(u, i + 1, current_res_norm, history));
                }
            }
        }
        Err(SolverError::NonConvergence {
            iterations: self.max_iterations,
            residual: current_res_norm,
        })
    }

    fn success(
        u: DVector<f64>,
        iter: u32,
        final_res: f64,
        history: Vec<IterationRecord>,
    ) -> SolverResult {
        SolverResult {
            solution: u,
            iterations: iter,
            final_residual: final_res,
            history,
        }
    }

    /// Solve `J du = -r` with a sparse Cholesky factorization, falling back to
    /// dense LU for small systems whose Jacobian is not symmetric positive definite.
    fn linear_solve(
        jacobian: &CscMatrix<f64>,
        residual: &DVector<f64>,
    ) -> Result<DVector<f64>, SolverError> {
        let n = residual.len();
        let rhs = DMatrix::from_iterator(n, 1, residual.iter().map(|r| -r));

        match CscCholesky::factor(jacobian) {
            Ok(chol) => {
                let x = chol.solve(&rhs);
                Ok(DVector::from_column_slice(x.as_slice()))
            }
            Err(e) if n <= DENSE_FALLBACK_LIMIT => {
                debug!("cholesky failed ({e}), falling back to dense LU");
                let dense = DMatrix::from(jacobian);
                let rhs = DVector::from_column_slice(rhs.as_slice());
                dense
                    .lu()
                    .solve(&rhs)
                    .ok_or_else(|| SolverError::LinearSolveFailed("singular Jacobian".into()))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Residual vector only, used by the line search.
    pub fn compute_residual_only<D>(
        &self,
        model: &FunctionalPhysics<D>,
        mesh: &Mesh,
        u: &DVector<f64>,
    ) -> DVector<f64> {
        let u_slice = u.as_slice();
        DVector::from_iterator(
            u.len(),
            (0..u.len()).map(|r| model.residual_component_row(mesh, u_slice, r)),
        )
    }

    pub fn compute_residual_and_jacobian<D>(
        &self,
        model: &FunctionalPhysics<D>,
        mesh: &Mesh,
        u: &DVector<f64>,
    ) -> (DVector<f64>, CscMatrix<f64>) {
        let n = u.len();
        let mut residual = DVector::<f64>::zeros(n);
        let mut coo = CooMatrix::new(n, n);

        let m = model.num_vars_per_cell;
        let mut cols_reuse: Vec<usize> = Vec::with_capacity(8 * m);
        let mut vals_reuse: Vec<f64> = Vec::with_capacity(8 * m);
        let mut diag_reuse: Vec<f64> = Vec::with_capacity(m);

        let u_slice = u.as_slice();

        for r in 0..n {
            residual[r] = model.residual_component_row(mesh, u_slice, r);

            cols_reuse.clear();
            vals_reuse.clear();
            diag_reuse.clear();
            diag_reuse.resize(m, 0.0);

            model.jacobian_row_locals(
                mesh,
                u_slice,
                r,
                &mut cols_reuse,
                &mut vals_reuse,
                &mut diag_reuse,
            );

            for (&c, &v) in cols_reuse.iter().zip(&vals_reuse) {
                coo.push(r, c, v);
            }
        }

        (residual, CscMatrix::from(&coo))
    }
}
