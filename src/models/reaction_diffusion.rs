use serde::{Deserialize, Serialize};

use crate::discretization::mesh::{Cell, Face};
use crate::physics::functional::FunctionalPhysics;

/// Rates of `∂C/∂t = D·∇²C + production − degradation·C`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReactionDiffusionParams {
    pub diffusion: f64,
    pub production: f64,
    pub degradation: f64,
}

impl ReactionDiffusionParams {
    pub fn pure_diffusion(diffusion: f64) -> Self {
        Self {
            diffusion,
            production: 0.0,
            degradation: 0.0,
        }
    }
}

impl Default for ReactionDiffusionParams {
    fn default() -> Self {
        Self::pure_diffusion(50.0)
    }
}

/// Creates a FunctionalPhysics object configured for single-species
/// reaction-diffusion. Boundary faces carry no flux.
pub fn setup_reaction_diffusion_physics(
    params: ReactionDiffusionParams,
) -> FunctionalPhysics<ReactionDiffusionParams> {
    // Two-point flux: D (u_k - u_l), scaled by |σ|/d in the assembly.
    let flux = Box::new(
        |f: &mut [f64], u_k: &[f64], u_l: &[f64], _face: &Face, data: &ReactionDiffusionParams| {
            f[0] = data.diffusion * (u_k[0] - u_l[0]);
        },
    );

    let reaction = Box::new(
        |f: &mut [f64], u: &[f64], _cell: &Cell, data: &ReactionDiffusionParams| {
            f[0] = data.degradation * u[0] - data.production;
        },
    );

    let storage = Box::new(
        |f: &mut [f64], u: &[f64], _cell: &Cell, _data: &ReactionDiffusionParams| {
            f[0] = u[0];
        },
    );

    FunctionalPhysics::new(vec!["concentration".into()], params, flux, reaction, storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::mesh::tests::square_mesh;
    use crate::numerics::transient::TransientSolver;
    use approx::assert_relative_eq;
    use nalgebra::DVector;

    #[test]
    fn uniform_state_is_stationary_without_reactions() {
        let mesh = square_mesh(4, 1.0);
        let model = setup_reaction_diffusion_physics(ReactionDiffusionParams::pure_diffusion(3.0));
        let u = DVector::from_element(mesh.num_cells(), 2.5);
        assert!(model.calculate_residual(&mesh, &u).amax() < 1e-14);
    }

    #[test]
    fn degradation_decays_uniform_state() {
        let mesh = square_mesh(2, 1.0);
        let mut model = setup_reaction_diffusion_physics(ReactionDiffusionParams {
            diffusion: 1.0,
            production: 0.0,
            degradation: 0.5,
        });
        let tvec: Vec<f64> = (0..=200).map(|i| i as f64 * 0.01).collect();
        let u = TransientSolver::default()
            .solve(
                &mut model,
                &mesh,
                DVector::from_element(mesh.num_cells(), 1.0),
                &tvec,
                false,
                |_, _, _| {},
            )
            .unwrap();
        // Backward Euler: (1 + k dt)^-n.
        let expected = (1.0f64 + 0.5 * 0.01).powi(-200);
        assert_relative_eq!(u[0], expected, max_relative = 1e-6);
    }

    #[test]
    fn production_balances_degradation() {
        let mesh = square_mesh(2, 1.0);
        let model = setup_reaction_diffusion_physics(ReactionDiffusionParams {
            diffusion: 1.0,
            production: 2.0,
            degradation: 4.0,
        });
        let u = DVector::from_element(mesh.num_cells(), 0.5);
        assert!(model.calculate_residual(&mesh, &u).amax() < 1e-14);
    }
}
