use approx::assert_relative_eq;

use frap_rs::discretization::DelaunayGenerator;
use frap_rs::experiment::{Experiment, Meshable};
use frap_rs::geometry::{Domain, LengthUnit};
use frap_rs::models::ReactionDiffusionParams;
use frap_rs::numerics::time_vector;
use frap_rs::roi::{DefaultRoiParams, ALL, BLEACHED_SQUARE};
use frap_rs::simulation::{IcMode, Simulation, SimulationState};

fn bleach_ic() -> IcMode {
    IcMode::Ideal {
        bleached_roi: BLEACHED_SQUARE.into(),
        val_in: 0.0,
        val_out: 1.0,
    }
}

#[test]
fn closed_cylinder_conserves_mass() {
    let mut domain = Domain::new(LengthUnit::Pixel);
    domain
        .add_cylinder_by_parameters([0.0, 0.0], 10.0, 0.0, 4.0, 2.0, true, true, true)
        .unwrap();
    let sim = Simulation::new(
        ReactionDiffusionParams::pure_diffusion(5.0),
        LengthUnit::Pixel,
        time_vector::uniform(5.0, 51).unwrap(),
        bleach_ic(),
    );
    let mut exp = Experiment::new("cylinder", domain, sim);
    exp.rois
        .add_default_rois(&DefaultRoiParams {
            center: [0.0, 0.0],
            radius: 10.0,
            square_side: 6.0,
            ..DefaultRoiParams::default()
        })
        .unwrap();
    exp.gen_mesh(&DelaunayGenerator::default()).unwrap();
    exp.build_ic().unwrap();
    exp.run_simulation(false).unwrap();

    let summary = exp.simulation.summary();
    assert_eq!(summary.state, SimulationState::Completed);
    assert_eq!(summary.steps_completed, 50);
    assert!(summary.relative_mass_drift.unwrap() < 1e-3);
}

#[test]
fn end_to_end_bleach_recovery() {
    let mut domain = Domain::new(LengthUnit::Pixel);
    domain
        .add_circle_by_parameters([256.0, 256.0], 300.0, 0.0, 30.0, true, true)
        .unwrap();
    let sim = Simulation::new(
        ReactionDiffusionParams::pure_diffusion(50.0),
        LengthUnit::Pixel,
        time_vector::uniform(1500.0, 1001).unwrap(),
        bleach_ic(),
    );
    let mut exp = Experiment::new("e2e", domain, sim);
    exp.rois
        .add_default_rois(&DefaultRoiParams {
            rim_factor: 0.8,
            square_side: 140.0,
            ..DefaultRoiParams::default()
        })
        .unwrap();
    exp.gen_mesh(&DelaunayGenerator::default()).unwrap();
    exp.build_ic().unwrap();
    exp.run_simulation(false).unwrap();

    let bleached = &exp.rois.get(BLEACHED_SQUARE).unwrap().sim_vec;
    let all = &exp.rois.get(ALL).unwrap().sim_vec;
    assert_eq!(bleached.len(), 1001);
    assert_relative_eq!(bleached[0], 0.0);
    for w in bleached.windows(2) {
        assert!(w[1] >= w[0] - 1e-6, "{} then {}", w[0], w[1]);
    }
    let tol = exp.simulation.interpolation_error.unwrap_or(1e-2);
    assert!((bleached[1000] - all[1000]).abs() < tol);
    // The All mean is the conserved total over the volume.
    assert_relative_eq!(all[0], all[1000], max_relative = 1e-6);
}

#[test]
fn log_time_vector_keeps_end_points() {
    let mut sim = Simulation::new(
        ReactionDiffusionParams::default(),
        LengthUnit::Pixel,
        time_vector::uniform(100.0, 11).unwrap(),
        bleach_ic(),
    );
    sim.to_log_time_scale().unwrap();
    assert_eq!(sim.tvec.len(), 11);
    assert_eq!(sim.tvec[0], 0.0);
    assert_eq!(sim.tvec[10], 100.0);
    assert!(sim.tvec.windows(2).all(|w| w[1] > w[0]));
}

#[test]
fn optimal_time_vector_follows_mesh_and_diffusion() {
    let mut domain = Domain::new(LengthUnit::Pixel);
    domain
        .add_circle_by_parameters([0.0, 0.0], 10.0, 0.0, 2.0, true, true)
        .unwrap();
    let mesh = frap_rs::discretization::MeshGenerator::generate(
        &frap_rs::discretization::DelaunayGenerator::default(),
        &domain,
        1.0,
    )
    .unwrap();
    let mut sim = Simulation::new(
        ReactionDiffusionParams::pure_diffusion(5.0),
        LengthUnit::Pixel,
        vec![0.0, 1.0],
        bleach_ic(),
    );
    let cfg = time_vector::OptimalTvecConfig::default();
    sim.set_opt_tvec(&mesh, 200.0, &cfg).unwrap();
    let n = sim.tvec.len();
    assert!(n >= cfg.min_points && n <= cfg.max_points);
    assert_eq!(sim.tvec[0], 0.0);
    assert_eq!(sim.tvec[n - 1], 200.0);
}
