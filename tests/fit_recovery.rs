use frap_rs::discretization::DelaunayGenerator;
use frap_rs::error::FitError;
use frap_rs::experiment::{Experiment, Fittable, Meshable};
use frap_rs::fitting::{Fit, NelderMead, OptimizeResult, Optimizer, ParameterSpec};
use frap_rs::geometry::{Domain, LengthUnit};
use frap_rs::models::ReactionDiffusionParams;
use frap_rs::numerics::time_vector;
use frap_rs::roi::{DefaultRoiParams, BLEACHED_SQUARE};
use frap_rs::simulation::{IcMode, Simulation};
use frap_rs::FrapError;

const D_TRUE: f64 = 10.0;

/// Disk experiment whose measured data is a simulation at `D_TRUE`.
fn synthetic_experiment() -> Experiment {
    let mut domain = Domain::new(LengthUnit::Pixel);
    domain
        .add_circle_by_parameters([0.0, 0.0], 10.0, 0.0, 2.5, true, true)
        .unwrap();
    let sim = Simulation::new(
        ReactionDiffusionParams::pure_diffusion(D_TRUE),
        LengthUnit::Pixel,
        time_vector::uniform(2.0, 41).unwrap(),
        IcMode::Ideal {
            bleached_roi: BLEACHED_SQUARE.into(),
            val_in: 0.0,
            val_out: 1.0,
        },
    );
    let mut exp = Experiment::new("synthetic", domain, sim);
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
    for roi in exp.rois.iter_mut() {
        roi.data_vec = roi.sim_vec.clone();
    }
    exp.data_tvec = exp.simulation.tvec.clone();
    exp
}

fn diffusion_fit(x0: f64) -> Fit {
    let mut fit = Fit::new("diffusion only");
    fit.rois.push(BLEACHED_SQUARE.into());
    fit.params.diffusion = ParameterSpec::free(x0, 1.0, 100.0);
    fit
}

#[test]
fn recovers_diffusion_from_synthetic_data() {
    let mut exp = synthetic_experiment();
    let mut fit = diffusion_fit(50.0);
    fit.set_equ(true);
    let i = exp.add_fit(fit);
    let result = exp.run_fit(i, &NelderMead::default(), false).unwrap().clone();
    assert!(result.success);
    let d = result.x[0];
    assert!((d - D_TRUE).abs() / D_TRUE < 0.05, "fitted D = {d}");
    assert_eq!(result.x[1], 0.0);
    assert_eq!(result.x[2], 0.0);
    assert_eq!(result.fitted.len(), 1);
    assert_eq!(result.fitted[0].0, BLEACHED_SQUARE);
    assert_eq!(result.fitted[0].1.len(), exp.data_tvec.len());
    exp.fits()[i].print_results();
}

/// Evaluates the starting point once and gives up.
struct GiveUp;

impl Optimizer for GiveUp {
    fn minimize(
        &self,
        objective: &mut dyn FnMut(&[f64]) -> f64,
        x0: &[f64],
        _bounds: &[(f64, f64)],
    ) -> OptimizeResult {
        OptimizeResult {
            x: x0.to_vec(),
            fun: objective(x0),
            iterations: 0,
            evaluations: 1,
            success: false,
        }
    }
}

#[test]
fn custom_optimizer_failure_is_reported() {
    let mut exp = synthetic_experiment();
    let i = exp.add_fit(diffusion_fit(50.0));
    let err = exp.run_fit(i, &GiveUp, false).unwrap_err();
    match err {
        FrapError::Fit(FitError::NotConverged(failure)) => {
            assert_eq!(failure.x[0], 50.0);
            assert!(failure.residual > 0.0);
        }
        other => panic!("unexpected error {other}"),
    }
    let stored = exp.fits()[i].result.as_ref().unwrap();
    assert!(!stored.success);
}

#[test]
fn offset_beyond_simulation_is_rejected() {
    let mut exp = synthetic_experiment();
    let mut fit = diffusion_fit(50.0);
    fit.params.time_offset = ParameterSpec::free(0.0, -1.0, 5.0);
    let i = exp.add_fit(fit);
    let err = exp.run_fit(i, &NelderMead::default(), false).unwrap_err();
    assert!(matches!(err, FrapError::Fit(FitError::OutOfRange(_))));
}

#[test]
fn fit_without_rois_fails() {
    let mut exp = synthetic_experiment();
    let i = exp.add_fit(Fit::new("empty"));
    let err = exp.run_fit(i, &NelderMead::default(), false).unwrap_err();
    assert!(matches!(err, FrapError::Fit(FitError::NoRois)));
}

#[test]
fn failed_fit_does_not_stop_the_others() {
    let mut exp = synthetic_experiment();
    exp.add_fit(Fit::new("empty"));
    exp.add_fit(diffusion_fit(20.0));
    let outcomes = exp.run_all_fits(&NelderMead::default(), false);
    assert!(outcomes[0].is_err());
    assert!(outcomes[1].is_ok());
    assert!(exp.fits()[1].result.as_ref().unwrap().success);
}
