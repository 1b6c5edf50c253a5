use std::error::Error;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use frap_rs::discretization::DelaunayGenerator;
use frap_rs::experiment::{Experiment, Meshable};
use frap_rs::geometry::{Domain, LengthUnit};
use frap_rs::models::ReactionDiffusionParams;
use frap_rs::numerics::time_vector;
use frap_rs::processing::csv_writer::{self, RoiColumn};
use frap_rs::roi::{DefaultRoiParams, ALL, BLEACHED_SQUARE};
use frap_rs::simulation::{IcMode, Simulation};

/// Parameters of the end-to-end run, readable from an optional JSON file.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct Scenario {
    center: [f64; 2],
    radius: f64,
    vol_size: f64,
    rois: DefaultRoiParams,
    val_in: f64,
    val_out: f64,
    duration: f64,
    n_points: usize,
    log_time: bool,
    params: ReactionDiffusionParams,
    output_dir: String,
}

impl Default for Scenario {
    fn default() -> Self {
        Self {
            center: [256.0, 256.0],
            radius: 300.0,
            vol_size: 30.0,
            rois: DefaultRoiParams::default(),
            val_in: 0.0,
            val_out: 1.0,
            duration: 1500.0,
            n_points: 1001,
            log_time: false,
            params: ReactionDiffusionParams::pure_diffusion(50.0),
            output_dir: "output/main".into(),
        }
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let scenario: Scenario = match std::env::args().nth(1) {
        Some(path) => {
            info!(%path, "reading scenario");
            serde_json::from_str(&fs::read_to_string(path)?)?
        }
        None => Scenario::default(),
    };
    let out = Path::new(&scenario.output_dir);
    fs::create_dir_all(out)?;

    let mut domain = Domain::new(LengthUnit::Pixel);
    domain.add_circle_by_parameters(scenario.center, scenario.radius, 0.0, scenario.vol_size, true, true)?;

    let simulation = Simulation::new(
        scenario.params,
        LengthUnit::Pixel,
        time_vector::uniform(scenario.duration, scenario.n_points)?,
        IcMode::Ideal {
            bleached_roi: BLEACHED_SQUARE.into(),
            val_in: scenario.val_in,
            val_out: scenario.val_out,
        },
    );
    let mut exp = Experiment::new("main", domain, simulation);
    exp.rois.add_default_rois(&scenario.rois)?;
    if scenario.log_time {
        exp.simulation.to_log_time_scale()?;
    }

    exp.gen_mesh(&DelaunayGenerator::default())?;
    exp.build_ic()?;
    exp.run_simulation(false)?;

    check_recovery(&exp);
    save_roi_series(&exp, out)?;

    let summary = exp.summary()?;
    summary.write_to_file(out.join("simulation_summary.txt"))?;
    summary.print_to_console();
    println!("Results saved to {}", out.display());
    Ok(())
}

fn check_recovery(exp: &Experiment) {
    let series = |name| exp.rois.get(name).map(|r| r.sim_vec.as_slice()).unwrap_or_default();
    let bleached = series(BLEACHED_SQUARE);
    let all = series(ALL);
    let monotone = bleached.windows(2).all(|w| w[1] >= w[0] - 1e-9);
    if let (Some(b), Some(a)) = (bleached.last(), all.last()) {
        info!(
            monotone,
            bleached_final = b,
            all_mean = a,
            gap = (a - b).abs(),
            "bleached square recovery"
        );
    }
    if !monotone {
        warn!("bleached square series is not monotone");
    }
}

fn save_roi_series(exp: &Experiment, out: &Path) -> Result<(), Box<dyn Error>> {
    let times = &exp.simulation.completed_times;
    csv_writer::write_roi_series(out.join("roi_series.csv"), "t", times, &exp.rois, RoiColumn::Simulated)?;
    csv_writer::write_csv(
        out.join("mass_history.csv"),
        &["t", "mass"],
        &[times.clone(), exp.simulation.mass_history.clone()],
    )?;
    info!(path = %out.join("roi_series.csv").display(), "ROI series saved");
    Ok(())
}
