use std::fmt;
use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use crate::discretization::{Mesh, MeshStats};
use crate::fitting::{Fit, PARAM_NAMES};
use crate::geometry::LengthUnit;
use crate::simulation::{Simulation, SimulationSummary};

/// Text report of one fit: parameters, residual and convergence.
pub struct FitReport<'a>(pub &'a Fit);

impl fmt::Display for FitReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fit = self.0;
        writeln!(f, "Fit `{}`", fit.name)?;
        writeln!(f, "  ROIs:                {}", fit.rois.join(", "))?;
        writeln!(
            f,
            "  Strategy:            {:?}, {:?} norm{}",
            fit.strategy,
            fit.norm,
            if fit.fit_pinned { ", pinned" } else { "" }
        )?;
        let Some(result) = &fit.result else {
            return writeln!(f, "  (not run)");
        };
        for ((name, spec), value) in PARAM_NAMES.iter().zip(fit.params.specs()).zip(result.x) {
            if spec.free {
                writeln!(
                    f,
                    "  {name:<20} {value:.6e}  (x0 {:.3e}, bounds [{:.3e}, {:.3e}])",
                    spec.x0, spec.lower, spec.upper
                )?;
            } else {
                writeln!(f, "  {name:<20} {value:.6e}  (fixed)")?;
            }
        }
        writeln!(f, "  Residual:            {:.6e}", result.residual)?;
        writeln!(f, "  Iterations:          {}", result.iterations)?;
        writeln!(f, "  Evaluations:         {}", result.evaluations)?;
        writeln!(f, "  Converged:           {}", result.success)
    }
}

pub struct RunSummary<'a> {
    pub unit: LengthUnit,
    pub mesh: MeshStats,
    pub simulation: SimulationSummary,
    pub fits: &'a [Fit],
}

impl<'a> RunSummary<'a> {
    pub fn from_run(mesh: &Mesh, simulation: &Simulation, fits: &'a [Fit]) -> Self {
        Self {
            unit: mesh.frame.unit,
            mesh: mesh.stats(),
            simulation: simulation.summary(),
            fits,
        }
    }

    pub fn write_to_file<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let mut file = File::create(path)?;
        write!(file, "{self}")
    }

    pub fn print_to_console(&self) {
        print!("{self}");
    }
}

fn opt(v: Option<f64>) -> String {
    v.map_or_else(|| "-".to_string(), |v| format!("{v:.6e}"))
}

impl fmt::Display for RunSummary<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f, "FRAP ANALYSIS SUMMARY")?;
        writeln!(f, "{}", "=".repeat(60))?;
        writeln!(f)?;

        let m = &self.mesh;
        writeln!(f, "MESH STATISTICS")?;
        writeln!(f, "{}", "-".repeat(60))?;
        writeln!(f, "Length unit:         {:?}", self.unit)?;
        writeln!(f, "Number of cells:     {}", m.num_cells)?;
        writeln!(f, "Number of faces:     {} ({} boundary)", m.num_faces, m.num_boundary_faces)?;
        writeln!(f, "Number of nodes:     {}", m.num_nodes)?;
        writeln!(f, "Min cell spacing:    {:.6e}", m.min_spacing)?;
        writeln!(f, "Max cell spacing:    {:.6e}", m.max_spacing)?;
        writeln!(f, "Cell volume range:   {:.6e} to {:.6e}", m.min_volume, m.max_volume)?;
        writeln!(f, "Total volume:        {:.6e}", m.total_volume)?;
        writeln!(f)?;

        let s = &self.simulation;
        writeln!(f, "SIMULATION")?;
        writeln!(f, "{}", "-".repeat(60))?;
        writeln!(f, "State:               {:?}", s.state)?;
        writeln!(f, "Steps:               {} of {}", s.steps_completed, s.steps_requested)?;
        writeln!(f, "Final time:          {}", opt(s.final_time))?;
        writeln!(f, "Initial mass:        {}", opt(s.mass_initial))?;
        writeln!(f, "Final mass:          {}", opt(s.mass_final))?;
        writeln!(f, "Rel. mass drift:     {}", opt(s.relative_mass_drift))?;
        writeln!(f, "Interpolation error: {}", opt(s.interpolation_error))?;

        if !self.fits.is_empty() {
            writeln!(f)?;
            writeln!(f, "FITS")?;
            writeln!(f, "{}", "-".repeat(60))?;
            for fit in self.fits {
                write!(f, "{}", FitReport(fit))?;
            }
        }
        writeln!(f, "{}", "=".repeat(60))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::mesh::tests::square_mesh;
    use crate::fitting::{FitResult, ParameterSpec};
    use crate::models::ReactionDiffusionParams;
    use crate::simulation::IcMode;

    #[test]
    fn report_lists_free_and_fixed_parameters() {
        let mut fit = Fit::new("f");
        fit.rois.push("Bleached Square".into());
        fit.params.time_offset = ParameterSpec::free(0.0, -1.0, 1.0);
        assert!(FitReport(&fit).to_string().contains("(not run)"));
        fit.result = Some(FitResult {
            x: [10.0, 0.0, 0.0, 0.5],
            residual: 1e-8,
            iterations: 12,
            evaluations: 30,
            success: true,
            fitted: Vec::new(),
        });
        let text = FitReport(&fit).to_string();
        assert!(text.contains("diffusion"));
        assert!(text.contains("(fixed)"));
        assert!(text.contains("Converged:           true"));
    }

    #[test]
    fn summary_written_to_file() {
        let mesh = square_mesh(3, 3.0);
        let sim = Simulation::new(
            ReactionDiffusionParams::default(),
            LengthUnit::Pixel,
            vec![0.0, 1.0],
            IcMode::Ideal {
                bleached_roi: "Bleached Square".into(),
                val_in: 0.0,
                val_out: 1.0,
            },
        );
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("summary.txt");
        RunSummary::from_run(&mesh, &sim, &[]).write_to_file(&path).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("Number of cells:     18"));
        assert!(text.contains("State:               Unconfigured"));
    }
}
