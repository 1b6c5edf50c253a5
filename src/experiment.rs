//! A FRAP experiment: one domain, its mesh, the ROIs, a simulation and any
//! number of fits.
//!
//! The experiment owns the mesh and keeps everything derived from it in step:
//! whenever the mesh changes identity (generation, refinement, merge) every ROI
//! index set is recomputed and the simulation is rebound.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::discretization::{merge_meshes, Mesh, MeshGenerator};
use crate::error::{FitError, FrapError, GeometryError, SimulationError};
use crate::fitting::{Fit, FitResult, Optimizer};
use crate::geometry::Domain;
use crate::image::ImageFrame;
use crate::processing::summary::RunSummary;
use crate::roi::{RoiSet, BLEACHED_SQUARE, RIM};
use crate::simulation::{IcMode, Simulation};

/// Something that owns a domain and can mesh it.
pub trait Meshable {
    fn domain(&self) -> &Domain;
    fn mesh(&self) -> Option<&Mesh>;
    /// Mesh the domain unless an up-to-date mesh already exists.
    fn gen_mesh(&mut self, generator: &dyn MeshGenerator) -> Result<&Mesh, FrapError>;
}

/// Something that holds fits against its ROI data.
pub trait Fittable {
    fn fits(&self) -> &[Fit];
    fn add_fit(&mut self, fit: Fit) -> usize;
    fn run_fit(
        &mut self,
        index: usize,
        optimizer: &dyn Optimizer,
        debug: bool,
    ) -> Result<&FitResult, FrapError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Experiment {
    pub name: String,
    domain: Domain,
    mesh: Option<Mesh>,
    mesh_stale: bool,
    /// Global scaling of target cell sizes passed to the generator.
    pub mesh_factor: f64,
    pub rois: RoiSet,
    pub simulation: Simulation,
    pub fits: Vec<Fit>,
    /// Acquisition times of `frames`.
    pub data_tvec: Vec<f64>,
    pub frames: Vec<ImageFrame>,
}

impl Experiment {
    pub fn new(name: impl Into<String>, domain: Domain, simulation: Simulation) -> Self {
        Self {
            name: name.into(),
            domain,
            mesh: None,
            mesh_stale: true,
            mesh_factor: 1.0,
            rois: RoiSet::new(),
            simulation,
            fits: Vec::new(),
            data_tvec: Vec::new(),
            frames: Vec::new(),
        }
    }

    /// Mutable access to the geometry. The current mesh is considered stale
    /// afterwards.
    pub fn domain_mut(&mut self) -> &mut Domain {
        self.mesh_stale = true;
        &mut self.domain
    }

    pub fn mesh_is_stale(&self) -> bool {
        self.mesh_stale
    }

    pub fn set_vol_size_px(&mut self, vol_size: f64) {
        self.domain_mut().set_global_vol_size(vol_size);
    }

    fn require_mesh(&self) -> Result<&Mesh, SimulationError> {
        self.mesh.as_ref().ok_or(SimulationError::MissingMesh)
    }

    /// Adopt `mesh`, recompute every ROI against it and rebind the simulation.
    pub fn set_mesh(&mut self, mesh: Mesh) -> Result<&Mesh, FrapError> {
        self.rois.invalidate_all();
        self.rois.compute_roi_idxs(&mesh)?;
        self.simulation.bind_mesh(&mesh);
        self.mesh_stale = false;
        Ok(self.mesh.insert(mesh))
    }

    /// Merge `other` into the current mesh. Explicit index lists of either
    /// source mesh are carried over through the merge map.
    pub fn merge_mesh(&mut self, other: &Mesh, coherent: bool) -> Result<&Mesh, FrapError> {
        let current = self.require_mesh()?;
        let merged = merge_meshes(&[current, other], coherent)?;
        let translated = self.rois.translate(&merged);
        info!(
            cells = merged.mesh.num_cells(),
            translated_rois = translated,
            "merged mesh into experiment"
        );
        self.set_mesh(merged.mesh)
    }

    /// Refine the mesh inside the footprint of ROI `name`: the target size there
    /// is the current smallest target size divided by `factor`. `add_z` widens the
    /// refinement box vertically. An existing background field keeps acting
    /// outside the box.
    pub fn refine_roi_in_mesh(
        &mut self,
        name: &str,
        factor: f64,
        add_z: f64,
        generator: &dyn MeshGenerator,
    ) -> Result<&Mesh, FrapError> {
        if !(factor > 0.0 && factor.is_finite()) {
            return Err(GeometryError::InvalidParameter(format!(
                "refinement factor must be positive, got {factor}"
            ))
            .into());
        }
        let (lo, hi) = self.rois.footprint(name)?.ok_or_else(|| {
            GeometryError::InvalidParameter(format!("ROI `{name}` has no bounded footprint"))
        })?;
        let (d_lo, d_hi) = self.domain.bounding_box().ok_or_else(|| {
            GeometryError::InvalidParameter("cannot refine an empty domain".into())
        })?;
        let z_lo = (if lo[2].is_finite() { lo[2] } else { d_lo[2] }) - add_z;
        let z_hi = (if hi[2].is_finite() { hi[2] } else { d_hi[2] }) + add_z;

        let base = self
            .domain
            .vertices()
            .map(|v| v.vol_size)
            .filter(|s| *s > 0.0)
            .fold(f64::INFINITY, f64::min);
        let base = match self.domain.bkgd_field() {
            Some(id) => base.min(self.domain.field_min_size(id)),
            None => base,
        };
        if !base.is_finite() {
            return Err(GeometryError::InvalidParameter(
                "domain prescribes no cell size to refine".into(),
            )
            .into());
        }
        let diag: f64 = (0..3).map(|i| (d_hi[i] - d_lo[i]).powi(2)).sum::<f64>().sqrt();

        let previous = self.domain.bkgd_field();
        let domain = self.domain_mut();
        let size = base / factor;
        let boxed = domain.add_box_field(
            size,
            diag.max(base),
            [lo[0], lo[1], z_lo],
            [hi[0], hi[1], z_hi],
        );
        let field = match previous {
            Some(prev) => domain.add_min_field(&[prev, boxed])?,
            None => boxed,
        };
        domain.set_as_bkgd_field(field)?;
        info!(roi = name, size, "refining mesh inside ROI");
        self.gen_mesh(generator)
    }

    /// Attach images and their acquisition times, then extract every ROI's
    /// data series.
    pub fn set_data(&mut self, frames: Vec<ImageFrame>, data_tvec: Vec<f64>) -> Result<(), FrapError> {
        if frames.len() != data_tvec.len() {
            return Err(FitError::MissingData(format!(
                "{} frames but {} time points",
                frames.len(),
                data_tvec.len()
            ))
            .into());
        }
        self.frames = frames;
        self.data_tvec = data_tvec;
        let names: Vec<String> = self.rois.names().into_iter().map(String::from).collect();
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        self.rois.extract_data(&names, &self.frames)?;
        Ok(())
    }

    /// Choose the initial condition. With `equ` the bleached square starts at
    /// its first measured value and everything else at the rim's; otherwise
    /// the first frame is interpolated onto the mesh.
    pub fn build_initial_condition(&mut self, equ: bool) -> Result<(), FrapError> {
        let mode = if equ {
            let first = |name: &str| {
                self.rois
                    .get(name)
                    .ok()
                    .and_then(|r| r.data_vec.first().copied())
                    .filter(|v| v.is_finite())
            };
            IcMode::Ideal {
                bleached_roi: BLEACHED_SQUARE.into(),
                val_in: first(BLEACHED_SQUARE).unwrap_or(0.0),
                val_out: first(RIM).unwrap_or(1.0),
            }
        } else {
            let frame = self
                .frames
                .first()
                .cloned()
                .ok_or_else(|| FitError::MissingData("no image frame for the initial condition".into()))?;
            IcMode::Image { frame }
        };
        self.simulation.set_ic_mode(mode);
        self.build_ic()
    }

    /// Build the initial condition from the simulation's current [`IcMode`].
    pub fn build_ic(&mut self) -> Result<(), FrapError> {
        let mesh = self.mesh.as_ref().ok_or(SimulationError::MissingMesh)?;
        self.simulation.build_ic(mesh, &self.rois)?;
        Ok(())
    }

    pub fn run_simulation(&mut self, debug: bool) -> Result<(), FrapError> {
        let mesh = self.mesh.as_ref().ok_or(SimulationError::MissingMesh)?;
        self.simulation.run(mesh, &mut self.rois, debug)?;
        Ok(())
    }

    /// Run every fit. A failing fit does not stop the others.
    pub fn run_all_fits(&mut self, optimizer: &dyn Optimizer, debug: bool) -> Vec<Result<(), FrapError>> {
        let mut outcomes = Vec::with_capacity(self.fits.len());
        for i in 0..self.fits.len() {
            let outcome = self.run_fit(i, optimizer, debug).map(|_| ());
            if let Err(e) = &outcome {
                warn!(fit = %self.fits[i].name, error = %e, "fit failed");
            }
            outcomes.push(outcome);
        }
        outcomes
    }

    pub fn summary(&self) -> Result<RunSummary<'_>, SimulationError> {
        Ok(RunSummary::from_run(self.require_mesh()?, &self.simulation, &self.fits))
    }
}

impl Meshable for Experiment {
    fn domain(&self) -> &Domain {
        &self.domain
    }

    fn mesh(&self) -> Option<&Mesh> {
        self.mesh.as_ref()
    }

    fn gen_mesh(&mut self, generator: &dyn MeshGenerator) -> Result<&Mesh, FrapError> {
        if !self.mesh_stale && self.mesh.is_some() {
            return self.mesh.as_ref().ok_or_else(|| SimulationError::MissingMesh.into());
        }
        let mesh = generator.generate(&self.domain, self.mesh_factor)?;
        info!(experiment = %self.name, cells = mesh.num_cells(), "mesh generated");
        self.set_mesh(mesh)
    }
}

impl Fittable for Experiment {
    fn fits(&self) -> &[Fit] {
        &self.fits
    }

    fn add_fit(&mut self, fit: Fit) -> usize {
        self.fits.push(fit);
        self.fits.len() - 1
    }

    /// Build the initial condition the fit asks for, then run it.
    fn run_fit(
        &mut self,
        index: usize,
        optimizer: &dyn Optimizer,
        debug: bool,
    ) -> Result<&FitResult, FrapError> {
        let equ = self
            .fits
            .get(index)
            .ok_or_else(|| FitError::MissingData(format!("no fit with index {index}")))?
            .equ;
        self.build_initial_condition(equ)?;
        let mesh = self.mesh.as_ref().ok_or(SimulationError::MissingMesh)?;
        let fit = &mut self.fits[index];
        Ok(fit.run(
            mesh,
            &mut self.rois,
            &self.simulation,
            &self.data_tvec,
            optimizer,
            debug,
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::DelaunayGenerator;
    use crate::geometry::LengthUnit;
    use crate::models::ReactionDiffusionParams;
    use crate::image::PixelTransform;
    use crate::roi::{DefaultRoiParams, ALL};
    use approx::assert_relative_eq;

    fn disk_experiment() -> Experiment {
        let mut domain = Domain::new(LengthUnit::Pixel);
        domain
            .add_circle_by_parameters([0.0, 0.0], 10.0, 0.0, 2.0, true, true)
            .unwrap();
        let sim = Simulation::new(
            ReactionDiffusionParams::pure_diffusion(5.0),
            LengthUnit::Pixel,
            vec![0.0, 0.5, 1.0],
            IcMode::Ideal {
                bleached_roi: BLEACHED_SQUARE.into(),
                val_in: 0.0,
                val_out: 1.0,
            },
        );
        let mut exp = Experiment::new("disk", domain, sim);
        exp.rois
            .add_default_rois(&DefaultRoiParams {
                center: [0.0, 0.0],
                radius: 10.0,
                square_side: 4.0,
                ..DefaultRoiParams::default()
            })
            .unwrap();
        exp
    }

    #[test]
    fn mesh_is_cached_until_geometry_changes() {
        let mut exp = disk_experiment();
        let gen = DelaunayGenerator::default();
        let first = exp.gen_mesh(&gen).unwrap().id;
        assert_eq!(exp.gen_mesh(&gen).unwrap().id, first);
        exp.set_vol_size_px(3.0);
        assert!(exp.mesh_is_stale());
        let second = exp.gen_mesh(&gen).unwrap().id;
        assert_ne!(second, first);
        let mesh = exp.mesh().unwrap();
        assert!(exp.rois.get(ALL).unwrap().mesh_idx(mesh).is_ok());
        assert_eq!(exp.simulation.bound_mesh(), Some(second));
    }

    #[test]
    fn refinement_shrinks_cells_inside_roi() {
        let mut exp = disk_experiment();
        let gen = DelaunayGenerator::default();
        let coarse = exp.gen_mesh(&gen).unwrap().clone();
        let count = |m: &Mesh, rois: &RoiSet| rois.get(BLEACHED_SQUARE).unwrap().mesh_idx(m).unwrap().len();
        let before = count(&coarse, &exp.rois);
        exp.refine_roi_in_mesh(BLEACHED_SQUARE, 4.0, 0.0, &gen).unwrap();
        let fine = exp.mesh().unwrap();
        assert!(count(fine, &exp.rois) > 4 * before);
        assert!(exp.rois.get(BLEACHED_SQUARE).unwrap().mesh_idx(&coarse).is_err());
    }

    #[test]
    fn refinement_factor_must_be_positive() {
        let mut exp = disk_experiment();
        let gen = DelaunayGenerator::default();
        exp.gen_mesh(&gen).unwrap();
        for factor in [0.0, -2.0, f64::NAN] {
            assert!(matches!(
                exp.refine_roi_in_mesh(BLEACHED_SQUARE, factor, 0.0, &gen),
                Err(FrapError::Geometry(GeometryError::InvalidParameter(_)))
            ));
        }
    }

    #[test]
    fn run_requires_mesh() {
        let mut exp = disk_experiment();
        assert!(matches!(
            exp.run_simulation(false),
            Err(FrapError::Simulation(SimulationError::MissingMesh))
        ));
    }

    #[test]
    fn simulation_fills_every_roi() {
        let mut exp = disk_experiment();
        exp.gen_mesh(&DelaunayGenerator::default()).unwrap();
        exp.build_initial_condition(true).unwrap();
        exp.run_simulation(false).unwrap();
        for roi in exp.rois.iter() {
            assert_eq!(roi.sim_vec.len(), 3, "{}", roi.name);
        }
        let bleached = &exp.rois.get(BLEACHED_SQUARE).unwrap().sim_vec;
        assert!(bleached[2] > bleached[0]);
        assert!(exp.summary().is_ok());
    }

    #[test]
    fn image_initial_condition_needs_frames() {
        let mut exp = disk_experiment();
        exp.gen_mesh(&DelaunayGenerator::default()).unwrap();
        assert!(matches!(
            exp.build_initial_condition(false),
            Err(FrapError::Fit(FitError::MissingData(_)))
        ));
    }

    #[test]
    fn measured_data_drives_initial_condition() {
        let mut exp = disk_experiment();
        exp.gen_mesh(&DelaunayGenerator::default()).unwrap();
        let transform = PixelTransform {
            resolution: 1.0,
            offset: [-10.0, -10.0],
        };
        let bleached = ImageFrame::from_fn(21, 21, transform, |x, y| {
            if x.abs() <= 2.0 && y.abs() <= 2.0 {
                0.2
            } else {
                0.9
            }
        });
        let later = ImageFrame::from_fn(21, 21, transform, |_, _| 0.8);

        assert!(matches!(
            exp.set_data(vec![bleached.clone()], vec![0.0, 1.0]),
            Err(FrapError::Fit(FitError::MissingData(_)))
        ));
        exp.set_data(vec![bleached, later], vec![0.0, 1.0]).unwrap();
        let square = exp.rois.get(BLEACHED_SQUARE).unwrap();
        assert_eq!(square.data_vec.len(), 2);
        assert_relative_eq!(square.data_vec[0], 0.2, epsilon = 1e-12);
        assert_relative_eq!(square.data_vec[1], 0.8, epsilon = 1e-12);
        assert_relative_eq!(exp.rois.get(RIM).unwrap().data_vec[0], 0.9, epsilon = 1e-12);

        exp.build_initial_condition(true).unwrap();
        let ic = exp.simulation.initial_condition().unwrap();
        assert_relative_eq!(ic.min(), 0.2, epsilon = 1e-12);
        assert_relative_eq!(ic.max(), 0.9, epsilon = 1e-12);
        assert_eq!(exp.simulation.interpolation_error, None);

        exp.build_initial_condition(false).unwrap();
        assert!(exp.simulation.interpolation_error.is_some());
    }

    #[test]
    fn merge_keeps_cell_count() {
        let mut exp = disk_experiment();
        let gen = DelaunayGenerator::default();
        let a = exp.gen_mesh(&gen).unwrap().num_cells();
        let mut other_domain = Domain::new(LengthUnit::Pixel);
        other_domain
            .add_circle_by_parameters([30.0, 0.0], 5.0, 0.0, 2.0, true, true)
            .unwrap();
        let other = gen.generate(&other_domain, 1.0).unwrap();
        let merged = exp.merge_mesh(&other, false).unwrap();
        assert_eq!(merged.num_cells(), a + other.num_cells());
    }

    #[test]
    fn snapshot_round_trip() {
        let mut exp = disk_experiment();
        exp.gen_mesh(&DelaunayGenerator::default()).unwrap();
        exp.add_fit(Fit::new("fit"));
        let json = serde_json::to_string(&exp).unwrap();
        let back: Experiment = serde_json::from_str(&json).unwrap();
        assert_eq!(back.mesh().unwrap().id, exp.mesh().unwrap().id);
        assert_eq!(back.rois, exp.rois);
        assert_eq!(back.fits, exp.fits);
        assert_eq!(back.domain(), exp.domain());
    }
}
