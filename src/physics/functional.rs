use crate::discretization::mesh::{Cell, Face, Mesh};
use nalgebra::DVector;
use tracing::{debug, warn};

// Flux function: f(flux_vector, u_left, u_right, face_geometry, user_data)
pub type FluxFn<D> = Box<dyn Fn(&mut [f64], &[f64], &[f64], &Face, &D)>;

// Reaction/Source function: f(source_vector, u, cell_geometry, user_data)
pub type ReactionFn<D> = Box<dyn Fn(&mut [f64], &[f64], &Cell, &D)>;

// Storage function (for time-dependent term): f(storage_vector, u, cell_geometry, user_data)
pub type StorageFn<D> = Box<dyn Fn(&mut [f64], &[f64], &Cell, &D)>;

#[derive(Clone, Copy, Debug)]
pub struct NumericalTolerances {
    pub min_distance: f64,
    pub min_face_area: f64,
    /// Relative step used for the finite-difference local Jacobians.
    pub fd_step: f64,
}

impl Default for NumericalTolerances {
    fn default() -> Self {
        Self {
            min_distance: 1e-14,
            min_face_area: 1e-20,
            fd_step: 1e-6,
        }
    }
}

/// A finite-volume model configured by user-defined functions (closures).
/// `D` is any user-defined data/parameters struct handed to every closure.
///
/// The residual of cell `k` and variable `i` is
///
/// ```text
/// R = θ·S(u) + (1-θ)·S(u_old) + (storage(u)·V - storage(u_old)·V) / dt
/// S(u) = Σ_faces flux·|σ|/d + reaction(u)·V
/// ```
///
/// Boundary faces carry no flux, which makes the domain closed.
pub struct FunctionalPhysics<D> {
    pub num_vars_per_cell: usize,
    pub data: D,
    pub(crate) flux: FluxFn<D>,
    pub(crate) reaction: ReactionFn<D>,
    pub(crate) storage: StorageFn<D>,
    pub field_names: Vec<String>,
    pub current_time: Option<f64>,
    pub tolerances: NumericalTolerances,

    pub dt: Option<f64>,
    /// 1.0 = backward Euler, 0.5 = Crank-Nicolson.
    pub theta: f64,
    pub s_old_cache: Option<DVector<f64>>,
    pub spatial_old_cache: Option<DVector<f64>>,
}

impl<D> FunctionalPhysics<D> {
    pub fn new(
        field_names: Vec<String>,
        data: D,
        flux: FluxFn<D>,
        reaction: ReactionFn<D>,
        storage: StorageFn<D>,
    ) -> Self {
        let num_vars = field_names.len();
        Self {
            num_vars_per_cell: num_vars,
            data,
            flux,
            reaction,
            storage,
            field_names,
            current_time: None,
            tolerances: NumericalTolerances::default(),
            dt: None,
            theta: 1.0,
            s_old_cache: None,
            spatial_old_cache: None,
        }
    }

    /// Calibrate tolerances based on mesh characteristics.
    /// Should be called after mesh generation and before solving.
    pub fn calibrate_tolerances(&mut self, mesh: &Mesh) {
        let mut min_spacing: f64 = f64::INFINITY;
        let mut max_spacing: f64 = 0.0;
        let mut count = 0;

        for face in &mesh.faces {
            if let (k, Some(l)) = face.neighbor_cell_ids {
                let d = Self::raw_distance(mesh.cells[k].centroid, mesh.cells[l].centroid);
                min_spacing = min_spacing.min(d);
                max_spacing = max_spacing.max(d);
                count += 1;
            }
        }

        if count == 0 {
            warn!("no interior faces found for tolerance calibration");
            return;
        }

        let old_tol = self.tolerances.min_distance;
        self.tolerances.min_distance = min_spacing * 1e-8;

        debug!(
            min_spacing,
            max_spacing,
            old_min_distance = old_tol,
            new_min_distance = self.tolerances.min_distance,
            "tolerance calibration"
        );
    }

    #[inline]
    pub(crate) fn raw_distance(p1: [f64; 3], p2: [f64; 3]) -> f64 {
        (0..=2).map(|i| (p2[i] - p1[i]).powi(2)).sum::<f64>().sqrt()
    }

    /// Distance between two points, clamped from below by `min_distance`.
    #[inline]
    pub fn safe_distance(&self, p1: [f64; 3], p2: [f64; 3]) -> f64 {
        let d = Self::raw_distance(p1, p2);
        let safe_d = d.max(self.tolerances.min_distance);

        #[cfg(debug_assertions)]
        if d < self.tolerances.min_distance {
            warn!(
                "clamped distance {:.3e} -> {:.3e} between {:?} and {:?}",
                d, safe_d, p1, p2
            );
        }

        safe_d
    }

    /// Geometric transmissibility of a face (area/distance).
    #[inline]
    pub fn face_scale(&self, face: &Face, d: f64) -> f64 {
        if face.area < self.tolerances.min_face_area {
            0.0
        } else {
            face.area / d
        }
    }

    #[inline]
    pub(crate) fn cell_slice<'a>(&self, u: &'a [f64], cell: usize) -> &'a [f64] {
        let m = self.num_vars_per_cell;
        &u[cell * m..cell * m + m]
    }

    /// Residual contribution from all fluxes across interior faces.
    fn flux_contribution(&self, mesh: &Mesh, u: &DVector<f64>) -> DVector<f64> {
        let m = self.num_vars_per_cell;
        let mut residual = DVector::zeros(mesh.cells.len() * m);
        let mut f_flux = vec![0.0; m];

        for face in &mesh.faces {
            let (k, Some(l)) = face.neighbor_cell_ids else {
                continue;
            };
            let u_k = self.cell_slice(u.as_slice(), k);
            let u_l = self.cell_slice(u.as_slice(), l);

            f_flux.fill(0.0);
            (self.flux)(&mut f_flux, u_k, u_l, face, &self.data);

            let d = self.safe_distance(mesh.cells[k].centroid, mesh.cells[l].centroid);
            let scale = self.face_scale(face, d);

            for i in 0..m {
                let flux_val = f_flux[i] * scale;
                residual[k * m + i] += flux_val;
                residual[l * m + i] -= flux_val;
            }
        }

        residual
    }

    /// Residual contribution from reactions/sources within each cell.
    fn reaction_contribution(&self, mesh: &Mesh, u: &DVector<f64>) -> DVector<f64> {
        let m = self.num_vars_per_cell;
        let mut residual = DVector::zeros(mesh.cells.len() * m);
        let mut f_reaction = vec![0.0; m];

        for cell in &mesh.cells {
            f_reaction.fill(0.0);
            (self.reaction)(
                &mut f_reaction,
                self.cell_slice(u.as_slice(), cell.id),
                cell,
                &self.data,
            );
            for i in 0..m {
                residual[cell.id * m + i] += f_reaction[i] * cell.volume;
            }
        }

        residual
    }

    pub fn storage_contribution(&self, mesh: &Mesh, u: &DVector<f64>) -> DVector<f64> {
        let m = self.num_vars_per_cell;
        let mut s_vec = DVector::zeros(mesh.cells.len() * m);
        let mut f_storage = vec![0.0; m];

        for cell in &mesh.cells {
            f_storage.fill(0.0);
            (self.storage)(
                &mut f_storage,
                self.cell_slice(u.as_slice(), cell.id),
                cell,
                &self.data,
            );
            for i in 0..m {
                s_vec[cell.id * m + i] += f_storage[i] * cell.volume;
            }
        }
        s_vec
    }

    /// Prepare for a transient step by caching S(u_old) and, for θ < 1, the old spatial terms.
    pub fn prepare_time_step(&mut self, mesh: &Mesh, u_old: &DVector<f64>, dt: f64) {
        self.dt = Some(dt);
        self.s_old_cache = Some(self.storage_contribution(mesh, u_old));

        if self.theta < 1.0 {
            let spatial_old =
                self.flux_contribution(mesh, u_old) + self.reaction_contribution(mesh, u_old);
            self.spatial_old_cache = Some(spatial_old);
        } else {
            self.spatial_old_cache = None;
        }
    }

    /// Drop the transient caches, turning the residual back into the steady-state one.
    pub fn clear_time_step(&mut self) {
        self.dt = None;
        self.s_old_cache = None;
        self.spatial_old_cache = None;
    }

    /// Calculate the full residual vector.
    pub fn calculate_residual(&self, mesh: &Mesh, u: &DVector<f64>) -> DVector<f64> {
        let spatial_current = self.flux_contribution(mesh, u) + self.reaction_contribution(mesh, u);
        let mut residual = spatial_current * self.theta;

        if let Some(spatial_old) = &self.spatial_old_cache {
            residual += spatial_old * (1.0 - self.theta);
        }

        if let (Some(dt), Some(s_old)) = (self.dt, &self.s_old_cache) {
            residual += (self.storage_contribution(mesh, u) - s_old) / dt;
        }
        residual
    }
}
