use crate::discretization::mesh::Mesh;
use crate::physics::functional::FunctionalPhysics;

/// Central-difference gradient of a scalar function of a small local vector.
#[inline]
fn local_gradient(x: &[f64], rel_step: f64, f: impl Fn(&[f64]) -> f64) -> Vec<f64> {
    let mut work = x.to_vec();
    (0..x.len())
        .map(|j| {
            let h = rel_step * (1.0 + x[j].abs());
            work[j] = x[j] + h;
            let f_plus = f(&work);
            work[j] = x[j] - h;
            let f_minus = f(&work);
            work[j] = x[j];
            (f_plus - f_minus) / (2.0 * h)
        })
        .collect()
}

impl<D> FunctionalPhysics<D> {
    /// Compute only the r-th residual component (row kernel).
    /// r corresponds to (cell_id, var) with var in [0..num_vars).
    pub fn residual_component_row(&self, mesh: &Mesh, u: &[f64], r: usize) -> f64 {
        let m = self.num_vars_per_cell;
        let cell_id = r / m;
        let var = r % m;
        let cell = &mesh.cells[cell_id];

        let mut acc_spatial = 0.0;

        // (A) reaction/source for this cell only
        {
            let mut f_reaction = vec![0.0; m];
            (self.reaction)(&mut f_reaction, self.cell_slice(u, cell_id), cell, &self.data);
            acc_spatial += f_reaction[var] * cell.volume;
        }

        // (B) flux terms on interior faces touching this cell
        let mut f_flux = vec![0.0; m];
        for face_idx in &cell.face_ids {
            let face = &mesh.faces[*face_idx];
            let (k, Some(l)) = face.neighbor_cell_ids else {
                continue;
            };
            f_flux.fill(0.0);
            (self.flux)(
                &mut f_flux,
                self.cell_slice(u, k),
                self.cell_slice(u, l),
                face,
                &self.data,
            );
            let d = self.safe_distance(mesh.cells[k].centroid, mesh.cells[l].centroid);
            let scale = self.face_scale(face, d);
            if cell_id == k {
                acc_spatial += f_flux[var] * scale; // leaving k, positive
            } else if cell_id == l {
                acc_spatial -= f_flux[var] * scale; // entering l, negative
            }
        }

        let mut total_residual = acc_spatial * self.theta;

        if let Some(spatial_old) = &self.spatial_old_cache {
            total_residual += spatial_old[r] * (1.0 - self.theta);
        }

        if let (Some(dt), Some(s_old)) = (self.dt, &self.s_old_cache) {
            let mut f_storage = vec![0.0; m];
            (self.storage)(&mut f_storage, self.cell_slice(u, cell_id), cell, &self.data);
            let s_new = f_storage[var] * cell.volume;
            total_residual += (s_new - s_old[r]) / dt;
        }

        total_residual
    }

    /// Combine duplicate column indices by summing their values.
    #[inline]
    fn combine_duplicates(cols: &mut Vec<usize>, vals: &mut Vec<f64>) {
        if cols.len() <= 1 {
            return;
        }

        let mut p: Vec<usize> = (0..cols.len()).collect();
        p.sort_unstable_by_key(|&i| cols[i]);

        let sorted_cols: Vec<usize> = p.iter().map(|&i| cols[i]).collect();
        let sorted_vals: Vec<f64> = p.iter().map(|&i| vals[i]).collect();

        cols.clear();
        vals.clear();

        let mut curr_col = sorted_cols[0];
        let mut curr_sum = sorted_vals[0];

        for i in 1..sorted_cols.len() {
            if sorted_cols[i] == curr_col {
                curr_sum += sorted_vals[i];
            } else {
                cols.push(curr_col);
                vals.push(curr_sum);
                curr_col = sorted_cols[i];
                curr_sum = sorted_vals[i];
            }
        }
        cols.push(curr_col);
        vals.push(curr_sum);
    }

    /// Build Jacobian row r = (cell_id,var) as (cols, vals) from local
    /// finite-difference derivatives of the closures.
    pub fn jacobian_row_locals(
        &self,
        mesh: &Mesh,
        u: &[f64],
        r: usize,
        cols: &mut Vec<usize>,
        vals: &mut Vec<f64>,
        diag_accumulator: &mut Vec<f64>,
    ) {
        let m = self.num_vars_per_cell;
        let cell_id = r / m;
        let var = r % m;
        let cell = &mesh.cells[cell_id];
        let step = self.tolerances.fd_step;

        // (A) reaction/source contribution
        {
            let deriv = local_gradient(self.cell_slice(u, cell_id), step, |x| {
                let mut f = vec![0.0; m];
                (self.reaction)(&mut f, x, cell, &self.data);
                f[var] * cell.volume
            });
            for j in 0..m {
                diag_accumulator[j] += deriv[j];
            }
        }

        // (B) flux contributions on interior faces touching this cell
        for &face_idx in &cell.face_ids {
            let face = &mesh.faces[face_idx];
            let (k, Some(l)) = face.neighbor_cell_ids else {
                continue;
            };
            if k != cell_id && l != cell_id {
                continue;
            }
            let d = self.safe_distance(mesh.cells[k].centroid, mesh.cells[l].centroid);
            let scale = self.face_scale(face, d);
            let sign = if cell_id == l { -1.0 } else { 1.0 };

            let mut x = Vec::with_capacity(2 * m);
            x.extend_from_slice(self.cell_slice(u, k));
            x.extend_from_slice(self.cell_slice(u, l));
            let d_eps = local_gradient(&x, step, |x| {
                let mut f = vec![0.0; m];
                (self.flux)(&mut f, &x[..m], &x[m..], face, &self.data);
                sign * f[var] * scale
            });

            // Off-diagonals are scaled by theta before pushing.
            let (own, other, other_cell) = if cell_id == k {
                (&d_eps[..m], &d_eps[m..], l)
            } else {
                (&d_eps[m..], &d_eps[..m], k)
            };
            for j in 0..m {
                diag_accumulator[j] += own[j];
                cols.push(other_cell * m + j);
                vals.push(other[j] * self.theta);
            }
        }

        for j in 0..m {
            diag_accumulator[j] *= self.theta;
        }

        // (C) storage / time term, unscaled by theta
        if let Some(dt) = self.dt {
            let deriv = local_gradient(self.cell_slice(u, cell_id), step, |x| {
                let mut f = vec![0.0; m];
                (self.storage)(&mut f, x, cell, &self.data);
                f[var]
            });
            let factor = cell.volume / dt;
            for j in 0..m {
                diag_accumulator[j] += deriv[j] * factor;
            }
        }

        for j in 0..m {
            if diag_accumulator[j] != 0.0 {
                cols.push(cell_id * m + j);
                vals.push(diag_accumulator[j]);
            }
        }
        Self::combine_duplicates(cols, vals)
    }
}
