//! Mesh-size fields, modelled after the gmsh field types they serialize to.
//!
//! Only the domain's background field influences the mesh; at most one is active.

use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{dist, id_after, Domain};
use crate::error::GeometryError;

/// Recursion guard for composite fields.
const MAX_FIELD_DEPTH: usize = 16;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Field {
    /// Distance to the nearest of a set of vertices.
    Attractor { nodes: Vec<u32> },
    /// Size interpolated linearly between `lc_min` (at `dist_min`) and `lc_max`
    /// (at `dist_max`) of the distance reported by field `ifield`.
    Threshold {
        ifield: u32,
        lc_min: f64,
        lc_max: f64,
        dist_min: f64,
        dist_max: f64,
    },
    /// Anisotropic refinement near the listed boundary edges/faces.
    BoundaryLayer {
        hfar: f64,
        hwall_n: f64,
        hwall_t: f64,
        thickness: f64,
        quads: bool,
        edges: Vec<u32>,
        faces: Vec<u32>,
    },
    /// `v_in` inside the axis-aligned box, `v_out` outside.
    Box {
        v_in: f64,
        v_out: f64,
        min: [f64; 3],
        max: [f64; 3],
    },
    /// Pointwise minimum of other fields.
    Min { fields: Vec<u32> },
}

impl Field {
    /// gmsh type name.
    pub fn type_name(&self) -> &'static str {
        match self {
            Field::Attractor { .. } => "Attractor",
            Field::Threshold { .. } => "Threshold",
            Field::BoundaryLayer { .. } => "BoundaryLayer",
            Field::Box { .. } => "Box",
            Field::Min { .. } => "Min",
        }
    }

    pub(crate) fn replace_surface(&mut self, old: u32, new: u32) {
        if let Field::BoundaryLayer { faces, .. } = self {
            for f in faces.iter_mut() {
                if *f == old {
                    *f = new;
                }
            }
            faces.sort_unstable();
            faces.dedup();
        }
    }
}

impl Domain {
    fn insert_field(&mut self, field: Field) -> u32 {
        let id = self.next.field;
        self.fields.insert(id, field);
        self.next.field += 1;
        id
    }

    pub(crate) fn insert_field_with_id(&mut self, id: u32, field: Field) -> Result<u32, GeometryError> {
        if self.fields.contains_key(&id) {
            return Err(GeometryError::DuplicateId { kind: "field", id });
        }
        let next = id_after("field", id)?;
        self.fields.insert(id, field);
        self.next.field = self.next.field.max(next);
        Ok(id)
    }

    pub(crate) fn field_mut(&mut self, id: u32) -> Result<&mut Field, GeometryError> {
        self.fields
            .get_mut(&id)
            .ok_or_else(|| super::unknown("field", id))
    }

    pub fn add_boundary_layer_field(
        &mut self,
        hfar: f64,
        hwall_n: f64,
        hwall_t: f64,
        thickness: f64,
        quads: bool,
    ) -> Result<u32, GeometryError> {
        if !(hfar > 0.0 && hwall_n > 0.0 && hwall_t > 0.0 && thickness > 0.0) {
            return Err(GeometryError::InvalidParameter(format!(
                "boundary layer sizes must be positive (hfar={hfar}, hwall_n={hwall_n}, hwall_t={hwall_t}, thickness={thickness})"
            )));
        }
        Ok(self.insert_field(Field::BoundaryLayer {
            hfar,
            hwall_n,
            hwall_t,
            thickness,
            quads,
            edges: Vec::new(),
            faces: Vec::new(),
        }))
    }

    /// Attach a boundary-layer field to surfaces; their boundary edges are
    /// registered too so that 2D meshers see the layer.
    pub fn attach_field_to_surfaces(
        &mut self,
        field: u32,
        surfaces: &[u32],
    ) -> Result<(), GeometryError> {
        let mut new_edges = Vec::new();
        for &s in surfaces {
            new_edges.extend(self.surface_edges(s)?);
        }
        match self.field_mut(field)? {
            Field::BoundaryLayer { edges, faces, .. } => {
                faces.extend_from_slice(surfaces);
                faces.sort_unstable();
                faces.dedup();
                edges.extend(new_edges);
                edges.sort_unstable();
                edges.dedup();
                Ok(())
            }
            other => Err(GeometryError::InvalidParameter(format!(
                "field {field} is a {} field, surfaces attach to boundary layers only",
                other.type_name()
            ))),
        }
    }

    /// Make `field` the domain-wide background size field, superseding any previous one.
    pub fn set_as_bkgd_field(&mut self, field: u32) -> Result<(), GeometryError> {
        self.field(field)?;
        if let Some(prev) = self.bkgd_field.replace(field) {
            debug!(previous = prev, field, "background field superseded");
        }
        Ok(())
    }

    pub fn clear_bkgd_field(&mut self) {
        self.bkgd_field = None;
    }

    /// Attach a distance-based size attractor to a vertex. A threshold field with
    /// identical parameters is reused, otherwise a new attractor/threshold pair is
    /// created. Returns the threshold field ID.
    pub fn add_to_attractor(
        &mut self,
        vertex: u32,
        lc_min: f64,
        lc_max: f64,
        dist_min: f64,
        dist_max: f64,
    ) -> Result<u32, GeometryError> {
        self.vertex(vertex)?;
        if !(lc_min > 0.0 && lc_max >= lc_min && dist_max > dist_min && dist_min >= 0.0) {
            return Err(GeometryError::InvalidParameter(format!(
                "attractor needs 0 < LcMin <= LcMax and 0 <= DistMin < DistMax, got ({lc_min}, {lc_max}, {dist_min}, {dist_max})"
            )));
        }

        let existing = self.fields.iter().find_map(|(&id, f)| match f {
            Field::Threshold {
                ifield,
                lc_min: a,
                lc_max: b,
                dist_min: c,
                dist_max: d,
            } if (*a, *b, *c, *d) == (lc_min, lc_max, dist_min, dist_max)
                && matches!(self.fields.get(ifield), Some(Field::Attractor { .. })) =>
            {
                Some((id, *ifield))
            }
            _ => None,
        });

        if let Some((threshold, attractor)) = existing {
            if let Field::Attractor { nodes } = self.field_mut(attractor)? {
                if !nodes.contains(&vertex) {
                    nodes.push(vertex);
                }
            }
            return Ok(threshold);
        }

        let attractor = self.insert_field(Field::Attractor {
            nodes: vec![vertex],
        });
        Ok(self.insert_field(Field::Threshold {
            ifield: attractor,
            lc_min,
            lc_max,
            dist_min,
            dist_max,
        }))
    }

    pub fn add_box_field(&mut self, v_in: f64, v_out: f64, min: [f64; 3], max: [f64; 3]) -> u32 {
        self.insert_field(Field::Box {
            v_in,
            v_out,
            min,
            max,
        })
    }

    pub fn add_min_field(&mut self, fields: &[u32]) -> Result<u32, GeometryError> {
        for &f in fields {
            self.field(f)?;
        }
        Ok(self.insert_field(Field::Min {
            fields: fields.to_vec(),
        }))
    }

    /// Value of field `id` at `p`: a distance for attractors, a size otherwise.
    pub fn eval_field(&self, id: u32, p: [f64; 3]) -> f64 {
        self.eval_field_depth(id, p, 0)
    }

    fn eval_field_depth(&self, id: u32, p: [f64; 3], depth: usize) -> f64 {
        if depth > MAX_FIELD_DEPTH {
            return f64::INFINITY;
        }
        let Some(field) = self.fields.get(&id) else {
            return f64::INFINITY;
        };
        match field {
            Field::Attractor { nodes } => nodes
                .iter()
                .filter_map(|n| self.vertices.get(n))
                .map(|v| dist(v.x, p))
                .fold(f64::INFINITY, f64::min),
            Field::Threshold {
                ifield,
                lc_min,
                lc_max,
                dist_min,
                dist_max,
            } => {
                let d = self.eval_field_depth(*ifield, p, depth + 1);
                if d <= *dist_min {
                    *lc_min
                } else if d >= *dist_max {
                    *lc_max
                } else {
                    lc_min + (lc_max - lc_min) * (d - dist_min) / (dist_max - dist_min)
                }
            }
            Field::BoundaryLayer {
                hfar,
                hwall_n,
                thickness,
                edges,
                ..
            } => {
                let d = edges
                    .iter()
                    .filter_map(|e| self.sample_edge(*e, 16).ok())
                    .flat_map(|pts| pts.into_iter())
                    .map(|q| dist(q, p))
                    .fold(f64::INFINITY, f64::min);
                let s = (d / thickness).clamp(0.0, 1.0);
                hwall_n + (hfar - hwall_n) * s
            }
            Field::Box {
                v_in,
                v_out,
                min,
                max,
            } => {
                let inside = (0..3).all(|i| p[i] >= min[i] && p[i] <= max[i]);
                if inside {
                    *v_in
                } else {
                    *v_out
                }
            }
            Field::Min { fields } => fields
                .iter()
                .map(|f| self.eval_field_depth(*f, p, depth + 1))
                .fold(f64::INFINITY, f64::min),
        }
    }

    /// Smallest size a field can prescribe anywhere.
    pub fn field_min_size(&self, id: u32) -> f64 {
        self.field_min_size_depth(id, 0)
    }

    fn field_min_size_depth(&self, id: u32, depth: usize) -> f64 {
        if depth > MAX_FIELD_DEPTH {
            return f64::INFINITY;
        }
        match self.fields.get(&id) {
            Some(Field::Threshold { lc_min, .. }) => *lc_min,
            Some(Field::BoundaryLayer { hwall_n, hfar, .. }) => hwall_n.min(*hfar),
            Some(Field::Box { v_in, v_out, .. }) => v_in.min(*v_out),
            Some(Field::Min { fields }) => fields
                .iter()
                .map(|f| self.field_min_size_depth(*f, depth + 1))
                .fold(f64::INFINITY, f64::min),
            Some(Field::Attractor { .. }) | None => f64::INFINITY,
        }
    }

    /// Target cell size at `p` prescribed by the background field, or infinity
    /// when none is set.
    pub fn target_size_at(&self, p: [f64; 3]) -> f64 {
        match self.bkgd_field {
            Some(id) => match self.fields.get(&id) {
                Some(Field::Attractor { .. }) | None => f64::INFINITY,
                Some(_) => self.eval_field(id, p),
            },
            None => f64::INFINITY,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::LengthUnit;
    use approx::assert_relative_eq;

    #[test]
    fn threshold_interpolates_between_distances() {
        let mut d = Domain::new(LengthUnit::Pixel);
        let v = d.add_vertex([0.0, 0.0, 0.0], 10.0);
        let t = d.add_to_attractor(v, 1.0, 5.0, 2.0, 6.0).unwrap();
        d.set_as_bkgd_field(t).unwrap();
        assert_relative_eq!(d.target_size_at([1.0, 0.0, 0.0]), 1.0);
        assert_relative_eq!(d.target_size_at([4.0, 0.0, 0.0]), 3.0);
        assert_relative_eq!(d.target_size_at([10.0, 0.0, 0.0]), 5.0);
    }

    #[test]
    fn attractor_reuses_matching_threshold() {
        let mut d = Domain::default();
        let a = d.add_vertex([0.0, 0.0, 0.0], 1.0);
        let b = d.add_vertex([5.0, 0.0, 0.0], 1.0);
        let t1 = d.add_to_attractor(a, 1.0, 2.0, 0.5, 3.0).unwrap();
        let t2 = d.add_to_attractor(b, 1.0, 2.0, 0.5, 3.0).unwrap();
        assert_eq!(t1, t2);
        assert_eq!(d.fields().count(), 2);
    }

    #[test]
    fn background_field_is_superseded() {
        let mut d = Domain::default();
        let b1 = d.add_box_field(1.0, 10.0, [0.0; 3], [1.0; 3]);
        let b2 = d.add_box_field(2.0, 20.0, [0.0; 3], [1.0; 3]);
        d.set_as_bkgd_field(b1).unwrap();
        d.set_as_bkgd_field(b2).unwrap();
        assert_eq!(d.bkgd_field(), Some(b2));
        assert_relative_eq!(d.target_size_at([0.5; 3]), 2.0);
        let m = d.add_min_field(&[b1, b2]).unwrap();
        assert_relative_eq!(d.eval_field(m, [5.0; 3]), 10.0);
        assert_relative_eq!(d.field_min_size(m), 1.0);
        d.clear_bkgd_field();
        assert_eq!(d.bkgd_field(), None);
    }
}
