//! Parametric boundary representation of a sample.
//!
//! A [`Domain`] is an arena: every entity lives in an ID-keyed map and refers to
//! other entities only by ID. IDs are assigned from per-kind monotonic counters and
//! are never reused, even after an entity is removed by [`Domain::fuse`].

pub mod fields;
pub mod geo_io;
pub mod shapes;
pub mod surfaces;

use std::collections::BTreeMap;

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::GeometryError;
pub use fields::Field;
pub use shapes::{CircleIds, CylinderIds};

/// Relative tolerance for the arc radius check.
pub const ARC_RADIUS_RTOL: f64 = 1e-6;

/// Length unit of a coordinate system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum LengthUnit {
    #[default]
    Pixel,
    Micron,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vertex {
    pub id: u32,
    pub x: [f64; 3],
    /// Target local mesh size at this vertex.
    pub vol_size: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum EdgeKind {
    Line { start: u32, end: u32 },
    Arc { start: u32, center: u32, end: u32 },
    /// Passes through every control point in order.
    Spline { points: Vec<u32> },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: u32,
    pub kind: EdgeKind,
}

impl Edge {
    pub fn start(&self) -> u32 {
        match &self.kind {
            EdgeKind::Line { start, .. } | EdgeKind::Arc { start, .. } => *start,
            EdgeKind::Spline { points } => points[0],
        }
    }

    pub fn end(&self) -> u32 {
        match &self.kind {
            EdgeKind::Line { end, .. } | EdgeKind::Arc { end, .. } => *end,
            EdgeKind::Spline { points } => points[points.len() - 1],
        }
    }

    /// Every vertex this edge references, including an arc's center.
    pub fn vertex_ids(&self) -> Vec<u32> {
        match &self.kind {
            EdgeKind::Line { start, end } => vec![*start, *end],
            EdgeKind::Arc { start, center, end } => vec![*start, *center, *end],
            EdgeKind::Spline { points } => points.clone(),
        }
    }
}

/// Closed, cyclic sequence of signed edge references. A negative entry traverses
/// the edge from its end to its start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LineLoop {
    pub id: u32,
    pub edges: Vec<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuledSurface {
    pub id: u32,
    pub line_loop: u32,
    /// Unit normal following the loop orientation (right-hand rule).
    pub normal: [f64; 3],
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SurfaceLoop {
    pub id: u32,
    pub surfaces: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Volume {
    pub id: u32,
    pub surface_loop: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct NextIds {
    vertex: u32,
    edge: u32,
    line_loop: u32,
    surface: u32,
    surface_loop: u32,
    volume: u32,
    field: u32,
}

impl Default for NextIds {
    fn default() -> Self {
        Self {
            vertex: 1,
            edge: 1,
            line_loop: 1,
            surface: 1,
            surface_loop: 1,
            volume: 1,
            field: 1,
        }
    }
}

/// Owner of all geometric entities and the single source of truth for their IDs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Domain {
    pub unit: LengthUnit,
    pub(crate) vertices: BTreeMap<u32, Vertex>,
    pub(crate) edges: BTreeMap<u32, Edge>,
    pub(crate) line_loops: BTreeMap<u32, LineLoop>,
    pub(crate) surfaces: BTreeMap<u32, RuledSurface>,
    pub(crate) surface_loops: BTreeMap<u32, SurfaceLoop>,
    pub(crate) volumes: BTreeMap<u32, Volume>,
    pub(crate) fields: BTreeMap<u32, Field>,
    pub(crate) bkgd_field: Option<u32>,
    pub(crate) next: NextIds,
}

pub(crate) fn unknown(kind: &'static str, id: u32) -> GeometryError {
    GeometryError::UnknownEntity { kind, id }
}

/// Counter value following an explicitly chosen `id`.
pub(crate) fn id_after(kind: &'static str, id: u32) -> Result<u32, GeometryError> {
    id.checked_add(1).ok_or(GeometryError::IdOverflow { kind, id })
}

pub(crate) fn dist(a: [f64; 3], b: [f64; 3]) -> f64 {
    (Vector3::from(a) - Vector3::from(b)).norm()
}

impl Domain {
    pub fn new(unit: LengthUnit) -> Self {
        Self {
            unit,
            ..Self::default()
        }
    }

    // ---- accessors ----

    pub fn vertex(&self, id: u32) -> Result<&Vertex, GeometryError> {
        self.vertices.get(&id).ok_or_else(|| unknown("vertex", id))
    }

    pub fn edge(&self, id: u32) -> Result<&Edge, GeometryError> {
        self.edges.get(&id).ok_or_else(|| unknown("edge", id))
    }

    pub fn line_loop(&self, id: u32) -> Result<&LineLoop, GeometryError> {
        self.line_loops.get(&id).ok_or_else(|| unknown("line loop", id))
    }

    pub fn surface(&self, id: u32) -> Result<&RuledSurface, GeometryError> {
        self.surfaces.get(&id).ok_or_else(|| unknown("surface", id))
    }

    pub fn surface_loop(&self, id: u32) -> Result<&SurfaceLoop, GeometryError> {
        self.surface_loops
            .get(&id)
            .ok_or_else(|| unknown("surface loop", id))
    }

    pub fn field(&self, id: u32) -> Result<&Field, GeometryError> {
        self.fields.get(&id).ok_or_else(|| unknown("field", id))
    }

    pub fn vertices(&self) -> impl Iterator<Item = &Vertex> {
        self.vertices.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn line_loops(&self) -> impl Iterator<Item = &LineLoop> {
        self.line_loops.values()
    }

    pub fn surfaces(&self) -> impl Iterator<Item = &RuledSurface> {
        self.surfaces.values()
    }

    pub fn surface_loops(&self) -> impl Iterator<Item = &SurfaceLoop> {
        self.surface_loops.values()
    }

    pub fn volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.values()
    }

    pub fn fields(&self) -> impl Iterator<Item = (u32, &Field)> {
        self.fields.iter().map(|(id, f)| (*id, f))
    }

    pub fn bkgd_field(&self) -> Option<u32> {
        self.bkgd_field
    }

    /// 3 when the domain encloses a volume, 2 otherwise.
    pub fn dimension(&self) -> usize {
        if self.volumes.is_empty() {
            2
        } else {
            3
        }
    }

    /// Axis-aligned bounding box `(min, max)` of all vertices.
    pub fn bounding_box(&self) -> Option<([f64; 3], [f64; 3])> {
        let mut it = self.vertices.values();
        let first = it.next()?.x;
        Some(it.fold((first, first), |(mut lo, mut hi), v| {
            for i in 0..3 {
                lo[i] = lo[i].min(v.x[i]);
                hi[i] = hi[i].max(v.x[i]);
            }
            (lo, hi)
        }))
    }

    // ---- vertices and edges ----

    pub fn add_vertex(&mut self, x: [f64; 3], vol_size: f64) -> u32 {
        let id = self.next.vertex;
        self.vertices.insert(id, Vertex { id, x, vol_size });
        self.next.vertex += 1;
        id
    }

    /// Insert a vertex under a caller-chosen ID.
    pub fn add_vertex_with_id(
        &mut self,
        id: u32,
        x: [f64; 3],
        vol_size: f64,
    ) -> Result<u32, GeometryError> {
        if self.vertices.contains_key(&id) {
            return Err(GeometryError::DuplicateId { kind: "vertex", id });
        }
        let next = id_after("vertex", id)?;
        self.vertices.insert(id, Vertex { id, x, vol_size });
        self.next.vertex = self.next.vertex.max(next);
        Ok(id)
    }

    /// Set the target mesh size of every vertex.
    pub fn set_global_vol_size(&mut self, vol_size: f64) {
        for v in self.vertices.values_mut() {
            v.vol_size = vol_size;
        }
    }

    fn check_edge_id(&self, id: Option<u32>) -> Result<u32, GeometryError> {
        match id {
            Some(id) if self.edges.contains_key(&id) => {
                Err(GeometryError::DuplicateId { kind: "edge", id })
            }
            Some(id) => Ok(id),
            None => Ok(self.next.edge),
        }
    }

    fn insert_edge(&mut self, id: u32, kind: EdgeKind) -> Result<u32, GeometryError> {
        let next = id_after("edge", id)?;
        self.edges.insert(id, Edge { id, kind });
        self.next.edge = self.next.edge.max(next);
        Ok(id)
    }

    pub fn add_line(&mut self, start: u32, end: u32) -> Result<u32, GeometryError> {
        self.add_line_with_id(None, start, end)
    }

    pub fn add_line_with_id(
        &mut self,
        id: Option<u32>,
        start: u32,
        end: u32,
    ) -> Result<u32, GeometryError> {
        let id = self.check_edge_id(id)?;
        let (a, b) = (self.vertex(start)?.x, self.vertex(end)?.x);
        if start == end || dist(a, b) == 0.0 {
            return Err(GeometryError::CoincidentPoints { a: start, b: end });
        }
        self.insert_edge(id, EdgeKind::Line { start, end })
    }

    /// Circular arc from `start` to `end` around `center`. The center must be
    /// equidistant from both endpoints within [`ARC_RADIUS_RTOL`].
    pub fn add_arc(&mut self, start: u32, center: u32, end: u32) -> Result<u32, GeometryError> {
        self.add_arc_with_id(None, start, center, end)
    }

    pub fn add_arc_with_id(
        &mut self,
        id: Option<u32>,
        start: u32,
        center: u32,
        end: u32,
    ) -> Result<u32, GeometryError> {
        let id = self.check_edge_id(id)?;
        let (s, c, e) = (
            self.vertex(start)?.x,
            self.vertex(center)?.x,
            self.vertex(end)?.x,
        );
        if dist(s, e) == 0.0 {
            return Err(GeometryError::CoincidentPoints { a: start, b: end });
        }
        let (r_start, r_end) = (dist(c, s), dist(c, e));
        if r_start == 0.0 {
            return Err(GeometryError::CoincidentPoints {
                a: start,
                b: center,
            });
        }
        if (r_start - r_end).abs() > ARC_RADIUS_RTOL * r_start.max(r_end) {
            return Err(GeometryError::ArcRadiusMismatch {
                start,
                center,
                end,
                r_start,
                r_end,
            });
        }
        self.insert_edge(id, EdgeKind::Arc { start, center, end })
    }

    pub fn add_spline(&mut self, points: &[u32]) -> Result<u32, GeometryError> {
        self.add_spline_with_id(None, points)
    }

    pub fn add_spline_with_id(
        &mut self,
        id: Option<u32>,
        points: &[u32],
    ) -> Result<u32, GeometryError> {
        let id = self.check_edge_id(id)?;
        if points.len() < 2 {
            return Err(GeometryError::InvalidParameter(format!(
                "spline needs at least 2 points, got {}",
                points.len()
            )));
        }
        for w in points.windows(2) {
            let (a, b) = (self.vertex(w[0])?.x, self.vertex(w[1])?.x);
            if dist(a, b) == 0.0 {
                return Err(GeometryError::CoincidentPoints { a: w[0], b: w[1] });
            }
        }
        self.insert_edge(
            id,
            EdgeKind::Spline {
                points: points.to_vec(),
            },
        )
    }

    /// Endpoints of a signed edge reference, in traversal order.
    pub fn oriented_endpoints(&self, signed: i64) -> Result<(u32, u32), GeometryError> {
        let edge = self.edge(signed.unsigned_abs() as u32)?;
        Ok(if signed >= 0 {
            (edge.start(), edge.end())
        } else {
            (edge.end(), edge.start())
        })
    }

    /// Sample points of an edge in its own direction, `n_segments + 1` points for
    /// lines and arcs. Splines are sampled piecewise linearly between control points.
    pub fn sample_edge(&self, id: u32, n_segments: usize) -> Result<Vec<[f64; 3]>, GeometryError> {
        let n = n_segments.max(1);
        let edge = self.edge(id)?;
        match &edge.kind {
            EdgeKind::Line { start, end } => {
                let (a, b) = (Vector3::from(self.vertex(*start)?.x), Vector3::from(self.vertex(*end)?.x));
                Ok((0..=n)
                    .map(|i| (a + (b - a) * (i as f64 / n as f64)).into())
                    .collect())
            }
            EdgeKind::Arc { start, center, end } => {
                let c = Vector3::from(self.vertex(*center)?.x);
                let vs = Vector3::from(self.vertex(*start)?.x) - c;
                let ve = Vector3::from(self.vertex(*end)?.x) - c;
                let (rs, re) = (vs.norm(), ve.norm());
                let u = vs / rs;
                let e_hat = ve / re;
                let perp = e_hat - u * e_hat.dot(&u);
                let theta = e_hat.dot(&u).clamp(-1.0, 1.0).acos();
                let w = if perp.norm() > 1e-12 {
                    perp.normalize()
                } else {
                    // Half circle: no unique plane, fall back to the xy plane.
                    Vector3::new(-u.y, u.x, 0.0)
                };
                Ok((0..=n)
                    .map(|i| {
                        let t = i as f64 / n as f64;
                        let r = rs + (re - rs) * t;
                        let phi = theta * t;
                        (c + (u * phi.cos() + w * phi.sin()) * r).into()
                    })
                    .collect())
            }
            EdgeKind::Spline { points } => {
                let per = n.div_ceil(points.len() - 1).max(1);
                let mut out = Vec::new();
                for (k, pair) in points.windows(2).enumerate() {
                    let a = Vector3::from(self.vertex(pair[0])?.x);
                    let b = Vector3::from(self.vertex(pair[1])?.x);
                    let first = if k == 0 { 0 } else { 1 };
                    for i in first..=per {
                        out.push((a + (b - a) * (i as f64 / per as f64)).into());
                    }
                }
                Ok(out)
            }
        }
    }

    /// Approximate arc length of an edge.
    pub fn edge_length(&self, id: u32) -> Result<f64, GeometryError> {
        let pts = self.sample_edge(id, 32)?;
        Ok(pts.windows(2).map(|w| dist(w[0], w[1])).sum())
    }
}
