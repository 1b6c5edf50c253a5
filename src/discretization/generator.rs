use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::process::Command;
use std::time::Instant;

use serde::{Deserialize, Serialize};
use spade::{ConstrainedDelaunayTriangulation, InsertionError, Point2, Triangulation};
use tracing::{debug, info, warn};

use super::mesh::{CellKind, CoordinateFrame, Mesh};
use super::msh::read_msh;
use crate::error::MeshGenerationError;
use crate::geometry::{Domain, EdgeKind};

/// Anything that turns a [`Domain`] into a [`Mesh`]. `factor` scales every
/// target cell size.
pub trait MeshGenerator {
    fn generate(&self, domain: &Domain, factor: f64) -> Result<Mesh, MeshGenerationError>;
}

/// Runs the external `gmsh` tool on the domain's script and reads the MSH 2.2
/// file it produces. Both files stay in `workdir` for inspection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmshGenerator {
    pub program: PathBuf,
    pub workdir: PathBuf,
    pub basename: String,
    pub extra_args: Vec<String>,
}

impl Default for GmshGenerator {
    fn default() -> Self {
        Self {
            program: PathBuf::from("gmsh"),
            workdir: std::env::temp_dir().join("frap_rs"),
            basename: "domain".into(),
            extra_args: Vec::new(),
        }
    }
}

impl GmshGenerator {
    pub fn new(program: impl Into<PathBuf>, workdir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            workdir: workdir.into(),
            ..Self::default()
        }
    }

    pub fn geo_path(&self) -> PathBuf {
        self.workdir.join(format!("{}.geo", self.basename))
    }

    pub fn msh_path(&self) -> PathBuf {
        self.workdir.join(format!("{}.msh", self.basename))
    }
}

impl MeshGenerator for GmshGenerator {
    fn generate(&self, domain: &Domain, factor: f64) -> Result<Mesh, MeshGenerationError> {
        let start = Instant::now();
        std::fs::create_dir_all(&self.workdir)?;
        let geo = self.geo_path();
        let msh = self.msh_path();
        domain.write_to_file(&geo)?;
        if msh.exists() {
            std::fs::remove_file(&msh)?;
        }

        let output = Command::new(&self.program)
            .arg(format!("-{}", domain.dimension()))
            .args(["-format", "msh2", "-clscale"])
            .arg(factor.to_string())
            .args(&self.extra_args)
            .arg("-o")
            .arg(&msh)
            .arg(&geo)
            .output()
            .map_err(|source| MeshGenerationError::Spawn {
                program: self.program.display().to_string(),
                source,
            })?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
        debug!(%stdout, %stderr, "mesh tool output");

        if !output.status.success() || !msh.exists() {
            return Err(MeshGenerationError::ToolFailed {
                status: output.status.code(),
                stdout,
                stderr,
            });
        }

        let mesh = read_msh(&msh, CoordinateFrame::new(domain.unit))?;
        info!(
            cells = mesh.num_cells(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "generated mesh with external tool"
        );
        Ok(mesh)
    }
}

/// In-process mesher: constrained Delaunay triangulation of planar horizontal
/// surfaces, graded by the domain's size fields. Volumes bounded by a bottom and
/// a top surface (cylinders, cones) are extruded into layers of prisms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelaunayGenerator {
    /// Lower bound on the number of segments per arc.
    pub min_arc_segments: usize,
    /// Interior seeds closer than this fraction of the local size to the
    /// boundary are dropped.
    pub boundary_clearance: f64,
    pub max_seeds: usize,
}

impl Default for DelaunayGenerator {
    fn default() -> Self {
        Self {
            min_arc_segments: 2,
            boundary_clearance: 0.5,
            max_seeds: 500_000,
        }
    }
}

/// Local target size combining vertex sizes and the background field.
struct Sizing<'a> {
    domain: &'a Domain,
    points: Vec<([f64; 3], f64)>,
    factor: f64,
    fallback: f64,
}

impl<'a> Sizing<'a> {
    fn new(domain: &'a Domain, factor: f64) -> Self {
        // Arc centers are not part of the boundary and do not prescribe sizes.
        let mut ids: Vec<u32> = Vec::new();
        for edge in domain.edges() {
            match &edge.kind {
                EdgeKind::Arc { start, end, .. } => ids.extend([*start, *end]),
                _ => ids.extend(edge.vertex_ids()),
            }
        }
        ids.sort_unstable();
        ids.dedup();
        let points = ids
            .iter()
            .filter_map(|id| domain.vertex(*id).ok())
            .filter(|v| v.vol_size > 0.0 && v.vol_size.is_finite())
            .map(|v| (v.x, v.vol_size))
            .collect();
        let fallback = domain
            .bounding_box()
            .map(|(lo, hi)| crate::geometry::dist(lo, hi) / 10.0)
            .unwrap_or(1.0);
        Self {
            domain,
            points,
            factor,
            fallback,
        }
    }

    fn at(&self, p: [f64; 3]) -> f64 {
        let nearest = self
            .points
            .iter()
            .map(|(x, h)| (crate::geometry::dist(*x, p), *h))
            .min_by(|a, b| a.0.total_cmp(&b.0))
            .map_or(f64::INFINITY, |(_, h)| h);
        let h = nearest.min(self.domain.target_size_at(p));
        if h.is_finite() && h > 0.0 {
            h * self.factor
        } else {
            self.fallback * self.factor
        }
    }
}

fn point_in_polygon(p: [f64; 2], poly: &[[f64; 3]]) -> bool {
    let mut inside = false;
    let n = poly.len();
    for i in 0..n {
        let a = poly[i];
        let b = poly[(i + 1) % n];
        if (a[1] > p[1]) != (b[1] > p[1]) {
            let x = a[0] + (p[1] - a[1]) / (b[1] - a[1]) * (b[0] - a[0]);
            if p[0] < x {
                inside = !inside;
            }
        }
    }
    inside
}

fn segment_distance(p: [f64; 2], a: [f64; 3], b: [f64; 3]) -> f64 {
    let (dx, dy) = (b[0] - a[0], b[1] - a[1]);
    let len2 = dx * dx + dy * dy;
    let t = if len2 > 0.0 {
        (((p[0] - a[0]) * dx + (p[1] - a[1]) * dy) / len2).clamp(0.0, 1.0)
    } else {
        0.0
    };
    ((p[0] - a[0] - t * dx).powi(2) + (p[1] - a[1] - t * dy).powi(2)).sqrt()
}

fn insertion_failed(e: InsertionError) -> MeshGenerationError {
    MeshGenerationError::UnsupportedDomain(format!("triangulation insert failed: {e}"))
}

/// Planar triangulation: 2D node positions, triangles and the plane's z.
struct Triangulated {
    points: Vec<[f64; 2]>,
    triangles: Vec<[usize; 3]>,
    z: f64,
}

impl DelaunayGenerator {
    /// Boundary polygon of every surface. Shared edges are sampled identically.
    fn surface_polygons(
        &self,
        domain: &Domain,
        surfaces: &[u32],
        sizing: &Sizing,
    ) -> Result<Vec<Vec<[f64; 3]>>, MeshGenerationError> {
        let mut segments: BTreeMap<u32, usize> = BTreeMap::new();
        let mut polygons = Vec::with_capacity(surfaces.len());
        for &s in surfaces {
            let surface = domain.surface(s)?;
            let edges = domain.line_loop(surface.line_loop)?.edges.clone();
            for &e in &edges {
                let id = e.unsigned_abs() as u32;
                if segments.contains_key(&id) {
                    continue;
                }
                let samples = domain.sample_edge(id, 8)?;
                let h = samples.iter().map(|p| sizing.at(*p)).fold(f64::INFINITY, f64::min);
                let len = domain.edge_length(id)?;
                let min = match domain.edge(id)?.kind {
                    EdgeKind::Arc { .. } => self.min_arc_segments.max(2),
                    _ => 1,
                };
                segments.insert(id, ((len / h).ceil() as usize).max(min));
            }
            polygons.push(domain.edges_polygon(&edges, |id| segments.get(&id).copied().unwrap_or(1))?);
        }
        Ok(polygons)
    }

    fn triangulate(
        &self,
        domain: &Domain,
        surfaces: &[u32],
        sizing: &Sizing,
    ) -> Result<Triangulated, MeshGenerationError> {
        let polygons = self.surface_polygons(domain, surfaces, sizing)?;
        let z = polygons
            .first()
            .and_then(|p| p.first())
            .map(|p| p[2])
            .ok_or_else(|| MeshGenerationError::UnsupportedDomain("no surfaces to mesh".into()))?;
        let scale = domain
            .bounding_box()
            .map(|(lo, hi)| crate::geometry::dist(lo, hi))
            .unwrap_or(1.0);
        if polygons.iter().flatten().any(|p| (p[2] - z).abs() > 1e-9 * scale.max(1.0)) {
            return Err(MeshGenerationError::UnsupportedDomain(
                "surfaces do not lie in one horizontal plane".into(),
            ));
        }

        let mut cdt = ConstrainedDelaunayTriangulation::<Point2<f64>>::new();
        for poly in &polygons {
            let mut handles = Vec::with_capacity(poly.len());
            for p in poly {
                handles.push(cdt.insert(Point2::new(p[0], p[1])).map_err(insertion_failed)?);
            }
            for i in 0..handles.len() {
                let (from, to) = (handles[i], handles[(i + 1) % handles.len()]);
                if from == to {
                    continue;
                }
                if !cdt.can_add_constraint(from, to) {
                    return Err(MeshGenerationError::UnsupportedDomain(
                        "boundary edges intersect".into(),
                    ));
                }
                cdt.add_constraint(from, to);
            }
        }

        // Graded lattice seeds: spacing h_min, thinned by powers of two where the
        // local size is larger.
        let boundary: Vec<[f64; 3]> = polygons.iter().flatten().copied().collect();
        let field_min = domain
            .bkgd_field()
            .map_or(f64::INFINITY, |f| domain.field_min_size(f) * sizing.factor);
        let mut h_min = boundary
            .iter()
            .map(|p| sizing.at(*p))
            .fold(field_min, f64::min);
        let (mut lo, mut hi) = ([f64::INFINITY; 2], [f64::NEG_INFINITY; 2]);
        for p in &boundary {
            for i in 0..2 {
                lo[i] = lo[i].min(p[i]);
                hi[i] = hi[i].max(p[i]);
            }
        }
        let (w, h) = (hi[0] - lo[0], hi[1] - lo[1]);
        if (w / h_min) * (h / h_min) > self.max_seeds as f64 {
            let coarser = (w * h / self.max_seeds as f64).sqrt();
            warn!(h_min, coarser, "seed lattice too fine, coarsening");
            h_min = coarser;
        }
        let nx = (w / h_min).ceil() as usize;
        let ny = (h / h_min).ceil() as usize;
        let mut seeds = 0usize;
        for j in 0..=ny {
            for i in 0..=nx {
                let p = [lo[0] + i as f64 * h_min, lo[1] + j as f64 * h_min];
                let p3 = [p[0], p[1], z];
                let local = sizing.at(p3);
                let level = (local / h_min).log2().floor().clamp(0.0, 20.0) as u32;
                let step = 1usize << level;
                if i % step != 0 || j % step != 0 {
                    continue;
                }
                if !polygons.iter().any(|poly| point_in_polygon(p, poly)) {
                    continue;
                }
                let clearance = self.boundary_clearance * local;
                let near_boundary = polygons.iter().any(|poly| {
                    (0..poly.len())
                        .any(|k| segment_distance(p, poly[k], poly[(k + 1) % poly.len()]) < clearance)
                });
                if near_boundary {
                    continue;
                }
                cdt.insert(Point2::new(p[0], p[1])).map_err(insertion_failed)?;
                seeds += 1;
            }
        }
        debug!(boundary = boundary.len(), seeds, h_min, "triangulation input");

        let mut index: HashMap<usize, usize> = HashMap::new();
        let mut points = Vec::new();
        let mut triangles = Vec::new();
        for face in cdt.inner_faces() {
            let verts = face.vertices();
            let pos = verts.map(|v| v.position());
            let c = [
                (pos[0].x + pos[1].x + pos[2].x) / 3.0,
                (pos[0].y + pos[1].y + pos[2].y) / 3.0,
            ];
            if !polygons.iter().any(|poly| point_in_polygon(c, poly)) {
                continue;
            }
            let mut tri = [0usize; 3];
            for (k, v) in verts.iter().enumerate() {
                let key = v.fix().index();
                tri[k] = *index.entry(key).or_insert_with(|| {
                    let p = v.position();
                    points.push([p.x, p.y]);
                    points.len() - 1
                });
            }
            triangles.push(tri);
        }
        if triangles.is_empty() {
            return Err(MeshGenerationError::EmptyMesh);
        }
        Ok(Triangulated { points, triangles, z })
    }

    fn is_horizontal(domain: &Domain, surface: u32) -> bool {
        domain
            .surface(surface)
            .map(|s| s.normal[2].abs() > 1.0 - 1e-6)
            .unwrap_or(false)
    }

    fn extrude(&self, domain: &Domain, sizing: &Sizing) -> Result<Mesh, MeshGenerationError> {
        let mut levels: Vec<(f64, u32)> = Vec::new();
        for s in domain.surfaces() {
            if !Self::is_horizontal(domain, s.id) {
                continue;
            }
            let l = domain.line_loop(s.line_loop)?;
            let (start, _) = domain.oriented_endpoints(l.edges[0])?;
            levels.push((domain.vertex(start)?.x[2], s.id));
        }
        let z0 = levels.iter().map(|l| l.0).fold(f64::INFINITY, f64::min);
        let z1 = levels.iter().map(|l| l.0).fold(f64::NEG_INFINITY, f64::max);
        if !(z1 > z0) {
            return Err(MeshGenerationError::UnsupportedDomain(
                "volume needs a horizontal bottom and top surface".into(),
            ));
        }
        let tol = 1e-9 * (z1 - z0);
        let bottom: Vec<u32> = levels.iter().filter(|l| (l.0 - z0).abs() <= tol).map(|l| l.1).collect();
        let top: Vec<u32> = levels.iter().filter(|l| (l.0 - z1).abs() <= tol).map(|l| l.1).collect();

        let extent = |surfaces: &[u32]| -> Result<([f64; 2], [f64; 2]), MeshGenerationError> {
            let mut lo = [f64::INFINITY; 2];
            let mut hi = [f64::NEG_INFINITY; 2];
            for &s in surfaces {
                let edges = &domain.line_loop(domain.surface(s)?.line_loop)?.edges;
                for p in domain.edges_polygon(edges, |_| 16)? {
                    for i in 0..2 {
                        lo[i] = lo[i].min(p[i]);
                        hi[i] = hi[i].max(p[i]);
                    }
                }
            }
            Ok((lo, hi))
        };
        let (blo, bhi) = extent(&bottom)?;
        let (tlo, thi) = extent(&top)?;
        let sx = (thi[0] - tlo[0]) / (bhi[0] - blo[0]);
        let sy = (thi[1] - tlo[1]) / (bhi[1] - blo[1]);
        if !(sx > 0.0) || (sx - sy).abs() > 1e-3 * sx {
            return Err(MeshGenerationError::UnsupportedDomain(
                "top surface is not a scaled copy of the bottom surface".into(),
            ));
        }
        let cb = [(blo[0] + bhi[0]) / 2.0, (blo[1] + bhi[1]) / 2.0];
        let ct = [(tlo[0] + thi[0]) / 2.0, (tlo[1] + thi[1]) / 2.0];

        let base = self.triangulate(domain, &bottom, sizing)?;
        let h_z = base
            .points
            .iter()
            .map(|p| sizing.at([p[0], p[1], z0]))
            .fold(f64::INFINITY, f64::min);
        let layers = ((z1 - z0) / h_z).ceil().max(1.0) as usize;

        let n = base.points.len();
        let mut positions = Vec::with_capacity(n * (layers + 1));
        for k in 0..=layers {
            let t = k as f64 / layers as f64;
            let s = 1.0 + (sx - 1.0) * t;
            for p in &base.points {
                positions.push([
                    cb[0] + (p[0] - cb[0]) * s + (ct[0] - cb[0]) * t,
                    cb[1] + (p[1] - cb[1]) * s + (ct[1] - cb[1]) * t,
                    z0 + (z1 - z0) * t,
                ]);
            }
        }
        let mut elements = Vec::with_capacity(base.triangles.len() * layers);
        for k in 0..layers {
            for t in &base.triangles {
                let lower = t.map(|i| i + k * n);
                let upper = t.map(|i| i + (k + 1) * n);
                elements.push((CellKind::Prism, [lower, upper].concat()));
            }
        }
        debug!(layers, triangles = base.triangles.len(), "extruded prism mesh");
        Mesh::from_elements(CoordinateFrame::new(domain.unit), positions, elements)
    }
}

impl MeshGenerator for DelaunayGenerator {
    fn generate(&self, domain: &Domain, factor: f64) -> Result<Mesh, MeshGenerationError> {
        if !(factor > 0.0 && factor.is_finite()) {
            return Err(MeshGenerationError::UnsupportedDomain(format!(
                "size factor must be positive, got {factor}"
            )));
        }
        let start = Instant::now();
        let sizing = Sizing::new(domain, factor);
        let mesh = if domain.dimension() == 3 {
            self.extrude(domain, &sizing)?
        } else {
            let surfaces: Vec<u32> = domain.surfaces().map(|s| s.id).collect();
            if let Some(&s) = surfaces.iter().find(|s| !Self::is_horizontal(domain, **s)) {
                return Err(MeshGenerationError::UnsupportedDomain(format!(
                    "surface {s} is not horizontal"
                )));
            }
            let tri = self.triangulate(domain, &surfaces, &sizing)?;
            let positions = tri.points.iter().map(|p| [p[0], p[1], tri.z]).collect();
            let elements = tri
                .triangles
                .iter()
                .map(|t| (CellKind::Triangle, t.to_vec()))
                .collect();
            Mesh::from_elements(CoordinateFrame::new(domain.unit), positions, elements)?
        };
        info!(
            cells = mesh.num_cells(),
            nodes = mesh.nodes.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "generated Delaunay mesh"
        );
        Ok(mesh)
    }
}
