use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use nalgebra::Vector3;
use serde::{Deserialize, Serialize};

use crate::error::MeshGenerationError;
use crate::geometry::LengthUnit;

static NEXT_MESH_ID: AtomicU64 = AtomicU64::new(1);

/// Identity of a mesh. Every construction, merge or rescale yields a new one;
/// ROI index sets remember the identity they were computed for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "u64", into = "u64")]
pub struct MeshId(u64);

impl MeshId {
    pub fn fresh() -> Self {
        MeshId(NEXT_MESH_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn value(self) -> u64 {
        self.0
    }
}

// Restored IDs keep their value and push the counter past them, so that meshes
// built later in this process never collide with a restored one.
impl From<u64> for MeshId {
    fn from(v: u64) -> Self {
        NEXT_MESH_ID.fetch_max(v.saturating_add(1), Ordering::Relaxed);
        MeshId(v)
    }
}

impl From<MeshId> for u64 {
    fn from(id: MeshId) -> Self {
        id.0
    }
}

/// Coordinate space of mesh vertices.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct CoordinateFrame {
    pub unit: LengthUnit,
    pub origin: [f64; 3],
}

impl CoordinateFrame {
    pub fn new(unit: LengthUnit) -> Self {
        Self {
            unit,
            origin: [0.0; 3],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CellKind {
    Triangle,
    Tetrahedron,
    Prism,
}

impl CellKind {
    pub fn num_nodes(self) -> usize {
        match self {
            CellKind::Triangle => 3,
            CellKind::Tetrahedron => 4,
            CellKind::Prism => 6,
        }
    }

    pub fn dim(self) -> usize {
        match self {
            CellKind::Triangle => 2,
            CellKind::Tetrahedron | CellKind::Prism => 3,
        }
    }

    /// Local node lists of the cell's faces (edges for triangles).
    fn local_faces(self) -> &'static [&'static [usize]] {
        match self {
            CellKind::Triangle => &[&[0, 1], &[1, 2], &[2, 0]],
            CellKind::Tetrahedron => &[&[0, 1, 2], &[0, 1, 3], &[1, 2, 3], &[2, 0, 3]],
            CellKind::Prism => &[
                &[0, 1, 2],
                &[3, 4, 5],
                &[0, 1, 4, 3],
                &[1, 2, 5, 4],
                &[2, 0, 3, 5],
            ],
        }
    }
}

/// The complete computational grid.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Mesh {
    pub id: MeshId,
    pub dim: usize,
    pub frame: CoordinateFrame,
    pub cells: Vec<Cell>,
    pub faces: Vec<Face>,
    pub nodes: Vec<Node>,
}

/// A single control volume. In 2D the volume is the cell area.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cell {
    pub id: usize,
    pub kind: CellKind,
    pub volume: f64,
    pub centroid: [f64; 3],
    pub node_ids: Vec<usize>,
    pub face_ids: Vec<usize>,
}

/// An interface between two cells. In 2D the area is the edge length.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Face {
    pub area: f64,
    /// Unit normal pointing out of the left cell.
    pub normal: [f64; 3],
    /// (left cell, optional right cell). `None` marks a boundary face.
    pub neighbor_cell_ids: (usize, Option<usize>),
    pub centroid: [f64; 3],
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub position: [f64; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MeshStats {
    pub num_cells: usize,
    pub num_faces: usize,
    pub num_boundary_faces: usize,
    pub num_nodes: usize,
    pub min_spacing: f64,
    pub max_spacing: f64,
    pub min_volume: f64,
    pub max_volume: f64,
    pub total_volume: f64,
}

fn v3(p: [f64; 3]) -> Vector3<f64> {
    Vector3::from(p)
}

fn tet_volume(a: Vector3<f64>, b: Vector3<f64>, c: Vector3<f64>, d: Vector3<f64>) -> f64 {
    ((b - a).cross(&(c - a))).dot(&(d - a)).abs() / 6.0
}

/// Area-weighted vector normal (norm = area) and centroid of a face polygon.
fn polygon_face(pts: &[Vector3<f64>]) -> (Vector3<f64>, Vector3<f64>) {
    let centroid = pts.iter().sum::<Vector3<f64>>() / pts.len() as f64;
    let area_vec = match pts.len() {
        3 => (pts[1] - pts[0]).cross(&(pts[2] - pts[0])) * 0.5,
        4 => (pts[2] - pts[0]).cross(&(pts[3] - pts[1])) * 0.5,
        _ => Vector3::zeros(),
    };
    (area_vec, centroid)
}

impl Mesh {
    /// Build a mesh from nodes and element connectivity, deriving faces,
    /// volumes, centroids and outward normals.
    pub fn from_elements(
        frame: CoordinateFrame,
        positions: Vec<[f64; 3]>,
        elements: Vec<(CellKind, Vec<usize>)>,
    ) -> Result<Mesh, MeshGenerationError> {
        if elements.is_empty() {
            return Err(MeshGenerationError::EmptyMesh);
        }
        let dim = elements.iter().map(|(k, _)| k.dim()).max().unwrap_or(2);
        let malformed = |message: String| MeshGenerationError::Malformed {
            section: "Elements".into(),
            message,
        };

        let mut cells = Vec::with_capacity(elements.len());
        let mut faces: Vec<Face> = Vec::new();
        let mut face_index: HashMap<Vec<usize>, usize> = HashMap::new();

        for (cell_id, (kind, node_ids)) in elements.into_iter().enumerate() {
            if kind.dim() != dim {
                continue;
            }
            if node_ids.len() != kind.num_nodes() {
                return Err(malformed(format!(
                    "{kind:?} element {cell_id} has {} nodes",
                    node_ids.len()
                )));
            }
            if let Some(&bad) = node_ids.iter().find(|&&n| n >= positions.len()) {
                return Err(malformed(format!("element {cell_id} references missing node {bad}")));
            }
            let p: Vec<Vector3<f64>> = node_ids.iter().map(|&n| v3(positions[n])).collect();

            let (volume, centroid) = match kind {
                CellKind::Triangle => {
                    let area = 0.5 * (p[1] - p[0]).cross(&(p[2] - p[0])).norm();
                    (area, (p[0] + p[1] + p[2]) / 3.0)
                }
                CellKind::Tetrahedron => (
                    tet_volume(p[0], p[1], p[2], p[3]),
                    (p[0] + p[1] + p[2] + p[3]) / 4.0,
                ),
                CellKind::Prism => {
                    let tets = [[0, 1, 2, 3], [1, 2, 3, 4], [2, 3, 4, 5]];
                    let mut vol = 0.0;
                    let mut c = Vector3::zeros();
                    for t in tets {
                        let v = tet_volume(p[t[0]], p[t[1]], p[t[2]], p[t[3]]);
                        vol += v;
                        c += (p[t[0]] + p[t[1]] + p[t[2]] + p[t[3]]) / 4.0 * v;
                    }
                    let c = if vol > 0.0 {
                        c / vol
                    } else {
                        p.iter().sum::<Vector3<f64>>() / 6.0
                    };
                    (vol, c)
                }
            };

            let id = cells.len();
            let mut face_ids = Vec::with_capacity(kind.local_faces().len());
            for local in kind.local_faces() {
                let global: Vec<usize> = local.iter().map(|&i| node_ids[i]).collect();
                let mut key = global.clone();
                key.sort_unstable();
                if let Some(&f) = face_index.get(&key) {
                    if faces[f].neighbor_cell_ids.1.is_none() && faces[f].neighbor_cell_ids.0 != id {
                        faces[f].neighbor_cell_ids.1 = Some(id);
                    }
                    face_ids.push(f);
                    continue;
                }

                let pts: Vec<Vector3<f64>> = global.iter().map(|&n| v3(positions[n])).collect();
                let (area, normal, fc) = if kind == CellKind::Triangle {
                    let t = pts[1] - pts[0];
                    let len = t.norm();
                    let n = if len > 0.0 {
                        Vector3::new(t.y, -t.x, 0.0) / len
                    } else {
                        Vector3::zeros()
                    };
                    (len, n, (pts[0] + pts[1]) * 0.5)
                } else {
                    let (av, fc) = polygon_face(&pts);
                    let a = av.norm();
                    (a, if a > 0.0 { av / a } else { av }, fc)
                };
                let normal = if normal.dot(&(fc - centroid)) < 0.0 {
                    -normal
                } else {
                    normal
                };

                face_index.insert(key, faces.len());
                face_ids.push(faces.len());
                faces.push(Face {
                    area,
                    normal: normal.into(),
                    neighbor_cell_ids: (id, None),
                    centroid: fc.into(),
                });
            }

            cells.push(Cell {
                id,
                kind,
                volume,
                centroid: centroid.into(),
                node_ids,
                face_ids,
            });
        }

        if cells.is_empty() {
            return Err(MeshGenerationError::EmptyMesh);
        }

        Ok(Mesh {
            id: MeshId::fresh(),
            dim,
            frame,
            cells,
            faces,
            nodes: positions.into_iter().map(|position| Node { position }).collect(),
        })
    }

    /// Node positions and element connectivity, the inverse of [`Mesh::from_elements`].
    pub fn elements(&self) -> Vec<(CellKind, Vec<usize>)> {
        self.cells
            .iter()
            .map(|c| (c.kind, c.node_ids.clone()))
            .collect()
    }

    pub fn num_cells(&self) -> usize {
        self.cells.len()
    }

    pub fn cell_centers(&self) -> Vec<[f64; 3]> {
        self.cells.iter().map(|c| c.centroid).collect()
    }

    pub fn cell_volumes(&self) -> Vec<f64> {
        self.cells.iter().map(|c| c.volume).collect()
    }

    pub fn total_volume(&self) -> f64 {
        self.cells.iter().map(|c| c.volume).sum()
    }

    /// Cells sharing a face with each cell.
    pub fn cell_adjacency(&self) -> Vec<Vec<usize>> {
        let mut adj = vec![Vec::new(); self.cells.len()];
        for face in &self.faces {
            if let (k, Some(l)) = face.neighbor_cell_ids {
                adj[k].push(l);
                adj[l].push(k);
            }
        }
        adj
    }

    /// Cells incident to each node.
    pub fn node_cells(&self) -> Vec<Vec<usize>> {
        let mut out = vec![Vec::new(); self.nodes.len()];
        for cell in &self.cells {
            for &n in &cell.node_ids {
                out[n].push(cell.id);
            }
        }
        out
    }

    pub fn bounding_box(&self) -> ([f64; 3], [f64; 3]) {
        let mut lo = [f64::INFINITY; 3];
        let mut hi = [f64::NEG_INFINITY; 3];
        for n in &self.nodes {
            for i in 0..3 {
                lo[i] = lo[i].min(n.position[i]);
                hi[i] = hi[i].max(n.position[i]);
            }
        }
        (lo, hi)
    }

    /// Characteristic length of the smallest cell.
    pub fn min_cell_size(&self) -> f64 {
        let exponent = 1.0 / self.dim as f64;
        self.cells
            .iter()
            .map(|c| c.volume.powf(exponent))
            .fold(f64::INFINITY, f64::min)
    }

    pub fn stats(&self) -> MeshStats {
        let mut min_spacing = f64::INFINITY;
        let mut max_spacing: f64 = 0.0;
        let mut boundary = 0;
        for face in &self.faces {
            match face.neighbor_cell_ids {
                (k, Some(l)) => {
                    let d = (v3(self.cells[k].centroid) - v3(self.cells[l].centroid)).norm();
                    min_spacing = min_spacing.min(d);
                    max_spacing = max_spacing.max(d);
                }
                (_, None) => boundary += 1,
            }
        }
        let volumes = self.cells.iter().map(|c| c.volume);
        MeshStats {
            num_cells: self.cells.len(),
            num_faces: self.faces.len(),
            num_boundary_faces: boundary,
            num_nodes: self.nodes.len(),
            min_spacing,
            max_spacing,
            min_volume: volumes.clone().fold(f64::INFINITY, f64::min),
            max_volume: volumes.clone().fold(0.0, f64::max),
            total_volume: volumes.sum(),
        }
    }

    /// Copy of the mesh with every coordinate (and the frame origin) multiplied
    /// by `factor`, expressed in `unit`. The copy has a new identity.
    pub fn rescaled(&self, factor: f64, unit: LengthUnit) -> Result<Mesh, MeshGenerationError> {
        if !(factor > 0.0 && factor.is_finite()) {
            return Err(MeshGenerationError::Malformed {
                section: "rescale".into(),
                message: format!("scale factor must be positive, got {factor}"),
            });
        }
        let positions = self
            .nodes
            .iter()
            .map(|n| n.position.map(|x| x * factor))
            .collect();
        let frame = CoordinateFrame {
            unit,
            origin: self.frame.origin.map(|x| x * factor),
        };
        Mesh::from_elements(frame, positions, self.elements())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_relative_eq;

    /// Unit square split into `n × n × 2` triangles.
    pub(crate) fn square_mesh(n: usize, side: f64) -> Mesh {
        let h = side / n as f64;
        let mut pos = Vec::new();
        for j in 0..=n {
            for i in 0..=n {
                pos.push([i as f64 * h, j as f64 * h, 0.0]);
            }
        }
        let idx = |i: usize, j: usize| j * (n + 1) + i;
        let mut el = Vec::new();
        for j in 0..n {
            for i in 0..n {
                el.push((CellKind::Triangle, vec![idx(i, j), idx(i + 1, j), idx(i + 1, j + 1)]));
                el.push((CellKind::Triangle, vec![idx(i, j), idx(i + 1, j + 1), idx(i, j + 1)]));
            }
        }
        Mesh::from_elements(CoordinateFrame::default(), pos, el).unwrap()
    }

    #[test]
    fn triangle_mesh_geometry() {
        let m = square_mesh(4, 2.0);
        assert_eq!(m.num_cells(), 32);
        assert_relative_eq!(m.total_volume(), 4.0, epsilon = 1e-12);
        let s = m.stats();
        assert_eq!(s.num_boundary_faces, 16);
        for face in &m.faces {
            let c = m.cells[face.neighbor_cell_ids.0].centroid;
            let d: f64 = (0..3).map(|i| face.normal[i] * (face.centroid[i] - c[i])).sum();
            assert!(d > 0.0);
        }
    }

    #[test]
    fn adjacency_is_symmetric() {
        let m = square_mesh(2, 1.0);
        let adj = m.cell_adjacency();
        for (k, ns) in adj.iter().enumerate() {
            assert!(!ns.is_empty() && ns.len() <= 3);
            for &l in ns {
                assert!(adj[l].contains(&k));
            }
        }
        // Interior faces are shared by exactly two cells.
        let links: usize = adj.iter().map(Vec::len).sum();
        assert_eq!(links, 2 * (m.faces.len() - m.stats().num_boundary_faces));

        let node_cells = m.node_cells();
        assert_eq!(node_cells.len(), 9);
        assert_eq!(node_cells[4].len(), 6);
        assert_eq!(m.cell_centers().len(), m.num_cells());
    }

    #[test]
    fn prism_volume_and_faces() {
        let pos = vec![
            [0.0, 0.0, 0.0],
            [1.0, 0.0, 0.0],
            [0.0, 1.0, 0.0],
            [0.0, 0.0, 2.0],
            [1.0, 0.0, 2.0],
            [0.0, 1.0, 2.0],
        ];
        let m = Mesh::from_elements(
            CoordinateFrame::new(LengthUnit::Micron),
            pos,
            vec![(CellKind::Prism, (0..6).collect())],
        )
        .unwrap();
        assert_eq!(m.dim, 3);
        assert_relative_eq!(m.cells[0].volume, 1.0, epsilon = 1e-12);
        assert_eq!(m.faces.len(), 5);
        let area: f64 = m.faces.iter().map(|f| f.area).sum();
        assert_relative_eq!(area, 0.5 + 0.5 + 2.0 + 2.0 * 2f64.sqrt() + 2.0, epsilon = 1e-12);
    }

    #[test]
    fn empty_mesh_is_an_error() {
        assert!(matches!(
            Mesh::from_elements(CoordinateFrame::default(), vec![], vec![]),
            Err(MeshGenerationError::EmptyMesh)
        ));
    }

    #[test]
    fn rescale_changes_identity_and_volume() {
        let m = square_mesh(2, 1.0);
        let r = m.rescaled(2.0, LengthUnit::Micron).unwrap();
        assert_ne!(m.id, r.id);
        assert_relative_eq!(r.total_volume(), 4.0, epsilon = 1e-12);
        assert_eq!(r.frame.unit, LengthUnit::Micron);
    }
}
