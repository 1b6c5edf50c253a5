use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::mesh::{CoordinateFrame, Mesh, MeshId};
use super::msh::{read_msh, write_msh};
use crate::error::MeshGenerationError;

/// Where one source mesh landed inside a merged mesh.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MergeSource {
    pub id: MeshId,
    pub cell_offset: usize,
    pub num_cells: usize,
}

/// Union of several meshes. Cells are renumbered contiguously in source order,
/// so `(source, local)` maps to `cell_offset + local`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MergedMesh {
    pub mesh: Mesh,
    pub sources: Vec<MergeSource>,
}

impl MergedMesh {
    /// Merged index of cell `local` of mesh `source`.
    pub fn translate_cell(&self, source: MeshId, local: usize) -> Option<usize> {
        self.sources
            .iter()
            .find(|s| s.id == source)
            .filter(|s| local < s.num_cells)
            .map(|s| s.cell_offset + local)
    }

    /// Every `(source, local) → merged` pair.
    pub fn cell_map(&self) -> impl Iterator<Item = ((MeshId, usize), usize)> + '_ {
        self.sources.iter().flat_map(|s| {
            (0..s.num_cells).map(move |local| ((s.id, local), s.cell_offset + local))
        })
    }
}

fn frames_compatible(a: &CoordinateFrame, b: &CoordinateFrame) -> bool {
    a.unit == b.unit && a.origin.iter().zip(&b.origin).all(|(x, y)| (x - y).abs() <= 1e-12)
}

/// Merge meshes that share a coordinate frame and a dimension. With `coherent`
/// set, coincident nodes are fused so that cells on either side of a common
/// interface become neighbours. Each source must be a distinct mesh.
pub fn merge_meshes(meshes: &[&Mesh], coherent: bool) -> Result<MergedMesh, MeshGenerationError> {
    let first = meshes.first().ok_or(MeshGenerationError::EmptyMesh)?;
    let mut ids = HashSet::with_capacity(meshes.len());
    if let Some(m) = meshes.iter().find(|m| !ids.insert(m.id)) {
        return Err(MeshGenerationError::DuplicateSource { id: m.id });
    }
    for m in &meshes[1..] {
        if !frames_compatible(&first.frame, &m.frame) {
            return Err(MeshGenerationError::IncompatibleFrames {
                a: first.frame,
                b: m.frame,
            });
        }
        if m.dim != first.dim {
            return Err(MeshGenerationError::DimensionMismatch {
                a: first.dim,
                b: m.dim,
            });
        }
    }

    let scale = meshes
        .iter()
        .map(|m| {
            let (lo, hi) = m.bounding_box();
            crate::geometry::dist(lo, hi)
        })
        .fold(0.0, f64::max)
        .max(f64::MIN_POSITIVE);
    let quantum = 1e-9 * scale;

    let mut positions: Vec<[f64; 3]> = Vec::new();
    let mut seen: HashMap<[i64; 3], usize> = HashMap::new();
    let mut elements = Vec::new();
    let mut sources = Vec::with_capacity(meshes.len());

    for m in meshes {
        let node_map: Vec<usize> = m
            .nodes
            .iter()
            .map(|n| {
                if coherent {
                    let key = n.position.map(|x| (x / quantum).round() as i64);
                    *seen.entry(key).or_insert_with(|| {
                        positions.push(n.position);
                        positions.len() - 1
                    })
                } else {
                    positions.push(n.position);
                    positions.len() - 1
                }
            })
            .collect();
        sources.push(MergeSource {
            id: m.id,
            cell_offset: elements.len(),
            num_cells: m.num_cells(),
        });
        for (kind, nodes) in m.elements() {
            elements.push((kind, nodes.iter().map(|&n| node_map[n]).collect()));
        }
    }

    let mesh = Mesh::from_elements(first.frame, positions, elements)?;
    info!(
        sources = sources.len(),
        cells = mesh.num_cells(),
        coherent,
        "merged meshes"
    );
    Ok(MergedMesh { mesh, sources })
}

/// Read MSH files, merge them, and write the merged mesh next to `output_geo`
/// (same stem, `.msh`) together with a script that merges the sources.
pub fn merge_mesh_files(
    paths: &[impl AsRef<Path>],
    output_geo: impl AsRef<Path>,
    frame: CoordinateFrame,
    coherent: bool,
) -> Result<MergedMesh, MeshGenerationError> {
    let output_geo = output_geo.as_ref();
    let meshes = paths
        .iter()
        .map(|p| read_msh(p, frame))
        .collect::<Result<Vec<_>, _>>()?;
    let refs: Vec<&Mesh> = meshes.iter().collect();
    let merged = merge_meshes(&refs, coherent)?;

    let mut geo = String::new();
    for p in paths {
        let _ = writeln!(geo, "Merge \"{}\";", p.as_ref().display());
    }
    if coherent {
        geo.push_str("Coherence Mesh;\n");
    }
    fs::write(output_geo, geo)?;
    write_msh(&merged.mesh, output_geo.with_extension("msh"), false)?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::mesh::tests::square_mesh;
    use crate::geometry::LengthUnit;

    fn shifted(m: &Mesh, dx: f64) -> Mesh {
        let positions = m.nodes.iter().map(|n| [n.position[0] + dx, n.position[1], 0.0]).collect();
        Mesh::from_elements(m.frame, positions, m.elements()).unwrap()
    }

    #[test]
    fn merged_cell_map_is_a_bijection() {
        let a = square_mesh(2, 1.0);
        let b = shifted(&square_mesh(3, 1.0), 2.0);
        let merged = merge_meshes(&[&a, &b], false).unwrap();
        assert_eq!(merged.mesh.num_cells(), a.num_cells() + b.num_cells());
        let targets: HashSet<usize> = merged.cell_map().map(|(_, t)| t).collect();
        assert_eq!(targets.len(), merged.mesh.num_cells());
        assert_eq!(merged.translate_cell(b.id, 0), Some(a.num_cells()));
        assert_eq!(merged.translate_cell(b.id, b.num_cells()), None);
    }

    #[test]
    fn coherent_merge_connects_shared_interface() {
        let a = square_mesh(2, 1.0);
        let b = shifted(&square_mesh(2, 1.0), 1.0);
        let loose = merge_meshes(&[&a, &b], false).unwrap();
        let glued = merge_meshes(&[&a, &b], true).unwrap();
        assert_eq!(
            loose.mesh.stats().num_boundary_faces,
            glued.mesh.stats().num_boundary_faces + 4
        );
        assert_eq!(glued.mesh.nodes.len(), loose.mesh.nodes.len() - 3);
    }

    #[test]
    fn merging_a_mesh_with_its_clone_is_rejected() {
        let a = square_mesh(2, 1.0);
        let twin = a.clone();
        assert!(matches!(
            merge_meshes(&[&a, &twin], false),
            Err(MeshGenerationError::DuplicateSource { id }) if id == a.id
        ));
    }

    #[test]
    fn different_units_cannot_merge() {
        let a = square_mesh(1, 1.0);
        let b = a.rescaled(1.0, LengthUnit::Micron).unwrap();
        assert!(matches!(
            merge_meshes(&[&a, &b], false),
            Err(MeshGenerationError::IncompatibleFrames { .. })
        ));
    }
}
