//! Regions of interest and their mesh-cell index sets.
//!
//! Index sets are tagged with the [`MeshId`] they were computed for; asking for
//! the indices of a different mesh is an [`IndexStaleError`], never a silent
//! reuse.

pub mod defaults;

use std::collections::{BTreeSet, HashMap};

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::discretization::{MergedMesh, Mesh, MeshId};
use crate::error::{FrapError, IndexStaleError, RoiError};
use crate::image::{ImageFrame, PixelTransform};

pub use defaults::DefaultRoiParams;

pub const ALL: &str = "All";
pub const SLICE: &str = "Slice";
pub const BLEACHED_SQUARE: &str = "Bleached Square";
pub const CIRCLE: &str = "Circle";
pub const RIM: &str = "Rim";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum RoiShape {
    Radial { center: [f64; 2], radius: f64 },
    /// Axis-aligned square with lower-left corner `offset`.
    Square { offset: [f64; 2], side: f64 },
    Rectangle { offset: [f64; 2], size: [f64; 2] },
    Polygon { corners: Vec<[f64; 2]> },
    /// Band `|z - height| <= width / 2`; unbounded when `width` is `None`.
    Slice { height: f64, width: Option<f64> },
    /// Pixel mask, evaluated at the pixel nearest to each cell centroid.
    Mask {
        mask: DMatrix<bool>,
        transform: PixelTransform,
    },
    /// Fixed cell list, valid only for the mesh it was given for.
    Explicit { mesh: MeshId, cells: Vec<usize> },
    All,
    /// Union of `add` minus union of `subtract`.
    Custom {
        add: Vec<String>,
        subtract: Vec<String>,
    },
    /// Every cell not in any of `of`.
    Complement { of: Vec<String> },
}

impl RoiShape {
    fn is_composite(&self) -> bool {
        matches!(self, RoiShape::Custom { .. } | RoiShape::Complement { .. })
    }

    /// In-plane membership of a primitive shape.
    fn contains_xy(&self, x: f64, y: f64) -> bool {
        match self {
            RoiShape::Radial { center, radius } => {
                (x - center[0]).powi(2) + (y - center[1]).powi(2) <= radius * radius
            }
            RoiShape::Square { offset, side } => {
                (offset[0]..=offset[0] + side).contains(&x) && (offset[1]..=offset[1] + side).contains(&y)
            }
            RoiShape::Rectangle { offset, size } => {
                (offset[0]..=offset[0] + size[0]).contains(&x)
                    && (offset[1]..=offset[1] + size[1]).contains(&y)
            }
            RoiShape::Polygon { corners } => point_in_polygon([x, y], corners),
            RoiShape::Mask { mask, transform } => {
                let [r, c] = transform.to_pixel(x, y);
                let (r, c) = (r.round(), c.round());
                r >= 0.0
                    && c >= 0.0
                    && mask.get((r as usize, c as usize)).copied().unwrap_or(false)
            }
            RoiShape::Slice { .. } | RoiShape::All => true,
            RoiShape::Explicit { .. } | RoiShape::Custom { .. } | RoiShape::Complement { .. } => false,
        }
    }

    /// In-plane bounding box, `None` when unbounded.
    fn bounding_box(&self) -> Option<([f64; 2], [f64; 2])> {
        match self {
            RoiShape::Radial { center, radius } => Some((
                [center[0] - radius, center[1] - radius],
                [center[0] + radius, center[1] + radius],
            )),
            RoiShape::Square { offset, side } => Some((*offset, [offset[0] + side, offset[1] + side])),
            RoiShape::Rectangle { offset, size } => {
                Some((*offset, [offset[0] + size[0], offset[1] + size[1]]))
            }
            RoiShape::Polygon { corners } => {
                let mut lo = [f64::INFINITY; 2];
                let mut hi = [f64::NEG_INFINITY; 2];
                for c in corners {
                    for i in 0..2 {
                        lo[i] = lo[i].min(c[i]);
                        hi[i] = hi[i].max(c[i]);
                    }
                }
                Some((lo, hi))
            }
            RoiShape::Mask { mask, transform } => {
                let (rows, cols) = mask.shape();
                let a = transform.to_physical(-0.5, -0.5);
                let b = transform.to_physical(rows as f64 - 0.5, cols as f64 - 0.5);
                Some(([a[0].min(b[0]), a[1].min(b[1])], [a[0].max(b[0]), a[1].max(b[1])]))
            }
            _ => None,
        }
    }

    fn z_band(&self) -> Option<[f64; 2]> {
        match self {
            RoiShape::Slice {
                height,
                width: Some(w),
            } => Some([height - w / 2.0, height + w / 2.0]),
            _ => None,
        }
    }
}

fn point_in_polygon(p: [f64; 2], poly: &[[f64; 2]]) -> bool {
    let mut inside = false;
    for i in 0..poly.len() {
        let a = poly[i];
        let b = poly[(i + 1) % poly.len()];
        if (a[1] > p[1]) != (b[1] > p[1]) && p[0] < a[0] + (p[1] - a[1]) / (b[1] - a[1]) * (b[0] - a[0]) {
            inside = !inside;
        }
    }
    inside
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoiIndex {
    pub mesh: MeshId,
    /// Sorted, unique cell indices.
    pub cells: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roi {
    pub name: String,
    pub shape: RoiShape,
    /// Optional `[z_min, z_max]` restriction of a primitive shape.
    pub z_range: Option<[f64; 2]>,
    index: Option<RoiIndex>,
    /// Measured series, one value per data time point.
    pub data_vec: Vec<f64>,
    /// Simulated series, one value per simulation time point.
    pub sim_vec: Vec<f64>,
    pub data_vec_pinned: Vec<f64>,
    pub sim_vec_pinned: Vec<f64>,
}

impl Roi {
    pub fn new(name: impl Into<String>, shape: RoiShape) -> Self {
        Self {
            name: name.into(),
            shape,
            z_range: None,
            index: None,
            data_vec: Vec::new(),
            sim_vec: Vec::new(),
            data_vec_pinned: Vec::new(),
            sim_vec_pinned: Vec::new(),
        }
    }

    pub fn index(&self) -> Option<&RoiIndex> {
        self.index.as_ref()
    }

    pub fn invalidate(&mut self) {
        self.index = None;
    }

    pub(crate) fn set_index(&mut self, mesh: MeshId, cells: Vec<usize>) {
        self.index = Some(RoiIndex { mesh, cells });
    }

    /// Cell indices for `mesh`, failing if they were computed for another mesh.
    pub fn mesh_idx(&self, mesh: &Mesh) -> Result<&[usize], IndexStaleError> {
        match &self.index {
            Some(idx) if idx.mesh == mesh.id => Ok(&idx.cells),
            other => Err(IndexStaleError {
                roi: self.name.clone(),
                computed_for: other.as_ref().map(|i| i.mesh),
                current: mesh.id,
            }),
        }
    }

    pub fn volume(&self, mesh: &Mesh) -> Result<f64, IndexStaleError> {
        Ok(self.mesh_idx(mesh)?.iter().map(|&i| mesh.cells[i].volume).sum())
    }

    /// Volume-weighted mean of a cell field over the ROI; NaN for an empty ROI.
    pub fn mean(&self, mesh: &Mesh, u: &[f64]) -> Result<f64, IndexStaleError> {
        let idx = self.mesh_idx(mesh)?;
        let (mut sum, mut vol) = (0.0, 0.0);
        for &i in idx {
            let v = mesh.cells[i].volume;
            sum += v * u[i];
            vol += v;
        }
        Ok(if vol > 0.0 { sum / vol } else { f64::NAN })
    }

    fn contains(&self, p: [f64; 3]) -> bool {
        let in_z = |band: Option<[f64; 2]>| band.map_or(true, |[lo, hi]| (lo..=hi).contains(&p[2]));
        in_z(self.z_range) && in_z(self.shape.z_band()) && self.shape.contains_xy(p[0], p[1])
    }

    /// Membership test of a primitive ROI against every cell centroid.
    fn primitive_cells(&self, mesh: &Mesh) -> Result<Vec<usize>, RoiError> {
        match &self.shape {
            RoiShape::Explicit { cells, .. } => {
                let mut cells = cells.clone();
                cells.sort_unstable();
                cells.dedup();
                if let Some(&bad) = cells.iter().find(|&&c| c >= mesh.num_cells()) {
                    return Err(RoiError::IndexOutOfRange {
                        roi: self.name.clone(),
                        index: bad,
                        cells: mesh.num_cells(),
                    });
                }
                Ok(cells)
            }
            RoiShape::All => Ok((0..mesh.num_cells()).collect()),
            shape => {
                let bbox = shape.bounding_box();
                Ok(mesh
                    .cells
                    .iter()
                    .filter(|c| {
                        let p = c.centroid;
                        bbox.map_or(true, |(lo, hi)| {
                            p[0] >= lo[0] && p[0] <= hi[0] && p[1] >= lo[1] && p[1] <= hi[1]
                        }) && self.contains(p)
                    })
                    .map(|c| c.id)
                    .collect())
            }
        }
    }
}

/// Ordered collection of ROIs with unique names.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoiSet {
    rois: Vec<Roi>,
}

impl RoiSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, roi: Roi) -> Result<&mut Roi, RoiError> {
        if self.rois.iter().any(|r| r.name == roi.name) {
            return Err(RoiError::DuplicateName(roi.name));
        }
        self.rois.push(roi);
        let last = self.rois.len() - 1;
        Ok(&mut self.rois[last])
    }

    pub fn remove(&mut self, name: &str) -> Result<Roi, RoiError> {
        let pos = self
            .rois
            .iter()
            .position(|r| r.name == name)
            .ok_or_else(|| RoiError::Unknown(name.into()))?;
        Ok(self.rois.remove(pos))
    }

    pub fn get(&self, name: &str) -> Result<&Roi, RoiError> {
        self.rois
            .iter()
            .find(|r| r.name == name)
            .ok_or_else(|| RoiError::Unknown(name.into()))
    }

    pub fn get_mut(&mut self, name: &str) -> Result<&mut Roi, RoiError> {
        self.rois
            .iter_mut()
            .find(|r| r.name == name)
            .ok_or_else(|| RoiError::Unknown(name.into()))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Roi> {
        self.rois.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Roi> {
        self.rois.iter_mut()
    }

    pub fn names(&self) -> Vec<&str> {
        self.rois.iter().map(|r| r.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.rois.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rois.is_empty()
    }

    pub fn invalidate_all(&mut self) {
        for r in &mut self.rois {
            r.invalidate();
        }
    }

    /// Recompute every ROI's index set against `mesh`: primitives by centroid
    /// membership, composites from the sets they reference.
    pub fn compute_roi_idxs(&mut self, mesh: &Mesh) -> Result<(), FrapError> {
        let mut memo: HashMap<String, Vec<usize>> = HashMap::new();
        for roi in &self.rois {
            if let RoiShape::Explicit { mesh: id, .. } = &roi.shape {
                if *id != mesh.id {
                    return Err(IndexStaleError {
                        roi: roi.name.clone(),
                        computed_for: Some(*id),
                        current: mesh.id,
                    }
                    .into());
                }
            }
            if !roi.shape.is_composite() {
                memo.insert(roi.name.clone(), roi.primitive_cells(mesh)?);
            }
        }
        let names: Vec<String> = self.rois.iter().map(|r| r.name.clone()).collect();
        for name in &names {
            let mut stack = Vec::new();
            self.resolve(name, mesh, &mut memo, &mut stack)?;
        }
        for roi in &mut self.rois {
            let cells = memo.remove(&roi.name).unwrap_or_default();
            if cells.is_empty() {
                warn!(roi = %roi.name, "ROI covers no mesh cells");
            }
            debug!(roi = %roi.name, cells = cells.len(), "computed ROI index set");
            roi.set_index(mesh.id, cells);
        }
        info!(rois = self.rois.len(), mesh = mesh.id.value(), "ROI indices up to date");
        Ok(())
    }

    fn resolve(
        &self,
        name: &str,
        mesh: &Mesh,
        memo: &mut HashMap<String, Vec<usize>>,
        stack: &mut Vec<String>,
    ) -> Result<Vec<usize>, RoiError> {
        if let Some(cells) = memo.get(name) {
            return Ok(cells.clone());
        }
        if stack.iter().any(|s| s == name) {
            return Err(RoiError::CompositeCycle(name.into()));
        }
        let roi = self.get(name)?;
        stack.push(name.into());
        let mut union = |names: &[String], memo: &mut HashMap<String, Vec<usize>>| {
            let mut set = BTreeSet::new();
            for n in names {
                set.extend(self.resolve(n, mesh, memo, stack)?);
            }
            Ok::<_, RoiError>(set)
        };
        let cells: Vec<usize> = match &roi.shape {
            RoiShape::Custom { add, subtract } => {
                let plus = union(add, &mut *memo)?;
                let minus = union(subtract, &mut *memo)?;
                plus.difference(&minus).copied().collect()
            }
            RoiShape::Complement { of } => {
                let covered = union(of, &mut *memo)?;
                (0..mesh.num_cells()).filter(|i| !covered.contains(i)).collect()
            }
            _ => roi.primitive_cells(mesh)?,
        };
        stack.pop();
        memo.insert(name.into(), cells.clone());
        Ok(cells)
    }

    /// Catch-all ROI covering the cells of no other ROI except `All`-type ones.
    /// Its index set is computed against `mesh`.
    pub fn optimal_all_roi(&self, mesh: &Mesh, name: &str) -> Result<Roi, FrapError> {
        let of: Vec<String> = self
            .rois
            .iter()
            .filter(|r| r.shape != RoiShape::All)
            .map(|r| r.name.clone())
            .collect();
        let mut covered = BTreeSet::new();
        for n in &of {
            covered.extend(self.get(n)?.mesh_idx(mesh)?.iter().copied());
        }
        let mut roi = Roi::new(name, RoiShape::Complement { of });
        roi.set_index(
            mesh.id,
            (0..mesh.num_cells()).filter(|i| !covered.contains(i)).collect(),
        );
        Ok(roi)
    }

    /// Map index sets computed for a source mesh of `merged` onto the merged
    /// mesh. Sets computed for any other mesh are invalidated. Explicit index
    /// lists of a source mesh are rewritten as well. Returns the number of
    /// translated ROIs.
    pub fn translate(&mut self, merged: &MergedMesh) -> usize {
        let mut translated = 0;
        for roi in &mut self.rois {
            if let RoiShape::Explicit { mesh, cells } = &mut roi.shape {
                let mapped: Option<Vec<usize>> =
                    cells.iter().map(|&c| merged.translate_cell(*mesh, c)).collect();
                if let Some(mapped) = mapped {
                    *cells = mapped;
                    *mesh = merged.mesh.id;
                }
            }
            let Some(idx) = roi.index.take() else {
                continue;
            };
            let cells: Option<Vec<usize>> = idx
                .cells
                .iter()
                .map(|&c| merged.translate_cell(idx.mesh, c))
                .collect();
            if let Some(cells) = cells {
                roi.set_index(merged.mesh.id, cells);
                translated += 1;
            }
        }
        translated
    }

    /// In-plane pixel mask of an ROI on `frame`. Explicit index lists have no
    /// image footprint and yield an empty mask.
    pub fn pixel_mask(&self, name: &str, frame: &ImageFrame) -> Result<DMatrix<bool>, RoiError> {
        let mut stack = Vec::new();
        self.pixel_mask_inner(name, frame, &mut stack)
    }

    fn pixel_mask_inner(
        &self,
        name: &str,
        frame: &ImageFrame,
        stack: &mut Vec<String>,
    ) -> Result<DMatrix<bool>, RoiError> {
        if stack.iter().any(|s| s == name) {
            return Err(RoiError::CompositeCycle(name.into()));
        }
        let roi = self.get(name)?;
        let (rows, cols) = frame.shape();
        stack.push(name.into());
        let mut combine = |names: &[String]| -> Result<DMatrix<bool>, RoiError> {
            let mut out = DMatrix::from_element(rows, cols, false);
            for n in names {
                let m = self.pixel_mask_inner(n, frame, stack)?;
                out.zip_apply(&m, |a, b| *a = *a || b);
            }
            Ok(out)
        };
        let mask = match &roi.shape {
            RoiShape::Custom { add, subtract } => {
                let mut plus = combine(add)?;
                let minus = combine(subtract)?;
                plus.zip_apply(&minus, |a, b| *a = *a && !b);
                plus
            }
            RoiShape::Complement { of } => combine(of)?.map(|b| !b),
            RoiShape::Explicit { .. } => DMatrix::from_element(rows, cols, false),
            shape => DMatrix::from_fn(rows, cols, |r, c| {
                let [x, y] = frame.transform.to_physical(r as f64, c as f64);
                shape.contains_xy(x, y)
            }),
        };
        stack.pop();
        Ok(mask)
    }

    /// Fill `data_vec` of the named ROIs with the mean masked intensity of
    /// each frame.
    pub fn extract_data(&mut self, names: &[&str], frames: &[ImageFrame]) -> Result<(), RoiError> {
        for name in names {
            let mut series = Vec::with_capacity(frames.len());
            for frame in frames {
                let mask = self.pixel_mask(name, frame)?;
                series.push(frame.masked_mean(&mask).unwrap_or(f64::NAN));
            }
            self.get_mut(name)?.data_vec = series;
        }
        Ok(())
    }

    /// 3D bounding box of an ROI's footprint, `None` when unbounded in-plane.
    pub fn footprint(&self, name: &str) -> Result<Option<([f64; 3], [f64; 3])>, RoiError> {
        let mut stack = Vec::new();
        self.footprint_inner(name, &mut stack)
    }

    fn footprint_inner(
        &self,
        name: &str,
        stack: &mut Vec<String>,
    ) -> Result<Option<([f64; 3], [f64; 3])>, RoiError> {
        if stack.iter().any(|s| s == name) {
            return Err(RoiError::CompositeCycle(name.into()));
        }
        let roi = self.get(name)?;
        let band = |r: &Roi| {
            let a = r.z_range.unwrap_or([f64::NEG_INFINITY, f64::INFINITY]);
            let b = r.shape.z_band().unwrap_or([f64::NEG_INFINITY, f64::INFINITY]);
            [a[0].max(b[0]), a[1].min(b[1])]
        };
        stack.push(name.into());
        let out = match &roi.shape {
            RoiShape::Custom { add, .. } => {
                let mut acc: Option<([f64; 3], [f64; 3])> = None;
                let mut unbounded = false;
                for n in add {
                    match self.footprint_inner(n, stack)? {
                        Some((lo, hi)) => {
                            acc = Some(match acc {
                                Some((alo, ahi)) => (
                                    [0, 1, 2].map(|i| alo[i].min(lo[i])),
                                    [0, 1, 2].map(|i| ahi[i].max(hi[i])),
                                ),
                                None => (lo, hi),
                            });
                        }
                        None => unbounded = true,
                    }
                }
                if unbounded {
                    None
                } else {
                    acc
                }
            }
            shape => shape.bounding_box().map(|(lo, hi)| {
                let [z0, z1] = band(roi);
                ([lo[0], lo[1], z0], [hi[0], hi[1], z1])
            }),
        };
        stack.pop();
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::mesh::tests::square_mesh;
    use crate::discretization::merge_meshes;

    fn set_on_unit_square() -> RoiSet {
        let mut set = RoiSet::new();
        set.add(Roi::new(ALL, RoiShape::All)).unwrap();
        set.add(Roi::new(
            "left",
            RoiShape::Rectangle {
                offset: [0.0, 0.0],
                size: [0.5, 1.0],
            },
        ))
        .unwrap();
        set.add(Roi::new(
            "disk",
            RoiShape::Radial {
                center: [0.5, 0.5],
                radius: 0.3,
            },
        ))
        .unwrap();
        set.add(Roi::new(
            "left minus disk",
            RoiShape::Custom {
                add: vec!["left".into()],
                subtract: vec!["disk".into()],
            },
        ))
        .unwrap();
        set
    }

    #[test]
    fn composites_are_set_differences() {
        let mesh = square_mesh(10, 1.0);
        let mut set = set_on_unit_square();
        set.compute_roi_idxs(&mesh).unwrap();
        let left: BTreeSet<_> = set.get("left").unwrap().mesh_idx(&mesh).unwrap().iter().copied().collect();
        let disk: BTreeSet<_> = set.get("disk").unwrap().mesh_idx(&mesh).unwrap().iter().copied().collect();
        let diff: BTreeSet<_> = set
            .get("left minus disk")
            .unwrap()
            .mesh_idx(&mesh)
            .unwrap()
            .iter()
            .copied()
            .collect();
        assert_eq!(diff, left.difference(&disk).copied().collect());
        assert_eq!(set.get(ALL).unwrap().mesh_idx(&mesh).unwrap().len(), 200);
    }

    #[test]
    fn stale_indices_are_rejected() {
        let mesh = square_mesh(4, 1.0);
        let other = square_mesh(4, 1.0);
        let mut set = set_on_unit_square();
        set.compute_roi_idxs(&mesh).unwrap();
        let err = set.get("left").unwrap().mesh_idx(&other).unwrap_err();
        assert_eq!(err.computed_for, Some(mesh.id));
        assert_eq!(err.current, other.id);
    }

    #[test]
    fn cycles_are_detected() {
        let mesh = square_mesh(2, 1.0);
        let mut set = RoiSet::new();
        set.add(Roi::new("a", RoiShape::Complement { of: vec!["b".into()] }))
            .unwrap();
        set.add(Roi::new(
            "b",
            RoiShape::Custom {
                add: vec!["a".into()],
                subtract: vec![],
            },
        ))
        .unwrap();
        assert!(matches!(
            set.compute_roi_idxs(&mesh),
            Err(FrapError::Roi(RoiError::CompositeCycle(_)))
        ));
    }

    #[test]
    fn optimal_all_is_complement_of_union() {
        let mesh = square_mesh(10, 1.0);
        let mut set = set_on_unit_square();
        set.compute_roi_idxs(&mesh).unwrap();
        let rest = set.optimal_all_roi(&mesh, "rest").unwrap();
        let rest_idx = rest.mesh_idx(&mesh).unwrap();
        for name in ["left", "disk"] {
            let idx = set.get(name).unwrap().mesh_idx(&mesh).unwrap();
            assert!(idx.iter().all(|i| !rest_idx.contains(i)));
        }
        let covered = set.get("left").unwrap().mesh_idx(&mesh).unwrap().len()
            + set.get("disk").unwrap().mesh_idx(&mesh).unwrap().len();
        assert!(rest_idx.len() + covered >= mesh.num_cells());
    }

    #[test]
    fn translation_through_merge() {
        let a = square_mesh(2, 1.0);
        let b = square_mesh(2, 1.0);
        let mut set = RoiSet::new();
        set.add(Roi::new(
            "explicit",
            RoiShape::Explicit {
                mesh: b.id,
                cells: vec![0, 3],
            },
        ))
        .unwrap();
        set.compute_roi_idxs(&b).unwrap();
        let merged = merge_meshes(&[&a, &b], false).unwrap();
        assert_eq!(set.translate(&merged), 1);
        assert_eq!(
            set.get("explicit").unwrap().mesh_idx(&merged.mesh).unwrap(),
            &[a.num_cells(), a.num_cells() + 3]
        );
    }

    #[test]
    fn explicit_roi_out_of_range() {
        let mesh = square_mesh(1, 1.0);
        let mut set = RoiSet::new();
        set.add(Roi::new(
            "bad",
            RoiShape::Explicit {
                mesh: mesh.id,
                cells: vec![5],
            },
        ))
        .unwrap();
        assert!(matches!(
            set.compute_roi_idxs(&mesh),
            Err(FrapError::Roi(RoiError::IndexOutOfRange { index: 5, .. }))
        ));
    }

    #[test]
    fn pixel_mask_of_custom_roi() {
        let frame = ImageFrame::from_fn(10, 10, PixelTransform::default(), |_, _| 1.0);
        let mut set = set_on_unit_square();
        set.add(Roi::new(
            "big",
            RoiShape::Square {
                offset: [2.0, 2.0],
                side: 4.0,
            },
        ))
        .unwrap();
        set.add(Roi::new(
            "ring",
            RoiShape::Custom {
                add: vec!["big".into()],
                subtract: vec!["small".into()],
            },
        ))
        .unwrap();
        set.add(Roi::new(
            "small",
            RoiShape::Square {
                offset: [3.0, 3.0],
                side: 2.0,
            },
        ))
        .unwrap();
        let mask = set.pixel_mask("ring", &frame).unwrap();
        assert_eq!(mask.iter().filter(|b| **b).count(), 25 - 9);
    }
}
