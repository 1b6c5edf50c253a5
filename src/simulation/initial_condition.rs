use nalgebra::DVector;
use serde::{Deserialize, Serialize};

use crate::discretization::Mesh;
use crate::error::SimulationError;
use crate::image::ImageFrame;
use crate::roi::RoiSet;

/// How the initial concentration is assigned to mesh cells.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum IcMode {
    /// `val_in` on the cells of `bleached_roi`, `val_out` everywhere else.
    Ideal {
        bleached_roi: String,
        val_in: f64,
        val_out: f64,
    },
    /// Area-weighted samples of an image frame.
    Image { frame: ImageFrame },
}

/// Weight of the centroid sample; the rest is shared by the centroid-node midpoints.
const CENTROID_WEIGHT: f64 = 0.25;

pub(crate) fn ideal(
    mesh: &Mesh,
    rois: &RoiSet,
    bleached_roi: &str,
    val_in: f64,
    val_out: f64,
) -> Result<DVector<f64>, SimulationError> {
    let idx = rois.get(bleached_roi)?.mesh_idx(mesh)?;
    let mut ic = DVector::from_element(mesh.num_cells(), val_out);
    for &i in idx {
        ic[i] = val_in;
    }
    Ok(ic)
}

/// Cell averages of `frame`, each estimated from the centroid and the midpoints
/// between centroid and nodes.
pub(crate) fn from_image(mesh: &Mesh, frame: &ImageFrame) -> DVector<f64> {
    DVector::from_iterator(
        mesh.num_cells(),
        mesh.cells.iter().map(|cell| {
            let c = cell.centroid;
            let n = cell.node_ids.len() as f64;
            let rest: f64 = cell
                .node_ids
                .iter()
                .map(|&id| {
                    let p = mesh.nodes[id].position;
                    frame.sample(0.5 * (c[0] + p[0]), 0.5 * (c[1] + p[1]))
                })
                .sum();
            CENTROID_WEIGHT * frame.sample(c[0], c[1]) + (1.0 - CENTROID_WEIGHT) * rest / n
        }),
    )
}

/// Largest relative deviation, over ROIs with an image footprint, between the
/// image-space ROI mean and the volume-weighted mesh mean of `ic`.
pub(crate) fn interpolation_error(
    mesh: &Mesh,
    rois: &RoiSet,
    frame: &ImageFrame,
    ic: &DVector<f64>,
) -> Result<Option<f64>, SimulationError> {
    let mut worst: Option<f64> = None;
    for roi in rois.iter() {
        let mask = rois.pixel_mask(&roi.name, frame)?;
        let Some(img_mean) = frame.masked_mean(&mask) else {
            continue;
        };
        if roi.mesh_idx(mesh)?.is_empty() {
            continue;
        }
        let mesh_mean = roi.mean(mesh, ic.as_slice())?;
        let scale = if img_mean.abs() > f64::EPSILON {
            img_mean.abs()
        } else {
            1.0
        };
        let err = (mesh_mean - img_mean).abs() / scale;
        worst = Some(worst.map_or(err, |w: f64| w.max(err)));
    }
    Ok(worst)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::discretization::mesh::tests::square_mesh;
    use crate::image::PixelTransform;
    use crate::roi::{Roi, RoiShape};
    use approx::assert_relative_eq;

    #[test]
    fn linear_image_is_reproduced_exactly() {
        let mesh = square_mesh(5, 10.0);
        let frame = ImageFrame::from_fn(12, 12, PixelTransform::default(), |x, y| x + 2.0 * y);
        let ic = from_image(&mesh, &frame);
        for (cell, v) in mesh.cells.iter().zip(ic.iter()) {
            assert_relative_eq!(*v, cell.centroid[0] + 2.0 * cell.centroid[1], epsilon = 1e-9);
        }
    }

    #[test]
    fn interpolation_error_of_constant_image_vanishes() {
        let mesh = square_mesh(4, 8.0);
        let frame = ImageFrame::from_fn(9, 9, PixelTransform::default(), |_, _| 3.0);
        let mut rois = RoiSet::new();
        rois.add(Roi::new(
            "sq",
            RoiShape::Square {
                offset: [2.0, 2.0],
                side: 4.0,
            },
        ))
        .unwrap();
        rois.compute_roi_idxs(&mesh).unwrap();
        let ic = from_image(&mesh, &frame);
        let err = interpolation_error(&mesh, &rois, &frame, &ic).unwrap().unwrap();
        assert!(err < 1e-12);
    }
}
