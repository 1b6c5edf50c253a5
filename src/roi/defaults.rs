use serde::{Deserialize, Serialize};

use super::{Roi, RoiSet, RoiShape, ALL, BLEACHED_SQUARE, CIRCLE, RIM, SLICE};
use crate::error::RoiError;

/// Parameters of the standard FRAP ROI layout: a bleached square centered in a
/// circular sample, an inner circle of `rim_factor * radius` and the rim
/// between circle and sample boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DefaultRoiParams {
    pub center: [f64; 2],
    pub radius: f64,
    pub rim_factor: f64,
    pub square_side: f64,
    pub slice_height: f64,
    /// `None` makes the slice cover every z.
    pub slice_width: Option<f64>,
}

impl Default for DefaultRoiParams {
    fn default() -> Self {
        Self {
            center: [256.0, 256.0],
            radius: 300.0,
            rim_factor: 0.8,
            square_side: 140.0,
            slice_height: 0.0,
            slice_width: None,
        }
    }
}

impl RoiSet {
    /// Add `All`, `Slice`, `Bleached Square`, `Circle` and `Rim`. The square
    /// is restricted to the slice band so that the slice always contains it.
    pub fn add_default_rois(&mut self, p: &DefaultRoiParams) -> Result<(), RoiError> {
        let half = p.square_side / 2.0;
        let band = p
            .slice_width
            .map(|w| [p.slice_height - w / 2.0, p.slice_height + w / 2.0]);

        self.add(Roi::new(ALL, RoiShape::All))?;
        self.add(Roi::new(
            SLICE,
            RoiShape::Slice {
                height: p.slice_height,
                width: p.slice_width,
            },
        ))?;
        let square = self.add(Roi::new(
            BLEACHED_SQUARE,
            RoiShape::Square {
                offset: [p.center[0] - half, p.center[1] - half],
                side: p.square_side,
            },
        ))?;
        square.z_range = band;
        let circle = self.add(Roi::new(
            CIRCLE,
            RoiShape::Radial {
                center: p.center,
                radius: p.rim_factor * p.radius,
            },
        ))?;
        circle.z_range = band;
        self.add(Roi::new(
            RIM,
            RoiShape::Custom {
                add: vec![SLICE.into()],
                subtract: vec![CIRCLE.into()],
            },
        ))?;
        Ok(())
    }
}
