use crate::error::FitError;
use crate::roi::RoiSet;

/// Reference values of a pinned series: `bkgd` maps to 0, `norm` to 1.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PinValues {
    pub bkgd: f64,
    pub norm: f64,
}

impl PinValues {
    /// `bkgd` is the first sample of the background ROI (the bleached level),
    /// `norm` the last sample of the normalization ROI (the recovery plateau).
    pub fn from_series(bkgd_series: &[f64], norm_series: &[f64]) -> Result<Self, FitError> {
        let bkgd = *bkgd_series
            .first()
            .ok_or_else(|| FitError::MissingData("empty background series".into()))?;
        let norm = *norm_series
            .last()
            .ok_or_else(|| FitError::MissingData("empty normalization series".into()))?;
        if (norm - bkgd).abs() <= f64::EPSILON * norm.abs().max(bkgd.abs()).max(1.0) {
            return Err(FitError::DegeneratePinning { bkgd, norm });
        }
        Ok(Self { bkgd, norm })
    }

    pub fn apply(&self, series: &[f64]) -> Vec<f64> {
        series
            .iter()
            .map(|x| (x - self.bkgd) / (self.norm - self.bkgd))
            .collect()
    }
}

/// Which buffers to pin.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Series {
    Data,
    Simulation,
}

/// Fill `data_vec_pinned` or `sim_vec_pinned` of every ROI that has samples,
/// using reference values from the `bkgd_roi` and `norm_roi` series.
pub fn pin_rois(
    rois: &mut RoiSet,
    which: Series,
    bkgd_roi: &str,
    norm_roi: &str,
) -> Result<PinValues, FitError> {
    let pick = |name: &str| -> Result<Vec<f64>, FitError> {
        let roi = rois.get(name)?;
        Ok(match which {
            Series::Data => roi.data_vec.clone(),
            Series::Simulation => roi.sim_vec.clone(),
        })
    };
    let pins = PinValues::from_series(&pick(bkgd_roi)?, &pick(norm_roi)?)?;
    for roi in rois.iter_mut() {
        match which {
            Series::Data => roi.data_vec_pinned = pins.apply(&roi.data_vec),
            Series::Simulation => roi.sim_vec_pinned = pins.apply(&roi.sim_vec),
        }
    }
    Ok(pins)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roi::{Roi, RoiShape};
    use approx::assert_relative_eq;

    #[test]
    fn pinned_series_spans_unit_interval() {
        let pins = PinValues::from_series(&[0.2, 0.5], &[0.9, 1.0]).unwrap();
        let p = pins.apply(&[0.2, 0.6, 1.0]);
        assert_relative_eq!(p[0], 0.0);
        assert_relative_eq!(p[1], 0.5);
        assert_relative_eq!(p[2], 1.0);
    }

    #[test]
    fn flat_references_are_rejected() {
        assert!(matches!(
            PinValues::from_series(&[1.0], &[1.0]),
            Err(FitError::DegeneratePinning { .. })
        ));
        assert!(matches!(
            PinValues::from_series(&[], &[1.0]),
            Err(FitError::MissingData(_))
        ));
    }

    #[test]
    fn pins_every_roi_with_shared_references() {
        let mut rois = RoiSet::new();
        rois.add(Roi::new("b", RoiShape::All)).unwrap().sim_vec = vec![2.0, 3.0];
        rois.add(Roi::new("n", RoiShape::All)).unwrap().sim_vec = vec![5.0, 4.0];
        let pins = pin_rois(&mut rois, Series::Simulation, "b", "n").unwrap();
        assert_eq!(pins, PinValues { bkgd: 2.0, norm: 4.0 });
        assert_eq!(rois.get("n").unwrap().sim_vec_pinned, vec![1.5, 1.0]);
        assert!(rois.get("b").unwrap().data_vec_pinned.is_empty());
    }
}
