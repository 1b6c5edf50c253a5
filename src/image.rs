//! Image frames as handed over by an image-I/O collaborator: a pixel array plus
//! the transform from pixel indices to mesh coordinates.

use nalgebra::DMatrix;
use serde::{Deserialize, Serialize};

/// Pixel `(row, col)` sits at `offset + resolution * (col, row)`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PixelTransform {
    /// Length of one pixel in mesh units.
    pub resolution: f64,
    pub offset: [f64; 2],
}

impl Default for PixelTransform {
    fn default() -> Self {
        Self {
            resolution: 1.0,
            offset: [0.0; 2],
        }
    }
}

impl PixelTransform {
    pub fn to_physical(&self, row: f64, col: f64) -> [f64; 2] {
        [
            self.offset[0] + self.resolution * col,
            self.offset[1] + self.resolution * row,
        ]
    }

    /// Fractional `(row, col)` of a point.
    pub fn to_pixel(&self, x: f64, y: f64) -> [f64; 2] {
        [
            (y - self.offset[1]) / self.resolution,
            (x - self.offset[0]) / self.resolution,
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageFrame {
    pub data: DMatrix<f64>,
    pub transform: PixelTransform,
}

impl ImageFrame {
    pub fn new(data: DMatrix<f64>, transform: PixelTransform) -> Self {
        Self { data, transform }
    }

    pub fn from_fn(
        rows: usize,
        cols: usize,
        transform: PixelTransform,
        f: impl Fn(f64, f64) -> f64,
    ) -> Self {
        let data = DMatrix::from_fn(rows, cols, |r, c| {
            let [x, y] = transform.to_physical(r as f64, c as f64);
            f(x, y)
        });
        Self { data, transform }
    }

    pub fn shape(&self) -> (usize, usize) {
        self.data.shape()
    }

    /// Bilinear interpolation, clamped to the nearest edge pixel outside the image.
    pub fn sample(&self, x: f64, y: f64) -> f64 {
        let (rows, cols) = self.data.shape();
        if rows == 0 || cols == 0 {
            return 0.0;
        }
        let [r, c] = self.transform.to_pixel(x, y);
        let r = r.clamp(0.0, (rows - 1) as f64);
        let c = c.clamp(0.0, (cols - 1) as f64);
        let (r0, c0) = (r.floor() as usize, c.floor() as usize);
        let (r1, c1) = ((r0 + 1).min(rows - 1), (c0 + 1).min(cols - 1));
        let (fr, fc) = (r - r0 as f64, c - c0 as f64);
        let top = self.data[(r0, c0)] * (1.0 - fc) + self.data[(r0, c1)] * fc;
        let bottom = self.data[(r1, c0)] * (1.0 - fc) + self.data[(r1, c1)] * fc;
        top * (1.0 - fr) + bottom * fr
    }

    /// Physical centers of all pixels with the mask set, with their values.
    pub fn masked_pixels<'a>(
        &'a self,
        mask: &'a DMatrix<bool>,
    ) -> impl Iterator<Item = ([f64; 2], f64)> + 'a {
        let (rows, cols) = self.data.shape();
        (0..cols).flat_map(move |c| {
            (0..rows).filter_map(move |r| {
                mask.get((r, c))
                    .copied()
                    .unwrap_or(false)
                    .then(|| (self.transform.to_physical(r as f64, c as f64), self.data[(r, c)]))
            })
        })
    }

    /// Mean intensity over masked pixels, `None` for an empty mask.
    pub fn masked_mean(&self, mask: &DMatrix<bool>) -> Option<f64> {
        let (sum, n) = self
            .masked_pixels(mask)
            .fold((0.0, 0usize), |(s, n), (_, v)| (s + v, n + 1));
        (n > 0).then(|| sum / n as f64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn bilinear_reproduces_linear_fields() {
        let t = PixelTransform {
            resolution: 0.5,
            offset: [1.0, -1.0],
        };
        let img = ImageFrame::from_fn(10, 12, t, |x, y| 2.0 * x - y + 3.0);
        assert_relative_eq!(img.sample(2.3, 0.7), 2.0 * 2.3 - 0.7 + 3.0, epsilon = 1e-12);
        // Clamped outside.
        assert_relative_eq!(img.sample(-50.0, -1.0), img.data[(0, 0)]);
    }

    #[test]
    fn masked_mean_of_constant_image() {
        let img = ImageFrame::from_fn(4, 4, PixelTransform::default(), |_, _| 7.0);
        let mut mask = DMatrix::from_element(4, 4, false);
        mask[(1, 2)] = true;
        mask[(3, 3)] = true;
        assert_eq!(img.masked_mean(&mask), Some(7.0));
        assert_eq!(img.masked_mean(&DMatrix::from_element(4, 4, false)), None);
    }
}
