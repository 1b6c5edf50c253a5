use serde::{Deserialize, Serialize};

use super::Domain;
use crate::error::GeometryError;

/// Entities created by [`Domain::add_circle_by_parameters`]. Vertices and arcs
/// are ordered right, top, left, bottom; arc `i` runs from vertex `i` to `i + 1`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircleIds {
    pub center: u32,
    pub vertices: [u32; 4],
    pub arcs: [u32; 4],
    pub line_loop: Option<u32>,
    pub surface: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CylinderIds {
    pub bottom: CircleIds,
    pub top: CircleIds,
    /// Vertical lines from bottom vertex `i` to top vertex `i`.
    pub lines: [u32; 4],
    pub side_loops: Vec<u32>,
    pub side_surfaces: Vec<u32>,
    pub surface_loop: Option<u32>,
    pub volume: Option<u32>,
}

impl Domain {
    /// Circle of `radius` around `center` in the plane `z`. Construction order is
    /// deterministic: center, then right, top, left, bottom vertices, then arcs.
    /// A surface implies a loop. The surface normal points to `+z`.
    pub fn add_circle_by_parameters(
        &mut self,
        center: [f64; 2],
        radius: f64,
        z: f64,
        vol_size: f64,
        gen_loop: bool,
        gen_surface: bool,
    ) -> Result<CircleIds, GeometryError> {
        if !(radius > 0.0 && radius.is_finite()) {
            return Err(GeometryError::InvalidParameter(format!(
                "circle radius must be positive, got {radius}"
            )));
        }
        let snapshot = self.clone();
        let result = self.circle_inner(center, radius, z, vol_size, gen_loop || gen_surface, gen_surface);
        if result.is_err() {
            *self = snapshot;
        }
        result
    }

    fn circle_inner(
        &mut self,
        center: [f64; 2],
        radius: f64,
        z: f64,
        vol_size: f64,
        gen_loop: bool,
        gen_surface: bool,
    ) -> Result<CircleIds, GeometryError> {
        let [cx, cy] = center;
        let c = self.add_vertex([cx, cy, z], vol_size);
        let offsets = [(radius, 0.0), (0.0, radius), (-radius, 0.0), (0.0, -radius)];
        let vertices = offsets.map(|(dx, dy)| self.add_vertex([cx + dx, cy + dy, z], vol_size));

        let mut arcs = [0u32; 4];
        for i in 0..4 {
            arcs[i] = self.add_arc(vertices[i], c, vertices[(i + 1) % 4])?;
        }

        let line_loop = if gen_loop {
            Some(self.add_line_loop(&arcs.map(|a| a as i64))?)
        } else {
            None
        };
        let surface = match (gen_surface, line_loop) {
            (true, Some(l)) => Some(self.add_ruled_surface(l)?),
            _ => None,
        };

        Ok(CircleIds {
            center: c,
            vertices,
            arcs,
            line_loop,
            surface,
        })
    }

    /// Cylinder of `radius` from `z` to `z + height`. See [`Domain::add_cone_by_parameters`].
    #[allow(clippy::too_many_arguments)]
    pub fn add_cylinder_by_parameters(
        &mut self,
        center: [f64; 2],
        radius: f64,
        z: f64,
        height: f64,
        vol_size: f64,
        gen_loops: bool,
        gen_surfaces: bool,
        gen_volume: bool,
    ) -> Result<CylinderIds, GeometryError> {
        self.add_cone_by_parameters(
            center, radius, radius, z, height, vol_size, gen_loops, gen_surfaces, gen_volume,
        )
    }

    /// Truncated cone with radius `lower_radius` at `z` and `upper_radius` at
    /// `z + height`. Surfaces imply loops, a volume implies surfaces. All surface
    /// normals point outward. The domain is unchanged on error.
    #[allow(clippy::too_many_arguments)]
    pub fn add_cone_by_parameters(
        &mut self,
        center: [f64; 2],
        upper_radius: f64,
        lower_radius: f64,
        z: f64,
        height: f64,
        vol_size: f64,
        gen_loops: bool,
        gen_surfaces: bool,
        gen_volume: bool,
    ) -> Result<CylinderIds, GeometryError> {
        if !(height > 0.0 && height.is_finite()) {
            return Err(GeometryError::InvalidParameter(format!(
                "height must be positive, got {height}"
            )));
        }
        let gen_surfaces = gen_surfaces || gen_volume;
        let gen_loops = gen_loops || gen_surfaces;

        let snapshot = self.clone();
        let result = self.cone_inner(
            center,
            upper_radius,
            lower_radius,
            z,
            height,
            vol_size,
            gen_loops,
            gen_surfaces,
            gen_volume,
        );
        if result.is_err() {
            *self = snapshot;
        }
        result
    }

    #[allow(clippy::too_many_arguments)]
    fn cone_inner(
        &mut self,
        center: [f64; 2],
        upper_radius: f64,
        lower_radius: f64,
        z: f64,
        height: f64,
        vol_size: f64,
        gen_loops: bool,
        gen_surfaces: bool,
        gen_volume: bool,
    ) -> Result<CylinderIds, GeometryError> {
        let mut bottom = self.add_circle_by_parameters(center, lower_radius, z, vol_size, false, false)?;
        let mut top =
            self.add_circle_by_parameters(center, upper_radius, z + height, vol_size, false, false)?;

        let mut lines = [0u32; 4];
        for i in 0..4 {
            lines[i] = self.add_line(bottom.vertices[i], top.vertices[i])?;
        }

        let mut side_loops = Vec::new();
        let mut side_surfaces = Vec::new();
        let mut surface_loop = None;
        let mut volume = None;

        if gen_loops {
            // Bottom is traversed clockwise seen from +z so its normal faces down.
            let bottom_edges: Vec<i64> = bottom.arcs.iter().rev().map(|a| -(*a as i64)).collect();
            bottom.line_loop = Some(self.add_line_loop_with_id(None, &bottom_edges)?);
            top.line_loop = Some(self.add_line_loop_with_id(None, &top.arcs.map(|a| a as i64))?);
            for i in 0..4 {
                let edges = [
                    bottom.arcs[i] as i64,
                    lines[(i + 1) % 4] as i64,
                    -(top.arcs[i] as i64),
                    -(lines[i] as i64),
                ];
                side_loops.push(self.add_line_loop_with_id(None, &edges)?);
            }
        }

        if gen_surfaces {
            if let (Some(lb), Some(lt)) = (bottom.line_loop, top.line_loop) {
                bottom.surface = Some(self.add_ruled_surface(lb)?);
                top.surface = Some(self.add_ruled_surface(lt)?);
            }
            let interior = [center[0], center[1], z + 0.5 * height];
            for &l in &side_loops {
                let s = self.add_ruled_surface(l)?;
                self.orient_outward(s, interior)?;
                side_surfaces.push(s);
            }
        }

        if gen_volume {
            let mut all: Vec<u32> = bottom.surface.into_iter().chain(top.surface).collect();
            all.extend(&side_surfaces);
            let sl = self.add_surface_loop(&all)?;
            surface_loop = Some(sl);
            volume = Some(self.add_volume(sl)?);
        }

        Ok(CylinderIds {
            bottom,
            top,
            lines,
            side_loops,
            side_surfaces,
            surface_loop,
            volume,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geometry::LengthUnit;
    use approx::assert_relative_eq;

    #[test]
    fn identical_circles_get_identical_id_sequences() {
        let mut d1 = Domain::new(LengthUnit::Pixel);
        let mut d2 = Domain::new(LengthUnit::Pixel);
        let a = d1
            .add_circle_by_parameters([256.0, 256.0], 300.0, 0.0, 30.0, true, true)
            .unwrap();
        let b = d2
            .add_circle_by_parameters([256.0, 256.0], 300.0, 0.0, 30.0, true, true)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(a.vertices, [2, 3, 4, 5]);
        assert_relative_eq!(d1.surface(a.surface.unwrap()).unwrap().normal[2], 1.0);
    }

    #[test]
    fn cylinder_normals_point_outward() {
        let mut d = Domain::new(LengthUnit::Micron);
        let cyl = d
            .add_cylinder_by_parameters([0.0, 0.0], 2.0, -1.0, 2.0, 0.5, true, true, true)
            .unwrap();
        assert_eq!(d.dimension(), 3);
        assert_relative_eq!(d.surface(cyl.bottom.surface.unwrap()).unwrap().normal[2], -1.0);
        assert_relative_eq!(d.surface(cyl.top.surface.unwrap()).unwrap().normal[2], 1.0);
        for &s in &cyl.side_surfaces {
            let n = d.surface(s).unwrap().normal;
            assert!(n[2].abs() < 1e-9);
            let l = d.line_loop(d.surface(s).unwrap().line_loop).unwrap();
            let (start, _) = d.oriented_endpoints(l.edges[0]).unwrap();
            let p = d.vertex(start).unwrap().x;
            // Outward: away from the axis.
            assert!(n[0] * p[0] + n[1] * p[1] > -1e-9);
        }
    }

    #[test]
    fn degenerate_cone_leaves_domain_unchanged() {
        let mut d = Domain::new(LengthUnit::Pixel);
        let before = d.clone();
        assert!(d
            .add_cone_by_parameters([0.0, 0.0], 0.0, 1.0, 0.0, 1.0, 0.1, true, true, true)
            .is_err());
        assert_eq!(d, before);
    }
}
