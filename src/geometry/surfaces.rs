use std::collections::BTreeSet;

use nalgebra::Vector3;
use tracing::debug;

use super::{id_after, Domain, LineLoop, RuledSurface, SurfaceLoop, Volume};
use crate::error::GeometryError;

/// Arc subdivision used when a loop is turned into a polygon for normals.
const NORMAL_ARC_SEGMENTS: usize = 8;

/// Newell's method: area-weighted normal of a closed, possibly non-planar polygon.
/// Returns the unnormalized vector; its norm is twice the projected area.
pub fn newell_normal(points: &[[f64; 3]]) -> Vector3<f64> {
    let mut n = Vector3::zeros();
    for (i, p) in points.iter().enumerate() {
        let q = points[(i + 1) % points.len()];
        n.x += (p[1] - q[1]) * (p[2] + q[2]);
        n.y += (p[2] - q[2]) * (p[0] + q[0]);
        n.z += (p[0] - q[0]) * (p[1] + q[1]);
    }
    n
}

fn reversed(edges: &[i64]) -> Vec<i64> {
    edges.iter().rev().map(|e| -e).collect()
}

impl Domain {
    /// Verify that consecutive signed edges connect and that the loop closes.
    fn check_closed(&self, edges: &[i64]) -> Result<(), GeometryError> {
        for (i, &e) in edges.iter().enumerate() {
            let next = edges[(i + 1) % edges.len()];
            let (_, end) = self.oriented_endpoints(e)?;
            let (start, _) = self.oriented_endpoints(next)?;
            if end != start {
                return Err(GeometryError::OpenLoop { edge: e, next });
            }
        }
        Ok(())
    }

    /// Orient every edge after the first so that it starts where its predecessor ends.
    fn orient_chain(&self, edges: &[i64]) -> Result<Vec<i64>, GeometryError> {
        let mut out = Vec::with_capacity(edges.len());
        for (i, &e) in edges.iter().enumerate() {
            if i == 0 {
                out.push(e);
                continue;
            }
            let prev = out[i - 1];
            let (_, prev_end) = self.oriented_endpoints(prev)?;
            let (s, _) = self.oriented_endpoints(e)?;
            let (s_flipped, _) = self.oriented_endpoints(-e)?;
            if s == prev_end {
                out.push(e);
            } else if s_flipped == prev_end {
                out.push(-e);
            } else {
                return Err(GeometryError::OpenLoop { edge: prev, next: e });
            }
        }
        Ok(out)
    }

    /// Closed loop over existing edges. Edge signs are corrected where the given
    /// orientation does not connect; the first edge fixes the loop direction.
    pub fn add_line_loop(&mut self, edges: &[i64]) -> Result<u32, GeometryError> {
        if edges.is_empty() {
            return Err(GeometryError::InvalidParameter("empty line loop".into()));
        }
        let oriented = self.orient_chain(edges)?;
        self.insert_line_loop(None, oriented)
    }

    /// Insert a loop exactly as given, only validating closure.
    pub fn add_line_loop_with_id(
        &mut self,
        id: Option<u32>,
        edges: &[i64],
    ) -> Result<u32, GeometryError> {
        self.insert_line_loop(id, edges.to_vec())
    }

    fn insert_line_loop(&mut self, id: Option<u32>, edges: Vec<i64>) -> Result<u32, GeometryError> {
        let id = match id {
            Some(id) if self.line_loops.contains_key(&id) => {
                return Err(GeometryError::DuplicateId {
                    kind: "line loop",
                    id,
                })
            }
            Some(id) => id,
            None => self.next.line_loop,
        };
        if edges.is_empty() {
            return Err(GeometryError::InvalidParameter("empty line loop".into()));
        }
        self.check_closed(&edges)?;
        let next = id_after("line loop", id)?;
        self.line_loops.insert(id, LineLoop { id, edges });
        self.next.line_loop = self.next.line_loop.max(next);
        Ok(id)
    }

    /// Ordered boundary polygon of a signed edge sequence; each edge contributes
    /// its samples without the closing point.
    pub fn edges_polygon(
        &self,
        edges: &[i64],
        segments: impl Fn(u32) -> usize,
    ) -> Result<Vec<[f64; 3]>, GeometryError> {
        let mut pts = Vec::new();
        for &e in edges {
            let id = e.unsigned_abs() as u32;
            let mut s = self.sample_edge(id, segments(id))?;
            if e < 0 {
                s.reverse();
            }
            s.pop();
            pts.extend(s);
        }
        Ok(pts)
    }

    fn loop_normal(&self, edges: &[i64]) -> Result<Vector3<f64>, GeometryError> {
        let poly = self.edges_polygon(edges, |_| NORMAL_ARC_SEGMENTS)?;
        Ok(newell_normal(&poly))
    }

    fn checked_normal(&self, line_loop: u32) -> Result<[f64; 3], GeometryError> {
        let l = self.line_loop(line_loop)?;
        let n = self.loop_normal(&l.edges)?;
        let scale = self
            .bounding_box()
            .map(|(lo, hi)| super::dist(lo, hi))
            .unwrap_or(1.0)
            .max(f64::MIN_POSITIVE);
        if n.norm() <= 1e-12 * scale * scale {
            return Err(GeometryError::DegenerateSurface { line_loop });
        }
        Ok(n.normalize().into())
    }

    /// Surface bounded by a line loop. The normal follows the loop orientation.
    pub fn add_ruled_surface(&mut self, line_loop: u32) -> Result<u32, GeometryError> {
        self.add_ruled_surface_with_id(None, line_loop)
    }

    pub fn add_ruled_surface_with_id(
        &mut self,
        id: Option<u32>,
        line_loop: u32,
    ) -> Result<u32, GeometryError> {
        let id = match id {
            Some(id) if self.surfaces.contains_key(&id) => {
                return Err(GeometryError::DuplicateId {
                    kind: "surface",
                    id,
                })
            }
            Some(id) => id,
            None => self.next.surface,
        };
        let normal = self.checked_normal(line_loop)?;
        let next = id_after("surface", id)?;
        self.surfaces.insert(
            id,
            RuledSurface {
                id,
                line_loop,
                normal,
            },
        );
        self.next.surface = self.next.surface.max(next);
        Ok(id)
    }

    /// Reverse the orientation of a surface's loop, flipping its normal.
    pub fn flip_surface(&mut self, surface: u32) -> Result<(), GeometryError> {
        let loop_id = self.surface(surface)?.line_loop;
        let edges = reversed(&self.line_loop(loop_id)?.edges);
        if let Some(l) = self.line_loops.get_mut(&loop_id) {
            l.edges = edges;
        }
        if let Some(s) = self.surfaces.get_mut(&surface) {
            s.normal = s.normal.map(|c| -c);
        }
        Ok(())
    }

    /// Make the normal of `surface` point away from `interior`.
    pub fn orient_outward(&mut self, surface: u32, interior: [f64; 3]) -> Result<(), GeometryError> {
        let s = self.surface(surface)?;
        let poly = self.edges_polygon(&self.line_loop(s.line_loop)?.edges, |_| 1)?;
        let n = poly.len() as f64;
        let centroid = poly.iter().fold(Vector3::zeros(), |acc, p| acc + Vector3::from(*p)) / n;
        let outward = centroid - Vector3::from(interior);
        if Vector3::from(s.normal).dot(&outward) < 0.0 {
            self.flip_surface(surface)?;
        }
        Ok(())
    }

    pub fn add_surface_loop(&mut self, surfaces: &[u32]) -> Result<u32, GeometryError> {
        self.add_surface_loop_with_id(None, surfaces)
    }

    pub fn add_surface_loop_with_id(
        &mut self,
        id: Option<u32>,
        surfaces: &[u32],
    ) -> Result<u32, GeometryError> {
        let id = match id {
            Some(id) if self.surface_loops.contains_key(&id) => {
                return Err(GeometryError::DuplicateId {
                    kind: "surface loop",
                    id,
                })
            }
            Some(id) => id,
            None => self.next.surface_loop,
        };
        for &s in surfaces {
            self.surface(s)?;
        }
        let next = id_after("surface loop", id)?;
        self.surface_loops.insert(
            id,
            SurfaceLoop {
                id,
                surfaces: surfaces.to_vec(),
            },
        );
        self.next.surface_loop = self.next.surface_loop.max(next);
        Ok(id)
    }

    pub fn add_volume(&mut self, surface_loop: u32) -> Result<u32, GeometryError> {
        self.add_volume_with_id(None, surface_loop)
    }

    pub fn add_volume_with_id(
        &mut self,
        id: Option<u32>,
        surface_loop: u32,
    ) -> Result<u32, GeometryError> {
        let id = match id {
            Some(id) if self.volumes.contains_key(&id) => {
                return Err(GeometryError::DuplicateId { kind: "volume", id })
            }
            Some(id) => id,
            None => self.next.volume,
        };
        self.surface_loop(surface_loop)?;
        let next = id_after("volume", id)?;
        self.volumes.insert(id, Volume { id, surface_loop });
        self.next.volume = self.next.volume.max(next);
        Ok(id)
    }

    /// Edges (unsigned) bounding a surface.
    pub fn surface_edges(&self, surface: u32) -> Result<BTreeSet<u32>, GeometryError> {
        let l = self.line_loop(self.surface(surface)?.line_loop)?;
        Ok(l.edges.iter().map(|e| e.unsigned_abs() as u32).collect())
    }

    /// Merge surface `b` into surface `a` by splicing their loops along their
    /// single shared edge. Surface `b`, its loop and the shared edge (if no other
    /// loop uses it) are removed. The domain is unchanged on error.
    pub fn fuse(&mut self, a: u32, b: u32) -> Result<(), GeometryError> {
        if a == b {
            return Err(GeometryError::NoSharedEdge { a, b, shared: 0 });
        }
        let (loop_a_id, loop_b_id) = (self.surface(a)?.line_loop, self.surface(b)?.line_loop);
        let la = self.line_loop(loop_a_id)?.edges.clone();
        let lb = self.line_loop(loop_b_id)?.edges.clone();

        let ea = self.surface_edges(a)?;
        let eb = self.surface_edges(b)?;
        let shared: Vec<u32> = ea.intersection(&eb).copied().collect();
        if shared.len() != 1 {
            return Err(GeometryError::NoSharedEdge {
                a,
                b,
                shared: shared.len(),
            });
        }
        let e = shared[0] as i64;

        // Rotate a so the shared edge is last, b so it is first with opposite sign.
        let pos_a = la.iter().position(|x| x.abs() == e).unwrap_or(0);
        let mut ra: Vec<i64> = la[pos_a + 1..].iter().chain(&la[..=pos_a]).copied().collect();
        let sign_a = ra[ra.len() - 1].signum();
        let mut rb = lb.clone();
        if lb.iter().any(|x| *x == sign_a * e) {
            rb = reversed(&lb);
        }
        let pos_b = rb.iter().position(|x| x.abs() == e).unwrap_or(0);
        let rb: Vec<i64> = rb[pos_b..].iter().chain(&rb[..pos_b]).copied().collect();

        ra.pop();
        ra.extend_from_slice(&rb[1..]);
        self.check_closed(&ra)?;

        let normal: [f64; 3] = {
            let n = self.loop_normal(&ra)?;
            if n.norm() == 0.0 {
                return Err(GeometryError::DegenerateSurface {
                    line_loop: loop_a_id,
                });
            }
            n.normalize().into()
        };

        // Commit.
        if let Some(l) = self.line_loops.get_mut(&loop_a_id) {
            l.edges = ra;
        }
        if let Some(s) = self.surfaces.get_mut(&a) {
            s.normal = normal;
        }
        self.surfaces.remove(&b);
        self.line_loops.remove(&loop_b_id);
        let still_used = self
            .line_loops
            .values()
            .any(|l| l.edges.iter().any(|x| x.abs() == e));
        if !still_used {
            self.edges.remove(&(e as u32));
        }
        for sl in self.surface_loops.values_mut() {
            sl.surfaces.retain(|s| *s != b);
        }
        for f in self.fields.values_mut() {
            f.replace_surface(b, a);
        }
        debug!(a, b, shared_edge = e, "fused surfaces");
        Ok(())
    }

    /// Repeatedly fuse neighbouring surfaces whose normals agree within `tol`
    /// (`n_a · n_b >= 1 - tol`), at most `iter_max` times. Pairs that cannot be
    /// fused are skipped. Returns the number of fusions.
    pub fn simplify_surfaces(&mut self, tol: f64, iter_max: usize) -> usize {
        let mut fused = 0;
        let mut rejected: BTreeSet<(u32, u32)> = BTreeSet::new();
        while fused < iter_max {
            let ids: Vec<u32> = self.surfaces.keys().copied().collect();
            let mut candidate = None;
            'search: for (i, &a) in ids.iter().enumerate() {
                for &b in &ids[i + 1..] {
                    if rejected.contains(&(a, b)) {
                        continue;
                    }
                    let (Ok(sa), Ok(sb)) = (self.surface(a), self.surface(b)) else {
                        continue;
                    };
                    let dot = Vector3::from(sa.normal).dot(&Vector3::from(sb.normal));
                    if dot < 1.0 - tol {
                        continue;
                    }
                    let (Ok(ea), Ok(eb)) = (self.surface_edges(a), self.surface_edges(b)) else {
                        continue;
                    };
                    if ea.intersection(&eb).count() == 1 {
                        candidate = Some((a, b));
                        break 'search;
                    }
                }
            }
            let Some((a, b)) = candidate else {
                break;
            };
            if let Err(err) = self.fuse(a, b) {
                debug!(a, b, %err, "skipping surfaces that cannot be fused");
                rejected.insert((a, b));
                continue;
            }
            // Loops changed, so earlier failures may now succeed.
            rejected.clear();
            fused += 1;
        }
        fused
    }
}
