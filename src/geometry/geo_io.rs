//! Reading and writing the gmsh `.geo` script dialect.
//!
//! Coordinates are written with Rust's shortest round-trip float formatting, so
//! `parse_geo(&to_geo_string(d))` reproduces every coordinate bit for bit.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use tracing::{debug, warn};

use super::{Domain, EdgeKind, Field, LengthUnit};
use crate::error::GeometryError;

fn list<T: std::fmt::Display>(items: &[T]) -> String {
    items
        .iter()
        .map(|x| x.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

impl Domain {
    /// Serialize the domain as a gmsh script.
    pub fn to_geo_string(&self) -> String {
        let mut s = String::new();
        // `write!` into a String cannot fail.
        let _ = writeln!(s, "// unit: {:?}", self.unit);
        for v in self.vertices.values() {
            let _ = writeln!(
                s,
                "Point({}) = {{{}, {}, {}, {}}};",
                v.id, v.x[0], v.x[1], v.x[2], v.vol_size
            );
        }
        for e in self.edges.values() {
            let _ = match &e.kind {
                EdgeKind::Line { start, end } => writeln!(s, "Line({}) = {{{start}, {end}}};", e.id),
                EdgeKind::Arc { start, center, end } => {
                    writeln!(s, "Circle({}) = {{{start}, {center}, {end}}};", e.id)
                }
                EdgeKind::Spline { points } => {
                    writeln!(s, "Spline({}) = {{{}}};", e.id, list(points))
                }
            };
        }
        for l in self.line_loops.values() {
            let _ = writeln!(s, "Line Loop({}) = {{{}}};", l.id, list(&l.edges));
        }
        for f in self.surfaces.values() {
            let _ = writeln!(s, "Ruled Surface({}) = {{{}}};", f.id, f.line_loop);
        }
        for sl in self.surface_loops.values() {
            let _ = writeln!(s, "Surface Loop({}) = {{{}}};", sl.id, list(&sl.surfaces));
        }
        for v in self.volumes.values() {
            let _ = writeln!(s, "Volume({}) = {{{}}};", v.id, v.surface_loop);
        }
        for (id, f) in &self.fields {
            let _ = writeln!(s, "Field[{id}] = {};", f.type_name());
            let mut attr = |name: &str, value: String| {
                let _ = writeln!(s, "Field[{id}].{name} = {value};");
            };
            match f {
                Field::Attractor { nodes } => attr("NodesList", format!("{{{}}}", list(nodes))),
                Field::Threshold {
                    ifield,
                    lc_min,
                    lc_max,
                    dist_min,
                    dist_max,
                } => {
                    attr("IField", ifield.to_string());
                    attr("LcMin", lc_min.to_string());
                    attr("LcMax", lc_max.to_string());
                    attr("DistMin", dist_min.to_string());
                    attr("DistMax", dist_max.to_string());
                }
                Field::BoundaryLayer {
                    hfar,
                    hwall_n,
                    hwall_t,
                    thickness,
                    quads,
                    edges,
                    faces,
                } => {
                    attr("hfar", hfar.to_string());
                    attr("hwall_n", hwall_n.to_string());
                    attr("hwall_t", hwall_t.to_string());
                    attr("thickness", thickness.to_string());
                    attr("Quads", u8::from(*quads).to_string());
                    if !edges.is_empty() {
                        attr("EdgesList", format!("{{{}}}", list(edges)));
                    }
                    if !faces.is_empty() {
                        attr("FacesList", format!("{{{}}}", list(faces)));
                    }
                }
                Field::Box {
                    v_in,
                    v_out,
                    min,
                    max,
                } => {
                    attr("VIn", v_in.to_string());
                    attr("VOut", v_out.to_string());
                    for (i, axis) in ["X", "Y", "Z"].iter().enumerate() {
                        attr(&format!("{axis}Min"), min[i].to_string());
                        attr(&format!("{axis}Max"), max[i].to_string());
                    }
                }
                Field::Min { fields } => attr("FieldsList", format!("{{{}}}", list(fields))),
            }
        }
        if let Some(b) = self.bkgd_field {
            let _ = writeln!(s, "Background Field = {b};");
        }
        s
    }

    pub fn write_to_file(&self, path: impl AsRef<Path>) -> Result<(), GeometryError> {
        let path = path.as_ref();
        fs::write(path, self.to_geo_string())?;
        debug!(path = %path.display(), "wrote geo file");
        Ok(())
    }

    pub fn read_geo_file(path: impl AsRef<Path>, unit: LengthUnit) -> Result<Domain, GeometryError> {
        let text = fs::read_to_string(path)?;
        Self::parse_geo(&text, unit)
    }

    /// Parse a gmsh script. Entities must be defined before they are referenced;
    /// unsupported statements are skipped with a warning.
    pub fn parse_geo(text: &str, unit: LengthUnit) -> Result<Domain, GeometryError> {
        let mut domain = Domain::new(unit);
        let cleaned: String = text
            .lines()
            .map(|l| l.split("//").next().unwrap_or(""))
            .collect::<Vec<_>>()
            .join("\n");

        let mut line = 1;
        for raw in cleaned.split(';') {
            let leading = &raw[..raw.len() - raw.trim_start().len()];
            let stmt_line = line + leading.matches('\n').count();
            line += raw.matches('\n').count();
            let stmt = raw.trim();
            if stmt.is_empty() {
                continue;
            }
            parse_statement(&mut domain, stmt).map_err(|message| GeometryError::Parse {
                line: stmt_line,
                message,
            })?;
        }
        Ok(domain)
    }
}

fn parse_f64(s: &str) -> Result<f64, String> {
    s.trim()
        .parse::<f64>()
        .map_err(|e| format!("invalid number `{}`: {e}", s.trim()))
}

fn parse_u32(s: &str) -> Result<u32, String> {
    s.trim()
        .parse::<u32>()
        .map_err(|e| format!("invalid id `{}`: {e}", s.trim()))
}

fn parse_list<T: std::str::FromStr>(s: &str) -> Result<Vec<T>, String>
where
    T::Err: std::fmt::Display,
{
    let inner = s.trim().trim_start_matches('{').trim_end_matches('}');
    inner
        .split(',')
        .map(str::trim)
        .filter(|x| !x.is_empty())
        .map(|x| x.parse::<T>().map_err(|e| format!("invalid list entry `{x}`: {e}")))
        .collect()
}

fn parse_statement(d: &mut Domain, stmt: &str) -> Result<(), String> {
    let geo = |e: GeometryError| e.to_string();

    if let Some(rest) = stmt.strip_prefix("Background Field") {
        let id = parse_u32(rest.trim_start().trim_start_matches('='))?;
        return d.set_as_bkgd_field(id).map_err(geo);
    }

    if let Some(rest) = stmt.strip_prefix("Field[") {
        let (id, rest) = rest.split_once(']').ok_or("missing `]` in field statement")?;
        let id = parse_u32(id)?;
        let rest = rest.trim();
        if let Some(attr) = rest.strip_prefix('.') {
            let (name, value) = attr.split_once('=').ok_or("missing `=` in field attribute")?;
            return set_field_attr(d, id, name.trim(), value.trim());
        }
        let ty = rest.trim_start_matches('=').trim();
        let field = match ty {
            "Attractor" | "Distance" => Field::Attractor { nodes: Vec::new() },
            "Threshold" => Field::Threshold {
                ifield: 0,
                lc_min: 0.0,
                lc_max: 0.0,
                dist_min: 0.0,
                dist_max: 0.0,
            },
            "BoundaryLayer" => Field::BoundaryLayer {
                hfar: 1.0,
                hwall_n: 0.1,
                hwall_t: 0.5,
                thickness: 1.0,
                quads: false,
                edges: Vec::new(),
                faces: Vec::new(),
            },
            "Box" => Field::Box {
                v_in: 0.0,
                v_out: 0.0,
                min: [0.0; 3],
                max: [0.0; 3],
            },
            "Min" => Field::Min { fields: Vec::new() },
            other => {
                warn!(field = id, "unsupported field type `{other}` skipped");
                return Ok(());
            }
        };
        return d.insert_field_with_id(id, field).map(|_| ()).map_err(geo);
    }

    let (head, rhs) = stmt.split_once('=').unwrap_or((stmt, ""));
    let Some((keyword, id)) = head.split_once('(') else {
        warn!("unsupported statement `{stmt}` skipped");
        return Ok(());
    };
    let keyword = keyword.split_whitespace().collect::<Vec<_>>().join(" ");
    let id = parse_u32(id.trim().trim_end_matches(')'))?;

    match keyword.as_str() {
        "Point" => {
            let v: Vec<f64> = parse_list(rhs)?;
            if v.len() < 3 {
                return Err(format!("Point({id}) needs at least 3 coordinates"));
            }
            let lc = v.get(3).copied().unwrap_or(1.0);
            d.add_vertex_with_id(id, [v[0], v[1], v[2]], lc).map(|_| ()).map_err(geo)
        }
        "Line" => {
            let v: Vec<u32> = parse_list(rhs)?;
            if v.len() != 2 {
                return Err(format!("Line({id}) needs 2 points"));
            }
            d.add_line_with_id(Some(id), v[0], v[1]).map(|_| ()).map_err(geo)
        }
        "Circle" => {
            let v: Vec<u32> = parse_list(rhs)?;
            if v.len() != 3 {
                return Err(format!("Circle({id}) needs start, center and end"));
            }
            d.add_arc_with_id(Some(id), v[0], v[1], v[2]).map(|_| ()).map_err(geo)
        }
        "Spline" => {
            let v: Vec<u32> = parse_list(rhs)?;
            d.add_spline_with_id(Some(id), &v).map(|_| ()).map_err(geo)
        }
        "Line Loop" | "Curve Loop" => {
            let v: Vec<i64> = parse_list(rhs)?;
            d.add_line_loop_with_id(Some(id), &v).map(|_| ()).map_err(geo)
        }
        "Ruled Surface" | "Surface" | "Plane Surface" => {
            let v: Vec<u32> = parse_list(rhs)?;
            let Some(&l) = v.first() else {
                return Err(format!("surface {id} has no line loop"));
            };
            if v.len() > 1 {
                warn!(surface = id, "holes in surfaces are not supported, extra loops ignored");
            }
            d.add_ruled_surface_with_id(Some(id), l).map(|_| ()).map_err(geo)
        }
        "Surface Loop" => {
            let v: Vec<u32> = parse_list(rhs)?;
            d.add_surface_loop_with_id(Some(id), &v).map(|_| ()).map_err(geo)
        }
        "Volume" => {
            let v: Vec<u32> = parse_list(rhs)?;
            let Some(&sl) = v.first() else {
                return Err(format!("Volume({id}) has no surface loop"));
            };
            d.add_volume_with_id(Some(id), sl).map(|_| ()).map_err(geo)
        }
        other => {
            warn!("unsupported statement `{other}({id})` skipped");
            Ok(())
        }
    }
}

fn set_field_attr(d: &mut Domain, id: u32, name: &str, value: &str) -> Result<(), String> {
    let Ok(field) = d.field_mut(id) else {
        warn!(field = id, "attribute `{name}` for unknown field skipped");
        return Ok(());
    };
    match (field, name) {
        (Field::Attractor { nodes }, "NodesList" | "PointsList") => *nodes = parse_list(value)?,
        (Field::Threshold { ifield, .. }, "IField" | "InField") => *ifield = parse_u32(value)?,
        (Field::Threshold { lc_min, .. }, "LcMin" | "SizeMin") => *lc_min = parse_f64(value)?,
        (Field::Threshold { lc_max, .. }, "LcMax" | "SizeMax") => *lc_max = parse_f64(value)?,
        (Field::Threshold { dist_min, .. }, "DistMin") => *dist_min = parse_f64(value)?,
        (Field::Threshold { dist_max, .. }, "DistMax") => *dist_max = parse_f64(value)?,
        (Field::BoundaryLayer { hfar, .. }, "hfar") => *hfar = parse_f64(value)?,
        (Field::BoundaryLayer { hwall_n, .. }, "hwall_n") => *hwall_n = parse_f64(value)?,
        (Field::BoundaryLayer { hwall_t, .. }, "hwall_t") => *hwall_t = parse_f64(value)?,
        (Field::BoundaryLayer { thickness, .. }, "thickness") => *thickness = parse_f64(value)?,
        (Field::BoundaryLayer { quads, .. }, "Quads") => *quads = parse_f64(value)? != 0.0,
        (Field::BoundaryLayer { edges, .. }, "EdgesList" | "CurvesList") => {
            *edges = parse_list(value)?
        }
        (Field::BoundaryLayer { faces, .. }, "FacesList" | "SurfacesList") => {
            *faces = parse_list(value)?
        }
        (Field::Box { v_in, .. }, "VIn") => *v_in = parse_f64(value)?,
        (Field::Box { v_out, .. }, "VOut") => *v_out = parse_f64(value)?,
        (Field::Box { min, .. }, "XMin") => min[0] = parse_f64(value)?,
        (Field::Box { min, .. }, "YMin") => min[1] = parse_f64(value)?,
        (Field::Box { min, .. }, "ZMin") => min[2] = parse_f64(value)?,
        (Field::Box { max, .. }, "XMax") => max[0] = parse_f64(value)?,
        (Field::Box { max, .. }, "YMax") => max[1] = parse_f64(value)?,
        (Field::Box { max, .. }, "ZMax") => max[2] = parse_f64(value)?,
        (Field::Min { fields }, "FieldsList") => *fields = parse_list(value)?,
        (f, other) => {
            warn!(
                field = id,
                "unsupported attribute `{other}` for {} field skipped",
                f.type_name()
            );
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn circle_domain_round_trips() {
        let mut d = Domain::new(LengthUnit::Pixel);
        d.add_circle_by_parameters([256.0, 256.0], 300.0, 0.0, 30.0, true, true)
            .unwrap();
        let bl = d.add_boundary_layer_field(30.0, 1.5, 5.0, 20.0, true).unwrap();
        d.attach_field_to_surfaces(bl, &[1]).unwrap();
        d.set_as_bkgd_field(bl).unwrap();

        let parsed = Domain::parse_geo(&d.to_geo_string(), LengthUnit::Pixel).unwrap();
        assert_eq!(parsed, d);
    }

    #[test]
    fn parse_reports_line_of_bad_statement() {
        let text = "Point(1) = {0, 0, 0, 1};\nPoint(2) = {1, 0, 0, 1};\n\nLine(3) = {1, 9};\n";
        match Domain::parse_geo(text, LengthUnit::Pixel) {
            Err(GeometryError::Parse { line, .. }) => assert_eq!(line, 4),
            other => panic!("expected parse error, got {other:?}"),
        }
    }

    #[test]
    fn unknown_statements_are_skipped() {
        let text = "Mesh.Algorithm = 6;\nPoint(1) = {0, 0, 0};\nCharacteristic Length {1} = 2;";
        let d = Domain::parse_geo(text, LengthUnit::Micron).unwrap();
        assert_eq!(d.vertices().count(), 1);
    }
}
