//! gmsh MSH 2.2 reader and writer (ASCII and binary).

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::Path;

use tracing::debug;

use super::mesh::{CellKind, CoordinateFrame, Mesh};
use crate::error::MeshGenerationError;

/// Node count per gmsh element type (types 1..=15).
fn nodes_per_type(ty: i32) -> Option<usize> {
    const TABLE: [usize; 15] = [2, 3, 4, 4, 8, 6, 5, 3, 6, 9, 10, 27, 18, 14, 1];
    usize::try_from(ty - 1).ok().and_then(|i| TABLE.get(i).copied())
}

fn cell_kind(ty: i32) -> Option<CellKind> {
    match ty {
        2 => Some(CellKind::Triangle),
        4 => Some(CellKind::Tetrahedron),
        6 => Some(CellKind::Prism),
        _ => None,
    }
}

fn type_code(kind: CellKind) -> i32 {
    match kind {
        CellKind::Triangle => 2,
        CellKind::Tetrahedron => 4,
        CellKind::Prism => 6,
    }
}

fn malformed(section: &str, message: impl Into<String>) -> MeshGenerationError {
    MeshGenerationError::Malformed {
        section: section.into(),
        message: message.into(),
    }
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
    line_no: usize,
    big_endian: bool,
}

impl<'a> Cursor<'a> {
    fn line(&mut self) -> Option<&'a str> {
        if self.pos >= self.data.len() {
            return None;
        }
        let rest = &self.data[self.pos..];
        let end = rest.iter().position(|&b| b == b'\n').unwrap_or(rest.len());
        self.pos += (end + 1).min(rest.len());
        self.line_no += 1;
        std::str::from_utf8(&rest[..end]).ok().map(str::trim)
    }

    /// Next non-empty line.
    fn content_line(&mut self) -> Option<&'a str> {
        loop {
            let l = self.line()?;
            if !l.is_empty() {
                return Some(l);
            }
        }
    }

    fn remaining(&self) -> usize {
        self.data.len().saturating_sub(self.pos)
    }

    fn bytes<const N: usize>(&mut self, section: &str) -> Result<[u8; N], MeshGenerationError> {
        let slice = self
            .data
            .get(self.pos..self.pos + N)
            .ok_or_else(|| malformed(section, "unexpected end of binary data"))?;
        self.pos += N;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    fn int(&mut self, section: &str) -> Result<i32, MeshGenerationError> {
        let b = self.bytes::<4>(section)?;
        Ok(if self.big_endian {
            i32::from_be_bytes(b)
        } else {
            i32::from_le_bytes(b)
        })
    }

    fn double(&mut self, section: &str) -> Result<f64, MeshGenerationError> {
        let b = self.bytes::<8>(section)?;
        Ok(if self.big_endian {
            f64::from_be_bytes(b)
        } else {
            f64::from_le_bytes(b)
        })
    }

    fn expect(&mut self, tag: &str) -> Result<(), MeshGenerationError> {
        match self.content_line() {
            Some(l) if l == tag => Ok(()),
            other => Err(malformed(tag, format!("expected {tag}, found {other:?}"))),
        }
    }
}

fn non_negative(v: i32, what: &str) -> Result<usize, MeshGenerationError> {
    usize::try_from(v).map_err(|_| malformed("$Elements", format!("negative {what} {v}")))
}

fn parse_num<T: std::str::FromStr>(s: &str, section: &str) -> Result<T, MeshGenerationError> {
    s.parse::<T>()
        .map_err(|_| malformed(section, format!("invalid number `{s}`")))
}

/// Parse an MSH 2.x file held in memory, dispatching on the file-type field of
/// the `$MeshFormat` header.
pub fn parse_msh(data: &[u8], frame: CoordinateFrame) -> Result<Mesh, MeshGenerationError> {
    let mut cur = Cursor {
        data,
        pos: 0,
        line_no: 0,
        big_endian: false,
    };
    cur.expect("$MeshFormat")?;
    let header = cur
        .content_line()
        .ok_or_else(|| malformed("$MeshFormat", "missing header"))?;
    let fields: Vec<&str> = header.split_whitespace().collect();
    let [version, file_type, data_size] = fields[..] else {
        return Err(malformed("$MeshFormat", format!("bad header `{header}`")));
    };
    if !version.starts_with("2.") {
        return Err(MeshGenerationError::UnsupportedFormat {
            version: version.to_string(),
        });
    }
    let binary = match file_type {
        "0" => false,
        "1" => true,
        other => return Err(malformed("$MeshFormat", format!("unknown file type {other}"))),
    };
    if data_size != "8" {
        return Err(malformed("$MeshFormat", format!("unsupported data size {data_size}")));
    }
    if binary {
        let b = cur.bytes::<4>("$MeshFormat")?;
        if i32::from_le_bytes(b) == 1 {
            cur.big_endian = false;
        } else if i32::from_be_bytes(b) == 1 {
            cur.big_endian = true;
        } else {
            return Err(malformed("$MeshFormat", "bad endianness marker"));
        }
    }
    cur.expect("$EndMeshFormat")?;

    let mut node_index: HashMap<i64, usize> = HashMap::new();
    let mut positions: Vec<[f64; 3]> = Vec::new();
    let mut elements: Vec<(CellKind, Vec<i64>)> = Vec::new();

    while let Some(tag) = cur.content_line() {
        match tag {
            "$Nodes" => {
                let n: usize = parse_num(cur.content_line().unwrap_or(""), "$Nodes")?;
                // Each node takes at least one byte, so this bounds the count.
                positions.reserve(n.min(cur.remaining()));
                for _ in 0..n {
                    let (id, p) = if binary {
                        let id = cur.int("$Nodes")? as i64;
                        let p = [cur.double("$Nodes")?, cur.double("$Nodes")?, cur.double("$Nodes")?];
                        (id, p)
                    } else {
                        let l = cur
                            .content_line()
                            .ok_or_else(|| malformed("$Nodes", "unexpected end of file"))?;
                        let t: Vec<&str> = l.split_whitespace().collect();
                        if t.len() < 4 {
                            return Err(malformed("$Nodes", format!("bad node line `{l}`")));
                        }
                        let id: i64 = parse_num(t[0], "$Nodes")?;
                        let p = [
                            parse_num(t[1], "$Nodes")?,
                            parse_num(t[2], "$Nodes")?,
                            parse_num(t[3], "$Nodes")?,
                        ];
                        (id, p)
                    };
                    node_index.insert(id, positions.len());
                    positions.push(p);
                }
                cur.expect("$EndNodes")?;
            }
            "$Elements" => {
                let n: usize = parse_num(cur.content_line().unwrap_or(""), "$Elements")?;
                if binary {
                    let mut read = 0;
                    while read < n {
                        let ty = cur.int("$Elements")?;
                        let count = non_negative(cur.int("$Elements")?, "element count")?;
                        let ntags = non_negative(cur.int("$Elements")?, "tag count")?;
                        let nn = nodes_per_type(ty)
                            .ok_or_else(|| malformed("$Elements", format!("unknown element type {ty}")))?;
                        for _ in 0..count {
                            cur.int("$Elements")?;
                            for _ in 0..ntags {
                                cur.int("$Elements")?;
                            }
                            let mut nodes = Vec::with_capacity(nn);
                            for _ in 0..nn {
                                nodes.push(cur.int("$Elements")? as i64);
                            }
                            if let Some(kind) = cell_kind(ty) {
                                elements.push((kind, nodes));
                            }
                        }
                        read += count.max(1);
                    }
                } else {
                    for _ in 0..n {
                        let l = cur
                            .content_line()
                            .ok_or_else(|| malformed("$Elements", "unexpected end of file"))?;
                        let t: Vec<i64> = l
                            .split_whitespace()
                            .map(|x| parse_num(x, "$Elements"))
                            .collect::<Result<_, _>>()?;
                        if t.len() < 3 {
                            return Err(malformed("$Elements", format!("bad element line `{l}`")));
                        }
                        let line = cur.line_no;
                        let bad = |what: &str| {
                            malformed("$Elements", format!("line {line}: bad {what} in `{l}`"))
                        };
                        let ty = i32::try_from(t[1]).map_err(|_| bad("element type"))?;
                        let first_node = usize::try_from(t[2])
                            .ok()
                            .and_then(|ntags| 3usize.checked_add(ntags))
                            .ok_or_else(|| bad("tag count"))?;
                        let Some(kind) = cell_kind(ty) else {
                            continue;
                        };
                        let nodes = t.get(first_node..).unwrap_or(&[]).to_vec();
                        elements.push((kind, nodes));
                    }
                }
                cur.expect("$EndElements")?;
            }
            other if other.starts_with('$') && !other.starts_with("$End") => {
                // Skip unknown sections such as $PhysicalNames.
                let end = format!("$End{}", &other[1..]);
                while let Some(l) = cur.line() {
                    if l == end {
                        break;
                    }
                }
            }
            _ => {}
        }
    }

    let elements = elements
        .into_iter()
        .map(|(kind, nodes)| {
            let idx = nodes
                .iter()
                .map(|id| {
                    node_index
                        .get(id)
                        .copied()
                        .ok_or_else(|| malformed("$Elements", format!("unknown node id {id}")))
                })
                .collect::<Result<Vec<_>, _>>()?;
            Ok((kind, idx))
        })
        .collect::<Result<Vec<_>, MeshGenerationError>>()?;

    Mesh::from_elements(frame, positions, elements)
}

pub fn read_msh(path: impl AsRef<Path>, frame: CoordinateFrame) -> Result<Mesh, MeshGenerationError> {
    let path = path.as_ref();
    let data = fs::read(path)?;
    let mesh = parse_msh(&data, frame)?;
    debug!(path = %path.display(), cells = mesh.num_cells(), "read msh file");
    Ok(mesh)
}

/// Serialize a mesh as MSH 2.2. Node and element IDs are 1-based and contiguous.
pub fn to_msh_bytes(mesh: &Mesh, binary: bool) -> Vec<u8> {
    let mut out: Vec<u8> = Vec::new();
    // Writes into a Vec cannot fail.
    let _ = writeln!(out, "$MeshFormat\n2.2 {} 8", u8::from(binary));
    if binary {
        out.extend_from_slice(&1i32.to_le_bytes());
        out.push(b'\n');
    }
    let _ = writeln!(out, "$EndMeshFormat\n$Nodes\n{}", mesh.nodes.len());
    for (i, n) in mesh.nodes.iter().enumerate() {
        if binary {
            out.extend_from_slice(&(i as i32 + 1).to_le_bytes());
            for x in n.position {
                out.extend_from_slice(&x.to_le_bytes());
            }
        } else {
            let p = n.position;
            let _ = writeln!(out, "{} {} {} {}", i + 1, p[0], p[1], p[2]);
        }
    }
    if binary {
        out.push(b'\n');
    }
    let _ = writeln!(out, "$EndNodes\n$Elements\n{}", mesh.cells.len());
    if binary {
        for kind in [CellKind::Triangle, CellKind::Tetrahedron, CellKind::Prism] {
            let cells: Vec<_> = mesh.cells.iter().filter(|c| c.kind == kind).collect();
            if cells.is_empty() {
                continue;
            }
            for h in [type_code(kind), cells.len() as i32, 2] {
                out.extend_from_slice(&h.to_le_bytes());
            }
            for c in cells {
                for v in [c.id as i32 + 1, 0, 1] {
                    out.extend_from_slice(&v.to_le_bytes());
                }
                for &n in &c.node_ids {
                    out.extend_from_slice(&(n as i32 + 1).to_le_bytes());
                }
            }
        }
        out.push(b'\n');
    } else {
        for c in &mesh.cells {
            let nodes: Vec<String> = c.node_ids.iter().map(|n| (n + 1).to_string()).collect();
            let _ = writeln!(
                out,
                "{} {} 2 0 1 {}",
                c.id + 1,
                type_code(c.kind),
                nodes.join(" ")
            );
        }
    }
    let _ = writeln!(out, "$EndElements");
    out
}

pub fn write_msh(mesh: &Mesh, path: impl AsRef<Path>, binary: bool) -> Result<(), MeshGenerationError> {
    fs::write(path, to_msh_bytes(mesh, binary))?;
    Ok(())
}
