use std::collections::BTreeSet;
use std::fs;

use approx::assert_relative_eq;

use frap_rs::discretization::msh::{read_msh, write_msh};
use frap_rs::discretization::{
    merge_mesh_files, merge_meshes, CoordinateFrame, DelaunayGenerator, MeshGenerator,
};
use frap_rs::error::MeshGenerationError;
use frap_rs::geometry::{Domain, LengthUnit};

fn disk(center: [f64; 2], radius: f64, size: f64) -> Domain {
    let mut d = Domain::new(LengthUnit::Pixel);
    d.add_circle_by_parameters(center, radius, 0.0, size, true, true)
        .unwrap();
    d
}

#[cfg(unix)]
#[test]
fn external_mesher_success_and_failure() {
    use frap_rs::discretization::GmshGenerator;
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().unwrap();
    let script = |name: &str, body: &str| {
        let path = dir.path().join(name);
        fs::write(&path, format!("#!/bin/sh\n{body}")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    };
    let ok = script(
        "fake_gmsh.sh",
        r#"out=""
while [ $# -gt 0 ]; do
  if [ "$1" = "-o" ]; then out="$2"; shift; fi
  shift
done
cat > "$out" <<'MSH'
$MeshFormat
2.2 0 8
$EndMeshFormat
$Nodes
4
1 0 0 0
2 2 0 0
3 2 2 0
4 0 2 0
$EndNodes
$Elements
2
1 2 2 0 1 1 2 3
2 2 2 0 1 1 3 4
$EndElements
MSH
echo "meshed"
"#,
    );
    let broken = script("broken_gmsh.sh", "echo 'no geometry' >&2\nexit 3\n");

    let domain = disk([0.0, 0.0], 1.0, 0.5);
    let gen = GmshGenerator::new(&ok, dir.path().join("work"));
    let mesh = gen.generate(&domain, 1.0).unwrap();
    assert_eq!(mesh.num_cells(), 2);
    assert_relative_eq!(mesh.total_volume(), 4.0, epsilon = 1e-12);
    assert!(gen.geo_path().exists());

    let gen = GmshGenerator::new(&broken, dir.path().join("work"));
    match gen.generate(&domain, 1.0) {
        Err(MeshGenerationError::ToolFailed { status, stderr, .. }) => {
            assert_eq!(status, Some(3));
            assert!(stderr.contains("no geometry"));
        }
        other => panic!("expected ToolFailed, got {other:?}"),
    }

    let gen = GmshGenerator::new(dir.path().join("missing"), dir.path().join("work"));
    assert!(matches!(
        gen.generate(&domain, 1.0),
        Err(MeshGenerationError::Spawn { .. })
    ));
}

#[test]
fn merged_cells_map_bijectively() {
    let gen = DelaunayGenerator::default();
    let a = gen.generate(&disk([0.0, 0.0], 10.0, 2.0), 1.0).unwrap();
    let b = gen.generate(&disk([40.0, 0.0], 6.0, 1.5), 1.0).unwrap();
    let merged = merge_meshes(&[&a, &b], false).unwrap();
    let total = a.num_cells() + b.num_cells();
    assert_eq!(merged.mesh.num_cells(), total);

    let targets: BTreeSet<usize> = merged.cell_map().map(|(_, merged_idx)| merged_idx).collect();
    assert_eq!(targets.len(), total);
    assert!(targets.iter().all(|&i| i < total));
    for local in 0..b.num_cells() {
        let i = merged.translate_cell(b.id, local).unwrap();
        assert_relative_eq!(merged.mesh.cells[i].volume, b.cells[local].volume, epsilon = 1e-12);
    }
    assert!(merged.translate_cell(a.id, a.num_cells()).is_none());
}

#[test]
fn merge_rejects_mixed_units() {
    let gen = DelaunayGenerator::default();
    let a = gen.generate(&disk([0.0, 0.0], 5.0, 1.0), 1.0).unwrap();
    let b = a.rescaled(0.5, LengthUnit::Micron).unwrap();
    assert!(matches!(
        merge_meshes(&[&a, &b], false),
        Err(MeshGenerationError::IncompatibleFrames { .. })
    ));
}

#[test]
fn merge_through_files() {
    let dir = tempfile::tempdir().unwrap();
    let gen = DelaunayGenerator::default();
    let a = gen.generate(&disk([0.0, 0.0], 5.0, 1.0), 1.0).unwrap();
    let b = gen.generate(&disk([20.0, 0.0], 5.0, 1.0), 1.0).unwrap();
    let pa = dir.path().join("a.msh");
    let pb = dir.path().join("b.msh");
    write_msh(&a, &pa, false).unwrap();
    write_msh(&b, &pb, true).unwrap();

    let out = dir.path().join("merged.geo");
    let merged = merge_mesh_files(&[&pa, &pb], &out, CoordinateFrame::default(), false).unwrap();
    assert_eq!(merged.mesh.num_cells(), a.num_cells() + b.num_cells());

    let script = fs::read_to_string(&out).unwrap();
    assert!(script.contains("Merge \""));
    let reread = read_msh(out.with_extension("msh"), CoordinateFrame::default()).unwrap();
    assert_eq!(reread.num_cells(), merged.mesh.num_cells());
    assert_relative_eq!(reread.total_volume(), merged.mesh.total_volume(), max_relative = 1e-12);
}

#[test]
fn damaged_msh_files_are_errors_not_panics() {
    let dir = tempfile::tempdir().unwrap();
    let gen = DelaunayGenerator::default();
    let m = gen.generate(&disk([0.0, 0.0], 5.0, 1.0), 1.0).unwrap();
    let path = dir.path().join("whole.msh");
    write_msh(&m, &path, true).unwrap();
    let bytes = fs::read(&path).unwrap();

    let cut = dir.path().join("cut.msh");
    fs::write(&cut, &bytes[..bytes.len() / 2]).unwrap();
    assert!(matches!(
        read_msh(&cut, CoordinateFrame::default()),
        Err(MeshGenerationError::Malformed { .. })
    ));

    let huge = dir.path().join("huge.msh");
    fs::write(
        &huge,
        "$MeshFormat\n2.2 0 8\n$EndMeshFormat\n$Elements\n4294967296\n1 2 -7 1 2 3\n",
    )
    .unwrap();
    assert!(matches!(
        read_msh(&huge, CoordinateFrame::default()),
        Err(MeshGenerationError::Malformed { .. })
    ));

    let (a, twin) = (m.clone(), m);
    assert!(matches!(
        merge_meshes(&[&a, &twin], true),
        Err(MeshGenerationError::DuplicateSource { .. })
    ));
}
