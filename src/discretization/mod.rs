//! Meshes and everything that produces, reads, writes or combines them.

pub mod generator;
pub mod merge;
pub mod mesh;
pub mod msh;

pub use generator::{DelaunayGenerator, GmshGenerator, MeshGenerator};
pub use merge::{merge_mesh_files, merge_meshes, MergedMesh};
pub use mesh::{Cell, CellKind, CoordinateFrame, Face, Mesh, MeshId, MeshStats, Node};
