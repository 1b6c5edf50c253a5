use std::io;

use thiserror::Error;

use crate::discretization::mesh::{CoordinateFrame, MeshId};
use crate::geometry::LengthUnit;
use crate::numerics::newton::SolverError;

/// Top-level error type for the FRAP pipeline.
#[derive(Debug, Error)]
pub enum FrapError {
    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    MeshGeneration(#[from] MeshGenerationError),

    #[error(transparent)]
    Roi(#[from] RoiError),

    #[error(transparent)]
    IndexStale(#[from] IndexStaleError),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error(transparent)]
    Fit(#[from] FitError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Malformed geometric construction. The domain is left in its last valid state.
#[derive(Debug, Error)]
pub enum GeometryError {
    #[error("{kind} id {id} already exists")]
    DuplicateId { kind: &'static str, id: u32 },

    #[error("{kind} id {id} leaves no room for further ids")]
    IdOverflow { kind: &'static str, id: u32 },

    #[error("{kind} id {id} does not exist in this domain")]
    UnknownEntity { kind: &'static str, id: u32 },

    #[error("vertices {a} and {b} coincide")]
    CoincidentPoints { a: u32, b: u32 },

    #[error(
        "arc {start}->{end} around {center} is not circular: |c-start| = {r_start}, |c-end| = {r_end}"
    )]
    ArcRadiusMismatch {
        start: u32,
        center: u32,
        end: u32,
        r_start: f64,
        r_end: f64,
    },

    #[error("line loop is not closed: edge {edge} does not connect to edge {next}")]
    OpenLoop { edge: i64, next: i64 },

    #[error("surface on line loop {line_loop} is degenerate (zero area)")]
    DegenerateSurface { line_loop: u32 },

    #[error("surfaces {a} and {b} share {shared} edges, expected exactly one")]
    NoSharedEdge { a: u32, b: u32, shared: usize },

    #[error("invalid geometry parameter: {0}")]
    InvalidParameter(String),

    #[error("geo script line {line}: {message}")]
    Parse { line: usize, message: String },

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Failure of the meshing stage. Fatal to the current mesh request, never retried.
#[derive(Debug, Error)]
pub enum MeshGenerationError {
    #[error("could not launch mesh generator `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("mesh generator exited with status {status:?}\n--- stdout ---\n{stdout}\n--- stderr ---\n{stderr}")]
    ToolFailed {
        status: Option<i32>,
        stdout: String,
        stderr: String,
    },

    #[error("mesh generation produced zero cells")]
    EmptyMesh,

    #[error("unsupported mesh format version {version}")]
    UnsupportedFormat { version: String },

    #[error("malformed mesh file in section {section}: {message}")]
    Malformed { section: String, message: String },

    #[error("meshes live in incompatible coordinate frames: {a:?} vs {b:?}")]
    IncompatibleFrames {
        a: CoordinateFrame,
        b: CoordinateFrame,
    },

    #[error("mesh {id:?} appears more than once in a merge")]
    DuplicateSource { id: MeshId },

    #[error("cannot merge a {a}D mesh with a {b}D mesh")]
    DimensionMismatch { a: usize, b: usize },

    #[error("domain cannot be meshed by this generator: {0}")]
    UnsupportedDomain(String),

    #[error(transparent)]
    Geometry(#[from] GeometryError),

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// ROI index set used against a mesh it was not computed for.
#[derive(Debug, Error)]
#[error("ROI `{roi}` indices were computed for mesh {computed_for:?}, current mesh is {current:?}")]
pub struct IndexStaleError {
    pub roi: String,
    pub computed_for: Option<MeshId>,
    pub current: MeshId,
}

#[derive(Debug, Error)]
pub enum RoiError {
    #[error("unknown ROI `{0}`")]
    Unknown(String),

    #[error("ROI `{0}` is defined twice")]
    DuplicateName(String),

    #[error("composite ROI `{0}` references itself")]
    CompositeCycle(String),

    #[error("ROI `{roi}` lists cell index {index}, mesh has {cells} cells")]
    IndexOutOfRange {
        roi: String,
        index: usize,
        cells: usize,
    },
}

/// Time point outside the range covered by a sampled series.
#[derive(Debug, Error, Clone, Copy)]
#[error("time {t} lies outside the simulated range [{min}, {max}]")]
pub struct OutOfRangeError {
    pub t: f64,
    pub min: f64,
    pub max: f64,
}

/// Fatal to the current simulation run; results of completed steps are retained.
#[derive(Debug, Error)]
pub enum SimulationError {
    #[error("no mesh bound to the simulation")]
    MissingMesh,

    #[error("simulation is bound to mesh {bound:?}, got mesh {given:?}")]
    MeshMismatch { bound: MeshId, given: MeshId },

    #[error("initial condition has not been built for the bound mesh")]
    MissingInitialCondition,

    #[error("mesh coordinates are in {mesh:?} but the diffusion coefficient is in {diffusion:?}")]
    InconsistentUnits {
        mesh: LengthUnit,
        diffusion: LengthUnit,
    },

    #[error("invalid time vector: {0}")]
    InvalidTimeVector(String),

    #[error("step {step} at t = {time} failed after {completed} completed steps: {source}")]
    NonConvergence {
        step: usize,
        time: f64,
        completed: usize,
        #[source]
        source: SolverError,
    },

    #[error(transparent)]
    Roi(#[from] RoiError),

    #[error(transparent)]
    IndexStale(#[from] IndexStaleError),
}

/// Optimizer finished without converging. The fit keeps its diagnostic state.
#[derive(Debug, Error, Clone)]
#[error("fit did not converge after {iterations} iterations: residual {residual:.4e} at x = {x:?}")]
pub struct FitFailure {
    pub x: Vec<f64>,
    pub residual: f64,
    pub iterations: usize,
}

#[derive(Debug, Error)]
pub enum FitError {
    #[error("no ROI selected for fitting")]
    NoRois,

    #[error("missing input: {0}")]
    MissingData(String),

    #[error("invalid fit bounds: {0}")]
    InvalidBounds(String),

    #[error("time-rescaling shortcut unavailable: {0}")]
    ShortcutUnavailable(String),

    #[error("cannot pin series: reference values {bkgd} and {norm} coincide")]
    DegeneratePinning { bkgd: f64, norm: f64 },

    #[error(transparent)]
    OutOfRange(#[from] OutOfRangeError),

    #[error(transparent)]
    NotConverged(#[from] FitFailure),

    #[error(transparent)]
    Simulation(#[from] SimulationError),

    #[error(transparent)]
    Roi(#[from] RoiError),

    #[error(transparent)]
    IndexStale(#[from] IndexStaleError),
}

/// Convenience type alias for results using [`FrapError`].
pub type Result<T> = std::result::Result<T, FrapError>;
