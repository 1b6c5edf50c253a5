//! Fluorescence Recovery After Photobleaching (FRAP) analysis.
//!
//! The pipeline runs geometry → mesh → ROI index sets → finite-volume
//! reaction-diffusion simulation → nonlinear fit of the simulated ROI series
//! against measured ones.

pub mod discretization;
pub mod error;
pub mod experiment;
pub mod fitting;
pub mod geometry;
pub mod image;
pub mod models;
pub mod numerics;
pub mod physics;
pub mod processing;
pub mod roi;
pub mod simulation;

pub use error::{FrapError, Result};
