//! Closure-configured finite-volume residuals and their row-wise Jacobians.

pub mod functional;
pub mod sparse;
