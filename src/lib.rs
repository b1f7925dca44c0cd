#![deny(dead_code)]
#![deny(unused_imports)]

//! Multilevel hierarchical B-spline approximation of scattered data: fits a
//! tensor-product control-point lattice to weighted vector-valued samples,
//! optionally refines it across dyadic resolution levels, and resamples the
//! fitted spline onto a dense output grid.

pub mod config;
pub mod driver;
pub mod kernel;
pub mod lattice;
pub mod linalg;
pub mod refine;

mod fit;
mod reconstruct;

pub use config::{FitConfig, FitError, GridGeometry};
pub use driver::{fit_scattered, ControlLattice, FitOutput, SampledGrid};
pub use kernel::BSplineKernel;
pub use lattice::Lattice;
pub use linalg::LinalgError;
pub use refine::refinement_coefficients;
