//! Fit configuration and output-grid geometry.

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::linalg::LinalgError;

/// Physical geometry of the rectilinear output grid: per-dimension sample
/// counts, spacing, origin, and an orientation matrix mapping grid axes into
/// physical axes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct GridGeometry {
    pub size: Vec<usize>,
    pub spacing: Vec<f64>,
    pub origin: Vec<f64>,
    pub direction: Array2<f64>,
}

impl GridGeometry {
    /// Geometry whose grid axes coincide with the physical axes.
    pub fn axis_aligned(size: Vec<usize>, spacing: Vec<f64>, origin: Vec<f64>) -> Self {
        let d = size.len();
        Self {
            size,
            spacing,
            origin,
            direction: Array2::eye(d),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.size.len()
    }
}

/// Parameters of a scattered-data fit.
///
/// Defaults mirror common practice: cubic splines, four control points per
/// dimension, a single level, open topology in every dimension, and dense
/// output generation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FitConfig {
    pub geometry: GridGeometry,
    /// Spline order per dimension, at least 1.
    pub spline_order: Vec<usize>,
    /// Control points per dimension at the coarsest level. Must be at least
    /// `spline_order + 1`.
    pub control_points: Vec<usize>,
    /// Number of resolution levels per dimension. Each additional level
    /// doubles the control-point spans in that dimension.
    pub levels: Vec<usize>,
    /// Dimensions marked true wrap periodically.
    pub close_dimension: Vec<bool>,
    /// Boundary-snapping tolerance in span units. When `None` a tolerance is
    /// derived from the span counts so that it stays representable against
    /// the finest level.
    pub epsilon: Option<f64>,
    /// When false the fit stops at the control lattice and skips the dense
    /// output grid.
    pub generate_output: bool,
    /// Parallel work-unit count for the point and grid partitions.
    pub work_units: usize,
}

impl FitConfig {
    pub fn new(geometry: GridGeometry) -> Self {
        let d = geometry.dimensions();
        let work_units = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            geometry,
            spline_order: vec![3; d],
            control_points: vec![4; d],
            levels: vec![1; d],
            close_dimension: vec![false; d],
            epsilon: None,
            generate_output: true,
            work_units,
        }
    }

    pub fn with_spline_order(mut self, order: Vec<usize>) -> Self {
        self.spline_order = order;
        self
    }

    pub fn with_control_points(mut self, control_points: Vec<usize>) -> Self {
        self.control_points = control_points;
        self
    }

    pub fn with_levels(mut self, levels: Vec<usize>) -> Self {
        self.levels = levels;
        self
    }

    pub fn with_close_dimension(mut self, close_dimension: Vec<bool>) -> Self {
        self.close_dimension = close_dimension;
        self
    }

    pub fn with_work_units(mut self, work_units: usize) -> Self {
        self.work_units = work_units;
        self
    }

    /// Override the derived boundary-snapping tolerance.
    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = Some(epsilon);
        self
    }

    /// Stop at the control lattice without sampling the output grid.
    pub fn fit_only(mut self) -> Self {
        self.generate_output = false;
        self
    }

    pub fn dimensions(&self) -> usize {
        self.geometry.dimensions()
    }

    pub fn validate(&self) -> Result<(), FitError> {
        let d = self.dimensions();
        if d == 0 {
            return Err(FitError::ZeroDimensions);
        }
        for (name, len) in [
            ("geometry.spacing", self.geometry.spacing.len()),
            ("geometry.origin", self.geometry.origin.len()),
            ("geometry.direction rows", self.geometry.direction.nrows()),
            ("geometry.direction columns", self.geometry.direction.ncols()),
            ("spline_order", self.spline_order.len()),
            ("control_points", self.control_points.len()),
            ("levels", self.levels.len()),
            ("close_dimension", self.close_dimension.len()),
        ] {
            if len != d {
                return Err(FitError::DimensionMismatch {
                    name,
                    expected: d,
                    found: len,
                });
            }
        }
        for dim in 0..d {
            if self.spline_order[dim] == 0 {
                return Err(FitError::InvalidSplineOrder(self.spline_order[dim]));
            }
            if self.geometry.size[dim] == 0 {
                return Err(FitError::ZeroOutputSize(dim));
            }
            if self.control_points[dim] < self.spline_order[dim] + 1 {
                return Err(FitError::TooFewControlPoints {
                    dimension: dim,
                    control_points: self.control_points[dim],
                    order: self.spline_order[dim],
                });
            }
            if self.levels[dim] == 0 {
                return Err(FitError::ZeroLevels(dim));
            }
        }
        if let Some(eps) = self.epsilon {
            if !eps.is_finite() || eps <= 0.0 {
                return Err(FitError::InvalidEpsilon(eps));
            }
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum FitError {
    #[error("Grid geometry must have at least one dimension.")]
    ZeroDimensions,

    #[error("Spline order must be at least 1, but was {0}.")]
    InvalidSplineOrder(usize),

    #[error("Output grid size must be positive in every dimension, but dimension {0} is zero.")]
    ZeroOutputSize(usize),

    #[error(
        "Dimension {dimension} has {control_points} control points, but spline order {order} \
         requires at least {}.",
        .order + 1
    )]
    TooFewControlPoints {
        dimension: usize,
        control_points: usize,
        order: usize,
    },

    #[error("Number of levels must be positive in every dimension, but dimension {0} is zero.")]
    ZeroLevels(usize),

    #[error("Boundary tolerance must be positive and finite, but was {0}.")]
    InvalidEpsilon(f64),

    #[error("Got {weights} weights for {points} points.")]
    WeightCountMismatch { weights: usize, points: usize },

    #[error("Got {values} data values for {points} points.")]
    PointDataCountMismatch { points: usize, values: usize },

    #[error("Configuration field {name} must have {expected} entries, but has {found}.")]
    DimensionMismatch {
        name: &'static str,
        expected: usize,
        found: usize,
    },

    #[error(
        "Parametric coordinate {value} in dimension {dimension} lies outside the domain \
         [0, {spans})."
    )]
    OutsideParametricDomain {
        value: f64,
        dimension: usize,
        spans: f64,
    },

    #[error("Linear algebra failure: {0}")]
    Linalg(#[from] LinalgError),

    #[error("Failed to build the worker thread pool: {0}")]
    ThreadPool(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_geometry(d: usize) -> GridGeometry {
        GridGeometry::axis_aligned(vec![10; d], vec![0.1; d], vec![0.0; d])
    }

    #[test]
    fn defaults_are_cubic_single_level() {
        let config = FitConfig::new(unit_geometry(2));
        assert_eq!(config.spline_order, vec![3, 3]);
        assert_eq!(config.control_points, vec![4, 4]);
        assert_eq!(config.levels, vec![1, 1]);
        assert_eq!(config.close_dimension, vec![false, false]);
        assert!(config.generate_output);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_too_few_control_points() {
        let config = FitConfig::new(unit_geometry(2)).with_control_points(vec![4, 3]);
        match config.validate() {
            Err(FitError::TooFewControlPoints {
                dimension,
                control_points,
                order,
            }) => {
                assert_eq!(dimension, 1);
                assert_eq!(control_points, 3);
                assert_eq!(order, 3);
            }
            other => panic!("expected TooFewControlPoints, got {other:?}"),
        }
    }

    #[test]
    fn rejects_order_zero_but_accepts_high_orders() {
        let zero = FitConfig::new(unit_geometry(1)).with_spline_order(vec![0]);
        assert!(matches!(
            zero.validate(),
            Err(FitError::InvalidSplineOrder(0))
        ));

        // The generic kernel handles any positive order; validation only
        // demands enough control points for the support.
        let high = FitConfig::new(unit_geometry(1))
            .with_spline_order(vec![6])
            .with_control_points(vec![7]);
        assert!(high.validate().is_ok());
    }

    #[test]
    fn rejects_mismatched_field_lengths() {
        let mut config = FitConfig::new(unit_geometry(2));
        config.levels = vec![1];
        assert!(matches!(
            config.validate(),
            Err(FitError::DimensionMismatch {
                name: "levels",
                expected: 2,
                found: 1
            })
        ));
    }

    #[test]
    fn rejects_nonpositive_epsilon() {
        let config = FitConfig::new(unit_geometry(1)).with_epsilon(0.0);
        assert!(matches!(config.validate(), Err(FitError::InvalidEpsilon(_))));

        let config = FitConfig::new(unit_geometry(1)).with_epsilon(1e-8);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn rejects_zero_levels() {
        let config = FitConfig::new(unit_geometry(1)).with_levels(vec![0]);
        assert!(matches!(config.validate(), Err(FitError::ZeroLevels(0))));
    }
}
