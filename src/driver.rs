//! Multilevel fit orchestration.
//!
//! The driver owns the running state of a fit: the residual values, the
//! current control-point counts, the level's control lattice (phi), and the
//! accumulated multilevel lattice (psi). Each pass over the data runs as an
//! explicit phase on a dedicated rayon pool, with the point set split into
//! contiguous ranges and the output grid into slabs of the slowest dimension.

use std::collections::BTreeMap;

use ndarray::{Array1, Array2, ArrayView1, ArrayView2, Axis};
use rayon::prelude::*;

use crate::config::{FitConfig, FitError, GridGeometry};
use crate::fit::{fit_point_range, normalize_lattice, FitJob, ParametricMap};
use crate::kernel::BSplineKernel;
use crate::lattice::Lattice;
use crate::reconstruct::{reconstruct_region, update_residual_range};
use crate::refine::{refine_lattice, refinement_coefficients};

/// The three parallel passes of a fit.
enum Phase {
    /// Scatter residuals into the control lattice of the current level.
    Fit,
    /// Subtract the current level's spline from the residual values.
    UpdateResiduals,
    /// Sample the final spline over the output grid.
    Reconstruct,
}

struct Orchestrator<'a> {
    pool: rayon::ThreadPool,
    config: &'a FitConfig,
    coords: ArrayView2<'a, f64>,
    weights: Array1<f64>,
    residuals: Array2<f64>,
    epsilon: f64,
    current_control_points: Vec<usize>,
    phi: Lattice,
    output: Option<Array2<f64>>,
    kernels: Vec<BSplineKernel>,
    residual_track: Vec<f64>,
}

impl Orchestrator<'_> {
    fn run_phase(&mut self, phase: Phase) -> Result<(), FitError> {
        match phase {
            Phase::Fit => self.run_fit(),
            Phase::UpdateResiduals => self.run_residual_update(),
            Phase::Reconstruct => {
                self.run_reconstruct();
                Ok(())
            }
        }
    }

    fn run_fit(&mut self) -> Result<(), FitError> {
        let extent = lattice_extent(self.config, &self.current_control_points);
        let map = ParametricMap::for_control_points(
            self.config,
            &self.current_control_points,
            self.epsilon,
        );
        let job = FitJob {
            coords: self.coords.view(),
            residuals: self.residuals.view(),
            weights: self.weights.view(),
            config: self.config,
            kernels: &self.kernels,
            map: &map,
            extent: &extent,
        };
        let ranges = point_ranges(self.coords.nrows(), self.config.work_units.max(1));

        let partials = self.pool.install(|| {
            ranges
                .into_par_iter()
                .map(|(start, end)| fit_point_range(&job, start, end))
                .collect::<Result<Vec<_>, FitError>>()
        })?;

        let components = self.residuals.ncols();
        let merged = partials.into_iter().fold(None, |acc, (delta, omega)| {
            match acc {
                None => Some((delta, omega)),
                Some((mut delta_sum, mut omega_sum)) => {
                    delta_sum.add_assign(&delta);
                    omega_sum.add_assign(&omega);
                    Some((delta_sum, omega_sum))
                }
            }
        });
        let (mut delta, omega) = merged
            .unwrap_or_else(|| (Lattice::zeros(&extent, components), Lattice::zeros(&extent, 1)));

        normalize_lattice(&mut delta, &omega);
        self.phi = delta;
        Ok(())
    }

    fn run_residual_update(&mut self) -> Result<(), FitError> {
        let map = ParametricMap::for_lattice(self.config, self.phi.extent(), self.epsilon);
        let ranges = point_ranges(self.coords.nrows(), self.config.work_units.max(1));

        let phi = &self.phi;
        let kernels = &self.kernels;
        let config = self.config;
        let coords = self.coords.view();

        let mut slabs = Vec::with_capacity(ranges.len());
        let mut rest = self.residuals.view_mut();
        for &(start, end) in &ranges {
            let (head, tail) = rest.split_at(Axis(0), end - start);
            slabs.push((start, head));
            rest = tail;
        }
        debug_assert_eq!(rest.nrows(), 0);

        self.pool.install(|| {
            slabs.into_par_iter().try_for_each(|(start, slab)| {
                update_residual_range(phi, config, kernels, &map, coords, slab, start)
            })
        })?;

        let residual_sum: f64 = self.residuals.iter().map(|v| v * v).sum();
        self.residual_track.push(residual_sum);
        Ok(())
    }

    fn run_reconstruct(&mut self) {
        let config = self.config;
        let d = config.dimensions();
        let size = &config.geometry.size;
        let total: usize = size.iter().product();
        let plane: usize = size[..d - 1].iter().product();
        let slow = size[d - 1];
        let units = self.config.work_units.max(1).min(slow);
        let chunk = slow.div_ceil(units);

        let map = ParametricMap::for_lattice(config, self.phi.extent(), self.epsilon);
        let mut out = Array2::<f64>::zeros((total, self.phi.components()));

        {
            let phi = &self.phi;
            let kernels = &self.kernels;
            let mut slabs = Vec::with_capacity(units);
            let mut rest = out.view_mut();
            let mut z = 0;
            while z < slow {
                let z_end = (z + chunk).min(slow);
                let (head, tail) = rest.split_at(Axis(0), (z_end - z) * plane);
                slabs.push(((z, z_end), head));
                rest = tail;
                z = z_end;
            }
            debug_assert_eq!(rest.nrows(), 0);

            self.pool.install(|| {
                slabs.into_par_iter().for_each(|((z0, z1), slab)| {
                    reconstruct_region(phi, config, kernels, &map, (z0, z1), slab);
                });
            });
        }

        self.output = Some(out);
    }
}

/// Split `n` points into contiguous ranges, one per work unit. The last
/// range absorbs the remainder.
fn point_ranges(n: usize, units: usize) -> Vec<(usize, usize)> {
    let per_unit = n / units;
    (0..units)
        .map(|i| {
            let start = i * per_unit;
            let end = if i + 1 == units { n } else { start + per_unit };
            (start, end)
        })
        .collect()
}

fn lattice_extent(config: &FitConfig, control_points: &[usize]) -> Vec<usize> {
    control_points
        .iter()
        .zip(&config.spline_order)
        .zip(&config.close_dimension)
        .map(|((&c, &o), &closed)| if closed { c - o } else { c })
        .collect()
}

/// Epsilon used for boundary snapping in parametric space. An explicit
/// override is taken as-is; otherwise the tolerance is widened until it is
/// representable against the largest span count of the fit.
fn working_epsilon(config: &FitConfig) -> f64 {
    if let Some(epsilon) = config.epsilon {
        return epsilon;
    }
    let mut max_spans = 0usize;
    for i in 0..config.dimensions() {
        let spans = (config.control_points[i] - config.spline_order[i])
            << (config.levels[i] - 1);
        max_spans = max_spans.max(spans);
    }
    let mut epsilon = 100.0 * f64::EPSILON;
    while max_spans as f64 - epsilon == max_spans as f64 {
        epsilon *= 10.0;
    }
    epsilon
}

/// Physical geometry of the fitted control lattice: the parametric domain of
/// the output grid, re-expressed over the lattice's cells.
fn derive_lattice_geometry(config: &FitConfig, extent: &[usize]) -> GridGeometry {
    let d = config.dimensions();
    let mut spacing = vec![0.0; d];
    let mut local_origin = Array1::<f64>::zeros(d);
    for i in 0..d {
        let domain = config.geometry.spacing[i] * (config.geometry.size[i] - 1) as f64;
        let mut spans = extent[i];
        if !config.close_dimension[i] {
            spans -= config.spline_order[i];
        }
        spacing[i] = domain / spans as f64;
        local_origin[i] = -0.5 * spacing[i] * (config.spline_order[i] as f64 - 1.0);
    }
    let rotated = config.geometry.direction.dot(&local_origin);
    let origin: Vec<f64> = rotated
        .iter()
        .zip(&config.geometry.origin)
        .map(|(r, o)| r + o)
        .collect();
    GridGeometry {
        size: extent.to_vec(),
        spacing,
        origin,
        direction: config.geometry.direction.clone(),
    }
}

/// Dense samples of the fitted spline over the configured output grid, one
/// row per grid cell with dimension 0 varying fastest.
#[derive(Clone, Debug)]
pub struct SampledGrid {
    pub geometry: GridGeometry,
    pub values: Array2<f64>,
}

impl SampledGrid {
    /// Value vector at a grid index.
    pub fn value(&self, index: &[usize]) -> ArrayView1<'_, f64> {
        let mut n = 0;
        let mut stride = 1;
        for (i, &e) in self.geometry.size.iter().enumerate() {
            n += index[i] * stride;
            stride *= e;
        }
        self.values.row(n)
    }
}

/// The fitted control lattice and its physical placement.
#[derive(Clone, Debug)]
pub struct ControlLattice {
    pub geometry: GridGeometry,
    pub lattice: Lattice,
}

#[derive(Clone, Debug)]
pub struct FitOutput {
    /// Present unless the fit ran with `generate_output` disabled.
    pub grid: Option<SampledGrid>,
    pub lattice: ControlLattice,
    /// Sum of squared residual values before the fit and after each level
    /// transition. Non-increasing for a well-posed fit.
    pub residual_sum_squares: Vec<f64>,
}

/// Fit a multilevel B-spline to scattered, optionally weighted, vector-valued
/// data.
///
/// `coords` holds one physical point per row, `data` the value vector
/// observed at that point. Points must lie inside the domain spanned by the
/// configured output grid. When `weights` is `None` every point counts
/// equally.
pub fn fit_scattered<'a>(
    coords: ArrayView2<'a, f64>,
    data: ArrayView2<'_, f64>,
    weights: Option<ArrayView1<'_, f64>>,
    config: &'a FitConfig,
) -> Result<FitOutput, FitError> {
    config.validate()?;
    let d = config.dimensions();
    let n = coords.nrows();
    if coords.ncols() != d {
        return Err(FitError::DimensionMismatch {
            name: "point coordinates",
            expected: d,
            found: coords.ncols(),
        });
    }
    if data.nrows() != n {
        return Err(FitError::PointDataCountMismatch {
            points: n,
            values: data.nrows(),
        });
    }
    if let Some(w) = &weights {
        if w.len() != n {
            return Err(FitError::WeightCountMismatch {
                weights: w.len(),
                points: n,
            });
        }
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.work_units.max(1))
        .build()
        .map_err(|e| FitError::ThreadPool(e.to_string()))?;

    let weights = weights
        .map(|w| w.to_owned())
        .unwrap_or_else(|| Array1::ones(n));
    let residuals = data.to_owned();
    let initial_residual: f64 = residuals.iter().map(|v| v * v).sum();
    let kernels: Vec<BSplineKernel> = config
        .spline_order
        .iter()
        .map(|&o| BSplineKernel::new(o))
        .collect();
    let extent = lattice_extent(config, &config.control_points);

    log::debug!(
        "fitting {} points ({} components) over a {:?} grid",
        n,
        data.ncols(),
        config.geometry.size
    );

    let mut orchestrator = Orchestrator {
        pool,
        config,
        coords,
        weights,
        residuals,
        epsilon: working_epsilon(config),
        current_control_points: config.control_points.clone(),
        phi: Lattice::zeros(&extent, data.ncols()),
        output: None,
        kernels,
        residual_track: vec![initial_residual],
    };

    orchestrator.run_phase(Phase::Fit)?;

    let max_levels = config.levels.iter().copied().max().unwrap_or(1);
    if max_levels > 1 {
        let mut masks_by_order = BTreeMap::new();
        for &order in &config.spline_order {
            if !masks_by_order.contains_key(&order) {
                masks_by_order.insert(order, refinement_coefficients(order)?);
            }
        }
        let coefficients: Vec<Array2<f64>> = config
            .spline_order
            .iter()
            .map(|order| masks_by_order[order].clone())
            .collect();

        let mut psi = Lattice::zeros(orchestrator.phi.extent(), data.ncols());
        for level in 1..max_levels {
            orchestrator.run_phase(Phase::UpdateResiduals)?;
            psi.add_assign(&orchestrator.phi);
            psi = refine_lattice(
                &psi,
                config,
                &orchestrator.current_control_points,
                level,
                &coefficients,
            );
            for i in 0..d {
                if level < config.levels[i] {
                    orchestrator.current_control_points[i] =
                        2 * orchestrator.current_control_points[i] - config.spline_order[i];
                }
            }
            log::debug!(
                "level {}: control points {:?}, residual sum of squares {:.6e}",
                level,
                orchestrator.current_control_points,
                orchestrator
                    .residual_track
                    .last()
                    .copied()
                    .unwrap_or(f64::NAN)
            );
            orchestrator.run_phase(Phase::Fit)?;
        }
        psi.add_assign(&orchestrator.phi);
        orchestrator.phi = psi;
    }

    if config.generate_output {
        orchestrator.run_phase(Phase::Reconstruct)?;
    }

    let Orchestrator {
        phi,
        output,
        residual_track,
        ..
    } = orchestrator;

    let lattice_geometry = derive_lattice_geometry(config, phi.extent());
    let grid = output.map(|values| SampledGrid {
        geometry: config.geometry.clone(),
        values,
    });

    Ok(FitOutput {
        grid,
        lattice: ControlLattice {
            geometry: lattice_geometry,
            lattice: phi,
        },
        residual_sum_squares: residual_track,
    })
}
