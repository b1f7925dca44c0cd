//! Spline evaluation by successive lattice collapse.
//!
//! Evaluating a tensor-product spline at a parametric point contracts the
//! control lattice one dimension at a time, weighting `order + 1` slices by
//! the kernel until a single cell remains. The evaluator keeps the partially
//! collapsed lattices and, when consecutive queries share their trailing
//! parametric coordinates, reuses the contractions above the first changed
//! dimension. Scanning points in grid order makes most queries touch only
//! dimension 0.

use ndarray::{ArrayView2, ArrayViewMut2};

use crate::config::{FitConfig, FitError};
use crate::fit::ParametricMap;
use crate::kernel::BSplineKernel;
use crate::lattice::Lattice;

pub(crate) struct Collapser<'a> {
    phi: &'a Lattice,
    config: &'a FitConfig,
    kernels: &'a [BSplineKernel],
    /// Entry `i` holds the lattice with dimensions `0..i` still free and the
    /// rest collapsed; entry 0 is the evaluated value.
    collapsed: Vec<Lattice>,
    current_u: Vec<f64>,
}

impl<'a> Collapser<'a> {
    pub(crate) fn new(phi: &'a Lattice, config: &'a FitConfig, kernels: &'a [BSplineKernel]) -> Self {
        let d = phi.dims();
        let components = phi.components();
        let collapsed = (0..d)
            .map(|i| {
                let extent: Vec<usize> = (0..d)
                    .map(|k| if k < i { phi.extent()[k] } else { 1 })
                    .collect();
                Lattice::zeros(&extent, components)
            })
            .collect();
        Self {
            phi,
            config,
            kernels,
            collapsed,
            // Forces a full collapse on the first query.
            current_u: vec![-1.0; d],
        }
    }

    /// Spline value at the parametric point `u`, valid until the next call.
    pub(crate) fn evaluate(&mut self, u: &[f64]) -> ndarray::ArrayView1<'_, f64> {
        let d = self.current_u.len();
        for i in (0..d).rev() {
            if u[i] != self.current_u[i] {
                for j in (0..=i).rev() {
                    self.collapse_dimension(j, u[j]);
                }
                self.current_u[..=i].copy_from_slice(&u[..=i]);
                break;
            }
        }
        self.collapsed[0].value(0)
    }

    /// Contract dimension `dim` of the next-larger partial lattice at
    /// coordinate `u`, writing into `collapsed[dim]`.
    fn collapse_dimension(&mut self, dim: usize, u: f64) {
        let d = self.current_u.len();
        let order = self.config.spline_order[dim];
        let closed = self.config.close_dimension[dim];
        let kernel = &self.kernels[dim];

        let (head, tail) = self.collapsed.split_at_mut(dim + 1);
        let target = &mut head[dim];
        let source = if dim + 1 == d { self.phi } else { &tail[0] };

        // Dimensions below `dim` lay out identically in source and target,
        // so the slice at position k of dimension `dim` starts at offset
        // k * target_cells in the source.
        let stride = target.num_cells();
        let span_extent = source.extent()[dim];
        let base = u as usize;

        for n in 0..stride {
            target.value_mut(n).fill(0.0);
        }
        for k in 0..=order {
            let v = u - (base + k) as f64 + 0.5 * (order as f64 - 1.0);
            let weight = kernel.evaluate(v);
            let mut slice = base + k;
            if closed {
                slice %= span_extent;
            }
            for n in 0..stride {
                let row = source.value(n + slice * stride);
                target.value_mut(n).scaled_add(weight, &row);
            }
        }
    }
}

/// Subtract the current spline value from every residual row in the range.
/// `start` is the global index of the first row of `residuals`.
pub(crate) fn update_residual_range(
    phi: &Lattice,
    config: &FitConfig,
    kernels: &[BSplineKernel],
    map: &ParametricMap,
    coords: ArrayView2<'_, f64>,
    mut residuals: ArrayViewMut2<'_, f64>,
    start: usize,
) -> Result<(), FitError> {
    let d = config.dimensions();
    let mut collapser = Collapser::new(phi, config, kernels);
    let mut u = vec![0.0; d];
    for local in 0..residuals.nrows() {
        map.map_point(coords.row(start + local), &mut u)?;
        let value = collapser.evaluate(&u);
        let mut row = residuals.row_mut(local);
        row -= &value;
    }
    Ok(())
}

/// Sample the spline over the output-grid slab `slow_range` of the slowest
/// dimension, writing one row per grid sample in flat dimension-0-fastest
/// order.
pub(crate) fn reconstruct_region(
    phi: &Lattice,
    config: &FitConfig,
    kernels: &[BSplineKernel],
    map: &ParametricMap,
    slow_range: (usize, usize),
    mut out: ArrayViewMut2<'_, f64>,
) {
    let d = config.dimensions();
    let (z0, z1) = slow_range;
    let mut collapser = Collapser::new(phi, config, kernels);
    let mut index = vec![0usize; d];
    index[d - 1] = z0;
    let mut u = vec![0.0; d];

    for row in 0..out.nrows() {
        map.map_grid_index(config, &index, &mut u);
        let value = collapser.evaluate(&u);
        out.row_mut(row).assign(&value);

        for i in 0..d {
            index[i] += 1;
            let bound = if i == d - 1 { z1 } else { config.geometry.size[i] };
            if index[i] < bound {
                break;
            }
            index[i] = if i == d - 1 { z0 } else { 0 };
        }
    }
    debug_assert_eq!(index[d - 1], z0);
}
