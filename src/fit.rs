//! Control-point fitting for a single resolution level.
//!
//! Each scattered point scatters its weighted residual into the `(order+1)^D`
//! control points whose basis support covers it, accumulating a numerator
//! lattice (delta) and a denominator lattice (omega). Normalizing delta by
//! omega yields the level's control values.

use ndarray::{ArrayView1, ArrayView2};

use crate::config::{FitConfig, FitError};
use crate::kernel::BSplineKernel;
use crate::lattice::{decode_index, Lattice};

/// Affine map from physical coordinates into the parametric domain
/// `[0, spans)` of each dimension, with epsilon clamping at the boundaries.
/// The snapping tolerance scales with each dimension's span density.
pub(crate) struct ParametricMap {
    spans: Vec<f64>,
    scale: Vec<f64>,
    origin: Vec<f64>,
    eps: Vec<f64>,
}

impl ParametricMap {
    /// Map for a fitting pass with the given control-point counts.
    pub(crate) fn for_control_points(config: &FitConfig, control_points: &[usize], eps: f64) -> Self {
        let spans: Vec<f64> = control_points
            .iter()
            .zip(&config.spline_order)
            .map(|(&c, &o)| (c - o) as f64)
            .collect();
        Self::from_spans(config, spans, eps)
    }

    /// Map for evaluating a finished lattice. Closed dimensions store only
    /// the non-wrapped control points, so their span count equals the extent.
    pub(crate) fn for_lattice(config: &FitConfig, extent: &[usize], eps: f64) -> Self {
        let spans: Vec<f64> = extent
            .iter()
            .zip(&config.spline_order)
            .zip(&config.close_dimension)
            .map(|((&e, &o), &closed)| if closed { e as f64 } else { (e - o) as f64 })
            .collect();
        Self::from_spans(config, spans, eps)
    }

    fn from_spans(config: &FitConfig, spans: Vec<f64>, eps: f64) -> Self {
        let scale: Vec<f64> = spans
            .iter()
            .zip(&config.geometry.size)
            .zip(&config.geometry.spacing)
            .map(|((&s, &n), &dx)| {
                if n > 1 {
                    s / ((n - 1) as f64 * dx)
                } else {
                    0.0
                }
            })
            .collect();
        let eps = scale
            .iter()
            .zip(&config.geometry.spacing)
            .map(|(&r, &dx)| r * dx * eps)
            .collect();
        Self {
            spans,
            scale,
            origin: config.geometry.origin.clone(),
            eps,
        }
    }

    /// Physical point to parametric coordinates.
    pub(crate) fn map_point(
        &self,
        point: ArrayView1<'_, f64>,
        p: &mut [f64],
    ) -> Result<(), FitError> {
        for (dim, out) in p.iter_mut().enumerate() {
            *out = (point[dim] - self.origin[dim]) * self.scale[dim];
            clamp_to_domain(out, self.spans[dim], self.eps[dim], dim)?;
        }
        Ok(())
    }

    /// Output-grid index to parametric coordinates. Grid samples always land
    /// inside the closed domain, so only the upper-boundary snap applies.
    pub(crate) fn map_grid_index(&self, config: &FitConfig, index: &[usize], u: &mut [f64]) {
        for (dim, out) in u.iter_mut().enumerate() {
            let n = config.geometry.size[dim];
            *out = if n > 1 {
                self.spans[dim] * index[dim] as f64 / (n - 1) as f64
            } else {
                0.0
            };
            if *out >= self.spans[dim] {
                *out = self.spans[dim] - self.eps[dim];
            }
        }
    }
}

/// Snap values within epsilon of the domain boundaries back inside, and
/// reject everything farther out.
fn clamp_to_domain(p: &mut f64, spans: f64, eps: f64, dim: usize) -> Result<(), FitError> {
    if (*p - spans).abs() <= eps {
        *p = spans - eps;
    }
    if *p < 0.0 && -*p <= eps {
        *p = 0.0;
    }
    if *p < 0.0 || *p >= spans {
        return Err(FitError::OutsideParametricDomain {
            value: *p,
            dimension: dim,
            spans,
        });
    }
    Ok(())
}

/// Shared inputs of one fitting pass, borrowed by every worker.
pub(crate) struct FitJob<'a> {
    pub coords: ArrayView2<'a, f64>,
    pub residuals: ArrayView2<'a, f64>,
    pub weights: ArrayView1<'a, f64>,
    pub config: &'a FitConfig,
    pub kernels: &'a [BSplineKernel],
    pub map: &'a ParametricMap,
    pub extent: &'a [usize],
}

/// Accumulate the delta and omega lattices over one contiguous point range.
pub(crate) fn fit_point_range(
    job: &FitJob<'_>,
    start: usize,
    end: usize,
) -> Result<(Lattice, Lattice), FitError> {
    let d = job.config.dimensions();
    let components = job.residuals.ncols();
    let mut delta = Lattice::zeros(job.extent, components);
    let mut omega = Lattice::zeros(job.extent, 1);

    let neighborhood: Vec<usize> = job.config.spline_order.iter().map(|&o| o + 1).collect();
    let neighborhood_cells: usize = neighborhood.iter().product();

    let mut p = vec![0.0; d];
    let mut offset = vec![0usize; d];
    let mut index = vec![0usize; d];
    let mut basis = vec![0.0; neighborhood_cells];

    for n in start..end {
        let wc = job.weights[n];
        job.map.map_point(job.coords.row(n), &mut p)?;

        let mut w2_sum = 0.0;
        for (m, b_out) in basis.iter_mut().enumerate() {
            decode_index(m, &neighborhood, &mut offset);
            let mut b = 1.0;
            for i in 0..d {
                let base = p[i] as usize;
                let u = p[i] - (base + offset[i]) as f64
                    + 0.5 * (job.config.spline_order[i] as f64 - 1.0);
                b *= job.kernels[i].evaluate(u);
            }
            *b_out = b;
            w2_sum += b * b;
        }

        let residual = job.residuals.row(n);
        for (m, &b) in basis.iter().enumerate() {
            decode_index(m, &neighborhood, &mut offset);
            for i in 0..d {
                let mut cell = p[i] as usize + offset[i];
                if job.config.close_dimension[i] {
                    cell %= job.extent[i];
                }
                index[i] = cell;
            }
            let cell = delta.offset_of(&index);
            omega.value_mut(cell)[0] += wc * b * b;
            delta
                .value_mut(cell)
                .scaled_add(b * b * b * wc / w2_sum, &residual);
        }
    }

    Ok((delta, omega))
}

/// Divide delta by omega in place. Cells with zero accumulated weight, or
/// whose division produced non-finite values, are zeroed.
pub(crate) fn normalize_lattice(delta: &mut Lattice, omega: &Lattice) {
    for cell in 0..delta.num_cells() {
        let w = omega.value(cell)[0];
        let mut row = delta.value_mut(cell);
        if w == 0.0 {
            row.fill(0.0);
        } else {
            row.map_inplace(|v| {
                *v /= w;
                if !v.is_finite() {
                    *v = 0.0;
                }
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridGeometry;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    fn config_2d() -> FitConfig {
        FitConfig::new(GridGeometry::axis_aligned(
            vec![5, 5],
            vec![0.25, 0.25],
            vec![0.0, 0.0],
        ))
    }

    #[test]
    fn map_point_scales_into_span_units() {
        let config = config_2d();
        let map = ParametricMap::for_control_points(&config, &[4, 4], 1e-10);
        let mut p = [0.0; 2];
        // Domain is [0, 1] physical, one span per dimension.
        map.map_point(array![0.5, 0.25].view(), &mut p).unwrap();
        assert_abs_diff_eq!(p[0], 0.5, epsilon = 1e-12);
        assert_abs_diff_eq!(p[1], 0.25, epsilon = 1e-12);
    }

    #[test]
    fn upper_boundary_snaps_inside() {
        let config = config_2d();
        let eps = 1e-10;
        let map = ParametricMap::for_control_points(&config, &[4, 4], eps);
        let mut p = [0.0; 2];
        map.map_point(array![1.0, 1.0].view(), &mut p).unwrap();
        assert!(p[0] < 1.0);
        // The parametric tolerance is the base epsilon scaled by the span
        // density: 1 span over 4 grid steps.
        assert_abs_diff_eq!(p[0], 1.0 - 0.25 * eps, epsilon = 1e-15);

        // A point half a tolerance inside the boundary is still within the
        // snapping band and lands at spans - eps, not at its own value.
        let half_inside = 1.0 - 0.5 * 0.25 * eps;
        map.map_point(array![half_inside, 0.5].view(), &mut p)
            .unwrap();
        assert_abs_diff_eq!(p[0], 1.0 - 0.25 * eps, epsilon = 1e-15);
    }

    #[test]
    fn point_outside_domain_is_rejected() {
        let config = config_2d();
        let map = ParametricMap::for_control_points(&config, &[4, 4], 1e-10);
        let mut p = [0.0; 2];
        let err = map.map_point(array![1.5, 0.5].view(), &mut p).unwrap_err();
        assert!(matches!(
            err,
            FitError::OutsideParametricDomain { dimension: 0, .. }
        ));
    }

    #[test]
    fn grid_index_endpoints_stay_in_domain() {
        let config = config_2d();
        let eps = 1e-10;
        let map = ParametricMap::for_control_points(&config, &[4, 4], eps);
        let mut u = [0.0; 2];
        map.map_grid_index(&config, &[0, 4], &mut u);
        assert_eq!(u[0], 0.0);
        assert!(u[1] < 1.0);
    }

    #[test]
    fn normalize_zeroes_unsupported_cells() {
        let mut delta = Lattice::from_elem(&[2, 2], 1, 3.0);
        let mut omega = Lattice::zeros(&[2, 2], 1);
        omega.value_mut(0)[0] = 1.5;
        normalize_lattice(&mut delta, &omega);
        assert_abs_diff_eq!(delta.value(0)[0], 2.0, epsilon = 1e-12);
        for cell in 1..4 {
            assert_eq!(delta.value(cell)[0], 0.0);
        }
    }

    #[test]
    fn single_point_fit_reproduces_weighted_average_shape() {
        // One point with one residual component: delta/omega at the anchor
        // cell must equal B * value / sum(B^2) after normalization.
        let config = config_2d();
        let kernels: Vec<BSplineKernel> =
            config.spline_order.iter().map(|&o| BSplineKernel::new(o)).collect();
        let map = ParametricMap::for_control_points(&config, &[4, 4], 1e-10);
        let coords = array![[0.5, 0.5]];
        let residuals = array![[2.0]];
        let weights = array![1.0];
        let job = FitJob {
            coords: coords.view(),
            residuals: residuals.view(),
            weights: weights.view(),
            config: &config,
            kernels: &kernels,
            map: &map,
            extent: &[4, 4],
        };
        let (mut delta, omega) = fit_point_range(&job, 0, 1).unwrap();

        // All 16 cells of the 4x4 lattice receive weight from a cubic kernel
        // at the domain center.
        assert!((0..omega.num_cells()).all(|c| omega.value(c)[0] > 0.0));

        normalize_lattice(&mut delta, &omega);
        let mut p = [0.0; 2];
        map.map_point(coords.row(0), &mut p).unwrap();
        let b_center = kernels[0].evaluate(p[0] - 1.0 + 1.0) * kernels[1].evaluate(p[1] - 1.0 + 1.0);
        let mut w2 = 0.0;
        for m in 0..16 {
            let (i, j) = (m % 4, m / 4);
            let bi = kernels[0].evaluate(p[0] - i as f64 + 1.0);
            let bj = kernels[1].evaluate(p[1] - j as f64 + 1.0);
            w2 += (bi * bj) * (bi * bj);
        }
        assert_abs_diff_eq!(
            delta.value(delta.offset_of(&[1, 1]))[0],
            b_center * 2.0 / w2,
            epsilon = 1e-12
        );
    }
}
