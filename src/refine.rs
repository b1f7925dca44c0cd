//! Dyadic refinement of the running control-point lattice.
//!
//! Halving the knot spacing of a uniform B-spline doubles the control-point
//! density without changing the represented function. The per-dimension
//! subdivision masks come from equating the coarse and fine shape functions
//! on a knot span; the lattice walk then applies their tensor product around
//! every even fine index.

use ndarray::{s, Array1, Array2};

use crate::config::FitConfig;
use crate::kernel::shape_functions_on_unit_interval;
use crate::lattice::{decode_index, Lattice};
use crate::linalg::{svd_least_squares, LinalgError};

/// Subdivision masks for one dimension of the given spline order, as a
/// `2 x (order + 1)` matrix. Row 0 weights the coarse neighbors of an even
/// fine control point, row 1 those of an odd one.
pub fn refinement_coefficients(order: usize) -> Result<Array2<f64>, LinalgError> {
    let c = shape_functions_on_unit_interval(order);
    let cols = c.ncols();

    // Reparametrize the coarse shape functions to the half-width fine span
    // by scaling the descending power-basis coefficients.
    let mut scaled = c.clone();
    for j in 0..cols {
        let factor = (1u64 << (cols - 1 - j)) as f64;
        scaled.column_mut(j).mapv_inplace(|v| v * factor);
    }

    let coarse_on_fine = scaled.t().slice(s![..;-1, ..]).to_owned();
    let fine = c.t().slice(s![..;-1, ..]).to_owned();
    let x = svd_least_squares(coarse_on_fine.view(), fine.view())?;

    Ok(x.slice(s![0..2, ..]).to_owned())
}

/// Resample `psi` onto the next level's lattice. Dimensions whose level
/// budget is exhausted keep their control-point count; the rest double.
pub fn refine_lattice(
    psi: &Lattice,
    config: &FitConfig,
    current_control_points: &[usize],
    level: usize,
    coefficients: &[Array2<f64>],
) -> Lattice {
    let d = config.dimensions();
    let components = psi.components();

    let mut new_control_points = current_control_points.to_vec();
    for i in 0..d {
        if level < config.levels[i] {
            new_control_points[i] = 2 * new_control_points[i] - config.spline_order[i];
        }
    }
    let new_extent: Vec<usize> = new_control_points
        .iter()
        .zip(&config.spline_order)
        .zip(&config.close_dimension)
        .map(|((&c, &o), &closed)| if closed { c - o } else { c })
        .collect();

    let mut refined = Lattice::zeros(&new_extent, components);

    let fine_extent = vec![2usize; d];
    let fine_cells = 1usize << d;
    let coarse_extent: Vec<usize> = config.spline_order.iter().map(|&o| o + 1).collect();
    let coarse_cells: usize = coarse_extent.iter().product();

    let mut idx = vec![0usize; d];
    let mut idx_psi = vec![0usize; d];
    let mut off = vec![0usize; d];
    let mut off_psi = vec![0usize; d];
    let mut target = vec![0usize; d];
    let mut source = vec![0usize; d];
    let mut sum = Array1::<f64>::zeros(components);

    'outer: loop {
        for i in 0..d {
            idx_psi[i] = if level < config.levels[i] {
                idx[i] / 2
            } else {
                idx[i]
            };
        }

        'fine: for m in 0..fine_cells {
            decode_index(m, &fine_extent, &mut off);
            for j in 0..d {
                let t = idx[j] + off[j];
                if !config.close_dimension[j] {
                    if t >= new_control_points[j] {
                        continue 'fine;
                    }
                    target[j] = t;
                } else {
                    target[j] = t % new_extent[j];
                }
            }

            sum.fill(0.0);
            'coarse: for n in 0..coarse_cells {
                decode_index(n, &coarse_extent, &mut off_psi);
                for k in 0..d {
                    let t = idx_psi[k] + off_psi[k];
                    if !config.close_dimension[k] {
                        if t >= current_control_points[k] {
                            continue 'coarse;
                        }
                        source[k] = t;
                    } else {
                        source[k] = t % psi.extent()[k];
                    }
                }
                let mut coeff = 1.0;
                for k in 0..d {
                    coeff *= coefficients[k][[off[k], off_psi[k]]];
                }
                sum.scaled_add(coeff, &psi.value(psi.offset_of(&source)));
            }
            let cell = refined.offset_of(&target);
            refined.value_mut(cell).assign(&sum);
        }

        // Advance to the next all-even index of the refined extent.
        for i in 0..d {
            idx[i] += 2;
            if idx[i] < new_extent[i] {
                continue 'outer;
            }
            idx[i] = 0;
        }
        break;
    }

    refined
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GridGeometry;
    use approx::assert_abs_diff_eq;

    #[test]
    fn linear_subdivision_masks() {
        let c = refinement_coefficients(1).unwrap();
        assert_eq!(c.dim(), (2, 2));
        let expected = [[1.0, 0.0], [0.5, 0.5]];
        for i in 0..2 {
            for j in 0..2 {
                assert_abs_diff_eq!(c[[i, j]], expected[i][j], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn quadratic_subdivision_masks() {
        let c = refinement_coefficients(2).unwrap();
        let expected = [[0.75, 0.25, 0.0], [0.25, 0.75, 0.0]];
        for i in 0..2 {
            for j in 0..3 {
                assert_abs_diff_eq!(c[[i, j]], expected[i][j], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn cubic_subdivision_masks() {
        let c = refinement_coefficients(3).unwrap();
        let expected = [[0.5, 0.5, 0.0, 0.0], [0.125, 0.75, 0.125, 0.0]];
        for i in 0..2 {
            for j in 0..4 {
                assert_abs_diff_eq!(c[[i, j]], expected[i][j], epsilon = 1e-12);
            }
        }
    }

    #[test]
    fn mask_rows_sum_to_one() {
        for order in 1..=5 {
            let c = refinement_coefficients(order).unwrap();
            for row in c.rows() {
                assert_abs_diff_eq!(row.sum(), 1.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn constant_lattice_refines_to_constant() {
        let geometry = GridGeometry::axis_aligned(vec![9], vec![0.125], vec![0.0]);
        let config = FitConfig::new(geometry)
            .with_levels(vec![2])
            .with_control_points(vec![4]);
        let psi = Lattice::from_elem(&[4], 1, 2.5);
        let coefficients = vec![refinement_coefficients(3).unwrap()];
        let refined = refine_lattice(&psi, &config, &[4], 1, &coefficients);
        assert_eq!(refined.extent(), &[5]);
        for cell in 0..refined.num_cells() {
            assert_abs_diff_eq!(refined.value(cell)[0], 2.5, epsilon = 1e-12);
        }
    }
}
