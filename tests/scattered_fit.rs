use approx::assert_abs_diff_eq;
use mba::{fit_scattered, FitConfig, FitError, GridGeometry};
use ndarray::{array, Array1, Array2};

/// Four corner points of the unit square with a saddle pattern: opposite
/// corners share their value.
fn corner_data() -> (Array2<f64>, Array2<f64>) {
    let coords = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
    let data = array![[0.0], [1.0], [1.0], [0.0]];
    (coords, data)
}

fn corner_config() -> FitConfig {
    FitConfig::new(GridGeometry::axis_aligned(
        vec![5, 5],
        vec![0.25, 0.25],
        vec![0.0, 0.0],
    ))
}

#[test]
fn single_level_corner_fit_matches_reference_values() {
    let (coords, data) = corner_data();
    let config = corner_config().with_work_units(2);

    let fit = fit_scattered(coords.view(), data.view(), None, &config)
        .expect("corner fit should succeed");
    let grid = fit.grid.expect("output grid was requested");

    // A single level with the minimal lattice underfits, but the saddle
    // structure must come through.
    assert_abs_diff_eq!(grid.value(&[2, 2])[0], 0.7629757785467114, epsilon = 1e-6);
    assert_abs_diff_eq!(grid.value(&[0, 0])[0], 0.3979665940450259, epsilon = 1e-6);
    assert_abs_diff_eq!(grid.value(&[4, 0])[0], 0.8511683540518582, epsilon = 1e-6);
    assert_abs_diff_eq!(grid.value(&[0, 4])[0], 0.8511683540518582, epsilon = 1e-6);
    assert_abs_diff_eq!(grid.value(&[4, 4])[0], 0.3979665940450259, epsilon = 1e-6);

    // Corners stay within a loose band of their data values.
    assert!((grid.value(&[0, 0])[0] - 0.0).abs() < 0.45);
    assert!((grid.value(&[4, 0])[0] - 1.0).abs() < 0.45);

    // The data and geometry are symmetric under transposition.
    for y in 0..5 {
        for x in 0..5 {
            assert_abs_diff_eq!(
                grid.value(&[x, y])[0],
                grid.value(&[y, x])[0],
                epsilon = 1e-9
            );
        }
    }
}

#[test]
fn three_level_corner_fit_interpolates_the_corners() {
    let (coords, data) = corner_data();
    let config = corner_config().with_levels(vec![3, 3]).with_work_units(2);

    let fit = fit_scattered(coords.view(), data.view(), None, &config)
        .expect("multilevel corner fit should succeed");
    let grid = fit.grid.expect("output grid was requested");

    // With three levels the four isolated points are reproduced essentially
    // exactly.
    assert_abs_diff_eq!(grid.value(&[0, 0])[0], 0.0, epsilon = 1e-9);
    assert_abs_diff_eq!(grid.value(&[4, 0])[0], 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(grid.value(&[0, 4])[0], 1.0, epsilon = 1e-9);
    assert_abs_diff_eq!(grid.value(&[4, 4])[0], 0.0, epsilon = 1e-9);
    assert_abs_diff_eq!(grid.value(&[2, 2])[0], 0.7076124567474034, epsilon = 1e-6);
}

#[test]
fn unit_weights_match_default_weights() {
    let (coords, data) = corner_data();
    let config = corner_config().with_work_units(1);

    let implicit = fit_scattered(coords.view(), data.view(), None, &config)
        .expect("unweighted fit should succeed");
    let weights = Array1::<f64>::ones(coords.nrows());
    let explicit = fit_scattered(coords.view(), data.view(), Some(weights.view()), &config)
        .expect("weighted fit should succeed");

    let a = implicit.grid.expect("grid").values;
    let b = explicit.grid.expect("grid").values;
    assert_eq!(a, b);
}

#[test]
fn fit_only_mode_skips_the_output_grid() {
    let (coords, data) = corner_data();
    let config = corner_config().fit_only();

    let fit = fit_scattered(coords.view(), data.view(), None, &config)
        .expect("lattice-only fit should succeed");
    assert!(fit.grid.is_none());

    // Cubic lattice over one span per dimension.
    assert_eq!(fit.lattice.lattice.extent(), &[4, 4]);

    // The lattice geometry re-expresses the physical domain over the
    // lattice cells: one span over [0, 1] gives unit spacing, and the cubic
    // support pushes the origin one cell before the domain.
    let geometry = &fit.lattice.geometry;
    for i in 0..2 {
        assert_abs_diff_eq!(geometry.spacing[i], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(geometry.origin[i], -1.0, epsilon = 1e-12);
    }
}

#[test]
fn empty_point_set_yields_a_zero_fit() {
    let coords = Array2::<f64>::zeros((0, 2));
    let data = Array2::<f64>::zeros((0, 1));
    let config = corner_config().with_work_units(2);

    let fit = fit_scattered(coords.view(), data.view(), None, &config)
        .expect("empty fit should succeed");
    let grid = fit.grid.expect("grid");
    assert!(grid.values.iter().all(|&v| v == 0.0));
    assert!(fit
        .lattice
        .lattice
        .values()
        .iter()
        .all(|&v| v == 0.0));
    assert_eq!(fit.residual_sum_squares, vec![0.0]);
}

#[test]
fn point_outside_the_grid_domain_is_rejected() {
    let coords = array![[0.5, 0.5], [1.5, 0.5]];
    let data = array![[1.0], [1.0]];
    let config = corner_config();

    let err = fit_scattered(coords.view(), data.view(), None, &config)
        .expect_err("out-of-domain point must fail");
    assert!(matches!(err, FitError::OutsideParametricDomain { .. }));
}

#[test]
fn mismatched_inputs_are_rejected() {
    let (coords, data) = corner_data();
    let config = corner_config();

    let short_data = data.slice(ndarray::s![0..3, ..]);
    assert!(matches!(
        fit_scattered(coords.view(), short_data, None, &config),
        Err(FitError::PointDataCountMismatch {
            points: 4,
            values: 3
        })
    ));

    let bad_weights = Array1::<f64>::ones(3);
    assert!(matches!(
        fit_scattered(coords.view(), data.view(), Some(bad_weights.view()), &config),
        Err(FitError::WeightCountMismatch {
            weights: 3,
            points: 4
        })
    ));

    let bad_config = corner_config().with_control_points(vec![3, 4]);
    assert!(matches!(
        fit_scattered(coords.view(), data.view(), None, &bad_config),
        Err(FitError::TooFewControlPoints { dimension: 0, .. })
    ));
}

#[test]
fn heavier_weight_pulls_the_fit_toward_its_point() {
    let (coords, data) = corner_data();
    let config = corner_config().with_work_units(1);

    let uniform = fit_scattered(coords.view(), data.view(), None, &config)
        .expect("uniform fit should succeed");
    let weights = array![1.0, 10.0, 1.0, 1.0];
    let skewed = fit_scattered(coords.view(), data.view(), Some(weights.view()), &config)
        .expect("skewed fit should succeed");

    let u = uniform.grid.expect("grid");
    let s = skewed.grid.expect("grid");
    // Grid corner nearest the upweighted point (1, 0), whose data value is 1.
    assert!(s.value(&[4, 0])[0] > u.value(&[4, 0])[0]);
}

#[test]
fn vector_valued_data_fits_componentwise() {
    let coords = array![[0.0, 0.0], [1.0, 0.0], [0.0, 1.0], [1.0, 1.0]];
    let data = array![[0.0, 0.0], [1.0, 2.0], [1.0, 2.0], [0.0, 0.0]];
    let config = corner_config().with_work_units(1);

    let fit = fit_scattered(coords.view(), data.view(), None, &config)
        .expect("vector-valued fit should succeed");
    let grid = fit.grid.expect("grid");

    // The second component is the first scaled by two, and the fit is
    // linear in the data.
    for y in 0..5 {
        for x in 0..5 {
            let v = grid.value(&[x, y]);
            assert_abs_diff_eq!(v[1], 2.0 * v[0], epsilon = 1e-9);
        }
    }
}
