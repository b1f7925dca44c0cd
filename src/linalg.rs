//! Dense least-squares via faer's SVD.
//!
//! The refinement-coefficient solve is the only dense linear algebra in the
//! crate. The systems are tiny (order+1 square), but the pseudoinverse path
//! keeps the solve well defined even when the shape-function matrix is rank
//! deficient.

use dyn_stack::{MemBuffer, MemStack};
use faer::diag::Diag;
use faer::linalg::svd::{self, ComputeSvdVectors};
use faer::{get_global_parallelism, Mat};
use ndarray::{Array2, ArrayView2};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinalgError {
    #[error("SVD failed to converge.")]
    SvdNoConvergence,
}

/// Minimum-norm least-squares solution of `a * x = b` through the SVD
/// pseudoinverse. Singular values below `eps * max(rows, cols) * s_max` are
/// treated as zero.
pub fn svd_least_squares(
    a: ArrayView2<'_, f64>,
    b: ArrayView2<'_, f64>,
) -> Result<Array2<f64>, LinalgError> {
    let (rows, cols) = a.dim();
    let mat = Mat::from_fn(rows, cols, |i, j| a[[i, j]]);

    let mut singular = Diag::<f64>::zeros(rows.min(cols));
    let mut u = Mat::<f64>::zeros(rows, rows);
    let mut v = Mat::<f64>::zeros(cols, cols);

    let par = get_global_parallelism();
    let mut mem = MemBuffer::new(svd::svd_scratch::<f64>(
        rows,
        cols,
        ComputeSvdVectors::Full,
        ComputeSvdVectors::Full,
        par,
        Default::default(),
    ));
    let stack = MemStack::new(&mut mem);

    svd::svd(
        mat.as_ref(),
        singular.as_mut(),
        Some(u.as_mut()),
        Some(v.as_mut()),
        par,
        stack,
        Default::default(),
    )
    .map_err(|_| LinalgError::SvdNoConvergence)?;

    let k = rows.min(cols);
    let singular_mat = singular.column_vector().as_mat();
    let singular_values: Vec<f64> = (0..k).map(|i| singular_mat[(i, 0)]).collect();
    let s_max = singular_values.iter().fold(0.0f64, |acc, &s| acc.max(s));
    let cutoff = f64::EPSILON * rows.max(cols) as f64 * s_max;

    // x = V * S^+ * U^T * b, column by column of b.
    let nrhs = b.ncols();
    let mut x = Array2::<f64>::zeros((cols, nrhs));
    for rhs in 0..nrhs {
        for (i, &s) in singular_values.iter().enumerate() {
            if s <= cutoff {
                continue;
            }
            let mut ut_b = 0.0;
            for r in 0..rows {
                ut_b += u[(r, i)] * b[[r, rhs]];
            }
            let scale = ut_b / s;
            for c in 0..cols {
                x[[c, rhs]] += v[(c, i)] * scale;
            }
        }
    }

    Ok(x)
}
