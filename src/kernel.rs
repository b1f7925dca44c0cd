//! B-spline kernel evaluation.
//!
//! The centered B-spline basis function of order `n` is supported on
//! `[-(n+1)/2, (n+1)/2]`. Orders 0 through 3 have hand-written closed forms;
//! higher orders evaluate the piecewise polynomials produced by the
//! Cox-de Boor recursion over a uniform knot vector.

use ndarray::Array2;

/// Evaluator for the centered B-spline basis function of a fixed order.
///
/// The low orders dominate real workloads, so they dispatch to closed-form
/// kernels; any other order carries its precomputed shape-function
/// polynomials.
#[derive(Clone, Debug)]
pub enum BSplineKernel {
    Order0,
    Order1,
    Order2,
    Order3,
    General(GeneralKernel),
}

impl BSplineKernel {
    pub fn new(order: usize) -> Self {
        match order {
            0 => BSplineKernel::Order0,
            1 => BSplineKernel::Order1,
            2 => BSplineKernel::Order2,
            3 => BSplineKernel::Order3,
            _ => BSplineKernel::General(GeneralKernel::new(order)),
        }
    }

    pub fn order(&self) -> usize {
        match self {
            BSplineKernel::Order0 => 0,
            BSplineKernel::Order1 => 1,
            BSplineKernel::Order2 => 2,
            BSplineKernel::Order3 => 3,
            BSplineKernel::General(k) => k.order,
        }
    }

    /// Evaluate the kernel at the centered offset `u`. Returns 0 outside the
    /// basis support.
    #[inline]
    pub fn evaluate(&self, u: f64) -> f64 {
        match self {
            BSplineKernel::Order0 => evaluate_order0(u),
            BSplineKernel::Order1 => evaluate_order1(u),
            BSplineKernel::Order2 => evaluate_order2(u),
            BSplineKernel::Order3 => evaluate_order3(u),
            BSplineKernel::General(k) => k.evaluate(u),
        }
    }
}

#[inline]
fn evaluate_order0(u: f64) -> f64 {
    let a = u.abs();
    if a < 0.5 {
        1.0
    } else if a == 0.5 {
        0.5
    } else {
        0.0
    }
}

#[inline]
fn evaluate_order1(u: f64) -> f64 {
    let a = u.abs();
    if a < 1.0 { 1.0 - a } else { 0.0 }
}

#[inline]
fn evaluate_order2(u: f64) -> f64 {
    let a = u.abs();
    if a < 0.5 {
        0.75 - a * a
    } else if a < 1.5 {
        let t = a - 1.5;
        0.5 * t * t
    } else {
        0.0
    }
}

#[inline]
fn evaluate_order3(u: f64) -> f64 {
    let a = u.abs();
    if a < 1.0 {
        (a * a * (3.0 * a - 6.0) + 4.0) / 6.0
    } else if a < 2.0 {
        let t = 2.0 - a;
        t * t * t / 6.0
    } else {
        0.0
    }
}

/// Generic kernel for orders without a closed-form fast path.
///
/// Holds one polynomial per piece of the positive half-axis of the (even)
/// kernel; row `k` covers the k-th knot span to the right of the symmetry
/// center, with coefficients stored in descending powers.
#[derive(Clone, Debug)]
pub struct GeneralKernel {
    order: usize,
    pieces: Array2<f64>,
}

impl GeneralKernel {
    pub fn new(order: usize) -> Self {
        Self {
            order,
            pieces: half_axis_shape_functions(order),
        }
    }

    #[inline]
    pub fn evaluate(&self, u: f64) -> f64 {
        let a = u.abs();
        // Odd orders break pieces at integers, even orders at half-integers.
        let which = if self.order % 2 == 0 {
            (a + 0.5) as usize
        } else {
            a as usize
        };
        if which < self.pieces.nrows() {
            horner(self.pieces.row(which).as_slice().unwrap_or(&[]), a)
        } else {
            0.0
        }
    }
}

#[inline]
fn horner(coefficients: &[f64], x: f64) -> f64 {
    let mut acc = 0.0;
    for &c in coefficients {
        acc = acc * x + c;
    }
    acc
}

/// Dense polynomial with coefficients in descending powers of x.
#[derive(Clone, Debug)]
struct Polynomial(Vec<f64>);

impl Polynomial {
    fn constant(c: f64) -> Self {
        Polynomial(vec![c])
    }

    fn add(&self, other: &Polynomial) -> Polynomial {
        let n = self.0.len().max(other.0.len());
        let mut out = vec![0.0; n];
        for (i, &c) in self.0.iter().enumerate() {
            out[n - self.0.len() + i] += c;
        }
        for (i, &c) in other.0.iter().enumerate() {
            out[n - other.0.len() + i] += c;
        }
        Polynomial(out)
    }

    fn mul(&self, other: &Polynomial) -> Polynomial {
        let mut out = vec![0.0; self.0.len() + other.0.len() - 1];
        for (i, &a) in self.0.iter().enumerate() {
            for (j, &b) in other.0.iter().enumerate() {
                out[i + j] += a * b;
            }
        }
        Polynomial(out)
    }

    /// Coefficients padded on the high-power side to exactly `len` entries.
    fn padded(&self, len: usize) -> Vec<f64> {
        let mut out = vec![0.0; len];
        let start = len - self.0.len();
        out[start..].copy_from_slice(&self.0);
        out
    }
}

/// Cox-de Boor recursion, returning the polynomial that basis function
/// `basis` takes on knot span `piece` of the given knot vector.
fn cox_de_boor(degree: usize, knots: &[f64], basis: usize, piece: usize) -> Polynomial {
    if degree == 0 {
        return Polynomial::constant(if basis == piece { 1.0 } else { 0.0 });
    }

    let mut result = Polynomial::constant(0.0);

    let den = knots[basis + degree] - knots[basis];
    if den != 0.0 {
        let linear = Polynomial(vec![1.0 / den, -knots[basis] / den]);
        result = result.add(&linear.mul(&cox_de_boor(degree - 1, knots, basis, piece)));
    }

    let den = knots[basis + degree + 1] - knots[basis + 1];
    if den != 0.0 {
        let linear = Polynomial(vec![-1.0 / den, knots[basis + degree + 1] / den]);
        result = result.add(&linear.mul(&cox_de_boor(degree - 1, knots, basis + 1, piece)));
    }

    result
}

/// Polynomial pieces of the centered kernel on the positive half-axis, one
/// row per knot span, evaluated directly at |u|.
fn half_axis_shape_functions(order: usize) -> Array2<f64> {
    let knots: Vec<f64> = (0..order + 2)
        .map(|j| -0.5 * (order as f64 + 1.0) + j as f64)
        .collect();
    let pieces = (order + 2) / 2;
    let mut m = Array2::<f64>::zeros((pieces, order + 1));
    for k in 0..pieces {
        let poly = cox_de_boor(order, &knots, 0, (order + 1) / 2 + k);
        m.row_mut(k)
            .iter_mut()
            .zip(poly.padded(order + 1))
            .for_each(|(dst, src)| *dst = src);
    }
    m
}

/// Shape functions of the `order+1` basis functions that are nonzero on the
/// unit knot span [0, 1), over a uniform integer knot vector. Row `i` is
/// basis function `i` (the one whose support ends at `i + 1`), coefficients
/// in descending powers. This is the matrix the refinement solver consumes.
pub fn shape_functions_on_unit_interval(order: usize) -> Array2<f64> {
    let knots: Vec<f64> = (0..2 * order + 2).map(|j| j as f64 - order as f64).collect();
    let mut m = Array2::<f64>::zeros((order + 1, order + 1));
    for i in 0..=order {
        let poly = cox_de_boor(order, &knots, i, order);
        m.row_mut(i)
            .iter_mut()
            .zip(poly.padded(order + 1))
            .for_each(|(dst, src)| *dst = src);
    }
    m
}
