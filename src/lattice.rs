//! Control-point lattices.
//!
//! A lattice is a dense D-dimensional grid of vector-valued cells, stored as
//! a `cells x components` matrix with dimension 0 varying fastest in the flat
//! cell index. All of the fitting, refinement, and evaluation stages exchange
//! lattices in this layout.

use ndarray::{Array2, ArrayView1, ArrayViewMut1};

#[derive(Clone, Debug)]
pub struct Lattice {
    extent: Vec<usize>,
    strides: Vec<usize>,
    values: Array2<f64>,
}

impl Lattice {
    /// A lattice of the given per-dimension extent, filled with zeros.
    pub fn zeros(extent: &[usize], components: usize) -> Self {
        Self::from_elem(extent, components, 0.0)
    }

    pub fn from_elem(extent: &[usize], components: usize, fill: f64) -> Self {
        let mut strides = Vec::with_capacity(extent.len());
        let mut stride = 1;
        for &e in extent {
            strides.push(stride);
            stride *= e;
        }
        Self {
            extent: extent.to_vec(),
            strides,
            values: Array2::from_elem((stride, components), fill),
        }
    }

    pub fn dims(&self) -> usize {
        self.extent.len()
    }

    pub fn extent(&self) -> &[usize] {
        &self.extent
    }

    pub fn components(&self) -> usize {
        self.values.ncols()
    }

    pub fn num_cells(&self) -> usize {
        self.values.nrows()
    }

    /// Flat offset of a multi-index. The caller keeps indices in range.
    #[inline]
    pub fn offset_of(&self, index: &[usize]) -> usize {
        index
            .iter()
            .zip(&self.strides)
            .map(|(i, s)| i * s)
            .sum()
    }

    #[inline]
    pub fn value(&self, offset: usize) -> ArrayView1<'_, f64> {
        self.values.row(offset)
    }

    #[inline]
    pub fn value_mut(&mut self, offset: usize) -> ArrayViewMut1<'_, f64> {
        self.values.row_mut(offset)
    }

    pub fn values(&self) -> &Array2<f64> {
        &self.values
    }

    pub fn values_mut(&mut self) -> &mut Array2<f64> {
        &mut self.values
    }

    /// Cell-wise accumulation of an identically shaped lattice.
    pub fn add_assign(&mut self, other: &Lattice) {
        debug_assert_eq!(self.extent, other.extent);
        self.values += &other.values;
    }
}

/// Decompose a flat cell index into per-dimension coordinates, dimension 0
/// fastest.
#[inline]
pub(crate) fn decode_index(mut n: usize, extent: &[usize], out: &mut [usize]) {
    for (o, &e) in out.iter_mut().zip(extent) {
        *o = n % e;
        n /= e;
    }
}
