//! Dense rating matrices with explicit missingness.
//!
//! A missing cell is stored as `f64::NAN`. The observation indicator is
//! always derived from the data (`is_observed`), never stored separately,
//! so the two can not drift apart.

use std::fmt;

/// Marker value for an unobserved cell.
pub const MISSING: f64 = f64::NAN;

/// A dense row-major `nrows x ncols` matrix of `f64` values.
///
/// Used both for rating matrices (where `NAN` marks a missing rating) and
/// for latent factor matrices (which are always fully observed).
#[derive(Clone)]
pub struct Matrix {
    nrows: usize,
    ncols: usize,
    data: Vec<f64>,
}

/// Cell-wise equality where two missing cells compare equal.
impl PartialEq for Matrix {
    fn eq(&self, other: &Self) -> bool {
        self.shape() == other.shape()
            && self
                .data
                .iter()
                .zip(&other.data)
                .all(|(a, b)| a == b || (a.is_nan() && b.is_nan()))
    }
}

impl fmt::Debug for Matrix {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Matrix")
            .field("nrows", &self.nrows)
            .field("ncols", &self.ncols)
            .field("observed", &self.count_observed())
            .finish()
    }
}

impl Matrix {
    pub fn zeros(nrows: usize, ncols: usize) -> Self {
        Self::filled(nrows, ncols, 0.0)
    }

    pub fn filled(nrows: usize, ncols: usize, value: f64) -> Self {
        Matrix {
            nrows,
            ncols,
            data: vec![value; nrows * ncols],
        }
    }

    /// Build a matrix from row-major data. `data.len()` must be
    /// `nrows * ncols`.
    pub fn from_vec(nrows: usize, ncols: usize, data: Vec<f64>) -> Self {
        assert_eq!(
            data.len(),
            nrows * ncols,
            "row-major data of length {} does not fill a {}x{} matrix",
            data.len(),
            nrows,
            ncols
        );
        Matrix { nrows, ncols, data }
    }

    pub fn nrows(&self) -> usize {
        self.nrows
    }

    pub fn ncols(&self) -> usize {
        self.ncols
    }

    pub fn shape(&self) -> (usize, usize) {
        (self.nrows, self.ncols)
    }

    #[inline]
    pub fn get(&self, row: usize, col: usize) -> f64 {
        self.data[row * self.ncols + col]
    }

    #[inline]
    pub fn set(&mut self, row: usize, col: usize, value: f64) {
        self.data[row * self.ncols + col] = value;
    }

    #[inline]
    pub fn is_observed(&self, row: usize, col: usize) -> bool {
        !self.get(row, col).is_nan()
    }

    pub fn row(&self, row: usize) -> &[f64] {
        &self.data[row * self.ncols..(row + 1) * self.ncols]
    }

    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    pub fn into_vec(self) -> Vec<f64> {
        self.data
    }

    /// Iterate over observed cells as `(row, col, value)`.
    pub fn observed_cells(&self) -> impl Iterator<Item = (usize, usize, f64)> + '_ {
        self.data.iter().enumerate().filter_map(move |(idx, &v)| {
            (!v.is_nan()).then_some((idx / self.ncols, idx % self.ncols, v))
        })
    }

    pub fn count_observed(&self) -> usize {
        self.data.iter().filter(|v| !v.is_nan()).count()
    }

    pub fn count_missing(&self) -> usize {
        self.data.len() - self.count_observed()
    }

    /// Mean of the observed cells, or `None` if every cell is missing.
    pub fn global_mean(&self) -> Option<f64> {
        let mut sum = 0.0;
        let mut count = 0usize;
        for &v in &self.data {
            if !v.is_nan() {
                sum += v;
                count += 1;
            }
        }
        (count > 0).then(|| sum / count as f64)
    }

    /// A copy with every missing cell replaced by the global observed mean.
    ///
    /// Returns `None` if the matrix has no observed cell at all. The copy is
    /// only suitable for hyperparameter derivation; the original matrix
    /// keeps the true missingness mask.
    pub fn mean_imputed(&self) -> Option<Matrix> {
        let mean = self.global_mean()?;
        let data = self
            .data
            .iter()
            .map(|&v| if v.is_nan() { mean } else { v })
            .collect();
        Some(Matrix {
            nrows: self.nrows,
            ncols: self.ncols,
            data,
        })
    }

    /// Population variance of each row. Intended for fully observed
    /// matrices; `NAN` cells poison the affected row.
    pub fn row_variances(&self) -> Vec<f64> {
        (0..self.nrows)
            .map(|i| crate::math::variance(self.row(i)))
            .collect()
    }

    /// Population variance of each column.
    pub fn col_variances(&self) -> Vec<f64> {
        (0..self.ncols)
            .map(|j| {
                let col: Vec<f64> = (0..self.nrows).map(|i| self.get(i, j)).collect();
                crate::math::variance(&col)
            })
            .collect()
    }

    /// Frobenius norm. `NAN` cells are not allowed here.
    pub fn frob_norm(&self) -> f64 {
        self.data.iter().map(|v| v * v).sum::<f64>().sqrt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use pretty_assertions::assert_eq;

    fn sample() -> Matrix {
        Matrix::from_vec(2, 3, vec![1.0, MISSING, 3.0, MISSING, 5.0, 6.0])
    }

    #[test]
    fn counts_and_indicator() {
        let m = sample();
        assert_eq!(m.count_observed(), 4);
        assert_eq!(m.count_missing(), 2);
        assert!(m.is_observed(0, 0));
        assert!(!m.is_observed(0, 1));
        assert_eq!(
            m.observed_cells().collect::<Vec<_>>(),
            vec![(0, 0, 1.0), (0, 2, 3.0), (1, 1, 5.0), (1, 2, 6.0)]
        );
    }

    #[test]
    fn mean_imputation_fills_only_missing_cells() {
        let m = sample();
        let imputed = m.mean_imputed().unwrap();
        let mean = (1.0 + 3.0 + 5.0 + 6.0) / 4.0;
        assert_abs_diff_eq!(imputed.get(0, 1), mean);
        assert_abs_diff_eq!(imputed.get(1, 0), mean);
        assert_abs_diff_eq!(imputed.get(0, 0), 1.0);
        assert_eq!(imputed.count_missing(), 0);
        // the source keeps its mask
        assert_eq!(m.count_missing(), 2);
    }

    #[test]
    fn all_missing_has_no_mean() {
        let m = Matrix::filled(2, 2, MISSING);
        assert!(m.global_mean().is_none());
        assert!(m.mean_imputed().is_none());
    }

    #[test]
    fn variances() {
        let m = Matrix::from_vec(2, 2, vec![1.0, 3.0, 2.0, 2.0]);
        let rows = m.row_variances();
        assert_abs_diff_eq!(rows[0], 1.0);
        assert_abs_diff_eq!(rows[1], 0.0);
        let cols = m.col_variances();
        assert_abs_diff_eq!(cols[0], 0.25);
        assert_abs_diff_eq!(cols[1], 0.25);
    }

    #[test]
    fn frobenius_norm() {
        let m = Matrix::from_vec(2, 2, vec![3.0, 0.0, 4.0, 0.0]);
        assert_abs_diff_eq!(m.frob_norm(), 5.0);
    }
}
