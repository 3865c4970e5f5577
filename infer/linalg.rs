//! Thin bridge between `ndarray` matrices and the `faer` Cholesky solver.

use faer::linalg::solvers::{self, Solve};
use faer::{Mat, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix1, Ix2};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("Cholesky factorization failed: {0:?}")]
    Cholesky(solvers::LltError),
    #[error("Dimension mismatch: system of order {system} with right-hand side of length {rhs}")]
    DimensionMismatch { system: usize, rhs: usize },
}

fn mat_to_array(mat: MatRef<'_, f64>) -> Array2<f64> {
    Array2::from_shape_fn((mat.nrows(), mat.ncols()), |(i, j)| mat[(i, j)])
}

enum FaerStorage<'a> {
    Borrowed(MatRef<'a, f64>),
    Owned(Mat<f64>),
}

impl FaerStorage<'_> {
    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        match self {
            FaerStorage::Borrowed(view) => *view,
            FaerStorage::Owned(mat) => mat.as_ref(),
        }
    }
}

struct FaerArrayView<'a> {
    storage: FaerStorage<'a>,
}

impl<'a> FaerArrayView<'a> {
    fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let storage = match array.as_slice() {
            Some(slice) => FaerStorage::Borrowed(MatRef::from_row_major_slice(
                slice,
                array.nrows(),
                array.ncols(),
            )),
            None => {
                let (rows, cols) = array.dim();
                FaerStorage::Owned(Mat::from_fn(rows, cols, |i, j| array[(i, j)]))
            }
        };
        Self { storage }
    }

    #[inline]
    fn as_ref(&self) -> MatRef<'_, f64> {
        self.storage.as_ref()
    }
}

fn column_to_mat<S: Data<Elem = f64>>(array: &ArrayBase<S, Ix1>) -> Mat<f64> {
    Mat::from_fn(array.len(), 1, |i, _| array[i])
}

/// A Cholesky factor of a symmetric positive-definite system.
pub struct CholeskyFactor {
    factor: solvers::Llt<f64>,
    order: usize,
}

impl CholeskyFactor {
    pub fn solve_vec<S: Data<Elem = f64>>(
        &self,
        rhs: &ArrayBase<S, Ix1>,
    ) -> Result<Array1<f64>, LinalgError> {
        if rhs.len() != self.order {
            return Err(LinalgError::DimensionMismatch {
                system: self.order,
                rhs: rhs.len(),
            });
        }
        let rhs_mat = column_to_mat(rhs);
        let sol = self.factor.solve(rhs_mat.as_ref());
        Ok(Array1::from_shape_fn(rhs.len(), |i| sol[(i, 0)]))
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Result<Array2<f64>, LinalgError> {
        if rhs.nrows() != self.order {
            return Err(LinalgError::DimensionMismatch {
                system: self.order,
                rhs: rhs.nrows(),
            });
        }
        let rhs_view = FaerArrayView::new(rhs);
        let sol = self.factor.solve(rhs_view.as_ref());
        Ok(mat_to_array(sol.as_ref()))
    }
}

pub trait FaerCholesky {
    fn cholesky(&self) -> Result<CholeskyFactor, LinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self) -> Result<CholeskyFactor, LinalgError> {
        let view = FaerArrayView::new(self);
        let factor = view
            .as_ref()
            .llt(Side::Lower)
            .map_err(LinalgError::Cholesky)?;
        Ok(CholeskyFactor {
            factor,
            order: self.nrows(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::array;

    #[test]
    fn cholesky_solves_small_spd_system() {
        let a = array![[4.0, 1.0], [1.0, 3.0]];
        let b = array![1.0, 2.0];
        let x = a.cholesky().unwrap().solve_vec(&b).unwrap();
        let back = a.dot(&x);
        assert_abs_diff_eq!(back[0], 1.0, epsilon = 1e-12);
        assert_abs_diff_eq!(back[1], 2.0, epsilon = 1e-12);
    }

    #[test]
    fn indefinite_matrix_is_rejected() {
        let a = array![[1.0, 2.0], [2.0, 1.0]];
        assert!(matches!(a.cholesky(), Err(LinalgError::Cholesky(_))));
    }

    #[test]
    fn mismatched_rhs_is_reported() {
        let a = array![[2.0, 0.0], [0.0, 2.0]];
        let factor = a.cholesky().unwrap();
        assert!(matches!(
            factor.solve_vec(&array![1.0, 2.0, 3.0]),
            Err(LinalgError::DimensionMismatch { system: 2, rhs: 3 })
        ));
    }
}
