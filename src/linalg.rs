//! Dense linear algebra for small state blocks.
//!
//! The per-site state dimension is tiny (1-3 for the Matérn family), so the
//! generic path hand-rolls products and a Cholesky factorization over
//! [`Scalar`] instead of dispatching to a BLAS. The f64-only oracle path
//! (dense GP Gram matrices, which do grow with the grid) goes through faer.

use crate::scalar::Scalar;
use faer::linalg::solvers::{self, Solve};
use faer::{MatMut, MatRef, Side};
use ndarray::{Array1, Array2, ArrayBase, Data, Ix2};
use std::marker::PhantomData;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LinalgError {
    #[error("matrix is not positive definite (pivot {pivot}, value {value:.4e})")]
    NotPositiveDefinite { pivot: usize, value: f64 },
    #[error("Cholesky factorization failed: {0:?}")]
    FaerCholesky(solvers::LltError),
}

/// `a · b` for generic square or rectangular blocks.
pub fn mat_mul<S: Scalar>(a: &Array2<S>, b: &Array2<S>) -> Array2<S> {
    let (n, k) = a.dim();
    let (kb, m) = b.dim();
    debug_assert_eq!(k, kb, "inner dimensions must agree");
    let mut out = Array2::from_elem((n, m), S::zero());
    for i in 0..n {
        for l in 0..k {
            let ail = a[[i, l]];
            for j in 0..m {
                out[[i, j]] = out[[i, j]] + ail * b[[l, j]];
            }
        }
    }
    out
}

/// `a · v`.
pub fn mat_vec<S: Scalar>(a: &Array2<S>, v: &Array1<S>) -> Array1<S> {
    let (n, k) = a.dim();
    debug_assert_eq!(k, v.len(), "inner dimensions must agree");
    let mut out = Array1::from_elem(n, S::zero());
    for i in 0..n {
        let mut acc = S::zero();
        for l in 0..k {
            acc = acc + a[[i, l]] * v[l];
        }
        out[i] = acc;
    }
    out
}

/// `a · p · aᵀ`, the covariance propagation product.
pub fn sandwich<S: Scalar>(a: &Array2<S>, p: &Array2<S>) -> Array2<S> {
    let ap = mat_mul(a, p);
    let (n, k) = ap.dim();
    let mut out = Array2::from_elem((n, n), S::zero());
    for i in 0..n {
        for j in 0..n {
            let mut acc = S::zero();
            for l in 0..k {
                acc = acc + ap[[i, l]] * a[[j, l]];
            }
            out[[i, j]] = acc;
        }
    }
    out
}

/// Replace `m` with `(m + mᵀ) / 2` to remove asymmetric numerical drift.
pub fn symmetrize<S: Scalar>(m: &mut Array2<S>) {
    let n = m.nrows();
    debug_assert_eq!(n, m.ncols());
    let half = S::from_f64(0.5);
    for i in 0..n {
        for j in (i + 1)..n {
            let avg = (m[[i, j]] + m[[j, i]]) * half;
            m[[i, j]] = avg;
            m[[j, i]] = avg;
        }
    }
}

/// Lower-triangular Cholesky factor of a symmetric positive definite block,
/// generic over [`Scalar`] so gradients flow through the factorization.
pub struct Cholesky<S> {
    l: Array2<S>,
}

impl<S: Scalar> Cholesky<S> {
    pub fn new(a: &Array2<S>) -> Result<Self, LinalgError> {
        let n = a.nrows();
        debug_assert_eq!(n, a.ncols());
        let mut l = Array2::from_elem((n, n), S::zero());
        for j in 0..n {
            let mut diag = a[[j, j]];
            for k in 0..j {
                diag = diag - l[[j, k]] * l[[j, k]];
            }
            let dv = diag.value();
            if !dv.is_finite() || dv <= 0.0 {
                return Err(LinalgError::NotPositiveDefinite { pivot: j, value: dv });
            }
            let ljj = diag.sqrt();
            l[[j, j]] = ljj;
            for i in (j + 1)..n {
                let mut acc = a[[i, j]];
                for k in 0..j {
                    acc = acc - l[[i, k]] * l[[j, k]];
                }
                l[[i, j]] = acc / ljj;
            }
        }
        Ok(Self { l })
    }

    /// Solve `a x = b` by forward/back substitution.
    pub fn solve_vec(&self, b: &Array1<S>) -> Array1<S> {
        let n = self.l.nrows();
        let mut x = b.clone();
        for i in 0..n {
            let mut acc = x[i];
            for k in 0..i {
                acc = acc - self.l[[i, k]] * x[k];
            }
            x[i] = acc / self.l[[i, i]];
        }
        for i in (0..n).rev() {
            let mut acc = x[i];
            for k in (i + 1)..n {
                acc = acc - self.l[[k, i]] * x[k];
            }
            x[i] = acc / self.l[[i, i]];
        }
        x
    }

    /// Solve `a X = B` column by column.
    pub fn solve_mat(&self, b: &Array2<S>) -> Array2<S> {
        let (n, m) = b.dim();
        let mut out = Array2::from_elem((n, m), S::zero());
        for j in 0..m {
            let col = Array1::from_iter((0..n).map(|i| b[[i, j]]));
            let sol = self.solve_vec(&col);
            for i in 0..n {
                out[[i, j]] = sol[i];
            }
        }
        out
    }

    /// `ln det a = 2 Σ ln l_ii`.
    pub fn log_det(&self) -> S {
        let n = self.l.nrows();
        let mut acc = S::zero();
        for i in 0..n {
            acc = acc + self.l[[i, i]].ln();
        }
        acc + acc
    }
}

// --- faer bridge (f64 only), trimmed to the Cholesky surface the dense
// --- oracle needs.

#[inline]
pub fn array2_to_mat_mut(array: &mut Array2<f64>) -> MatMut<'_, f64> {
    let (rows, cols) = array.dim();
    let strides = array.strides();
    let s0 = strides[0];
    let s1 = strides[1];
    // SAFETY: dimensions and strides come directly from the live ndarray.
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), rows, cols, s0, s1) }
}

#[inline]
pub fn array1_to_col_mat_mut(array: &mut Array1<f64>) -> MatMut<'_, f64> {
    let len = array.len();
    let stride = array.strides()[0];
    unsafe { MatMut::from_raw_parts_mut(array.as_mut_ptr(), len, 1, stride, 0) }
}

pub struct FaerArrayView<'a> {
    ptr: *const f64,
    rows: usize,
    cols: usize,
    row_stride: isize,
    col_stride: isize,
    owned: Option<Array2<f64>>,
    _marker: PhantomData<&'a f64>,
}

impl<'a> FaerArrayView<'a> {
    pub fn new<S: Data<Elem = f64>>(array: &'a ArrayBase<S, Ix2>) -> Self {
        let (rows, cols) = array.dim();
        let strides = array.strides();
        // Non-positive strides can alias or reverse memory traversal; faer
        // kernels assume neither, so materialize a compact copy for those.
        if strides[0] <= 0 || strides[1] <= 0 {
            let owned = array.to_owned();
            let owned_strides = owned.strides();
            return Self {
                ptr: owned.as_ptr(),
                rows,
                cols,
                row_stride: owned_strides[0],
                col_stride: owned_strides[1],
                owned: Some(owned),
                _marker: PhantomData,
            };
        }
        Self {
            ptr: array.as_ptr(),
            rows,
            cols,
            row_stride: strides[0],
            col_stride: strides[1],
            owned: None,
            _marker: PhantomData,
        }
    }

    #[inline]
    pub fn as_ref(&self) -> MatRef<'_, f64> {
        let (ptr, rows, cols, row_stride, col_stride) = if let Some(owned) = &self.owned {
            let strides = owned.strides();
            (
                owned.as_ptr(),
                owned.nrows(),
                owned.ncols(),
                strides[0],
                strides[1],
            )
        } else {
            (
                self.ptr,
                self.rows,
                self.cols,
                self.row_stride,
                self.col_stride,
            )
        };
        // SAFETY: the pointer/shape/strides come either from a live ndarray
        // view with positive strides or from the owned compact copy held by
        // this wrapper for the same lifetime.
        unsafe { MatRef::from_raw_parts(ptr, rows, cols, row_stride, col_stride) }
    }
}

pub struct FaerCholeskyFactor {
    factor: solvers::Llt<f64>,
}

impl FaerCholeskyFactor {
    pub fn solve_vec(&self, rhs: &Array1<f64>) -> Array1<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array1_to_col_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    pub fn solve_mat(&self, rhs: &Array2<f64>) -> Array2<f64> {
        let mut rhs = rhs.to_owned();
        let mut rhs_view = array2_to_mat_mut(&mut rhs);
        self.factor.solve_in_place(rhs_view.as_mut());
        rhs
    }

    pub fn log_det(&self) -> f64 {
        let l = self.factor.L();
        let mut acc = 0.0;
        for i in 0..l.nrows() {
            acc += l[(i, i)].ln();
        }
        2.0 * acc
    }
}

pub trait FaerCholesky {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, LinalgError>;
}

impl<S: Data<Elem = f64>> FaerCholesky for ArrayBase<S, Ix2> {
    fn cholesky(&self, side: Side) -> Result<FaerCholeskyFactor, LinalgError> {
        let faer_view = FaerArrayView::new(self);
        let factor = faer_view
            .as_ref()
            .llt(side)
            .map_err(LinalgError::FaerCholesky)?;
        Ok(FaerCholeskyFactor { factor })
    }
}
