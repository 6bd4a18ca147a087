//! Sparse-direct reference solver based on sparse LU factorization.
//!
//! Works on the scalar expansion of a block matrix. Used to cross-check the
//! iterative paths and to invert the coarsest AMG level.

use crate::error::{FlowbridgeError, Result};
use crate::sparse::BlockCsrMatrix;
use faer::prelude::*;
use faer::sparse::linalg::solvers::Lu;
use faer::sparse::{SparseColMat, Triplet};

fn factor(a: &BlockCsrMatrix) -> Result<Lu<usize, f64>> {
    let n = a.n();
    if a.nb != a.nb_cols {
        return Err(FlowbridgeError::Solve(format!(
            "direct solve needs a square matrix, got {}x{} blocks",
            a.nb, a.nb_cols
        )));
    }

    let mut triplets = Vec::with_capacity(a.values.len());
    for (row, col, val) in a.to_scalar_triplets() {
        if !val.is_finite() {
            return Err(FlowbridgeError::Solve("sparse LU input contains NaN/Inf".into()));
        }
        triplets.push(Triplet::new(row, col, val));
    }

    let a_sp = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets)
        .map_err(|e| FlowbridgeError::Solve(format!("sparse matrix build failed: {e:?}")))?;

    a_sp.sp_lu()
        .map_err(|e| FlowbridgeError::Solve(format!("sparse LU factorization failed: {e:?}")))
}

/// Solve `A x = b` with sparse LU on the host.
pub fn solve_block_system(a: &BlockCsrMatrix, b: &[f64]) -> Result<Vec<f64>> {
    let n = a.n();
    if b.len() != n {
        return Err(FlowbridgeError::Solve(format!(
            "dimension mismatch: matrix has {n} rows, rhs length is {}",
            b.len()
        )));
    }
    if n == 0 {
        return Ok(Vec::new());
    }

    let lu = factor(a)?;
    let rhs = faer::Mat::<f64>::from_fn(n, 1, |i, _| b[i]);
    let x = lu.solve(rhs);

    let mut out = vec![0.0; n];
    for (i, v) in out.iter_mut().enumerate() {
        let xi = x[(i, 0)];
        if !xi.is_finite() {
            return Err(FlowbridgeError::Solve("sparse LU produced NaN/Inf solution".into()));
        }
        *v = xi;
    }
    Ok(out)
}

/// Dense inverse of a small matrix, row-major `n × n`, obtained by solving
/// against the identity.
pub fn dense_inverse(a: &BlockCsrMatrix) -> Result<Vec<f64>> {
    let n = a.n();
    if n == 0 {
        return Ok(Vec::new());
    }
    let lu = factor(a)?;
    let x = lu.solve(faer::Mat::<f64>::identity(n, n));

    let mut out = vec![0.0; n * n];
    for i in 0..n {
        for j in 0..n {
            let v = x[(i, j)];
            if !v.is_finite() {
                return Err(FlowbridgeError::Solve("dense inverse is not finite".into()));
            }
            out[i * n + j] = v;
        }
    }
    Ok(out)
}
