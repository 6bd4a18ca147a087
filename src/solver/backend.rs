//! Solver backend abstraction.
//!
//! The Krylov loop and the preconditioners are written once against
//! `SolverBackend`; `CpuBackend` runs them on host vectors and `WgpuBackend`
//! on device buffers through the kernel library.

use crate::error::Result;
use crate::sparse::BlockCsrMatrix;

/// Slice of a level schedule handed to one triangular sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LevelRange {
    /// First entry of the level in the schedule's row list.
    pub offset: usize,
    /// Number of rows in the level.
    pub count: usize,
    /// Process the rows one after the other instead of in parallel.
    pub serial: bool,
}

/// Factored block-ILU(0) matrix as seen by a backend.
pub struct IluFactors<'a, B: SolverBackend + ?Sized> {
    /// L (unit diagonal, not stored) and U in the pattern of A. Diagonal
    /// blocks hold the inverse of U's diagonal.
    pub lu: &'a B::Matrix,
    /// Position of the diagonal block in every block row.
    pub diag_ptr: &'a B::Indices,
    /// Rows ordered level by level.
    pub level_rows: &'a B::Indices,
    pub block_size: usize,
}

/// Linear algebra on f64 vectors and block-sparse matrices.
///
/// Operations may be asynchronous; only `dot` and `download_vec` have to
/// wait for earlier work to finish.
pub trait SolverBackend {
    type Buffer;
    type Matrix;
    type Indices;

    /// Short description of where the work runs.
    fn name(&self) -> String;

    /// Create a zero-initialized buffer of `n` values.
    fn new_buffer(&self, n: usize) -> Result<Self::Buffer>;

    /// Change the logical length of a buffer, reallocating only when it
    /// grows past its capacity. Contents are unspecified afterwards.
    fn resize_buffer(&self, buffer: &mut Self::Buffer, n: usize) -> Result<()>;

    fn upload_vec(&self, data: &[f64], buffer: &Self::Buffer) -> Result<()>;

    fn download_vec(&self, buffer: &Self::Buffer, out: &mut [f64]) -> Result<()>;

    fn upload_indices(&self, data: &[u32]) -> Result<Self::Indices>;

    fn upload_matrix(&self, matrix: &BlockCsrMatrix) -> Result<Self::Matrix>;

    /// Overwrite an uploaded matrix, reusing its storage when it fits.
    fn update_matrix(&self, target: &mut Self::Matrix, matrix: &BlockCsrMatrix) -> Result<()>;

    /// x = 0
    fn zero(&self, x: &Self::Buffer) -> Result<()>;

    /// y = A * x
    fn spmv(&self, a: &Self::Matrix, x: &Self::Buffer, y: &Self::Buffer) -> Result<()>;

    /// out = rhs - A * x
    fn residual(
        &self,
        a: &Self::Matrix,
        x: &Self::Buffer,
        rhs: &Self::Buffer,
        out: &Self::Buffer,
    ) -> Result<()>;

    /// x . y, accumulated in f64.
    fn dot(&self, x: &Self::Buffer, y: &Self::Buffer) -> Result<f64>;

    /// y = alpha * x + y
    fn axpy(&self, alpha: f64, x: &Self::Buffer, y: &Self::Buffer) -> Result<()>;

    /// x = alpha * x
    fn scale(&self, alpha: f64, x: &Self::Buffer) -> Result<()>;

    /// dst = src
    fn copy(&self, src: &Self::Buffer, dst: &Self::Buffer) -> Result<()>;

    /// out += alpha * in1 ⊙ in2
    fn vmul(
        &self,
        alpha: f64,
        in1: &Self::Buffer,
        in2: &Self::Buffer,
        out: &Self::Buffer,
    ) -> Result<()>;

    /// coarse[i] = Σ_k fine[i*bs+k] * weights[i*bs+k]
    fn restrict_to_pressure(
        &self,
        fine: &Self::Buffer,
        weights: &Self::Buffer,
        coarse: &Self::Buffer,
        nb: usize,
        block_size: usize,
    ) -> Result<()>;

    /// fine[i*bs+pressure_index] += coarse[i]
    fn add_coarse_pressure_correction(
        &self,
        coarse: &Self::Buffer,
        fine: &Self::Buffer,
        nb: usize,
        block_size: usize,
        pressure_index: usize,
    ) -> Result<()>;

    /// out[i] += input[col_map[i]] for the first `n` entries of `out`.
    fn prolongate_vector(
        &self,
        input: &Self::Buffer,
        output: &Self::Buffer,
        col_map: &Self::Indices,
        n: usize,
    ) -> Result<()>;

    /// x_i = D_i⁻¹ r_i with the inverted diagonal blocks stored back to back.
    fn block_jacobi_apply(
        &self,
        inv_diag: &Self::Buffer,
        r: &Self::Buffer,
        x: &Self::Buffer,
        n: usize,
        block_size: usize,
    ) -> Result<()>;

    /// y_i = r_i - Σ_{j<i} L_ij y_j for the rows of one level.
    fn ilu_lower_level(
        &self,
        factors: &IluFactors<'_, Self>,
        level: LevelRange,
        r: &Self::Buffer,
        y: &Self::Buffer,
    ) -> Result<()>;

    /// x_i = D_i⁻¹ (y_i - Σ_{j>i} U_ij x_j) for the rows of one level.
    /// `y` is overwritten.
    fn ilu_upper_level(
        &self,
        factors: &IluFactors<'_, Self>,
        level: LevelRange,
        y: &Self::Buffer,
        x: &Self::Buffer,
    ) -> Result<()>;

    /// Wait until all submitted work has finished.
    fn synchronize(&self) -> Result<()> {
        Ok(())
    }

    /// (kernel dispatches, host readbacks) since creation.
    fn counters(&self) -> (u32, u32) {
        (0, 0)
    }
}
