//! Block preconditioners.
//!
//! Factorizations run on the host; the factors are uploaded once per solve
//! and applied through the backend, so the same code serves the host and
//! the device path. Block-ILU(0) keeps the sparsity pattern of A, stores L
//! (unit diagonal implied) and U in place, and keeps the inverse of U's
//! diagonal blocks at the diagonal positions so that the backward sweep only
//! multiplies.
//!
//! The triangular sweeps are level scheduled: rows in one level do not
//! depend on each other and are processed in parallel, levels run in order.
//! With parallel ILU disabled each sweep is a single serial level.

use std::borrow::Cow;

use crate::config::{BridgeConfig, PreconditionerKind};
use crate::error::{FlowbridgeError, Result};
use crate::sparse::{block_mul, block_mul_sub, invert_block, BlockCsrMatrix};

use super::amg::CprPreconditioner;
use super::backend::{IluFactors, LevelRange, SolverBackend};

fn to_u32(what: &str, value: usize) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| FlowbridgeError::Solve(format!("{what} {value} exceeds 32-bit indices")))
}

/// Remove every block coupling two of `num_blocks` contiguous row
/// partitions. With 0 or 1 blocks the matrix is returned unchanged.
pub fn drop_partition_couplings(
    matrix: &BlockCsrMatrix,
    num_blocks: usize,
) -> Cow<'_, BlockCsrMatrix> {
    let nb = matrix.nb;
    let parts = num_blocks.min(nb);
    if parts <= 1 {
        return Cow::Borrowed(matrix);
    }
    let part = |row: usize| row * parts / nb;
    let len = matrix.block_size * matrix.block_size;

    let mut out = BlockCsrMatrix::new(nb, matrix.nb_cols, matrix.block_size);
    out.col_indices.reserve(matrix.nnzb());
    out.values.reserve(matrix.values.len());
    for row in 0..nb {
        for idx in matrix.row_pointers[row]..matrix.row_pointers[row + 1] {
            let col = matrix.col_indices[idx];
            if col < nb && part(col) == part(row) {
                out.col_indices.push(col);
                out.values.extend_from_slice(&matrix.values[idx * len..(idx + 1) * len]);
            }
        }
        out.row_pointers[row + 1] = out.col_indices.len();
    }
    Cow::Owned(out)
}

/// Inverted diagonal blocks, stored back to back.
pub fn block_jacobi_inverse(matrix: &BlockCsrMatrix) -> Result<Vec<f64>> {
    let bs = matrix.block_size;
    let mut out = Vec::with_capacity(matrix.nb * bs * bs);
    for row in 0..matrix.nb {
        let diag = matrix.diag_index(row).ok_or_else(|| {
            FlowbridgeError::Solve(format!("missing diagonal block in row {row}"))
        })?;
        let inv = invert_block(bs, matrix.block(diag)).ok_or_else(|| {
            FlowbridgeError::Solve(format!("singular diagonal block in row {row}"))
        })?;
        out.extend_from_slice(&inv);
    }
    Ok(out)
}

/// Block-ILU(0) factors of a square block matrix.
#[derive(Debug, Clone)]
pub struct BlockIlu0 {
    pub lu: BlockCsrMatrix,
    pub diag_ptr: Vec<usize>,
}

impl BlockIlu0 {
    pub fn factor(matrix: &BlockCsrMatrix) -> Result<Self> {
        if matrix.nb != matrix.nb_cols {
            return Err(FlowbridgeError::Solve(format!(
                "ILU0 needs a square matrix, got {}x{} blocks",
                matrix.nb, matrix.nb_cols
            )));
        }
        let nb = matrix.nb;
        let bs = matrix.block_size;
        let mut lu = matrix.clone();
        let diag_ptr = (0..nb)
            .map(|row| {
                lu.diag_index(row).ok_or_else(|| {
                    FlowbridgeError::Solve(format!("missing diagonal block in row {row}"))
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        // Position of each column in the current row, usize::MAX if absent
        let mut pos = vec![usize::MAX; nb];
        for i in 0..nb {
            let (start, end) = (lu.row_pointers[i], lu.row_pointers[i + 1]);
            for idx in start..end {
                pos[lu.col_indices[idx]] = idx;
            }

            for idx_k in start..diag_ptr[i] {
                let k = lu.col_indices[idx_k];
                // L_ik = A_ik * U_kk⁻¹, the diagonal of row k already holds the inverse
                let l_ik = block_mul(bs, lu.block(idx_k), lu.block(diag_ptr[k]));
                lu.block_mut(idx_k).copy_from_slice(&l_ik);
                for idx_kj in diag_ptr[k] + 1..lu.row_pointers[k + 1] {
                    let target = pos[lu.col_indices[idx_kj]];
                    if target != usize::MAX {
                        let u_kj = lu.block(idx_kj).to_vec();
                        block_mul_sub(bs, &l_ik, &u_kj, lu.block_mut(target));
                    }
                }
            }

            let inv = invert_block(bs, lu.block(diag_ptr[i])).ok_or_else(|| {
                FlowbridgeError::Solve(format!("singular diagonal block in row {i} during ILU0"))
            })?;
            lu.block_mut(diag_ptr[i]).copy_from_slice(&inv);

            for idx in start..end {
                pos[lu.col_indices[idx]] = usize::MAX;
            }
        }
        Ok(Self { lu, diag_ptr })
    }

    /// Host application, `x = (LU)⁻¹ r`. Reference for the backend sweeps.
    pub fn apply(&self, r: &[f64]) -> Vec<f64> {
        let lu = &self.lu;
        let bs = lu.block_size;
        let mut y = r.to_vec();
        for row in 0..lu.nb {
            for idx in lu.row_pointers[row]..self.diag_ptr[row] {
                let col = lu.col_indices[idx];
                let (head, tail) = y.split_at_mut(row * bs);
                let y_row = &mut tail[..bs];
                let y_col = &head[col * bs..(col + 1) * bs];
                for k in 0..bs {
                    for c in 0..bs {
                        y_row[k] -= lu.block(idx)[k * bs + c] * y_col[c];
                    }
                }
            }
        }
        let mut x = vec![0.0; y.len()];
        for row in (0..lu.nb).rev() {
            let mut acc = y[row * bs..(row + 1) * bs].to_vec();
            for idx in self.diag_ptr[row] + 1..lu.row_pointers[row + 1] {
                let col = lu.col_indices[idx];
                for k in 0..bs {
                    for c in 0..bs {
                        acc[k] -= lu.block(idx)[k * bs + c] * x[col * bs + c];
                    }
                }
            }
            let d = lu.block(self.diag_ptr[row]);
            for k in 0..bs {
                x[row * bs + k] = (0..bs).map(|c| d[k * bs + c] * acc[c]).sum();
            }
        }
        x
    }
}

/// Rows of a triangular sweep grouped into independent levels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LevelSchedule {
    /// Rows level by level.
    pub rows: Vec<u32>,
    /// Start of each level in `rows`, plus the end.
    pub level_ptr: Vec<usize>,
    serial: bool,
}

impl LevelSchedule {
    fn from_levels(levels: &[usize]) -> Result<Self> {
        let num_levels = levels.iter().max().map_or(0, |&m| m + 1);
        let mut level_ptr = vec![0usize; num_levels + 1];
        for &l in levels {
            level_ptr[l + 1] += 1;
        }
        for l in 0..num_levels {
            level_ptr[l + 1] += level_ptr[l];
        }
        let mut next = level_ptr.clone();
        let mut rows = vec![0u32; levels.len()];
        for (row, &l) in levels.iter().enumerate() {
            rows[next[l]] = to_u32("row", row)?;
            next[l] += 1;
        }
        Ok(Self {
            rows,
            level_ptr,
            serial: false,
        })
    }

    /// Levels of the forward sweep: a row depends on the rows left of its
    /// diagonal.
    pub fn lower(lu: &BlockCsrMatrix, diag_ptr: &[usize]) -> Result<Self> {
        let mut levels = vec![0usize; lu.nb];
        for row in 0..lu.nb {
            let level = (lu.row_pointers[row]..diag_ptr[row])
                .map(|idx| levels[lu.col_indices[idx]] + 1)
                .max()
                .unwrap_or(0);
            levels[row] = level;
        }
        Self::from_levels(&levels)
    }

    /// Levels of the backward sweep: a row depends on the rows right of its
    /// diagonal.
    pub fn upper(lu: &BlockCsrMatrix, diag_ptr: &[usize]) -> Result<Self> {
        let mut levels = vec![0usize; lu.nb];
        for row in (0..lu.nb).rev() {
            let level = (diag_ptr[row] + 1..lu.row_pointers[row + 1])
                .map(|idx| levels[lu.col_indices[idx]] + 1)
                .max()
                .unwrap_or(0);
            levels[row] = level;
        }
        Self::from_levels(&levels)
    }

    /// One serial level walking the rows in order.
    pub fn serial_lower(nb: usize) -> Result<Self> {
        Ok(Self {
            rows: (0..nb).map(|r| to_u32("row", r)).collect::<Result<_>>()?,
            level_ptr: vec![0, nb],
            serial: true,
        })
    }

    /// One serial level walking the rows backwards.
    pub fn serial_upper(nb: usize) -> Result<Self> {
        Ok(Self {
            rows: (0..nb).rev().map(|r| to_u32("row", r)).collect::<Result<_>>()?,
            level_ptr: vec![0, nb],
            serial: true,
        })
    }

    pub fn num_levels(&self) -> usize {
        self.level_ptr.len().saturating_sub(1)
    }

    pub fn ranges(&self) -> Vec<LevelRange> {
        self.level_ptr
            .windows(2)
            .map(|w| LevelRange {
                offset: w[0],
                count: w[1] - w[0],
                serial: self.serial,
            })
            .collect()
    }
}

/// Block-Jacobi preconditioner resident on a backend.
pub struct JacobiApply<B: SolverBackend> {
    inv_diag: B::Buffer,
    n: usize,
    block_size: usize,
}

impl<B: SolverBackend> JacobiApply<B> {
    pub fn new(backend: &B, matrix: &BlockCsrMatrix) -> Result<Self> {
        let inv = block_jacobi_inverse(matrix)?;
        let inv_diag = backend.new_buffer(inv.len())?;
        backend.upload_vec(&inv, &inv_diag)?;
        Ok(Self {
            inv_diag,
            n: matrix.n(),
            block_size: matrix.block_size,
        })
    }

    pub fn refresh(&mut self, backend: &B, matrix: &BlockCsrMatrix) -> Result<()> {
        let inv = block_jacobi_inverse(matrix)?;
        backend.resize_buffer(&mut self.inv_diag, inv.len())?;
        backend.upload_vec(&inv, &self.inv_diag)?;
        self.n = matrix.n();
        self.block_size = matrix.block_size;
        Ok(())
    }

    pub fn apply(&self, backend: &B, r: &B::Buffer, x: &B::Buffer) -> Result<()> {
        backend.block_jacobi_apply(&self.inv_diag, r, x, self.n, self.block_size)
    }
}

/// Block-ILU(0) factors and sweep schedules resident on a backend.
pub struct IluApply<B: SolverBackend> {
    lu: B::Matrix,
    diag_ptr: B::Indices,
    lower_rows: B::Indices,
    upper_rows: B::Indices,
    lower_levels: Vec<LevelRange>,
    upper_levels: Vec<LevelRange>,
    y: B::Buffer,
    block_size: usize,
    parallel: bool,
    row_pointers: Vec<usize>,
    col_indices: Vec<usize>,
}

impl<B: SolverBackend> IluApply<B> {
    pub fn new(backend: &B, factors: &BlockIlu0, parallel: bool) -> Result<Self> {
        let lu = &factors.lu;
        let (lower, upper) = if parallel {
            (
                LevelSchedule::lower(lu, &factors.diag_ptr)?,
                LevelSchedule::upper(lu, &factors.diag_ptr)?,
            )
        } else {
            (LevelSchedule::serial_lower(lu.nb)?, LevelSchedule::serial_upper(lu.nb)?)
        };
        tracing::debug!(
            nb = lu.nb,
            lower_levels = lower.num_levels(),
            upper_levels = upper.num_levels(),
            parallel,
            "ILU0 schedule"
        );
        let diag_ptr = factors
            .diag_ptr
            .iter()
            .map(|&d| to_u32("block index", d))
            .collect::<Result<Vec<u32>>>()?;

        Ok(Self {
            lu: backend.upload_matrix(lu)?,
            diag_ptr: backend.upload_indices(&diag_ptr)?,
            lower_rows: backend.upload_indices(&lower.rows)?,
            upper_rows: backend.upload_indices(&upper.rows)?,
            lower_levels: lower.ranges(),
            upper_levels: upper.ranges(),
            y: backend.new_buffer(lu.n())?,
            block_size: lu.block_size,
            parallel,
            row_pointers: lu.row_pointers.clone(),
            col_indices: lu.col_indices.clone(),
        })
    }

    /// Upload new factor values; the schedules are rebuilt only when the
    /// pattern changed.
    pub fn refresh(&mut self, backend: &B, factors: &BlockIlu0, parallel: bool) -> Result<()> {
        let lu = &factors.lu;
        let same = parallel == self.parallel
            && lu.block_size == self.block_size
            && lu.row_pointers == self.row_pointers
            && lu.col_indices == self.col_indices;
        if same {
            backend.update_matrix(&mut self.lu, lu)
        } else {
            *self = Self::new(backend, factors, parallel)?;
            Ok(())
        }
    }

    pub fn num_levels(&self) -> (usize, usize) {
        (self.lower_levels.len(), self.upper_levels.len())
    }

    /// x = (LU)⁻¹ r. `r` and `x` must be distinct buffers.
    pub fn apply(&self, backend: &B, r: &B::Buffer, x: &B::Buffer) -> Result<()> {
        let lower = IluFactors::<B> {
            lu: &self.lu,
            diag_ptr: &self.diag_ptr,
            level_rows: &self.lower_rows,
            block_size: self.block_size,
        };
        for &level in &self.lower_levels {
            backend.ilu_lower_level(&lower, level, r, &self.y)?;
        }
        let upper = IluFactors::<B> {
            lu: &self.lu,
            diag_ptr: &self.diag_ptr,
            level_rows: &self.upper_rows,
            block_size: self.block_size,
        };
        for &level in &self.upper_levels {
            backend.ilu_upper_level(&upper, level, &self.y, x)?;
        }
        Ok(())
    }
}

/// Preconditioner selected by the bridge configuration.
pub enum Preconditioner<B: SolverBackend> {
    Jacobi(JacobiApply<B>),
    Ilu0(IluApply<B>),
    Cpr(Box<CprPreconditioner<B>>),
}

impl<B: SolverBackend> Preconditioner<B> {
    pub fn setup(
        backend: &B,
        config: &BridgeConfig,
        matrix: &BlockCsrMatrix,
        num_jacobi_blocks: usize,
    ) -> Result<Self> {
        Ok(match config.preconditioner {
            PreconditionerKind::Jacobi => Self::Jacobi(JacobiApply::new(backend, matrix)?),
            PreconditionerKind::Ilu0 => {
                let partitioned = drop_partition_couplings(matrix, num_jacobi_blocks);
                let factors = BlockIlu0::factor(&partitioned)?;
                Self::Ilu0(IluApply::new(backend, &factors, config.ilu_parallel)?)
            }
            PreconditionerKind::Cpr => Self::Cpr(Box::new(CprPreconditioner::setup(
                backend,
                config,
                matrix,
                num_jacobi_blocks,
            )?)),
        })
    }

    /// Recompute for new matrix values, reusing backend storage.
    pub fn refresh(
        &mut self,
        backend: &B,
        config: &BridgeConfig,
        matrix: &BlockCsrMatrix,
        num_jacobi_blocks: usize,
    ) -> Result<()> {
        if self.kind() != config.preconditioner {
            *self = Self::setup(backend, config, matrix, num_jacobi_blocks)?;
            return Ok(());
        }
        match self {
            Self::Jacobi(jacobi) => jacobi.refresh(backend, matrix),
            Self::Ilu0(ilu) => {
                let partitioned = drop_partition_couplings(matrix, num_jacobi_blocks);
                let factors = BlockIlu0::factor(&partitioned)?;
                ilu.refresh(backend, &factors, config.ilu_parallel)
            }
            Self::Cpr(cpr) => cpr.refresh(backend, config, matrix, num_jacobi_blocks),
        }
    }

    pub fn kind(&self) -> PreconditionerKind {
        match self {
            Self::Jacobi(_) => PreconditionerKind::Jacobi,
            Self::Ilu0(_) => PreconditionerKind::Ilu0,
            Self::Cpr(_) => PreconditionerKind::Cpr,
        }
    }

    /// z = M⁻¹ r. `a` is the system matrix without well contributions.
    pub fn apply(&self, backend: &B, a: &B::Matrix, r: &B::Buffer, z: &B::Buffer) -> Result<()> {
        match self {
            Self::Jacobi(jacobi) => jacobi.apply(backend, r, z),
            Self::Ilu0(ilu) => ilu.apply(backend, r, z),
            Self::Cpr(cpr) => cpr.apply(backend, a, r, z),
        }
    }
}
