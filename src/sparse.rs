//! Block compressed sparse row (BSR) matrices.
//!
//! A system with `nb` cells and `block_size` unknowns per cell is stored as
//! `nb` block rows of dense `block_size × block_size` blocks (row-major inside
//! each block). Restriction operators reuse the same type with
//! `nb_cols != nb`.

use std::borrow::Cow;

use rayon::prelude::*;

use crate::error::{FlowbridgeError, Result};

/// Sparse matrix of dense blocks in compressed-row layout.
#[derive(Debug, Clone, PartialEq)]
pub struct BlockCsrMatrix {
    /// Number of block rows.
    pub nb: usize,
    /// Number of block columns.
    pub nb_cols: usize,
    pub block_size: usize,
    /// `row_pointers[i]..row_pointers[i + 1]` are the blocks of row `i`.
    pub row_pointers: Vec<usize>,
    /// Block column of each stored block, sorted within a row.
    pub col_indices: Vec<usize>,
    /// `nnzb * block_size²` values, one block after the other.
    pub values: Vec<f64>,
}

impl BlockCsrMatrix {
    /// Create a matrix with no stored blocks.
    pub fn new(nb: usize, nb_cols: usize, block_size: usize) -> Self {
        Self {
            nb,
            nb_cols,
            block_size,
            row_pointers: vec![0; nb + 1],
            col_indices: Vec::new(),
            values: Vec::new(),
        }
    }

    /// Number of stored blocks.
    pub fn nnzb(&self) -> usize {
        self.col_indices.len()
    }

    /// Number of scalar rows.
    pub fn n(&self) -> usize {
        self.nb * self.block_size
    }

    pub fn n_cols(&self) -> usize {
        self.nb_cols * self.block_size
    }

    fn block_len(&self) -> usize {
        self.block_size * self.block_size
    }

    /// Build from `(block_row, block_col, block)` triplets.
    /// Blocks at the same position are summed.
    pub fn from_block_triplets(
        nb: usize,
        nb_cols: usize,
        block_size: usize,
        triplets: &[(usize, usize, Vec<f64>)],
    ) -> Result<Self> {
        let bs2 = block_size * block_size;
        for (row, col, block) in triplets {
            if *row >= nb || *col >= nb_cols {
                return Err(FlowbridgeError::Solve(format!(
                    "block ({row}, {col}) outside {nb}x{nb_cols} block matrix"
                )));
            }
            if block.len() != bs2 {
                return Err(FlowbridgeError::Solve(format!(
                    "block ({row}, {col}) has {} values, expected {bs2}",
                    block.len()
                )));
            }
        }

        let mut order: Vec<usize> = (0..triplets.len()).collect();
        order.sort_by_key(|&i| (triplets[i].0, triplets[i].1));

        let mut row_pointers = vec![0usize; nb + 1];
        let mut col_indices = Vec::with_capacity(triplets.len());
        let mut values = Vec::with_capacity(triplets.len() * bs2);
        let mut last: Option<(usize, usize)> = None;

        for &i in &order {
            let (row, col, ref block) = triplets[i];
            if last == Some((row, col)) {
                let start = values.len() - bs2;
                for (dst, src) in values[start..].iter_mut().zip(block) {
                    *dst += src;
                }
            } else {
                row_pointers[row + 1] += 1;
                col_indices.push(col);
                values.extend_from_slice(block);
                last = Some((row, col));
            }
        }
        for i in 1..=nb {
            row_pointers[i] += row_pointers[i - 1];
        }

        Ok(Self {
            nb,
            nb_cols,
            block_size,
            row_pointers,
            col_indices,
            values,
        })
    }

    /// Group scalar `(row, col, value)` entries of an `n × n_cols` matrix
    /// into blocks. Both dimensions must be multiples of `block_size`.
    pub fn from_scalar_triplets(
        n: usize,
        n_cols: usize,
        block_size: usize,
        entries: &[(usize, usize, f64)],
    ) -> Result<Self> {
        if block_size == 0 || n % block_size != 0 || n_cols % block_size != 0 {
            return Err(FlowbridgeError::Solve(format!(
                "{n}x{n_cols} matrix cannot be split into {block_size}x{block_size} blocks"
            )));
        }
        let bs = block_size;
        let mut blocks: Vec<(usize, usize, Vec<f64>)> = Vec::with_capacity(entries.len());
        let mut sorted: Vec<&(usize, usize, f64)> = entries.iter().collect();
        sorted.sort_by_key(|e| (e.0 / bs, e.1 / bs));
        for &&(row, col, value) in &sorted {
            if row >= n || col >= n_cols {
                return Err(FlowbridgeError::Solve(format!(
                    "entry ({row}, {col}) outside {n}x{n_cols} matrix"
                )));
            }
            let key = (row / bs, col / bs);
            let slot = (row % bs) * bs + col % bs;
            match blocks.last_mut() {
                Some((r, c, block)) if (*r, *c) == key => block[slot] += value,
                _ => {
                    let mut block = vec![0.0; bs * bs];
                    block[slot] = value;
                    blocks.push((key.0, key.1, block));
                }
            }
        }
        Self::from_block_triplets(n / bs, n_cols / bs, bs, &blocks)
    }

    /// Check the structural invariants of the layout.
    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(FlowbridgeError::Solve(format!("invalid block matrix: {msg}")));
        if self.block_size == 0 {
            return fail("block size is zero".into());
        }
        if self.row_pointers.len() != self.nb + 1 {
            return fail(format!(
                "{} row pointers for {} block rows",
                self.row_pointers.len(),
                self.nb
            ));
        }
        if self.row_pointers[0] != 0 || self.row_pointers[self.nb] != self.nnzb() {
            return fail("row pointers do not span the stored blocks".into());
        }
        if self.values.len() != self.nnzb() * self.block_len() {
            return fail(format!(
                "{} values for {} blocks of size {}",
                self.values.len(),
                self.nnzb(),
                self.block_size
            ));
        }
        for row in 0..self.nb {
            let (start, end) = (self.row_pointers[row], self.row_pointers[row + 1]);
            if start > end {
                return fail(format!("row pointers decrease at row {row}"));
            }
            if end > self.nnzb() {
                return fail(format!(
                    "row pointer {end} at row {row} exceeds {} blocks",
                    self.nnzb()
                ));
            }
            let cols = &self.col_indices[start..end];
            if cols.iter().any(|&c| c >= self.nb_cols) {
                return fail(format!("column index out of range in row {row}"));
            }
            if cols.windows(2).any(|w| w[0] >= w[1]) {
                return fail(format!("columns of row {row} are not strictly increasing"));
            }
        }
        Ok(())
    }

    /// Values of the `idx`-th stored block.
    pub fn block(&self, idx: usize) -> &[f64] {
        let len = self.block_len();
        &self.values[idx * len..(idx + 1) * len]
    }

    pub fn block_mut(&mut self, idx: usize) -> &mut [f64] {
        let len = self.block_len();
        &mut self.values[idx * len..(idx + 1) * len]
    }

    /// Position of block `(row, col)` in the stored blocks.
    pub fn find(&self, row: usize, col: usize) -> Option<usize> {
        let start = self.row_pointers[row];
        let cols = &self.col_indices[start..self.row_pointers[row + 1]];
        cols.binary_search(&col).ok().map(|k| start + k)
    }

    pub fn diag_index(&self, row: usize) -> Option<usize> {
        self.find(row, row)
    }

    /// Whether `other` stores blocks at exactly the same positions.
    pub fn same_pattern(&self, other: &BlockCsrMatrix) -> bool {
        self.nb == other.nb
            && self.nb_cols == other.nb_cols
            && self.block_size == other.block_size
            && self.row_pointers == other.row_pointers
            && self.col_indices == other.col_indices
    }

    /// y = A * x
    pub fn spmv(&self, x: &[f64]) -> Result<Vec<f64>> {
        if x.len() != self.n_cols() {
            return Err(FlowbridgeError::Solve(format!(
                "spmv dimension mismatch: {} columns, vector of length {}",
                self.n_cols(),
                x.len()
            )));
        }
        let bs = self.block_size;
        let mut y = vec![0.0; self.n()];
        y.par_chunks_mut(bs).enumerate().for_each(|(row, y_row)| {
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                let col = self.col_indices[idx];
                block_gemv_add(bs, self.block(idx), &x[col * bs..(col + 1) * bs], y_row);
            }
        });
        Ok(y)
    }

    /// rhs - A * x
    pub fn residual(&self, x: &[f64], rhs: &[f64]) -> Result<Vec<f64>> {
        if rhs.len() != self.n() {
            return Err(FlowbridgeError::Solve(format!(
                "residual dimension mismatch: {} rows, rhs of length {}",
                self.n(),
                rhs.len()
            )));
        }
        let ax = self.spmv(x)?;
        Ok(rhs.iter().zip(&ax).map(|(b, a)| b - a).collect())
    }

    /// Expand into scalar `(row, col, value)` entries, skipping nothing.
    pub fn to_scalar_triplets(&self) -> Vec<(usize, usize, f64)> {
        let bs = self.block_size;
        let mut out = Vec::with_capacity(self.values.len());
        for row in 0..self.nb {
            for idx in self.row_pointers[row]..self.row_pointers[row + 1] {
                let col = self.col_indices[idx];
                for (k, &v) in self.block(idx).iter().enumerate() {
                    out.push((row * bs + k / bs, col * bs + k % bs, v));
                }
            }
        }
        out
    }

    /// Dense row-major copy. For tests and small matrices only.
    pub fn to_dense(&self) -> Vec<Vec<f64>> {
        let mut dense = vec![vec![0.0; self.n_cols()]; self.n()];
        for (r, c, v) in self.to_scalar_triplets() {
            dense[r][c] = v;
        }
        dense
    }
}

/// Matrix storage the bridge accepts.
///
/// Matrices whose blocks do not live in one allocation are deep-copied into a
/// [`BlockCsrMatrix`] before upload.
pub trait BlockStorage {
    fn block_rows(&self) -> usize;
    fn block_size(&self) -> usize;
    /// Borrow the storage when it already is a single contiguous allocation.
    fn as_contiguous(&self) -> Option<&BlockCsrMatrix>;
    /// Deep copy into contiguous storage.
    fn to_contiguous(&self) -> Result<BlockCsrMatrix>;
}

impl BlockStorage for BlockCsrMatrix {
    fn block_rows(&self) -> usize {
        self.nb
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn as_contiguous(&self) -> Option<&BlockCsrMatrix> {
        (self.values.len() == self.nnzb() * self.block_len()).then_some(self)
    }

    fn to_contiguous(&self) -> Result<BlockCsrMatrix> {
        Ok(self.clone())
    }
}

/// Borrow contiguous storage, deep-copy anything else.
pub fn ensure_contiguous<S: BlockStorage + ?Sized>(matrix: &S) -> Result<Cow<'_, BlockCsrMatrix>> {
    match matrix.as_contiguous() {
        Some(m) => Ok(Cow::Borrowed(m)),
        None => {
            tracing::debug!(nb = matrix.block_rows(), "copying non-contiguous matrix");
            Ok(Cow::Owned(matrix.to_contiguous()?))
        }
    }
}

/// Block matrix with every block allocated separately, row by row.
///
/// This is the layout a text reader or an assembler that inserts blocks one
/// at a time naturally produces.
#[derive(Debug, Clone)]
pub struct FragmentedBlockMatrix {
    pub block_size: usize,
    pub rows: Vec<Vec<(usize, Box<[f64]>)>>,
}

impl FragmentedBlockMatrix {
    pub fn new(nb: usize, block_size: usize) -> Self {
        Self {
            block_size,
            rows: vec![Vec::new(); nb],
        }
    }

    pub fn insert(&mut self, row: usize, col: usize, block: &[f64]) {
        self.rows[row].push((col, block.to_vec().into_boxed_slice()));
    }

    pub fn from_matrix(matrix: &BlockCsrMatrix) -> Self {
        let mut out = Self::new(matrix.nb, matrix.block_size);
        for row in 0..matrix.nb {
            for idx in matrix.row_pointers[row]..matrix.row_pointers[row + 1] {
                out.insert(row, matrix.col_indices[idx], matrix.block(idx));
            }
        }
        out
    }
}

impl BlockStorage for FragmentedBlockMatrix {
    fn block_rows(&self) -> usize {
        self.rows.len()
    }

    fn block_size(&self) -> usize {
        self.block_size
    }

    fn as_contiguous(&self) -> Option<&BlockCsrMatrix> {
        None
    }

    fn to_contiguous(&self) -> Result<BlockCsrMatrix> {
        let nb = self.rows.len();
        let triplets: Vec<(usize, usize, Vec<f64>)> = self
            .rows
            .iter()
            .enumerate()
            .flat_map(|(row, blocks)| {
                blocks
                    .iter()
                    .map(move |(col, block)| (row, *col, block.to_vec()))
            })
            .collect();
        BlockCsrMatrix::from_block_triplets(nb, nb, self.block_size, &triplets)
    }
}

// ── Dense block kernels ─────────────────────────────────────────────

/// y += A * x for one `bs × bs` block.
pub fn block_gemv_add(bs: usize, a: &[f64], x: &[f64], y: &mut [f64]) {
    for r in 0..bs {
        let mut sum = 0.0;
        for c in 0..bs {
            sum += a[r * bs + c] * x[c];
        }
        y[r] += sum;
    }
}

/// C = A * B for `bs × bs` blocks.
pub fn block_mul(bs: usize, a: &[f64], b: &[f64]) -> Vec<f64> {
    let mut c = vec![0.0; bs * bs];
    for i in 0..bs {
        for k in 0..bs {
            let aik = a[i * bs + k];
            if aik == 0.0 {
                continue;
            }
            for j in 0..bs {
                c[i * bs + j] += aik * b[k * bs + j];
            }
        }
    }
    c
}

/// C -= A * B for `bs × bs` blocks.
pub fn block_mul_sub(bs: usize, a: &[f64], b: &[f64], c: &mut [f64]) {
    for (dst, v) in c.iter_mut().zip(block_mul(bs, a, b)) {
        *dst -= v;
    }
}

/// Inverse of a dense `bs × bs` block by Gauss-Jordan elimination with
/// partial pivoting. Returns `None` for a singular block.
pub fn invert_block(bs: usize, a: &[f64]) -> Option<Vec<f64>> {
    let mut m = a.to_vec();
    let mut inv = vec![0.0; bs * bs];
    for i in 0..bs {
        inv[i * bs + i] = 1.0;
    }
    let scale = a.iter().fold(0.0f64, |acc, v| acc.max(v.abs()));
    if scale == 0.0 || !scale.is_finite() {
        return None;
    }

    for col in 0..bs {
        let pivot_row = (col..bs)
            .max_by(|&x, &y| m[x * bs + col].abs().total_cmp(&m[y * bs + col].abs()))?;
        let pivot = m[pivot_row * bs + col];
        if pivot.abs() <= scale * 1e-14 {
            return None;
        }
        if pivot_row != col {
            for k in 0..bs {
                m.swap(pivot_row * bs + k, col * bs + k);
                inv.swap(pivot_row * bs + k, col * bs + k);
            }
        }
        for k in 0..bs {
            m[col * bs + k] /= pivot;
            inv[col * bs + k] /= pivot;
        }
        for row in 0..bs {
            if row == col {
                continue;
            }
            let factor = m[row * bs + col];
            if factor == 0.0 {
                continue;
            }
            for k in 0..bs {
                m[row * bs + k] -= factor * m[col * bs + k];
                inv[row * bs + k] -= factor * inv[col * bs + k];
            }
        }
    }
    Some(inv)
}
