//! Host implementation of `SolverBackend`.
//!
//! Runs the same Krylov loop and preconditioners as the device path on host
//! vectors, with row loops spread over the rayon pool. Used when no
//! accelerator is configured, after a device failure, and as the reference
//! the device results are checked against.

use std::cell::{Cell, RefCell};

use rayon::prelude::*;

use super::backend::{IluFactors, LevelRange, SolverBackend};
use crate::error::{FlowbridgeError, Result};
use crate::sparse::{block_gemv_add, BlockCsrMatrix};

/// Host vector. Interior mutability mirrors device buffers, which are
/// written through shared handles.
#[derive(Debug, Default)]
pub struct CpuBuffer(RefCell<Vec<f64>>);

impl CpuBuffer {
    pub fn to_vec(&self) -> Vec<f64> {
        self.0.borrow().clone()
    }
}

#[derive(Debug, Default)]
pub struct CpuBackend {
    ops: Cell<u32>,
}

impl CpuBackend {
    pub fn new() -> Self {
        Self::default()
    }

    fn count(&self) {
        self.ops.set(self.ops.get().wrapping_add(1));
    }
}

fn check_len(op: &str, expected: usize, actual: usize) -> Result<()> {
    if actual < expected {
        return Err(FlowbridgeError::Solve(format!(
            "{op}: buffer of length {actual}, need {expected}"
        )));
    }
    Ok(())
}

fn spmv_rows(a: &BlockCsrMatrix, x: &[f64], y: &mut [f64], rhs: Option<&[f64]>) {
    let bs = a.block_size;
    y[..a.n()].par_chunks_mut(bs).enumerate().for_each(|(row, y_row)| {
        y_row.fill(0.0);
        for idx in a.row_pointers[row]..a.row_pointers[row + 1] {
            let col = a.col_indices[idx];
            block_gemv_add(bs, a.block(idx), &x[col * bs..(col + 1) * bs], y_row);
        }
        if let Some(rhs) = rhs {
            for (k, v) in y_row.iter_mut().enumerate() {
                *v = rhs[row * bs + k] - *v;
            }
        }
    });
}

impl SolverBackend for CpuBackend {
    type Buffer = CpuBuffer;
    type Matrix = BlockCsrMatrix;
    type Indices = Vec<u32>;

    fn name(&self) -> String {
        format!("cpu ({} threads)", rayon::current_num_threads())
    }

    fn new_buffer(&self, n: usize) -> Result<CpuBuffer> {
        Ok(CpuBuffer(RefCell::new(vec![0.0; n])))
    }

    fn resize_buffer(&self, buffer: &mut CpuBuffer, n: usize) -> Result<()> {
        buffer.0.get_mut().resize(n, 0.0);
        Ok(())
    }

    fn upload_vec(&self, data: &[f64], buffer: &CpuBuffer) -> Result<()> {
        let mut dst = buffer.0.borrow_mut();
        check_len("upload_vec", data.len(), dst.len())?;
        dst[..data.len()].copy_from_slice(data);
        Ok(())
    }

    fn download_vec(&self, buffer: &CpuBuffer, out: &mut [f64]) -> Result<()> {
        let src = buffer.0.borrow();
        check_len("download_vec", out.len(), src.len())?;
        out.copy_from_slice(&src[..out.len()]);
        Ok(())
    }

    fn upload_indices(&self, data: &[u32]) -> Result<Vec<u32>> {
        Ok(data.to_vec())
    }

    fn upload_matrix(&self, matrix: &BlockCsrMatrix) -> Result<BlockCsrMatrix> {
        Ok(matrix.clone())
    }

    fn update_matrix(&self, target: &mut BlockCsrMatrix, matrix: &BlockCsrMatrix) -> Result<()> {
        target.clone_from(matrix);
        Ok(())
    }

    fn zero(&self, x: &CpuBuffer) -> Result<()> {
        x.0.borrow_mut().fill(0.0);
        Ok(())
    }

    fn spmv(&self, a: &BlockCsrMatrix, x: &CpuBuffer, y: &CpuBuffer) -> Result<()> {
        self.count();
        let x = x.0.borrow();
        let mut y = y.0.borrow_mut();
        check_len("spmv", a.n_cols(), x.len())?;
        check_len("spmv", a.n(), y.len())?;
        spmv_rows(a, &x, &mut y, None);
        Ok(())
    }

    fn residual(
        &self,
        a: &BlockCsrMatrix,
        x: &CpuBuffer,
        rhs: &CpuBuffer,
        out: &CpuBuffer,
    ) -> Result<()> {
        self.count();
        let x = x.0.borrow();
        let rhs = rhs.0.borrow();
        let mut out = out.0.borrow_mut();
        check_len("residual", a.n_cols(), x.len())?;
        check_len("residual", a.n(), rhs.len())?;
        check_len("residual", a.n(), out.len())?;
        spmv_rows(a, &x, &mut out, Some(rhs.as_slice()));
        Ok(())
    }

    fn dot(&self, x: &CpuBuffer, y: &CpuBuffer) -> Result<f64> {
        self.count();
        let x = x.0.borrow();
        let y = y.0.borrow();
        Ok(x.par_iter().zip(y.par_iter()).map(|(a, b)| a * b).sum())
    }

    fn axpy(&self, alpha: f64, x: &CpuBuffer, y: &CpuBuffer) -> Result<()> {
        self.count();
        let x = x.0.borrow();
        let mut y = y.0.borrow_mut();
        y.par_iter_mut().zip(x.par_iter()).for_each(|(yi, xi)| *yi += alpha * xi);
        Ok(())
    }

    fn scale(&self, alpha: f64, x: &CpuBuffer) -> Result<()> {
        self.count();
        x.0.borrow_mut().par_iter_mut().for_each(|v| *v *= alpha);
        Ok(())
    }

    fn copy(&self, src: &CpuBuffer, dst: &CpuBuffer) -> Result<()> {
        self.count();
        let src = src.0.borrow();
        let mut dst = dst.0.borrow_mut();
        let n = src.len().min(dst.len());
        dst[..n].copy_from_slice(&src[..n]);
        Ok(())
    }

    fn vmul(&self, alpha: f64, in1: &CpuBuffer, in2: &CpuBuffer, out: &CpuBuffer) -> Result<()> {
        self.count();
        let in1 = in1.0.borrow();
        let in2 = in2.0.borrow();
        let mut out = out.0.borrow_mut();
        out.par_iter_mut()
            .zip(in1.par_iter().zip(in2.par_iter()))
            .for_each(|(o, (a, b))| *o += alpha * a * b);
        Ok(())
    }

    fn restrict_to_pressure(
        &self,
        fine: &CpuBuffer,
        weights: &CpuBuffer,
        coarse: &CpuBuffer,
        nb: usize,
        block_size: usize,
    ) -> Result<()> {
        self.count();
        let fine_ref = fine.0.borrow();
        let weights_ref = weights.0.borrow();
        let (fine, weights) = (fine_ref.as_slice(), weights_ref.as_slice());
        let mut coarse = coarse.0.borrow_mut();
        check_len("restrict_to_pressure", nb * block_size, fine.len())?;
        check_len("restrict_to_pressure", nb * block_size, weights.len())?;
        check_len("restrict_to_pressure", nb, coarse.len())?;
        coarse[..nb].par_iter_mut().enumerate().for_each(|(i, c)| {
            let range = i * block_size..(i + 1) * block_size;
            *c = fine[range.clone()]
                .iter()
                .zip(&weights[range])
                .map(|(f, w)| f * w)
                .sum();
        });
        Ok(())
    }

    fn add_coarse_pressure_correction(
        &self,
        coarse: &CpuBuffer,
        fine: &CpuBuffer,
        nb: usize,
        block_size: usize,
        pressure_index: usize,
    ) -> Result<()> {
        self.count();
        let coarse = coarse.0.borrow();
        let mut fine = fine.0.borrow_mut();
        check_len("add_coarse_pressure_correction", nb * block_size, fine.len())?;
        for (i, c) in coarse[..nb].iter().enumerate() {
            fine[i * block_size + pressure_index] += c;
        }
        Ok(())
    }

    fn prolongate_vector(
        &self,
        input: &CpuBuffer,
        output: &CpuBuffer,
        col_map: &Vec<u32>,
        n: usize,
    ) -> Result<()> {
        self.count();
        let input_ref = input.0.borrow();
        let input = input_ref.as_slice();
        let mut output = output.0.borrow_mut();
        check_len("prolongate_vector", n, output.len())?;
        check_len("prolongate_vector", n, col_map.len())?;
        output[..n]
            .par_iter_mut()
            .zip(col_map.par_iter())
            .for_each(|(o, &c)| *o += input[c as usize]);
        Ok(())
    }

    fn block_jacobi_apply(
        &self,
        inv_diag: &CpuBuffer,
        r: &CpuBuffer,
        x: &CpuBuffer,
        n: usize,
        block_size: usize,
    ) -> Result<()> {
        self.count();
        let inv_ref = inv_diag.0.borrow();
        let r_ref = r.0.borrow();
        let (inv_diag, r) = (inv_ref.as_slice(), r_ref.as_slice());
        let mut x = x.0.borrow_mut();
        let bs = block_size;
        check_len("block_jacobi_apply", n, r.len())?;
        check_len("block_jacobi_apply", n * bs, inv_diag.len())?;
        x[..n].par_chunks_mut(bs).enumerate().for_each(|(row, x_row)| {
            x_row.fill(0.0);
            let block = &inv_diag[row * bs * bs..(row + 1) * bs * bs];
            block_gemv_add(bs, block, &r[row * bs..(row + 1) * bs], x_row);
        });
        Ok(())
    }

    fn ilu_lower_level(
        &self,
        factors: &IluFactors<'_, Self>,
        level: LevelRange,
        r: &CpuBuffer,
        y: &CpuBuffer,
    ) -> Result<()> {
        self.count();
        let (lu, bs, diag_ptr) = (factors.lu, factors.block_size, factors.diag_ptr);
        let rows = &factors.level_rows[level.offset..level.offset + level.count];
        let strictly_lower = |row: usize| lu.row_pointers[row]..diag_ptr[row] as usize;

        if level.serial {
            let r = r.0.borrow();
            let mut y = y.0.borrow_mut();
            let mut prod = vec![0.0; bs];
            for &row in rows {
                let row = row as usize;
                let rhs = &r[row * bs..(row + 1) * bs];
                let acc = eliminate_row(lu, bs, strictly_lower(row), rhs, &y[..], &mut prod);
                y[row * bs..(row + 1) * bs].copy_from_slice(&acc);
            }
            return Ok(());
        }

        // Rows of one level only read rows of earlier levels
        let solved: Vec<(usize, Vec<f64>)> = {
            let r_ref = r.0.borrow();
            let y_ref = y.0.borrow();
            let (r, y) = (r_ref.as_slice(), y_ref.as_slice());
            rows.par_iter()
                .map_init(
                    || vec![0.0; bs],
                    |prod, &row| {
                        let row = row as usize;
                        let rhs = &r[row * bs..(row + 1) * bs];
                        (row, eliminate_row(lu, bs, strictly_lower(row), rhs, y, prod))
                    },
                )
                .collect()
        };
        let mut y = y.0.borrow_mut();
        for (row, acc) in solved {
            y[row * bs..(row + 1) * bs].copy_from_slice(&acc);
        }
        Ok(())
    }

    fn ilu_upper_level(
        &self,
        factors: &IluFactors<'_, Self>,
        level: LevelRange,
        y: &CpuBuffer,
        x: &CpuBuffer,
    ) -> Result<()> {
        self.count();
        let (lu, bs, diag_ptr) = (factors.lu, factors.block_size, factors.diag_ptr);
        let rows = &factors.level_rows[level.offset..level.offset + level.count];
        let y_ref = y.0.borrow();
        let y = y_ref.as_slice();
        let solve_row = |row: usize, x: &[f64], prod: &mut [f64]| {
            let diag = diag_ptr[row] as usize;
            let upper = diag + 1..lu.row_pointers[row + 1];
            let acc = eliminate_row(lu, bs, upper, &y[row * bs..(row + 1) * bs], x, prod);
            let mut x_row = vec![0.0; bs];
            block_gemv_add(bs, lu.block(diag), &acc, &mut x_row);
            x_row
        };

        if level.serial {
            let mut x = x.0.borrow_mut();
            let mut prod = vec![0.0; bs];
            for &row in rows {
                let row = row as usize;
                let x_row = solve_row(row, &x[..], &mut prod);
                x[row * bs..(row + 1) * bs].copy_from_slice(&x_row);
            }
            return Ok(());
        }

        let solved: Vec<(usize, Vec<f64>)> = {
            let x_ref = x.0.borrow();
            let x = x_ref.as_slice();
            rows.par_iter()
                .map_init(
                    || vec![0.0; bs],
                    |prod, &row| (row as usize, solve_row(row as usize, x, prod.as_mut_slice())),
                )
                .collect()
        };
        let mut x = x.0.borrow_mut();
        for (row, x_row) in solved {
            x[row * bs..(row + 1) * bs].copy_from_slice(&x_row);
        }
        Ok(())
    }

    fn counters(&self) -> (u32, u32) {
        (self.ops.get(), 0)
    }
}

/// `rhs_row` minus the products of the blocks in `blocks` with `src`.
fn eliminate_row(
    lu: &BlockCsrMatrix,
    bs: usize,
    blocks: std::ops::Range<usize>,
    rhs_row: &[f64],
    src: &[f64],
    prod: &mut [f64],
) -> Vec<f64> {
    let mut acc = rhs_row.to_vec();
    for idx in blocks {
        let col = lu.col_indices[idx];
        prod.fill(0.0);
        block_gemv_add(bs, lu.block(idx), &src[col * bs..(col + 1) * bs], prod);
        for (a, p) in acc.iter_mut().zip(prod.iter()) {
            *a -= p;
        }
    }
    acc
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn tridiag(n: usize) -> BlockCsrMatrix {
        let mut t = Vec::new();
        for i in 0..n {
            t.push((i, i, vec![4.0]));
            if i > 0 {
                t.push((i, i - 1, vec![-1.0]));
            }
            if i + 1 < n {
                t.push((i, i + 1, vec![-1.0]));
            }
        }
        BlockCsrMatrix::from_block_triplets(n, n, 1, &t).unwrap()
    }

    #[test]
    fn spmv_matches_host_matrix() {
        let be = CpuBackend::new();
        let a = tridiag(5);
        let x_host = [1.0, 2.0, 3.0, 4.0, 5.0];
        let x = be.new_buffer(5).unwrap();
        let y = be.new_buffer(5).unwrap();
        be.upload_vec(&x_host, &x).unwrap();
        be.spmv(&a, &x, &y).unwrap();
        assert_eq!(y.to_vec(), a.spmv(&x_host).unwrap());
    }

    #[test]
    fn residual_and_dot() {
        let be = CpuBackend::new();
        let a = tridiag(3);
        let x = be.new_buffer(3).unwrap();
        let rhs = be.new_buffer(3).unwrap();
        let out = be.new_buffer(3).unwrap();
        be.upload_vec(&[1.0, 1.0, 1.0], &x).unwrap();
        be.upload_vec(&[3.0, 2.0, 3.0], &rhs).unwrap();
        be.residual(&a, &x, &rhs, &out).unwrap();
        assert_eq!(out.to_vec(), vec![0.0, 0.0, 0.0]);
        assert_abs_diff_eq!(be.dot(&rhs, &rhs).unwrap(), 22.0, epsilon = 1e-14);
    }

    #[test]
    fn vector_ops() {
        let be = CpuBackend::new();
        let x = be.new_buffer(3).unwrap();
        let y = be.new_buffer(3).unwrap();
        be.upload_vec(&[1.0, 2.0, 3.0], &x).unwrap();
        be.upload_vec(&[1.0, 1.0, 1.0], &y).unwrap();
        be.axpy(2.0, &x, &y).unwrap();
        assert_eq!(y.to_vec(), vec![3.0, 5.0, 7.0]);
        be.scale(0.5, &y).unwrap();
        assert_eq!(y.to_vec(), vec![1.5, 2.5, 3.5]);
        be.vmul(2.0, &x, &x, &y).unwrap();
        assert_eq!(y.to_vec(), vec![3.5, 10.5, 21.5]);
        be.copy(&x, &y).unwrap();
        assert_eq!(y.to_vec(), x.to_vec());
        be.zero(&y).unwrap();
        assert_eq!(y.to_vec(), vec![0.0; 3]);
    }

    #[test]
    fn pressure_transfer() {
        let be = CpuBackend::new();
        let fine = be.new_buffer(6).unwrap();
        let weights = be.new_buffer(6).unwrap();
        let coarse = be.new_buffer(2).unwrap();
        be.upload_vec(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &fine).unwrap();
        be.upload_vec(&[1.0, 0.5, 0.0, 2.0, 0.0, 1.0], &weights).unwrap();
        be.restrict_to_pressure(&fine, &weights, &coarse, 2, 3).unwrap();
        assert_eq!(coarse.to_vec(), vec![2.0, 14.0]);

        be.add_coarse_pressure_correction(&coarse, &fine, 2, 3, 1).unwrap();
        assert_eq!(fine.to_vec(), vec![1.0, 4.0, 3.0, 4.0, 19.0, 6.0]);

        let out = be.new_buffer(3).unwrap();
        be.prolongate_vector(&coarse, &out, &vec![1, 0, 1], 3).unwrap();
        assert_eq!(out.to_vec(), vec![14.0, 2.0, 14.0]);
    }

    #[test]
    fn block_jacobi_inverts_diagonal() {
        let be = CpuBackend::new();
        let inv = be.new_buffer(8).unwrap();
        be.upload_vec(&[0.5, 0.0, 0.0, 0.25, 1.0, 1.0, 0.0, 1.0], &inv).unwrap();
        let r = be.new_buffer(4).unwrap();
        be.upload_vec(&[2.0, 4.0, 1.0, 2.0], &r).unwrap();
        let x = be.new_buffer(4).unwrap();
        be.block_jacobi_apply(&inv, &r, &x, 4, 2).unwrap();
        assert_eq!(x.to_vec(), vec![1.0, 1.0, 3.0, 2.0]);
    }

    #[test]
    fn level_sweeps_match_serial_sweeps() {
        use crate::solver::preconditioner::{drop_partition_couplings, BlockIlu0, LevelSchedule};

        // Four independent partitions give several rows per level
        let mut t = Vec::new();
        for i in 0..16usize {
            t.push((i, i, vec![5.0, 1.0, 0.5, 4.0]));
            if i > 0 {
                t.push((i, i - 1, vec![-1.0, 0.2, 0.0, -1.0]));
            }
            if i + 1 < 16 {
                t.push((i, i + 1, vec![-1.0, 0.0, 0.3, -1.0]));
            }
        }
        let a = BlockCsrMatrix::from_block_triplets(16, 16, 2, &t).unwrap();
        let split = drop_partition_couplings(&a, 4);
        let ilu = BlockIlu0::factor(&split).unwrap();
        let diag_ptr: Vec<u32> = ilu.diag_ptr.iter().map(|&d| d as u32).collect();
        let r_host: Vec<f64> = (0..32).map(|i| (i as f64 * 0.7).sin()).collect();

        let sweep = |lower: LevelSchedule, upper: LevelSchedule| {
            let be = CpuBackend::new();
            let r = be.new_buffer(32).unwrap();
            let y = be.new_buffer(32).unwrap();
            let x = be.new_buffer(32).unwrap();
            be.upload_vec(&r_host, &r).unwrap();
            let factors = IluFactors::<CpuBackend> {
                lu: &ilu.lu,
                diag_ptr: &diag_ptr,
                level_rows: &lower.rows,
                block_size: 2,
            };
            for level in lower.ranges() {
                be.ilu_lower_level(&factors, level, &r, &y).unwrap();
            }
            let factors = IluFactors::<CpuBackend> {
                level_rows: &upper.rows,
                ..factors
            };
            for level in upper.ranges() {
                be.ilu_upper_level(&factors, level, &y, &x).unwrap();
            }
            x.to_vec()
        };

        let lower = LevelSchedule::lower(&ilu.lu, &ilu.diag_ptr).unwrap();
        let upper = LevelSchedule::upper(&ilu.lu, &ilu.diag_ptr).unwrap();
        assert_eq!(lower.num_levels(), 4);
        assert!(lower.ranges().iter().all(|l| l.count == 4));

        let leveled = sweep(lower, upper);
        let serial = sweep(
            LevelSchedule::serial_lower(16).unwrap(),
            LevelSchedule::serial_upper(16).unwrap(),
        );
        let expected = ilu.apply(&r_host);
        for ((l, s), e) in leveled.iter().zip(&serial).zip(&expected) {
            assert_abs_diff_eq!(*l, *s, epsilon = 1e-13);
            assert_abs_diff_eq!(*l, *e, epsilon = 1e-12);
        }
    }

    #[test]
    fn resize_keeps_capacity_semantics() {
        let be = CpuBackend::new();
        let mut b = be.new_buffer(4).unwrap();
        be.resize_buffer(&mut b, 2).unwrap();
        assert_eq!(b.to_vec().len(), 2);
        be.resize_buffer(&mut b, 6).unwrap();
        assert_eq!(b.to_vec().len(), 6);
        assert!(be.upload_vec(&[0.0; 7], &b).is_err());
    }
}
