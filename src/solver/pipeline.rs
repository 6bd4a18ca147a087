//! Per-backend solve state.
//!
//! `SolverState` owns everything a backend keeps between solves: the system
//! matrix, the well matrix, the right-hand side and solution vectors, the
//! Krylov workspace and the preconditioner. Storage is reused while the
//! sizes fit and only grows when `nb` or `nnzb` grow.

use std::time::{Duration, Instant};

use crate::config::BridgeConfig;
use crate::error::{FlowbridgeError, Result};
use crate::sparse::BlockCsrMatrix;
use crate::wells::WellSnapshot;

use super::backend::SolverBackend;
use super::bicgstab::{bicgstab, Convergence, KrylovWorkspace};
use super::preconditioner::Preconditioner;

/// Timings of one run, for the statistics.
#[derive(Debug, Clone, Copy, Default)]
pub struct RunTimings {
    pub upload: Duration,
    pub setup: Duration,
    pub krylov: Duration,
}

pub struct SolverState<B: SolverBackend> {
    backend: B,
    matrix: Option<B::Matrix>,
    wells: Option<B::Matrix>,
    rhs: B::Buffer,
    x: B::Buffer,
    tmp: B::Buffer,
    workspace: KrylovWorkspace<B>,
    preconditioner: Option<Preconditioner<B>>,
    n: usize,
}

fn upload_or_update<B: SolverBackend>(
    backend: &B,
    slot: &mut Option<B::Matrix>,
    matrix: &BlockCsrMatrix,
) -> Result<()> {
    match slot {
        Some(existing) => backend.update_matrix(existing, matrix),
        None => {
            *slot = Some(backend.upload_matrix(matrix)?);
            Ok(())
        }
    }
}

impl<B: SolverBackend> SolverState<B> {
    pub fn new(backend: B) -> Result<Self> {
        Ok(Self {
            rhs: backend.new_buffer(0)?,
            x: backend.new_buffer(0)?,
            tmp: backend.new_buffer(0)?,
            workspace: KrylovWorkspace::new(&backend, 0)?,
            backend,
            matrix: None,
            wells: None,
            preconditioner: None,
            n: 0,
        })
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Upload the system, refresh the preconditioner and run BiCGSTAB from a
    /// zero initial guess.
    pub fn run(
        &mut self,
        config: &BridgeConfig,
        matrix: &BlockCsrMatrix,
        rhs: &[f64],
        wells: &WellSnapshot,
        num_jacobi_blocks: usize,
    ) -> Result<(Convergence, RunTimings)> {
        let mut timings = RunTimings::default();
        let n = matrix.n();

        let start = Instant::now();
        if n != self.n {
            for buf in [&mut self.rhs, &mut self.x, &mut self.tmp] {
                self.backend.resize_buffer(buf, n)?;
            }
            self.workspace.resize(&self.backend, n)?;
            self.n = n;
        }
        upload_or_update(&self.backend, &mut self.matrix, matrix)?;
        match &wells.matrix {
            Some(w) => upload_or_update(&self.backend, &mut self.wells, w)?,
            None => self.wells = None,
        }
        self.backend.upload_vec(rhs, &self.rhs)?;
        self.backend.zero(&self.x)?;
        timings.upload = start.elapsed();

        let start = Instant::now();
        {
            let _span = tracing::debug_span!("preconditioner_setup", kind = %config.preconditioner).entered();
            match &mut self.preconditioner {
                Some(existing) => existing.refresh(&self.backend, config, matrix, num_jacobi_blocks)?,
                None => {
                    self.preconditioner = Some(Preconditioner::setup(
                        &self.backend,
                        config,
                        matrix,
                        num_jacobi_blocks,
                    )?)
                }
            }
        }
        timings.setup = start.elapsed();

        let start = Instant::now();
        let convergence = {
            let _span = tracing::debug_span!("bicgstab", n).entered();
            let backend = &self.backend;
            let a = self
                .matrix
                .as_ref()
                .ok_or_else(|| FlowbridgeError::Solve("system matrix not uploaded".into()))?;
            let precond = self
                .preconditioner
                .as_ref()
                .ok_or_else(|| FlowbridgeError::Solve("preconditioner not built".into()))?;
            let wells = self.wells.as_ref();
            let tmp = &self.tmp;

            // A + W without assembling the sum
            let operator = |input: &B::Buffer, output: &B::Buffer| -> Result<()> {
                backend.spmv(a, input, output)?;
                if let Some(w) = wells {
                    backend.spmv(w, input, tmp)?;
                    backend.axpy(1.0, tmp, output)?;
                }
                Ok(())
            };
            let precondition =
                |input: &B::Buffer, output: &B::Buffer| precond.apply(backend, a, input, output);

            let convergence = bicgstab(
                backend,
                operator,
                precondition,
                &self.rhs,
                &self.x,
                &self.workspace,
                config.tolerance,
                config.max_iterations,
            )?;
            backend.synchronize()?;
            convergence
        };
        timings.krylov = start.elapsed();
        Ok((convergence, timings))
    }

    /// Copy the last solution to the host.
    pub fn download(&self, out: &mut [f64]) -> Result<()> {
        self.backend.download_vec(&self.x, out)
    }
}
