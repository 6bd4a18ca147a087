//! The bridge between the simulator's Newton loop and the linear solvers.
//!
//! A `Bridge` owns one solve engine, either the host backend or an
//! accelerator backend, created lazily on the first `solve()` and reused for
//! every later call. With `cpu_fallback` set, a device that cannot be
//! initialized (or cannot run a kernel) is replaced by the host backend for
//! the rest of the bridge's life.

use std::time::{Duration, Instant};

use crate::config::{AcceleratorMode, BridgeConfig};
use crate::error::{FlowbridgeError, Result};
use crate::solver::backend::SolverBackend;
use crate::solver::cpu::CpuBackend;
use crate::solver::device::WgpuBackend;
use crate::solver::pipeline::{RunTimings, SolverState};
use crate::solver::bicgstab::Convergence;
use crate::sparse::{ensure_contiguous, BlockCsrMatrix, BlockStorage};
use crate::stats::Stats;
use crate::wells::{WellContributions, WellSnapshot};

/// Outcome reported to the caller after each solve.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SolveResult {
    pub converged: bool,
    pub iterations: usize,
    /// ‖r‖ / ‖r₀‖ at exit.
    pub reduction: f64,
    pub wall_time: Duration,
}

enum Engine {
    Cpu(SolverState<CpuBackend>),
    Device(SolverState<WgpuBackend>),
}

impl Engine {
    fn cpu() -> Result<Self> {
        Ok(Engine::Cpu(SolverState::new(CpuBackend::new())?))
    }

    fn accelerator(&self) -> Option<AcceleratorMode> {
        match self {
            Engine::Cpu(_) => None,
            Engine::Device(state) => Some(state.backend().accelerator()),
        }
    }

    fn name(&self) -> String {
        match self {
            Engine::Cpu(state) => state.backend().name(),
            Engine::Device(state) => state.backend().name(),
        }
    }

    fn run(
        &mut self,
        config: &BridgeConfig,
        matrix: &BlockCsrMatrix,
        rhs: &[f64],
        wells: &WellSnapshot,
        num_jacobi_blocks: usize,
    ) -> Result<(Convergence, RunTimings)> {
        match self {
            Engine::Cpu(state) => state.run(config, matrix, rhs, wells, num_jacobi_blocks),
            Engine::Device(state) => state.run(config, matrix, rhs, wells, num_jacobi_blocks),
        }
    }

    fn download(&self, out: &mut [f64]) -> Result<()> {
        match self {
            Engine::Cpu(state) => state.download(out),
            Engine::Device(state) => state.download(out),
        }
    }

    fn counters(&self) -> Option<(u32, u32)> {
        match self {
            Engine::Cpu(_) => None,
            Engine::Device(state) => Some(state.backend().counters()),
        }
    }
}

pub struct Bridge {
    config: BridgeConfig,
    engine: Option<Engine>,
    degraded: bool,
    solution: Vec<f64>,
    solved: bool,
    stats: Stats,
}

impl Bridge {
    /// Validate the configuration. The backend is created by the first solve.
    pub fn new(config: BridgeConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            engine: None,
            degraded: false,
            solution: Vec::new(),
            solved: false,
            stats: Stats::new(),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// True once the bridge has moved from the accelerator to the host.
    pub fn is_degraded(&self) -> bool {
        self.degraded
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }

    /// Description of the active backend, `None` before the first solve.
    pub fn backend_name(&self) -> Option<String> {
        self.engine.as_ref().map(Engine::name)
    }

    fn fall_back(&mut self, err: &FlowbridgeError) -> Result<()> {
        tracing::warn!(error = %err, "accelerator unusable, continuing on the host");
        self.engine = Some(Engine::cpu()?);
        self.degraded = true;
        self.stats.fallbacks += 1;
        Ok(())
    }

    fn ensure_engine(&mut self) -> Result<()> {
        if self.engine.is_some() {
            return Ok(());
        }
        if !self.config.accelerator.uses_device() {
            self.engine = Some(Engine::cpu()?);
            return Ok(());
        }
        let device = WgpuBackend::new(&self.config).and_then(SolverState::new);
        match device {
            Ok(state) => {
                self.engine = Some(Engine::Device(state));
                Ok(())
            }
            Err(e) if e.is_device_failure() && self.config.cpu_fallback => self.fall_back(&e),
            Err(e) => Err(e),
        }
    }

    /// Solve `(A + W) x = rhs` where `W` comes from `wells`.
    ///
    /// The well handle is drained exactly once, before any work is submitted.
    /// Not converging is reported in the result, not as an error.
    pub fn solve<S: BlockStorage + ?Sized>(
        &mut self,
        matrix: &S,
        rhs: &[f64],
        num_jacobi_blocks: usize,
        wells: &mut WellContributions,
    ) -> Result<SolveResult> {
        let start = Instant::now();
        let result = self.solve_inner(matrix, rhs, num_jacobi_blocks, wells, start);
        self.stats.solves += 1;
        match &result {
            Ok(r) if r.converged => self.stats.converged += 1,
            Ok(_) => {}
            Err(_) => self.stats.failures += 1,
        }
        result
    }

    fn solve_inner<S: BlockStorage + ?Sized>(
        &mut self,
        matrix: &S,
        rhs: &[f64],
        num_jacobi_blocks: usize,
        wells: &mut WellContributions,
        start: Instant,
    ) -> Result<SolveResult> {
        let matrix = ensure_contiguous(matrix)?;
        matrix.validate()?;
        let _span =
            tracing::info_span!("bridge_solve", nb = matrix.nb, block_size = matrix.block_size)
                .entered();

        if matrix.nb != matrix.nb_cols {
            return Err(FlowbridgeError::Solve(format!(
                "matrix must be square, got {}x{} blocks",
                matrix.nb, matrix.nb_cols
            )));
        }
        if rhs.len() != matrix.n() {
            return Err(FlowbridgeError::Solve(format!(
                "rhs length {} does not match matrix size {}",
                rhs.len(),
                matrix.n()
            )));
        }
        self.config.validate_for_block_size(matrix.block_size)?;

        self.ensure_engine()?;
        if !self.degraded {
            let active = self.engine.as_ref().and_then(Engine::accelerator);
            wells.check_backend(active)?;
        }
        let snapshot = wells.snapshot_and_clear(matrix.nb, matrix.block_size)?;
        if self.config.verbosity >= 2 && snapshot.num_wells > 0 {
            tracing::info!(
                wells = snapshot.num_wells,
                well_unknowns = snapshot.well_unknowns,
                "applying well contributions"
            );
        }

        let engine = self
            .engine
            .as_mut()
            .ok_or_else(|| FlowbridgeError::Solve("no solve engine".into()))?;
        let outcome = engine.run(&self.config, &matrix, rhs, &snapshot, num_jacobi_blocks);
        let (convergence, timings) = match outcome {
            Ok(done) => done,
            Err(e)
                if e.is_device_failure()
                    && self.config.cpu_fallback
                    && matches!(self.engine, Some(Engine::Device(_))) =>
            {
                self.fall_back(&e)?;
                let engine = self
                    .engine
                    .as_mut()
                    .ok_or_else(|| FlowbridgeError::Solve("no solve engine".into()))?;
                engine.run(&self.config, &matrix, rhs, &snapshot, num_jacobi_blocks)?
            }
            Err(e) => return Err(e),
        };

        let engine = self
            .engine
            .as_ref()
            .ok_or_else(|| FlowbridgeError::Solve("no solve engine".into()))?;
        self.solution.resize(matrix.n(), 0.0);
        engine.download(&mut self.solution)?;
        self.solved = true;

        self.stats.upload += timings.upload;
        self.stats.preconditioner_setup += timings.setup;
        self.stats.krylov += timings.krylov;
        self.stats
            .bicgstab_iters_per_solve
            .push(u32::try_from(convergence.iterations).unwrap_or(u32::MAX));
        if let Some((dispatches, readbacks)) = engine.counters() {
            self.stats.gpu_dispatches = dispatches;
            self.stats.gpu_readbacks = readbacks;
        }

        let result = SolveResult {
            converged: convergence.converged,
            iterations: convergence.iterations,
            reduction: convergence.reduction,
            wall_time: start.elapsed(),
        };
        if self.config.verbosity >= 1 {
            tracing::info!(
                iterations = result.iterations,
                reduction = result.reduction,
                converged = result.converged,
                seconds = result.wall_time.as_secs_f64(),
                "linear solve finished"
            );
        } else {
            tracing::debug!(
                iterations = result.iterations,
                reduction = result.reduction,
                converged = result.converged,
                seconds = result.wall_time.as_secs_f64(),
                "linear solve finished"
            );
        }
        Ok(result)
    }

    /// Copy the solution of the last successful solve into `out`.
    pub fn get_result(&self, out: &mut [f64]) -> Result<()> {
        if !self.solved {
            return Err(FlowbridgeError::Solve("no solution available yet".into()));
        }
        if out.len() != self.solution.len() {
            return Err(FlowbridgeError::Solve(format!(
                "output length {} does not match solution length {}",
                out.len(),
                self.solution.len()
            )));
        }
        out.copy_from_slice(&self.solution);
        Ok(())
    }
}
