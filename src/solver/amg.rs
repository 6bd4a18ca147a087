//! CPR preconditioner with an aggregation AMG on the pressure subsystem.
//!
//! The first stage reduces the residual to one pressure equation per cell
//! with per-cell weights, solves that system approximately with one V-cycle,
//! and writes the result into the pressure slot of every block. The second
//! stage applies block-ILU(0) to the remaining residual of the full system.
//!
//! Coarse levels come from greedy plain aggregation with piecewise constant
//! interpolation: restriction sums the rows of an aggregate, prolongation
//! copies the coarse value back to every member. Aggregates are computed
//! when the pattern changes; Galerkin values are recomputed on every
//! refresh. The coarsest level is inverted densely, with damped Jacobi as
//! the fallback when it is too large or the inverse is not usable.

use crate::config::{BridgeConfig, CprWeights};
use crate::error::{FlowbridgeError, Result};
use crate::sparse::{invert_block, BlockCsrMatrix};

use super::backend::SolverBackend;
use super::direct;
use super::preconditioner::{drop_partition_couplings, BlockIlu0, IluApply};

/// Fraction of the largest off-diagonal magnitude in a row above which a
/// connection counts as strong.
const STRENGTH_THRESHOLD: f64 = 0.25;
/// Jacobi sweeps on the coarsest level when it has no dense inverse.
const COARSE_SWEEPS: usize = 4;
/// Largest coarsest level that is inverted densely.
const MAX_DENSE_ROWS: usize = 1024;

/// Quasi-IMPES weights: `w_i` solves `D_iᵀ w_i = e_p` for the diagonal block
/// `D_i` of every row, scaled so that its largest entry has magnitude one.
pub fn quasi_impes_weights(matrix: &BlockCsrMatrix, pressure_index: usize) -> Result<Vec<f64>> {
    let bs = matrix.block_size;
    let mut weights = Vec::with_capacity(matrix.n());
    let mut transposed = vec![0.0; bs * bs];
    for row in 0..matrix.nb {
        let diag = matrix.diag_index(row).ok_or_else(|| {
            FlowbridgeError::Solve(format!("missing diagonal block in row {row}"))
        })?;
        let d = matrix.block(diag);
        for r in 0..bs {
            for c in 0..bs {
                transposed[c * bs + r] = d[r * bs + c];
            }
        }
        let inv = invert_block(bs, &transposed).ok_or_else(|| {
            FlowbridgeError::Solve(format!("singular diagonal block in row {row}"))
        })?;
        let w: Vec<f64> = (0..bs).map(|k| inv[k * bs + pressure_index]).collect();
        let scale = w.iter().fold(0.0f64, |m, v| m.max(v.abs()));
        weights.extend(w.iter().map(|v| if scale > 0.0 { v / scale } else { *v }));
    }
    Ok(weights)
}

/// `w_i = e_p` for every row.
pub fn trivial_weights(nb: usize, block_size: usize, pressure_index: usize) -> Vec<f64> {
    let mut weights = vec![0.0; nb * block_size];
    for row in 0..nb {
        weights[row * block_size + pressure_index] = 1.0;
    }
    weights
}

/// Scalar pressure matrix `A_p[i][j] = Σ_k w_i[k] A_ij[k][p]` in the pattern
/// of `matrix`.
pub fn pressure_matrix(
    matrix: &BlockCsrMatrix,
    weights: &[f64],
    pressure_index: usize,
) -> BlockCsrMatrix {
    let bs = matrix.block_size;
    let mut values = vec![0.0; matrix.nnzb()];
    for row in 0..matrix.nb {
        let w = &weights[row * bs..(row + 1) * bs];
        for idx in matrix.row_pointers[row]..matrix.row_pointers[row + 1] {
            let block = matrix.block(idx);
            values[idx] = (0..bs).map(|k| w[k] * block[k * bs + pressure_index]).sum();
        }
    }
    BlockCsrMatrix {
        nb: matrix.nb,
        nb_cols: matrix.nb_cols,
        block_size: 1,
        row_pointers: matrix.row_pointers.clone(),
        col_indices: matrix.col_indices.clone(),
        values,
    }
}

/// Assignment of fine rows to aggregates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Aggregation {
    pub aggregate_of: Vec<usize>,
    pub num_aggregates: usize,
}

fn strong_neighbors(matrix: &BlockCsrMatrix, row: usize, theta: f64) -> Vec<usize> {
    let range = matrix.row_pointers[row]..matrix.row_pointers[row + 1];
    let max_off = range
        .clone()
        .filter(|&idx| matrix.col_indices[idx] != row)
        .map(|idx| matrix.values[idx].abs())
        .fold(0.0f64, f64::max);
    if max_off == 0.0 {
        return Vec::new();
    }
    range
        .filter(|&idx| {
            matrix.col_indices[idx] != row && matrix.values[idx].abs() >= theta * max_off
        })
        .map(|idx| matrix.col_indices[idx])
        .collect()
}

/// Greedy aggregation of a scalar matrix.
///
/// A row whose strong neighbors are all free seeds an aggregate with them.
/// Leftover rows join the aggregate of a strong neighbor, or stay alone.
pub fn aggregate(matrix: &BlockCsrMatrix, theta: f64) -> Aggregation {
    const FREE: usize = usize::MAX;
    let n = matrix.nb;
    let strong: Vec<Vec<usize>> = (0..n).map(|i| strong_neighbors(matrix, i, theta)).collect();
    let mut aggregate_of = vec![FREE; n];
    let mut num_aggregates = 0;

    for i in 0..n {
        if aggregate_of[i] != FREE || strong[i].iter().any(|&j| aggregate_of[j] != FREE) {
            continue;
        }
        aggregate_of[i] = num_aggregates;
        for &j in &strong[i] {
            aggregate_of[j] = num_aggregates;
        }
        num_aggregates += 1;
    }

    for i in 0..n {
        if aggregate_of[i] != FREE {
            continue;
        }
        match strong[i].iter().find(|&&j| aggregate_of[j] != FREE) {
            Some(&j) => aggregate_of[i] = aggregate_of[j],
            None => {
                aggregate_of[i] = num_aggregates;
                num_aggregates += 1;
            }
        }
    }

    Aggregation {
        aggregate_of,
        num_aggregates,
    }
}

/// Galerkin product `Pᵀ A P` for piecewise constant `P`.
pub fn galerkin(matrix: &BlockCsrMatrix, agg: &Aggregation) -> Result<BlockCsrMatrix> {
    let mut triplets = Vec::with_capacity(matrix.nnzb());
    for row in 0..matrix.nb {
        for idx in matrix.row_pointers[row]..matrix.row_pointers[row + 1] {
            triplets.push((
                agg.aggregate_of[row],
                agg.aggregate_of[matrix.col_indices[idx]],
                matrix.values[idx],
            ));
        }
    }
    let nc = agg.num_aggregates;
    BlockCsrMatrix::from_scalar_triplets(nc, nc, 1, &triplets)
}

/// Restriction `R = Pᵀ`: row `I` holds a one for every member of aggregate `I`.
pub fn restriction(agg: &Aggregation) -> BlockCsrMatrix {
    let n = agg.aggregate_of.len();
    let nc = agg.num_aggregates;
    let mut out = BlockCsrMatrix::new(nc, n, 1);
    for &a in &agg.aggregate_of {
        out.row_pointers[a + 1] += 1;
    }
    for i in 0..nc {
        out.row_pointers[i + 1] += out.row_pointers[i];
    }
    let mut next = out.row_pointers.clone();
    out.col_indices = vec![0; n];
    for (row, &a) in agg.aggregate_of.iter().enumerate() {
        out.col_indices[next[a]] = row;
        next[a] += 1;
    }
    out.values = vec![1.0; n];
    out
}

fn dense_matrix(n: usize, values: Vec<f64>) -> BlockCsrMatrix {
    BlockCsrMatrix {
        nb: n,
        nb_cols: n,
        block_size: 1,
        row_pointers: (0..=n).map(|i| i * n).collect(),
        col_indices: (0..n * n).map(|k| k % n).collect(),
        values,
    }
}

fn inverse_diagonal(matrix: &BlockCsrMatrix) -> Vec<f64> {
    (0..matrix.nb)
        .map(|row| match matrix.diag_index(row).map(|idx| matrix.values[idx]) {
            Some(d) if d != 0.0 => 1.0 / d,
            _ => 0.0,
        })
        .collect()
}

/// Host side of the pressure hierarchy.
#[derive(Debug, Clone)]
pub struct HostHierarchy {
    /// Level matrices, finest first.
    pub levels: Vec<BlockCsrMatrix>,
    /// Aggregation from level `l` to level `l + 1`.
    pub aggregations: Vec<Aggregation>,
    /// Dense inverse of the coarsest level, row-major.
    pub coarse_inverse: Option<Vec<f64>>,
}

impl HostHierarchy {
    pub fn build(pressure: BlockCsrMatrix, coarse_size: usize, max_levels: usize) -> Result<Self> {
        let mut levels = vec![pressure];
        let mut aggregations = Vec::new();
        while let Some(last) = levels.last() {
            if last.nb <= coarse_size || levels.len() >= max_levels {
                break;
            }
            let agg = aggregate(last, STRENGTH_THRESHOLD);
            if agg.num_aggregates == 0 || agg.num_aggregates >= last.nb {
                break;
            }
            let coarse = galerkin(last, &agg)?;
            aggregations.push(agg);
            levels.push(coarse);
        }
        let coarse_inverse = levels.last().and_then(coarsest_inverse);
        Ok(Self {
            levels,
            aggregations,
            coarse_inverse,
        })
    }

    /// New values on the finest level, same aggregates.
    pub fn recompute(&mut self, pressure: BlockCsrMatrix) -> Result<()> {
        self.levels.truncate(1);
        self.levels[0] = pressure;
        for agg in &self.aggregations {
            let coarse = match self.levels.last() {
                Some(fine) => galerkin(fine, agg)?,
                None => break,
            };
            self.levels.push(coarse);
        }
        self.coarse_inverse = self.levels.last().and_then(coarsest_inverse);
        Ok(())
    }
}

fn coarsest_inverse(matrix: &BlockCsrMatrix) -> Option<Vec<f64>> {
    if matrix.nb > MAX_DENSE_ROWS {
        return None;
    }
    match direct::dense_inverse(matrix) {
        Ok(inv) => Some(inv),
        Err(e) => {
            tracing::debug!(rows = matrix.nb, error = %e, "coarse inverse unavailable, smoothing instead");
            None
        }
    }
}

struct Transfer<B: SolverBackend> {
    restriction: B::Matrix,
    aggregates: B::Indices,
}

struct DeviceLevel<B: SolverBackend> {
    n: usize,
    matrix: B::Matrix,
    inv_diag: B::Buffer,
    x: B::Buffer,
    b: B::Buffer,
    tmp: B::Buffer,
    transfer: Option<Transfer<B>>,
}

/// Pressure hierarchy resident on a backend.
pub struct AmgHierarchy<B: SolverBackend> {
    host: HostHierarchy,
    levels: Vec<DeviceLevel<B>>,
    coarse_inverse: Option<B::Matrix>,
    smoother_weight: f64,
    coarse_size: usize,
    max_levels: usize,
}

fn to_u32_indices(values: &[usize]) -> Result<Vec<u32>> {
    values
        .iter()
        .map(|&v| {
            u32::try_from(v)
                .map_err(|_| FlowbridgeError::Solve(format!("index {v} exceeds 32-bit indices")))
        })
        .collect()
}

impl<B: SolverBackend> AmgHierarchy<B> {
    pub fn setup(backend: &B, pressure: BlockCsrMatrix, config: &BridgeConfig) -> Result<Self> {
        let host = HostHierarchy::build(pressure, config.coarse_size, config.max_levels)?;
        let mut levels = Vec::with_capacity(host.levels.len());
        for (l, matrix) in host.levels.iter().enumerate() {
            let n = matrix.nb;
            let inv = inverse_diagonal(matrix);
            let inv_diag = backend.new_buffer(n)?;
            backend.upload_vec(&inv, &inv_diag)?;
            let transfer = match host.aggregations.get(l) {
                Some(agg) => Some(Transfer {
                    restriction: backend.upload_matrix(&restriction(agg))?,
                    aggregates: backend.upload_indices(&to_u32_indices(&agg.aggregate_of)?)?,
                }),
                None => None,
            };
            levels.push(DeviceLevel {
                n,
                matrix: backend.upload_matrix(matrix)?,
                inv_diag,
                x: backend.new_buffer(n)?,
                b: backend.new_buffer(n)?,
                tmp: backend.new_buffer(n)?,
                transfer,
            });
        }
        let coarse_inverse = match (&host.coarse_inverse, host.levels.last()) {
            (Some(inv), Some(last)) => Some(backend.upload_matrix(&dense_matrix(last.nb, inv.clone()))?),
            _ => None,
        };
        tracing::debug!(
            levels = host.levels.len(),
            coarsest = host.levels.last().map_or(0, |m| m.nb),
            dense_coarse = coarse_inverse.is_some(),
            "AMG hierarchy"
        );
        Ok(Self {
            host,
            levels,
            coarse_inverse,
            smoother_weight: config.smoother_weight,
            coarse_size: config.coarse_size,
            max_levels: config.max_levels,
        })
    }

    /// Recompute the hierarchy for new pressure values. Aggregates are kept
    /// while the fine pattern and the coarsening limits are unchanged.
    pub fn refresh(&mut self, backend: &B, pressure: BlockCsrMatrix, config: &BridgeConfig) -> Result<()> {
        let same = self.coarse_size == config.coarse_size
            && self.max_levels == config.max_levels
            && self
                .host
                .levels
                .first()
                .is_some_and(|fine| fine.same_pattern(&pressure));
        if !same {
            *self = Self::setup(backend, pressure, config)?;
            return Ok(());
        }
        self.smoother_weight = config.smoother_weight;
        self.host.recompute(pressure)?;
        for (level, matrix) in self.levels.iter_mut().zip(&self.host.levels) {
            backend.update_matrix(&mut level.matrix, matrix)?;
            backend.upload_vec(&inverse_diagonal(matrix), &level.inv_diag)?;
        }
        self.coarse_inverse = match (&self.host.coarse_inverse, self.host.levels.last()) {
            (Some(inv), Some(last)) => {
                let dense = dense_matrix(last.nb, inv.clone());
                match self.coarse_inverse.take() {
                    Some(mut existing) => {
                        backend.update_matrix(&mut existing, &dense)?;
                        Some(existing)
                    }
                    None => Some(backend.upload_matrix(&dense)?),
                }
            }
            _ => None,
        };
        Ok(())
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    /// Right-hand side of the finest level.
    pub fn rhs(&self) -> Result<&B::Buffer> {
        self.levels
            .first()
            .map(|l| &l.b)
            .ok_or_else(|| FlowbridgeError::Solve("empty AMG hierarchy".into()))
    }

    /// Solution of the finest level after `vcycle`.
    pub fn solution(&self) -> Result<&B::Buffer> {
        self.levels
            .first()
            .map(|l| &l.x)
            .ok_or_else(|| FlowbridgeError::Solve("empty AMG hierarchy".into()))
    }

    /// One V-cycle on the finest level, from a zero initial guess.
    pub fn vcycle(&self, backend: &B) -> Result<()> {
        self.cycle(backend, 0)
    }

    fn smooth(&self, backend: &B, level: &DeviceLevel<B>, sweeps: usize) -> Result<()> {
        for _ in 0..sweeps {
            backend.residual(&level.matrix, &level.x, &level.b, &level.tmp)?;
            backend.vmul(self.smoother_weight, &level.inv_diag, &level.tmp, &level.x)?;
        }
        Ok(())
    }

    fn cycle(&self, backend: &B, l: usize) -> Result<()> {
        let level = &self.levels[l];
        let omega = self.smoother_weight;
        match &level.transfer {
            None => match &self.coarse_inverse {
                Some(inv) => backend.spmv(inv, &level.b, &level.x),
                None => {
                    backend.zero(&level.x)?;
                    backend.vmul(omega, &level.inv_diag, &level.b, &level.x)?;
                    self.smooth(backend, level, COARSE_SWEEPS - 1)
                }
            },
            Some(transfer) => {
                let next = &self.levels[l + 1];
                // pre-smoothing from zero is one scaled Jacobi step
                backend.zero(&level.x)?;
                backend.vmul(omega, &level.inv_diag, &level.b, &level.x)?;
                backend.residual(&level.matrix, &level.x, &level.b, &level.tmp)?;
                backend.spmv(&transfer.restriction, &level.tmp, &next.b)?;
                self.cycle(backend, l + 1)?;
                backend.prolongate_vector(&next.x, &level.x, &transfer.aggregates, level.n)?;
                self.smooth(backend, level, 1)
            }
        }
    }
}

fn weights_for(config: &BridgeConfig, matrix: &BlockCsrMatrix) -> Result<Vec<f64>> {
    match config.cpr_weights {
        CprWeights::QuasiImpes => quasi_impes_weights(matrix, config.pressure_index),
        CprWeights::Trivial => Ok(trivial_weights(
            matrix.nb,
            matrix.block_size,
            config.pressure_index,
        )),
    }
}

/// Two-stage CPR: AMG on the weighted pressure system, then block-ILU(0).
pub struct CprPreconditioner<B: SolverBackend> {
    nb: usize,
    block_size: usize,
    pressure_index: usize,
    weights: B::Buffer,
    amg: AmgHierarchy<B>,
    ilu: IluApply<B>,
    t: B::Buffer,
    u: B::Buffer,
}

impl<B: SolverBackend> CprPreconditioner<B> {
    pub fn setup(
        backend: &B,
        config: &BridgeConfig,
        matrix: &BlockCsrMatrix,
        num_jacobi_blocks: usize,
    ) -> Result<Self> {
        config.validate_for_block_size(matrix.block_size)?;
        let w = weights_for(config, matrix)?;
        let weights = backend.new_buffer(w.len())?;
        backend.upload_vec(&w, &weights)?;
        let amg = AmgHierarchy::setup(
            backend,
            pressure_matrix(matrix, &w, config.pressure_index),
            config,
        )?;

        let partitioned = drop_partition_couplings(matrix, num_jacobi_blocks);
        let factors = BlockIlu0::factor(&partitioned)?;
        let ilu = IluApply::new(backend, &factors, config.ilu_parallel)?;

        Ok(Self {
            nb: matrix.nb,
            block_size: matrix.block_size,
            pressure_index: config.pressure_index,
            weights,
            amg,
            ilu,
            t: backend.new_buffer(matrix.n())?,
            u: backend.new_buffer(matrix.n())?,
        })
    }

    pub fn refresh(
        &mut self,
        backend: &B,
        config: &BridgeConfig,
        matrix: &BlockCsrMatrix,
        num_jacobi_blocks: usize,
    ) -> Result<()> {
        config.validate_for_block_size(matrix.block_size)?;
        let w = weights_for(config, matrix)?;
        backend.resize_buffer(&mut self.weights, w.len())?;
        backend.upload_vec(&w, &self.weights)?;
        self.amg.refresh(
            backend,
            pressure_matrix(matrix, &w, config.pressure_index),
            config,
        )?;

        let partitioned = drop_partition_couplings(matrix, num_jacobi_blocks);
        let factors = BlockIlu0::factor(&partitioned)?;
        self.ilu.refresh(backend, &factors, config.ilu_parallel)?;

        backend.resize_buffer(&mut self.t, matrix.n())?;
        backend.resize_buffer(&mut self.u, matrix.n())?;
        self.nb = matrix.nb;
        self.block_size = matrix.block_size;
        self.pressure_index = config.pressure_index;
        Ok(())
    }

    pub fn num_levels(&self) -> usize {
        self.amg.num_levels()
    }

    /// z = M⁻¹ r with `a` the system matrix.
    pub fn apply(&self, backend: &B, a: &B::Matrix, r: &B::Buffer, z: &B::Buffer) -> Result<()> {
        backend.restrict_to_pressure(r, &self.weights, self.amg.rhs()?, self.nb, self.block_size)?;
        self.amg.vcycle(backend)?;
        backend.zero(z)?;
        backend.add_coarse_pressure_correction(
            self.amg.solution()?,
            z,
            self.nb,
            self.block_size,
            self.pressure_index,
        )?;
        backend.residual(a, z, r, &self.t)?;
        self.ilu.apply(backend, &self.t, &self.u)?;
        backend.axpy(1.0, &self.u, z)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PreconditionerKind;
    use crate::solver::bicgstab::{bicgstab, KrylovWorkspace};
    use crate::solver::cpu::CpuBackend;
    use approx::assert_abs_diff_eq;

    fn laplacian(n: usize) -> BlockCsrMatrix {
        let mut t = Vec::new();
        for i in 0..n {
            t.push((i, i, 2.0));
            if i > 0 {
                t.push((i, i - 1, -1.0));
            }
            if i + 1 < n {
                t.push((i, i + 1, -1.0));
            }
        }
        BlockCsrMatrix::from_scalar_triplets(n, n, 1, &t).unwrap()
    }

    fn two_phase(nb: usize) -> BlockCsrMatrix {
        let mut t = Vec::new();
        for i in 0..nb {
            t.push((i, i, vec![4.0, 0.5, 0.2, 3.0]));
            if i > 0 {
                t.push((i, i - 1, vec![-1.5, 0.1, 0.0, -1.0]));
            }
            if i + 1 < nb {
                t.push((i, i + 1, vec![-1.5, 0.0, 0.1, -1.0]));
            }
        }
        BlockCsrMatrix::from_block_triplets(nb, nb, 2, &t).unwrap()
    }

    fn cpr_config(coarse_size: usize) -> BridgeConfig {
        BridgeConfig {
            preconditioner: PreconditionerKind::Cpr,
            coarse_size,
            ..BridgeConfig::cpu()
        }
    }

    #[test]
    fn quasi_impes_solves_transposed_diagonal() {
        let a = BlockCsrMatrix::from_block_triplets(1, 1, 2, &[(0, 0, vec![2.0, 1.0, 1.0, 3.0])])
            .unwrap();
        let w = quasi_impes_weights(&a, 0).unwrap();
        // D⁻ᵀ e_0 = [3, -1] / 5, scaled to unit max
        assert_abs_diff_eq!(w[0], 1.0, epsilon = 1e-14);
        assert_abs_diff_eq!(w[1], -1.0 / 3.0, epsilon = 1e-14);
        assert_eq!(trivial_weights(2, 3, 1), vec![0.0, 1.0, 0.0, 0.0, 1.0, 0.0]);
    }

    #[test]
    fn pressure_matrix_weights_pressure_column() {
        let a = two_phase(3);
        let p = pressure_matrix(&a, &trivial_weights(3, 2, 0), 0);
        assert_eq!(p.block_size, 1);
        assert_eq!(p.to_dense()[0], vec![4.0, -1.5, 0.0]);
        let w = vec![1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
        let p = pressure_matrix(&a, &w, 1);
        assert_abs_diff_eq!(p.to_dense()[1][1], 3.5, epsilon = 1e-14);
    }

    #[test]
    fn aggregation_of_path_graph() {
        let agg = aggregate(&laplacian(9), STRENGTH_THRESHOLD);
        assert_eq!(agg.num_aggregates, 3);
        assert_eq!(agg.aggregate_of, vec![0, 0, 1, 1, 1, 2, 2, 2, 2]);
    }

    #[test]
    fn galerkin_preserves_entry_sum() {
        let a = laplacian(9);
        let agg = aggregate(&a, STRENGTH_THRESHOLD);
        let coarse = galerkin(&a, &agg).unwrap();
        assert_eq!(coarse.nb, 3);
        let fine_sum: f64 = a.values.iter().sum();
        let coarse_sum: f64 = coarse.values.iter().sum();
        assert_abs_diff_eq!(fine_sum, coarse_sum, epsilon = 1e-14);

        let r = restriction(&agg);
        r.validate().unwrap();
        assert_eq!(r.spmv(&[1.0; 9]).unwrap(), vec![2.0, 3.0, 4.0]);
    }

    #[test]
    fn hierarchy_coarsens_until_small() {
        let host = HostHierarchy::build(laplacian(200), 10, 10).unwrap();
        assert!(host.levels.len() > 2);
        assert!(host.levels.last().unwrap().nb <= 10);
        assert!(host.coarse_inverse.is_some());

        let limited = HostHierarchy::build(laplacian(200), 10, 1).unwrap();
        assert_eq!(limited.levels.len(), 1);
    }

    #[test]
    fn refresh_rebuilds_when_coarsening_limits_change() {
        let be = CpuBackend::new();
        let config = cpr_config(10);
        let mut amg = AmgHierarchy::setup(&be, laplacian(200), &config).unwrap();
        let fine_levels = amg.num_levels();
        assert!(fine_levels > 2);

        amg.refresh(&be, laplacian(200), &config).unwrap();
        assert_eq!(amg.num_levels(), fine_levels);

        amg.refresh(&be, laplacian(200), &cpr_config(500)).unwrap();
        assert_eq!(amg.num_levels(), 1);

        let capped = BridgeConfig {
            max_levels: 2,
            ..cpr_config(10)
        };
        amg.refresh(&be, laplacian(200), &capped).unwrap();
        assert_eq!(amg.num_levels(), 2);
    }

    #[test]
    fn single_level_cpr_is_exact_for_scalar_systems() {
        let be = CpuBackend::new();
        let a = laplacian(12);
        let config = cpr_config(50);
        let cpr = CprPreconditioner::setup(&be, &config, &a, 0).unwrap();
        assert_eq!(cpr.num_levels(), 1);

        let r_host: Vec<f64> = (0..12).map(|i| 1.0 + i as f64).collect();
        let expected = direct::solve_block_system(&a, &r_host).unwrap();
        let r = be.new_buffer(12).unwrap();
        let z = be.new_buffer(12).unwrap();
        be.upload_vec(&r_host, &r).unwrap();
        cpr.apply(&be, &a, &r, &z).unwrap();
        for (zi, ei) in z.to_vec().iter().zip(&expected) {
            assert_abs_diff_eq!(*zi, *ei, epsilon = 1e-9);
        }
    }

    #[test]
    fn multilevel_cpr_accelerates_bicgstab() {
        let be = CpuBackend::new();
        let a = two_phase(120);
        let config = cpr_config(10);
        let mut cpr = CprPreconditioner::setup(&be, &config, &a, 0).unwrap();
        assert!(cpr.num_levels() > 1);
        // same pattern, new values
        let mut scaled = a.clone();
        scaled.values.iter_mut().for_each(|v| *v *= 2.0);
        cpr.refresh(&be, &config, &scaled, 0).unwrap();

        let x_star: Vec<f64> = (0..240).map(|i| ((i % 7) as f64) - 3.0).collect();
        let b_host = scaled.spmv(&x_star).unwrap();
        let ws = KrylovWorkspace::new(&be, 240).unwrap();
        let b = be.new_buffer(240).unwrap();
        let x = be.new_buffer(240).unwrap();
        be.upload_vec(&b_host, &b).unwrap();
        let result = bicgstab(
            &be,
            |i, o| be.spmv(&scaled, i, o),
            |i, o| cpr.apply(&be, &scaled, i, o),
            &b,
            &x,
            &ws,
            1e-10,
            100,
        )
        .unwrap();
        assert!(result.converged);
        for (xi, ei) in x.to_vec().iter().zip(&x_star) {
            assert_abs_diff_eq!(*xi, *ei, epsilon = 1e-6);
        }
    }
}
