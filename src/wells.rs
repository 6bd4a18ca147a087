//! Well contributions to the reservoir system.
//!
//! Wells add couplings between the cells they perforate. The well model
//! hands them to the bridge per solve instead of rebuilding the reservoir
//! matrix: the operator applied inside the Krylov loop becomes `A + W`, where
//! `W` is assembled from the entries collected here.
//!
//! For a standard well with equations `B x + D x_w = 0` coupled back into the
//! reservoir through `C`, eliminating the well unknowns gives the Schur
//! complement `W = -Cᵀ D⁻¹ B`.

use std::collections::BTreeSet;

use crate::config::AcceleratorMode;
use crate::error::{FlowbridgeError, Result};
use crate::sparse::BlockCsrMatrix;

/// Linearized standard well, ready for elimination.
#[derive(Debug, Clone)]
pub struct StandardWell {
    /// Perforated cells (block rows of the reservoir matrix).
    pub cells: Vec<usize>,
    /// Number of well equations.
    pub num_unknowns: usize,
    /// One `num_unknowns × block_size` block per perforation, row-major.
    pub b: Vec<f64>,
    /// Same layout as `b`.
    pub c: Vec<f64>,
    /// Inverse of the `num_unknowns × num_unknowns` well block.
    pub d_inv: Vec<f64>,
}

/// Entries collected for the next solve.
#[derive(Debug, Clone, Default)]
pub struct WellStore {
    block_size: Option<usize>,
    entries: Vec<(usize, usize, Vec<f64>)>,
    wells: BTreeSet<usize>,
    well_unknowns: usize,
}

/// Frozen copy of the contributions taken at the start of a solve.
#[derive(Debug, Clone)]
pub struct WellSnapshot {
    pub num_wells: usize,
    pub well_unknowns: usize,
    /// Merged extra blocks, `None` when no well contributed.
    pub matrix: Option<BlockCsrMatrix>,
}

impl WellStore {
    fn add_entry(&mut self, well: usize, row: usize, col: usize, block: &[f64]) -> Result<()> {
        let bs = (block.len() as f64).sqrt() as usize;
        if bs == 0 || bs * bs != block.len() {
            return Err(FlowbridgeError::Solve(format!(
                "well {well}: block of {} values is not square",
                block.len()
            )));
        }
        match self.block_size {
            Some(expected) if expected != bs => {
                return Err(FlowbridgeError::Solve(format!(
                    "well {well}: block size {bs} differs from earlier entries ({expected})"
                )));
            }
            _ => self.block_size = Some(bs),
        }
        self.entries.push((row, col, block.to_vec()));
        self.wells.insert(well);
        Ok(())
    }

    fn add_standard_well(&mut self, well: usize, sw: &StandardWell) -> Result<()> {
        let nw = sw.num_unknowns;
        let nperf = sw.cells.len();
        if nw == 0 || nperf == 0 || sw.b.len() % (nperf * nw) != 0 {
            return Err(FlowbridgeError::Solve(format!(
                "well {well}: inconsistent standard well dimensions"
            )));
        }
        let bs = sw.b.len() / (nperf * nw);
        if sw.c.len() != sw.b.len() || sw.d_inv.len() != nw * nw || bs == 0 {
            return Err(FlowbridgeError::Solve(format!(
                "well {well}: B, C and D⁻¹ shapes do not match"
            )));
        }
        let perf_len = nw * bs;

        // D⁻¹ B_j for every perforation, nw × bs each
        let dinv_b: Vec<Vec<f64>> = (0..nperf)
            .map(|j| {
                let bj = &sw.b[j * perf_len..(j + 1) * perf_len];
                let mut out = vec![0.0; perf_len];
                for r in 0..nw {
                    for k in 0..nw {
                        let d = sw.d_inv[r * nw + k];
                        for c in 0..bs {
                            out[r * bs + c] += d * bj[k * bs + c];
                        }
                    }
                }
                out
            })
            .collect();

        for (i, &cell_i) in sw.cells.iter().enumerate() {
            let ci = &sw.c[i * perf_len..(i + 1) * perf_len];
            for (j, &cell_j) in sw.cells.iter().enumerate() {
                let mut block = vec![0.0; bs * bs];
                for r in 0..bs {
                    for c in 0..bs {
                        let mut sum = 0.0;
                        for k in 0..nw {
                            sum += ci[k * bs + r] * dinv_b[j][k * bs + c];
                        }
                        block[r * bs + c] = -sum;
                    }
                }
                self.add_entry(well, cell_i, cell_j, &block)?;
            }
        }
        self.well_unknowns += nw;
        Ok(())
    }

    fn snapshot_and_clear(&mut self, nb: usize, block_size: usize) -> Result<WellSnapshot> {
        if let Some(bs) = self.block_size.filter(|&bs| bs != block_size) {
            return Err(FlowbridgeError::Solve(format!(
                "well contributions use {bs}x{bs} blocks, system uses {block_size}x{block_size}"
            )));
        }
        let matrix = match self.block_size {
            None => None,
            Some(bs) => Some(BlockCsrMatrix::from_block_triplets(nb, nb, bs, &self.entries)?),
        };
        let taken = std::mem::take(self);
        Ok(WellSnapshot {
            num_wells: taken.wells.len(),
            well_unknowns: taken.well_unknowns,
            matrix,
        })
    }
}

/// Well contributions in the representation of one backend.
#[derive(Debug, Clone)]
pub enum WellContributions {
    /// Consumed by a host solve.
    Host(WellStore),
    /// Consumed by an accelerated solve on `accelerator`.
    Device {
        accelerator: AcceleratorMode,
        store: WellStore,
    },
}

impl WellContributions {
    /// Create an empty handle for the named backend.
    pub fn create(backend_name: &str, use_gpu_contributions: bool) -> Result<Self> {
        let accelerator = AcceleratorMode::from_name(backend_name).ok_or_else(|| {
            FlowbridgeError::Config(format!("unknown well contribution backend '{backend_name}'"))
        })?;
        if !use_gpu_contributions {
            return Ok(Self::Host(WellStore::default()));
        }
        if !accelerator.uses_device() {
            return Err(FlowbridgeError::Config(format!(
                "device well contributions requested for backend '{backend_name}'"
            )));
        }
        Ok(Self::Device {
            accelerator,
            store: WellStore::default(),
        })
    }

    pub fn host() -> Self {
        Self::Host(WellStore::default())
    }

    fn store(&self) -> &WellStore {
        match self {
            Self::Host(store) | Self::Device { store, .. } => store,
        }
    }

    fn store_mut(&mut self) -> &mut WellStore {
        match self {
            Self::Host(store) | Self::Device { store, .. } => store,
        }
    }

    /// Name of the representation, for messages.
    pub fn kind(&self) -> String {
        match self {
            Self::Host(_) => "host".into(),
            Self::Device { accelerator, .. } => format!("device ({accelerator})"),
        }
    }

    /// Add one `block_size × block_size` block coupling cell `row` to cell `col`.
    pub fn add_entry(&mut self, well: usize, row: usize, col: usize, block: &[f64]) -> Result<()> {
        self.store_mut().add_entry(well, row, col, block)
    }

    /// Add the eliminated couplings `-Cᵢᵀ D⁻¹ Bⱼ` of a standard well.
    pub fn add_standard_well(&mut self, well: usize, sw: &StandardWell) -> Result<()> {
        self.store_mut().add_standard_well(well, sw)
    }

    pub fn is_empty(&self) -> bool {
        self.store().entries.is_empty()
    }

    pub fn num_wells(&self) -> usize {
        self.store().wells.len()
    }

    /// Check that a solver running on `solver` (`None` for the host) may
    /// consume this representation.
    pub fn check_backend(&self, solver: Option<AcceleratorMode>) -> Result<()> {
        let ok = match (self, solver) {
            (Self::Host(_), None) => true,
            (Self::Device { accelerator, .. }, Some(active)) => {
                *accelerator == AcceleratorMode::Auto || *accelerator == active
            }
            _ => false,
        };
        if ok {
            Ok(())
        } else {
            Err(FlowbridgeError::BackendMismatch {
                contributions: self.kind(),
                solver: solver.map_or("host".to_string(), |m| m.to_string()),
            })
        }
    }

    /// Freeze the collected entries for one solve and start over.
    pub fn snapshot_and_clear(&mut self, nb: usize, block_size: usize) -> Result<WellSnapshot> {
        self.store_mut().snapshot_and_clear(nb, block_size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn create_picks_representation() {
        assert!(matches!(
            WellContributions::create("vulkan", false).unwrap(),
            WellContributions::Host(_)
        ));
        assert!(matches!(
            WellContributions::create("Vulkan", true).unwrap(),
            WellContributions::Device {
                accelerator: AcceleratorMode::Vulkan,
                ..
            }
        ));
        assert!(WellContributions::create("none", true).is_err());
        assert!(WellContributions::create("cuda", false).is_err());
    }

    #[test]
    fn backend_rules() {
        let host = WellContributions::host();
        assert!(host.check_backend(None).is_ok());
        assert!(matches!(
            host.check_backend(Some(AcceleratorMode::Vulkan)),
            Err(FlowbridgeError::BackendMismatch { .. })
        ));

        let metal = WellContributions::create("metal", true).unwrap();
        assert!(metal.check_backend(Some(AcceleratorMode::Metal)).is_ok());
        assert!(metal.check_backend(Some(AcceleratorMode::Vulkan)).is_err());
        assert!(metal.check_backend(None).is_err());

        let auto = WellContributions::create("auto", true).unwrap();
        assert!(auto.check_backend(Some(AcceleratorMode::Dx12)).is_ok());
    }

    #[test]
    fn snapshot_merges_and_clears() {
        let mut wells = WellContributions::host();
        wells.add_entry(0, 1, 1, &[1.0, 0.0, 0.0, 1.0]).unwrap();
        wells.add_entry(1, 1, 1, &[2.0, 0.0, 0.0, 2.0]).unwrap();
        wells.add_entry(1, 0, 1, &[0.5, 0.0, 0.0, 0.5]).unwrap();
        assert_eq!(wells.num_wells(), 2);

        let snap = wells.snapshot_and_clear(3, 2).unwrap();
        assert_eq!(snap.num_wells, 2);
        let m = snap.matrix.unwrap();
        assert_eq!(m.nnzb(), 2);
        assert_eq!(m.block(m.find(1, 1).unwrap()), &[3.0, 0.0, 0.0, 3.0]);

        assert!(wells.is_empty());
        let empty = wells.snapshot_and_clear(3, 2).unwrap();
        assert!(empty.matrix.is_none());
        assert_eq!(empty.num_wells, 0);
    }

    #[test]
    fn rejects_inconsistent_blocks() {
        let mut wells = WellContributions::host();
        assert!(wells.add_entry(0, 0, 0, &[1.0, 2.0, 3.0]).is_err());
        wells.add_entry(0, 0, 0, &[1.0]).unwrap();
        assert!(wells.add_entry(0, 0, 0, &[1.0, 0.0, 0.0, 1.0]).is_err());
        assert!(wells.snapshot_and_clear(2, 2).is_err());
    }

    #[test]
    fn block_size_mismatch_keeps_queued_entries() {
        let mut wells = WellContributions::host();
        wells.add_entry(4, 1, 1, &[2.0]).unwrap();
        assert!(wells.snapshot_and_clear(3, 2).is_err());
        assert_eq!(wells.num_wells(), 1);
        assert!(!wells.is_empty());

        let snap = wells.snapshot_and_clear(3, 1).unwrap();
        assert_eq!(snap.num_wells, 1);
        assert_eq!(snap.matrix.unwrap().to_dense()[1][1], 2.0);
        assert!(wells.is_empty());
    }

    #[test]
    fn standard_well_schur_complement() {
        // One well unknown, two perforations, scalar cells.
        // W_ij = -c_i * d_inv * b_j
        let sw = StandardWell {
            cells: vec![0, 2],
            num_unknowns: 1,
            b: vec![2.0, 3.0],
            c: vec![1.0, -1.0],
            d_inv: vec![0.5],
        };
        let mut wells = WellContributions::host();
        wells.add_standard_well(7, &sw).unwrap();
        let snap = wells.snapshot_and_clear(3, 1).unwrap();
        assert_eq!(snap.well_unknowns, 1);
        let dense = snap.matrix.unwrap().to_dense();
        assert_abs_diff_eq!(dense[0][0], -1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(dense[0][2], -1.5, epsilon = 1e-15);
        assert_abs_diff_eq!(dense[2][0], 1.0, epsilon = 1e-15);
        assert_abs_diff_eq!(dense[2][2], 1.5, epsilon = 1e-15);
        assert_eq!(dense[1], vec![0.0, 0.0, 0.0]);
    }
}
