//! Integration tests comparing the accelerated and the host solve paths.
//!
//! Note: the device kernels need f64 shader support. Adapters without it are
//! treated as unavailable and the tests return early.

use approx::assert_abs_diff_eq;
use flowbridge::config::{AcceleratorMode, BridgeConfig, PreconditionerKind};
use flowbridge::matrix_market;
use flowbridge::solver::device::WgpuBackend;
use flowbridge::solver::SolverBackend;
use flowbridge::{Bridge, BlockCsrMatrix, FlowbridgeError, WellContributions};

fn gpu_available() -> bool {
    WgpuBackend::new(&BridgeConfig::default())
        .map(|backend| backend.caps().supports_f64)
        .unwrap_or(false)
}

macro_rules! skip_if_no_gpu {
    () => {
        if !gpu_available() {
            eprintln!("Skipping: no GPU with f64 support available");
            return;
        }
    };
}

fn block_system(nb: usize, bs: usize) -> BlockCsrMatrix {
    let mut t = Vec::new();
    for i in 0..nb {
        let mut diag = vec![0.0; bs * bs];
        for r in 0..bs {
            for c in 0..bs {
                diag[r * bs + c] = if r == c { 6.0 + r as f64 } else { 0.3 * (r + 2 * c) as f64 / bs as f64 };
            }
        }
        t.push((i, i, diag));
        let off: Vec<f64> = (0..bs * bs).map(|k| if k % (bs + 1) == 0 { -1.0 } else { 0.05 }).collect();
        if i > 0 {
            t.push((i, i - 1, off.clone()));
        }
        if i + 1 < nb {
            t.push((i, i + 1, off));
        }
    }
    BlockCsrMatrix::from_block_triplets(nb, nb, bs, &t).unwrap()
}

fn device_config(preconditioner: PreconditionerKind) -> BridgeConfig {
    BridgeConfig {
        accelerator: AcceleratorMode::Auto,
        preconditioner,
        tolerance: 1e-10,
        ..BridgeConfig::default()
    }
}

/// Solve on the given configuration with contributions matching its backend.
fn solve_with(config: BridgeConfig, a: &BlockCsrMatrix, b: &[f64]) -> Result<Vec<f64>, FlowbridgeError> {
    let mode = config.accelerator;
    let mut wells = WellContributions::create(mode.name(), mode.uses_device())?;
    let mut bridge = Bridge::new(config)?;
    let result = bridge.solve(a, b, 0, &mut wells)?;
    assert!(result.converged, "{result:?}");
    let mut x = vec![0.0; b.len()];
    bridge.get_result(&mut x)?;
    Ok(x)
}

fn assert_paths_agree(preconditioner: PreconditionerKind, a: &BlockCsrMatrix) {
    let b: Vec<f64> = (0..a.n()).map(|i| (i as f64 * 0.37).sin() + 1.0).collect();
    let gpu = solve_with(device_config(preconditioner), a, &b).expect("device solve failed");
    let cpu_config = BridgeConfig {
        accelerator: AcceleratorMode::None,
        ..device_config(preconditioner)
    };
    let cpu = solve_with(cpu_config, a, &b).expect("host solve failed");
    for (g, c) in gpu.iter().zip(&cpu) {
        assert_abs_diff_eq!(*g, *c, epsilon = 1e-7);
    }
}

// ── Agreement with the host path ──────────────────────────────────

#[test]
fn gpu_jacobi_matches_cpu() {
    skip_if_no_gpu!();
    assert_paths_agree(PreconditionerKind::Jacobi, &block_system(40, 3));
}

#[test]
fn gpu_ilu0_matches_cpu() {
    skip_if_no_gpu!();
    assert_paths_agree(PreconditionerKind::Ilu0, &block_system(40, 3));
}

#[test]
fn gpu_scalar_blocks_match_cpu() {
    skip_if_no_gpu!();
    assert_paths_agree(PreconditionerKind::Ilu0, &block_system(200, 1));
}

#[test]
fn gpu_cpr_matches_cpu() {
    skip_if_no_gpu!();
    assert_paths_agree(PreconditionerKind::Cpr, &block_system(120, 2));
}

#[test]
fn gpu_matr33_reference_system() {
    skip_if_no_gpu!();
    let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data");
    let a = matrix_market::load_block_matrix(format!("{dir}/matr33.txt")).unwrap();
    let b = matrix_market::load_vector(format!("{dir}/rhs3.txt")).unwrap();
    let config = BridgeConfig {
        tolerance: 1e-2,
        max_iterations: 10,
        ..device_config(PreconditionerKind::Ilu0)
    };
    let x = solve_with(config, &a, &b).unwrap();
    let reference = flowbridge::solver::direct::solve_block_system(&a, &b).unwrap();
    for (xi, ri) in x.iter().zip(&reference) {
        assert!((xi - ri).abs() <= 1e-3 * ri.abs().max(1e-12), "{xi} vs {ri}");
    }
}

// ── Buffer reuse and wells on the device ──────────────────────────

#[test]
fn gpu_reuses_buffers_across_solves() {
    skip_if_no_gpu!();
    let config = device_config(PreconditionerKind::Ilu0);
    let mut bridge = Bridge::new(config.clone()).unwrap();
    let mut wells = WellContributions::create("auto", true).unwrap();
    let first = block_system(30, 3);
    let mut second = first.clone();
    for v in second.values.iter_mut() {
        *v *= 1.5;
    }
    let b = vec![1.0; first.n()];

    for a in [&first, &second] {
        assert!(bridge.solve(a, &b, 0, &mut wells).unwrap().converged);
        let mut x = vec![0.0; b.len()];
        bridge.get_result(&mut x).unwrap();
        let fresh = solve_with(config.clone(), a, &b).unwrap();
        for (xi, fi) in x.iter().zip(&fresh) {
            assert_abs_diff_eq!(*xi, *fi, epsilon = 1e-8);
        }
    }
    assert!(bridge.stats().gpu_dispatches > 0);
    assert!(bridge.stats().gpu_readbacks > 0);
}

#[test]
fn gpu_applies_well_contributions() {
    skip_if_no_gpu!();
    let a = block_system(20, 3);
    let b = vec![1.0; a.n()];
    let block: Vec<f64> = (0..9).map(|k| if k % 4 == 0 { 0.8 } else { 0.0 }).collect();

    let mut device = Bridge::new(device_config(PreconditionerKind::Ilu0)).unwrap();
    let mut device_wells = WellContributions::create("auto", true).unwrap();
    device_wells.add_entry(0, 3, 3, &block).unwrap();
    device_wells.add_entry(0, 3, 15, &block).unwrap();
    assert!(device.solve(&a, &b, 0, &mut device_wells).unwrap().converged);
    let mut x_gpu = vec![0.0; b.len()];
    device.get_result(&mut x_gpu).unwrap();

    let mut host = Bridge::new(BridgeConfig {
        accelerator: AcceleratorMode::None,
        ..device_config(PreconditionerKind::Ilu0)
    })
    .unwrap();
    let mut host_wells = WellContributions::host();
    host_wells.add_entry(0, 3, 3, &block).unwrap();
    host_wells.add_entry(0, 3, 15, &block).unwrap();
    assert!(host.solve(&a, &b, 0, &mut host_wells).unwrap().converged);
    let mut x_cpu = vec![0.0; b.len()];
    host.get_result(&mut x_cpu).unwrap();

    for (g, c) in x_gpu.iter().zip(&x_cpu) {
        assert_abs_diff_eq!(*g, *c, epsilon = 1e-7);
    }
}

#[test]
fn host_contributions_rejected_by_device_solve() {
    skip_if_no_gpu!();
    let a = block_system(5, 3);
    let mut bridge = Bridge::new(device_config(PreconditionerKind::Jacobi)).unwrap();
    let mut wells = WellContributions::host();
    let err = bridge.solve(&a, &vec![1.0; a.n()], 0, &mut wells).unwrap_err();
    assert!(matches!(err, FlowbridgeError::BackendMismatch { .. }));
}

#[test]
fn narrow_execution_width_rejects_large_blocks() {
    skip_if_no_gpu!();
    // 5×5 blocks need 25 lanes; a width of 16 cannot hold them
    let config = BridgeConfig {
        execution_width: Some(16),
        ..device_config(PreconditionerKind::Jacobi)
    };
    let a = block_system(4, 5);
    let mut bridge = Bridge::new(config).unwrap();
    let mut wells = WellContributions::create("auto", true).unwrap();
    let err = bridge.solve(&a, &vec![1.0; a.n()], 0, &mut wells).unwrap_err();
    assert!(matches!(err, FlowbridgeError::Unsupported { .. }), "{err}");
}

#[test]
fn short_weight_buffer_is_a_solve_error() {
    skip_if_no_gpu!();
    let backend = WgpuBackend::new(&BridgeConfig::default()).unwrap();
    let fine = backend.new_buffer(6).unwrap();
    let weights = backend.new_buffer(4).unwrap();
    let coarse = backend.new_buffer(2).unwrap();
    let err = backend
        .restrict_to_pressure(&fine, &weights, &coarse, 2, 3)
        .unwrap_err();
    assert!(matches!(err, FlowbridgeError::Solve(_)), "{err}");
    assert!(err.to_string().contains("restrict_to_pressure"), "{err}");
}

#[test]
fn dot_products_reuse_reduction_buffers() {
    skip_if_no_gpu!();
    let backend = WgpuBackend::new(&BridgeConfig::default()).unwrap();
    assert_eq!(backend.context().reduction_capacity(), 0);

    let x = backend.new_buffer(1000).unwrap();
    backend.upload_vec(&vec![2.0; 1000], &x).unwrap();
    assert_abs_diff_eq!(backend.dot(&x, &x).unwrap(), 4000.0, epsilon = 1e-9);
    let capacity = backend.context().reduction_capacity();
    assert!(capacity >= 16);

    let small = backend.new_buffer(10).unwrap();
    backend.upload_vec(&vec![1.0; 10], &small).unwrap();
    for _ in 0..3 {
        assert_abs_diff_eq!(backend.dot(&small, &small).unwrap(), 10.0, epsilon = 1e-12);
        assert_abs_diff_eq!(backend.dot(&x, &x).unwrap(), 4000.0, epsilon = 1e-9);
    }
    assert_eq!(backend.context().reduction_capacity(), capacity);
}
