//! Host-path integration tests for the solve bridge.
//!
//! Everything here runs without an accelerator; the device-unavailable tests
//! ask for an adapter index that cannot exist.

use approx::assert_abs_diff_eq;
use flowbridge::config::{AcceleratorMode, BridgeConfig, PreconditionerKind};
use flowbridge::matrix_market;
use flowbridge::solver::direct::solve_block_system;
use flowbridge::{Bridge, BlockCsrMatrix, FlowbridgeError, FragmentedBlockMatrix, WellContributions};

/// SPD block-tridiagonal surrogate with 2×2 blocks.
fn spd_surrogate(nb: usize, shift: f64) -> BlockCsrMatrix {
    let mut t = Vec::new();
    for i in 0..nb {
        t.push((i, i, vec![4.0 + shift, 1.0, 1.0, 3.0 + shift]));
        if i > 0 {
            t.push((i, i - 1, vec![-1.0, 0.0, 0.0, -1.0]));
        }
        if i + 1 < nb {
            t.push((i, i + 1, vec![-1.0, 0.0, 0.0, -1.0]));
        }
    }
    BlockCsrMatrix::from_block_triplets(nb, nb, 2, &t).unwrap()
}

fn known_solution(n: usize) -> Vec<f64> {
    (0..n).map(|i| 1.0 + 0.1 * (i % 7) as f64).collect()
}

fn norm(v: &[f64]) -> f64 {
    v.iter().map(|x| x * x).sum::<f64>().sqrt()
}

fn cpu_config(preconditioner: PreconditionerKind, tolerance: f64) -> BridgeConfig {
    BridgeConfig {
        preconditioner,
        tolerance,
        ..BridgeConfig::cpu()
    }
}

fn solve_once(config: BridgeConfig, a: &BlockCsrMatrix, b: &[f64]) -> Vec<f64> {
    let mut bridge = Bridge::new(config).unwrap();
    let mut wells = WellContributions::host();
    let result = bridge.solve(a, b, 0, &mut wells).unwrap();
    assert!(result.converged, "solve did not converge: {result:?}");
    let mut x = vec![0.0; b.len()];
    bridge.get_result(&mut x).unwrap();
    x
}

fn relative_residual(a: &BlockCsrMatrix, x: &[f64], b: &[f64]) -> f64 {
    norm(&a.residual(x, b).unwrap()) / norm(b)
}

// ── Convergence ───────────────────────────────────────────────────

#[test]
fn every_preconditioner_recovers_known_solution() {
    let a = spd_surrogate(30, 0.0);
    let x_star = known_solution(a.n());
    let b = a.spmv(&x_star).unwrap();

    for kind in [
        PreconditionerKind::Jacobi,
        PreconditionerKind::Ilu0,
        PreconditionerKind::Cpr,
    ] {
        let x = solve_once(cpu_config(kind, 1e-8), &a, &b);
        assert!(relative_residual(&a, &x, &b) <= 1e-8, "{kind}");
        for (xi, ei) in x.iter().zip(&x_star) {
            assert_abs_diff_eq!(*xi, *ei, epsilon = 1e-5);
        }
    }
}

#[test]
fn multilevel_cpr_converges() {
    let a = spd_surrogate(120, 0.0);
    let b = a.spmv(&known_solution(a.n())).unwrap();
    let config = BridgeConfig {
        coarse_size: 5,
        ..cpu_config(PreconditionerKind::Cpr, 1e-6)
    };
    let x = solve_once(config, &a, &b);
    assert!(relative_residual(&a, &x, &b) <= 1e-6);
}

#[test]
fn iteration_limit_is_a_value() {
    let a = spd_surrogate(60, 0.0);
    let b = a.spmv(&known_solution(a.n())).unwrap();
    let config = BridgeConfig {
        max_iterations: 1,
        ..cpu_config(PreconditionerKind::Jacobi, 1e-12)
    };
    let mut bridge = Bridge::new(config).unwrap();
    let mut wells = WellContributions::host();
    let result = bridge.solve(&a, &b, 0, &mut wells).unwrap();
    assert!(!result.converged);
    assert_eq!(result.iterations, 1);
    assert!(result.reduction > 1e-12);
    assert_eq!(bridge.stats().converged, 0);
    assert_eq!(bridge.stats().solves, 1);
}

#[test]
fn partitioned_preconditioner_still_converges() {
    let a = spd_surrogate(40, 0.0);
    let b = a.spmv(&known_solution(a.n())).unwrap();
    let mut bridge = Bridge::new(cpu_config(PreconditionerKind::Ilu0, 1e-8)).unwrap();
    let mut wells = WellContributions::host();
    let result = bridge.solve(&a, &b, 4, &mut wells).unwrap();
    assert!(result.converged);
    assert!(result.iterations > 1);
}

// ── Buffer reuse and contiguity ───────────────────────────────────

#[test]
fn reused_bridge_matches_fresh_bridges() {
    let first = spd_surrogate(25, 0.0);
    let second = spd_surrogate(25, 1.5);
    assert!(first.same_pattern(&second));
    let b = known_solution(first.n());

    for kind in [PreconditionerKind::Ilu0, PreconditionerKind::Cpr] {
        let config = cpu_config(kind, 1e-10);
        let mut bridge = Bridge::new(config.clone()).unwrap();
        let mut wells = WellContributions::host();
        let mut reused = Vec::new();
        for a in [&first, &second] {
            bridge.solve(a, &b, 0, &mut wells).unwrap();
            let mut x = vec![0.0; b.len()];
            bridge.get_result(&mut x).unwrap();
            reused.push(x);
        }

        let fresh = [
            solve_once(config.clone(), &first, &b),
            solve_once(config, &second, &b),
        ];
        for (r, f) in reused.iter().zip(&fresh) {
            for (ri, fi) in r.iter().zip(f) {
                assert_abs_diff_eq!(*ri, *fi, epsilon = 1e-8);
            }
        }
    }
}

#[test]
fn bridge_follows_growing_systems() {
    let mut bridge = Bridge::new(cpu_config(PreconditionerKind::Ilu0, 1e-8)).unwrap();
    let mut wells = WellContributions::host();
    for nb in [5, 12, 8] {
        let a = spd_surrogate(nb, 0.0);
        let b = a.spmv(&known_solution(a.n())).unwrap();
        assert!(bridge.solve(&a, &b, 0, &mut wells).unwrap().converged);
        let mut x = vec![0.0; a.n()];
        bridge.get_result(&mut x).unwrap();
        assert!(relative_residual(&a, &x, &b) <= 1e-8);
    }
}

#[test]
fn fragmented_input_matches_contiguous() {
    let a = spd_surrogate(20, 0.3);
    let b = a.spmv(&known_solution(a.n())).unwrap();
    let fragmented = FragmentedBlockMatrix::from_matrix(&a);
    let config = cpu_config(PreconditionerKind::Ilu0, 1e-9);

    let contiguous = solve_once(config.clone(), &a, &b);

    let mut bridge = Bridge::new(config).unwrap();
    let mut wells = WellContributions::host();
    assert!(bridge.solve(&fragmented, &b, 0, &mut wells).unwrap().converged);
    let mut x = vec![0.0; b.len()];
    bridge.get_result(&mut x).unwrap();
    for (xi, ci) in x.iter().zip(&contiguous) {
        assert_abs_diff_eq!(*xi, *ci, epsilon = 1e-8);
    }
}

// ── Device unavailable ────────────────────────────────────────────

fn unreachable_device() -> BridgeConfig {
    BridgeConfig {
        accelerator: AcceleratorMode::Vulkan,
        device_id: 999,
        tolerance: 1e-8,
        ..BridgeConfig::default()
    }
}

#[test]
fn missing_device_raises_then_host_retry_succeeds() {
    let a = spd_surrogate(10, 0.0);
    let b = a.spmv(&known_solution(a.n())).unwrap();

    let mut bridge = Bridge::new(unreachable_device()).unwrap();
    let mut wells = WellContributions::create("vulkan", true).unwrap();
    let err = bridge.solve(&a, &b, 0, &mut wells).unwrap_err();
    assert!(matches!(err, FlowbridgeError::DeviceInit(_)), "{err}");
    assert!(err.is_device_failure());

    let retry = BridgeConfig {
        accelerator: AcceleratorMode::None,
        ..unreachable_device()
    };
    let x = solve_once(retry, &a, &b);
    assert!(relative_residual(&a, &x, &b) <= 1e-8);
}

#[test]
fn cpu_fallback_degrades_in_place() {
    let a = spd_surrogate(10, 0.0);
    let b = a.spmv(&known_solution(a.n())).unwrap();
    let config = BridgeConfig {
        cpu_fallback: true,
        ..unreachable_device()
    };

    let mut bridge = Bridge::new(config).unwrap();
    let mut wells = WellContributions::create("vulkan", true).unwrap();
    for _ in 0..2 {
        let result = bridge.solve(&a, &b, 0, &mut wells).unwrap();
        assert!(result.converged);
    }
    assert!(bridge.is_degraded());
    assert_eq!(bridge.stats().fallbacks, 1);
    assert!(bridge.backend_name().unwrap().starts_with("cpu"));
}

// ── Wells ─────────────────────────────────────────────────────────

#[test]
fn well_entries_apply_to_one_solve_only() {
    let a = spd_surrogate(10, 0.0);
    let b = known_solution(a.n());
    let config = cpu_config(PreconditionerKind::Ilu0, 1e-10);
    let well_block = [0.5, 0.0, 0.0, 0.5];
    let coupling = [-0.25, 0.0, 0.0, -0.25];

    let mut bridge = Bridge::new(config.clone()).unwrap();
    let mut wells = WellContributions::host();
    wells.add_entry(0, 2, 2, &well_block).unwrap();
    wells.add_entry(0, 7, 7, &well_block).unwrap();
    wells.add_entry(0, 2, 7, &coupling).unwrap();
    wells.add_entry(0, 7, 2, &coupling).unwrap();

    assert!(bridge.solve(&a, &b, 0, &mut wells).unwrap().converged);
    assert!(wells.is_empty());
    let mut with_wells = vec![0.0; b.len()];
    bridge.get_result(&mut with_wells).unwrap();

    let mut assembled = vec![
        (2, 2, well_block.to_vec()),
        (7, 7, well_block.to_vec()),
        (2, 7, coupling.to_vec()),
        (7, 2, coupling.to_vec()),
    ];
    for row in 0..a.nb {
        for idx in a.row_pointers[row]..a.row_pointers[row + 1] {
            assembled.push((row, a.col_indices[idx], a.block(idx).to_vec()));
        }
    }
    let total = BlockCsrMatrix::from_block_triplets(a.nb, a.nb, 2, &assembled).unwrap();
    let reference = solve_block_system(&total, &b).unwrap();
    for (xi, ri) in with_wells.iter().zip(&reference) {
        assert_abs_diff_eq!(*xi, *ri, epsilon = 1e-8);
    }

    // Nothing added since: the next solve sees the bare reservoir matrix.
    assert!(bridge.solve(&a, &b, 0, &mut wells).unwrap().converged);
    let mut without = vec![0.0; b.len()];
    bridge.get_result(&mut without).unwrap();
    let bare = solve_once(config, &a, &b);
    for (xi, ri) in without.iter().zip(&bare) {
        assert_abs_diff_eq!(*xi, *ri, epsilon = 1e-8);
    }
}

#[test]
fn well_block_size_must_match_system() {
    let a = spd_surrogate(4, 0.0);
    let mut bridge = Bridge::new(BridgeConfig::cpu()).unwrap();
    let mut wells = WellContributions::host();
    wells.add_entry(0, 1, 1, &[1.0; 9]).unwrap();
    let err = bridge.solve(&a, &[1.0; 8], 0, &mut wells).unwrap_err();
    assert!(matches!(err, FlowbridgeError::Solve(_)));
}

// ── Reference system ──────────────────────────────────────────────

#[test]
fn matr33_matches_direct_solve() {
    let dir = concat!(env!("CARGO_MANIFEST_DIR"), "/tests/data");
    let a = matrix_market::load_block_matrix(format!("{dir}/matr33.txt")).unwrap();
    let b = matrix_market::load_vector(format!("{dir}/rhs3.txt")).unwrap();
    assert_eq!((a.nb, a.block_size, a.nnzb()), (4, 3, 10));

    let config = BridgeConfig {
        max_iterations: 10,
        ..cpu_config(PreconditionerKind::Ilu0, 1e-2)
    };
    let mut bridge = Bridge::new(config).unwrap();
    let mut wells = WellContributions::host();
    let result = bridge.solve(&a, &b, 0, &mut wells).unwrap();
    assert!(result.converged);
    assert!(result.iterations < 10);

    let mut x = vec![0.0; b.len()];
    bridge.get_result(&mut x).unwrap();
    let reference = solve_block_system(&a, &b).unwrap();
    for (xi, ri) in x.iter().zip(&reference) {
        assert!((xi - ri).abs() <= 1e-3 * ri.abs().max(1e-12), "{xi} vs {ri}");
    }
}
