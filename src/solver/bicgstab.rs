//! Generic BiCGSTAB iterative solver.
//!
//! Right-preconditioned BiCGSTAB written against the `SolverBackend` trait so
//! that the same loop runs on the host and on the accelerator. The operator
//! and the preconditioner are closures: the bridge passes `A + W` for the
//! operator when wells contribute, and any of the preconditioners.

use crate::error::Result;

use super::backend::SolverBackend;

/// Scalars below this fraction of ‖r₀‖² count as a breakdown.
const BREAKDOWN: f64 = 1e-30;

/// Outcome of one Krylov solve. Not converging is a value, not an error.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Convergence {
    pub converged: bool,
    pub iterations: usize,
    /// ‖r‖ / ‖r₀‖ at exit.
    pub reduction: f64,
}

/// Scratch vectors of the BiCGSTAB loop, kept across solves.
pub struct KrylovWorkspace<B: SolverBackend> {
    r: B::Buffer,
    r_hat: B::Buffer,
    p: B::Buffer,
    v: B::Buffer,
    s: B::Buffer,
    t: B::Buffer,
    p_hat: B::Buffer,
    s_hat: B::Buffer,
}

impl<B: SolverBackend> KrylovWorkspace<B> {
    pub fn new(backend: &B, n: usize) -> Result<Self> {
        Ok(Self {
            r: backend.new_buffer(n)?,
            r_hat: backend.new_buffer(n)?,
            p: backend.new_buffer(n)?,
            v: backend.new_buffer(n)?,
            s: backend.new_buffer(n)?,
            t: backend.new_buffer(n)?,
            p_hat: backend.new_buffer(n)?,
            s_hat: backend.new_buffer(n)?,
        })
    }

    pub fn resize(&mut self, backend: &B, n: usize) -> Result<()> {
        for buf in [
            &mut self.r,
            &mut self.r_hat,
            &mut self.p,
            &mut self.v,
            &mut self.s,
            &mut self.t,
            &mut self.p_hat,
            &mut self.s_hat,
        ] {
            backend.resize_buffer(buf, n)?;
        }
        Ok(())
    }
}

/// Solve `A x = b` with right-preconditioned BiCGSTAB.
///
/// `x` holds the initial guess on entry and the last iterate on exit.
/// `operator(in, out)` computes `out = A * in`; `precondition(in, out)`
/// computes `out = M⁻¹ * in`. Iteration stops when `‖r‖ ≤ tolerance · ‖r₀‖`,
/// after `max_iterations` steps, or on breakdown.
pub fn bicgstab<B, Op, Pc>(
    backend: &B,
    operator: Op,
    precondition: Pc,
    b: &B::Buffer,
    x: &B::Buffer,
    ws: &KrylovWorkspace<B>,
    tolerance: f64,
    max_iterations: usize,
) -> Result<Convergence>
where
    B: SolverBackend,
    Op: Fn(&B::Buffer, &B::Buffer) -> Result<()>,
    Pc: Fn(&B::Buffer, &B::Buffer) -> Result<()>,
{
    let KrylovWorkspace {
        r,
        r_hat,
        p,
        v,
        s,
        t,
        p_hat,
        s_hat,
    } = ws;

    // r = b - A x
    operator(x, v)?;
    backend.copy(b, r)?;
    backend.axpy(-1.0, v, r)?;
    backend.copy(r, r_hat)?;

    let r0_norm = backend.dot(r, r)?.sqrt();
    if !r0_norm.is_finite() {
        tracing::warn!("initial residual is not finite");
        return Ok(Convergence {
            converged: false,
            iterations: 0,
            reduction: f64::NAN,
        });
    }
    if r0_norm == 0.0 {
        return Ok(Convergence {
            converged: true,
            iterations: 0,
            reduction: 0.0,
        });
    }
    let abs_tol = tolerance * r0_norm;
    let breakdown = BREAKDOWN * r0_norm * r0_norm;
    let stop = |iterations: usize, norm: f64, converged: bool| Convergence {
        converged,
        iterations,
        reduction: norm / r0_norm,
    };

    backend.zero(p)?;
    backend.zero(v)?;
    let mut rho: f64 = 1.0;
    let mut alpha: f64 = 1.0;
    let mut omega: f64 = 1.0;
    let mut r_norm = r0_norm;

    for iter in 0..max_iterations {
        let rho_new = backend.dot(r_hat, r)?;
        if rho_new.abs() < breakdown {
            tracing::warn!(iteration = iter, "BiCGSTAB breakdown: rho ~ 0");
            return Ok(stop(iter, r_norm, false));
        }

        let beta = (rho_new / rho) * (alpha / omega);
        rho = rho_new;

        // p = r + beta * (p - omega * v)
        backend.axpy(-omega, v, p)?;
        backend.scale(beta, p)?;
        backend.axpy(1.0, r, p)?;

        precondition(p, p_hat)?;
        operator(p_hat, v)?;

        let r_hat_dot_v = backend.dot(r_hat, v)?;
        if r_hat_dot_v.abs() < breakdown {
            tracing::warn!(iteration = iter, "BiCGSTAB breakdown: r_hat.v ~ 0");
            return Ok(stop(iter, r_norm, false));
        }
        alpha = rho / r_hat_dot_v;

        // s = r - alpha * v
        backend.copy(r, s)?;
        backend.axpy(-alpha, v, s)?;

        let s_norm = backend.dot(s, s)?.sqrt();
        if s_norm <= abs_tol {
            backend.axpy(alpha, p_hat, x)?;
            return Ok(stop(iter + 1, s_norm, true));
        }

        precondition(s, s_hat)?;
        operator(s_hat, t)?;

        let t_dot_s = backend.dot(t, s)?;
        let t_dot_t = backend.dot(t, t)?;
        if t_dot_t.abs() < breakdown {
            tracing::warn!(iteration = iter, "BiCGSTAB breakdown: ||t|| ~ 0");
            return Ok(stop(iter, r_norm, false));
        }
        omega = t_dot_s / t_dot_t;

        // x = x + alpha * p_hat + omega * s_hat
        backend.axpy(alpha, p_hat, x)?;
        backend.axpy(omega, s_hat, x)?;

        // r = s - omega * t
        backend.copy(s, r)?;
        backend.axpy(-omega, t, r)?;

        r_norm = backend.dot(r, r)?.sqrt();
        tracing::trace!(iteration = iter + 1, reduction = r_norm / r0_norm);
        if !r_norm.is_finite() {
            tracing::warn!(iteration = iter + 1, "BiCGSTAB diverged: non-finite residual");
            return Ok(stop(iter + 1, r_norm, false));
        }
        if r_norm <= abs_tol {
            return Ok(stop(iter + 1, r_norm, true));
        }
        if omega.abs() < BREAKDOWN {
            tracing::warn!(iteration = iter + 1, "BiCGSTAB breakdown: omega ~ 0");
            return Ok(stop(iter + 1, r_norm, false));
        }
    }

    Ok(stop(max_iterations, r_norm, false))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::cpu::CpuBackend;
    use crate::sparse::BlockCsrMatrix;

    fn laplacian(n: usize) -> BlockCsrMatrix {
        let mut t = Vec::new();
        for i in 0..n {
            t.push((i, i, vec![2.5]));
            if i > 0 {
                t.push((i, i - 1, vec![-1.0]));
            }
            if i + 1 < n {
                t.push((i, i + 1, vec![-1.0]));
            }
        }
        BlockCsrMatrix::from_block_triplets(n, n, 1, &t).unwrap()
    }

    fn solve(a: &BlockCsrMatrix, b: &[f64], tol: f64, maxit: usize) -> (Convergence, Vec<f64>) {
        let be = CpuBackend::new();
        let n = b.len();
        let ws = KrylovWorkspace::new(&be, n).unwrap();
        let rhs = be.new_buffer(n).unwrap();
        let x = be.new_buffer(n).unwrap();
        be.upload_vec(b, &rhs).unwrap();
        let result = bicgstab(
            &be,
            |i, o| be.spmv(a, i, o),
            |i, o| be.copy(i, o),
            &rhs,
            &x,
            &ws,
            tol,
            maxit,
        )
        .unwrap();
        (result, x.to_vec())
    }

    #[test]
    fn converges_to_known_solution() {
        let a = laplacian(20);
        let x_star: Vec<f64> = (0..20).map(|i| (i as f64 * 0.3).sin()).collect();
        let b = a.spmv(&x_star).unwrap();
        let (result, x) = solve(&a, &b, 1e-10, 200);
        assert!(result.converged);
        assert!(result.reduction <= 1e-10);
        for (xi, ei) in x.iter().zip(&x_star) {
            assert!((xi - ei).abs() < 1e-8, "{xi} vs {ei}");
        }
    }

    #[test]
    fn zero_rhs_is_trivially_converged() {
        let a = laplacian(4);
        let (result, x) = solve(&a, &[0.0; 4], 1e-8, 10);
        assert!(result.converged);
        assert_eq!(result.iterations, 0);
        assert_eq!(x, vec![0.0; 4]);
    }

    #[test]
    fn iteration_limit_is_reported_as_value() {
        let a = laplacian(50);
        let b = vec![1.0; 50];
        let (result, _) = solve(&a, &b, 1e-14, 2);
        assert!(!result.converged);
        assert_eq!(result.iterations, 2);
        assert!(result.reduction > 1e-14);
    }

    #[test]
    fn non_finite_input_does_not_error() {
        let a = laplacian(3);
        let (result, _) = solve(&a, &[f64::NAN, 1.0, 1.0], 1e-8, 10);
        assert!(!result.converged);
    }
}
