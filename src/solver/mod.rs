//! Linear system solvers.
//!
//! The Krylov loop and the preconditioners are written once against
//! [`backend::SolverBackend`]; `cpu` and `device` provide the host and the
//! accelerator implementations.

pub mod amg;
pub mod backend;
pub mod bicgstab;
pub mod cpu;
pub mod device;
pub mod direct;
pub mod kernels;
pub mod pipeline;
pub mod preconditioner;
pub mod shaders;

pub use backend::SolverBackend;
pub use bicgstab::Convergence;
