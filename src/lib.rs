pub mod bridge;
pub mod config;
pub mod error;
pub mod matrix_market;
pub mod output;
pub mod solver;
pub mod sparse;
pub mod stats;
pub mod wells;

pub use bridge::{Bridge, SolveResult};
pub use config::{AcceleratorMode, BridgeConfig, CprWeights, PreconditionerKind};
pub use error::{FlowbridgeError, Result};
pub use sparse::{BlockCsrMatrix, BlockStorage, FragmentedBlockMatrix};
pub use wells::{StandardWell, WellContributions};
