//! Bridge configuration.
//!
//! Options can be built in code, read from a TOML file, or overridden from
//! the command line. Every field has a default so a partial file is valid:
//!
//! ```toml
//! accelerator = "vulkan"
//! preconditioner = "cpr"
//! tolerance = 1e-3
//! max_iterations = 100
//! verbosity = 1
//! ```

use std::fmt;
use std::path::Path;

use serde_derive::Deserialize;

use crate::error::{FlowbridgeError, Result};

/// Which accelerator API the bridge should run on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum AcceleratorMode {
    /// Host-only solve.
    None,
    Vulkan,
    Metal,
    Dx12,
    /// First adapter from any native backend.
    Auto,
}

impl AcceleratorMode {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "none" | "cpu" | "host" => Some(Self::None),
            "vulkan" | "vk" => Some(Self::Vulkan),
            "metal" => Some(Self::Metal),
            "dx12" | "d3d12" => Some(Self::Dx12),
            "auto" | "gpu" => Some(Self::Auto),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Vulkan => "vulkan",
            Self::Metal => "metal",
            Self::Dx12 => "dx12",
            Self::Auto => "auto",
        }
    }

    pub fn uses_device(self) -> bool {
        self != Self::None
    }

    /// wgpu backends to enumerate for this mode.
    pub fn backends(self) -> wgpu::Backends {
        match self {
            Self::None => wgpu::Backends::empty(),
            Self::Vulkan => wgpu::Backends::VULKAN,
            Self::Metal => wgpu::Backends::METAL,
            Self::Dx12 => wgpu::Backends::DX12,
            Self::Auto => wgpu::Backends::VULKAN | wgpu::Backends::METAL | wgpu::Backends::DX12,
        }
    }

    /// Mode that corresponds to a concrete adapter backend.
    pub fn from_backend(backend: wgpu::Backend) -> Option<Self> {
        match backend {
            wgpu::Backend::Vulkan => Some(Self::Vulkan),
            wgpu::Backend::Metal => Some(Self::Metal),
            wgpu::Backend::Dx12 => Some(Self::Dx12),
            _ => None,
        }
    }
}

impl fmt::Display for AcceleratorMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for AcceleratorMode {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, String> {
        Self::from_name(&value).ok_or_else(|| format!("unknown accelerator '{value}'"))
    }
}

/// Preconditioner applied inside BiCGSTAB.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum PreconditionerKind {
    /// Inverse of the diagonal blocks.
    Jacobi,
    /// Block ILU(0) with level scheduling.
    Ilu0,
    /// Two-stage: AMG on the pressure subsystem followed by ILU(0).
    Cpr,
}

impl PreconditionerKind {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "jacobi" | "bjacobi" | "diag" => Some(Self::Jacobi),
            "ilu" | "ilu0" | "ilu(0)" => Some(Self::Ilu0),
            "cpr" | "amg" | "cpr_quasiimpes" => Some(Self::Cpr),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Jacobi => "jacobi",
            Self::Ilu0 => "ilu0",
            Self::Cpr => "cpr",
        }
    }
}

impl fmt::Display for PreconditionerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl TryFrom<String> for PreconditionerKind {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, String> {
        Self::from_name(&value).ok_or_else(|| format!("unknown preconditioner '{value}'"))
    }
}

/// How CPR weights the equations when forming the pressure system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub enum CprWeights {
    /// Solve `D_iᵀ w_i = e_p` for each diagonal block.
    QuasiImpes,
    /// `w_i = e_p`, i.e. take the pressure equation as is.
    Trivial,
}

impl CprWeights {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "quasiimpes" | "quasi_impes" | "quasi-impes" => Some(Self::QuasiImpes),
            "trivial" | "none" => Some(Self::Trivial),
            _ => None,
        }
    }
}

impl TryFrom<String> for CprWeights {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, String> {
        Self::from_name(&value).ok_or_else(|| format!("unknown CPR weighting '{value}'"))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct BridgeConfig {
    pub accelerator: AcceleratorMode,
    /// Reserved for APIs with several platforms; wgpu exposes one per backend.
    pub platform_id: usize,
    /// Index into the adapters enumerated for `accelerator`.
    pub device_id: usize,
    pub preconditioner: PreconditionerKind,
    /// Relative residual reduction at which BiCGSTAB stops.
    pub tolerance: f64,
    pub max_iterations: usize,
    /// 0 silent, 1 per-solve summary, 2 setup details, 4 per-kernel timing.
    pub verbosity: u32,
    /// Level-scheduled ILU sweeps; `false` runs each sweep in one thread.
    pub ilu_parallel: bool,
    /// Retry on the host when the device is unusable.
    pub cpu_fallback: bool,
    /// Overrides the lane-group width detected from the adapter.
    pub execution_width: Option<u32>,
    /// Position of the pressure unknown inside a block.
    pub pressure_index: usize,
    pub cpr_weights: CprWeights,
    /// AMG stops coarsening below this many rows.
    pub coarse_size: usize,
    pub max_levels: usize,
    /// Damping factor of the AMG Jacobi smoother.
    pub smoother_weight: f64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            accelerator: AcceleratorMode::Auto,
            platform_id: 0,
            device_id: 0,
            preconditioner: PreconditionerKind::Ilu0,
            tolerance: 1e-2,
            max_iterations: 200,
            verbosity: 0,
            ilu_parallel: true,
            cpu_fallback: false,
            execution_width: None,
            pressure_index: 0,
            cpr_weights: CprWeights::QuasiImpes,
            coarse_size: 50,
            max_levels: 10,
            smoother_weight: 0.67,
        }
    }
}

impl BridgeConfig {
    /// Host-only configuration.
    pub fn cpu() -> Self {
        Self {
            accelerator: AcceleratorMode::None,
            ..Self::default()
        }
    }

    pub fn from_toml_str(input: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(input).map_err(|e| FlowbridgeError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.tolerance > 0.0) {
            return Err(FlowbridgeError::Config(format!(
                "tolerance must be positive, got {}",
                self.tolerance
            )));
        }
        if self.max_iterations == 0 {
            return Err(FlowbridgeError::Config("max_iterations must be at least 1".into()));
        }
        if let Some(width) = self.execution_width {
            if !(4..=64).contains(&width) || !width.is_power_of_two() {
                return Err(FlowbridgeError::Config(format!(
                    "execution_width must be a power of two between 4 and 64, got {width}"
                )));
            }
        }
        if self.coarse_size == 0 || self.max_levels == 0 {
            return Err(FlowbridgeError::Config(
                "coarse_size and max_levels must be at least 1".into(),
            ));
        }
        if !(self.smoother_weight > 0.0 && self.smoother_weight <= 1.0) {
            return Err(FlowbridgeError::Config(format!(
                "smoother_weight must be in (0, 1], got {}",
                self.smoother_weight
            )));
        }
        Ok(())
    }

    /// Checks that depend on the block size of the system being solved.
    pub fn validate_for_block_size(&self, block_size: usize) -> Result<()> {
        if self.preconditioner == PreconditionerKind::Cpr && self.pressure_index >= block_size {
            return Err(FlowbridgeError::Config(format!(
                "pressure_index {} outside block of size {block_size}",
                self.pressure_index
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_case_insensitive() {
        assert_eq!(AcceleratorMode::from_name("Vulkan"), Some(AcceleratorMode::Vulkan));
        assert_eq!(AcceleratorMode::from_name("CPU"), Some(AcceleratorMode::None));
        assert_eq!(PreconditionerKind::from_name("ILU0"), Some(PreconditionerKind::Ilu0));
        assert_eq!(PreconditionerKind::from_name("amg"), Some(PreconditionerKind::Cpr));
        assert_eq!(PreconditionerKind::from_name("gmres"), None);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = BridgeConfig::from_toml_str(
            r#"
            accelerator = "none"
            preconditioner = "cpr"
            tolerance = 1e-4
            "#,
        )
        .unwrap();
        assert_eq!(config.accelerator, AcceleratorMode::None);
        assert_eq!(config.preconditioner, PreconditionerKind::Cpr);
        assert_eq!(config.tolerance, 1e-4);
        assert_eq!(config.max_iterations, 200);
        assert!(config.ilu_parallel);
        assert_eq!(config.execution_width, None);
    }

    #[test]
    fn unknown_names_are_rejected() {
        let err = BridgeConfig::from_toml_str("accelerator = \"opencl\"").unwrap_err();
        assert!(format!("{err}").contains("opencl"), "{err}");
        let err = BridgeConfig::from_toml_str("tol = 1.0").unwrap_err();
        assert!(matches!(err, FlowbridgeError::Config(_)));
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = BridgeConfig::cpu();
        config.tolerance = 0.0;
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::cpu();
        config.execution_width = Some(48);
        assert!(config.validate().is_err());

        let mut config = BridgeConfig::cpu();
        config.preconditioner = PreconditionerKind::Cpr;
        config.pressure_index = 3;
        assert!(config.validate().is_ok());
        assert!(config.validate_for_block_size(3).is_err());
        assert!(config.validate_for_block_size(4).is_ok());
    }
}
