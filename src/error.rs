use thiserror::Error;

#[derive(Debug, Error)]
pub enum FlowbridgeError {
    #[error("Device initialization error: {0}")]
    DeviceInit(String),

    #[error("Unsupported operation {op}: {reason}")]
    Unsupported { op: &'static str, reason: String },

    #[error("Backend mismatch: well contributions built for {contributions}, solver runs on {solver}")]
    BackendMismatch {
        contributions: String,
        solver: String,
    },

    #[error("Device error: {0}")]
    Device(String),

    #[error("Solve error: {0}")]
    Solve(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl FlowbridgeError {
    /// Errors after which the same system can still be solved on the host.
    pub fn is_device_failure(&self) -> bool {
        matches!(
            self,
            FlowbridgeError::DeviceInit(_) | FlowbridgeError::Unsupported { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, FlowbridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_failures_are_recoverable() {
        assert!(FlowbridgeError::DeviceInit("could not get device".into()).is_device_failure());
        assert!(FlowbridgeError::Unsupported {
            op: "spmv",
            reason: "no f64".into()
        }
        .is_device_failure());
        assert!(!FlowbridgeError::Solve("bad".into()).is_device_failure());
        assert!(!FlowbridgeError::Device("map failed".into()).is_device_failure());
    }

    #[test]
    fn messages_carry_context() {
        let err = FlowbridgeError::BackendMismatch {
            contributions: "host".into(),
            solver: "vulkan".into(),
        };
        let msg = format!("{err}");
        assert!(msg.contains("host") && msg.contains("vulkan"), "{msg}");
    }
}
