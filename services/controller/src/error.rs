//! Controller error taxonomy.

use thiserror::Error;

/// Errors surfaced by fleet operations.
///
/// Everything here degrades to a reduced-capacity but running fleet; only
/// persistence corruption at startup is treated as fatal, and that is
/// surfaced as `Store` by [`crate::store::Store::open`].
#[derive(Debug, Error)]
pub enum FleetError {
    /// A replica's local port is already bound on the host.
    #[error("port {0} is already in use")]
    PortInUse(u16),

    /// The container runtime rejected the requested resource caps.
    #[error("resource limits rejected by runtime: {0}")]
    ResourceLimitRejected(String),

    /// A rendered balancer configuration failed validation.
    #[error("balancer config failed validation: {0}")]
    InvalidConfig(String),

    /// Every port in the configured range is held.
    #[error("port range exhausted ({capacity} ports from {base})")]
    ExhaustedRange { base: u16, capacity: u16 },

    /// A scaling target outside `[0, max_replicas]`.
    #[error("invalid replica target {target} (max {max})")]
    InvalidTarget { target: u32, max: u32 },

    /// The container runtime daemon is unreachable.
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// A bounded step did not finish in time.
    #[error("timed out after {elapsed_secs}s: {operation}")]
    Timeout {
        operation: String,
        elapsed_secs: u64,
    },

    /// No replica with the given id.
    #[error("unknown replica id {0}")]
    UnknownReplica(u32),

    /// State store failure.
    #[error("state store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// Filesystem failure while staging or swapping balancer config.
    #[error("config io error: {0}")]
    ConfigIo(#[from] std::io::Error),

    /// Runtime invocation failure not covered by a more specific variant.
    #[error("runtime operation failed: {0}")]
    Runtime(String),
}

impl FleetError {
    /// Shorthand for a timeout on a named operation.
    pub fn timeout(operation: impl Into<String>, elapsed: std::time::Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            elapsed_secs: elapsed.as_secs(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let e = FleetError::PortInUse(14000);
        assert_eq!(e.to_string(), "port 14000 is already in use");

        let e = FleetError::ExhaustedRange {
            base: 14000,
            capacity: 16,
        };
        assert!(e.to_string().contains("16 ports from 14000"));

        let e = FleetError::InvalidTarget { target: 99, max: 32 };
        assert!(e.to_string().contains("99"));
    }
}
