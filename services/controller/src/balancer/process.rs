//! Balancer process interface and implementations.
//!
//! The controller never parses nginx internals; it needs exactly four
//! capabilities from the balancer process: syntax-validate a staged config,
//! reload, report liveness, and restart. The mock records calls so tests
//! can assert ordering against the runtime call log.

use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::error::FleetError;
use crate::runtime::{bounded, CallLog};

/// Interface to the load balancer process.
#[async_trait]
pub trait BalancerProcess: Send + Sync {
    /// Validate a staged configuration file using the balancer's own
    /// validation capability. Must not touch the live configuration.
    async fn validate(&self, staged: &Path) -> Result<(), FleetError>;

    /// Signal the balancer to reload its live configuration.
    async fn reload(&self) -> Result<(), FleetError>;

    /// Whether the balancer process is alive.
    async fn is_alive(&self) -> bool;

    /// (Re)start the balancer process.
    async fn restart(&self) -> Result<(), FleetError>;
}

/// nginx driven through its CLI and systemd.
///
/// The live config file is a `stream`-context snippet that the host nginx
/// pulls in with an `include` inside its `stream {}` block; validation
/// wraps the staged snippet in a scratch full configuration because
/// `nginx -t` only accepts a complete config file.
pub struct NginxProcess {
    op_timeout: Duration,
}

impl NginxProcess {
    pub fn new(op_timeout: Duration) -> Self {
        Self { op_timeout }
    }

    async fn run(&self, operation: &str, mut cmd: Command) -> Result<(), FleetError> {
        let invoke = async {
            let output = cmd
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| FleetError::Runtime(format!("failed to spawn {operation}: {e}")))?;

            if output.status.success() {
                Ok(())
            } else {
                Err(FleetError::Runtime(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ))
            }
        };
        bounded(operation, self.op_timeout, invoke).await
    }
}

/// A minimal complete nginx configuration that pulls in the staged
/// snippet, for syntax validation only.
fn validation_wrapper(staged: &Path) -> String {
    format!(
        "events {{}}\nstream {{\n    include {};\n}}\n",
        staged.display()
    )
}

#[async_trait]
impl BalancerProcess for NginxProcess {
    async fn validate(&self, staged: &Path) -> Result<(), FleetError> {
        let staged = staged.canonicalize()?;
        let wrapper: PathBuf = staged.with_extension("check");
        fs::write(&wrapper, validation_wrapper(&staged))?;

        let mut cmd = Command::new("nginx");
        cmd.arg("-t").arg("-c").arg(&wrapper);
        let result = self.run("nginx -t", cmd).await;
        let _ = fs::remove_file(&wrapper);

        result.map_err(|e| match e {
            FleetError::Runtime(msg) => FleetError::InvalidConfig(msg),
            other => other,
        })
    }

    async fn reload(&self) -> Result<(), FleetError> {
        let mut cmd = Command::new("nginx");
        cmd.args(["-s", "reload"]);
        self.run("nginx -s reload", cmd).await
    }

    async fn is_alive(&self) -> bool {
        let mut cmd = Command::new("pgrep");
        cmd.args(["-x", "nginx"]);
        self.run("pgrep nginx", cmd).await.is_ok()
    }

    async fn restart(&self) -> Result<(), FleetError> {
        let mut cmd = Command::new("systemctl");
        cmd.args(["restart", "nginx"]);
        self.run("systemctl restart nginx", cmd).await
    }
}

/// Mock balancer process for tests.
pub struct MockBalancer {
    calls: CallLog,
    valid: AtomicBool,
    alive: AtomicBool,
    reloads: AtomicU64,
    restarts: AtomicU64,
}

impl MockBalancer {
    pub fn new() -> Self {
        Self::with_log(CallLog::new())
    }

    /// Create a mock sharing an external call log.
    pub fn with_log(calls: CallLog) -> Self {
        Self {
            calls,
            valid: AtomicBool::new(true),
            alive: AtomicBool::new(true),
            reloads: AtomicU64::new(0),
            restarts: AtomicU64::new(0),
        }
    }

    /// Script whether validation passes.
    pub fn set_valid(&self, valid: bool) {
        self.valid.store(valid, Ordering::SeqCst);
    }

    /// Script process liveness.
    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    pub fn reload_count(&self) -> u64 {
        self.reloads.load(Ordering::SeqCst)
    }

    pub fn restart_count(&self) -> u64 {
        self.restarts.load(Ordering::SeqCst)
    }
}

impl Default for MockBalancer {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BalancerProcess for MockBalancer {
    async fn validate(&self, _staged: &Path) -> Result<(), FleetError> {
        if self.valid.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(FleetError::InvalidConfig("mock validation failure".to_string()))
        }
    }

    async fn reload(&self) -> Result<(), FleetError> {
        self.calls.record("balancer-reload".to_string());
        self.reloads.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn restart(&self) -> Result<(), FleetError> {
        self.calls.record("balancer-restart".to_string());
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.alive.store(true, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validation_wrapper_is_a_complete_config() {
        let text = validation_wrapper(Path::new("/etc/nginx/stream.d/relay-fleet.conf.staged"));
        assert!(text.starts_with("events {}"));
        assert!(text.contains("stream {"));
        assert!(text.contains("include /etc/nginx/stream.d/relay-fleet.conf.staged;"));
    }
}
