//! Container runtime interface and mock implementation.
//!
//! The runtime interface abstracts worker lifecycle operations:
//! - Starting/stopping relay containers with resource caps
//! - Inspection (running flag, OOM kills, resource usage)
//! - Reachability probes on the replica's local port
//! - Daemon-level liveness and recovery
//!
//! A mock implementation is provided for testing; the Docker CLI
//! implementation lives in [`crate::docker`].

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::error::FleetError;
use crate::model::{ReplicaId, ReplicaSpec};

/// Bound a child-process invocation, mapping expiry to a `Timeout` error.
///
/// Every external process the controller drives goes through this: a hung
/// binary must surface as a step failure, never hold a lock indefinitely.
pub(crate) async fn bounded<T>(
    operation: &str,
    limit: Duration,
    fut: impl Future<Output = Result<T, FleetError>>,
) -> Result<T, FleetError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(FleetError::timeout(operation, limit)),
    }
}

/// Point-in-time view of one replica's container.
#[derive(Debug, Clone, Copy, Default)]
pub struct ContainerStats {
    pub running: bool,
    /// The kernel OOM-killed the container since it last started.
    pub oom_killed: bool,
    /// Memory usage as a percentage of the container's limit.
    pub memory_percent: f64,
    pub cpu_percent: f64,
}

/// Container runtime interface.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Start a worker container for the given spec.
    async fn start(&self, spec: &ReplicaSpec) -> Result<(), FleetError>;

    /// Gracefully stop a worker, force-killing after `grace`.
    async fn stop(&self, id: ReplicaId, grace: Duration) -> Result<(), FleetError>;

    /// Remove a stopped worker container (the identity volume is kept).
    async fn remove(&self, id: ReplicaId) -> Result<(), FleetError>;

    /// Inspect a worker container.
    async fn inspect(&self, id: ReplicaId) -> Result<ContainerStats, FleetError>;

    /// Probe worker reachability on its local port.
    async fn probe(&self, spec: &ReplicaSpec) -> bool;

    /// Whether the runtime daemon itself is reachable.
    async fn daemon_alive(&self) -> bool;

    /// Restart the runtime daemon.
    async fn restart_daemon(&self) -> Result<(), FleetError>;
}

/// Shared, ordered record of side-effecting calls.
///
/// Used by tests to assert ordering properties (for example that the
/// balancer config is re-applied before any removed replica is stopped).
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        self.entries.lock().expect("call log poisoned").push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries.lock().expect("call log poisoned").clone()
    }

    /// Index of the first entry equal to `needle`, if any.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.entries().iter().position(|e| e == needle)
    }

    /// Number of entries equal to `needle`.
    pub fn count(&self, needle: &str) -> usize {
        self.entries().iter().filter(|e| *e == needle).count()
    }
}

/// Mock runtime for testing and development.
pub struct MockRuntime {
    calls: CallLog,
    running: Mutex<HashSet<u32>>,
    probe_ok: Mutex<HashMap<u32, bool>>,
    oom_killed: Mutex<HashSet<u32>>,
    memory_percent: Mutex<HashMap<u32, f64>>,
    daemon_ok: AtomicBool,
    /// Fail `start` once this many starts have succeeded.
    fail_starts_after: Mutex<Option<usize>>,
    starts_seen: Mutex<usize>,
}

impl MockRuntime {
    pub fn new() -> Self {
        Self::with_log(CallLog::new())
    }

    /// Create a mock runtime sharing an external call log.
    pub fn with_log(calls: CallLog) -> Self {
        Self {
            calls,
            running: Mutex::new(HashSet::new()),
            probe_ok: Mutex::new(HashMap::new()),
            oom_killed: Mutex::new(HashSet::new()),
            memory_percent: Mutex::new(HashMap::new()),
            daemon_ok: AtomicBool::new(true),
            fail_starts_after: Mutex::new(None),
            starts_seen: Mutex::new(0),
        }
    }

    pub fn calls(&self) -> &CallLog {
        &self.calls
    }

    /// Script the probe outcome for one replica.
    pub fn set_probe_ok(&self, id: ReplicaId, ok: bool) {
        self.probe_ok.lock().unwrap().insert(id.0, ok);
    }

    /// Script an OOM kill; cleared when the replica is next started.
    pub fn set_oom_killed(&self, id: ReplicaId) {
        self.oom_killed.lock().unwrap().insert(id.0);
    }

    /// Script the reported memory usage for one replica.
    pub fn set_memory_percent(&self, id: ReplicaId, percent: f64) {
        self.memory_percent.lock().unwrap().insert(id.0, percent);
    }

    /// Script daemon liveness.
    pub fn set_daemon_alive(&self, alive: bool) {
        self.daemon_ok.store(alive, Ordering::SeqCst);
    }

    /// Make `start` fail after `n` further successful starts.
    pub fn fail_starts_after(&self, n: usize) {
        *self.fail_starts_after.lock().unwrap() = Some(n);
    }

    /// Let `start` succeed again after [`Self::fail_starts_after`].
    pub fn clear_start_failures(&self) {
        *self.fail_starts_after.lock().unwrap() = None;
    }

    /// Whether the mock currently considers a replica's container running.
    pub fn is_running(&self, id: ReplicaId) -> bool {
        self.running.lock().unwrap().contains(&id.0)
    }
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    async fn start(&self, spec: &ReplicaSpec) -> Result<(), FleetError> {
        {
            let mut seen = self.starts_seen.lock().unwrap();
            if let Some(limit) = *self.fail_starts_after.lock().unwrap() {
                if *seen >= limit {
                    return Err(FleetError::Runtime("mock start failure".to_string()));
                }
            }
            *seen += 1;
        }

        self.calls.record(format!("start {}", spec.id));
        self.running.lock().unwrap().insert(spec.id.0);
        self.oom_killed.lock().unwrap().remove(&spec.id.0);
        Ok(())
    }

    async fn stop(&self, id: ReplicaId, _grace: Duration) -> Result<(), FleetError> {
        self.calls.record(format!("stop {}", id));
        self.running.lock().unwrap().remove(&id.0);
        Ok(())
    }

    async fn remove(&self, id: ReplicaId) -> Result<(), FleetError> {
        self.calls.record(format!("remove {}", id));
        Ok(())
    }

    async fn inspect(&self, id: ReplicaId) -> Result<ContainerStats, FleetError> {
        Ok(ContainerStats {
            running: self.running.lock().unwrap().contains(&id.0),
            oom_killed: self.oom_killed.lock().unwrap().contains(&id.0),
            memory_percent: self
                .memory_percent
                .lock()
                .unwrap()
                .get(&id.0)
                .copied()
                .unwrap_or(10.0),
            cpu_percent: 5.0,
        })
    }

    async fn probe(&self, spec: &ReplicaSpec) -> bool {
        self.probe_ok
            .lock()
            .unwrap()
            .get(&spec.id.0)
            .copied()
            .unwrap_or(true)
    }

    async fn daemon_alive(&self) -> bool {
        self.daemon_ok.load(Ordering::SeqCst)
    }

    async fn restart_daemon(&self) -> Result<(), FleetError> {
        self.calls.record("restart-daemon".to_string());
        self.daemon_ok.store(true, Ordering::SeqCst);
        Ok(())
    }
}
