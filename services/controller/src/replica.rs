//! Replica lifecycle management.
//!
//! The replica manager owns every `ReplicaRuntimeStatus` and is the only
//! component that transitions replica state. Other components read status
//! snapshots and ask the manager to act.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::FleetError;
use crate::model::{ReplicaId, ReplicaRuntimeStatus, ReplicaSpec, ReplicaState};
use crate::runtime::ContainerRuntime;
use crate::store::Store;

/// Manages individual worker instances against the container runtime.
pub struct ReplicaManager {
    runtime: Arc<dyn ContainerRuntime>,
    store: Arc<Store>,
    statuses: RwLock<BTreeMap<ReplicaId, ReplicaRuntimeStatus>>,
    startup_grace: Duration,
    startup_probe_interval: Duration,
    stop_grace: Duration,
}

impl ReplicaManager {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, store: Arc<Store>, config: &Config) -> Self {
        Self {
            runtime,
            store,
            statuses: RwLock::new(BTreeMap::new()),
            startup_grace: config.startup_grace,
            startup_probe_interval: config.startup_probe_interval,
            stop_grace: config.stop_grace,
        }
    }

    /// Seed a status entry for a replica adopted from the store at startup.
    pub async fn adopt(&self, id: ReplicaId, status: ReplicaRuntimeStatus) {
        self.statuses.write().await.insert(id, status);
    }

    /// Create and start a worker for the given spec.
    ///
    /// The replica transitions `Planned → Starting`, then to `Running` once
    /// a first probe succeeds within the startup grace window. Probe
    /// failures inside the window are not counted as unhealthy.
    pub async fn create(&self, spec: &ReplicaSpec) -> Result<(), FleetError> {
        let id = spec.id;
        info!(replica_id = %id, local_port = spec.local_port, "creating replica");

        self.transition(spec, ReplicaState::Starting, None).await?;

        if let Err(e) = self.runtime.start(spec).await {
            warn!(replica_id = %id, error = %e, "replica start failed");
            self.transition(spec, ReplicaState::Stopped, Some(e.to_string()))
                .await?;
            return Err(e);
        }

        self.wait_ready(spec).await
    }

    /// Wait for the first successful probe within the startup grace window.
    async fn wait_ready(&self, spec: &ReplicaSpec) -> Result<(), FleetError> {
        let started = Instant::now();
        loop {
            if self.runtime.probe(spec).await {
                {
                    let mut statuses = self.statuses.write().await;
                    if let Some(status) = statuses.get_mut(&spec.id) {
                        status.state = ReplicaState::Running;
                        status.last_healthy_at = Some(Utc::now());
                        status.last_error = None;
                        self.persist(spec.id, status)?;
                    }
                }
                info!(replica_id = %spec.id, "replica running");
                return Ok(());
            }

            if started.elapsed() >= self.startup_grace {
                let err = FleetError::timeout(
                    format!("startup probe for replica {}", spec.id),
                    self.startup_grace,
                );
                warn!(replica_id = %spec.id, "replica did not become ready in grace window");
                // Best effort: do not leave a half-started container bound
                // to the port.
                if let Err(e) = self.runtime.stop(spec.id, self.stop_grace).await {
                    debug!(replica_id = %spec.id, error = %e, "cleanup stop failed");
                }
                self.transition(spec, ReplicaState::Stopped, Some(err.to_string()))
                    .await?;
                return Err(err);
            }

            tokio::time::sleep(self.startup_probe_interval).await;
        }
    }

    /// Stop a replica, waiting up to `grace` before the force kill.
    ///
    /// Always succeeds from the controller's point of view: the container
    /// may already be gone, which is the outcome we wanted anyway.
    pub async fn stop(&self, spec: &ReplicaSpec, grace: Duration) {
        let id = spec.id;
        info!(replica_id = %id, "stopping replica");
        let _ = self
            .transition(spec, ReplicaState::Stopping, None)
            .await
            .map_err(|e| warn!(replica_id = %id, error = %e, "persist failed"));

        if let Err(e) = self.runtime.stop(id, grace).await {
            warn!(replica_id = %id, error = %e, "stop reported an error, continuing");
        }
        if let Err(e) = self.runtime.remove(id).await {
            debug!(replica_id = %id, error = %e, "remove reported an error, continuing");
        }

        let _ = self
            .transition(spec, ReplicaState::Stopped, None)
            .await
            .map_err(|e| warn!(replica_id = %id, error = %e, "persist failed"));
    }

    /// Restart a replica, reusing its spec so the port and identity volume
    /// are preserved. Increments the restart counter.
    pub async fn restart(&self, spec: &ReplicaSpec) -> Result<(), FleetError> {
        let id = spec.id;
        info!(replica_id = %id, "restarting replica");

        {
            let mut statuses = self.statuses.write().await;
            if let Some(status) = statuses.get_mut(&id) {
                status.state = ReplicaState::Restarting;
                status.restart_count += 1;
                self.persist(id, status)?;
            }
        }

        if let Err(e) = self.runtime.stop(id, self.stop_grace).await {
            debug!(replica_id = %id, error = %e, "stop before restart failed, continuing");
        }
        if let Err(e) = self.runtime.remove(id).await {
            debug!(replica_id = %id, error = %e, "remove before restart failed, continuing");
        }

        if let Err(e) = self.runtime.start(spec).await {
            warn!(replica_id = %id, error = %e, "restart failed to start container");
            self.mark_unhealthy(id, e.to_string()).await;
            return Err(e);
        }

        match self.wait_ready_after_restart(spec).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.mark_unhealthy(id, e.to_string()).await;
                Err(e)
            }
        }
    }

    /// Readiness wait for restarts; unlike `wait_ready` the failure path
    /// leaves the replica `Unhealthy` so remediation accounting continues.
    async fn wait_ready_after_restart(&self, spec: &ReplicaSpec) -> Result<(), FleetError> {
        let started = Instant::now();
        loop {
            if self.runtime.probe(spec).await {
                let mut statuses = self.statuses.write().await;
                if let Some(status) = statuses.get_mut(&spec.id) {
                    status.state = ReplicaState::Running;
                    status.last_healthy_at = Some(Utc::now());
                    status.last_error = None;
                    self.persist(spec.id, status)?;
                }
                return Ok(());
            }
            if started.elapsed() >= self.startup_grace {
                return Err(FleetError::timeout(
                    format!("restart probe for replica {}", spec.id),
                    self.startup_grace,
                ));
            }
            tokio::time::sleep(self.startup_probe_interval).await;
        }
    }

    /// Pure read of one replica's status.
    pub async fn status(&self, id: ReplicaId) -> Option<ReplicaRuntimeStatus> {
        self.statuses.read().await.get(&id).cloned()
    }

    /// Snapshot of all statuses.
    pub async fn statuses(&self) -> BTreeMap<ReplicaId, ReplicaRuntimeStatus> {
        self.statuses.read().await.clone()
    }

    /// Mark a replica healthy after a successful probe.
    pub async fn mark_healthy(&self, id: ReplicaId) {
        let mut statuses = self.statuses.write().await;
        if let Some(status) = statuses.get_mut(&id) {
            if matches!(status.state, ReplicaState::Running | ReplicaState::Unhealthy) {
                status.state = ReplicaState::Healthy;
            }
            status.last_healthy_at = Some(Utc::now());
            status.last_error = None;
            let _ = self.persist(id, status);
        }
    }

    /// Mark a replica unhealthy (no remediation yet).
    pub async fn mark_unhealthy(&self, id: ReplicaId, error: String) {
        let mut statuses = self.statuses.write().await;
        if let Some(status) = statuses.get_mut(&id) {
            if status.state != ReplicaState::Failed {
                status.state = ReplicaState::Unhealthy;
            }
            status.last_error = Some(error);
            let _ = self.persist(id, status);
        }
    }

    /// Park a replica as terminally failed; it is reported but never
    /// auto-destroyed, preserving forensic evidence and the identity volume.
    pub async fn mark_failed(&self, id: ReplicaId, error: String) {
        let mut statuses = self.statuses.write().await;
        if let Some(status) = statuses.get_mut(&id) {
            status.state = ReplicaState::Failed;
            status.last_error = Some(error);
            let _ = self.persist(id, status);
        }
    }

    /// Drop a replica's status entry after its record is deleted.
    pub async fn forget(&self, id: ReplicaId) {
        self.statuses.write().await.remove(&id);
    }

    async fn transition(
        &self,
        spec: &ReplicaSpec,
        state: ReplicaState,
        error: Option<String>,
    ) -> Result<(), FleetError> {
        let mut statuses = self.statuses.write().await;
        let status = statuses.entry(spec.id).or_default();
        status.state = state;
        if error.is_some() {
            status.last_error = error;
        }
        self.store.upsert_replica(spec, status)
    }

    fn persist(&self, id: ReplicaId, status: &ReplicaRuntimeStatus) -> Result<(), FleetError> {
        self.store.set_replica_state(
            id,
            status.state,
            status.restart_count,
            status.last_error.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ReplicaLimits;
    use crate::runtime::MockRuntime;
    use std::path::PathBuf;

    fn harness() -> (Arc<MockRuntime>, ReplicaManager) {
        let runtime = Arc::new(MockRuntime::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let config = Config::for_tests(PathBuf::from("/tmp/unused"));
        let manager = ReplicaManager::new(
            Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
            store,
            &config,
        );
        (runtime, manager)
    }

    fn spec(id: u32) -> ReplicaSpec {
        ReplicaSpec {
            id: ReplicaId(id),
            local_port: 14000 + id as u16 - 1,
            limits: ReplicaLimits::default(),
        }
    }

    #[tokio::test]
    async fn test_create_reaches_running() {
        let (_runtime, manager) = harness();
        manager.create(&spec(1)).await.unwrap();

        let status = manager.status(ReplicaId(1)).await.unwrap();
        assert_eq!(status.state, ReplicaState::Running);
        assert!(status.last_healthy_at.is_some());
    }

    #[tokio::test]
    async fn test_create_times_out_when_never_ready() {
        let (runtime, manager) = harness();
        runtime.set_probe_ok(ReplicaId(1), false);

        let err = manager.create(&spec(1)).await.unwrap_err();
        assert!(matches!(err, FleetError::Timeout { .. }));

        let status = manager.status(ReplicaId(1)).await.unwrap();
        assert_eq!(status.state, ReplicaState::Stopped);
        // Half-started container was cleaned up.
        assert!(!runtime.is_running(ReplicaId(1)));
    }

    #[tokio::test]
    async fn test_stop_never_fails() {
        let (_runtime, manager) = harness();
        let s = spec(2);
        manager.create(&s).await.unwrap();
        manager.stop(&s, Duration::from_millis(10)).await;

        let status = manager.status(ReplicaId(2)).await.unwrap();
        assert_eq!(status.state, ReplicaState::Stopped);
    }

    #[tokio::test]
    async fn test_restart_increments_counter_and_preserves_spec() {
        let (runtime, manager) = harness();
        let s = spec(3);
        manager.create(&s).await.unwrap();

        manager.restart(&s).await.unwrap();
        let status = manager.status(ReplicaId(3)).await.unwrap();
        assert_eq!(status.state, ReplicaState::Running);
        assert_eq!(status.restart_count, 1);

        // Same container identity was started twice.
        assert_eq!(runtime.calls().count("start 3"), 2);
    }

    #[tokio::test]
    async fn test_mark_failed_is_sticky() {
        let (_runtime, manager) = harness();
        let s = spec(4);
        manager.create(&s).await.unwrap();

        manager.mark_failed(ReplicaId(4), "ceiling".to_string()).await;
        manager.mark_unhealthy(ReplicaId(4), "later".to_string()).await;

        let status = manager.status(ReplicaId(4)).await.unwrap();
        assert_eq!(status.state, ReplicaState::Failed);
    }
}
