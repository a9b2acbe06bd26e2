//! Periodic health monitoring with bounded, idempotent remediation.
//!
//! One pass covers the host level first (is the container runtime daemon
//! reachable?) and then every replica. Remediation actions go through the
//! scaling lock; a pass that cannot take the lock skips remediation and
//! tries again next interval rather than queueing work.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleet_events::{EventKind, EventSubject, Severity};
use fleet_reconcile::RestartTracker;

use crate::controller::Controller;
use crate::model::{ReplicaSpec, ReplicaState};

/// How many consecutive probe failures trigger a restart.
const PROBE_FAILURE_THRESHOLD: u32 = 2;

/// How many consecutive passes above the memory threshold count as
/// "sustained" usage worth a warning event.
const MEMORY_SUSTAIN_PASSES: u32 = 2;

/// Periodic health monitor over all replicas and the runtime daemon.
pub struct HealthMonitor {
    controller: Arc<Controller>,
    consecutive_failures: StdMutex<HashMap<u32, u32>>,
    memory_high_passes: StdMutex<HashMap<u32, u32>>,
    restarts: StdMutex<RestartTracker>,
}

impl HealthMonitor {
    pub fn new(controller: Arc<Controller>) -> Self {
        let ceiling = controller.config.restart_ceiling;
        let window = controller.config.restart_window;
        Self {
            controller,
            consecutive_failures: StdMutex::new(HashMap::new()),
            memory_high_passes: StdMutex::new(HashMap::new()),
            restarts: StdMutex::new(RestartTracker::new(ceiling, window)),
        }
    }

    /// Run the monitor loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.controller.config.health_interval;
        info!(interval_secs = interval.as_secs(), "starting health monitor");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        // The immediate first tick would race startup; consume it.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("health monitor shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One full monitoring pass. Also invoked synchronously by the API.
    pub async fn run_pass(&self) {
        debug!("starting health pass");

        // Host-level pass takes priority: a dead runtime invalidates every
        // replica's status, so it is one incident, not N probe failures.
        if !self.controller.runtime.daemon_alive().await {
            self.controller.record_event(
                EventSubject::Runtime,
                EventKind::RuntimeUnavailable,
                Severity::Critical,
                "container runtime daemon unreachable",
            );

            match self.controller.runtime.restart_daemon().await {
                Ok(()) => {
                    self.controller.record_event(
                        EventSubject::Runtime,
                        EventKind::RuntimeRestarted,
                        Severity::Warning,
                        "container runtime daemon restarted",
                    );
                }
                Err(e) => {
                    warn!(error = %e, "runtime daemon restart failed, skipping replica checks");
                    return;
                }
            }
        }

        let state = self.controller.get_cluster_state().await;
        for entry in state.replicas.values() {
            if !entry.status.state.is_serving() {
                continue;
            }
            self.check_replica(&entry.spec).await;
        }

        self.restarts.lock().expect("tracker poisoned").prune();
    }

    async fn check_replica(&self, spec: &ReplicaSpec) {
        let id = spec.id;

        let stats = match self.controller.runtime.inspect(id).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                debug!(replica_id = %id, error = %e, "inspect failed");
                None
            }
        };

        // OOM is unambiguous: restart immediately, no second strike needed.
        if stats.map(|s| s.oom_killed).unwrap_or(false) {
            self.controller.record_event(
                EventSubject::Replica(id.0),
                EventKind::OomKilled,
                Severity::Warning,
                "out-of-memory kill detected",
            );
            self.remediate(spec).await;
            return;
        }

        if self.controller.runtime.probe(spec).await {
            self.consecutive_failures
                .lock()
                .expect("failures poisoned")
                .remove(&id.0);
            self.controller.manager.mark_healthy(id).await;
        } else {
            let failures = {
                let mut map = self.consecutive_failures.lock().expect("failures poisoned");
                let count = map.entry(id.0).or_insert(0);
                *count += 1;
                *count
            };

            self.controller.record_event(
                EventSubject::Replica(id.0),
                EventKind::ProbeFailed,
                Severity::Info,
                format!("consecutive failures: {failures}"),
            );

            if failures < PROBE_FAILURE_THRESHOLD {
                // One failure marks the replica unhealthy but takes no
                // action yet, to avoid flapping on transient blips.
                self.controller
                    .manager
                    .mark_unhealthy(id, format!("probe failed ({failures})"))
                    .await;
            } else {
                self.remediate(spec).await;
            }
        }

        // Memory pressure is host-level and not per-replica remediable;
        // sustained usage only warrants a warning event.
        if let Some(stats) = stats {
            let threshold = self.controller.config.memory_warn_percent;
            let mut map = self.memory_high_passes.lock().expect("memory poisoned");
            if stats.memory_percent > threshold {
                let passes = map.entry(id.0).or_insert(0);
                *passes += 1;
                if *passes >= MEMORY_SUSTAIN_PASSES {
                    self.controller.record_event(
                        EventSubject::Replica(id.0),
                        EventKind::MemoryHigh,
                        Severity::Warning,
                        format!("memory at {:.1}% for {} passes", stats.memory_percent, passes),
                    );
                }
            } else {
                map.remove(&id.0);
            }
        }
    }

    /// Restart a replica under the scaling lock, bounded by the rolling
    /// restart window. Skipped (and retried next pass) if a scaling
    /// operation holds the lock.
    async fn remediate(&self, spec: &ReplicaSpec) {
        let id = spec.id;

        let Ok(_guard) = self.controller.scaling.try_lock() else {
            debug!(replica_id = %id, "scaling lock busy, deferring remediation");
            return;
        };

        // The replica may have been removed or parked while we waited.
        let Some(status) = self.controller.manager.status(id).await else {
            return;
        };
        if status.state == ReplicaState::Failed {
            return;
        }

        let exhausted = self.restarts.lock().expect("tracker poisoned").record(id.0);
        if exhausted {
            warn!(replica_id = %id, "restart ceiling exceeded, parking replica");
            self.controller
                .manager
                .mark_failed(id, "restart ceiling exceeded".to_string())
                .await;
            self.controller.record_event(
                EventSubject::Replica(id.0),
                EventKind::RestartCeilingReached,
                Severity::Critical,
                "auto-restart disabled, operator intervention required",
            );
            // The parked replica must also leave the balancer rotation.
            if let Err(e) = self.controller.render_and_apply(&[]).await {
                warn!(error = %e, "balancer apply failed after parking replica");
            }
            return;
        }

        match self.controller.manager.restart(spec).await {
            Ok(()) => {
                self.consecutive_failures
                    .lock()
                    .expect("failures poisoned")
                    .remove(&id.0);
                self.controller.record_event(
                    EventSubject::Replica(id.0),
                    EventKind::Restarted,
                    Severity::Warning,
                    "restarted after failed probes",
                );
            }
            Err(e) => {
                warn!(replica_id = %id, error = %e, "remediation restart failed");
            }
        }
    }
}
