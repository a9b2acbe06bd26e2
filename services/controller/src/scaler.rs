//! Scaling coordination: serialized scale up/down with zero-downtime ordering.
//!
//! Scale-up creates every new replica and waits for it to run before the
//! balancer config mentions it; scale-down drains removed replicas from the
//! balancer before any of them is stopped. Both directions hold the single
//! exclusive scaling lock for their whole duration.

use futures_util::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use fleet_events::{EventKind, EventSubject, Severity};
use fleet_reconcile::{next_replica_ids, scale_delta, select_for_removal, ScaleAction};

use crate::controller::Controller;
use crate::error::FleetError;
use crate::model::{ReplicaId, ReplicaSpec};

/// Result of a scaling operation.
///
/// A partially completed operation is a valid degraded state: nothing is
/// rolled back, `failure` carries the step error, and the already persisted
/// desired count lets a retry continue the diff from wherever it stalled.
#[derive(Debug, Clone, Serialize)]
pub struct ScaleOutcome {
    pub target: u32,
    pub achieved: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

impl ScaleOutcome {
    fn complete(target: u32) -> Self {
        Self {
            target,
            achieved: target,
            failure: None,
        }
    }

    fn partial(target: u32, achieved: u32, failure: &FleetError) -> Self {
        Self {
            target,
            achieved,
            failure: Some(failure.to_string()),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.failure.is_none() && self.achieved == self.target
    }
}

impl Controller {
    /// Reconcile the fleet toward `n` replicas.
    ///
    /// Validates the target, takes the scaling lock, computes the diff and
    /// executes it. Requesting the current count is an exact no-op: no
    /// events, no config re-apply.
    pub async fn set_desired_count(&self, n: u32) -> Result<ScaleOutcome, FleetError> {
        if n > self.config.max_replicas {
            return Err(FleetError::InvalidTarget {
                target: n,
                max: self.config.max_replicas,
            });
        }

        let _guard = self.scaling.lock().await;

        let current = {
            let mut core = self.core.write().await;
            core.desired_count = n;
            self.store.set_desired(n, &core.limits)?;
            core.specs.len() as u32
        };

        let outcome = match scale_delta(n, current) {
            ScaleAction::None => {
                info!(target = n, "fleet already at desired count");
                return Ok(ScaleOutcome::complete(n));
            }
            ScaleAction::Up(delta) => self.scale_up(n, current, delta).await,
            ScaleAction::Down(delta) => self.scale_down(n, current, delta).await,
        };

        let severity = if outcome.is_complete() {
            Severity::Info
        } else {
            Severity::Warning
        };
        self.record_event(
            EventSubject::Balancer,
            EventKind::ScaleCompleted,
            severity,
            format!("target {} achieved {}", outcome.target, outcome.achieved),
        );
        Ok(outcome)
    }

    /// Create `delta` replicas, then publish the new set to the balancer.
    ///
    /// Creation runs in bounded batches to avoid a startup thundering herd
    /// on a resource-constrained host; the balancer config is applied once,
    /// only after every new replica is running.
    async fn scale_up(&self, target: u32, current: u32, delta: u32) -> ScaleOutcome {
        info!(target, current, delta, "scaling up");

        let mut first_failure: Option<FleetError> = None;

        // Mint specs first: ids above the highest live id, ports from the
        // allocator, limits from the per-replica defaults.
        let mut new_specs: Vec<ReplicaSpec> = Vec::with_capacity(delta as usize);
        {
            let core = self.core.read().await;
            let ids = next_replica_ids(core.specs.keys().map(|id| id.0), delta);
            let mut ports = self.ports.lock().expect("allocator poisoned");
            for id in ids {
                match ports.allocate() {
                    Ok(port) => new_specs.push(ReplicaSpec {
                        id: ReplicaId(id),
                        local_port: port,
                        limits: core.limits,
                    }),
                    Err(e) => {
                        warn!(error = %e, "port allocation failed during scale-up");
                        if new_specs.is_empty() {
                            return ScaleOutcome::partial(target, current, &e);
                        }
                        // Continue with the replicas we could bind.
                        first_failure = Some(e);
                        break;
                    }
                }
            }
        }

        let mut created = 0u32;
        let mut attempted = 0usize;

        for batch in new_specs.chunks(self.config.create_concurrency.max(1)) {
            attempted += batch.len();
            let results = join_all(batch.iter().map(|spec| self.create_one(spec))).await;
            let mut batch_failed = false;
            for result in results {
                match result {
                    Ok(()) => created += 1,
                    Err(e) => {
                        batch_failed = true;
                        if first_failure.is_none() {
                            first_failure = Some(e);
                        }
                    }
                }
            }
            if batch_failed {
                break;
            }
        }

        // Hand back ports minted for replicas we never attempted; create_one
        // releases the ports of attempted failures itself.
        if attempted < new_specs.len() {
            let mut ports = self.ports.lock().expect("allocator poisoned");
            for spec in &new_specs[attempted..] {
                ports.release(spec.local_port);
            }
        }

        // Publish whatever is actually running. Even a partial scale-up
        // should serve from its new replicas.
        if created > 0 {
            if let Err(e) = self.render_and_apply(&[]).await {
                warn!(error = %e, "balancer apply failed after scale-up");
                if first_failure.is_none() {
                    first_failure = Some(e);
                }
            }
        }

        let achieved = current + created;
        match first_failure {
            None => ScaleOutcome::complete(target),
            Some(e) => ScaleOutcome::partial(target, achieved, &e),
        }
    }

    /// Create one replica and register it in the core spec set.
    ///
    /// On failure the spec is fully retracted (port released, records
    /// removed) so a retry of the scaling request re-attempts it cleanly.
    async fn create_one(&self, spec: &ReplicaSpec) -> Result<(), FleetError> {
        self.core
            .write()
            .await
            .specs
            .insert(spec.id, spec.clone());

        match self.manager.create(spec).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.core.write().await.specs.remove(&spec.id);
                self.manager.forget(spec.id).await;
                if let Err(se) = self.store.delete_replica(spec.id) {
                    warn!(replica_id = %spec.id, error = %se, "failed to delete replica record");
                }
                self.ports
                    .lock()
                    .expect("allocator poisoned")
                    .release(spec.local_port);
                Err(e)
            }
        }
    }

    /// Drain `delta` replicas from the balancer, then stop them.
    ///
    /// Removal fills from the top: the highest ids go first so long-lived
    /// low ids keep their externally tracked identity. The reduced config
    /// is applied before any stop so no connection is routed to a replica
    /// that has begun shutting down.
    async fn scale_down(&self, target: u32, current: u32, delta: u32) -> ScaleOutcome {
        info!(target, current, delta, "scaling down");

        let removed: Vec<ReplicaId> = {
            let core = self.core.read().await;
            select_for_removal(core.specs.keys().map(|id| id.0), delta)
                .into_iter()
                .map(ReplicaId)
                .collect()
        };

        // Drain first: publish the reduced set while the removed replicas
        // are still running, so in-flight traffic finishes cleanly.
        if let Err(e) = self.render_and_apply(&removed).await {
            warn!(error = %e, "balancer apply failed, aborting scale-down before any stop");
            return ScaleOutcome::partial(target, current, &e);
        }

        let mut stopped = 0u32;
        for id in &removed {
            let Some(spec) = self.spec(*id).await else {
                continue;
            };
            self.manager.stop(&spec, self.config.stop_grace).await;

            self.core.write().await.specs.remove(id);
            self.manager.forget(*id).await;
            if let Err(e) = self.store.delete_replica(*id) {
                warn!(replica_id = %id, error = %e, "failed to delete replica record");
                return ScaleOutcome::partial(target, current - stopped, &e);
            }
            self.ports
                .lock()
                .expect("allocator poisoned")
                .release(spec.local_port);
            stopped += 1;
        }

        ScaleOutcome::complete(target)
    }
}
