//! Controller facade: owns cluster state and wires the components together.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Utc};
use fleet_events::{EventKind, EventLog, EventSubject, HealthEvent, Severity};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::balancer::{BalancerManager, BalancerProcess, RenderSettings};
use crate::config::Config;
use crate::error::FleetError;
use crate::model::{
    ClusterState, ReplicaEntry, ReplicaId, ReplicaLimits, ReplicaRuntimeStatus, ReplicaSpec,
};
use crate::ports::PortAllocator;
use crate::replica::ReplicaManager;
use crate::runtime::ContainerRuntime;
use crate::store::Store;

/// Persisted core of the fleet state: specs, targets, generation.
///
/// Replica runtime status lives in the replica manager; views combine both.
pub(crate) struct Core {
    pub desired_count: u32,
    pub limits: ReplicaLimits,
    pub specs: BTreeMap<ReplicaId, ReplicaSpec>,
    pub balancer_generation: u64,
}

/// The fleet controller.
///
/// All state mutation flows through the scaling lock: scale operations,
/// health remediation, and watchdog recovery serialize on it. Reads
/// (status snapshots, probes) never take it.
pub struct Controller {
    pub(crate) config: Config,
    pub(crate) core: RwLock<Core>,
    pub(crate) runtime: Arc<dyn ContainerRuntime>,
    pub(crate) store: Arc<Store>,
    pub(crate) ports: StdMutex<PortAllocator>,
    pub(crate) manager: ReplicaManager,
    pub(crate) balancer: BalancerManager,
    pub(crate) events: Arc<EventLog>,
    /// Exclusive scaling lock; see module docs.
    pub(crate) scaling: Mutex<()>,
}

impl Controller {
    /// Build a controller over the given runtime, balancer process and store.
    pub fn new(
        config: Config,
        runtime: Arc<dyn ContainerRuntime>,
        balancer_process: Arc<dyn BalancerProcess>,
        store: Arc<Store>,
    ) -> Self {
        let balancer = BalancerManager::new(
            balancer_process,
            RenderSettings {
                tcp_port: config.balancer_tcp_port,
                udp_port: config.balancer_udp_port,
                max_fails: config.balancer_max_fails,
                fail_timeout_secs: config.balancer_fail_timeout.as_secs(),
            },
            config.balancer_staging_path.clone(),
            config.balancer_live_path.clone(),
        );

        let manager = ReplicaManager::new(Arc::clone(&runtime), Arc::clone(&store), &config);

        Self {
            runtime,
            core: RwLock::new(Core {
                desired_count: 0,
                limits: config.replica_limits,
                specs: BTreeMap::new(),
                balancer_generation: 0,
            }),
            ports: StdMutex::new(PortAllocator::new(config.port_base, config.port_capacity)),
            manager,
            balancer,
            events: Arc::new(EventLog::new()),
            store,
            scaling: Mutex::new(()),
            config,
        }
    }

    /// Reconstruct state from the store after a controller restart.
    ///
    /// Specs, desired count and the generation counter come from disk; the
    /// port allocator is rebuilt by scanning the specs. Liveness is still
    /// re-probed: adopted replicas whose containers are gone are marked
    /// unhealthy and left to the normal remediation path.
    pub async fn recover(&self) -> Result<(), FleetError> {
        let persisted = self.store.load()?;

        {
            let mut ports = self.ports.lock().expect("allocator poisoned");
            *ports = PortAllocator::rebuild(
                self.config.port_base,
                self.config.port_capacity,
                persisted.replicas.values().map(|e| e.spec.local_port),
            );
        }

        let mut core = self.core.write().await;
        core.desired_count = persisted.desired_count;
        core.limits = persisted.per_replica_limits;
        core.balancer_generation = persisted.balancer_generation;

        let daemon_alive = self.runtime.daemon_alive().await;
        for entry in persisted.replicas.into_values() {
            let id = entry.spec.id;
            let mut status = entry.status;

            if status.state.is_live() {
                let running = if daemon_alive {
                    self.runtime
                        .inspect(id)
                        .await
                        .map(|s| s.running)
                        .unwrap_or(false)
                } else {
                    false
                };
                if !running {
                    warn!(replica_id = %id, "adopted replica container not running");
                    status.state = crate::model::ReplicaState::Unhealthy;
                    status.last_error =
                        Some("container not running after controller restart".to_string());
                    self.store.set_replica_state(
                        id,
                        status.state,
                        status.restart_count,
                        status.last_error.as_deref(),
                    )?;
                }
            }

            core.specs.insert(id, entry.spec);
            self.manager.adopt(id, status).await;
        }

        self.balancer.adopt_live_config();
        info!(
            desired_count = core.desired_count,
            replicas = core.specs.len(),
            generation = core.balancer_generation,
            "cluster state recovered"
        );
        Ok(())
    }

    /// Assemble the externally visible cluster state.
    pub async fn get_cluster_state(&self) -> ClusterState {
        let core = self.core.read().await;
        let statuses = self.manager.statuses().await;

        let replicas = core
            .specs
            .iter()
            .map(|(id, spec)| {
                let status = statuses.get(id).cloned().unwrap_or_default();
                (*id, ReplicaEntry {
                    spec: spec.clone(),
                    status,
                })
            })
            .collect();

        ClusterState {
            desired_count: core.desired_count,
            per_replica_limits: core.limits,
            replicas,
            balancer_generation: core.balancer_generation,
        }
    }

    /// Health events newer than `since` (all retained events if `None`).
    pub fn get_health_events(&self, since: Option<DateTime<Utc>>) -> Vec<HealthEvent> {
        match since {
            Some(ts) => self.events.since(ts),
            None => self.events.all(),
        }
    }

    /// Serving replica specs, optionally excluding a set of ids.
    pub(crate) async fn serving_specs(&self, exclude: &[ReplicaId]) -> Vec<ReplicaSpec> {
        let core = self.core.read().await;
        let statuses = self.manager.statuses().await;
        core.specs
            .iter()
            .filter(|(id, _)| !exclude.contains(id))
            .filter(|(id, _)| {
                statuses
                    .get(id)
                    .map(|s| s.state.is_serving())
                    .unwrap_or(false)
            })
            .map(|(_, spec)| spec.clone())
            .collect()
    }

    /// Render the config for the serving set minus `exclude` and apply it.
    ///
    /// Bumps and persists the balancer generation when a new configuration
    /// actually went live. Must be called with the scaling lock held.
    pub(crate) async fn render_and_apply(
        &self,
        exclude: &[ReplicaId],
    ) -> Result<bool, FleetError> {
        let specs = self.serving_specs(exclude).await;
        let refs: Vec<&ReplicaSpec> = specs.iter().collect();
        let text = self.balancer.render(&refs);

        let applied = self.balancer.apply(&text).await?;
        if applied {
            self.bump_generation().await?;
            self.record_event(
                EventSubject::Balancer,
                EventKind::ConfigApplied,
                Severity::Info,
                format!("{} upstream entries", specs.len()),
            );
        }
        Ok(applied)
    }

    pub(crate) async fn bump_generation(&self) -> Result<(), FleetError> {
        let mut core = self.core.write().await;
        core.balancer_generation += 1;
        self.store.set_balancer_generation(core.balancer_generation)
    }

    /// Manual, synchronous balancer reload from current state.
    pub async fn trigger_balancer_reload(&self) -> Result<bool, FleetError> {
        let _guard = self.scaling.lock().await;
        self.render_and_apply(&[]).await
    }

    pub(crate) fn record_event(
        &self,
        subject: EventSubject,
        kind: EventKind,
        severity: Severity,
        detail: impl Into<String>,
    ) {
        self.events
            .record(HealthEvent::now(subject, kind, severity, detail));
    }

    /// Lookup a replica spec by id.
    pub(crate) async fn spec(&self, id: ReplicaId) -> Option<ReplicaSpec> {
        self.core.read().await.specs.get(&id).cloned()
    }

    /// Pure read of one replica's runtime status.
    pub async fn replica_status(&self, id: ReplicaId) -> Option<ReplicaRuntimeStatus> {
        self.manager.status(id).await
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    pub fn balancer(&self) -> &BalancerManager {
        &self.balancer
    }
}
