//! Fleet data model: replica specs, runtime status, and cluster state.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable replica identifier.
///
/// Dense small integers starting at 1. Worker identity (and any durable
/// state the worker owns, such as its node keys) is bound to this id via a
/// per-id data volume, never to a particular container instance.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct ReplicaId(pub u32);

impl std::fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource limits applied to each new replica.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReplicaLimits {
    /// CPU cores granted to the container.
    pub cpu_limit: f64,
    /// Memory cap in bytes.
    pub mem_limit_bytes: i64,
    /// Maximum concurrent clients the worker accepts.
    pub max_clients: u32,
    /// Bandwidth cap in Mbps the worker enforces.
    pub bandwidth_cap_mbps: f64,
}

impl Default for ReplicaLimits {
    fn default() -> Self {
        Self {
            cpu_limit: 1.0,
            mem_limit_bytes: 512 * 1024 * 1024,
            max_clients: 50,
            bandwidth_cap_mbps: 40.0,
        }
    }
}

/// Identity and resource contract for one replica.
///
/// Immutable once the replica is created; changing any field requires
/// destroy-and-recreate under a new id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicaSpec {
    pub id: ReplicaId,
    /// Unique local port the worker binds, drawn from the allocator's range.
    pub local_port: u16,
    #[serde(flatten)]
    pub limits: ReplicaLimits,
}

impl ReplicaSpec {
    /// Container name for this replica.
    pub fn container_name(&self, prefix: &str) -> String {
        format!("{}-{}", prefix, self.id)
    }

    /// Durable volume name for this replica's identity and keys.
    pub fn volume_name(&self, prefix: &str) -> String {
        format!("{}-data-{}", prefix, self.id)
    }
}

/// Replica lifecycle state.
///
/// ```text
/// Planned → Starting → Running → {Healthy ⇄ Unhealthy} → Stopping → Stopped
///                                      Unhealthy → Restarting → Running
/// ```
///
/// `Failed` is terminal: the replica is reported but never auto-destroyed,
/// preserving forensic evidence and the identity volume.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplicaState {
    Planned,
    Starting,
    Running,
    Healthy,
    Unhealthy,
    Restarting,
    Stopping,
    Stopped,
    Failed,
}

impl ReplicaState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planned => "planned",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Restarting => "restarting",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planned" => Some(Self::Planned),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "healthy" => Some(Self::Healthy),
            "unhealthy" => Some(Self::Unhealthy),
            "restarting" => Some(Self::Restarting),
            "stopping" => Some(Self::Stopping),
            "stopped" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    /// Whether traffic may be routed to a replica in this state.
    ///
    /// `Unhealthy` stays in rotation: the balancer's own failure threshold
    /// gives fast failover while the monitor decides on a restart.
    pub fn is_serving(&self) -> bool {
        matches!(self, Self::Running | Self::Healthy | Self::Unhealthy)
    }

    /// Whether the replica counts toward the running fleet.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Healthy | Self::Unhealthy | Self::Restarting
        )
    }
}

impl std::fmt::Display for ReplicaState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Mutable runtime status, owned exclusively by the replica manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaRuntimeStatus {
    pub state: ReplicaState,
    /// Monotonic restart counter, reset only on fleet reset.
    pub restart_count: u32,
    pub last_healthy_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ReplicaRuntimeStatus {
    pub fn new() -> Self {
        Self {
            state: ReplicaState::Planned,
            restart_count: 0,
            last_healthy_at: None,
            last_error: None,
        }
    }
}

impl Default for ReplicaRuntimeStatus {
    fn default() -> Self {
        Self::new()
    }
}

/// One replica's spec plus its last persisted status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaEntry {
    pub spec: ReplicaSpec,
    pub status: ReplicaRuntimeStatus,
}

/// The single source of truth for the fleet.
///
/// `|replicas| == desired_count` except while a scaling operation is in
/// flight; equality is restored before the operation reports success.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterState {
    pub desired_count: u32,
    pub per_replica_limits: ReplicaLimits,
    pub replicas: BTreeMap<ReplicaId, ReplicaEntry>,
    /// Bumped on every successful balancer config apply.
    pub balancer_generation: u64,
}

impl ClusterState {
    pub fn new(limits: ReplicaLimits) -> Self {
        Self {
            desired_count: 0,
            per_replica_limits: limits,
            replicas: BTreeMap::new(),
            balancer_generation: 0,
        }
    }

    /// Ids of replicas that currently hold their id (any non-deleted record).
    pub fn live_ids(&self) -> impl Iterator<Item = u32> + '_ {
        self.replicas.keys().map(|id| id.0)
    }

    /// Replicas eligible for balancer upstream entries.
    pub fn serving(&self) -> Vec<&ReplicaSpec> {
        self.replicas
            .values()
            .filter(|e| e.status.state.is_serving())
            .map(|e| &e.spec)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: u32, port: u16) -> ReplicaSpec {
        ReplicaSpec {
            id: ReplicaId(id),
            local_port: port,
            limits: ReplicaLimits::default(),
        }
    }

    #[test]
    fn test_replica_state_roundtrip() {
        for state in [
            ReplicaState::Planned,
            ReplicaState::Starting,
            ReplicaState::Running,
            ReplicaState::Healthy,
            ReplicaState::Unhealthy,
            ReplicaState::Restarting,
            ReplicaState::Stopping,
            ReplicaState::Stopped,
            ReplicaState::Failed,
        ] {
            assert_eq!(ReplicaState::parse(state.as_str()), Some(state));
        }
        assert_eq!(ReplicaState::parse("bogus"), None);
    }

    #[test]
    fn test_serving_excludes_failed_and_stopping() {
        assert!(ReplicaState::Healthy.is_serving());
        assert!(ReplicaState::Unhealthy.is_serving());
        assert!(!ReplicaState::Stopping.is_serving());
        assert!(!ReplicaState::Stopped.is_serving());
        assert!(!ReplicaState::Failed.is_serving());
        assert!(!ReplicaState::Starting.is_serving());
    }

    #[test]
    fn test_cluster_state_serving_filter() {
        let mut state = ClusterState::new(ReplicaLimits::default());
        for (id, st) in [
            (1, ReplicaState::Healthy),
            (2, ReplicaState::Failed),
            (3, ReplicaState::Running),
        ] {
            let mut status = ReplicaRuntimeStatus::new();
            status.state = st;
            state.replicas.insert(
                ReplicaId(id),
                ReplicaEntry {
                    spec: spec(id, 14000 + id as u16),
                    status,
                },
            );
        }

        let serving = state.serving();
        assert_eq!(serving.len(), 2);
        assert_eq!(serving[0].id, ReplicaId(1));
        assert_eq!(serving[1].id, ReplicaId(3));
    }

    #[test]
    fn test_container_and_volume_names() {
        let s = spec(4, 14003);
        assert_eq!(s.container_name("relay"), "relay-4");
        assert_eq!(s.volume_name("relay"), "relay-data-4");
    }
}
