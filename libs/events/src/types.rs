//! Health event types emitted by the controller's monitoring loops.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// What a health event is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "subject", content = "id")]
pub enum EventSubject {
    /// A single replica, by its stable id.
    Replica(u32),
    /// The load balancer process.
    Balancer,
    /// The container runtime daemon.
    Runtime,
}

impl std::fmt::Display for EventSubject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EventSubject::Replica(id) => write!(f, "replica-{}", id),
            EventSubject::Balancer => write!(f, "balancer"),
            EventSubject::Runtime => write!(f, "runtime"),
        }
    }
}

/// Kind of health event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A reachability probe failed.
    ProbeFailed,
    /// A replica was restarted by remediation.
    Restarted,
    /// A replica crossed the restart ceiling and was marked failed.
    RestartCeilingReached,
    /// Memory usage stayed above the warning threshold.
    MemoryHigh,
    /// The runtime reported an out-of-memory kill.
    OomKilled,
    /// The balancer process was found dead.
    BalancerDown,
    /// The balancer process was restarted.
    BalancerRestarted,
    /// A balancer configuration was validated and applied.
    ConfigApplied,
    /// The container runtime daemon was unreachable.
    RuntimeUnavailable,
    /// The container runtime daemon was restarted.
    RuntimeRestarted,
    /// A scaling operation finished (possibly partially).
    ScaleCompleted,
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            EventKind::ProbeFailed => "probe_failed",
            EventKind::Restarted => "restarted",
            EventKind::RestartCeilingReached => "restart_ceiling_reached",
            EventKind::MemoryHigh => "memory_high",
            EventKind::OomKilled => "oom_killed",
            EventKind::BalancerDown => "balancer_down",
            EventKind::BalancerRestarted => "balancer_restarted",
            EventKind::ConfigApplied => "config_applied",
            EventKind::RuntimeUnavailable => "runtime_unavailable",
            EventKind::RuntimeRestarted => "runtime_restarted",
            EventKind::ScaleCompleted => "scale_completed",
        };
        write!(f, "{}", s)
    }
}

/// Event severity, for the notification collaborator to filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

/// An immutable health event record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthEvent {
    #[serde(flatten)]
    pub subject: EventSubject,
    pub kind: EventKind,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub detail: String,
}

impl HealthEvent {
    /// Create an event stamped with the current time.
    pub fn now(
        subject: EventSubject,
        kind: EventKind,
        severity: Severity,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            subject,
            kind,
            severity,
            timestamp: Utc::now(),
            detail: detail.into(),
        }
    }
}
