mod harness;

use std::sync::Arc;

use harness::{fleet, fleet_with, live_config};

use fleet_controller::health::HealthMonitor;
use fleet_controller::watchdog::Watchdog;
use fleet_controller::{ReplicaId, ReplicaState};
use fleet_events::EventKind;

fn event_count(f: &harness::Fleet, kind: EventKind) -> usize {
    f.controller
        .get_health_events(None)
        .iter()
        .filter(|e| e.kind == kind)
        .count()
}

#[tokio::test]
async fn two_consecutive_probe_failures_trigger_exactly_one_restart() {
    let f = fleet();
    f.controller.set_desired_count(4).await.unwrap();
    let monitor = HealthMonitor::new(Arc::clone(&f.controller));

    f.runtime.set_probe_ok(ReplicaId(3), false);

    // First failure: unhealthy, no action yet.
    monitor.run_pass().await;
    assert_eq!(f.log.count("start 3"), 1);
    let status = f.controller.replica_status(ReplicaId(3)).await.unwrap();
    assert_eq!(status.state, ReplicaState::Unhealthy);

    // Second failure: one restart.
    monitor.run_pass().await;
    assert_eq!(f.log.count("start 3"), 2);
    let status = f.controller.replica_status(ReplicaId(3)).await.unwrap();
    assert_eq!(status.restart_count, 1);

    // Worker comes back; the next pass heals it without another restart.
    f.runtime.set_probe_ok(ReplicaId(3), true);
    monitor.run_pass().await;
    assert_eq!(f.log.count("start 3"), 2);
    let status = f.controller.replica_status(ReplicaId(3)).await.unwrap();
    assert_eq!(status.state, ReplicaState::Healthy);

    // The healthy neighbours were never touched.
    assert_eq!(f.log.count("start 1"), 1);
    assert_eq!(event_count(&f, EventKind::ProbeFailed), 2);
}

#[tokio::test]
async fn oom_kill_restarts_immediately() {
    let f = fleet();
    f.controller.set_desired_count(2).await.unwrap();
    let monitor = HealthMonitor::new(Arc::clone(&f.controller));

    f.runtime.set_oom_killed(ReplicaId(1));
    monitor.run_pass().await;

    // No two-strikes rule for OOM; one pass, one restart.
    assert_eq!(f.log.count("start 1"), 2);
    let status = f.controller.replica_status(ReplicaId(1)).await.unwrap();
    assert_eq!(status.state, ReplicaState::Running);
    assert_eq!(status.restart_count, 1);
    assert_eq!(event_count(&f, EventKind::OomKilled), 1);
    assert_eq!(event_count(&f, EventKind::Restarted), 1);
}

#[tokio::test]
async fn restart_ceiling_parks_the_replica() {
    let f = fleet_with(|c| c.restart_ceiling = 0);
    f.controller.set_desired_count(2).await.unwrap();
    let monitor = HealthMonitor::new(Arc::clone(&f.controller));

    f.runtime.set_probe_ok(ReplicaId(2), false);
    monitor.run_pass().await;
    monitor.run_pass().await;

    // Budget of zero: the second strike parks instead of restarting.
    assert_eq!(f.log.count("start 2"), 1);
    let status = f.controller.replica_status(ReplicaId(2)).await.unwrap();
    assert_eq!(status.state, ReplicaState::Failed);
    assert_eq!(event_count(&f, EventKind::RestartCeilingReached), 1);

    // Parked replica left the balancer rotation but keeps its record.
    assert_eq!(live_config(&f).matches("server 127.0.0.1:").count(), 2);
    assert_eq!(f.controller.get_cluster_state().await.replicas.len(), 2);

    // Failed is terminal for the monitor; further passes never restart it.
    monitor.run_pass().await;
    assert_eq!(f.log.count("start 2"), 1);
    assert_eq!(event_count(&f, EventKind::RestartCeilingReached), 1);
}

#[tokio::test]
async fn dead_runtime_daemon_is_one_incident_not_many() {
    let f = fleet();
    f.controller.set_desired_count(3).await.unwrap();
    let monitor = HealthMonitor::new(Arc::clone(&f.controller));

    f.runtime.set_daemon_alive(false);
    monitor.run_pass().await;

    assert_eq!(f.log.count("restart-daemon"), 1);
    assert_eq!(event_count(&f, EventKind::RuntimeUnavailable), 1);
    assert_eq!(event_count(&f, EventKind::RuntimeRestarted), 1);

    // Replicas were not blamed for the daemon outage.
    assert_eq!(event_count(&f, EventKind::ProbeFailed), 0);
    for id in 1..=3 {
        assert_eq!(f.log.count(&format!("start {id}")), 1);
    }
}

#[tokio::test]
async fn sustained_memory_pressure_warns_after_two_passes() {
    let f = fleet();
    f.controller.set_desired_count(1).await.unwrap();
    let monitor = HealthMonitor::new(Arc::clone(&f.controller));

    f.runtime.set_memory_percent(ReplicaId(1), 95.0);
    monitor.run_pass().await;
    assert_eq!(event_count(&f, EventKind::MemoryHigh), 0);

    monitor.run_pass().await;
    assert_eq!(event_count(&f, EventKind::MemoryHigh), 1);

    // Dropping below the threshold resets the streak.
    f.runtime.set_memory_percent(ReplicaId(1), 40.0);
    monitor.run_pass().await;
    f.runtime.set_memory_percent(ReplicaId(1), 95.0);
    monitor.run_pass().await;
    assert_eq!(event_count(&f, EventKind::MemoryHigh), 1);
}

#[tokio::test]
async fn watchdog_restores_a_dead_balancer_with_last_good_config() {
    let f = fleet();
    f.controller.set_desired_count(2).await.unwrap();
    let watchdog = Watchdog::new(Arc::clone(&f.controller));
    let generation = f.controller.get_cluster_state().await.balancer_generation;

    f.balancer.set_alive(false);
    watchdog.run_pass().await;

    assert_eq!(f.balancer.restart_count(), 1);
    // Restart, then a reload carrying the last good config.
    assert_eq!(f.balancer.reload_count(), 2);
    assert_eq!(live_config(&f).matches("server 127.0.0.1:").count(), 4);
    assert_eq!(event_count(&f, EventKind::BalancerDown), 1);
    assert_eq!(event_count(&f, EventKind::BalancerRestarted), 1);
    assert_eq!(
        f.controller.get_cluster_state().await.balancer_generation,
        generation + 1
    );

    // Healthy balancer: the pass is a pure check.
    watchdog.run_pass().await;
    assert_eq!(f.balancer.restart_count(), 1);
    assert_eq!(event_count(&f, EventKind::BalancerDown), 1);
}
