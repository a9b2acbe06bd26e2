//! Controller restart: state is reconstructed from the store, not from
//! the runtime, and adopted replicas whose containers are gone fall into
//! the normal remediation path.

use std::collections::HashSet;
use std::sync::Arc;

use fleet_controller::balancer::{BalancerProcess, MockBalancer};
use fleet_controller::config::Config;
use fleet_controller::runtime::{ContainerRuntime, MockRuntime};
use fleet_controller::store::Store;
use fleet_controller::{Controller, ReplicaState};

fn controller(config: &Config, store: Arc<Store>) -> (Arc<Controller>, Arc<MockRuntime>) {
    let runtime = Arc::new(MockRuntime::new());
    let balancer = Arc::new(MockBalancer::new());
    let controller = Arc::new(Controller::new(
        config.clone(),
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        balancer as Arc<dyn BalancerProcess>,
        store,
    ));
    (controller, runtime)
}

#[tokio::test]
async fn recover_rebuilds_fleet_from_store() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::for_tests(dir.path().to_path_buf());
    let db_path = dir.path().join("fleet.db");

    let generation = {
        let store = Arc::new(Store::open(&db_path).unwrap());
        let (first, _runtime) = controller(&config, store);
        first.set_desired_count(3).await.unwrap();
        first.get_cluster_state().await.balancer_generation
    };

    // New process, same database. The mock runtime starts empty, so the
    // adopted containers all look dead.
    let store = Arc::new(Store::open(&db_path).unwrap());
    let (second, _runtime) = controller(&config, store);
    second.recover().await.unwrap();

    let state = second.get_cluster_state().await;
    assert_eq!(state.desired_count, 3);
    assert_eq!(state.replicas.len(), 3);
    assert_eq!(state.balancer_generation, generation);
    for entry in state.replicas.values() {
        assert_eq!(entry.status.state, ReplicaState::Unhealthy);
        assert!(entry.status.last_error.is_some());
    }

    // The last applied configuration was adopted from the live file, so
    // re-rendering the same fleet is a no-op.
    assert!(!second.trigger_balancer_reload().await.unwrap());
}

#[tokio::test]
async fn recovered_port_allocator_never_collides() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::for_tests(dir.path().to_path_buf());
    let db_path = dir.path().join("fleet.db");

    {
        let store = Arc::new(Store::open(&db_path).unwrap());
        let (first, _runtime) = controller(&config, store);
        first.set_desired_count(3).await.unwrap();
    }

    let store = Arc::new(Store::open(&db_path).unwrap());
    let (second, _runtime) = controller(&config, store);
    second.recover().await.unwrap();

    second.set_desired_count(5).await.unwrap();
    let state = second.get_cluster_state().await;
    assert_eq!(state.replicas.len(), 5);

    let ports: HashSet<u16> = state
        .replicas
        .values()
        .map(|e| e.spec.local_port)
        .collect();
    assert_eq!(ports.len(), 5, "adopted and new ports must not collide");

    let ids: Vec<u32> = state.replicas.keys().map(|id| id.0).collect();
    assert_eq!(ids, vec![1, 2, 3, 4, 5]);
}
