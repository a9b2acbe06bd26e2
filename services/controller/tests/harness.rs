//! Test harness for fleet controller integration tests.
//!
//! Wires a controller to mock runtime and balancer processes that share a
//! single call log, so tests can assert cross-component ordering (for
//! example that a drained balancer config is applied before any replica
//! is stopped).

use std::sync::Arc;

use tempfile::TempDir;

use fleet_controller::balancer::{BalancerProcess, MockBalancer};
use fleet_controller::config::Config;
use fleet_controller::runtime::{CallLog, ContainerRuntime, MockRuntime};
use fleet_controller::store::Store;
use fleet_controller::Controller;

#[allow(dead_code)]
pub struct Fleet {
    pub controller: Arc<Controller>,
    pub runtime: Arc<MockRuntime>,
    pub balancer: Arc<MockBalancer>,
    pub log: CallLog,
    pub config: Config,
    /// Holds the temp directory (balancer config files) alive.
    pub dir: TempDir,
}

/// A controller over fresh mocks and an in-memory store.
#[allow(dead_code)]
pub fn fleet() -> Fleet {
    fleet_with(|_| {})
}

/// Like [`fleet`] but lets the test tweak the configuration first.
pub fn fleet_with(tweak: impl FnOnce(&mut Config)) -> Fleet {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = Config::for_tests(dir.path().to_path_buf());
    tweak(&mut config);

    let log = CallLog::new();
    let runtime = Arc::new(MockRuntime::with_log(log.clone()));
    let balancer = Arc::new(MockBalancer::with_log(log.clone()));
    let store = Arc::new(Store::open_in_memory().expect("in-memory store"));

    let controller = Arc::new(Controller::new(
        config.clone(),
        Arc::clone(&runtime) as Arc<dyn ContainerRuntime>,
        Arc::clone(&balancer) as Arc<dyn BalancerProcess>,
        store,
    ));

    Fleet {
        controller,
        runtime,
        balancer,
        log,
        config,
        dir,
    }
}

/// The balancer configuration currently on disk at the live path.
#[allow(dead_code)]
pub fn live_config(fleet: &Fleet) -> String {
    std::fs::read_to_string(&fleet.config.balancer_live_path).unwrap_or_default()
}
