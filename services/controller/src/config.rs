//! Configuration for the fleet controller.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;

use crate::model::ReplicaLimits;

/// Fleet controller configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Data directory for local state (SQLite database lives here).
    pub data_dir: PathBuf,

    /// Container name prefix for replicas and their volumes.
    pub container_prefix: String,

    /// Worker container image.
    pub worker_image: String,

    /// First port of the replica port range.
    pub port_base: u16,

    /// Number of ports in the replica port range.
    pub port_capacity: u16,

    /// Hard ceiling on the replica count.
    pub max_replicas: u32,

    /// Public TCP port the balancer listens on.
    pub balancer_tcp_port: u16,

    /// Public UDP port the balancer listens on.
    pub balancer_udp_port: u16,

    /// Staging path for rendered balancer configuration.
    pub balancer_staging_path: PathBuf,

    /// Live path the balancer process reads.
    pub balancer_live_path: PathBuf,

    /// Per-backend failure threshold enforced by the balancer itself.
    pub balancer_max_fails: u32,

    /// Per-backend cool-down after hitting the failure threshold.
    pub balancer_fail_timeout: Duration,

    /// Defaults applied to new replica specs.
    pub replica_limits: ReplicaLimits,

    /// How many replicas are created concurrently during scale-up.
    pub create_concurrency: usize,

    /// Grace period for stopping a replica.
    pub stop_grace: Duration,

    /// Startup grace window: probe failures inside it are not unhealthy.
    pub startup_grace: Duration,

    /// Interval between readiness probes during startup.
    pub startup_probe_interval: Duration,

    /// Health monitor pass interval.
    pub health_interval: Duration,

    /// Balancer watchdog interval.
    pub watchdog_interval: Duration,

    /// Timeout applied to individual runtime/balancer operations.
    pub op_timeout: Duration,

    /// Memory usage fraction above which a warning event is emitted.
    pub memory_warn_percent: f64,

    /// Restart ceiling within the rolling window before a replica is parked.
    pub restart_ceiling: u32,

    /// Rolling window for restart accounting.
    pub restart_window: Duration,

    /// Listen address for the HTTP API.
    pub api_listen_addr: SocketAddr,
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from `FLEET_*` environment variables.
    pub fn from_env() -> Result<Self> {
        let data_dir = std::env::var("FLEET_DATA_DIR")
            .unwrap_or_else(|_| "/var/lib/relay-fleet".to_string());

        let container_prefix =
            std::env::var("FLEET_CONTAINER_PREFIX").unwrap_or_else(|_| "relay".to_string());

        let worker_image = std::env::var("FLEET_WORKER_IMAGE")
            .unwrap_or_else(|_| "relay-worker:latest".to_string());

        let limits = ReplicaLimits {
            cpu_limit: env_or("FLEET_REPLICA_CPU", 1.0),
            mem_limit_bytes: env_or("FLEET_REPLICA_MEM_BYTES", 512 * 1024 * 1024),
            max_clients: env_or("FLEET_REPLICA_MAX_CLIENTS", 50),
            bandwidth_cap_mbps: env_or("FLEET_REPLICA_BANDWIDTH_MBPS", 40.0),
        };

        let api_listen_addr = std::env::var("FLEET_API_LISTEN_ADDR")
            .unwrap_or_else(|_| "127.0.0.1:7070".to_string())
            .parse()?;

        Ok(Self {
            data_dir: PathBuf::from(data_dir),
            container_prefix,
            worker_image,
            port_base: env_or("FLEET_PORT_BASE", 14000),
            port_capacity: env_or("FLEET_PORT_CAPACITY", 64),
            max_replicas: env_or("FLEET_MAX_REPLICAS", 32),
            balancer_tcp_port: env_or("FLEET_BALANCER_TCP_PORT", 443),
            balancer_udp_port: env_or("FLEET_BALANCER_UDP_PORT", 443),
            balancer_staging_path: PathBuf::from(
                std::env::var("FLEET_BALANCER_STAGING")
                    .unwrap_or_else(|_| "/etc/nginx/stream.d/relay-fleet.conf.staged".to_string()),
            ),
            balancer_live_path: PathBuf::from(
                std::env::var("FLEET_BALANCER_LIVE")
                    .unwrap_or_else(|_| "/etc/nginx/stream.d/relay-fleet.conf".to_string()),
            ),
            balancer_max_fails: env_or("FLEET_BALANCER_MAX_FAILS", 3),
            balancer_fail_timeout: Duration::from_secs(env_or("FLEET_BALANCER_FAIL_TIMEOUT", 30)),
            replica_limits: limits,
            create_concurrency: env_or("FLEET_CREATE_CONCURRENCY", 2),
            stop_grace: Duration::from_secs(env_or("FLEET_STOP_GRACE_SECS", 15)),
            startup_grace: Duration::from_secs(env_or("FLEET_STARTUP_GRACE_SECS", 60)),
            startup_probe_interval: Duration::from_millis(env_or(
                "FLEET_STARTUP_PROBE_MS",
                1000,
            )),
            health_interval: Duration::from_secs(env_or("FLEET_HEALTH_INTERVAL_SECS", 300)),
            watchdog_interval: Duration::from_secs(env_or("FLEET_WATCHDOG_INTERVAL_SECS", 60)),
            op_timeout: Duration::from_secs(env_or("FLEET_OP_TIMEOUT_SECS", 30)),
            memory_warn_percent: env_or("FLEET_MEMORY_WARN_PERCENT", 90.0),
            restart_ceiling: env_or(
                "FLEET_RESTART_CEILING",
                fleet_reconcile::DEFAULT_RESTART_CEILING,
            ),
            restart_window: Duration::from_secs(env_or("FLEET_RESTART_WINDOW_SECS", 3600)),
            api_listen_addr,
        })
    }

    /// A compact configuration for tests: tiny timings, temp paths.
    pub fn for_tests(data_dir: PathBuf) -> Self {
        let staging = data_dir.join("relay-fleet.conf.staged");
        let live = data_dir.join("relay-fleet.conf");
        Self {
            data_dir,
            container_prefix: "relay".to_string(),
            worker_image: "relay-worker:test".to_string(),
            port_base: 14000,
            port_capacity: 64,
            max_replicas: 32,
            balancer_tcp_port: 8443,
            balancer_udp_port: 8443,
            balancer_staging_path: staging,
            balancer_live_path: live,
            balancer_max_fails: 3,
            balancer_fail_timeout: Duration::from_secs(30),
            replica_limits: ReplicaLimits::default(),
            create_concurrency: 2,
            stop_grace: Duration::from_millis(50),
            startup_grace: Duration::from_millis(250),
            startup_probe_interval: Duration::from_millis(10),
            health_interval: Duration::from_millis(100),
            watchdog_interval: Duration::from_millis(100),
            op_timeout: Duration::from_secs(5),
            memory_warn_percent: 90.0,
            restart_ceiling: 10,
            restart_window: Duration::from_secs(3600),
            api_listen_addr: "127.0.0.1:0".parse().unwrap(),
        }
    }
}
