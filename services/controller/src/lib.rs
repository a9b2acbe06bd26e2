//! Relay Fleet Controller Library
//!
//! The controller runs on a single host and keeps a fleet of identical relay
//! worker containers converged on a desired replica count behind a Layer-4
//! load balancer. It owns the cluster state, allocates per-replica ports,
//! regenerates the balancer configuration in lock-step with fleet changes,
//! and remediates replica and balancer failures.
//!
//! ## Architecture
//!
//! - **ScalingCoordinator**: serialized scale up/down under one exclusive lock
//! - **ReplicaManager**: container lifecycle (create/stop/restart/status)
//! - **BalancerManager**: deterministic render + stage/validate/swap apply
//! - **HealthMonitor**: slow periodic pass with bounded remediation
//! - **Watchdog**: fast liveness loop for the balancer process only
//!
//! ## Modules
//!
//! - `runtime`: container runtime abstraction (mock in tests, Docker in prod)
//! - `balancer`: nginx stream config generation and application
//! - `store`: local SQLite persistence of cluster state

pub mod api;
pub mod balancer;
pub mod config;
pub mod controller;
pub mod docker;
pub mod error;
pub mod health;
pub mod model;
pub mod ports;
pub mod replica;
pub mod runtime;
pub mod scaler;
pub mod store;
pub mod watchdog;

// Re-export commonly used types
pub use config::Config;
pub use controller::Controller;
pub use error::FleetError;
pub use model::{ClusterState, ReplicaId, ReplicaSpec, ReplicaState};
pub use runtime::MockRuntime;
pub use scaler::ScaleOutcome;
