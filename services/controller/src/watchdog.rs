//! Load balancer process watchdog.
//!
//! A fast loop that detects a dead balancer process and brings it back
//! with the last successfully applied configuration. Runs on a shorter
//! interval than the health monitor since a dead balancer means total
//! loss of service, not degraded capacity.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use fleet_events::{EventKind, EventSubject, Severity};

use crate::controller::Controller;

pub struct Watchdog {
    controller: Arc<Controller>,
}

impl Watchdog {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self { controller }
    }

    /// Run the watchdog loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let interval = self.controller.config.watchdog_interval;
        info!(interval_secs = interval.as_secs(), "starting balancer watchdog");

        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_pass().await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("balancer watchdog shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One watchdog pass: restart the balancer if its process is gone.
    pub async fn run_pass(&self) {
        if self.controller.balancer.process().is_alive().await {
            return;
        }

        self.controller.record_event(
            EventSubject::Balancer,
            EventKind::BalancerDown,
            Severity::Critical,
            "balancer process not running",
        );

        // Recovery mutates live config, so it serializes with scaling. A
        // busy lock means a scaling operation is about to apply a fresh
        // config anyway; retry next tick if the process is still gone.
        let Ok(_guard) = self.controller.scaling.try_lock() else {
            debug!("scaling lock busy, deferring balancer recovery");
            return;
        };

        if let Err(e) = self.controller.balancer.process().restart().await {
            warn!(error = %e, "balancer process restart failed");
            return;
        }

        // The restarted process picked up whatever config file was on
        // disk; re-apply the last known-good text to make that explicit.
        if let Err(e) = self.controller.balancer.reapply_last_good().await {
            warn!(error = %e, "failed to re-apply last good balancer config");
            return;
        }
        if let Err(e) = self.controller.bump_generation().await {
            warn!(error = %e, "failed to persist balancer generation");
        }

        self.controller.record_event(
            EventSubject::Balancer,
            EventKind::BalancerRestarted,
            Severity::Warning,
            "balancer process restarted with last good configuration",
        );
    }
}
