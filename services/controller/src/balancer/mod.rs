//! Balancer configuration management: render, stage, validate, swap, reload.
//!
//! The apply path never overwrites the live configuration with unvalidated
//! content: a rendered config is written to a staging path, validated by the
//! balancer's own checker, and only then atomically renamed into the live
//! location before the reload signal. On validation failure the previous
//! live configuration remains untouched and in effect.

pub mod process;
pub mod render;

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use arc_swap::ArcSwapOption;
use tracing::{debug, info};

use crate::error::FleetError;
use crate::model::ReplicaSpec;

pub use process::{BalancerProcess, MockBalancer, NginxProcess};
pub use render::{render, RenderSettings};

/// Owns the staged/live config paths and the apply procedure.
pub struct BalancerManager {
    process: Arc<dyn BalancerProcess>,
    settings: RenderSettings,
    staging_path: PathBuf,
    live_path: PathBuf,
    /// Last configuration that passed validation and went live. The
    /// watchdog re-applies this verbatim after a balancer restart rather
    /// than re-rendering from a fleet that may be mid-transition.
    last_good: ArcSwapOption<String>,
}

impl BalancerManager {
    pub fn new(
        process: Arc<dyn BalancerProcess>,
        settings: RenderSettings,
        staging_path: PathBuf,
        live_path: PathBuf,
    ) -> Self {
        Self {
            process,
            settings,
            staging_path,
            live_path,
            last_good: ArcSwapOption::empty(),
        }
    }

    /// Render the configuration for the given serving replicas.
    pub fn render(&self, replicas: &[&ReplicaSpec]) -> String {
        render(&self.settings, replicas)
    }

    /// Stage, validate, atomically swap, and reload.
    ///
    /// Returns `Ok(false)` without touching anything when `config_text` is
    /// byte-identical to the last applied configuration (no reload storm on
    /// no-op renders), `Ok(true)` when a new configuration went live.
    pub async fn apply(&self, config_text: &str) -> Result<bool, FleetError> {
        if let Some(last) = self.last_good.load_full() {
            if last.as_str() == config_text {
                debug!("balancer config unchanged, skipping apply");
                return Ok(false);
            }
        }

        if let Some(parent) = self.staging_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.staging_path, config_text)?;

        self.process.validate(&self.staging_path).await?;

        // Rename is atomic on the same filesystem; a reader of the live
        // path never observes a partially written file.
        fs::rename(&self.staging_path, &self.live_path)?;
        self.process.reload().await?;

        self.last_good
            .store(Some(Arc::new(config_text.to_string())));
        info!(bytes = config_text.len(), "balancer config applied");
        Ok(true)
    }

    /// Re-apply the last known-good configuration (watchdog recovery path).
    ///
    /// No-op if nothing has been applied yet this process lifetime.
    pub async fn reapply_last_good(&self) -> Result<(), FleetError> {
        let Some(last) = self.last_good.load_full() else {
            debug!("no known-good balancer config to re-apply");
            return Ok(());
        };

        if let Some(parent) = self.live_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.staging_path, last.as_str())?;
        fs::rename(&self.staging_path, &self.live_path)?;
        self.process.reload().await?;
        Ok(())
    }

    /// Seed the known-good slot from the live file on disk (startup).
    pub fn adopt_live_config(&self) {
        if let Ok(text) = fs::read_to_string(&self.live_path) {
            self.last_good.store(Some(Arc::new(text)));
        }
    }

    pub fn process(&self) -> &Arc<dyn BalancerProcess> {
        &self.process
    }

    /// The last applied configuration text, if any.
    pub fn last_good(&self) -> Option<Arc<String>> {
        self.last_good.load_full()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{ReplicaId, ReplicaLimits};

    fn settings() -> RenderSettings {
        RenderSettings {
            tcp_port: 443,
            udp_port: 443,
            max_fails: 3,
            fail_timeout_secs: 30,
        }
    }

    fn manager(dir: &std::path::Path, process: Arc<MockBalancer>) -> BalancerManager {
        BalancerManager::new(
            process,
            settings(),
            dir.join("staged.conf"),
            dir.join("live.conf"),
        )
    }

    fn spec(id: u32, port: u16) -> ReplicaSpec {
        ReplicaSpec {
            id: ReplicaId(id),
            local_port: port,
            limits: ReplicaLimits::default(),
        }
    }

    #[tokio::test]
    async fn test_apply_writes_live_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(MockBalancer::new());
        let manager = manager(dir.path(), Arc::clone(&process));

        let a = spec(1, 14000);
        let text = manager.render(&[&a]);
        assert!(manager.apply(&text).await.unwrap());

        let live = fs::read_to_string(dir.path().join("live.conf")).unwrap();
        assert_eq!(live, text);
        assert_eq!(process.reload_count(), 1);
        // Staging file was renamed away.
        assert!(!dir.path().join("staged.conf").exists());
    }

    #[tokio::test]
    async fn test_failed_validation_leaves_live_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(MockBalancer::new());
        let manager = manager(dir.path(), Arc::clone(&process));

        let a = spec(1, 14000);
        manager.apply(&manager.render(&[&a])).await.unwrap();
        let before = fs::read_to_string(dir.path().join("live.conf")).unwrap();

        process.set_valid(false);
        let b = spec(2, 14001);
        let result = manager.apply(&manager.render(&[&a, &b])).await;
        assert!(matches!(result, Err(FleetError::InvalidConfig(_))));

        let after = fs::read_to_string(dir.path().join("live.conf")).unwrap();
        assert_eq!(before, after);
        assert_eq!(process.reload_count(), 1); // no reload for the bad config
    }

    #[tokio::test]
    async fn test_identical_config_skips_reload() {
        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(MockBalancer::new());
        let manager = manager(dir.path(), Arc::clone(&process));

        let a = spec(1, 14000);
        let text = manager.render(&[&a]);
        assert!(manager.apply(&text).await.unwrap());
        assert!(!manager.apply(&text).await.unwrap());
        assert_eq!(process.reload_count(), 1);
    }

    #[tokio::test]
    async fn test_reapply_last_good() {
        let dir = tempfile::tempdir().unwrap();
        let process = Arc::new(MockBalancer::new());
        let manager = manager(dir.path(), Arc::clone(&process));

        // Nothing applied yet: no-op.
        manager.reapply_last_good().await.unwrap();
        assert_eq!(process.reload_count(), 0);

        let a = spec(1, 14000);
        let text = manager.render(&[&a]);
        manager.apply(&text).await.unwrap();

        // Simulate the file being lost with the balancer restart.
        fs::remove_file(dir.path().join("live.conf")).unwrap();
        manager.reapply_last_good().await.unwrap();
        let live = fs::read_to_string(dir.path().join("live.conf")).unwrap();
        assert_eq!(live, text);
        assert_eq!(process.reload_count(), 2);
    }
}
