//! Docker CLI implementation of the container runtime.
//!
//! Worker lifecycle is driven through the `docker` binary rather than the
//! engine API: the controller runs on the same host, the call rate is low,
//! and the CLI keeps the dependency surface small. Stderr text is mapped
//! onto the typed error taxonomy where the distinction matters upstream.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tokio::process::Command;
use tracing::{debug, warn};

use crate::config::Config;
use crate::error::FleetError;
use crate::model::{ReplicaId, ReplicaSpec};
use crate::runtime::{bounded, ContainerRuntime, ContainerStats};

/// Mount point of the identity volume inside the worker container.
const WORKER_DATA_DIR: &str = "/var/lib/relay-worker";

/// Container runtime backed by the Docker CLI.
pub struct DockerRuntime {
    container_prefix: String,
    worker_image: String,
    op_timeout: Duration,
    probe_timeout: Duration,
}

impl DockerRuntime {
    pub fn new(config: &Config) -> Self {
        Self {
            container_prefix: config.container_prefix.clone(),
            worker_image: config.worker_image.clone(),
            op_timeout: config.op_timeout,
            probe_timeout: Duration::from_secs(3),
        }
    }

    fn name(&self, id: ReplicaId) -> String {
        format!("{}-{}", self.container_prefix, id)
    }

    async fn docker(&self, args: &[String]) -> Result<String, FleetError> {
        let run = async {
            let output = Command::new("docker")
                .args(args)
                .stdin(Stdio::null())
                .output()
                .await
                .map_err(|e| FleetError::Runtime(format!("failed to spawn docker: {e}")))?;

            if output.status.success() {
                Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
            } else {
                Err(classify_docker_error(&String::from_utf8_lossy(&output.stderr)))
            }
        };

        let operation = format!("docker {}", args.first().map(String::as_str).unwrap_or(""));
        bounded(&operation, self.op_timeout, run).await
    }
}

/// Map docker stderr onto the error taxonomy.
fn classify_docker_error(stderr: &str) -> FleetError {
    let line = stderr.lines().next().unwrap_or("").to_string();
    let lower = line.to_lowercase();

    if lower.contains("port is already allocated") || lower.contains("address already in use") {
        // The port number is surfaced by the caller, which knows the spec.
        return FleetError::Runtime(format!("port collision: {line}"));
    }
    if lower.contains("cannot connect to the docker daemon") {
        return FleetError::RuntimeUnavailable(line);
    }
    if lower.contains("memory") && lower.contains("minimum")
        || lower.contains("invalid") && (lower.contains("cpus") || lower.contains("memory"))
    {
        return FleetError::ResourceLimitRejected(line);
    }
    FleetError::Runtime(line)
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn start(&self, spec: &ReplicaSpec) -> Result<(), FleetError> {
        let name = self.name(spec.id);
        let port = spec.local_port;

        // The identity volume is keyed by replica id; a recreated container
        // at the same id picks up the same worker keys.
        let args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name,
            "--restart".into(),
            "no".into(),
            "-p".into(),
            format!("127.0.0.1:{port}:{port}/tcp"),
            "-p".into(),
            format!("127.0.0.1:{port}:{port}/udp"),
            "--cpus".into(),
            format!("{}", spec.limits.cpu_limit),
            "--memory".into(),
            format!("{}", spec.limits.mem_limit_bytes),
            "-v".into(),
            format!(
                "{}:{}",
                spec.volume_name(&self.container_prefix),
                WORKER_DATA_DIR
            ),
            self.worker_image.clone(),
            "start".into(),
            "--listen-port".into(),
            format!("{port}"),
            "-m".into(),
            format!("{}", spec.limits.max_clients),
            "-b".into(),
            format!("{}", spec.limits.bandwidth_cap_mbps),
        ];

        match self.docker(&args).await {
            Ok(container_id) => {
                debug!(replica_id = %spec.id, container_id = %container_id, "container started");
                Ok(())
            }
            Err(FleetError::Runtime(msg)) if msg.starts_with("port collision") => {
                Err(FleetError::PortInUse(port))
            }
            Err(e) => Err(e),
        }
    }

    async fn stop(&self, id: ReplicaId, grace: Duration) -> Result<(), FleetError> {
        let name = self.name(id);
        self.docker(&[
            "stop".into(),
            "-t".into(),
            format!("{}", grace.as_secs()),
            name,
        ])
        .await?;
        Ok(())
    }

    async fn remove(&self, id: ReplicaId) -> Result<(), FleetError> {
        let name = self.name(id);
        self.docker(&["rm".into(), "-f".into(), name]).await?;
        Ok(())
    }

    async fn inspect(&self, id: ReplicaId) -> Result<ContainerStats, FleetError> {
        let name = self.name(id);

        let state = self
            .docker(&[
                "inspect".into(),
                "--format".into(),
                "{{.State.Running}} {{.State.OOMKilled}}".into(),
                name.clone(),
            ])
            .await?;
        let mut parts = state.split_whitespace();
        let running = parts.next() == Some("true");
        let oom_killed = parts.next() == Some("true");

        let mut stats = ContainerStats {
            running,
            oom_killed,
            ..Default::default()
        };

        if running {
            // Usage sampling is best-effort; a stats hiccup must not fail
            // the whole health pass.
            match self
                .docker(&[
                    "stats".into(),
                    "--no-stream".into(),
                    "--format".into(),
                    "{{.MemPerc}} {{.CPUPerc}}".into(),
                    name,
                ])
                .await
            {
                Ok(line) => {
                    let mut parts = line.split_whitespace();
                    stats.memory_percent = parse_percent(parts.next());
                    stats.cpu_percent = parse_percent(parts.next());
                }
                Err(e) => warn!(replica_id = %id, error = %e, "stats sampling failed"),
            }
        }

        Ok(stats)
    }

    async fn probe(&self, spec: &ReplicaSpec) -> bool {
        let addr = ("127.0.0.1", spec.local_port);
        matches!(
            tokio::time::timeout(self.probe_timeout, TcpStream::connect(addr)).await,
            Ok(Ok(_))
        )
    }

    async fn daemon_alive(&self) -> bool {
        self.docker(&["info".into(), "--format".into(), "ok".into()])
            .await
            .is_ok()
    }

    async fn restart_daemon(&self) -> Result<(), FleetError> {
        let run = async {
            let output = Command::new("systemctl")
                .args(["restart", "docker"])
                .output()
                .await
                .map_err(|e| FleetError::Runtime(format!("failed to spawn systemctl: {e}")))?;

            if output.status.success() {
                Ok(())
            } else {
                Err(FleetError::RuntimeUnavailable(
                    String::from_utf8_lossy(&output.stderr).trim().to_string(),
                ))
            }
        };

        bounded("systemctl restart docker", self.op_timeout, run).await
    }
}

fn parse_percent(field: Option<&str>) -> f64 {
    field
        .map(|s| s.trim_end_matches('%'))
        .and_then(|s| s.parse().ok())
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_port_collision() {
        let e = classify_docker_error(
            "docker: Error response from daemon: driver failed programming external connectivity: Bind for 127.0.0.1:14000 failed: port is already allocated.",
        );
        match e {
            FleetError::Runtime(msg) => assert!(msg.starts_with("port collision")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_classify_daemon_down() {
        let e = classify_docker_error(
            "Cannot connect to the Docker daemon at unix:///var/run/docker.sock.",
        );
        assert!(matches!(e, FleetError::RuntimeUnavailable(_)));
    }

    #[test]
    fn test_classify_resource_rejection() {
        let e = classify_docker_error(
            "docker: Error response from daemon: Minimum memory limit allowed is 6MB.",
        );
        assert!(matches!(e, FleetError::ResourceLimitRejected(_)));
    }

    #[test]
    fn test_parse_percent() {
        assert_eq!(parse_percent(Some("42.5%")), 42.5);
        assert_eq!(parse_percent(Some("garbage")), 0.0);
        assert_eq!(parse_percent(None), 0.0);
    }
}
