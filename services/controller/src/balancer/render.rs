//! Deterministic rendering of the nginx `stream` configuration.
//!
//! `render` is a pure function of the serving replica set and the balancer
//! settings; all side effects (staging, validation, reload) live in the
//! manager. Byte-identical input yields byte-identical output, which lets
//! the apply path skip reloads for no-op renders.

use std::fmt::Write;

use crate::model::ReplicaSpec;

/// Settings that shape the rendered configuration.
#[derive(Debug, Clone)]
pub struct RenderSettings {
    /// Public TCP port the balancer listens on.
    pub tcp_port: u16,
    /// Public UDP port the balancer listens on.
    pub udp_port: u16,
    /// Consecutive failures before the balancer sidelines a backend.
    pub max_fails: u32,
    /// Cool-down after the failure threshold is hit, in seconds.
    pub fail_timeout_secs: u64,
}

/// Render the stream config for the given serving replicas.
///
/// Replicas must already be filtered to the serving set; `Failed`,
/// `Stopping` and `Stopped` replicas are the caller's responsibility to
/// exclude. Entries are emitted in ascending id order so the output is
/// deterministic for a given set.
pub fn render(settings: &RenderSettings, replicas: &[&ReplicaSpec]) -> String {
    let mut sorted: Vec<&ReplicaSpec> = replicas.to_vec();
    sorted.sort_by_key(|r| r.id);

    let mut out = String::new();

    // Header marks the file as generated; it is reproducible from cluster
    // state at any time and must never be hand-edited.
    out.push_str("# relay-fleet balancer configuration (generated)\n");
    let _ = writeln!(out, "# replicas: {}", sorted.len());
    out.push('\n');

    // TCP: least outstanding connections across the fleet.
    out.push_str("upstream relay_tcp {\n");
    out.push_str("    least_conn;\n");
    for spec in &sorted {
        let _ = writeln!(
            out,
            "    server 127.0.0.1:{} max_fails={} fail_timeout={}s; # replica {}",
            spec.local_port, settings.max_fails, settings.fail_timeout_secs, spec.id
        );
    }
    out.push_str("}\n\n");

    // UDP: consistent source-address hashing so a client's flow sticks to
    // one replica; the relay transport carries per-backend session state.
    out.push_str("upstream relay_udp {\n");
    out.push_str("    hash $remote_addr consistent;\n");
    for spec in &sorted {
        let _ = writeln!(
            out,
            "    server 127.0.0.1:{} max_fails={} fail_timeout={}s; # replica {}",
            spec.local_port, settings.max_fails, settings.fail_timeout_secs, spec.id
        );
    }
    out.push_str("}\n\n");

    let _ = writeln!(
        out,
        "server {{\n    listen {};\n    proxy_pass relay_tcp;\n}}\n",
        settings.tcp_port
    );
    let _ = writeln!(
        out,
        "server {{\n    listen {} udp;\n    proxy_pass relay_udp;\n}}",
        settings.udp_port
    );

    out
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

    fn spec(id: u32, port: u16) -> ReplicaSpec {
        ReplicaSpec {
            id: ReplicaId(id),
            local_port: port,
            limits: ReplicaLimits::default(),
        }
    }

    #[test]
    fn test_render_is_deterministic() {
        let a = spec(1, 14000);
        let b = spec(2, 14001);

        let first = render(&settings(), &[&a, &b]);
        let second = render(&settings(), &[&b, &a]); // order must not matter
        assert_eq!(first, second);
    }

    #[test]
    fn test_render_one_server_line_per_replica_per_upstream() {
        let specs: Vec<ReplicaSpec> = (1..=8).map(|i| spec(i, 14000 + i as u16 - 1)).collect();
        let refs: Vec<&ReplicaSpec> = specs.iter().collect();
        let text = render(&settings(), &refs);

        let server_lines = text
            .lines()
            .filter(|l| l.trim_start().starts_with("server 127.0.0.1:"))
            .count();
        assert_eq!(server_lines, 16); // 8 TCP + 8 UDP
        assert!(text.contains("least_conn;"));
        assert!(text.contains("hash $remote_addr consistent;"));
    }

    #[test]
    fn test_render_failure_threshold_and_cooldown() {
        let a = spec(1, 14000);
        let text = render(&settings(), &[&a]);
        assert!(text.contains("max_fails=3 fail_timeout=30s"));
    }

    #[test]
    fn test_render_empty_fleet() {
        let text = render(&settings(), &[]);
        assert!(text.contains("upstream relay_tcp"));
        assert!(!text.contains("server 127.0.0.1:"));
    }
}
