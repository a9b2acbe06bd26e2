//! SQLite-based persistence for cluster state.
//!
//! The store is written on every successful transition so a controller
//! restart can reconstruct the fleet without re-probing every replica's
//! configuration (liveness is still re-probed on startup).

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;

use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

use crate::error::FleetError;
use crate::model::{
    ClusterState, ReplicaEntry, ReplicaId, ReplicaLimits, ReplicaRuntimeStatus, ReplicaSpec,
    ReplicaState,
};

/// Durable store for cluster state.
///
/// The connection is guarded by a mutex; writes here are small and rare
/// (one per state transition).
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, FleetError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, FleetError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), FleetError> {
        let conn = self.conn.lock().expect("store poisoned");
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS cluster_state (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                desired_count INTEGER NOT NULL DEFAULT 0,
                balancer_generation INTEGER NOT NULL DEFAULT 0,
                cpu_limit REAL NOT NULL DEFAULT 1.0,
                mem_limit_bytes INTEGER NOT NULL DEFAULT 536870912,
                max_clients INTEGER NOT NULL DEFAULT 50,
                bandwidth_cap_mbps REAL NOT NULL DEFAULT 40.0
            );

            INSERT OR IGNORE INTO cluster_state (id) VALUES (1);

            CREATE TABLE IF NOT EXISTS replicas (
                id INTEGER PRIMARY KEY,
                local_port INTEGER NOT NULL UNIQUE,
                cpu_limit REAL NOT NULL,
                mem_limit_bytes INTEGER NOT NULL,
                max_clients INTEGER NOT NULL,
                bandwidth_cap_mbps REAL NOT NULL,
                state TEXT NOT NULL,
                restart_count INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );
            "#,
        )?;
        debug!("state store schema initialized");
        Ok(())
    }

    /// Load the full persisted cluster state.
    pub fn load(&self) -> Result<ClusterState, FleetError> {
        let conn = self.conn.lock().expect("store poisoned");

        let (desired_count, balancer_generation, limits) = conn
            .query_row(
                "SELECT desired_count, balancer_generation, cpu_limit, mem_limit_bytes,
                        max_clients, bandwidth_cap_mbps
                 FROM cluster_state WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, u32>(0)?,
                        row.get::<_, u64>(1)?,
                        ReplicaLimits {
                            cpu_limit: row.get(2)?,
                            mem_limit_bytes: row.get(3)?,
                            max_clients: row.get(4)?,
                            bandwidth_cap_mbps: row.get(5)?,
                        },
                    ))
                },
            )
            .optional()?
            .unwrap_or((0, 0, ReplicaLimits::default()));

        let mut stmt = conn.prepare(
            "SELECT id, local_port, cpu_limit, mem_limit_bytes, max_clients,
                    bandwidth_cap_mbps, state, restart_count, last_error
             FROM replicas ORDER BY id",
        )?;

        let mut replicas = BTreeMap::new();
        let rows = stmt.query_map([], |row| {
            let id = ReplicaId(row.get(0)?);
            let state_str: String = row.get(6)?;
            Ok(ReplicaEntry {
                spec: ReplicaSpec {
                    id,
                    local_port: row.get(1)?,
                    limits: ReplicaLimits {
                        cpu_limit: row.get(2)?,
                        mem_limit_bytes: row.get(3)?,
                        max_clients: row.get(4)?,
                        bandwidth_cap_mbps: row.get(5)?,
                    },
                },
                status: ReplicaRuntimeStatus {
                    state: ReplicaState::parse(&state_str).unwrap_or(ReplicaState::Failed),
                    restart_count: row.get(7)?,
                    last_healthy_at: None,
                    last_error: row.get(8)?,
                },
            })
        })?;

        for entry in rows {
            let entry = entry?;
            replicas.insert(entry.spec.id, entry);
        }

        Ok(ClusterState {
            desired_count,
            per_replica_limits: limits,
            replicas,
            balancer_generation,
        })
    }

    /// Persist the desired count and default limits.
    pub fn set_desired(&self, desired: u32, limits: &ReplicaLimits) -> Result<(), FleetError> {
        let conn = self.conn.lock().expect("store poisoned");
        conn.execute(
            "UPDATE cluster_state SET desired_count = ?1, cpu_limit = ?2,
             mem_limit_bytes = ?3, max_clients = ?4, bandwidth_cap_mbps = ?5 WHERE id = 1",
            params![
                desired,
                limits.cpu_limit,
                limits.mem_limit_bytes,
                limits.max_clients,
                limits.bandwidth_cap_mbps
            ],
        )?;
        Ok(())
    }

    /// Persist the balancer generation counter.
    pub fn set_balancer_generation(&self, generation: u64) -> Result<(), FleetError> {
        let conn = self.conn.lock().expect("store poisoned");
        conn.execute(
            "UPDATE cluster_state SET balancer_generation = ?1 WHERE id = 1",
            params![generation],
        )?;
        Ok(())
    }

    /// Insert or update one replica record.
    pub fn upsert_replica(
        &self,
        spec: &ReplicaSpec,
        status: &ReplicaRuntimeStatus,
    ) -> Result<(), FleetError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().expect("store poisoned");
        conn.execute(
            r#"
            INSERT INTO replicas (id, local_port, cpu_limit, mem_limit_bytes, max_clients,
                                  bandwidth_cap_mbps, state, restart_count, last_error,
                                  created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
            ON CONFLICT(id) DO UPDATE SET
                state = excluded.state,
                restart_count = excluded.restart_count,
                last_error = excluded.last_error,
                updated_at = excluded.updated_at
            "#,
            params![
                spec.id.0,
                spec.local_port,
                spec.limits.cpu_limit,
                spec.limits.mem_limit_bytes,
                spec.limits.max_clients,
                spec.limits.bandwidth_cap_mbps,
                status.state.as_str(),
                status.restart_count,
                status.last_error,
                now,
            ],
        )?;
        Ok(())
    }

    /// Update a replica's state and error text.
    pub fn set_replica_state(
        &self,
        id: ReplicaId,
        state: ReplicaState,
        restart_count: u32,
        last_error: Option<&str>,
    ) -> Result<(), FleetError> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock().expect("store poisoned");
        conn.execute(
            "UPDATE replicas SET state = ?1, restart_count = ?2, last_error = ?3,
             updated_at = ?4 WHERE id = ?5",
            params![state.as_str(), restart_count, last_error, now, id.0],
        )?;
        Ok(())
    }

    /// Delete a replica record (scale-down or fleet reset).
    pub fn delete_replica(&self, id: ReplicaId) -> Result<(), FleetError> {
        let conn = self.conn.lock().expect("store poisoned");
        conn.execute("DELETE FROM replicas WHERE id = ?1", params![id.0])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: u32, port: u16) -> ReplicaSpec {
        ReplicaSpec {
            id: ReplicaId(id),
            local_port: port,
            limits: ReplicaLimits::default(),
        }
    }

    #[test]
    fn test_empty_store_loads_defaults() {
        let store = Store::open_in_memory().unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.desired_count, 0);
        assert_eq!(state.balancer_generation, 0);
        assert!(state.replicas.is_empty());
    }

    #[test]
    fn test_replica_roundtrip() {
        let store = Store::open_in_memory().unwrap();

        let mut status = ReplicaRuntimeStatus::new();
        status.state = ReplicaState::Running;
        store.upsert_replica(&spec(1, 14000), &status).unwrap();
        store.upsert_replica(&spec(2, 14001), &status).unwrap();

        store
            .set_replica_state(ReplicaId(2), ReplicaState::Failed, 11, Some("probe"))
            .unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.replicas.len(), 2);
        assert_eq!(
            state.replicas[&ReplicaId(1)].status.state,
            ReplicaState::Running
        );
        let two = &state.replicas[&ReplicaId(2)];
        assert_eq!(two.status.state, ReplicaState::Failed);
        assert_eq!(two.status.restart_count, 11);
        assert_eq!(two.status.last_error.as_deref(), Some("probe"));

        store.delete_replica(ReplicaId(2)).unwrap();
        let state = store.load().unwrap();
        assert_eq!(state.replicas.len(), 1);
    }

    #[test]
    fn test_desired_and_generation_persist() {
        let store = Store::open_in_memory().unwrap();
        let limits = ReplicaLimits {
            cpu_limit: 2.0,
            mem_limit_bytes: 1024,
            max_clients: 100,
            bandwidth_cap_mbps: 200.0,
        };
        store.set_desired(8, &limits).unwrap();
        store.set_balancer_generation(5).unwrap();

        let state = store.load().unwrap();
        assert_eq!(state.desired_count, 8);
        assert_eq!(state.balancer_generation, 5);
        assert_eq!(state.per_replica_limits.max_clients, 100);
    }
}
