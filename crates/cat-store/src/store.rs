//! SQLite-backed protocol store
//!
//! Layout:
//!
//! - `protocol_graphs`: one row per graph with its BLAKE3 fingerprint
//! - `protocol_steps`: one row per step, edges as JSON id lists
//! - `protocol_instances`: execution state JSON, the frontier as a JSON
//!   set, and a `version` column used for optimistic concurrency
//!
//! Graph and state are written together on creation; afterwards only the
//! state row changes.

use std::collections::BTreeSet;
use std::path::Path;

use cat_engine::{ExecutionState, GraphId, ProtocolGraph, Step, StepId, StepKind};
use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};

use crate::error::{Result, StoreError};
use crate::fingerprint::fingerprint;

const SCHEMA_VERSION: &str = "1";

/// A protocol instance as read back from storage
#[derive(Debug, Clone, PartialEq)]
pub struct StoredInstance {
    pub instance_id: String,
    pub graph: ProtocolGraph,
    pub state: ExecutionState,
}

/// Durable storage for protocol graphs and their execution states
#[derive(Debug)]
pub struct ProtocolStore {
    conn: Connection,
}

impl ProtocolStore {
    /// Open (or create) a database file, creating parent directories
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        let store = Self { conn };
        store.migrate()?;
        log::info!("Opened protocol store at {:?}", path);
        Ok(store)
    }

    /// Open a private in-memory database
    pub fn open_in_memory() -> Result<Self> {
        let store = Self {
            conn: Connection::open_in_memory()?,
        };
        store.migrate()?;
        Ok(store)
    }

    fn migrate(&self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys=ON;

            CREATE TABLE IF NOT EXISTS meta (
              key TEXT PRIMARY KEY,
              value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS protocol_graphs (
              id TEXT PRIMARY KEY,
              fingerprint TEXT NOT NULL,
              step_count INTEGER NOT NULL,
              created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS protocol_steps (
              id TEXT PRIMARY KEY,
              graph_id TEXT NOT NULL REFERENCES protocol_graphs(id) ON DELETE CASCADE,
              position INTEGER NOT NULL,
              local_id INTEGER NOT NULL,
              kind TEXT NOT NULL,
              content TEXT NOT NULL,
              depth INTEGER NOT NULL,
              parent_ids TEXT NOT NULL DEFAULT '[]',
              child_ids TEXT NOT NULL DEFAULT '[]'
            );

            CREATE TABLE IF NOT EXISTS protocol_instances (
              id TEXT PRIMARY KEY,
              graph_id TEXT NOT NULL REFERENCES protocol_graphs(id),
              current_step_ids TEXT NOT NULL,
              state_json TEXT NOT NULL,
              version INTEGER NOT NULL,
              created_at TEXT NOT NULL,
              updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_protocol_steps_graph ON protocol_steps(graph_id, position);
            "#,
        )?;
        self.conn.execute(
            "INSERT OR IGNORE INTO meta(key, value) VALUES (?1, ?2)",
            params!["schema_version", SCHEMA_VERSION],
        )?;
        Ok(())
    }

    /// Persist a new instance: its graph, steps and initial state
    ///
    /// Runs in one transaction. Steps are inserted first with empty edge
    /// columns, then the edges are filled in once every row exists.
    pub fn create_instance(
        &mut self,
        instance_id: &str,
        graph: &ProtocolGraph,
        state: &ExecutionState,
    ) -> Result<()> {
        graph.validate()?;
        if state.graph_id() != graph.id() {
            return Err(StoreError::corrupted(format!(
                "state for graph '{}' cannot be stored with graph '{}'",
                state.graph_id(),
                graph.id()
            )));
        }

        let digest = fingerprint(graph)?;
        let now = Utc::now().to_rfc3339();
        let tx = self.conn.transaction()?;

        let exists = tx
            .query_row(
                "SELECT 1 FROM protocol_instances WHERE id = ?1",
                params![instance_id],
                |_| Ok(()),
            )
            .optional()?
            .is_some();
        if exists {
            return Err(StoreError::InstanceExists(instance_id.to_string()));
        }

        tx.execute(
            "INSERT INTO protocol_graphs (id, fingerprint, step_count, created_at) VALUES (?1, ?2, ?3, ?4)",
            params![graph.id(), digest, to_sql_int(graph.len() as u64)?, now],
        )?;
        insert_steps(&tx, graph)?;
        link_steps(&tx, graph)?;

        tx.execute(
            r#"
            INSERT INTO protocol_instances
              (id, graph_id, current_step_ids, state_json, version, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?6)
            "#,
            params![
                instance_id,
                graph.id(),
                serde_json::to_string(state.current_step_ids())?,
                serde_json::to_string(state)?,
                to_sql_int(state.version())?,
                now
            ],
        )?;

        tx.commit()?;
        log::debug!(
            "Stored instance '{}' with graph '{}' ({} steps)",
            instance_id,
            graph.id(),
            graph.len()
        );
        Ok(())
    }

    /// Load a graph, verifying its fingerprint and invariants
    pub fn load_graph(&self, graph_id: &str) -> Result<ProtocolGraph> {
        let recorded: String = self
            .conn
            .query_row(
                "SELECT fingerprint FROM protocol_graphs WHERE id = ?1",
                params![graph_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::GraphNotFound(graph_id.to_string()))?;

        let graph = self.read_graph(graph_id)?;
        let computed = fingerprint(&graph)?;
        if computed != recorded {
            return Err(StoreError::FingerprintMismatch {
                graph_id: graph_id.to_string(),
                expected: recorded,
                actual: computed,
            });
        }
        graph.validate()?;
        Ok(graph)
    }

    /// Reassemble a graph from its step rows without any checks
    fn read_graph(&self, graph_id: &str) -> Result<ProtocolGraph> {
        let mut stmt = self.conn.prepare(
            r#"
            SELECT id, local_id, kind, content, depth, parent_ids, child_ids
            FROM protocol_steps
            WHERE graph_id = ?1
            ORDER BY position
            "#,
        )?;
        let rows = stmt.query_map(params![graph_id], |row| {
            Ok(StepRow {
                id: row.get(0)?,
                local_id: row.get(1)?,
                kind: row.get(2)?,
                content: row.get(3)?,
                depth: row.get(4)?,
                parent_ids: row.get(5)?,
                child_ids: row.get(6)?,
            })
        })?;

        let mut steps = Vec::new();
        for row in rows {
            steps.push(row?.into_step()?);
        }
        Ok(ProtocolGraph::from_parts(graph_id, steps))
    }

    /// Load the execution state of an instance
    ///
    /// The `version` column is authoritative; the frontier column must agree
    /// with the state document.
    pub fn load_state(&self, instance_id: &str) -> Result<ExecutionState> {
        let (current, state_json, version) = self
            .conn
            .query_row(
                "SELECT current_step_ids, state_json, version FROM protocol_instances WHERE id = ?1",
                params![instance_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, i64>(2)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        let current: BTreeSet<StepId> = serde_json::from_str(&current)?;
        let state: ExecutionState = serde_json::from_str(&state_json)?;
        if &current != state.current_step_ids() {
            return Err(StoreError::corrupted(format!(
                "frontier column of instance '{}' disagrees with its state",
                instance_id
            )));
        }
        Ok(state.with_version(from_sql_int(version)?))
    }

    /// Load graph and state of an instance
    pub fn load_instance(&self, instance_id: &str) -> Result<StoredInstance> {
        let graph_id = self.graph_id_of(instance_id)?;
        let graph = self.load_graph(&graph_id)?;
        let state = self.load_state(instance_id)?;
        if state.graph_id() != graph.id() {
            return Err(StoreError::corrupted(format!(
                "instance '{}' state points at graph '{}'",
                instance_id,
                state.graph_id()
            )));
        }
        Ok(StoredInstance {
            instance_id: instance_id.to_string(),
            graph,
            state,
        })
    }

    /// Graph id an instance was created with
    pub fn graph_id_of(&self, instance_id: &str) -> Result<GraphId> {
        self.conn
            .query_row(
                "SELECT graph_id FROM protocol_instances WHERE id = ?1",
                params![instance_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))
    }

    /// The persisted frontier of an instance
    pub fn current_step_ids(&self, instance_id: &str) -> Result<BTreeSet<StepId>> {
        let raw: String = self
            .conn
            .query_row(
                "SELECT current_step_ids FROM protocol_instances WHERE id = ?1",
                params![instance_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Overwrite an instance's state if nobody else wrote since `expected_version`
    pub fn save_state(
        &mut self,
        instance_id: &str,
        state: &ExecutionState,
        expected_version: u64,
    ) -> Result<()> {
        let tx = self.conn.transaction()?;

        let (graph_id, stored) = tx
            .query_row(
                "SELECT graph_id, version FROM protocol_instances WHERE id = ?1",
                params![instance_id],
                |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
            )
            .optional()?
            .ok_or_else(|| StoreError::InstanceNotFound(instance_id.to_string()))?;

        let actual = from_sql_int(stored)?;
        if actual != expected_version {
            return Err(StoreError::VersionConflict {
                instance_id: instance_id.to_string(),
                expected: expected_version,
                actual,
            });
        }
        if graph_id != state.graph_id() {
            return Err(StoreError::corrupted(format!(
                "instance '{}' belongs to graph '{}', not '{}'",
                instance_id,
                graph_id,
                state.graph_id()
            )));
        }

        tx.execute(
            r#"
            UPDATE protocol_instances
            SET current_step_ids = ?2, state_json = ?3, version = ?4, updated_at = ?5
            WHERE id = ?1
            "#,
            params![
                instance_id,
                serde_json::to_string(state.current_step_ids())?,
                serde_json::to_string(state)?,
                to_sql_int(state.version())?,
                Utc::now().to_rfc3339()
            ],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// Ids of every stored instance, sorted
    pub fn instance_ids(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare("SELECT id FROM protocol_instances ORDER BY id")?;
        let ids = stmt
            .query_map([], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    /// Remove an instance together with its graph and steps
    ///
    /// Returns `false` if the instance did not exist.
    pub fn delete_instance(&mut self, instance_id: &str) -> Result<bool> {
        let tx = self.conn.transaction()?;
        let graph_id: Option<String> = tx
            .query_row(
                "SELECT graph_id FROM protocol_instances WHERE id = ?1",
                params![instance_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(graph_id) = graph_id else {
            return Ok(false);
        };

        tx.execute("DELETE FROM protocol_instances WHERE id = ?1", params![instance_id])?;
        tx.execute("DELETE FROM protocol_steps WHERE graph_id = ?1", params![graph_id])?;
        tx.execute("DELETE FROM protocol_graphs WHERE id = ?1", params![graph_id])?;
        tx.commit()?;

        log::debug!("Deleted instance '{}' and graph '{}'", instance_id, graph_id);
        Ok(true)
    }
}

/// Phase one: step rows without edges
fn insert_steps(tx: &Transaction<'_>, graph: &ProtocolGraph) -> Result<()> {
    let mut stmt = tx.prepare(
        r#"
        INSERT INTO protocol_steps (id, graph_id, position, local_id, kind, content, depth)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )?;
    for (position, step) in graph.steps().iter().enumerate() {
        stmt.execute(params![
            step.id,
            graph.id(),
            to_sql_int(position as u64)?,
            step.local_id,
            step.kind.as_str(),
            step.content,
            step.depth
        ])?;
    }
    Ok(())
}

/// Phase two: backfill parent and child lists
fn link_steps(tx: &Transaction<'_>, graph: &ProtocolGraph) -> Result<()> {
    let mut stmt =
        tx.prepare("UPDATE protocol_steps SET parent_ids = ?2, child_ids = ?3 WHERE id = ?1")?;
    for step in graph.steps() {
        stmt.execute(params![
            step.id,
            serde_json::to_string(&step.parent_ids)?,
            serde_json::to_string(&step.child_ids)?
        ])?;
    }
    Ok(())
}

struct StepRow {
    id: String,
    local_id: i64,
    kind: String,
    content: String,
    depth: i64,
    parent_ids: String,
    child_ids: String,
}

impl StepRow {
    fn into_step(self) -> Result<Step> {
        let kind: StepKind = self.kind.parse().map_err(StoreError::Corrupted)?;
        let depth = u32::try_from(self.depth).map_err(|_| {
            StoreError::corrupted(format!("step '{}' has invalid depth {}", self.id, self.depth))
        })?;
        Ok(Step {
            local_id: self.local_id,
            kind,
            content: self.content,
            depth,
            parent_ids: serde_json::from_str(&self.parent_ids)?,
            child_ids: serde_json::from_str(&self.child_ids)?,
            id: self.id,
        })
    }
}

fn to_sql_int(value: u64) -> Result<i64> {
    i64::try_from(value).map_err(|_| StoreError::corrupted(format!("{} does not fit in SQLite", value)))
}

fn from_sql_int(value: i64) -> Result<u64> {
    u64::try_from(value).map_err(|_| StoreError::corrupted(format!("negative counter {}", value)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use cat_engine::{DescriptorBatch, ExecutionEngine, WaitSignal};
    use tempfile::TempDir;

    fn protocol() -> ProtocolGraph {
        DescriptorBatch::new()
            .condition(0, "fièvre ?", [1, 2])
            .action(1, "paracétamol, hydratation", [3])
            .action(2, "surveillance", [3])
            .wait(3, "attendre 1h", [])
            .build()
            .unwrap()
    }

    fn seeded(store: &mut ProtocolStore, instance_id: &str) -> (ProtocolGraph, ExecutionState) {
        let graph = protocol();
        let state = ExecutionEngine::new(&graph).initial_state().unwrap();
        store.create_instance(instance_id, &graph, &state).unwrap();
        (graph, state)
    }

    #[test]
    fn test_create_and_load_instance() {
        let mut store = ProtocolStore::open_in_memory().unwrap();
        let (graph, state) = seeded(&mut store, "inst-1");

        let loaded = store.load_instance("inst-1").unwrap();
        assert_eq!(loaded.instance_id, "inst-1");
        assert_eq!(loaded.graph, graph);
        assert_eq!(loaded.state, state);
        assert_eq!(store.graph_id_of("inst-1").unwrap(), graph.id());
    }

    #[test]
    fn test_edges_are_stored_as_json_lists() {
        let mut store = ProtocolStore::open_in_memory().unwrap();
        let (graph, _) = seeded(&mut store, "inst-1");
        let root = graph.root_of().unwrap();

        let (parents, children): (String, String) = store
            .conn
            .query_row(
                "SELECT parent_ids, child_ids FROM protocol_steps WHERE id = ?1",
                params![root.id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(parents, "[]");
        assert_eq!(children, serde_json::to_string(&root.child_ids).unwrap());
    }

    #[test]
    fn test_frontier_is_persisted_as_a_set() {
        let mut store = ProtocolStore::open_in_memory().unwrap();
        let (graph, mut state) = seeded(&mut store, "inst-1");
        let engine = ExecutionEngine::new(&graph);

        let root = graph.root_of().unwrap().id.clone();
        engine.resolve_condition(&mut state, &root, 0, "nurse-1").unwrap();
        let branch = graph.steps()[1].id.clone();
        engine.complete_subtask(&mut state, &branch, 0, "nurse-1").unwrap();
        store.save_state("inst-1", &state, 0).unwrap();

        let raw: String = store
            .conn
            .query_row(
                "SELECT current_step_ids FROM protocol_instances WHERE id = ?1",
                params!["inst-1"],
                |row| row.get(0),
            )
            .unwrap();
        let parsed: Vec<String> = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed, vec![branch.clone()]);
        assert_eq!(&store.current_step_ids("inst-1").unwrap(), state.current_step_ids());
        assert_eq!(store.load_state("inst-1").unwrap(), state);
    }

    #[test]
    fn test_version_conflict() {
        let mut store = ProtocolStore::open_in_memory().unwrap();
        let (graph, mut state) = seeded(&mut store, "inst-1");
        let engine = ExecutionEngine::new(&graph);
        let root = graph.root_of().unwrap().id.clone();

        engine.start_step(&mut state, &root, "nurse-1").unwrap();
        store.save_state("inst-1", &state, 0).unwrap();

        // A second writer still holding version 0
        let err = store.save_state("inst-1", &state, 0).unwrap_err();
        assert!(matches!(
            err,
            StoreError::VersionConflict { expected: 0, actual: 1, .. }
        ));
        assert_eq!(store.load_state("inst-1").unwrap().version(), 1);
    }

    #[test]
    fn test_tampered_content_fails_fingerprint() {
        let mut store = ProtocolStore::open_in_memory().unwrap();
        let (graph, _) = seeded(&mut store, "inst-1");

        store
            .conn
            .execute(
                "UPDATE protocol_steps SET content = 'aspirine' WHERE graph_id = ?1 AND local_id = 2",
                params![graph.id()],
            )
            .unwrap();

        let err = store.load_instance("inst-1").unwrap_err();
        assert!(matches!(err, StoreError::FingerprintMismatch { .. }));
        assert!(err.is_corruption());
    }

    #[test]
    fn test_broken_edges_fail_validation() {
        let mut store = ProtocolStore::open_in_memory().unwrap();
        let (graph, _) = seeded(&mut store, "inst-1");
        let join = &graph.steps()[3];

        // Drop the join's parents and re-sign the result
        store
            .conn
            .execute(
                "UPDATE protocol_steps SET parent_ids = '[]' WHERE id = ?1",
                params![join.id],
            )
            .unwrap();
        let tampered = store.read_graph(graph.id()).unwrap();
        store
            .conn
            .execute(
                "UPDATE protocol_graphs SET fingerprint = ?2 WHERE id = ?1",
                params![graph.id(), fingerprint(&tampered).unwrap()],
            )
            .unwrap();

        let err = store.load_graph(graph.id()).unwrap_err();
        assert!(matches!(err, StoreError::InvalidGraph(_)));
    }

    #[test]
    fn test_duplicate_and_missing_instances() {
        let mut store = ProtocolStore::open_in_memory().unwrap();
        seeded(&mut store, "inst-1");

        let graph = protocol();
        let state = ExecutionEngine::new(&graph).initial_state().unwrap();
        assert!(matches!(
            store.create_instance("inst-1", &graph, &state),
            Err(StoreError::InstanceExists(_))
        ));
        assert!(matches!(
            store.load_instance("nope"),
            Err(StoreError::InstanceNotFound(_))
        ));
        assert!(matches!(
            store.load_graph("nope"),
            Err(StoreError::GraphNotFound(_))
        ));
    }

    #[test]
    fn test_mismatched_state_is_rejected() {
        let mut store = ProtocolStore::open_in_memory().unwrap();
        let graph = protocol();
        let other = protocol();
        let state = ExecutionEngine::new(&other).initial_state().unwrap();
        assert!(matches!(
            store.create_instance("inst-1", &graph, &state),
            Err(StoreError::Corrupted(_))
        ));
        assert!(store.instance_ids().unwrap().is_empty());
    }

    #[test]
    fn test_delete_instance_removes_everything() {
        let mut store = ProtocolStore::open_in_memory().unwrap();
        seeded(&mut store, "inst-1");
        seeded(&mut store, "inst-2");

        assert!(store.delete_instance("inst-1").unwrap());
        assert!(!store.delete_instance("inst-1").unwrap());
        assert_eq!(store.instance_ids().unwrap(), vec!["inst-2".to_string()]);

        let (graphs, steps): (i64, i64) = store
            .conn
            .query_row(
                "SELECT (SELECT COUNT(*) FROM protocol_graphs), (SELECT COUNT(*) FROM protocol_steps)",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(graphs, 1);
        assert_eq!(steps, 4);
    }

    #[test]
    fn test_reopen_file_database() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("data").join("cat.db");

        let (graph, state) = {
            let mut store = ProtocolStore::open(&path).unwrap();
            let (graph, mut state) = seeded(&mut store, "inst-1");
            let engine = ExecutionEngine::new(&graph);
            let root = graph.root_of().unwrap().id.clone();
            engine.resolve_condition(&mut state, &root, 1, "nurse-1").unwrap();
            store.save_state("inst-1", &state, 0).unwrap();
            (graph, state)
        };

        let store = ProtocolStore::open(&path).unwrap();
        let loaded = store.load_instance("inst-1").unwrap();
        assert_eq!(loaded.graph, graph);
        assert_eq!(loaded.state, state);
        assert_eq!(loaded.state.version(), 1);

        // The restored state keeps driving the same graph
        let mut restored = loaded.state;
        let engine = ExecutionEngine::new(&loaded.graph);
        let surveillance = graph.steps()[2].id.clone();
        engine
            .complete_subtask(&mut restored, &surveillance, 0, "nurse-2")
            .unwrap();
        let wait = graph.steps()[3].id.clone();
        engine
            .expire_wait(&mut restored, &wait, WaitSignal::Elapsed, "nurse-2")
            .unwrap();
        assert!(engine.is_complete(&restored));
    }
}
