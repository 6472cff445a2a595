//! SQLite-backed store.
//!
//! Durable storage for task records, the framework id, election state and
//! cluster membership, so a restarted replica resumes the same framework.

use std::path::Path;
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use drover_proto::{AgentId, FrameworkId, TaskId};
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

use super::{ElectionState, NodeRecord, Store, StoreError, TaskRecord};

/// SQLite store.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // Enable WAL mode for better concurrency
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;

        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn().execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS framework (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                framework_id TEXT
            );

            INSERT OR IGNORE INTO framework (id) VALUES (1);

            CREATE TABLE IF NOT EXISTS election (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                term INTEGER NOT NULL,
                role TEXT NOT NULL,
                leader_addr TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS nodes (
                addr TEXT PRIMARY KEY,
                joined_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS tasks (
                task_id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                cpus REAL NOT NULL,
                mem REAL NOT NULL,
                disk REAL NOT NULL,
                ports TEXT NOT NULL,
                image TEXT,
                agent_id TEXT,
                healthy INTEGER NOT NULL,
                status TEXT NOT NULL,
                err_msg TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    fn write_task(&self, task: &TaskRecord, upsert: bool) -> Result<usize, StoreError> {
        let ports = serde_json::to_string(&task.ports)
            .map_err(|e| StoreError::Invalid(format!("ports: {e}")))?;

        let sql = if upsert {
            r#"
            INSERT INTO tasks (task_id, name, cpus, mem, disk, ports, image, agent_id, healthy, status, err_msg, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            ON CONFLICT(task_id) DO UPDATE SET
                name = excluded.name,
                cpus = excluded.cpus,
                mem = excluded.mem,
                disk = excluded.disk,
                ports = excluded.ports,
                image = excluded.image,
                agent_id = excluded.agent_id,
                healthy = excluded.healthy,
                status = excluded.status,
                err_msg = excluded.err_msg,
                updated_at = excluded.updated_at
            "#
        } else {
            r#"
            UPDATE tasks SET name = ?2, cpus = ?3, mem = ?4, disk = ?5, ports = ?6, image = ?7,
                agent_id = ?8, healthy = ?9, status = ?10, err_msg = ?11, updated_at = ?13
            WHERE task_id = ?1
            "#
        };

        let changed = self.conn().execute(
            sql,
            params![
                task.id.as_str(),
                task.name,
                task.cpus,
                task.mem,
                task.disk,
                ports,
                task.image,
                task.agent_id.as_ref().map(|a| a.as_str()),
                task.healthy,
                task.status,
                task.err_msg,
                task.created_at.timestamp_millis(),
                task.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(changed)
    }
}

fn millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

fn invalid(e: impl std::fmt::Display) -> rusqlite::Error {
    rusqlite::Error::ToSqlConversionFailure(e.to_string().into())
}

fn task_from_row(row: &Row<'_>) -> rusqlite::Result<TaskRecord> {
    let id: String = row.get(0)?;
    let ports: String = row.get(5)?;
    let agent_id: Option<String> = row.get(7)?;

    Ok(TaskRecord {
        id: TaskId::parse(&id).map_err(invalid)?,
        name: row.get(1)?,
        cpus: row.get(2)?,
        mem: row.get(3)?,
        disk: row.get(4)?,
        ports: serde_json::from_str(&ports).map_err(invalid)?,
        image: row.get(6)?,
        agent_id: agent_id
            .map(|a| AgentId::parse(&a))
            .transpose()
            .map_err(invalid)?,
        healthy: row.get(8)?,
        status: row.get(9)?,
        err_msg: row.get(10)?,
        created_at: millis(row.get(11)?),
        updated_at: millis(row.get(12)?),
    })
}

impl Store for SqliteStore {
    fn save_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        self.write_task(task, true)?;
        Ok(())
    }

    fn get_task(&self, id: &TaskId) -> Result<Option<TaskRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT task_id, name, cpus, mem, disk, ports, image, agent_id, healthy, status, err_msg, created_at, updated_at
             FROM tasks WHERE task_id = ?1",
        )?;

        stmt.query_row(params![id.as_str()], task_from_row)
            .optional()
            .map_err(Into::into)
    }

    fn update_task(&self, task: &TaskRecord) -> Result<(), StoreError> {
        if self.write_task(task, false)? == 0 {
            return Err(StoreError::NotFound(task.id.to_string()));
        }
        Ok(())
    }

    fn update_framework_id(&self, id: &FrameworkId) -> Result<(), StoreError> {
        self.conn().execute(
            "UPDATE framework SET framework_id = ?1 WHERE id = 1",
            params![id.as_str()],
        )?;
        Ok(())
    }

    fn get_framework_id(&self) -> Result<Option<FrameworkId>, StoreError> {
        let raw: Option<String> = self.conn().query_row(
            "SELECT framework_id FROM framework WHERE id = 1",
            [],
            |row| row.get(0),
        )?;

        raw.map(|s| FrameworkId::parse(&s))
            .transpose()
            .map_err(|e| StoreError::Invalid(format!("framework id: {e}")))
    }

    fn save_raft_state(&self, state: &ElectionState) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO election (id, term, role, leader_addr, updated_at)
            VALUES (1, ?1, ?2, ?3, ?4)
            ON CONFLICT(id) DO UPDATE SET
                term = excluded.term,
                role = excluded.role,
                leader_addr = excluded.leader_addr,
                updated_at = excluded.updated_at
            "#,
            params![
                state.term as i64,
                state.role,
                state.leader_addr,
                state.updated_at.timestamp_millis(),
            ],
        )?;
        Ok(())
    }

    fn get_raft_state(&self) -> Result<Option<ElectionState>, StoreError> {
        self.conn()
            .query_row(
                "SELECT term, role, leader_addr, updated_at FROM election WHERE id = 1",
                [],
                |row| {
                    let term: i64 = row.get(0)?;
                    Ok(ElectionState {
                        term: term.max(0) as u64,
                        role: row.get(1)?,
                        leader_addr: row.get(2)?,
                        updated_at: millis(row.get(3)?),
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    fn add_node(&self, node: &NodeRecord) -> Result<(), StoreError> {
        self.conn().execute(
            r#"
            INSERT INTO nodes (addr, joined_at) VALUES (?1, ?2)
            ON CONFLICT(addr) DO UPDATE SET joined_at = excluded.joined_at
            "#,
            params![node.addr, node.joined_at.timestamp_millis()],
        )?;
        Ok(())
    }

    fn get_nodes(&self) -> Result<Vec<NodeRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn.prepare("SELECT addr, joined_at FROM nodes ORDER BY addr")?;

        let nodes = stmt
            .query_map([], |row| {
                Ok(NodeRecord {
                    addr: row.get(0)?,
                    joined_at: millis(row.get(1)?),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(nodes)
    }
}
