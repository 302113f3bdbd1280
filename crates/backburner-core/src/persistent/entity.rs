//! Durable task rows and their SQLite access layer.

use std::path::Path;
use std::sync::{Arc, Mutex};

use rand::Rng;
use rusqlite::{Connection, OptionalExtension, Row, params};
use sha2::{Digest, Sha256};
use serde_json::json;
use ulid::Ulid;

use crate::clock::Clock;
use crate::config::Config;
use crate::error::Result;
use crate::hook::{ERROR_KEY, LRT_HOOK_KEY, Params, TID_KEY, TIMEOUT_KEY};

/// Persisted task status. The numeric codes are part of the durable
/// format and must stay stable across versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    Unknown,
    Completed,
    Failed,
    Waiting,
    Queued,
    Running,
}

impl TaskStatus {
    pub fn code(self) -> i64 {
        match self {
            Self::Unknown => 0,
            Self::Completed => 32,
            Self::Failed => 64,
            Self::Waiting => 96,
            Self::Queued => 112,
            Self::Running => 128,
        }
    }

    pub fn from_code(code: i64) -> Self {
        match code {
            32 => Self::Completed,
            64 => Self::Failed,
            96 => Self::Waiting,
            112 => Self::Queued,
            128 => Self::Running,
            _ => Self::Unknown,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the status DAG permits this transition. `rearmable` tasks
    /// (those carrying a stored timeout) may return from Running to
    /// Waiting; nothing leaves a terminal status.
    pub fn can_transition(self, to: TaskStatus, rearmable: bool) -> bool {
        use TaskStatus::*;
        match (self, to) {
            (Waiting, Queued) | (Waiting, Running) | (Queued, Running) => true,
            (Running, Completed) => true,
            (Running, Waiting) => rearmable,
            (Waiting | Queued | Running, Failed) => true,
            _ => false,
        }
    }
}

/// One row of the task table.
///
/// The raw `tid` never reaches its own column; only a fixed-width hash is
/// stored there (SHA-256 hex, 64 chars) and the readable value lives in
/// `params` under the reserved key.
#[derive(Debug, Clone)]
pub struct TaskEntity {
    pub id: String,
    pub tid: String,
    pub name: String,
    pub status: TaskStatus,
    pub hook: String,
    pub params: Params,
    pub time_started: i64,
    pub time_scheduled: i64,
    pub time_updated: i64,
    pub timeout: i64,
}

impl TaskEntity {
    pub fn new(tid: impl Into<String>, hook: impl Into<String>, params: Params) -> Self {
        Self {
            id: Ulid::new().to_string(),
            tid: tid.into(),
            name: String::new(),
            status: TaskStatus::Waiting,
            hook: hook.into(),
            params,
            time_started: 0,
            time_scheduled: 0,
            time_updated: 0,
            timeout: 0,
        }
    }

    /// True for flattened persistent LRT wrappers.
    pub fn is_lrt(&self) -> bool {
        self.params
            .get(LRT_HOOK_KEY)
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(false)
    }

    pub fn is_timeout_set(&self) -> bool {
        self.timeout > 0
    }

    pub fn is_timed_out(&self, now: i64) -> bool {
        self.timeout > 0 && self.timeout < now
    }

    /// Stored re-arm timeout in seconds, if any.
    pub fn rearm_timeout_secs(&self) -> Option<u64> {
        self.params.get(TIMEOUT_KEY).and_then(serde_json::Value::as_u64)
    }

    /// Apply `to` when the status DAG allows it; refused transitions
    /// leave the row untouched.
    pub fn transition_to(&mut self, to: TaskStatus) -> bool {
        let rearmable = self.is_timeout_set() || self.rearm_timeout_secs().is_some();
        if self.status.can_transition(to, rearmable) {
            self.status = to;
            true
        } else {
            false
        }
    }

    /// Record a structured execution error, preserving the first cause.
    pub fn record_error(&mut self, trace: &str) {
        if !self.params.contains_key(ERROR_KEY) {
            self.params.insert(
                ERROR_KEY.to_string(),
                json!({ "type": "exception", "trace": trace }),
            );
        }
    }
}

/// Default row name: the hook's trailing 100 bytes, shortened forward to
/// the nearest char boundary so multi-byte names never split.
fn name_from_hook(hook: &str) -> String {
    let mut tail_start = hook.len().saturating_sub(100);
    while !hook.is_char_boundary(tail_start) {
        tail_start += 1;
    }
    hook[tail_start..].to_string()
}

/// Hash a tid for the indexed column.
pub fn hash_tid(tid: &str) -> String {
    let digest = Sha256::digest(tid.as_bytes());
    let mut out = String::with_capacity(64);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS tasks (
    id             TEXT PRIMARY KEY,
    tid            TEXT NOT NULL DEFAULT '',
    name           TEXT NOT NULL DEFAULT '',
    status         INTEGER NOT NULL DEFAULT 96,
    hook           TEXT NOT NULL DEFAULT '',
    params         TEXT NOT NULL DEFAULT '',
    time_started   INTEGER NOT NULL DEFAULT 0,
    time_scheduled INTEGER NOT NULL DEFAULT 0,
    time_updated   INTEGER NOT NULL DEFAULT 0,
    timeout        INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_tasks_tid ON tasks (tid);
CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks (status);
CREATE INDEX IF NOT EXISTS idx_tasks_time_scheduled ON tasks (time_scheduled);
CREATE INDEX IF NOT EXISTS idx_tasks_time_updated ON tasks (time_updated);
CREATE INDEX IF NOT EXISTS idx_tasks_timeout ON tasks (timeout);
";

/// SQLite-backed storage for [`TaskEntity`] rows.
pub struct TaskDb {
    conn: Mutex<Connection>,
    config: Config,
    clock: Arc<dyn Clock>,
}

impl TaskDb {
    pub fn open(path: impl AsRef<Path>, config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::init(Connection::open(path)?, config, clock)
    }

    pub fn open_in_memory(config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        Self::init(Connection::open_in_memory()?, config, clock)
    }

    fn init(conn: Connection, config: Config, clock: Arc<dyn Clock>) -> Result<Self> {
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            config,
            clock,
        })
    }

    pub(crate) fn now_secs(&self) -> i64 {
        self.clock.now().timestamp()
    }

    /// Upsert a row. Fills in the derived columns: hashed tid, embedded
    /// raw tid, default name (hook tail) and the update timestamp.
    pub fn save(&self, entity: &mut TaskEntity) -> Result<()> {
        entity
            .params
            .insert(TID_KEY.to_string(), json!(entity.tid));
        if entity.name.is_empty() {
            entity.name = name_from_hook(&entity.hook);
        }
        entity.time_updated = self.now_secs();

        let params_json = serde_json::to_string(&entity.params)?;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        conn.execute(
            "INSERT INTO tasks
                 (id, tid, name, status, hook, params,
                  time_started, time_scheduled, time_updated, timeout)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(id) DO UPDATE SET
                 tid = excluded.tid,
                 name = excluded.name,
                 status = excluded.status,
                 hook = excluded.hook,
                 params = excluded.params,
                 time_started = excluded.time_started,
                 time_scheduled = excluded.time_scheduled,
                 time_updated = excluded.time_updated,
                 timeout = excluded.timeout",
            params![
                entity.id,
                hash_tid(&entity.tid),
                entity.name,
                entity.status.code(),
                entity.hook,
                params_json,
                entity.time_started,
                entity.time_scheduled,
                entity.time_updated,
                entity.timeout,
            ],
        )?;
        Ok(())
    }

    /// Load by raw tid. Rows whose timeout has elapsed read as absent.
    pub fn load_tid(&self, tid: &str) -> Result<Option<TaskEntity>> {
        let entity = {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.query_row(
                "SELECT id, tid, name, status, hook, params,
                        time_started, time_scheduled, time_updated, timeout
                 FROM tasks WHERE tid = ?1 LIMIT 1",
                params![hash_tid(tid)],
                map_row,
            )
            .optional()?
        };
        self.finish_load(entity)
    }

    /// Load the next due row: oldest `time_scheduled` among rows in the
    /// given status with a schedule set and no elapsed timeout.
    pub fn load_next(&self, status: TaskStatus) -> Result<Option<TaskEntity>> {
        let now = self.now_secs();
        let entity = {
            let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
            conn.query_row(
                "SELECT id, tid, name, status, hook, params,
                        time_started, time_scheduled, time_updated, timeout
                 FROM tasks
                 WHERE status = ?1 AND time_scheduled > 0
                   AND (timeout = 0 OR timeout >= ?2)
                 ORDER BY time_scheduled ASC LIMIT 1",
                params![status.code(), now],
                map_row,
            )
            .optional()?
        };
        self.finish_load(entity)
    }

    /// Load by row id, bypassing the timeout filter and the archival
    /// sweep; used by the execution context to refresh its row.
    pub fn load_id(&self, id: &str) -> Result<Option<TaskEntity>> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let entity = conn
            .query_row(
                "SELECT id, tid, name, status, hook, params,
                        time_started, time_scheduled, time_updated, timeout
                 FROM tasks WHERE id = ?1",
                params![id],
                map_row,
            )
            .optional()?;
        Ok(entity)
    }

    pub fn delete_tid(&self, tid: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let deleted = conn.execute("DELETE FROM tasks WHERE tid = ?1", params![hash_tid(tid)])?;
        Ok(deleted > 0)
    }

    /// Crash recovery: rows left QUEUED or RUNNING by a dead process go
    /// back to WAITING.
    pub fn reset_stale_running(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let reset = conn.execute(
            "UPDATE tasks SET status = ?1 WHERE status IN (?2, ?3)",
            params![
                TaskStatus::Waiting.code(),
                TaskStatus::Queued.code(),
                TaskStatus::Running.code(),
            ],
        )?;
        Ok(reset)
    }

    fn finish_load(&self, entity: Option<TaskEntity>) -> Result<Option<TaskEntity>> {
        let Some(entity) = entity else {
            return Ok(None);
        };

        let now = self.now_secs();
        self.maybe_archive(now);

        if entity.is_timed_out(now) {
            return Ok(None);
        }
        Ok(Some(entity))
    }

    /// Opportunistic archival: with probability 1/3 and only when no
    /// external maintenance job is configured, drop completed rows older
    /// than the archive window and rows whose timeout elapsed.
    /// Best-effort; failures are logged and never propagated.
    fn maybe_archive(&self, now: i64) {
        if self.config.auto_maintenance {
            return;
        }
        if rand::thread_rng().gen_range(0..3) >= 1 {
            return;
        }

        let archive_cutoff = now - self.config.archive_after.as_secs() as i64;
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let result = conn.execute(
            "DELETE FROM tasks
             WHERE (status = ?1 AND time_scheduled > 0 AND time_scheduled < ?2)
                OR (timeout > 0 AND timeout < ?3)",
            params![TaskStatus::Completed.code(), archive_cutoff, now],
        );
        match result {
            Ok(archived) if archived > 0 => {
                tracing::debug!(archived, "archived stale task rows");
            }
            Ok(_) => {}
            Err(err) => tracing::warn!(%err, "archival sweep failed"),
        }
    }

    #[cfg(test)]
    pub fn count_with_status(&self, status: TaskStatus) -> Result<usize> {
        let conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM tasks WHERE status = ?1",
            params![status.code()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

fn map_row(row: &Row<'_>) -> rusqlite::Result<TaskEntity> {
    let params_text: String = row.get(5)?;
    let params: Params = if params_text.is_empty() {
        Params::new()
    } else {
        serde_json::from_str(&params_text).unwrap_or_default()
    };
    let tid = params
        .get(TID_KEY)
        .and_then(serde_json::Value::as_str)
        .unwrap_or_default()
        .to_string();

    Ok(TaskEntity {
        id: row.get(0)?,
        tid,
        name: row.get(2)?,
        status: TaskStatus::from_code(row.get(3)?),
        hook: row.get(4)?,
        params,
        time_started: row.get(6)?,
        time_scheduled: row.get(7)?,
        time_updated: row.get(8)?,
        timeout: row.get(9)?,
    })
}
