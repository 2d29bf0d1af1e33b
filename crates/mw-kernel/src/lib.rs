use anyhow::{anyhow, Result};
use rusqlite::{params, params_from_iter, types::Value as SqlValue, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Key of the single liveness row.
pub const HEARTBEAT_KEY: &str = "worker";

#[derive(Clone)]
pub struct Kernel {
    db_path: PathBuf,
    busy: Duration,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct TaskRow {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_channel_id: Option<String>,
    pub task_type: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    pub updated_at: String,
}

/// Fields a mutator supplies when creating or replacing a task row.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(rename_all = "camelCase")]
pub struct TaskUpsert {
    pub id: String,
    #[serde(default)]
    pub source_channel_id: Option<String>,
    pub task_type: String,
    pub status: String,
    #[serde(default)]
    pub last_error: Option<String>,
}

/// Filter for task snapshots. Empty fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskFilter {
    pub task_id: Option<String>,
    pub source_channel_id: Option<String>,
    pub status: Option<String>,
    pub task_type: Option<String>,
    pub limit: u32,
}

/// The single liveness record, timestamps as RFC3339 text.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRow {
    pub last_heartbeat_at: String,
    pub started_at: String,
    pub process_identity: String,
}

impl Kernel {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db_path = dir.join("mirrorwatch.sqlite");
        // Busy timeout (default 5000ms; override with MW_SQLITE_BUSY_MS)
        let busy_ms: u64 = std::env::var("MW_SQLITE_BUSY_MS")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(5000);
        let kernel = Self {
            db_path,
            busy: Duration::from_millis(busy_ms),
        };
        let conn = kernel.conn()?;
        // Pragmas tuned for one writer process plus many readers
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        let _ = conn.pragma_update(None, "temp_store", "MEMORY");
        Self::init_schema(&conn)?;
        tracing::debug!(
            path = %kernel.db_path.display(),
            busy_ms,
            "task store opened"
        );
        Ok(kernel)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS tasks (
              id TEXT PRIMARY KEY,
              source_channel_id TEXT,
              task_type TEXT NOT NULL,
              status TEXT NOT NULL,
              last_error TEXT,
              created TEXT NOT NULL,
              updated TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tasks_channel ON tasks(source_channel_id);
            CREATE INDEX IF NOT EXISTS idx_tasks_status ON tasks(status);
            CREATE INDEX IF NOT EXISTS idx_tasks_updated ON tasks(updated);

            -- Liveness: one row, overwritten in place by the running worker
            CREATE TABLE IF NOT EXISTS worker_heartbeat (
              key TEXT PRIMARY KEY,
              last_heartbeat_at TEXT NOT NULL,
              started_at TEXT NOT NULL,
              process_identity TEXT NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<Connection> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(self.busy)?;
        Ok(conn)
    }

    pub fn upsert_task(&self, task: &TaskUpsert) -> Result<TaskRow> {
        let conn = self.conn()?;
        let now = now_rfc3339();
        conn.execute(
            "INSERT INTO tasks(id,source_channel_id,task_type,status,last_error,created,updated)
             VALUES (?1,?2,?3,?4,?5,?6,?6)
             ON CONFLICT(id) DO UPDATE SET
               source_channel_id=excluded.source_channel_id,
               task_type=excluded.task_type,
               status=excluded.status,
               last_error=excluded.last_error,
               updated=excluded.updated",
            params![
                task.id,
                task.source_channel_id,
                task.task_type,
                task.status,
                task.last_error,
                now,
            ],
        )?;
        Ok(TaskRow {
            id: task.id.clone(),
            source_channel_id: task.source_channel_id.clone(),
            task_type: task.task_type.clone(),
            status: task.status.clone(),
            last_error: task.last_error.clone(),
            updated_at: now,
        })
    }

    /// Update status (and error text) of an existing task. `None` when the id
    /// is unknown.
    pub fn set_task_status(
        &self,
        id: &str,
        status: &str,
        last_error: Option<&str>,
    ) -> Result<Option<TaskRow>> {
        let conn = self.conn()?;
        let n = conn.execute(
            "UPDATE tasks SET status=?, last_error=?, updated=? WHERE id=?",
            params![status, last_error, now_rfc3339(), id],
        )?;
        if n == 0 {
            return Ok(None);
        }
        Self::get_task_with(&conn, id)
    }

    pub fn get_task(&self, id: &str) -> Result<Option<TaskRow>> {
        let conn = self.conn()?;
        Self::get_task_with(&conn, id)
    }

    fn get_task_with(conn: &Connection, id: &str) -> Result<Option<TaskRow>> {
        let row = conn
            .query_row(
                "SELECT id,source_channel_id,task_type,status,last_error,updated FROM tasks WHERE id=?",
                params![id],
                task_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Current tasks matching `filter`, newest update first.
    pub fn list_tasks(&self, filter: &TaskFilter) -> Result<Vec<TaskRow>> {
        let conn = self.conn()?;
        let mut sql = String::from(
            "SELECT id,source_channel_id,task_type,status,last_error,updated FROM tasks",
        );
        let mut clauses: Vec<&str> = Vec::new();
        let mut args: Vec<SqlValue> = Vec::new();
        if let Some(id) = &filter.task_id {
            clauses.push("id=?");
            args.push(SqlValue::Text(id.clone()));
        }
        if let Some(channel) = &filter.source_channel_id {
            clauses.push("source_channel_id=?");
            args.push(SqlValue::Text(channel.clone()));
        }
        if let Some(status) = &filter.status {
            clauses.push("status=?");
            args.push(SqlValue::Text(status.clone()));
        }
        if let Some(kind) = &filter.task_type {
            clauses.push("task_type=?");
            args.push(SqlValue::Text(kind.clone()));
        }
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(" ORDER BY updated DESC, id ASC LIMIT ?");
        args.push(SqlValue::Integer(i64::from(filter.limit)));

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(args.iter()), task_from_row)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Whole-record overwrite of the liveness row.
    pub fn put_heartbeat(&self, hb: &HeartbeatRow) -> Result<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO worker_heartbeat(key,last_heartbeat_at,started_at,process_identity)
             VALUES (?1,?2,?3,?4)
             ON CONFLICT(key) DO UPDATE SET
               last_heartbeat_at=excluded.last_heartbeat_at,
               started_at=excluded.started_at,
               process_identity=excluded.process_identity",
            params![
                HEARTBEAT_KEY,
                hb.last_heartbeat_at,
                hb.started_at,
                hb.process_identity
            ],
        )?;
        Ok(())
    }

    pub fn get_heartbeat(&self) -> Result<Option<HeartbeatRow>> {
        let conn = self.conn()?;
        let row = conn
            .query_row(
                "SELECT last_heartbeat_at,started_at,process_identity FROM worker_heartbeat WHERE key=?",
                params![HEARTBEAT_KEY],
                |r| {
                    Ok(HeartbeatRow {
                        last_heartbeat_at: r.get(0)?,
                        started_at: r.get(1)?,
                        process_identity: r.get(2)?,
                    })
                },
            )
            .optional()?;
        Ok(row)
    }

    // ---------------- Async wrappers (spawn_blocking) ----------------
    // These helpers offload rusqlite work from async executors.

    pub async fn upsert_task_async(&self, task: &TaskUpsert) -> Result<TaskRow> {
        let k = self.clone();
        let task = task.clone();
        tokio::task::spawn_blocking(move || k.upsert_task(&task))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn set_task_status_async(
        &self,
        id: &str,
        status: &str,
        last_error: Option<&str>,
    ) -> Result<Option<TaskRow>> {
        let k = self.clone();
        let id = id.to_string();
        let status = status.to_string();
        let last_error = last_error.map(|s| s.to_string());
        tokio::task::spawn_blocking(move || k.set_task_status(&id, &status, last_error.as_deref()))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn list_tasks_async(&self, filter: &TaskFilter) -> Result<Vec<TaskRow>> {
        let k = self.clone();
        let filter = filter.clone();
        tokio::task::spawn_blocking(move || k.list_tasks(&filter))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn put_heartbeat_async(&self, hb: &HeartbeatRow) -> Result<()> {
        let k = self.clone();
        let hb = hb.clone();
        tokio::task::spawn_blocking(move || k.put_heartbeat(&hb))
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }

    pub async fn get_heartbeat_async(&self) -> Result<Option<HeartbeatRow>> {
        let k = self.clone();
        tokio::task::spawn_blocking(move || k.get_heartbeat())
            .await
            .map_err(|e| anyhow!("join error: {}", e))?
    }
}

fn task_from_row(r: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRow> {
    Ok(TaskRow {
        id: r.get(0)?,
        source_channel_id: r.get(1)?,
        task_type: r.get(2)?,
        status: r.get(3)?,
        last_error: r.get(4)?,
        updated_at: r.get(5)?,
    })
}

fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn task(id: &str, channel: Option<&str>, status: &str) -> TaskUpsert {
        TaskUpsert {
            id: id.into(),
            source_channel_id: channel.map(|s| s.to_string()),
            task_type: "mirror".into(),
            status: status.into(),
            last_error: None,
        }
    }

    #[test]
    fn upsert_replaces_existing_row() {
        let dir = tempdir().unwrap();
        let k = Kernel::open(dir.path()).unwrap();
        k.upsert_task(&task("t1", Some("a"), "queued")).unwrap();
        k.upsert_task(&task("t1", Some("a"), "running")).unwrap();
        let all = k
            .list_tasks(&TaskFilter {
                limit: 10,
                ..TaskFilter::default()
            })
            .unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].status, "running");
    }

    #[test]
    fn list_applies_every_filter_and_limit() {
        let dir = tempdir().unwrap();
        let k = Kernel::open(dir.path()).unwrap();
        k.upsert_task(&task("t1", Some("a"), "running")).unwrap();
        k.upsert_task(&task("t2", Some("a"), "failed")).unwrap();
        k.upsert_task(&task("t3", Some("b"), "running")).unwrap();
        let mut other = task("t4", Some("a"), "running");
        other.task_type = "backfill".into();
        k.upsert_task(&other).unwrap();

        let by_channel = k
            .list_tasks(&TaskFilter {
                source_channel_id: Some("a".into()),
                limit: 10,
                ..TaskFilter::default()
            })
            .unwrap();
        assert_eq!(by_channel.len(), 3);

        let running_mirrors = k
            .list_tasks(&TaskFilter {
                source_channel_id: Some("a".into()),
                status: Some("running".into()),
                task_type: Some("mirror".into()),
                limit: 10,
                ..TaskFilter::default()
            })
            .unwrap();
        assert_eq!(running_mirrors.len(), 1);
        assert_eq!(running_mirrors[0].id, "t1");

        let single = k
            .list_tasks(&TaskFilter {
                task_id: Some("t3".into()),
                limit: 10,
                ..TaskFilter::default()
            })
            .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].source_channel_id.as_deref(), Some("b"));

        let limited = k
            .list_tasks(&TaskFilter {
                limit: 2,
                ..TaskFilter::default()
            })
            .unwrap();
        assert_eq!(limited.len(), 2);
    }

    #[test]
    fn set_status_reports_unknown_ids() {
        let dir = tempdir().unwrap();
        let k = Kernel::open(dir.path()).unwrap();
        assert!(k.set_task_status("missing", "done", None).unwrap().is_none());
        k.upsert_task(&task("t1", None, "running")).unwrap();
        let row = k
            .set_task_status("t1", "failed", Some("upstream 502"))
            .unwrap()
            .expect("row updated");
        assert_eq!(row.status, "failed");
        assert_eq!(row.last_error.as_deref(), Some("upstream 502"));
    }

    #[test]
    fn heartbeat_is_a_single_overwritten_row() {
        let dir = tempdir().unwrap();
        let k = Kernel::open(dir.path()).unwrap();
        assert!(k.get_heartbeat().unwrap().is_none());
        let first = HeartbeatRow {
            last_heartbeat_at: "2025-01-01T00:00:00.000Z".into(),
            started_at: "2025-01-01T00:00:00.000Z".into(),
            process_identity: "host:1".into(),
        };
        k.put_heartbeat(&first).unwrap();
        let second = HeartbeatRow {
            last_heartbeat_at: "2025-01-01T00:00:30.000Z".into(),
            ..first.clone()
        };
        k.put_heartbeat(&second).unwrap();
        assert_eq!(k.get_heartbeat().unwrap(), Some(second));
    }

    #[test]
    fn reopening_keeps_existing_data() {
        let dir = tempdir().unwrap();
        {
            let k = Kernel::open(dir.path()).unwrap();
            k.upsert_task(&task("t1", None, "running")).unwrap();
        }
        let k = Kernel::open(dir.path()).unwrap();
        assert!(k.get_task("t1").unwrap().is_some());
    }

    #[tokio::test]
    async fn async_wrappers_round_trip_through_blocking_pool() {
        let dir = tempdir().unwrap();
        let k = Kernel::open(dir.path()).unwrap();
        k.upsert_task_async(&task("t1", Some("a"), "queued"))
            .await
            .unwrap();
        let rows = k
            .list_tasks_async(&TaskFilter {
                limit: 5,
                ..TaskFilter::default()
            })
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert!(k.get_heartbeat_async().await.unwrap().is_none());
    }
}
