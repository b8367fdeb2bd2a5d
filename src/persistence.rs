//! Embedded database: classification records and the prompt registry,
//! opened in WAL mode on a single connection owned by the guard.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rusqlite::Connection;
use tokio::sync::Mutex;

use crate::error::PersistenceError;

const COMMIT_BATCH_SIZE: u32 = 10;
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Clone)]
pub struct ClassificationRecord {
    pub message_id: Option<String>,
    pub from_node: String,
    pub tier: String,
    pub action: String,
    pub reasoning: String,
    pub prompt_hash: String,
    pub wall_ms: u64,
    pub session_id: Option<String>,
    pub created_at: f64,
    pub ttl_expires: f64,
}

#[derive(Debug, Clone)]
pub struct PromptRecord {
    pub name: String,
    pub content: String,
    pub hash: String,
    pub pushed_by: String,
    pub pushed_at: f64,
    pub active: bool,
}

fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS thrall_classifications (
            rowid        INTEGER PRIMARY KEY AUTOINCREMENT,
            message_id   TEXT,
            from_node    TEXT NOT NULL,
            tier         TEXT NOT NULL,
            action       TEXT NOT NULL,
            reasoning    TEXT NOT NULL,
            prompt_hash  TEXT NOT NULL,
            wall_ms      INTEGER NOT NULL,
            session_id   TEXT,
            created_at   REAL NOT NULL,
            ttl_expires  REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_tc_from_node ON thrall_classifications(from_node);
        CREATE INDEX IF NOT EXISTS idx_tc_action ON thrall_classifications(action);
        CREATE INDEX IF NOT EXISTS idx_tc_ttl_expires ON thrall_classifications(ttl_expires);
        CREATE INDEX IF NOT EXISTS idx_tc_node_action_ts
            ON thrall_classifications(from_node, action, created_at);

        CREATE TABLE IF NOT EXISTS thrall_prompts (
            name       TEXT PRIMARY KEY,
            content    TEXT NOT NULL,
            hash       TEXT NOT NULL,
            pushed_by  TEXT NOT NULL,
            pushed_at  REAL NOT NULL,
            active     INTEGER NOT NULL DEFAULT 0
        );
        ",
    )
}

/// Owns the single SQLite connection plus the shutdown/batch-commit
/// bookkeeping. Only the guard's cooperative context touches this; the
/// admin surface is handed a clone of the same `Arc` so writes never
/// race across two connections.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
    pending_writes: u32,
    shutting_down: Arc<AtomicBool>,
    in_flight: Arc<AtomicU32>,
}

impl Store {
    /// Open (or create) the database file at `path`, enabling WAL mode
    /// and running schema migrations before the connection is ever
    /// shared across an await boundary.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            pending_writes: 0,
            shutting_down: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn open_in_memory() -> Result<Self, PersistenceError> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            pending_writes: 0,
            shutting_down: Arc::new(AtomicBool::new(false)),
            in_flight: Arc::new(AtomicU32::new(0)),
        })
    }

    pub fn default_path(plugin_dir: impl AsRef<Path>) -> PathBuf {
        plugin_dir.as_ref().join("thrall.db")
    }

    /// Fallback plugin directory for hosts that don't configure one
    /// explicitly: `<platform data dir>/thrall`.
    pub fn default_plugin_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("thrall")
    }

    /// Increment the in-flight counter around a triage call. Returns a
    /// guard that decrements on drop.
    pub fn enter_in_flight(&self) -> InFlightGuard {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlightGuard {
            counter: self.in_flight.clone(),
        }
    }

    fn rejected_if_shutting_down(&self) -> Result<(), PersistenceError> {
        if self.shutting_down.load(Ordering::SeqCst) {
            Err(PersistenceError::ShuttingDown)
        } else {
            Ok(())
        }
    }

    /// Insert a classification record. A no-op once shutdown has
    /// begun. Commits immediately once the pending-write count reaches
    /// [`COMMIT_BATCH_SIZE`]; otherwise the write relies on the next
    /// periodic [`flush`](Self::flush) or prune tick.
    pub async fn insert_classification(
        &mut self,
        record: &ClassificationRecord,
    ) -> Result<(), PersistenceError> {
        self.rejected_if_shutting_down()?;

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO thrall_classifications
                (message_id, from_node, tier, action, reasoning, prompt_hash, wall_ms, session_id, created_at, ttl_expires)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            rusqlite::params![
                record.message_id,
                record.from_node,
                record.tier,
                record.action,
                record.reasoning,
                record.prompt_hash,
                record.wall_ms,
                record.session_id,
                record.created_at,
                record.ttl_expires,
            ],
        )?;
        drop(conn);

        self.pending_writes += 1;
        if self.pending_writes >= COMMIT_BATCH_SIZE {
            self.flush().await?;
        }
        Ok(())
    }

    /// Resets the pending-write counter. SQLite in non-transactional
    /// `execute` calls auto-commits per statement, so this mainly
    /// tracks the batching cadence rather than issuing an explicit
    /// `COMMIT`; kept as an explicit step so a future switch to
    /// explicit transactions is a localized change.
    pub async fn flush(&mut self) -> Result<(), PersistenceError> {
        self.pending_writes = 0;
        Ok(())
    }

    /// Count drops for `from_node` within the last hour, via the
    /// indexed `(from_node, action, created_at)` path. Never uses
    /// `LIKE` with caller-controlled input.
    pub async fn count_recent_drops(&self, from_node: &str, since: f64) -> Result<u32, PersistenceError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM thrall_classifications
             WHERE from_node = ?1 AND action = 'drop' AND created_at >= ?2",
            rusqlite::params![from_node, since],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Count all classification rows recorded for `from_node`,
    /// regardless of action. Used by tests and admin inspection.
    pub async fn count_classifications_for_node(&self, from_node: &str) -> Result<u32, PersistenceError> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM thrall_classifications WHERE from_node = ?1",
            rusqlite::params![from_node],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// Delete classification rows past their TTL. Part of the periodic
    /// prune cycle.
    pub async fn prune_expired_classifications(&self, now: f64) -> Result<usize, PersistenceError> {
        let conn = self.conn.lock().await;
        let deleted = conn.execute(
            "DELETE FROM thrall_classifications WHERE ttl_expires < ?1",
            rusqlite::params![now],
        )?;
        Ok(deleted)
    }

    pub async fn upsert_prompt(&self, record: &PromptRecord) -> Result<(), PersistenceError> {
        self.rejected_if_shutting_down()?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO thrall_prompts (name, content, hash, pushed_by, pushed_at, active)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(name) DO UPDATE SET
                content = excluded.content,
                hash = excluded.hash,
                pushed_by = excluded.pushed_by,
                pushed_at = excluded.pushed_at,
                active = excluded.active",
            rusqlite::params![
                record.name,
                record.content,
                record.hash,
                record.pushed_by,
                record.pushed_at,
                record.active as i64,
            ],
        )?;
        Ok(())
    }

    /// Mark exactly one other prompt inactive and this one active,
    /// preserving the "at most one active `triage` prompt" invariant.
    pub async fn activate_prompt(&self, name: &str) -> Result<(), PersistenceError> {
        self.rejected_if_shutting_down()?;
        let conn = self.conn.lock().await;
        conn.execute("UPDATE thrall_prompts SET active = 0", [])?;
        conn.execute(
            "UPDATE thrall_prompts SET active = 1 WHERE name = ?1",
            rusqlite::params![name],
        )?;
        Ok(())
    }

    pub async fn get_prompt(&self, name: &str) -> Result<Option<PromptRecord>, PersistenceError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name, content, hash, pushed_by, pushed_at, active FROM thrall_prompts WHERE name = ?1",
        )?;
        let mut rows = stmt.query(rusqlite::params![name])?;
        if let Some(row) = rows.next()? {
            Ok(Some(PromptRecord {
                name: row.get(0)?,
                content: row.get(1)?,
                hash: row.get(2)?,
                pushed_by: row.get(3)?,
                pushed_at: row.get(4)?,
                active: row.get::<_, i64>(5)? != 0,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn get_active_prompt(&self, name: &str) -> Result<Option<PromptRecord>, PersistenceError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name, content, hash, pushed_by, pushed_at, active FROM thrall_prompts
             WHERE name = ?1 AND active = 1",
        )?;
        let mut rows = stmt.query(rusqlite::params![name])?;
        if let Some(row) = rows.next()? {
            Ok(Some(PromptRecord {
                name: row.get(0)?,
                content: row.get(1)?,
                hash: row.get(2)?,
                pushed_by: row.get(3)?,
                pushed_at: row.get(4)?,
                active: row.get::<_, i64>(5)? != 0,
            }))
        } else {
            Ok(None)
        }
    }

    pub async fn list_prompts(&self) -> Result<Vec<PromptRecord>, PersistenceError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name, content, hash, pushed_by, pushed_at, active FROM thrall_prompts ORDER BY name",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(PromptRecord {
                name: row.get(0)?,
                content: row.get(1)?,
                hash: row.get(2)?,
                pushed_by: row.get(3)?,
                pushed_at: row.get(4)?,
                active: row.get::<_, i64>(5)? != 0,
            })
        })?;
        let mut out = Vec::new();
        for r in rows {
            out.push(r?);
        }
        Ok(out)
    }

    /// Sets the shutdown latch, waits up to 15 s for in-flight triage
    /// calls to drain, then flushes pending writes. Writes attempted
    /// after this returns are rejected with
    /// [`PersistenceError::ShuttingDown`].
    pub async fn shutdown(&mut self) -> Result<(), PersistenceError> {
        self.shutting_down.store(true, Ordering::SeqCst);
        let deadline = Instant::now() + SHUTDOWN_DRAIN_TIMEOUT;
        while self.in_flight.load(Ordering::SeqCst) > 0 && Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        self.flush().await
    }
}

/// RAII decrement for [`Store::enter_in_flight`].
pub struct InFlightGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record(from_node: &str, action: &str, created_at: f64) -> ClassificationRecord {
        ClassificationRecord {
            message_id: Some("m1".into()),
            from_node: from_node.to_string(),
            tier: "unknown".into(),
            action: action.to_string(),
            reasoning: "test".into(),
            prompt_hash: "0123456789abcdef".into(),
            wall_ms: 5,
            session_id: None,
            created_at,
            ttl_expires: created_at + 3600.0,
        }
    }

    #[tokio::test]
    async fn insert_then_count_recent_drops() {
        let mut store = Store::open_in_memory().unwrap();
        for _ in 0..15 {
            store
                .insert_classification(&sample_record("aaaaaaaaaaaaaaaa", "drop", 1000.0))
                .await
                .unwrap();
        }
        let count = store.count_recent_drops("aaaaaaaaaaaaaaaa", 0.0).await.unwrap();
        assert_eq!(count, 15);
    }

    #[tokio::test]
    async fn prune_removes_expired_rows_only() {
        let mut store = Store::open_in_memory().unwrap();
        store
            .insert_classification(&sample_record("bbbbbbbbbbbbbbbb", "wake", 1.0))
            .await
            .unwrap();
        store
            .insert_classification(&ClassificationRecord {
                ttl_expires: 100_000.0,
                ..sample_record("cccccccccccccccc", "wake", 1.0)
            })
            .await
            .unwrap();

        let deleted = store.prune_expired_classifications(50.0).await.unwrap();
        assert_eq!(deleted, 1);
    }

    #[tokio::test]
    async fn prompt_upsert_and_single_active_invariant() {
        let store = Store::open_in_memory().unwrap();
        store
            .upsert_prompt(&PromptRecord {
                name: "triage".into(),
                content: "hi {tier}".into(),
                hash: "abc".into(),
                pushed_by: "hardcoded".into(),
                pushed_at: 1.0,
                active: true,
            })
            .await
            .unwrap();
        store
            .upsert_prompt(&PromptRecord {
                name: "alt".into(),
                content: "alt {tier}".into(),
                hash: "def".into(),
                pushed_by: "op".into(),
                pushed_at: 2.0,
                active: false,
            })
            .await
            .unwrap();

        store.activate_prompt("alt").await.unwrap();

        let active = store.get_active_prompt("alt").await.unwrap().unwrap();
        assert!(active.active);
        let triage = store.get_prompt("triage").await.unwrap().unwrap();
        assert!(!triage.active);
    }

    #[tokio::test]
    async fn shutdown_rejects_subsequent_writes() {
        let mut store = Store::open_in_memory().unwrap();
        store.shutdown().await.unwrap();
        let err = store
            .insert_classification(&sample_record("dddddddddddddddd", "wake", 1.0))
            .await
            .unwrap_err();
        assert!(matches!(err, PersistenceError::ShuttingDown));
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_before_returning() {
        let store = Store::open_in_memory().unwrap();
        let guard = store.enter_in_flight();
        let shutting_down = store.shutting_down.clone();
        let in_flight = store.in_flight.clone();

        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            drop(guard);
        });

        shutting_down.store(true, Ordering::SeqCst);
        while in_flight.load(Ordering::SeqCst) > 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        handle.await.unwrap();
        assert_eq!(in_flight.load(Ordering::SeqCst), 0);
    }
}
