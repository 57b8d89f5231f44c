//! SQLite persistence for label actions and the firehose checkpoint.
//!
//! - [`LabelStore`] - queued label actions and the resume sequence
//! - [`PendingOperations`] - write buffer in front of the store, the
//!   [`LabelSink`] the processor hands its decisions to
//! - [`schema`] - table definitions and migrations

pub mod pending;
pub mod schema;

use std::path::Path;

use async_trait::async_trait;
use labelwatch_core::{LabelAction, LabelOperation};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

pub use pending::{PendingConfig, PendingOperations};

use crate::{Error, Result};

/// Rows per insert transaction.
pub const INSERT_BATCH_SIZE: usize = 100;

/// Receives label decisions for durable storage.
#[async_trait]
pub trait LabelSink: Send + Sync {
    async fn submit(&self, operations: Vec<LabelOperation>) -> Result<()>;
}

/// A label action as stored, with its row id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredAction {
    pub id: i64,
    pub label: String,
    pub action: LabelAction,
    pub subject: String,
    pub comment: Option<String>,
    /// Unix seconds; 0 means due immediately.
    pub scheduled_at: i64,
}

/// SQLite-backed label action queue and checkpoint.
pub struct LabelStore {
    conn: Mutex<Connection>,
}

impl LabelStore {
    /// Open or create the database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        tracing::info!("Opening label store at {}", path.display());

        let conn = Connection::open(path)
            .map_err(|e| Error::Database(format!("Failed to open SQLite: {}", e)))?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| Error::Database(format!("Failed to set PRAGMA: {}", e)))?;

        schema::init_schema(&conn)
            .map_err(|e| Error::Database(format!("Failed to init schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()
            .map_err(|e| Error::Database(format!("Failed to open in-memory SQLite: {}", e)))?;

        schema::init_schema(&conn)
            .map_err(|e| Error::Database(format!("Failed to init schema: {}", e)))?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Insert operations in transactions of [`INSERT_BATCH_SIZE`] rows.
    ///
    /// Batches before a failing one stay committed.
    pub fn insert_operations(&self, operations: &[LabelOperation]) -> Result<usize> {
        let mut conn = self.conn.lock();
        let mut inserted = 0;

        for batch in operations.chunks(INSERT_BATCH_SIZE) {
            let tx = conn.transaction()?;
            {
                let mut stmt = tx.prepare_cached(
                    "INSERT INTO label_actions (label, action, subject, comment, scheduled_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                )?;
                for op in batch {
                    stmt.execute(params![
                        op.label,
                        op.action.as_str(),
                        op.subject,
                        op.comment,
                        op.scheduled_at
                    ])?;
                }
            }
            tx.commit()?;
            inserted += batch.len();
            tracing::debug!("Inserted {} label actions", batch.len());
        }

        Ok(inserted)
    }

    /// Actions due at `now_secs`, oldest first.
    pub fn due_actions(&self, now_secs: i64, limit: usize) -> Result<Vec<StoredAction>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "SELECT id, label, action, subject, comment, scheduled_at
             FROM label_actions
             WHERE scheduled_at <= ?1
             ORDER BY id
             LIMIT ?2",
        )?;

        let rows = stmt
            .query_map(params![now_secs, limit as i64], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, Option<String>>(4)?,
                    row.get::<_, i64>(5)?,
                ))
            })?
            .filter_map(|r| r.ok());

        let mut actions = Vec::new();
        for (id, label, action, subject, comment, scheduled_at) in rows {
            let Some(action) = LabelAction::parse(&action) else {
                tracing::warn!("Skipping label action {} with unknown action {:?}", id, action);
                continue;
            };
            actions.push(StoredAction {
                id,
                label,
                action,
                subject,
                comment,
                scheduled_at,
            });
        }
        Ok(actions)
    }

    /// Delete actions by id. Returns the number of rows removed.
    pub fn delete_actions(&self, ids: &[i64]) -> Result<usize> {
        if ids.is_empty() {
            return Ok(0);
        }
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut deleted = 0;
        {
            let mut stmt = tx.prepare_cached("DELETE FROM label_actions WHERE id = ?1")?;
            for id in ids {
                deleted += stmt.execute([id])?;
            }
        }
        tx.commit()?;
        Ok(deleted)
    }

    /// Number of stored actions, due or not.
    pub fn action_count(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM label_actions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    /// Last checkpointed firehose sequence, `None` on a fresh database.
    pub fn last_sequence(&self) -> Result<Option<i64>> {
        let conn = self.conn.lock();
        let value: Option<i64> = conn
            .query_row(
                "SELECT last_sequence FROM subscription_checkpoint WHERE id = 1",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.filter(|seq| *seq >= 0))
    }

    /// Record a checkpoint. The stored value never decreases.
    pub fn update_last_sequence(&self, sequence: i64) -> Result<()> {
        let now = chrono::Utc::now().timestamp();
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO subscription_checkpoint (id, last_sequence, updated_at)
             VALUES (1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET
                last_sequence = MAX(last_sequence, excluded.last_sequence),
                updated_at = excluded.updated_at",
            params![sequence, now],
        )
        .map_err(|e| Error::Database(format!("Failed to update checkpoint: {}", e)))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(label: &str, action: LabelAction, subject: &str, scheduled_at: i64) -> LabelOperation {
        LabelOperation {
            label: label.to_string(),
            action,
            subject: subject.to_string(),
            comment: Some(format!("{} {}", action.as_str(), label)),
            scheduled_at,
        }
    }

    #[test]
    fn test_insert_and_read_due() {
        let store = LabelStore::open_in_memory().unwrap();
        let ops = vec![
            op("noavatar", LabelAction::Create, "did:plc:a", 0),
            op("rapidposts", LabelAction::Remove, "did:plc:b", 100),
            op("newaccount", LabelAction::Create, "did:plc:c", 5_000),
        ];
        assert_eq!(store.insert_operations(&ops).unwrap(), 3);

        let due = store.due_actions(1_000, 10).unwrap();
        assert_eq!(due.len(), 2);
        assert_eq!(due[0].label, "noavatar");
        assert_eq!(due[0].action, LabelAction::Create);
        assert_eq!(due[1].subject, "did:plc:b");
        assert_eq!(due[1].action, LabelAction::Remove);
        assert_eq!(due[1].comment.as_deref(), Some("remove rapidposts"));

        assert_eq!(store.due_actions(1_000, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_insert_spans_batches() {
        let store = LabelStore::open_in_memory().unwrap();
        let ops: Vec<_> = (0..250)
            .map(|i| op("noavatar", LabelAction::Create, &format!("did:plc:{}", i), 0))
            .collect();
        assert_eq!(store.insert_operations(&ops).unwrap(), 250);
        assert_eq!(store.action_count().unwrap(), 250);
    }

    #[test]
    fn test_delete_actions() {
        let store = LabelStore::open_in_memory().unwrap();
        store
            .insert_operations(&[
                op("noavatar", LabelAction::Create, "did:plc:a", 0),
                op("nodisplayname", LabelAction::Create, "did:plc:a", 0),
            ])
            .unwrap();
        let due = store.due_actions(0, 10).unwrap();

        assert_eq!(store.delete_actions(&[due[0].id, 9_999]).unwrap(), 1);
        assert_eq!(store.delete_actions(&[]).unwrap(), 0);
        let remaining = store.due_actions(0, 10).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].label, "nodisplayname");
    }

    #[test]
    fn test_checkpoint_fresh_db() {
        let store = LabelStore::open_in_memory().unwrap();
        assert_eq!(store.last_sequence().unwrap(), None);
    }

    #[test]
    fn test_checkpoint_never_regresses() {
        let store = LabelStore::open_in_memory().unwrap();
        store.update_last_sequence(500).unwrap();
        assert_eq!(store.last_sequence().unwrap(), Some(500));

        store.update_last_sequence(400).unwrap();
        assert_eq!(store.last_sequence().unwrap(), Some(500));

        store.update_last_sequence(600).unwrap();
        assert_eq!(store.last_sequence().unwrap(), Some(600));
    }

    #[test]
    fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("labels.db");

        {
            let store = LabelStore::open(&path).unwrap();
            store.update_last_sequence(42).unwrap();
            store
                .insert_operations(&[op("noavatar", LabelAction::Create, "did:plc:a", 0)])
                .unwrap();
        }

        let store = LabelStore::open(&path).unwrap();
        assert_eq!(store.last_sequence().unwrap(), Some(42));
        assert_eq!(store.action_count().unwrap(), 1);
    }
}
