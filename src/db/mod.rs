//! SQLite-backed store facade.
//!
//! One `Store` wraps one `rusqlite::Connection`. Request handlers and
//! background work each open their own handle against the same WAL-mode
//! database file; the schema is migrated once at startup. Accessors are
//! split across the files in this module (`impl Store` + `use super::*`),
//! grouped by entity.
//!
//! Every owner-scoped accessor takes `owner_id` and filters by it. A miss
//! on a row owned by someone else is indistinguishable from a miss on a
//! row that never existed.

use std::path::Path;

use chrono::{SecondsFormat, Utc};
use rusqlite::Connection;

pub mod types;
pub use types::*;

mod applications;
mod calendar;
mod focus;
mod inbox;
mod llm;
mod plans;
mod tasks;

pub use applications::ApplicationPatch;
pub use calendar::IngestEvent;
pub use focus::{DirectivePatch, NewDirective};
pub use inbox::NewInboxItem;
pub use llm::UsageEventInput;
pub use tasks::{NewTask, TaskFilter, TaskPatch};

pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path`, apply WAL mode and run all
    /// pending migrations. Call once at startup.
    pub fn open_and_migrate(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                std::fs::create_dir_all(parent).map_err(StoreError::CreateDir)?;
            }
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL;")?;
        crate::migrations::run_migrations(&conn).map_err(StoreError::Migration)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    /// Open a handle against an already-migrated database. Used per request;
    /// WAL mode allows concurrent readers alongside one writer.
    pub fn open_existing(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    /// In-memory store with the full schema. Test-only convenience.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        crate::migrations::run_migrations(&conn).map_err(StoreError::Migration)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        Ok(Self { conn })
    }

    /// In-memory store with NO schema. Lets tests exercise the
    /// missing-relation degradation paths.
    pub fn open_unmigrated() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Ok(Self { conn })
    }

    /// Borrow the underlying connection for ad-hoc queries.
    pub fn conn_ref(&self) -> &Connection {
        &self.conn
    }

    /// Execute a closure within a SQLite transaction.
    /// Commits on Ok, rolls back on Err.
    pub fn with_transaction<F, T>(&self, f: F) -> Result<T, StoreError>
    where
        F: FnOnce(&Self) -> Result<T, StoreError>,
    {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        match f(self) {
            Ok(val) => {
                self.conn.execute_batch("COMMIT")?;
                Ok(val)
            }
            Err(e) => {
                let _ = self.conn.execute_batch("ROLLBACK");
                Err(e)
            }
        }
    }

    // -----------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------

    pub fn create_session(&self, token: &str, owner_id: &str) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO sessions (token, owner_id, created_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![token, owner_id, now_iso()],
        )?;
        Ok(())
    }

    pub fn owner_for_session(&self, token: &str) -> Result<Option<String>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT owner_id FROM sessions WHERE token = ?1")?;
        let mut rows = stmt.query_map([token], |row| row.get::<_, String>(0))?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }
}

/// UTC now as `2026-08-01T12:00:00Z`. One format everywhere so string
/// comparisons in SQL order correctly.
pub(crate) fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transaction_rolls_back_on_error() {
        let store = Store::open_in_memory().unwrap();
        let result: Result<(), StoreError> = store.with_transaction(|s| {
            s.conn_ref().execute(
                "INSERT INTO sessions (token, owner_id, created_at) VALUES ('t', 'o', 'now')",
                [],
            )?;
            Err(StoreError::Conflict("boom".into()))
        });
        assert!(result.is_err());

        let count: i64 = store
            .conn_ref()
            .query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn session_round_trip() {
        let store = Store::open_in_memory().unwrap();
        store.create_session("tok-1", "owner-1").unwrap();
        assert_eq!(
            store.owner_for_session("tok-1").unwrap().as_deref(),
            Some("owner-1")
        );
        assert_eq!(store.owner_for_session("tok-2").unwrap(), None);
    }

    #[test]
    fn unmigrated_store_reports_missing_relation() {
        let store = Store::open_unmigrated().unwrap();
        let err = store.owner_for_session("x").unwrap_err();
        assert!(err.is_missing_relation());
    }
}
