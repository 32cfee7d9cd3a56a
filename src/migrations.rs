//! Schema migration framework.
//!
//! Numbered SQL migrations are embedded at compile time via `include_str!`.
//! Each migration runs exactly once, tracked by the `schema_version` table.

use rusqlite::Connection;

struct Migration {
    version: i32,
    sql: &'static str,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: include_str!("migrations/001_baseline.sql"),
    },
    Migration {
        version: 2,
        sql: include_str!("migrations/002_catalog_seed.sql"),
    },
];

/// Create the `schema_version` table if it doesn't exist.
fn ensure_schema_version_table(conn: &Connection) -> Result<(), String> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| format!("Failed to create schema_version table: {}", e))
}

/// Return the highest applied migration version, or 0 if none.
fn current_version(conn: &Connection) -> Result<i32, String> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| format!("Failed to read schema version: {}", e))
}

/// Back up the database before applying migrations.
///
/// Uses SQLite's online backup API to create a hot copy at
/// `<db_path>.pre-migration.bak`. Only called when there are pending migrations.
fn backup_before_migration(conn: &Connection) -> Result<(), String> {
    let db_path: String = conn
        .query_row("PRAGMA database_list", [], |row| row.get(2))
        .map_err(|e| format!("Failed to get database path: {}", e))?;

    if db_path.is_empty() || db_path == ":memory:" {
        // In-memory or temp database — skip backup
        return Ok(());
    }

    let backup_path = format!("{}.pre-migration.bak", db_path);
    let mut backup_conn = rusqlite::Connection::open(&backup_path)
        .map_err(|e| format!("Failed to open backup file: {}", e))?;

    let backup = rusqlite::backup::Backup::new(conn, &mut backup_conn)
        .map_err(|e| format!("Failed to initialize pre-migration backup: {}", e))?;

    backup
        .step(-1)
        .map_err(|e| format!("Pre-migration backup failed: {}", e))?;

    tracing::info!("Pre-migration backup created at {}", backup_path);
    Ok(())
}

/// Run all pending migrations.
///
/// Returns the number of migrations applied (0 if already up-to-date).
///
/// Forward-compat guard: if the database has a higher version than the highest
/// known migration, returns an error telling the operator to update.
pub fn run_migrations(conn: &Connection) -> Result<usize, String> {
    ensure_schema_version_table(conn)?;

    let current = current_version(conn)?;
    let max_known = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    // Forward-compat guard
    if current > max_known {
        return Err(format!(
            "Database schema version ({}) is newer than this build supports ({}). \
             Update mission-control to the latest version.",
            current, max_known
        ));
    }

    let pending: Vec<&Migration> = MIGRATIONS.iter().filter(|m| m.version > current).collect();

    if pending.is_empty() {
        return Ok(0);
    }

    backup_before_migration(conn)?;

    for migration in &pending {
        conn.execute_batch(migration.sql)
            .map_err(|e| format!("Migration v{} failed: {}", migration.version, e))?;

        conn.execute(
            "INSERT INTO schema_version (version) VALUES (?1)",
            [migration.version],
        )
        .map_err(|e| format!("Failed to record migration v{}: {}", migration.version, e))?;

        tracing::info!("Applied migration v{}", migration.version);
    }

    Ok(pending.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;

    fn mem_db() -> Connection {
        Connection::open_in_memory().expect("in-memory db")
    }

    #[test]
    fn fresh_db_applies_baseline() {
        let conn = mem_db();
        let applied = run_migrations(&conn).expect("migrations should succeed");
        assert_eq!(applied, MIGRATIONS.len());

        let version = current_version(&conn).expect("version query");
        assert_eq!(version, MIGRATIONS.last().unwrap().version);

        // Key tables exist and accept rows shaped like the accessors write.
        conn.execute(
            "INSERT INTO tasks (id, owner_id, title, status, task_type, created_at, updated_at)
             VALUES ('t1', 'o1', 'Test task', 'planned', 'task', '2026-01-01T00:00:00Z',
                     '2026-01-01T00:00:00Z')",
            [],
        )
        .expect("tasks table should exist");

        conn.execute(
            "INSERT INTO inbox_items (id, owner_id, dedupe_key, received_at, created_at, updated_at)
             VALUES ('i1', 'o1', 'k1', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z',
                     '2026-01-01T00:00:00Z')",
            [],
        )
        .expect("inbox_items table should exist");

        conn.execute(
            "INSERT INTO calendar_events (id, owner_id, source, external_event_id, start_at,
                                          end_at, content_hash, created_at, updated_at)
             VALUES ('e1', 'o1', 'ical', 'ext1', '2026-01-01T14:00:00Z', '2026-01-01T15:00:00Z',
                     'h1', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .expect("calendar_events table should exist");

        // Catalog seed landed.
        let models: i64 = conn
            .query_row("SELECT COUNT(*) FROM llm_model_catalog", [], |row| {
                row.get(0)
            })
            .expect("catalog query");
        assert!(models >= 4);
    }

    #[test]
    fn inbox_dedupe_key_is_unique_per_owner() {
        let conn = mem_db();
        run_migrations(&conn).unwrap();

        let insert = "INSERT INTO inbox_items
             (id, owner_id, dedupe_key, received_at, created_at, updated_at)
             VALUES (?1, ?2, 'same-key', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z',
                     '2026-01-01T00:00:00Z')";
        conn.execute(insert, ["i1", "o1"]).unwrap();
        assert!(conn.execute(insert, ["i2", "o1"]).is_err());
        // Different owner, same key: fine.
        conn.execute(insert, ["i3", "o2"]).unwrap();
    }

    #[test]
    fn dependency_shape_is_exactly_one_target() {
        let conn = mem_db();
        run_migrations(&conn).unwrap();
        conn.execute(
            "INSERT INTO tasks (id, owner_id, title, created_at, updated_at)
             VALUES ('t1', 'o1', 'T1', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z')",
            [],
        )
        .unwrap();

        // Both targets set → CHECK violation.
        let both = conn.execute(
            "INSERT INTO task_dependencies
             (id, owner_id, task_id, depends_on_task_id, depends_on_commitment_id, created_at)
             VALUES ('d1', 'o1', 't1', 't2', 'c1', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(both.is_err());

        // Neither target set → CHECK violation.
        let neither = conn.execute(
            "INSERT INTO task_dependencies (id, owner_id, task_id, created_at)
             VALUES ('d2', 'o1', 't1', '2026-01-01T00:00:00Z')",
            [],
        );
        assert!(neither.is_err());
    }

    #[test]
    fn forward_compat_guard() {
        let conn = mem_db();
        ensure_schema_version_table(&conn).unwrap();
        conn.execute("INSERT INTO schema_version (version) VALUES (999)", [])
            .unwrap();

        let result = run_migrations(&conn);
        assert!(result.is_err());
        assert!(result.unwrap_err().contains("newer than this build"));
    }

    #[test]
    fn idempotency() {
        let conn = mem_db();
        let total = MIGRATIONS.len();

        let first = run_migrations(&conn).expect("first run");
        assert_eq!(first, total);

        let second = run_migrations(&conn).expect("second run");
        assert_eq!(second, 0, "second run should apply no migrations");
    }
}
