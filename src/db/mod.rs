pub mod migrations;
pub mod schema;

use anyhow::{Context, Result};
use rusqlite::{Connection, OpenFlags};
use std::path::Path;

use crate::error::GroveError;

/// Open (or create) the derived store for writing.
///
/// Returns the connection plus `true` when the stored schema was stale and
/// the derived tables were reset — the caller must replay the records
/// (`Indexer::reindex_all`) before serving queries.
pub fn open_rw(path: impl AsRef<Path>) -> Result<(Connection, bool)> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create directory {}", parent.display()))?;
    }

    // A 0-byte file means a desynchronized WAL (seen on virtiofs mounts).
    // The derived store is rebuildable by definition: drop the corpse and
    // replay the records instead of failing on an opaque PRAGMA error.
    let mut recovered = false;
    if path.exists() && path.metadata().map(|m| m.len() == 0).unwrap_or(false) {
        let notice = GroveError::IndexStale(format!(
            "derived store is empty (0 bytes): {}",
            path.display()
        ));
        eprintln!("grove: {notice} — rebuilding from records");
        let _ = std::fs::remove_file(path);
        for suffix in ["-wal", "-shm"] {
            let mut sibling = path.as_os_str().to_owned();
            sibling.push(suffix);
            let _ = std::fs::remove_file(&sibling);
        }
        recovered = true;
    }

    let conn = Connection::open(path).map_err(|e| {
        GroveError::IndexUnavailable(format!("cannot open {}: {e}", path.display()))
    })?;

    conn.pragma_update(None, "journal_mode", "WAL")?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.pragma_update(None, "busy_timeout", "5000")?;

    let had_tables: bool = conn
        .query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name='schema_meta'",
            [],
            |r| r.get::<_, i64>(0),
        )
        .map(|n| n > 0)
        .unwrap_or(false);

    let stale = had_tables && migrations::needs_rebuild(&conn);
    if stale {
        let notice = GroveError::IndexStale(format!(
            "schema v{} predates v{}",
            migrations::get_schema_version(&conn).unwrap_or(0),
            migrations::CURRENT_SCHEMA_VERSION
        ));
        tracing::warn!(
            path = %path.display(),
            %notice,
            "dropping and rebuilding from records"
        );
        schema::reset_derived_tables(&conn).context("failed to reset derived tables")?;
    } else {
        schema::init_schema(&conn).context("failed to initialize schema")?;
    }

    Ok((conn, stale || recovered))
}

/// Open the derived store read-only — no write lock, safe while the
/// watcher is running. Fails if the file does not exist.
pub fn open_readonly(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(GroveError::IndexUnavailable(format!(
            "derived store not found at {}. Run `grove reindex` first.",
            path.display()
        ))
        .into());
    }
    let conn = Connection::open_with_flags(
        path,
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
    )
    .map_err(|e| GroveError::IndexUnavailable(format!("cannot open {}: {e}", path.display())))?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    Ok(conn)
}

/// Counters for `grove status`.
pub struct HealthReport {
    pub schema_version: u32,
    pub embedding_model: Option<String>,
    pub node_count: i64,
    pub bullet_count: i64,
    pub backlink_count: i64,
    pub embedded_count: i64,
    pub calibrated: bool,
    pub ops_since_calibration: i64,
}

pub fn check_health(conn: &Connection) -> Result<HealthReport> {
    let count = |sql: &str| -> i64 {
        conn.query_row(sql, [], |r| r.get(0)).unwrap_or(0)
    };
    let calibrated = conn
        .query_row("SELECT COUNT(*) FROM calibration", [], |r| r.get::<_, i64>(0))
        .unwrap_or(0)
        > 0;

    Ok(HealthReport {
        schema_version: migrations::get_schema_version(conn).unwrap_or(0),
        embedding_model: migrations::get_embedding_model(conn).unwrap_or(None),
        node_count: count("SELECT COUNT(*) FROM nodes"),
        bullet_count: count("SELECT COUNT(*) FROM bullets"),
        backlink_count: count("SELECT COUNT(*) FROM backlinks"),
        embedded_count: count("SELECT COUNT(*) FROM embeddings"),
        calibrated,
        ops_since_calibration: count("SELECT ops_count FROM calibration_ops WHERE id = 1"),
    })
}

/// Open the store for the budget accountant only.
///
/// The watcher is the sole writer to the projection tables; the serving
/// process additionally accrues `node_budget` counters through this
/// connection, serialized against the watcher by SQLite's own locking.
/// No schema or version logic runs here.
pub fn open_budget_writer(path: impl AsRef<Path>) -> Result<Connection> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(GroveError::IndexUnavailable(format!(
            "derived store not found at {}",
            path.display()
        ))
        .into());
    }
    let conn = Connection::open(path)?;
    conn.pragma_update(None, "busy_timeout", "5000")?;
    Ok(conn)
}

/// Open an in-memory store with schema applied. Test use only.
#[cfg(test)]
pub fn open_memory() -> Result<Connection> {
    let conn = Connection::open_in_memory()?;
    schema::init_schema(&conn)?;
    Ok(conn)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_rw_creates_and_reopens() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("index/graph.db");

        let (conn, stale) = open_rw(&path).unwrap();
        assert!(!stale);
        drop(conn);

        let (_conn, stale) = open_rw(&path).unwrap();
        assert!(!stale, "reopening a current store must not reset it");
    }

    #[test]
    fn open_rw_flags_stale_schema() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.db");

        let (conn, _) = open_rw(&path).unwrap();
        conn.execute(
            "UPDATE schema_meta SET value = '1' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();
        conn.execute("INSERT INTO nodes (slug, title) VALUES ('x', 'x')", [])
            .unwrap();
        drop(conn);

        let (conn, stale) = open_rw(&path).unwrap();
        assert!(stale);
        // Derived rows are gone after the reset.
        let nodes: i64 = conn
            .query_row("SELECT COUNT(*) FROM nodes", [], |r| r.get(0))
            .unwrap();
        assert_eq!(nodes, 0);
    }

    #[test]
    fn open_readonly_requires_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_readonly(dir.path().join("missing.db")).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 3);
    }

    #[test]
    fn zero_byte_file_recovers_as_stale() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("graph.db");
        std::fs::write(&path, b"").unwrap();
        std::fs::write(dir.path().join("graph.db-wal"), b"").unwrap();

        // Corrupt derived state is dropped and reopened fresh; the caller
        // sees stale=true and replays the records.
        let (conn, stale) = open_rw(&path).unwrap();
        assert!(stale);
        assert_eq!(
            migrations::get_schema_version(&conn).unwrap(),
            migrations::CURRENT_SCHEMA_VERSION
        );
    }
}
