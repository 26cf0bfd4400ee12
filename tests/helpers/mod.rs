#![allow(dead_code)]

use grove::store::records::BulletKind;
use grove::store::RecordStore;
use rusqlite::Connection;
use std::path::PathBuf;
use tempfile::TempDir;

/// A throwaway project: record tree + on-disk derived store.
pub struct Project {
    pub dir: TempDir,
    pub store: RecordStore,
    pub db_path: PathBuf,
}

impl Project {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("nodes"));
        let db_path = dir.path().join("index/graph.db");
        Self {
            dir,
            store,
            db_path,
        }
    }

    /// Open the derived store read-write (creates it on first call).
    pub fn open_rw(&self) -> Connection {
        grove::db::open_rw(&self.db_path).unwrap().0
    }

    pub fn open_ro(&self) -> Connection {
        grove::db::open_readonly(&self.db_path).unwrap()
    }

    /// Add a fact bullet and return its ID.
    pub fn add(&self, slug: &str, text: &str) -> String {
        self.store.add(slug, text, BulletKind::Fact).unwrap().id
    }

    /// Reindex one node into the given connection.
    pub fn reindex(&self, conn: &mut Connection, slug: &str) {
        grove::index::reindex_node(conn, &self.store, slug, "test-model").unwrap();
    }

    /// Reindex every node.
    pub fn reindex_all(&self, conn: &mut Connection) {
        grove::index::reindex_all(conn, &self.store, "test-model").unwrap();
    }
}

/// Store identity keyword breakpoints so raw scores in [0, 6] map straight
/// onto the quantile grid (raw 3.0 → q 0.5, raw 5.0 → q 0.9 …).
pub fn seed_identity_breaks(conn: &Connection, key: &str) {
    conn.execute(
        "INSERT OR REPLACE INTO calibration (key, breaks, bullet_count, updated_at) \
         VALUES (?1, '[0.0,1.0,2.0,3.0,4.0,5.0,6.0]', 0, '2026-01-01T00:00:00Z')",
        [key],
    )
    .unwrap();
}

/// Dump a derived table as sorted text rows, for rebuild-equivalence checks.
pub fn table_fingerprint(conn: &Connection, table: &str, columns: &str) -> Vec<String> {
    let mut stmt = conn
        .prepare(&format!("SELECT {columns} FROM {table}"))
        .unwrap();
    let n = stmt.column_count();
    let mut rows: Vec<String> = stmt
        .query_map([], |row| {
            let mut parts = Vec::with_capacity(n);
            for i in 0..n {
                parts.push(row.get::<_, rusqlite::types::Value>(i).map(|v| format!("{v:?}"))?);
            }
            Ok(parts.join("|"))
        })
        .unwrap()
        .map(|r| r.unwrap())
        .collect();
    rows.sort();
    rows
}
