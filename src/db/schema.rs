//! SQL DDL for the derived store.
//!
//! Defines `nodes`, `bullets`, `bullets_fts` (FTS5), `backlinks`,
//! `embeddings`, `node_budget`, `calibration`, `calibration_ops`,
//! `file_sources`, and `schema_meta`. All DDL uses `IF NOT EXISTS` for
//! idempotent initialization. Everything here except `node_budget` is a
//! pure projection of the record files and can be dropped at any time.

use rusqlite::Connection;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS nodes (
    slug TEXT PRIMARY KEY,
    title TEXT NOT NULL,
    kind TEXT NOT NULL DEFAULT 'concept',
    bullet_count INTEGER NOT NULL DEFAULT 0,
    reviewed_at TEXT
);

CREATE TABLE IF NOT EXISTS bullets (
    id TEXT PRIMARY KEY,
    node_slug TEXT NOT NULL REFERENCES nodes(slug) ON DELETE CASCADE,
    kind TEXT NOT NULL,
    text TEXT NOT NULL,
    created_at TEXT,
    updated_at TEXT,
    useful INTEGER NOT NULL DEFAULT 0,
    harmful INTEGER NOT NULL DEFAULT 0
);

CREATE INDEX IF NOT EXISTS idx_bullets_node ON bullets(node_slug);

-- Self-contained FTS5 table (no content= link): stores its own copy of
-- text, node_slug and bullet_id so retrieval never depends on the bullets
-- table's column names.
CREATE VIRTUAL TABLE IF NOT EXISTS bullets_fts USING fts5(
    text,
    node_slug UNINDEXED,
    bullet_id UNINDEXED
);

CREATE TABLE IF NOT EXISTS backlinks (
    from_id TEXT NOT NULL,
    to_slug TEXT NOT NULL,
    PRIMARY KEY (from_id, to_slug)
);

CREATE INDEX IF NOT EXISTS idx_backlinks_to ON backlinks(to_slug);

-- One vector per bullet; content_hash pins the vector to the exact text
-- that produced it.
CREATE TABLE IF NOT EXISTS embeddings (
    bullet_id TEXT PRIMARY KEY,
    vector BLOB NOT NULL,
    dim INTEGER NOT NULL,
    content_hash TEXT NOT NULL,
    model_id TEXT NOT NULL,
    updated_at TEXT
);

-- Served-character counters. Survives rebuilds; only a reviewed record
-- resets a row.
CREATE TABLE IF NOT EXISTS node_budget (
    slug TEXT PRIMARY KEY,
    served_chars REAL NOT NULL DEFAULT 0,
    cleared_at TEXT
);

CREATE TABLE IF NOT EXISTS calibration (
    key TEXT PRIMARY KEY,
    breaks TEXT NOT NULL,
    bullet_count INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS calibration_ops (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    ops_count INTEGER NOT NULL DEFAULT 0
);
INSERT OR IGNORE INTO calibration_ops(id, ops_count) VALUES (1, 0);

CREATE TABLE IF NOT EXISTS file_sources (
    path TEXT PRIMARY KEY,
    content_hash TEXT NOT NULL,
    slug TEXT NOT NULL,
    indexed_at TEXT
);

CREATE TABLE IF NOT EXISTS schema_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

-- FTS sync triggers
CREATE TRIGGER IF NOT EXISTS bullets_ai AFTER INSERT ON bullets BEGIN
    INSERT INTO bullets_fts(rowid, text, node_slug, bullet_id)
    VALUES (new.rowid, new.text, new.node_slug, new.id);
END;
CREATE TRIGGER IF NOT EXISTS bullets_ad AFTER DELETE ON bullets BEGIN
    INSERT INTO bullets_fts(bullets_fts, rowid, text, node_slug, bullet_id)
    VALUES ('delete', old.rowid, old.text, old.node_slug, old.id);
END;
CREATE TRIGGER IF NOT EXISTS bullets_au AFTER UPDATE ON bullets BEGIN
    INSERT INTO bullets_fts(bullets_fts, rowid, text, node_slug, bullet_id)
    VALUES ('delete', old.rowid, old.text, old.node_slug, old.id);
    INSERT INTO bullets_fts(rowid, text, node_slug, bullet_id)
    VALUES (new.rowid, new.text, new.node_slug, new.id);
END;
"#;

/// Initialize all tables. Idempotent (uses IF NOT EXISTS).
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR IGNORE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        [super::migrations::CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}

/// Drop every derived table except `node_budget` and `schema_meta`, then
/// recreate the schema. Used by the stale-schema path and `reindex_all`.
pub fn reset_derived_tables(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        r#"
        DROP TRIGGER IF EXISTS bullets_ai;
        DROP TRIGGER IF EXISTS bullets_ad;
        DROP TRIGGER IF EXISTS bullets_au;
        DROP TABLE IF EXISTS bullets_fts;
        DROP TABLE IF EXISTS embeddings;
        DROP TABLE IF EXISTS backlinks;
        DROP TABLE IF EXISTS bullets;
        DROP TABLE IF EXISTS nodes;
        DROP TABLE IF EXISTS calibration;
        DROP TABLE IF EXISTS calibration_ops;
        DROP TABLE IF EXISTS file_sources;
        "#,
    )?;
    conn.execute_batch(SCHEMA_SQL)?;
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('schema_version', ?1)",
        [super::migrations::CURRENT_SCHEMA_VERSION.to_string()],
    )?;
    Ok(())
}
