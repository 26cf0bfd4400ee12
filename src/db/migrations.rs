//! Schema versioning for the derived store.
//!
//! The derived store is a pure projection of the record files, so there is
//! exactly one upgrade path: when the stored version is older than the
//! binary's, the derived tables are dropped and rebuilt from records.

use rusqlite::Connection;

/// Schema version the current binary expects.
pub const CURRENT_SCHEMA_VERSION: u32 = 3;

/// Read the stored schema version (0 if unreadable).
pub fn get_schema_version(conn: &Connection) -> rusqlite::Result<u32> {
    conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'schema_version'",
        [],
        |row| {
            let val: String = row.get(0)?;
            Ok(val.parse::<u32>().unwrap_or(0))
        },
    )
}

/// True when the stored version predates the binary and the derived tables
/// must be rebuilt from records.
pub fn needs_rebuild(conn: &Connection) -> bool {
    match get_schema_version(conn) {
        Ok(version) => version < CURRENT_SCHEMA_VERSION,
        // Missing schema_meta row: treat as stale.
        Err(_) => true,
    }
}

/// Get the stored embedding model identifier, if any.
pub fn get_embedding_model(conn: &Connection) -> rusqlite::Result<Option<String>> {
    match conn.query_row(
        "SELECT value FROM schema_meta WHERE key = 'embedding_model'",
        [],
        |row| row.get::<_, String>(0),
    ) {
        Ok(val) => Ok(Some(val)),
        Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
        Err(e) => Err(e),
    }
}

/// Record the embedding model identifier. Vectors produced by an older
/// model are invalidated lazily via the `model_id` column on each row.
pub fn set_embedding_model(conn: &Connection, model: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO schema_meta (key, value) VALUES ('embedding_model', ?1)",
        [model],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        crate::db::schema::init_schema(&conn).unwrap();
        conn
    }

    #[test]
    fn fresh_db_is_current() {
        let conn = test_db();
        assert_eq!(get_schema_version(&conn).unwrap(), CURRENT_SCHEMA_VERSION);
        assert!(!needs_rebuild(&conn));
    }

    #[test]
    fn old_version_triggers_rebuild() {
        let conn = test_db();
        conn.execute(
            "UPDATE schema_meta SET value = '1' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();
        assert!(needs_rebuild(&conn));
    }

    #[test]
    fn set_and_get_embedding_model() {
        let conn = test_db();
        assert!(get_embedding_model(&conn).unwrap().is_none());
        set_embedding_model(&conn, "fastembed:bge-small-en-v1.5").unwrap();
        assert_eq!(
            get_embedding_model(&conn).unwrap().as_deref(),
            Some("fastembed:bge-small-en-v1.5")
        );
    }
}
