mod helpers;

use grove::index;
use grove::store::records::BulletKind;
use helpers::{table_fingerprint, Project};
use rusqlite::params;

#[test]
fn added_bullet_is_searchable_with_backlink() {
    let project = Project::new();
    let id = project.add("t", "alpha [b-link] beta");
    let mut conn = project.open_rw();
    project.reindex(&mut conn, "t");

    let hits = index::search_keyword(&conn, "alpha", 10).unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].bullet_id, id);

    let backlink: String = conn
        .query_row(
            "SELECT to_slug FROM backlinks WHERE from_id = ?1",
            params![id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(backlink, "b-link");
}

#[test]
fn double_bracket_links_are_extracted_too() {
    let project = Project::new();
    let id = project.add("t", "see [[other-topic]] for details");
    let mut conn = project.open_rw();
    project.reindex(&mut conn, "t");

    let backlink: String = conn
        .query_row(
            "SELECT to_slug FROM backlinks WHERE from_id = ?1",
            params![id],
            |r| r.get(0),
        )
        .unwrap();
    assert_eq!(backlink, "other-topic");
}

#[test]
fn deleted_bullet_vanishes_from_every_projection() {
    let project = Project::new();
    let id = project.add("t", "x");
    let mut conn = project.open_rw();
    project.reindex(&mut conn, "t");

    project.store.update(&id, "y").unwrap();
    project.reindex(&mut conn, "t");
    index::store_embedding(&conn, &id, &[0.5, 0.5], "test-model", "y").unwrap();

    project.store.delete(&id).unwrap();
    project.reindex(&mut conn, "t");

    assert_eq!(
        project.store.get("t").unwrap().unwrap().live_bullets().count(),
        0
    );
    assert!(index::search_keyword(&conn, "y", 10).unwrap().is_empty());
    let embeddings: i64 = conn
        .query_row("SELECT COUNT(*) FROM embeddings WHERE bullet_id = ?1", params![id], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(embeddings, 0);
}

#[test]
fn reindex_twice_leaves_store_unchanged() {
    let project = Project::new();
    project.add("t", "stable [ref-node] content");
    project.add("u", "another node");
    let mut conn = project.open_rw();
    project.reindex_all(&mut conn);

    let before = (
        table_fingerprint(&conn, "bullets", "id, node_slug, kind, text"),
        table_fingerprint(&conn, "backlinks", "from_id, to_slug"),
        table_fingerprint(&conn, "nodes", "slug, title, bullet_count"),
    );

    project.reindex(&mut conn, "t");
    project.reindex(&mut conn, "u");

    let after = (
        table_fingerprint(&conn, "bullets", "id, node_slug, kind, text"),
        table_fingerprint(&conn, "backlinks", "from_id, to_slug"),
        table_fingerprint(&conn, "nodes", "slug, title, bullet_count"),
    );
    assert_eq!(before, after);
}

#[test]
fn rebuild_equals_replay() {
    let project = Project::new();
    let keep = project.add("t", "kept [elsewhere] fact");
    let gone = project.add("t", "doomed fact");
    project.store.update(&keep, "kept [elsewhere] fact v2").unwrap();
    project.store.delete(&gone).unwrap();
    project.store.add("u", "second node", BulletKind::Gotcha).unwrap();

    // Incremental replay path.
    let mut conn = project.open_rw();
    project.reindex(&mut conn, "t");
    project.reindex(&mut conn, "u");
    let replayed = (
        table_fingerprint(&conn, "bullets", "id, node_slug, kind, text"),
        table_fingerprint(&conn, "backlinks", "from_id, to_slug"),
        table_fingerprint(&conn, "nodes", "slug, title, bullet_count"),
    );

    // Seed a budget counter to prove it survives the rebuild.
    conn.execute(
        "INSERT INTO node_budget (slug, served_chars) VALUES ('t', 777.0)",
        [],
    )
    .unwrap();

    // Full rebuild path.
    project.reindex_all(&mut conn);
    let rebuilt = (
        table_fingerprint(&conn, "bullets", "id, node_slug, kind, text"),
        table_fingerprint(&conn, "backlinks", "from_id, to_slug"),
        table_fingerprint(&conn, "nodes", "slug, title, bullet_count"),
    );

    assert_eq!(replayed, rebuilt);
    let budget: f64 = conn
        .query_row("SELECT served_chars FROM node_budget WHERE slug = 't'", [], |r| {
            r.get(0)
        })
        .unwrap();
    assert_eq!(budget, 777.0);
}

#[test]
fn stale_schema_triggers_rebuild_on_open() {
    let project = Project::new();
    project.add("t", "survives the upgrade");
    {
        let mut conn = project.open_rw();
        project.reindex_all(&mut conn);
        conn.execute(
            "UPDATE schema_meta SET value = '1' WHERE key = 'schema_version'",
            [],
        )
        .unwrap();
    }

    let (mut conn, stale) = grove::db::open_rw(&project.db_path).unwrap();
    assert!(stale);
    // The upgrade path is exactly a reindex.
    project.reindex_all(&mut conn);
    assert_eq!(index::search_keyword(&conn, "survives", 10).unwrap().len(), 1);
}
