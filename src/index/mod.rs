//! Projection of record files into the derived store.
//!
//! `reindex_node` reads one node's logs, diffs the live bullet set against
//! the stored rows, and emits minimal upserts/deletes into the keyword
//! index, the backlinks table, and the embeddings table (as pending jobs
//! for bullets whose text hash changed). `reindex_all` rebuilds everything
//! from scratch. Exactly one process — the watcher — calls these with a
//! read-write connection.

use anyhow::{Context, Result};
use regex::Regex;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::sync::OnceLock;

use crate::embedding::content_hash;
use crate::store::records::{is_synthetic_slug, title_for_slug};
use crate::store::RecordStore;

/// Cross-reference pattern: `[slug]` or `[[slug]]` in bullet text.
fn link_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[?([a-z0-9][a-z0-9-]*[a-z0-9])\]?\]").unwrap())
}

/// An embedding that must be (re)computed after a reindex.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbedJob {
    pub bullet_id: String,
    pub text: String,
}

/// What changed during a `reindex_node` pass.
#[derive(Debug, Default)]
pub struct ReindexOutcome {
    /// Bullets inserted or updated.
    pub upserted: usize,
    /// Bullets removed (tombstoned or gone from the log).
    pub removed: usize,
    /// Bullets whose stored embedding no longer matches their text.
    pub embed_pending: Vec<EmbedJob>,
}

impl ReindexOutcome {
    pub fn touched(&self) -> usize {
        self.upserted + self.removed
    }
}

/// Re-index a single node: minimal diff against the stored rows.
pub fn reindex_node(
    conn: &mut Connection,
    store: &RecordStore,
    slug: &str,
    model_id: &str,
) -> Result<ReindexOutcome> {
    let node = store.get(slug)?;
    let mut outcome = ReindexOutcome::default();

    let tx = conn.transaction()?;

    let node = match node {
        Some(node) => node,
        None => {
            // Node directory deleted — drop all derived rows for it.
            tx.execute(
                "DELETE FROM backlinks WHERE from_id IN (SELECT id FROM bullets WHERE node_slug = ?1)",
                params![slug],
            )?;
            tx.execute(
                "DELETE FROM embeddings WHERE bullet_id IN (SELECT id FROM bullets WHERE node_slug = ?1)",
                params![slug],
            )?;
            outcome.removed = tx.execute("DELETE FROM bullets WHERE node_slug = ?1", params![slug])?;
            tx.execute("DELETE FROM nodes WHERE slug = ?1", params![slug])?;
            tx.commit()?;
            return Ok(outcome);
        }
    };

    let live: Vec<_> = node.live_bullets().cloned().collect();
    let live_ids: HashSet<&str> = live.iter().map(|b| b.id.as_str()).collect();

    // Stored view: id → (text, useful, harmful)
    let stored: Vec<(String, String, i64, i64)> = {
        let mut stmt =
            tx.prepare("SELECT id, text, useful, harmful FROM bullets WHERE node_slug = ?1")?;
        let rows = stmt
            .query_map(params![slug], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };

    // Deletes: stored rows with no live counterpart.
    for (id, _, _, _) in stored.iter().filter(|(id, ..)| !live_ids.contains(id.as_str())) {
        tx.execute("DELETE FROM bullets WHERE id = ?1", params![id])?;
        tx.execute("DELETE FROM backlinks WHERE from_id = ?1", params![id])?;
        tx.execute("DELETE FROM embeddings WHERE bullet_id = ?1", params![id])?;
        outcome.removed += 1;
    }

    tx.execute(
        "INSERT INTO nodes (slug, title, kind, bullet_count, reviewed_at) VALUES (?1, ?2, ?3, ?4, ?5) \
         ON CONFLICT(slug) DO UPDATE SET title = ?2, bullet_count = ?4, reviewed_at = ?5",
        params![
            slug,
            title_for_slug(slug),
            if slug.starts_with("_doc-") { "doc" } else { "concept" },
            live.len() as i64,
            node.reviewed_at,
        ],
    )?;

    // Upserts: new bullets, changed text, or changed vote tallies.
    for bullet in &live {
        let current = stored.iter().find(|(id, ..)| id == &bullet.id);
        let unchanged = matches!(
            current,
            Some((_, text, useful, harmful))
                if text == &bullet.text && *useful == bullet.useful && *harmful == bullet.harmful
        );
        if unchanged {
            continue;
        }

        tx.execute(
            "INSERT INTO bullets (id, node_slug, kind, text, created_at, updated_at, useful, harmful) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
             ON CONFLICT(id) DO UPDATE SET text = ?4, updated_at = ?6, useful = ?7, harmful = ?8",
            params![
                bullet.id,
                slug,
                bullet.kind.as_str(),
                bullet.text,
                bullet.created_at,
                bullet.updated_at,
                bullet.useful,
                bullet.harmful,
            ],
        )?;

        tx.execute("DELETE FROM backlinks WHERE from_id = ?1", params![bullet.id])?;
        for capture in link_regex().captures_iter(&bullet.text) {
            let target = &capture[1];
            if target != slug {
                tx.execute(
                    "INSERT OR IGNORE INTO backlinks (from_id, to_slug) VALUES (?1, ?2)",
                    params![bullet.id, target],
                )?;
            }
        }
        outcome.upserted += 1;
    }

    // Embedding jobs: live bullets without a vector pinned to their exact
    // text and the current model. File chunks stay keyword-only.
    if !is_synthetic_slug(slug) {
        for bullet in &live {
            let hash = content_hash(&bullet.text);
            let valid: bool = tx
                .query_row(
                    "SELECT content_hash = ?2 AND model_id = ?3 FROM embeddings WHERE bullet_id = ?1",
                    params![bullet.id, hash, model_id],
                    |row| row.get(0),
                )
                .unwrap_or(false);
            if !valid {
                outcome.embed_pending.push(EmbedJob {
                    bullet_id: bullet.id.clone(),
                    text: bullet.text.clone(),
                });
            }
        }
    }

    // A reviewed marker newer than the last budget reset clears the counter.
    // The insert arm records the reset even before any budget accrues, so a
    // marker is only ever applied once.
    if let Some(reviewed_at) = &node.reviewed_at {
        tx.execute(
            "INSERT INTO node_budget (slug, served_chars, cleared_at) VALUES (?1, 0, ?2) \
             ON CONFLICT(slug) DO UPDATE SET served_chars = 0, cleared_at = ?2 \
             WHERE cleared_at IS NULL OR cleared_at < ?2",
            params![slug, reviewed_at],
        )?;
    }

    if outcome.touched() > 0 {
        tx.execute(
            "UPDATE calibration_ops SET ops_count = ops_count + ?1 WHERE id = 1",
            params![outcome.touched() as i64],
        )?;
    }

    tx.commit()?;
    Ok(outcome)
}

/// Full rebuild: drop the derived tables (keeping `node_budget`) and replay
/// every node. Returns the pending embedding jobs across all nodes.
pub fn reindex_all(
    conn: &mut Connection,
    store: &RecordStore,
    model_id: &str,
) -> Result<(usize, Vec<EmbedJob>)> {
    crate::db::schema::reset_derived_tables(conn).context("failed to reset derived tables")?;

    let slugs = store.list_slugs()?;
    let mut jobs = Vec::new();
    for slug in &slugs {
        let outcome = reindex_node(conn, store, slug, model_id)
            .with_context(|| format!("failed to index node {slug}"))?;
        jobs.extend(outcome.embed_pending);
    }
    Ok((slugs.len(), jobs))
}

/// Store a computed vector for a bullet.
pub fn store_embedding(
    conn: &Connection,
    bullet_id: &str,
    vector: &[f32],
    model_id: &str,
    text: &str,
) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO embeddings (bullet_id, vector, dim, content_hash, model_id, updated_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            bullet_id,
            crate::embedding::vec_to_blob(vector),
            vector.len() as i64,
            content_hash(text),
            model_id,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

// ── Keyword search ────────────────────────────────────────────────────────────

/// A keyword hit with its raw score (negated BM25, higher is better).
#[derive(Debug, Clone)]
pub struct KeywordHit {
    pub bullet_id: String,
    pub slug: String,
    pub text: String,
    pub score: f64,
}

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "all", "an", "and", "any", "are", "as", "at", "be", "been", "before",
    "being", "between", "both", "but", "by", "can", "did", "do", "does", "doing", "down", "during",
    "each", "few", "for", "from", "had", "has", "have", "having", "he", "her", "here", "him",
    "his", "how", "if", "in", "into", "is", "it", "its", "just", "me", "more", "most", "my", "no",
    "nor", "not", "now", "of", "off", "on", "once", "only", "or", "other", "our", "out", "over",
    "own", "same", "she", "should", "so", "some", "such", "than", "that", "the", "their", "them",
    "then", "there", "these", "they", "this", "those", "through", "to", "too", "under", "until",
    "up", "very", "was", "we", "were", "what", "when", "where", "which", "while", "who", "why",
    "will", "with", "you", "your",
];

/// Build the OR-expanded FTS5 query: `(t1 OR t1*) (t2 OR t2*) …`.
///
/// Tokenizes on non-alphanumeric boundaries, lowercases, drops tokens
/// shorter than 2 chars and stopwords. Returns `None` when nothing
/// searchable remains.
pub fn build_fts_query(query: &str) -> Option<String> {
    let lower = query.to_lowercase();
    let terms: Vec<&str> = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() >= 2 && !STOPWORDS.contains(t))
        .collect();
    if terms.is_empty() {
        return None;
    }
    let mut seen = HashSet::new();
    let groups: Vec<String> = terms
        .into_iter()
        .filter(|t| seen.insert(*t))
        .map(|t| format!("({t} OR {t}*)"))
        .collect();
    Some(groups.join(" "))
}

/// FTS5 search over bullet text. BM25 rank is negated so higher is better.
pub fn search_keyword(conn: &Connection, query: &str, limit: usize) -> Result<Vec<KeywordHit>> {
    let fts_query = match build_fts_query(query) {
        Some(q) => q,
        None => return Ok(Vec::new()),
    };
    let mut stmt = conn.prepare(
        "SELECT bullet_id, node_slug, text, bm25(bullets_fts) FROM bullets_fts \
         WHERE bullets_fts MATCH ?1 ORDER BY bm25(bullets_fts) LIMIT ?2",
    )?;
    let hits = stmt
        .query_map(params![fts_query, limit as i64], |row| {
            Ok(KeywordHit {
                bullet_id: row.get(0)?,
                slug: row.get(1)?,
                text: row.get(2)?,
                score: -row.get::<_, f64>(3)?,
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(hits)
}

/// Distinct slugs of nodes whose bullets link TO this slug.
pub fn get_backlinks(conn: &Connection, slug: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT b.node_slug FROM backlinks bl \
         JOIN bullets b ON b.id = bl.from_id \
         WHERE bl.to_slug = ?1 ORDER BY b.node_slug",
    )?;
    let slugs = stmt
        .query_map(params![slug], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(slugs)
}
