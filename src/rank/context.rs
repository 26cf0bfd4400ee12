//! Context packing: ranked candidates → compact text block for LLM
//! injection.
//!
//! Output format:
//! ```text
//! [slug] title ⚠ needs review
//! bullet text ←b-id1 | another bullet ←b-id2
//! ↳ Explore: [other-slug], [third-slug]
//! ```
//!
//! Nodes are ordered by their best candidate, bullets within a node by
//! insertion order, and the whole block is bounded by a character budget.

use anyhow::Result;
use regex::Regex;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeSet;
use std::sync::OnceLock;

use super::hybrid::Candidate;
use crate::store::records::{is_synthetic_slug, title_for_slug};

/// Explore hints per node.
const MAX_EXPLORE: usize = 5;
/// Backlinks considered for explore hints (crossrefs fill the rest).
const MAX_BACKLINKS: usize = 4;

fn crossref_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[\[?([a-z0-9][a-z0-9-]*[a-z0-9])\]?\]").unwrap())
}

#[derive(Debug, Clone)]
pub struct ContextNode {
    pub slug: String,
    pub title: String,
    pub bullets: Vec<(String, String)>,
    pub explore: Vec<String>,
    pub flagged: bool,
}

impl ContextNode {
    pub fn format_compact(&self) -> String {
        let mut header = format!("[{}] {}", self.slug, self.title);
        if self.flagged {
            header.push_str("  ⚠ needs review");
        }
        let body = self
            .bullets
            .iter()
            .map(|(id, text)| format!("{text} ←{id}"))
            .collect::<Vec<_>>()
            .join(" | ");

        let mut lines = vec![header];
        if !body.is_empty() {
            lines.push(body);
        }
        if !self.explore.is_empty() {
            let hints = self
                .explore
                .iter()
                .map(|s| format!("[{s}]"))
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("↳ Explore: {hints}"));
        }
        lines.join("\n")
    }

    pub fn char_count(&self) -> usize {
        self.format_compact().chars().count()
    }
}

#[derive(Debug, Default)]
pub struct PackedContext {
    pub nodes: Vec<ContextNode>,
    pub total_chars: usize,
}

impl PackedContext {
    pub fn format_compact(&self) -> String {
        self.nodes
            .iter()
            .map(ContextNode::format_compact)
            .collect::<Vec<_>>()
            .join("\n\n")
    }

    /// `(slug, chars)` per node, for budget accrual.
    pub fn served_chars(&self) -> Vec<(String, usize)> {
        self.nodes
            .iter()
            .map(|n| (n.slug.clone(), n.char_count()))
            .collect()
    }
}

/// Group ranked candidates by node and pack into the character budget.
///
/// Synthetic `_`-prefixed nodes are skipped. When a node would overflow
/// the budget its bullet list is halved once before giving up on it.
pub fn build_context(
    conn: &Connection,
    candidates: &[Candidate],
    char_budget: usize,
    review_threshold: f64,
) -> Result<PackedContext> {
    // Slugs ordered by their best-ranked candidate.
    let mut slug_order: Vec<&str> = Vec::new();
    for candidate in candidates {
        if is_synthetic_slug(&candidate.slug) {
            continue;
        }
        if !slug_order.contains(&candidate.slug.as_str()) {
            slug_order.push(&candidate.slug);
        }
    }

    let mut packed = PackedContext::default();

    for slug in slug_order {
        if packed.total_chars >= char_budget {
            break;
        }

        let matched: BTreeSet<&str> = candidates
            .iter()
            .filter(|c| c.slug == slug)
            .map(|c| c.bullet_id.as_str())
            .collect();

        // Selected bullets in insertion order.
        let mut stmt =
            conn.prepare("SELECT id, text FROM bullets WHERE node_slug = ?1 ORDER BY rowid")?;
        let bullets: Vec<(String, String)> = stmt
            .query_map(params![slug], |row| {
                Ok((row.get::<usize, String>(0)?, row.get::<usize, String>(1)?))
            })?
            .filter_map(|r| r.ok())
            .filter(|(id, _)| matched.contains(id.as_str()))
            .collect();
        if bullets.is_empty() {
            continue;
        }

        let mut explore: BTreeSet<String> = BTreeSet::new();
        for (_, text) in &bullets {
            for capture in crossref_regex().captures_iter(text) {
                let target = capture[1].to_string();
                if target != slug && !is_synthetic_slug(&target) {
                    explore.insert(target);
                }
            }
        }
        for backlink in crate::index::get_backlinks(conn, slug)?
            .into_iter()
            .take(MAX_BACKLINKS)
        {
            if backlink != slug && !is_synthetic_slug(&backlink) {
                explore.insert(backlink);
            }
        }
        for node in &packed.nodes {
            explore.remove(&node.slug);
        }

        let mut node = ContextNode {
            slug: slug.to_string(),
            title: title_for_slug(slug),
            bullets,
            explore: explore.into_iter().take(MAX_EXPLORE).collect(),
            flagged: is_flagged(conn, slug, review_threshold)?,
        };

        let mut estimated = node.char_count();
        if packed.total_chars + estimated > char_budget && !packed.nodes.is_empty() {
            // Try to fit with fewer bullets before skipping the node.
            let keep = (node.bullets.len() / 2).max(1);
            node.bullets.truncate(keep);
            estimated = node.char_count();
            if packed.total_chars + estimated > char_budget {
                continue;
            }
        }

        packed.total_chars += estimated;
        packed.nodes.push(node);
    }

    Ok(packed)
}

/// Served-budget flag: `served_chars / live_bullets > threshold`.
pub fn is_flagged(conn: &Connection, slug: &str, threshold: f64) -> Result<bool> {
    if is_synthetic_slug(slug) {
        return Ok(false);
    }
    let served: Option<f64> = conn
        .query_row(
            "SELECT served_chars FROM node_budget WHERE slug = ?1",
            params![slug],
            |row| row.get(0),
        )
        .optional()?;
    let served = match served {
        Some(chars) => chars,
        None => return Ok(false),
    };
    let bullets: i64 = conn
        .query_row(
            "SELECT COUNT(*) FROM bullets WHERE node_slug = ?1",
            params![slug],
            |row| row.get(0),
        )
        .optional()?
        .unwrap_or(0);
    Ok(served / bullets.max(1) as f64 > threshold)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, slug: &str, text: &str, score: f64) -> Candidate {
        Candidate {
            bullet_id: id.into(),
            slug: slug.into(),
            text: text.into(),
            q_kw: 0.0,
            q_vec: 0.0,
            score,
        }
    }

    fn seed(conn: &Connection, slug: &str, bullets: &[(&str, &str)]) {
        conn.execute(
            "INSERT OR IGNORE INTO nodes (slug, title) VALUES (?1, ?1)",
            params![slug],
        )
        .unwrap();
        for (id, text) in bullets {
            conn.execute(
                "INSERT INTO bullets (id, node_slug, kind, text) VALUES (?1, ?2, 'fact', ?3)",
                params![id, slug, text],
            )
            .unwrap();
        }
    }

    #[test]
    fn formats_header_bullets_and_explore() {
        let conn = crate::db::open_memory().unwrap();
        seed(&conn, "pg-tips", &[("b-1", "use [indexes-note] wisely"), ("b-2", "vacuum often")]);

        let packed = build_context(
            &conn,
            &[
                candidate("b-1", "pg-tips", "use [indexes-note] wisely", 0.9),
                candidate("b-2", "pg-tips", "vacuum often", 0.8),
            ],
            10_000,
            3000.0,
        )
        .unwrap();

        let text = packed.format_compact();
        assert!(text.starts_with("[pg-tips] pg tips"));
        assert!(text.contains("use [indexes-note] wisely ←b-1 | vacuum often ←b-2"));
        assert!(text.contains("↳ Explore: [indexes-note]"));
    }

    #[test]
    fn synthetic_nodes_are_skipped() {
        let conn = crate::db::open_memory().unwrap();
        seed(&conn, "_fleeting-abc", &[("b-1", "scratch")]);
        seed(&conn, "real", &[("b-2", "keep")]);

        let packed = build_context(
            &conn,
            &[
                candidate("b-1", "_fleeting-abc", "scratch", 0.9),
                candidate("b-2", "real", "keep", 0.5),
            ],
            10_000,
            3000.0,
        )
        .unwrap();
        assert_eq!(packed.nodes.len(), 1);
        assert_eq!(packed.nodes[0].slug, "real");
    }

    #[test]
    fn char_budget_bounds_output() {
        let conn = crate::db::open_memory().unwrap();
        let long = "x".repeat(300);
        seed(&conn, "aa", &[("b-1", long.as_str())]);
        seed(&conn, "bb", &[("b-2", long.as_str())]);
        seed(&conn, "cc", &[("b-3", long.as_str())]);

        let packed = build_context(
            &conn,
            &[
                candidate("b-1", "aa", &long, 0.9),
                candidate("b-2", "bb", &long, 0.8),
                candidate("b-3", "cc", &long, 0.7),
            ],
            700,
            3000.0,
        )
        .unwrap();
        assert!(packed.nodes.len() < 3);
        assert!(packed.total_chars <= 700);
    }

    #[test]
    fn overflowing_node_is_halved_first() {
        let conn = crate::db::open_memory().unwrap();
        seed(&conn, "aa", &[("b-1", "short one")]);
        let medium = "y".repeat(120);
        seed(
            &conn,
            "bb",
            &[("b-2", medium.as_str()), ("b-3", medium.as_str()), ("b-4", medium.as_str())],
        );

        let packed = build_context(
            &conn,
            &[
                candidate("b-1", "aa", "short one", 0.9),
                candidate("b-2", "bb", &medium, 0.8),
                candidate("b-3", "bb", &medium, 0.7),
                candidate("b-4", "bb", &medium, 0.6),
            ],
            300,
            3000.0,
        )
        .unwrap();

        assert_eq!(packed.nodes.len(), 2);
        assert_eq!(packed.nodes[1].bullets.len(), 1, "halved down to one bullet");
    }

    #[test]
    fn flag_threshold_uses_per_bullet_ratio() {
        let conn = crate::db::open_memory().unwrap();
        seed(&conn, "hot", &[("b-1", "a"), ("b-2", "b"), ("b-3", "c")]);
        conn.execute(
            "INSERT INTO node_budget (slug, served_chars) VALUES ('hot', 10000.0)",
            [],
        )
        .unwrap();

        // 10000 / 3 > 3000 → flagged
        assert!(is_flagged(&conn, "hot", 3000.0).unwrap());
        // 10000 / 3 < 4000 → not flagged
        assert!(!is_flagged(&conn, "hot", 4000.0).unwrap());
        assert!(!is_flagged(&conn, "missing", 3000.0).unwrap());
    }
}
