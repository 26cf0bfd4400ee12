//! Served-budget accounting.
//!
//! Every served context accrues character counts against the nodes that
//! contributed. A node whose served-chars-per-live-bullet ratio exceeds
//! the review threshold is flagged — advisory only: it shows up in status
//! output, the review list, and as a ⚠ marker on context headers.
//!
//! Counters live in the derived `node_budget` table, which survives
//! rebuilds; only a `reviewed` record in the node's meta log clears one
//! (applied during reindex).

use anyhow::Result;
use rusqlite::{params, Connection};

use crate::store::records::is_synthetic_slug;

/// A node needing review, worst-first.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ReviewEntry {
    pub slug: String,
    pub served_chars: f64,
    pub live_bullets: i64,
    pub chars_per_bullet: f64,
}

/// Accrue served characters against contributing nodes. Synthetic nodes
/// accrue nothing.
pub fn accrue_served(conn: &Connection, served: &[(String, usize)]) -> Result<()> {
    for (slug, chars) in served {
        if is_synthetic_slug(slug) || *chars == 0 {
            continue;
        }
        conn.execute(
            "INSERT INTO node_budget (slug, served_chars) VALUES (?1, ?2) \
             ON CONFLICT(slug) DO UPDATE SET served_chars = served_chars + ?2",
            params![slug, *chars as f64],
        )?;
    }
    Ok(())
}

/// Current served-budget counter for a node (0 when never served).
pub fn served_budget(conn: &Connection, slug: &str) -> Result<f64> {
    Ok(conn
        .query_row(
            "SELECT served_chars FROM node_budget WHERE slug = ?1",
            params![slug],
            |row| row.get(0),
        )
        .unwrap_or(0.0))
}

/// Nodes over the review threshold, ordered by chars-per-bullet
/// descending. Synthetic nodes never appear.
pub fn review_list(conn: &Connection, threshold: f64, limit: usize) -> Result<Vec<ReviewEntry>> {
    let mut stmt = conn.prepare(
        "SELECT nb.slug, nb.served_chars, COUNT(b.id) AS live \
         FROM node_budget nb \
         LEFT JOIN bullets b ON b.node_slug = nb.slug \
         GROUP BY nb.slug \
         HAVING nb.served_chars / MAX(COUNT(b.id), 1) > ?1 \
         ORDER BY nb.served_chars / MAX(COUNT(b.id), 1) DESC \
         LIMIT ?2",
    )?;
    let entries = stmt
        .query_map(params![threshold, limit as i64], |row| {
            let slug: String = row.get(0)?;
            let served_chars: f64 = row.get(1)?;
            let live_bullets: i64 = row.get(2)?;
            Ok(ReviewEntry {
                slug,
                served_chars,
                live_bullets,
                chars_per_bullet: served_chars / live_bullets.max(1) as f64,
            })
        })?
        .filter_map(|r| r.ok())
        .filter(|e| !is_synthetic_slug(&e.slug))
        .collect();
    Ok(entries)
}

/// Render the review list for CLI and tool output.
pub fn format_review_list(entries: &[ReviewEntry]) -> String {
    if entries.is_empty() {
        return "No nodes need review — graph looks healthy.".into();
    }
    let mut lines = vec![
        format!("{:>12}  {:>10}  {:>7}  Node", "Chars/bullet", "Served", "Bullets"),
        "-".repeat(60),
    ];
    for entry in entries {
        lines.push(format!(
            "{:>12}  {:>10}  {:>7}  [{}]",
            entry.chars_per_bullet as i64,
            entry.served_chars as i64,
            entry.live_bullets,
            entry.slug,
        ));
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seed_node(conn: &Connection, slug: &str, bullets: usize) {
        conn.execute(
            "INSERT INTO nodes (slug, title) VALUES (?1, ?1)",
            params![slug],
        )
        .unwrap();
        for i in 0..bullets {
            conn.execute(
                "INSERT INTO bullets (id, node_slug, kind, text) VALUES (?1, ?2, 'fact', 'x')",
                params![format!("b-{slug}{i}"), slug],
            )
            .unwrap();
        }
    }

    #[test]
    fn accrual_accumulates_across_serves() {
        let conn = crate::db::open_memory().unwrap();
        accrue_served(&conn, &[("t".into(), 100)]).unwrap();
        accrue_served(&conn, &[("t".into(), 150)]).unwrap();
        assert_eq!(served_budget(&conn, "t").unwrap(), 250.0);
        assert_eq!(served_budget(&conn, "never-served").unwrap(), 0.0);
    }

    #[test]
    fn synthetic_nodes_accrue_nothing() {
        let conn = crate::db::open_memory().unwrap();
        accrue_served(&conn, &[("_fleeting-x".into(), 500), ("_doc-y".into(), 500)]).unwrap();
        assert_eq!(served_budget(&conn, "_fleeting-x").unwrap(), 0.0);
        assert_eq!(served_budget(&conn, "_doc-y").unwrap(), 0.0);
    }

    #[test]
    fn review_list_flags_over_threshold_only() {
        let conn = crate::db::open_memory().unwrap();
        // 10000 / 3 ≈ 3333 > 3000 → flagged
        seed_node(&conn, "hot", 3);
        accrue_served(&conn, &[("hot".into(), 10_000)]).unwrap();
        // 5000 / 3 ≈ 1667 < 3000 → not flagged
        seed_node(&conn, "warm", 3);
        accrue_served(&conn, &[("warm".into(), 5_000)]).unwrap();

        let entries = review_list(&conn, 3000.0, 20).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].slug, "hot");
        assert!((entries[0].chars_per_bullet - 10_000.0 / 3.0).abs() < 1.0);
    }

    #[test]
    fn review_list_orders_worst_first() {
        let conn = crate::db::open_memory().unwrap();
        seed_node(&conn, "bad", 1);
        accrue_served(&conn, &[("bad".into(), 5_000)]).unwrap();
        seed_node(&conn, "worse", 1);
        accrue_served(&conn, &[("worse".into(), 9_000)]).unwrap();

        let entries = review_list(&conn, 3000.0, 20).unwrap();
        let slugs: Vec<&str> = entries.iter().map(|e| e.slug.as_str()).collect();
        assert_eq!(slugs, ["worse", "bad"]);
    }

    #[test]
    fn format_handles_empty_and_full() {
        assert!(format_review_list(&[]).contains("healthy"));
        let formatted = format_review_list(&[ReviewEntry {
            slug: "hot".into(),
            served_chars: 10_000.0,
            live_bullets: 3,
            chars_per_bullet: 3333.3,
        }]);
        assert!(formatted.contains("[hot]"));
        assert!(formatted.contains("3333"));
    }
}
