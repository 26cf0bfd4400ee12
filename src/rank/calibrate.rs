//! Quantile calibration: makes keyword BM25 and vector cosine comparable.
//!
//! Samples the graph, runs both search channels with the samples as
//! queries, and stores percentile breakpoints per score channel. At query
//! time a raw score maps to a quantile in [0, 1] by binary search over the
//! breakpoints with linear interpolation between neighbors.

use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};

/// Percentile positions of the stored breakpoints.
pub const QUANTILE_POINTS: [f64; 7] = [0.0, 0.10, 0.25, 0.50, 0.75, 0.90, 1.0];

/// Default number of sampled nodes.
pub const DEFAULT_SAMPLE_SIZE: usize = 200;

pub const KEY_FTS: &str = "fts";
pub const KEY_VECTOR: &str = "vector";

/// What a calibration pass touched, for status output.
#[derive(Debug, Default)]
pub struct CalibrationReport {
    pub sampled: usize,
    pub fts_scores: usize,
    pub fts_calibrated: bool,
    pub vec_scores: usize,
    pub vec_calibrated: bool,
}

/// Map a raw score to its quantile using stored breakpoints.
///
/// Nondecreasing in `score`; `q(<= min) = 0`, `q(>= max) = 1`. Empty
/// breakpoints disable the channel (always 0).
pub fn score_to_quantile(score: f64, breaks: &[f64]) -> f64 {
    if breaks.is_empty() || score <= breaks[0] {
        return 0.0;
    }
    let last = breaks.len() - 1;
    if score >= breaks[last] {
        return 1.0;
    }

    // Upper neighbor via binary search, then interpolate within the segment.
    let upper = breaks.partition_point(|b| *b <= score).min(last);
    let lower = upper - 1;
    let (lo, hi) = (breaks[lower], breaks[upper]);
    let frac = if hi > lo { (score - lo) / (hi - lo) } else { 0.0 };

    let (q_lo, q_hi) = quantile_positions(breaks.len(), lower, upper);
    q_lo + frac * (q_hi - q_lo)
}

fn quantile_positions(n: usize, lower: usize, upper: usize) -> (f64, f64) {
    if n == QUANTILE_POINTS.len() {
        (QUANTILE_POINTS[lower], QUANTILE_POINTS[upper])
    } else {
        // Foreign breakpoint count: fall back to uniform spacing.
        let step = 1.0 / (n - 1) as f64;
        (lower as f64 * step, upper as f64 * step)
    }
}

/// Compute breakpoints at the [`QUANTILE_POINTS`] percentiles.
/// Returns `None` when there are too few scores to be meaningful.
pub fn percentile_breaks(scores: &[f64]) -> Option<Vec<f64>> {
    if scores.len() < QUANTILE_POINTS.len() {
        return None;
    }
    let mut sorted = scores.to_vec();
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let breaks = QUANTILE_POINTS
        .iter()
        .map(|&p| {
            let rank = p * (sorted.len() - 1) as f64;
            let lo = rank.floor() as usize;
            let hi = rank.ceil() as usize;
            if lo == hi {
                sorted[lo]
            } else {
                sorted[lo] + (rank - lo as f64) * (sorted[hi] - sorted[lo])
            }
        })
        .collect();
    Some(breaks)
}

/// Load stored breakpoints for a channel, or `None` if never calibrated.
pub fn load_breaks(conn: &Connection, key: &str) -> Result<Option<Vec<f64>>> {
    let raw: Option<String> = conn
        .query_row(
            "SELECT breaks FROM calibration WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?;
    Ok(match raw {
        Some(json) => Some(serde_json::from_str(&json)?),
        None => None,
    })
}

fn save_breaks(conn: &Connection, key: &str, breaks: &[f64], bullet_count: i64) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO calibration (key, breaks, bullet_count, updated_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![
            key,
            serde_json::to_string(breaks)?,
            bullet_count,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

/// Fraction of the index touched since the last calibration
/// (`ops_count / live bullets`). Drives auto-recalibration.
pub fn staleness(conn: &Connection) -> Result<f64> {
    let ops: i64 = conn
        .query_row("SELECT ops_count FROM calibration_ops WHERE id = 1", [], |r| r.get(0))
        .unwrap_or(0);
    let bullets: i64 = conn
        .query_row("SELECT COUNT(*) FROM bullets", [], |r| r.get(0))
        .unwrap_or(0);
    Ok(ops as f64 / bullets.max(1) as f64)
}

/// True when no breakpoints have ever been stored.
pub fn never_calibrated(conn: &Connection) -> bool {
    load_breaks(conn, KEY_FTS).ok().flatten().is_none()
}

/// Run a calibration pass.
///
/// Samples up to `sample_size` nodes (one canonical bullet each), issues
/// keyword and vector searches with the sampled texts, and persists
/// per-channel breakpoints. `vector_search` is the warm search path
/// (`None` disables the vector channel, e.g. `vector_weight = 0`).
pub fn calibrate(
    conn: &Connection,
    vector_search: Option<&dyn Fn(&str, usize) -> Result<Vec<(String, f64)>>>,
    sample_size: usize,
) -> Result<CalibrationReport> {
    let mut report = CalibrationReport::default();

    // One canonical bullet per node, random node order.
    let samples: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT text FROM bullets WHERE id IN \
             (SELECT MIN(id) FROM bullets GROUP BY node_slug) \
             ORDER BY RANDOM() LIMIT ?1",
        )?;
        let rows = stmt
            .query_map(params![sample_size as i64], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    report.sampled = samples.len();
    if samples.is_empty() {
        return Ok(report);
    }

    let mut fts_scores: Vec<f64> = Vec::new();
    let mut vec_scores: Vec<f64> = Vec::new();

    for text in &samples {
        let probe: String = text.chars().take(100).collect();
        for hit in crate::index::search_keyword(conn, &probe, 20)? {
            fts_scores.push(hit.score);
        }
        if let Some(search) = vector_search {
            match search(&probe, 20) {
                Ok(hits) => vec_scores.extend(hits.into_iter().map(|(_, score)| score)),
                Err(err) => tracing::warn!(%err, "vector sample failed during calibration"),
            }
        }
    }

    let bullet_count: i64 = conn.query_row("SELECT COUNT(*) FROM bullets", [], |r| r.get(0))?;

    report.fts_scores = fts_scores.len();
    if let Some(breaks) = percentile_breaks(&fts_scores) {
        save_breaks(conn, KEY_FTS, &breaks, bullet_count)?;
        report.fts_calibrated = true;
    }
    report.vec_scores = vec_scores.len();
    if let Some(breaks) = percentile_breaks(&vec_scores) {
        save_breaks(conn, KEY_VECTOR, &breaks, bullet_count)?;
        report.vec_calibrated = true;
    }

    conn.execute("UPDATE calibration_ops SET ops_count = 0 WHERE id = 1", [])?;
    Ok(report)
}
