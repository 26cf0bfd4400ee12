//! The hybrid ranker: keyword + vector retrieval, quantile-calibrated
//! fusion, session adjustment, and cross-encoder reranking.
//!
//! Each retrieval channel is an independently cancellable blocking task
//! under a shared soft deadline. A failed channel never takes the other
//! one down; if every enabled channel fails the query fails with
//! `IndexUnavailable`. A channel whose weight is 0 is fully suppressed —
//! never queried, never scored — regardless of stored breakpoints.

use anyhow::Result;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{timeout_at, Instant};

use super::calibrate::{load_breaks, score_to_quantile, KEY_FTS, KEY_VECTOR};
use super::rerank::Reranker;
use super::session::SessionTracker;
use crate::config::SearchConfig;
use crate::error::GroveError;
use crate::index::KeywordHit;
use crate::vector::VectorClient;

/// Final results returned after reranking.
pub const DEFAULT_K: usize = 20;
/// Candidates considered before the rerank stage.
pub const CANDIDATE_POOL: usize = 60;
/// Soft deadline for the whole query.
const DEADLINE: Duration = Duration::from_secs(10);

/// Boost applied to candidates from nodes this session already touched.
const SESSION_NODE_BOOST: f64 = 1.3;

#[derive(Debug, Clone)]
pub struct RankRequest {
    pub query: String,
    pub rerank_query: Option<String>,
    pub session_id: Option<String>,
    pub k: usize,
}

impl RankRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            rerank_query: None,
            session_id: None,
            k: DEFAULT_K,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Candidate {
    pub bullet_id: String,
    pub slug: String,
    pub text: String,
    pub q_kw: f64,
    pub q_vec: f64,
    pub score: f64,
}

#[derive(Debug, Default)]
pub struct RankOutcome {
    pub candidates: Vec<Candidate>,
    /// True when an enabled channel failed or timed out.
    pub partial: bool,
    /// Channels that contributed nothing, with the reason.
    pub disabled: Vec<String>,
}

/// A vector hit hydrated with its bullet row.
#[derive(Debug, Clone)]
pub struct VectorHit {
    pub bullet_id: String,
    pub slug: String,
    pub text: String,
    pub score: f64,
}

pub struct Ranker {
    db_path: PathBuf,
    search: SearchConfig,
    vector: Option<Arc<VectorClient>>,
    sessions: Arc<SessionTracker>,
    reranker: Option<Arc<Reranker>>,
}

impl Ranker {
    pub fn new(
        db_path: PathBuf,
        search: SearchConfig,
        vector: Option<Arc<VectorClient>>,
        sessions: Arc<SessionTracker>,
        reranker: Option<Arc<Reranker>>,
    ) -> Self {
        Self {
            db_path,
            search,
            vector,
            sessions,
            reranker,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionTracker> {
        &self.sessions
    }

    pub async fn rank(&self, request: RankRequest) -> Result<RankOutcome> {
        let deadline = Instant::now() + DEADLINE;
        let kw_enabled = self.search.fts_weight > 0.0;
        let vec_enabled = self.search.vector_weight > 0.0 && self.vector.is_some();

        let kw_task = {
            let db_path = self.db_path.clone();
            let query = request.query.clone();
            async move {
                if !kw_enabled {
                    return None;
                }
                let result = timeout_at(
                    deadline,
                    tokio::task::spawn_blocking(move || -> Result<Vec<KeywordHit>> {
                        let conn = crate::db::open_readonly(&db_path)?;
                        crate::index::search_keyword(&conn, &query, CANDIDATE_POOL)
                    }),
                )
                .await;
                flatten_channel("keyword", result)
            }
        };

        let vec_task = {
            let client = self.vector.clone();
            let query = request.query.clone();
            async move {
                if !vec_enabled {
                    return None;
                }
                let client = client.expect("vec_enabled implies client");
                let result = timeout_at(
                    deadline,
                    tokio::task::spawn_blocking(move || client.search_text(&query, CANDIDATE_POOL)),
                )
                .await;
                flatten_channel("vector", result)
            }
        };

        let (kw_hits, vec_hits) = tokio::join!(kw_task, vec_task);

        let mut outcome = RankOutcome::default();
        if kw_enabled && kw_hits.is_none() {
            outcome.partial = true;
            outcome.disabled.push("keyword: failed".into());
        }
        if vec_enabled && vec_hits.is_none() {
            outcome.partial = true;
            outcome.disabled.push("vector: failed".into());
        }
        if !kw_enabled {
            outcome.disabled.push("keyword: weight 0".into());
        }
        if self.search.vector_weight <= 0.0 {
            outcome.disabled.push("vector: weight 0".into());
        } else if self.vector.is_none() {
            outcome.disabled.push("vector: no provider".into());
        }

        let kw_failed = kw_enabled && kw_hits.is_none();
        let vec_failed = vec_enabled && vec_hits.is_none();
        if (kw_failed || !kw_enabled) && (vec_failed || !vec_enabled) && (kw_enabled || vec_enabled)
        {
            return Err(GroveError::IndexUnavailable(
                "all retrieval channels failed".into(),
            )
            .into());
        }

        // Calibrate, hydrate, and fuse on a blocking thread.
        let fused = {
            let db_path = self.db_path.clone();
            let search = self.search.clone();
            let kw = kw_hits.unwrap_or_default();
            let vec = vec_hits.unwrap_or_default();
            tokio::task::spawn_blocking(move || -> Result<Vec<Candidate>> {
                let conn = crate::db::open_readonly(&db_path)?;
                let fts_breaks = load_breaks(&conn, KEY_FTS)?.unwrap_or_default();
                let vec_breaks = load_breaks(&conn, KEY_VECTOR)?.unwrap_or_default();
                let hydrated = hydrate_vector_hits(&conn, &vec)?;
                Ok(fuse(&kw, &hydrated, &fts_breaks, &vec_breaks, &search))
            })
            .await??
        };
        let mut candidates = fused;

        // Session adjustment: drop already-served bullets, boost touched nodes.
        if let Some(session_id) = &request.session_id {
            let served = self.sessions.served_bullets(session_id);
            let touched = self.sessions.touched_slugs(session_id);
            candidates.retain(|c| !served.contains(&c.bullet_id));
            for candidate in &mut candidates {
                if touched.contains(&candidate.slug) {
                    candidate.score *= SESSION_NODE_BOOST;
                }
            }
        }

        sort_candidates(&mut candidates);
        candidates.truncate(CANDIDATE_POOL);

        // Cross-encoder pass over the pool; on failure keep the fused order.
        if self.search.use_reranker {
            if let Some(reranker) = self.reranker.clone() {
                let rerank_query = request
                    .rerank_query
                    .clone()
                    .unwrap_or_else(|| request.query.clone());
                let texts: Vec<String> = candidates.iter().map(|c| c.text.clone()).collect();
                let scored = timeout_at(
                    deadline,
                    tokio::task::spawn_blocking(move || {
                        let refs: Vec<&str> = texts.iter().map(String::as_str).collect();
                        reranker.score(&rerank_query, &refs)
                    }),
                )
                .await;
                match flatten_channel("rerank", scored) {
                    Some(scores) if scores.len() == candidates.len() => {
                        for (candidate, score) in candidates.iter_mut().zip(scores) {
                            candidate.score = score;
                        }
                        sort_candidates(&mut candidates);
                    }
                    _ => {
                        outcome.partial = true;
                        outcome.disabled.push("rerank: failed".into());
                    }
                }
            }
        }

        candidates.truncate(request.k.max(1));
        outcome.candidates = candidates;
        Ok(outcome)
    }
}

/// Collapse timeout/join/channel errors into `None`, logging the cause.
fn flatten_channel<T>(
    name: &str,
    result: Result<Result<Result<T>, tokio::task::JoinError>, tokio::time::error::Elapsed>,
) -> Option<T> {
    match result {
        Ok(Ok(Ok(value))) => Some(value),
        Ok(Ok(Err(err))) => {
            tracing::warn!(channel = name, %err, "retrieval channel failed");
            None
        }
        Ok(Err(err)) => {
            tracing::warn!(channel = name, %err, "retrieval task panicked");
            None
        }
        Err(_) => {
            tracing::warn!(channel = name, "retrieval channel timed out");
            None
        }
    }
}

/// Attach slug and text to raw vector hits; stale IDs are dropped.
pub fn hydrate_vector_hits(
    conn: &rusqlite::Connection,
    hits: &[(String, f64)],
) -> Result<Vec<VectorHit>> {
    let mut stmt = conn.prepare("SELECT node_slug, text FROM bullets WHERE id = ?1")?;
    let mut hydrated = Vec::with_capacity(hits.len());
    for (bullet_id, score) in hits {
        let row = stmt
            .query_row(rusqlite::params![bullet_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })
            .ok();
        if let Some((slug, text)) = row {
            hydrated.push(VectorHit {
                bullet_id: bullet_id.clone(),
                slug,
                text,
                score: *score,
            });
        }
    }
    Ok(hydrated)
}

/// Quantile-normalize both channels and fuse:
/// `score = fts_weight·q_kw + vector_weight·q_vec (+ dual_match_bonus)`.
///
/// A candidate present in only one channel takes quantile 0 for the other.
pub fn fuse(
    kw: &[KeywordHit],
    vec: &[VectorHit],
    fts_breaks: &[f64],
    vec_breaks: &[f64],
    search: &SearchConfig,
) -> Vec<Candidate> {
    let mut by_id: HashMap<&str, Candidate> = HashMap::new();

    if search.fts_weight > 0.0 {
        for hit in kw {
            by_id.insert(
                &hit.bullet_id,
                Candidate {
                    bullet_id: hit.bullet_id.clone(),
                    slug: hit.slug.clone(),
                    text: hit.text.clone(),
                    q_kw: score_to_quantile(hit.score, fts_breaks),
                    q_vec: 0.0,
                    score: 0.0,
                },
            );
        }
    }
    if search.vector_weight > 0.0 {
        for hit in vec {
            let q_vec = score_to_quantile(hit.score, vec_breaks);
            by_id
                .entry(&hit.bullet_id)
                .and_modify(|c| c.q_vec = q_vec)
                .or_insert_with(|| Candidate {
                    bullet_id: hit.bullet_id.clone(),
                    slug: hit.slug.clone(),
                    text: hit.text.clone(),
                    q_kw: 0.0,
                    q_vec,
                    score: 0.0,
                });
        }
    }

    let mut candidates: Vec<Candidate> = by_id
        .into_values()
        .map(|mut c| {
            c.score = search.fts_weight * c.q_kw + search.vector_weight * c.q_vec;
            if c.q_kw > 0.0 && c.q_vec > 0.0 {
                c.score += search.dual_match_bonus;
            }
            c
        })
        .collect();
    sort_candidates(&mut candidates);
    candidates
}

/// Descending score, ties broken by ascending bullet ID.
pub fn sort_candidates(candidates: &mut [Candidate]) {
    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.bullet_id.cmp(&b.bullet_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(fts: f64, vec: f64, bonus: f64) -> SearchConfig {
        SearchConfig {
            fts_weight: fts,
            vector_weight: vec,
            dual_match_bonus: bonus,
            ..SearchConfig::default()
        }
    }

    fn kw_hit(id: &str, score: f64) -> KeywordHit {
        KeywordHit {
            bullet_id: id.into(),
            slug: "n".into(),
            text: format!("text {id}"),
            score,
        }
    }

    fn vec_hit(id: &str, score: f64) -> VectorHit {
        VectorHit {
            bullet_id: id.into(),
            slug: "n".into(),
            text: format!("text {id}"),
            score,
        }
    }

    // Breakpoints where a raw score equals its quantile×6.
    const BREAKS: [f64; 7] = [0.0, 1.0, 2.0, 3.0, 4.0, 5.0, 6.0];

    #[test]
    fn keyword_only_hit_scores_without_bonus() {
        // q_kw = 0.8 → p90 is at raw 5, p75 at raw 4; raw 4.333… ≈ q 0.8.
        // Use raw 5 → q 0.9 for a round check instead: 0.5·0.9 = 0.45.
        let fused = fuse(&[kw_hit("b-a", 5.0)], &[], &BREAKS, &BREAKS, &config(0.5, 0.5, 0.1));
        assert_eq!(fused.len(), 1);
        assert!((fused[0].score - 0.45).abs() < 1e-9);
        assert_eq!(fused[0].q_vec, 0.0);
    }

    #[test]
    fn dual_match_earns_bonus() {
        let fused = fuse(
            &[kw_hit("b-a", 3.0)],
            &[vec_hit("b-a", 3.0)],
            &BREAKS,
            &BREAKS,
            &config(0.5, 0.5, 0.1),
        );
        // 0.5·0.5 + 0.5·0.5 + 0.1
        assert!((fused[0].score - 0.6).abs() < 1e-9);
    }

    #[test]
    fn zero_weight_suppresses_channel_despite_breakpoints() {
        let fused = fuse(
            &[kw_hit("b-kw", 6.0)],
            &[vec_hit("b-vec", 6.0)],
            &BREAKS,
            &BREAKS,
            &config(1.0, 0.0, 0.1),
        );
        assert_eq!(fused.len(), 1);
        assert_eq!(fused[0].bullet_id, "b-kw");
        assert_eq!(fused[0].q_vec, 0.0);
    }

    #[test]
    fn score_is_monotone_in_each_quantile() {
        let low = fuse(&[kw_hit("b-a", 2.0)], &[], &BREAKS, &BREAKS, &config(0.5, 0.5, 0.1));
        let high = fuse(&[kw_hit("b-a", 5.0)], &[], &BREAKS, &BREAKS, &config(0.5, 0.5, 0.1));
        assert!(high[0].score > low[0].score);
    }

    #[test]
    fn ties_break_on_ascending_bullet_id() {
        let fused = fuse(
            &[kw_hit("b-zzz", 3.0), kw_hit("b-aaa", 3.0)],
            &[],
            &BREAKS,
            &BREAKS,
            &config(1.0, 0.0, 0.0),
        );
        assert_eq!(fused[0].bullet_id, "b-aaa");
        assert_eq!(fused[1].bullet_id, "b-zzz");
    }

    #[test]
    fn uncalibrated_channel_contributes_zero() {
        let fused = fuse(
            &[kw_hit("b-a", 5.0)],
            &[],
            &[],
            &BREAKS,
            &config(0.5, 0.5, 0.1),
        );
        assert_eq!(fused[0].score, 0.0);
        assert_eq!(fused[0].q_kw, 0.0);
    }
}
