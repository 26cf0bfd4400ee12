//! MCP tool surface consumed by the stdio collaborator.
//!
//! Tools mutate the record files (never the projection tables) and read
//! the derived store through lock-free reader connections. The one
//! exception is budget accrual, which goes through
//! [`crate::db::open_budget_writer`].

pub mod params;

use anyhow::Result;
use rmcp::handler::server::tool::{Parameters, ToolRouter};
use rmcp::{tool, tool_handler, tool_router, ServerHandler};
use std::future::Future;
use std::sync::Arc;

use crate::config::GroveConfig;
use crate::rank::{RankRequest, Ranker};
use crate::store::records::BulletKind;
use crate::store::RecordStore;
use params::*;

const DEFAULT_CONTEXT_CHARS: usize = 4000;

#[derive(Clone)]
pub struct GroveTools {
    tool_router: ToolRouter<Self>,
    config: Arc<GroveConfig>,
    store: Arc<RecordStore>,
    ranker: Arc<Ranker>,
}

#[tool_router]
impl GroveTools {
    pub fn new(config: Arc<GroveConfig>, store: Arc<RecordStore>, ranker: Arc<Ranker>) -> Self {
        Self {
            tool_router: Self::tool_router(),
            config,
            store,
            ranker,
        }
    }

    /// Hybrid search → ranked, deduplicated, budgeted context block.
    #[tool(description = "Search the knowledge graph and return a ranked context block for LLM injection. Pass session_id to skip bullets already served this session.")]
    async fn context(&self, Parameters(params): Parameters<ContextParams>) -> Result<String, String> {
        if params.fresh.unwrap_or(false) {
            if let Some(session_id) = &params.session_id {
                self.ranker.sessions().reset(session_id);
            }
        }
        let max_chars = params.max_chars.unwrap_or(DEFAULT_CONTEXT_CHARS);

        let mut request = RankRequest::new(params.query.clone());
        request.session_id = params.session_id.clone();
        let outcome = self.ranker.rank(request).await.map_err(|e| e.to_string())?;

        let db_path = self.config.db_path();
        let threshold = self.config.review.budget_threshold;
        let candidates = outcome.candidates;
        let packed = tokio::task::spawn_blocking(move || -> Result<_> {
            let conn = crate::db::open_readonly(&db_path)?;
            crate::rank::context::build_context(&conn, &candidates, max_chars, threshold)
        })
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;

        if packed.nodes.is_empty() {
            return Ok("(no results)".into());
        }

        // Attribute the served output: budget accrual + session tracking.
        let served = packed.served_chars();
        let db_path = self.config.db_path();
        let accrual = tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = crate::db::open_budget_writer(&db_path)?;
            crate::review::accrue_served(&conn, &served)
        })
        .await;
        if let Err(err) = accrual.map_err(anyhow::Error::from).and_then(|r| r) {
            tracing::warn!(%err, "budget accrual failed");
        }

        if let Some(session_id) = &params.session_id {
            let bullet_ids: Vec<&str> = packed
                .nodes
                .iter()
                .flat_map(|n| n.bullets.iter().map(|(id, _)| id.as_str()))
                .collect();
            let slugs: Vec<&str> = packed.nodes.iter().map(|n| n.slug.as_str()).collect();
            self.ranker.sessions().record_served(session_id, bullet_ids, slugs);
        }

        let mut text = packed.format_compact();
        if outcome.partial {
            text.push_str("\n\n(partial: some retrieval channels unavailable)");
        }
        Ok(text)
    }

    /// Plain keyword search over bullets.
    #[tool(description = "Keyword search over bullets. Returns a ranked list of matching bullets with their IDs.")]
    async fn search(&self, Parameters(params): Parameters<SearchParams>) -> Result<String, String> {
        let limit = params.limit.unwrap_or(20);
        let db_path = self.config.db_path();
        let query = params.query.clone();
        let hits = tokio::task::spawn_blocking(move || -> Result<_> {
            let conn = crate::db::open_readonly(&db_path)?;
            crate::index::search_keyword(&conn, &query, limit)
        })
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;

        if hits.is_empty() {
            return Ok("(no results)".into());
        }
        Ok(hits
            .iter()
            .map(|h| {
                let preview: String = h.text.chars().take(120).collect();
                format!("[{}] {} ←{}", h.slug, preview, h.bullet_id)
            })
            .collect::<Vec<_>>()
            .join("\n"))
    }

    /// Show a node's live bullets.
    #[tool(description = "Show all live bullets for a node by slug, with IDs and review state.")]
    async fn show(&self, Parameters(params): Parameters<ShowParams>) -> Result<String, String> {
        let node = self
            .store
            .get(&params.slug)
            .map_err(|e| e.to_string())?
            .ok_or_else(|| format!("node not found: {}", params.slug))?;

        let served = crate::db::open_readonly(self.config.db_path())
            .and_then(|conn| crate::review::served_budget(&conn, &params.slug))
            .unwrap_or(0.0);

        let live: Vec<_> = node.live_bullets().collect();
        let mut lines = vec![format!(
            "# {} [{}]  ●{} bullets{}",
            node.title(),
            node.slug,
            live.len(),
            if served >= 100.0 {
                format!("  ↑{} chars served", served as i64)
            } else {
                String::new()
            }
        )];
        let threshold = self.config.review.budget_threshold;
        if served / live.len().max(1) as f64 > threshold {
            lines.push(format!(
                "⚠ NEEDS REVIEW: {} chars served over {} bullets",
                served as i64,
                live.len()
            ));
        }
        for bullet in live {
            let prefix = if bullet.kind == BulletKind::Fact {
                String::new()
            } else {
                format!("({}) ", bullet.kind)
            };
            lines.push(format!("- {prefix}{}  ←{}", bullet.text, bullet.id));
        }
        Ok(lines.join("\n"))
    }

    /// Append a bullet record.
    #[tool(description = "Add a bullet to a node. The node is created automatically on first add. Returns the bullet ID.")]
    async fn add_bullet(&self, Parameters(params): Parameters<AddBulletParams>) -> Result<String, String> {
        let kind: BulletKind = params
            .kind
            .as_deref()
            .unwrap_or("fact")
            .parse()
            .map_err(|e: String| e)?;
        let bullet = self
            .store
            .add(&params.slug, &params.text, kind)
            .map_err(|e| e.to_string())?;
        tracing::info!(slug = %params.slug, id = %bullet.id, "bullet added");
        Ok(bullet.id)
    }

    /// Tombstone a bullet.
    #[tool(description = "Delete a bullet by ID. Appends a tombstone — the bullet disappears from all views.")]
    async fn delete_bullet(
        &self,
        Parameters(params): Parameters<DeleteBulletParams>,
    ) -> Result<String, String> {
        let slug = self
            .store
            .delete(&params.bullet_id)
            .map_err(|e| e.to_string())?;
        Ok(format!("Deleted {} from [{slug}]", params.bullet_id))
    }

    /// Vote a bullet useful or harmful.
    #[tool(description = "Record a usefulness vote on a bullet. Vote tallies surface in review output.")]
    async fn vote(&self, Parameters(params): Parameters<VoteParams>) -> Result<String, String> {
        let slug = self
            .store
            .vote(&params.bullet_id, params.useful)
            .map_err(|e| e.to_string())?;
        Ok(format!(
            "Recorded {} vote on {} [{slug}]",
            if params.useful { "useful" } else { "harmful" },
            params.bullet_id
        ))
    }

    /// Mark a node reviewed, clearing its served budget.
    #[tool(description = "Mark a node as reviewed after examining it. Clears its served-budget counter.")]
    async fn mark_reviewed(
        &self,
        Parameters(params): Parameters<MarkReviewedParams>,
    ) -> Result<String, String> {
        self.store
            .mark_reviewed(&params.slug)
            .map_err(|e| e.to_string())?;

        // Immediate reset; the reviewed record keeps it cleared across
        // rebuilds once the watcher catches up.
        let db_path = self.config.db_path();
        let slug = params.slug.clone();
        let reset = tokio::task::spawn_blocking(move || -> Result<()> {
            let conn = crate::db::open_budget_writer(&db_path)?;
            // Same timestamp shape as the record log, so the watcher's
            // newer-than comparison stays lexicographic.
            conn.execute(
                "UPDATE node_budget SET served_chars = 0, cleared_at = ?2 WHERE slug = ?1",
                rusqlite::params![
                    slug,
                    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
                ],
            )?;
            Ok(())
        })
        .await;
        if let Err(err) = reset.map_err(anyhow::Error::from).and_then(|r| r) {
            tracing::warn!(%err, "immediate budget reset failed — watcher will apply it");
        }
        Ok(format!("Marked reviewed: {}", params.slug))
    }

    /// List nodes needing review, worst first.
    #[tool(description = "List nodes whose served-budget-per-bullet exceeds the review threshold — these need maintenance.")]
    async fn review(&self, Parameters(params): Parameters<ReviewParams>) -> Result<String, String> {
        let threshold = params
            .threshold
            .unwrap_or(self.config.review.budget_threshold);
        let limit = params.limit.unwrap_or(20);
        let db_path = self.config.db_path();
        let entries = tokio::task::spawn_blocking(move || -> Result<_> {
            let conn = crate::db::open_readonly(&db_path)?;
            crate::review::review_list(&conn, threshold, limit)
        })
        .await
        .map_err(|e| e.to_string())?
        .map_err(|e| e.to_string())?;
        Ok(crate::review::format_review_list(&entries))
    }
}

#[tool_handler]
impl ServerHandler for GroveTools {
    fn get_info(&self) -> rmcp::model::ServerInfo {
        rmcp::model::ServerInfo {
            instructions: Some(
                "Grove is a local-first knowledge graph. Use context to fetch ranked \
                 knowledge for a task, add_bullet to record atomic facts, and \
                 mark_reviewed after cleaning up a flagged node."
                    .into(),
            ),
            capabilities: rmcp::model::ServerCapabilities::builder()
                .enable_tools()
                .build(),
            ..Default::default()
        }
    }
}
