//! Parameter structs for the MCP tools.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ContextParams {
    /// Search query.
    #[schemars(description = "Search query")]
    pub query: String,

    /// Session ID for differential context (auto-provided by hooks).
    #[schemars(description = "Session ID — bullets already served to this session are skipped")]
    pub session_id: Option<String>,

    /// Character budget for the output block. Defaults to 4000.
    #[schemars(description = "Character budget for the output block. Defaults to 4000.")]
    pub max_chars: Option<usize>,

    /// Reset session tracking and start fresh.
    #[schemars(description = "Reset session tracking (start fresh)")]
    pub fresh: Option<bool>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct SearchParams {
    /// Search query.
    #[schemars(description = "Search query")]
    pub query: String,

    /// Maximum results. Defaults to 20.
    #[schemars(description = "Maximum results. Defaults to 20.")]
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ShowParams {
    /// Node slug.
    #[schemars(description = "Node slug")]
    pub slug: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct AddBulletParams {
    /// Node slug. Use `_fleeting-<session>` for scratch notes.
    #[schemars(description = "Node slug (auto-created on first add). Use _fleeting-<session> for scratch notes.")]
    pub slug: String,

    /// Bullet text. `[other-slug]` references become graph edges.
    #[schemars(description = "Bullet text. [other-slug] references become graph edges.")]
    pub text: String,

    /// Bullet kind: fact, gotcha, decision, task, note, success, failure.
    #[schemars(description = "Bullet kind: fact, gotcha, decision, task, note, success, failure. Defaults to fact.")]
    pub kind: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct DeleteBulletParams {
    /// Bullet ID to tombstone (e.g. `b-ab12cd34`).
    #[schemars(description = "Bullet ID to delete (e.g. b-ab12cd34)")]
    pub bullet_id: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct VoteParams {
    /// Bullet ID to vote on.
    #[schemars(description = "Bullet ID to vote on")]
    pub bullet_id: String,

    /// True when the bullet was useful, false when it was harmful.
    #[schemars(description = "true = useful, false = harmful")]
    pub useful: bool,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct MarkReviewedParams {
    /// Node slug.
    #[schemars(description = "Node slug to mark reviewed — resets its served budget")]
    pub slug: String,
}

#[derive(Debug, Serialize, Deserialize, JsonSchema)]
pub struct ReviewParams {
    /// Chars-per-bullet threshold; defaults to the configured value.
    #[schemars(description = "Chars-per-bullet threshold (defaults to review.budget_threshold)")]
    pub threshold: Option<f64>,

    /// Maximum nodes to list. Defaults to 20.
    #[schemars(description = "Maximum nodes to list. Defaults to 20.")]
    pub limit: Option<usize>,
}
