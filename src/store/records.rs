//! Record and bullet types for the append-only node logs.
//!
//! Defines [`BulletKind`] (the seven bullet categories), [`Record`] (one
//! JSONL line in `node.jsonl` or `meta.jsonl`), [`Bullet`] (the live state
//! replayed from records), and [`Node`] (a slug plus its bullets).

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Lowercase RFC 4648 base32 alphabet used for bullet ID entropy.
const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz234567";
const ID_LEN: usize = 8;

/// The seven bullet categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BulletKind {
    /// A plain atomic fact — the default.
    Fact,
    /// A surprising pitfall worth remembering.
    Gotcha,
    /// A decision that was made, and sticks.
    Decision,
    Task,
    Note,
    Success,
    Failure,
}

impl BulletKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fact => "fact",
            Self::Gotcha => "gotcha",
            Self::Decision => "decision",
            Self::Task => "task",
            Self::Note => "note",
            Self::Success => "success",
            Self::Failure => "failure",
        }
    }
}

impl std::fmt::Display for BulletKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for BulletKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "fact" => Ok(Self::Fact),
            "gotcha" => Ok(Self::Gotcha),
            "decision" => Ok(Self::Decision),
            "task" => Ok(Self::Task),
            "note" => Ok(Self::Note),
            "success" => Ok(Self::Success),
            "failure" => Ok(Self::Failure),
            _ => Err(format!("unknown bullet kind: {s}")),
        }
    }
}

/// One self-describing line in a node or meta log.
///
/// Unknown `op` values deserialize to [`Record::Unknown`] and are preserved
/// but ignored when replaying the live view. Extra fields on known ops are
/// tolerated and dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum Record {
    Add {
        id: String,
        text: String,
        kind: BulletKind,
        ts: String,
    },
    Update {
        id: String,
        text: String,
        ts: String,
    },
    Delete {
        id: String,
        ts: String,
    },
    /// Meta log only: a usefulness vote on a bullet.
    Vote {
        target_id: String,
        sign: i8,
        ts: String,
    },
    /// Meta log only: the node was explicitly reviewed.
    Reviewed {
        ts: String,
    },
    #[serde(other)]
    Unknown,
}

/// Live state of a bullet after replaying its node log.
#[derive(Debug, Clone, Serialize)]
pub struct Bullet {
    pub id: String,
    pub kind: BulletKind,
    pub text: String,
    pub created_at: String,
    pub updated_at: String,
    pub deleted: bool,
    /// Vote tallies merged in from the meta log.
    pub useful: i64,
    pub harmful: i64,
}

/// A node: slug plus replayed bullets and meta state.
#[derive(Debug, Clone)]
pub struct Node {
    pub slug: String,
    pub bullets: Vec<Bullet>,
    pub reviewed_at: Option<String>,
}

impl Node {
    /// Bullets that have not been tombstoned, in first-appearance order.
    pub fn live_bullets(&self) -> impl Iterator<Item = &Bullet> {
        self.bullets.iter().filter(|b| !b.deleted)
    }

    /// Human-readable title derived from the slug.
    pub fn title(&self) -> String {
        title_for_slug(&self.slug)
    }
}

/// `asyncpg-patterns` → `asyncpg patterns`. Synthetic `_`-prefixed slugs
/// keep their raw form.
pub fn title_for_slug(slug: &str) -> String {
    if slug.starts_with('_') {
        slug.to_string()
    } else {
        slug.replace('-', " ")
    }
}

/// True for slugs matching `[a-z0-9][a-z0-9-]*` (with an optional leading
/// `_` for synthetic nodes).
pub fn is_valid_slug(slug: &str) -> bool {
    let body = slug.strip_prefix('_').unwrap_or(slug);
    let mut chars = body.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c.is_ascii_digit() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
}

/// Synthetic nodes (`_fleeting-*`, `_doc-*`) are kept out of context
/// output and review accounting.
pub fn is_synthetic_slug(slug: &str) -> bool {
    slug.starts_with('_')
}

/// Generate a fresh bullet ID: `b-` + 8 base32 chars of random entropy.
pub fn new_bullet_id() -> String {
    let mut rng = rand::thread_rng();
    let mut id = String::with_capacity(2 + ID_LEN);
    id.push_str("b-");
    for _ in 0..ID_LEN {
        id.push(ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char);
    }
    id
}

/// Replay node-log records into bullets, first-appearance order.
///
/// The last non-tombstone state per ID wins; a tombstoned ID stays
/// tombstoned even if later records mention it.
pub fn replay(records: impl IntoIterator<Item = Record>) -> Vec<Bullet> {
    let mut bullets: Vec<Bullet> = Vec::new();
    for record in records {
        match record {
            Record::Add { id, text, kind, ts } => {
                if bullets.iter().any(|b| b.id == id) {
                    tracing::warn!(id = %id, "duplicate add record ignored");
                    continue;
                }
                bullets.push(Bullet {
                    id,
                    kind,
                    text,
                    created_at: ts.clone(),
                    updated_at: ts,
                    deleted: false,
                    useful: 0,
                    harmful: 0,
                });
            }
            Record::Update { id, text, ts } => {
                if let Some(b) = bullets.iter_mut().find(|b| b.id == id) {
                    if !b.deleted {
                        b.text = text;
                        b.updated_at = ts;
                    }
                }
            }
            Record::Delete { id, .. } => {
                if let Some(b) = bullets.iter_mut().find(|b| b.id == id) {
                    b.deleted = true;
                }
            }
            // Vote/reviewed belong to the meta log; tolerated here.
            Record::Vote { .. } | Record::Reviewed { .. } | Record::Unknown => {}
        }
    }
    bullets
}
