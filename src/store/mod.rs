//! The record store: append-only JSONL logs, one directory per node.
//!
//! `nodes/<slug>/node.jsonl` holds bullet records, `nodes/<slug>/meta.jsonl`
//! holds votes and review markers. Records are never rewritten in place —
//! every mutation appends a new line, and readers replay the log. The
//! derived SQLite index is rebuilt from these files at any time.

pub mod records;

use anyhow::{Context, Result};
use fs2::FileExt;
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use crate::error::GroveError;
use self::records::{is_valid_slug, new_bullet_id, replay, Bullet, BulletKind, Node, Record};

/// Vote tallies and review state replayed from a meta log.
#[derive(Debug, Default)]
pub struct MetaState {
    /// bullet ID → (useful, harmful)
    pub votes: HashMap<String, (i64, i64)>,
    /// Timestamp of the latest `reviewed` record, if any.
    pub reviewed_at: Option<String>,
}

/// JSONL-backed node store rooted at `nodes/`.
pub struct RecordStore {
    nodes_dir: PathBuf,
}

impl RecordStore {
    pub fn new(nodes_dir: impl Into<PathBuf>) -> Self {
        Self {
            nodes_dir: nodes_dir.into(),
        }
    }

    pub fn nodes_dir(&self) -> &Path {
        &self.nodes_dir
    }

    fn node_path(&self, slug: &str) -> PathBuf {
        self.nodes_dir.join(slug).join("node.jsonl")
    }

    fn meta_path(&self, slug: &str) -> PathBuf {
        self.nodes_dir.join(slug).join("meta.jsonl")
    }

    pub fn exists(&self, slug: &str) -> bool {
        self.node_path(slug).exists()
    }

    /// All node slugs, sorted.
    pub fn list_slugs(&self) -> Result<Vec<String>> {
        let mut slugs = Vec::new();
        if !self.nodes_dir.exists() {
            return Ok(slugs);
        }
        for entry in std::fs::read_dir(&self.nodes_dir)? {
            let entry = entry?;
            if entry.path().join("node.jsonl").exists() {
                slugs.push(entry.file_name().to_string_lossy().into_owned());
            }
        }
        slugs.sort();
        Ok(slugs)
    }

    /// Load a node: replay its bullet log and merge in meta state.
    pub fn get(&self, slug: &str) -> Result<Option<Node>> {
        let path = self.node_path(slug);
        if !path.exists() {
            return Ok(None);
        }
        let mut bullets = replay(read_records(&path)?);

        let meta = self.meta(slug)?;
        for bullet in &mut bullets {
            if let Some(&(useful, harmful)) = meta.votes.get(&bullet.id) {
                bullet.useful = useful;
                bullet.harmful = harmful;
            }
        }

        Ok(Some(Node {
            slug: slug.to_string(),
            bullets,
            reviewed_at: meta.reviewed_at,
        }))
    }

    /// Replay the meta log for a node.
    pub fn meta(&self, slug: &str) -> Result<MetaState> {
        let path = self.meta_path(slug);
        let mut state = MetaState::default();
        if !path.exists() {
            return Ok(state);
        }
        for record in read_records(&path)? {
            match record {
                Record::Vote {
                    target_id, sign, ..
                } => {
                    let tally = state.votes.entry(target_id).or_insert((0, 0));
                    if sign >= 0 {
                        tally.0 += 1;
                    } else {
                        tally.1 += 1;
                    }
                }
                Record::Reviewed { ts } => state.reviewed_at = Some(ts),
                _ => {}
            }
        }
        Ok(state)
    }

    /// Append a bullet. The node is created implicitly on first add.
    pub fn add(&self, slug: &str, text: &str, kind: BulletKind) -> Result<Bullet> {
        if !is_valid_slug(slug) {
            return Err(GroveError::Input(format!("invalid slug: {slug}")).into());
        }
        if text.trim().is_empty() {
            return Err(GroveError::Input("bullet text must not be empty".into()).into());
        }

        let live_ids: Vec<String> = self
            .get(slug)?
            .map(|n| n.live_bullets().map(|b| b.id.clone()).collect())
            .unwrap_or_default();

        // Collision retry against the node's current live IDs.
        let mut id = new_bullet_id();
        while live_ids.iter().any(|existing| existing == &id) {
            id = new_bullet_id();
        }

        let ts = now();
        let record = Record::Add {
            id: id.clone(),
            text: text.to_string(),
            kind,
            ts: ts.clone(),
        };
        self.append(&self.node_path(slug), &record)?;

        Ok(Bullet {
            id,
            kind,
            text: text.to_string(),
            created_at: ts.clone(),
            updated_at: ts,
            deleted: false,
            useful: 0,
            harmful: 0,
        })
    }

    /// Append an update record. Fails with an input error if the ID is
    /// unknown in every node.
    pub fn update(&self, bullet_id: &str, text: &str) -> Result<String> {
        let (slug, _) = self
            .find_bullet(bullet_id)?
            .ok_or_else(|| GroveError::Input(format!("bullet not found: {bullet_id}")))?;
        let record = Record::Update {
            id: bullet_id.to_string(),
            text: text.to_string(),
            ts: now(),
        };
        self.append(&self.node_path(&slug), &record)?;
        Ok(slug)
    }

    /// Append a tombstone record for a bullet.
    pub fn delete(&self, bullet_id: &str) -> Result<String> {
        let (slug, _) = self
            .find_bullet(bullet_id)?
            .ok_or_else(|| GroveError::Input(format!("bullet not found: {bullet_id}")))?;
        let record = Record::Delete {
            id: bullet_id.to_string(),
            ts: now(),
        };
        self.append(&self.node_path(&slug), &record)?;
        Ok(slug)
    }

    /// Record a usefulness vote in the node's meta log.
    pub fn vote(&self, bullet_id: &str, useful: bool) -> Result<String> {
        let (slug, _) = self
            .find_bullet(bullet_id)?
            .ok_or_else(|| GroveError::Input(format!("bullet not found: {bullet_id}")))?;
        let record = Record::Vote {
            target_id: bullet_id.to_string(),
            sign: if useful { 1 } else { -1 },
            ts: now(),
        };
        self.append(&self.meta_path(&slug), &record)?;
        Ok(slug)
    }

    /// Append a reviewed marker to the node's meta log.
    pub fn mark_reviewed(&self, slug: &str) -> Result<()> {
        if !self.exists(slug) {
            return Err(GroveError::Input(format!("node not found: {slug}")).into());
        }
        let record = Record::Reviewed { ts: now() };
        self.append(&self.meta_path(slug), &record)
    }

    /// Locate a live bullet by ID across all nodes.
    pub fn find_bullet(&self, bullet_id: &str) -> Result<Option<(String, Bullet)>> {
        for slug in self.list_slugs()? {
            if let Some(node) = self.get(&slug)? {
                if let Some(bullet) = node.live_bullets().find(|b| b.id == bullet_id) {
                    return Ok(Some((slug, bullet.clone())));
                }
            }
        }
        Ok(None)
    }

    /// Append one record line: open-append, exclusive advisory lock, fsync.
    fn append(&self, path: &Path, record: &Record) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("failed to open {}", path.display()))?;

        file.lock_exclusive()
            .with_context(|| format!("failed to lock {}", path.display()))?;
        let result = (|| -> Result<()> {
            let mut line = serde_json::to_string(record)?;
            line.push('\n');
            file.write_all(line.as_bytes())?;
            file.sync_all()?;
            Ok(())
        })();
        let _ = fs2::FileExt::unlock(&file);
        result
    }
}

/// Parse all records in a JSONL file. Unparseable lines are logged and
/// skipped; empty lines are ignored.
pub fn read_records(path: &Path) -> Result<Vec<Record>> {
    let file = File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let reader = BufReader::new(file);
    let mut records = Vec::new();
    for (lineno, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Record>(trimmed) {
            Ok(record) => records.push(record),
            Err(err) => {
                tracing::warn!(
                    path = %path.display(),
                    line = lineno + 1,
                    %err,
                    "skipping unparseable record"
                );
            }
        }
    }
    Ok(records)
}

fn now() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, RecordStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RecordStore::new(dir.path().join("nodes"));
        (dir, store)
    }

    #[test]
    fn add_creates_node_implicitly() {
        let (_dir, store) = store();
        let bullet = store.add("topic", "first fact", BulletKind::Fact).unwrap();
        assert!(store.exists("topic"));
        let node = store.get("topic").unwrap().unwrap();
        assert_eq!(node.live_bullets().count(), 1);
        assert_eq!(node.bullets[0].id, bullet.id);
    }

    #[test]
    fn add_rejects_bad_slug() {
        let (_dir, store) = store();
        let err = store.add("Bad Slug", "x", BulletKind::Fact).unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
    }

    #[test]
    fn update_then_delete_yields_empty_live_view() {
        let (_dir, store) = store();
        let bullet = store.add("t", "x", BulletKind::Fact).unwrap();
        store.update(&bullet.id, "y").unwrap();

        let node = store.get("t").unwrap().unwrap();
        assert_eq!(node.live_bullets().next().unwrap().text, "y");

        store.delete(&bullet.id).unwrap();
        let node = store.get("t").unwrap().unwrap();
        assert_eq!(node.live_bullets().count(), 0);
    }

    #[test]
    fn update_unknown_id_is_input_error() {
        let (_dir, store) = store();
        let err = store.update("b-nope1234", "text").unwrap_err();
        assert_eq!(crate::error::exit_code_for(&err), 2);
    }

    #[test]
    fn votes_merge_into_live_view() {
        let (_dir, store) = store();
        let bullet = store.add("t", "voted on", BulletKind::Gotcha).unwrap();
        store.vote(&bullet.id, true).unwrap();
        store.vote(&bullet.id, true).unwrap();
        store.vote(&bullet.id, false).unwrap();

        let node = store.get("t").unwrap().unwrap();
        let live = node.live_bullets().next().unwrap();
        assert_eq!(live.useful, 2);
        assert_eq!(live.harmful, 1);
    }

    #[test]
    fn mark_reviewed_records_timestamp() {
        let (_dir, store) = store();
        store.add("t", "x", BulletKind::Fact).unwrap();
        assert!(store.get("t").unwrap().unwrap().reviewed_at.is_none());
        store.mark_reviewed("t").unwrap();
        assert!(store.get("t").unwrap().unwrap().reviewed_at.is_some());
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let (_dir, store) = store();
        let bullet = store.add("t", "good", BulletKind::Fact).unwrap();
        // Garbage in the middle of the log must not poison the replay.
        let path = store.nodes_dir().join("t").join("node.jsonl");
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(file, "{{not json").unwrap();
        store.add("t", "also good", BulletKind::Fact).unwrap();

        let node = store.get("t").unwrap().unwrap();
        assert_eq!(node.live_bullets().count(), 2);
        assert_eq!(node.bullets[0].id, bullet.id);
    }

    #[test]
    fn find_bullet_scans_all_nodes() {
        let (_dir, store) = store();
        store.add("alpha", "in alpha", BulletKind::Fact).unwrap();
        let target = store.add("beta", "in beta", BulletKind::Fact).unwrap();

        let (slug, found) = store.find_bullet(&target.id).unwrap().unwrap();
        assert_eq!(slug, "beta");
        assert_eq!(found.text, "in beta");
        assert!(store.find_bullet("b-missing0").unwrap().is_none());
    }
}
