//! File-source indexing: plain files chunked into synthetic `_doc-` nodes.
//!
//! No extraction pass — files are chunked on line boundaries and dropped
//! into the same keyword index as curated bullets, so `search` and
//! `context` cover both. Synthetic nodes exist only in the derived store
//! (never as record files), are keyword-only (no embeddings), and are
//! excluded from review accounting.

use anyhow::{Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use rusqlite::{params, Connection, OptionalExtension};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

use crate::config::SourceConfig;

/// Target chunk size in chars (~375 tokens); hard cap at 4000.
const CHUNK_TARGET: usize = 1500;
const CHUNK_MAX: usize = 4000;
/// Chunks shorter than this are dropped as stubs.
const CHUNK_MIN: usize = 64;

/// Binary sniff: fraction of non-printable bytes in the first 512.
const BINARY_THRESHOLD: f64 = 0.30;

#[derive(Debug, Default)]
pub struct SyncReport {
    pub indexed: usize,
    pub unchanged: usize,
    pub skipped: usize,
    pub removed: usize,
}

/// Stable synthetic slug for a source file: `_doc-<sha256(rel_path)[..12]>`.
pub fn path_slug(rel_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(rel_path.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    format!("_doc-{}", &hex[..12])
}

/// Split text into chunks on line boundaries.
pub fn chunk_text(text: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for line in text.lines() {
        if !current.is_empty()
            && (current.len() + line.len() >= CHUNK_TARGET || current.len() + line.len() > CHUNK_MAX)
        {
            chunks.push(std::mem::take(&mut current));
        }
        // A single oversized line is split hard.
        if line.len() > CHUNK_MAX {
            let mut rest = line;
            while rest.len() > CHUNK_MAX {
                let cut = (0..=CHUNK_MAX).rev().find(|&i| rest.is_char_boundary(i)).unwrap_or(0);
                chunks.push(rest[..cut].to_string());
                rest = &rest[cut..];
            }
            current.push_str(rest);
        } else {
            current.push_str(line);
        }
        current.push('\n');
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }
    chunks.retain(|c| c.trim().len() >= CHUNK_MIN);
    chunks
}

fn looks_binary(bytes: &[u8]) -> bool {
    let sample = &bytes[..bytes.len().min(512)];
    if sample.is_empty() {
        return false;
    }
    let non_printable = sample
        .iter()
        .filter(|&&b| b != b'\n' && b != b'\r' && b != b'\t' && (b < 0x20 || b == 0x7f))
        .count();
    non_printable as f64 / sample.len() as f64 > BINARY_THRESHOLD
}

fn file_hash(content: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    let hex = format!("{:x}", hasher.finalize());
    hex[..16].to_string()
}

/// Index one file. Content-hash gate: unchanged files are not re-chunked.
pub fn index_file(
    conn: &Connection,
    abs_path: &Path,
    rel_path: &str,
    max_size_kb: u64,
) -> Result<FileOutcome> {
    if !abs_path.exists() {
        return remove_file(conn, rel_path).map(|_| FileOutcome::Removed);
    }
    let metadata = abs_path.metadata()?;
    if metadata.len() > max_size_kb * 1024 {
        return Ok(FileOutcome::Skipped);
    }

    let bytes = std::fs::read(abs_path)
        .with_context(|| format!("failed to read {}", abs_path.display()))?;
    if looks_binary(&bytes) {
        return Ok(FileOutcome::Skipped);
    }
    let content = String::from_utf8_lossy(&bytes).into_owned();
    let hash = file_hash(&content);

    let stored: Option<String> = conn
        .query_row(
            "SELECT content_hash FROM file_sources WHERE path = ?1",
            params![rel_path],
            |row| row.get(0),
        )
        .optional()?;
    if stored.as_deref() == Some(hash.as_str()) {
        return Ok(FileOutcome::Unchanged);
    }

    let slug = path_slug(rel_path);
    let chunks = chunk_text(&content);

    conn.execute("DELETE FROM bullets WHERE node_slug = ?1", params![slug])?;
    conn.execute(
        "INSERT OR REPLACE INTO nodes (slug, title, kind, bullet_count) VALUES (?1, ?2, 'doc', ?3)",
        params![slug, rel_path, chunks.len() as i64],
    )?;
    for (i, chunk) in chunks.iter().enumerate() {
        conn.execute(
            "INSERT INTO bullets (id, node_slug, kind, text) VALUES (?1, ?2, 'chunk', ?3)",
            params![format!("{slug}-c{i:04}"), slug, chunk],
        )?;
    }
    conn.execute(
        "INSERT OR REPLACE INTO file_sources (path, content_hash, slug, indexed_at) \
         VALUES (?1, ?2, ?3, ?4)",
        params![rel_path, hash, slug, chrono::Utc::now().to_rfc3339()],
    )?;

    Ok(FileOutcome::Indexed)
}

/// Drop a deleted file's synthetic node.
pub fn remove_file(conn: &Connection, rel_path: &str) -> Result<()> {
    let slug = path_slug(rel_path);
    conn.execute("DELETE FROM bullets WHERE node_slug = ?1", params![slug])?;
    conn.execute("DELETE FROM nodes WHERE slug = ?1", params![slug])?;
    conn.execute("DELETE FROM file_sources WHERE path = ?1", params![rel_path])?;
    Ok(())
}

#[derive(Debug, PartialEq)]
pub enum FileOutcome {
    Indexed,
    Unchanged,
    Skipped,
    Removed,
}

/// Compiled include/exclude matchers for a source.
pub struct SourceMatcher {
    include: GlobSet,
    exclude: GlobSet,
}

impl SourceMatcher {
    pub fn new(source: &SourceConfig) -> Result<Self> {
        Ok(Self {
            include: build_globset(&source.include)?,
            exclude: build_globset(&source.exclude)?,
        })
    }

    pub fn matches(&self, rel_path: &str) -> bool {
        self.include.is_match(rel_path) && !self.exclude.is_match(rel_path)
    }
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("bad glob: {pattern}"))?);
    }
    Ok(builder.build()?)
}

/// Sync one source: walk the tree (or `git ls-files` when configured),
/// index matching files, and drop rows for files that disappeared.
pub fn sync_source(conn: &Connection, root: &Path, source: &SourceConfig) -> Result<SyncReport> {
    let matcher = SourceMatcher::new(source)?;
    let mut report = SyncReport::default();

    let files = if source.use_git {
        git_ls_files(root).unwrap_or_else(|| walk_files(root))
    } else {
        walk_files(root)
    };

    let mut seen: Vec<String> = Vec::new();
    for rel in files {
        if !matcher.matches(&rel) {
            continue;
        }
        seen.push(rel.clone());
        match index_file(conn, &root.join(&rel), &rel, source.max_size_kb)? {
            FileOutcome::Indexed => report.indexed += 1,
            FileOutcome::Unchanged => report.unchanged += 1,
            FileOutcome::Skipped => report.skipped += 1,
            FileOutcome::Removed => report.removed += 1,
        }
    }

    // Files indexed before but gone (or no longer matching) now.
    let stored: Vec<String> = {
        let mut stmt = conn.prepare("SELECT path FROM file_sources")?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        rows
    };
    for path in stored {
        if matcher.matches(&path) && !seen.contains(&path) {
            remove_file(conn, &path)?;
            report.removed += 1;
        }
    }

    Ok(report)
}

/// `git ls-files` relative paths, or `None` when git is unavailable.
fn git_ls_files(root: &Path) -> Option<Vec<String>> {
    let output = std::process::Command::new("git")
        .arg("ls-files")
        .current_dir(root)
        .output()
        .ok()?;
    if !output.status.success() {
        return None;
    }
    Some(
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .map(str::to_string)
            .collect(),
    )
}

fn walk_files(root: &Path) -> Vec<String> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => continue,
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                // .git alone is always worth pruning.
                if path.file_name().map(|n| n == ".git").unwrap_or(false) {
                    continue;
                }
                stack.push(path);
            } else if let Ok(rel) = path.strip_prefix(root) {
                files.push(rel.to_string_lossy().into_owned());
            }
        }
    }
    files.sort();
    files
}

/// Resolve a changed absolute path to `(source index, rel path)`.
pub fn locate_changed_file<'a>(
    sources: &'a [(PathBuf, SourceConfig)],
    changed: &Path,
) -> Option<(usize, String)> {
    for (i, (root, _)) in sources.iter().enumerate() {
        if let Ok(rel) = changed.strip_prefix(root) {
            return Some((i, rel.to_string_lossy().into_owned()));
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn path_slug_is_stable_and_synthetic() {
        let slug = path_slug("docs/setup.md");
        assert!(slug.starts_with("_doc-"));
        assert_eq!(slug.len(), 5 + 12);
        assert_eq!(slug, path_slug("docs/setup.md"));
        assert_ne!(slug, path_slug("docs/other.md"));
    }

    #[test]
    fn chunking_respects_target_size() {
        let text = (0..200)
            .map(|i| format!("line number {i} with a reasonable amount of text on it"))
            .collect::<Vec<_>>()
            .join("\n");
        let chunks = chunk_text(&text);
        assert!(chunks.len() > 1);
        assert!(chunks.iter().all(|c| c.len() <= CHUNK_MAX + 1));
        assert!(chunks.iter().all(|c| c.trim().len() >= CHUNK_MIN));
    }

    #[test]
    fn tiny_content_yields_no_chunks() {
        assert!(chunk_text("short").is_empty());
    }

    #[test]
    fn binary_detection() {
        assert!(looks_binary(&[0u8; 512]));
        assert!(!looks_binary(b"plain text with\nnewlines and\ttabs"));
    }

    #[test]
    fn index_file_roundtrip_with_hash_gate() {
        let conn = crate::db::open_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("notes.md");
        let body = "searchable content line\n".repeat(20);
        std::fs::write(&file, &body).unwrap();

        assert_eq!(
            index_file(&conn, &file, "notes.md", 512).unwrap(),
            FileOutcome::Indexed
        );
        assert_eq!(
            index_file(&conn, &file, "notes.md", 512).unwrap(),
            FileOutcome::Unchanged
        );

        let hits = crate::index::search_keyword(&conn, "searchable", 10).unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].slug.starts_with("_doc-"));

        // Changed content re-chunks.
        std::fs::write(&file, "entirely different searchable body text\n".repeat(10)).unwrap();
        assert_eq!(
            index_file(&conn, &file, "notes.md", 512).unwrap(),
            FileOutcome::Indexed
        );

        // Deleted file drops its node.
        std::fs::remove_file(&file).unwrap();
        assert_eq!(
            index_file(&conn, &file, "notes.md", 512).unwrap(),
            FileOutcome::Removed
        );
        assert!(crate::index::search_keyword(&conn, "searchable", 10)
            .unwrap()
            .is_empty());
    }

    #[test]
    fn sync_source_walks_and_filters() {
        let conn = crate::db::open_memory().unwrap();
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("docs")).unwrap();
        std::fs::write(
            dir.path().join("docs/guide.md"),
            "guide content that is long enough to form a chunk of meaningful size\n".repeat(4),
        )
        .unwrap();
        std::fs::write(dir.path().join("ignore.bin"), [0u8; 100]).unwrap();

        let source = SourceConfig {
            name: "docs".into(),
            include: vec!["**/*.md".into()],
            exclude: vec![],
            use_git: false,
            ..SourceConfig::default()
        };
        let report = sync_source(&conn, dir.path(), &source).unwrap();
        assert_eq!(report.indexed, 1);

        let second = sync_source(&conn, dir.path(), &source).unwrap();
        assert_eq!(second.unchanged, 1);

        std::fs::remove_file(dir.path().join("docs/guide.md")).unwrap();
        let third = sync_source(&conn, dir.path(), &source).unwrap();
        assert_eq!(third.removed, 1);
    }
}
