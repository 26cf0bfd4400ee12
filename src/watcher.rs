//! The watcher: the single writer to the derived store.
//!
//! Subscribes to filesystem events under `nodes/` (and any configured
//! source roots), coalesces them into a per-slug dirty set with a ~100 ms
//! debounce, and projects dirty nodes through the indexer. Embeddings are
//! computed off the flush path on blocking threads and pushed to the
//! vector server.
//!
//! Signals: SIGHUP reloads configuration (config file + embedding
//! provider) without reopening the store; SIGTERM flushes the dirty set
//! and exits. Index-write errors retry with exponential backoff (capped at
//! 30 s) and are reported through the status file, never by crashing.

use anyhow::{Context, Result};
use fs2::FileExt;
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::config::{GroveConfig, SourceConfig};
use crate::embedding::EmbeddingProvider;
use crate::error::GroveError;
use crate::index::EmbedJob;
use crate::rank::calibrate;
use crate::store::RecordStore;
use crate::vector::VectorClient;

const DEBOUNCE: Duration = Duration::from_millis(100);
const BACKOFF_INITIAL: Duration = Duration::from_millis(250);
const BACKOFF_CAP: Duration = Duration::from_secs(30);
const EMBED_BATCH: usize = 32;

/// Written to `index/status.json` after every flush; read by `grove status`.
#[derive(Debug, Serialize, Deserialize, Default)]
pub struct WatcherStatus {
    pub pid: u32,
    pub started_at: String,
    pub last_flush: Option<String>,
    pub dirty: usize,
    pub indexed_total: u64,
    pub unembedded: u64,
    pub last_error: Option<String>,
}

enum Change {
    Node(String),
    SourceFile(usize, String),
}

/// Run the watcher until SIGTERM/ctrl-c. Holds the writer lock for its
/// whole lifetime; a second instance fails fast with `WriterConflict`.
pub async fn run(mut config: GroveConfig) -> Result<()> {
    config.ensure_dirs()?;

    let lock_file = std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .open(config.writer_lock_path())?;
    lock_file.try_lock_exclusive().map_err(|_| {
        GroveError::WriterConflict(format!(
            "another watcher holds {}",
            config.writer_lock_path().display()
        ))
    })?;

    let store = RecordStore::new(config.nodes_dir());
    let (mut conn, stale) = crate::db::open_rw(config.db_path())?;

    let mut provider = make_provider(&config).await;
    let model_id = provider
        .as_ref()
        .map(|p| p.model_id().to_string())
        .unwrap_or_default();
    if let Some(p) = &provider {
        crate::db::migrations::set_embedding_model(&conn, p.model_id())?;
    }

    let mut status = WatcherStatus {
        pid: std::process::id(),
        started_at: chrono::Utc::now().to_rfc3339(),
        ..Default::default()
    };

    let mut vector = provider.as_ref().map(|p| {
        Arc::new(VectorClient::new(
            config.server.vector_port,
            config.db_path(),
            p.clone(),
        ))
    });

    if stale {
        eprintln!("grove: derived store was stale — rebuilt from records");
        let (nodes, jobs) = crate::index::reindex_all(&mut conn, &store, &model_id)?;
        tracing::info!(nodes, pending = jobs.len(), "full rebuild complete");
        status.indexed_total += nodes as u64;
        status.unembedded +=
            embed_jobs(config.db_path(), provider.clone(), vector.clone(), jobs).await;
    }

    // Bridge notify's callback thread into the async loop.
    let (tx, mut rx) = mpsc::unbounded_channel::<notify::Event>();
    let mut watcher = RecommendedWatcher::new(
        move |result: notify::Result<notify::Event>| {
            if let Ok(event) = result {
                let _ = tx.send(event);
            }
        },
        notify::Config::default(),
    )?;
    watcher
        .watch(&config.nodes_dir(), RecursiveMode::Recursive)
        .with_context(|| format!("cannot watch {}", config.nodes_dir().display()))?;

    let mut source_roots = source_roots(&config);
    for (root, _) in &source_roots {
        if root.exists() {
            watcher.watch(root, RecursiveMode::Recursive)?;
        }
    }

    let mut sighup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())?;
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    let mut dirty_nodes: HashSet<String> = HashSet::new();
    let mut dirty_files: HashSet<(usize, String)> = HashSet::new();
    let mut flush_at: Option<Instant> = None;
    let mut backoff = BACKOFF_INITIAL;

    tracing::info!(
        nodes = %config.nodes_dir().display(),
        sources = source_roots.len(),
        "watcher running"
    );

    loop {
        let sleep = async {
            match flush_at {
                Some(at) => tokio::time::sleep_until(at).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            event = rx.recv() => {
                let event = match event {
                    Some(event) => event,
                    None => break,
                };
                for path in &event.paths {
                    match classify(&config.nodes_dir(), &source_roots, path) {
                        Some(Change::Node(slug)) => {
                            dirty_nodes.insert(slug);
                        }
                        Some(Change::SourceFile(i, rel)) => {
                            dirty_files.insert((i, rel));
                        }
                        None => {}
                    }
                }
                if !dirty_nodes.is_empty() || !dirty_files.is_empty() {
                    flush_at = Some(Instant::now() + DEBOUNCE);
                }
            }
            _ = sleep => {
                flush_at = None;
                let ok = flush(
                    &mut conn,
                    &store,
                    &config,
                    &source_roots,
                    &model_id,
                    provider.clone(),
                    vector.clone(),
                    &mut dirty_nodes,
                    &mut dirty_files,
                    &mut status,
                ).await;
                if ok {
                    backoff = BACKOFF_INITIAL;
                } else {
                    // Leftover dirty entries retry after the backoff delay.
                    flush_at = Some(Instant::now() + backoff);
                    backoff = (backoff * 2).min(BACKOFF_CAP);
                }
                write_status(&config.status_path(), &status, dirty_nodes.len());
            }
            _ = sighup.recv() => {
                tracing::info!("SIGHUP: reloading configuration");
                match GroveConfig::load_from_root(&config.root) {
                    Ok(fresh) => {
                        config = fresh;
                        provider = make_provider(&config).await;
                        if let Some(p) = &provider {
                            let _ = crate::db::migrations::set_embedding_model(&conn, p.model_id());
                        }
                        vector = provider.as_ref().map(|p| {
                            Arc::new(VectorClient::new(
                                config.server.vector_port,
                                config.db_path(),
                                p.clone(),
                            ))
                        });
                        source_roots = self::source_roots(&config);
                    }
                    Err(err) => tracing::error!(%err, "config reload failed, keeping old config"),
                }
            }
            _ = sigterm.recv() => {
                tracing::info!("SIGTERM: flushing and shutting down");
                break;
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupt: flushing and shutting down");
                break;
            }
        }
    }

    // Final flush so no observed change is lost.
    flush(
        &mut conn,
        &store,
        &config,
        &source_roots,
        &model_id,
        provider,
        vector,
        &mut dirty_nodes,
        &mut dirty_files,
        &mut status,
    )
    .await;
    write_status(&config.status_path(), &status, dirty_nodes.len());
    let _ = fs2::FileExt::unlock(&lock_file);
    Ok(())
}

/// Provider construction downloads models on first use — keep it off the
/// async threads.
async fn make_provider(config: &GroveConfig) -> Option<Arc<dyn EmbeddingProvider>> {
    let model = config.embeddings.model.clone();
    let cache_dir = config.embedding_cache_dir();
    let created = tokio::task::spawn_blocking(move || {
        crate::embedding::create_provider(&model, &cache_dir)
    })
    .await;
    match created {
        Ok(Ok(provider)) => Some(Arc::from(provider)),
        Ok(Err(err)) => {
            tracing::error!(%err, "embedding provider unavailable — keyword search only");
            None
        }
        Err(err) => {
            tracing::error!(%err, "embedding provider init panicked");
            None
        }
    }
}

fn source_roots(config: &GroveConfig) -> Vec<(PathBuf, SourceConfig)> {
    config
        .sources
        .iter()
        .map(|s| (config.source_root(s), s.clone()))
        .collect()
}

fn classify(
    nodes_dir: &Path,
    sources: &[(PathBuf, SourceConfig)],
    changed: &Path,
) -> Option<Change> {
    if let Ok(rel) = changed.strip_prefix(nodes_dir) {
        let slug = rel.components().next()?.as_os_str().to_string_lossy();
        // Only the log files matter; editor temp files are noise.
        let is_log = changed
            .file_name()
            .map(|n| n == "node.jsonl" || n == "meta.jsonl")
            .unwrap_or(false);
        return is_log.then(|| Change::Node(slug.into_owned()));
    }
    crate::sources::locate_changed_file(sources, changed)
        .map(|(i, rel)| Change::SourceFile(i, rel))
}

/// One flush pass. Returns false when something failed and should retry.
#[allow(clippy::too_many_arguments)]
async fn flush(
    conn: &mut Connection,
    store: &RecordStore,
    config: &GroveConfig,
    sources: &[(PathBuf, SourceConfig)],
    model_id: &str,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    vector: Option<Arc<VectorClient>>,
    dirty_nodes: &mut HashSet<String>,
    dirty_files: &mut HashSet<(usize, String)>,
    status: &mut WatcherStatus,
) -> bool {
    let mut ok = true;
    let mut jobs: Vec<EmbedJob> = Vec::new();

    for slug in std::mem::take(dirty_nodes) {
        match crate::index::reindex_node(conn, store, &slug, model_id) {
            Ok(outcome) => {
                tracing::info!(slug = %slug, touched = outcome.touched(), "node indexed");
                status.indexed_total += 1;
                jobs.extend(outcome.embed_pending);
            }
            Err(err) => {
                tracing::error!(slug = %slug, %err, "index write failed, will retry");
                status.last_error = Some(format!("{slug}: {err}"));
                dirty_nodes.insert(slug);
                ok = false;
            }
        }
    }

    for (i, rel) in std::mem::take(dirty_files) {
        let Some((root, source)) = sources.get(i) else { continue };
        match crate::sources::index_file(conn, &root.join(&rel), &rel, source.max_size_kb) {
            Ok(outcome) => tracing::debug!(file = %rel, ?outcome, "source file indexed"),
            Err(err) => {
                tracing::error!(file = %rel, %err, "source index failed, will retry");
                status.last_error = Some(format!("{rel}: {err}"));
                dirty_files.insert((i, rel));
                ok = false;
            }
        }
    }

    if ok {
        status.last_error = None;
    }
    status.unembedded += embed_jobs(config.db_path(), provider, vector.clone(), jobs).await;
    status.last_flush = Some(chrono::Utc::now().to_rfc3339());

    maybe_calibrate(
        config.db_path(),
        config.search.auto_calibrate_threshold,
        vector,
    )
    .await;
    ok
}

/// Compute and store vectors for pending bullets, off the indexing path.
/// Failures leave bullets unembedded — vector search skips them, keyword
/// search is unaffected. Returns how many bullets stayed unembedded.
async fn embed_jobs(
    db_path: PathBuf,
    provider: Option<Arc<dyn EmbeddingProvider>>,
    vector: Option<Arc<VectorClient>>,
    jobs: Vec<EmbedJob>,
) -> u64 {
    if jobs.is_empty() {
        return 0;
    }
    let Some(provider) = provider else {
        return jobs.len() as u64;
    };

    // Provider calls block (CPU or network) and use their own connection.
    let result = tokio::task::spawn_blocking(move || -> Result<u64> {
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "busy_timeout", "5000")?;
        let mut unembedded = 0u64;

        for batch in jobs.chunks(EMBED_BATCH) {
            let texts: Vec<&str> = batch.iter().map(|j| j.text.as_str()).collect();
            match provider.embed_batch(&texts) {
                Ok(vectors) => {
                    for (job, vec) in batch.iter().zip(&vectors) {
                        if let Err(err) = crate::index::store_embedding(
                            &conn,
                            &job.bullet_id,
                            vec,
                            provider.model_id(),
                            &job.text,
                        ) {
                            tracing::error!(bullet = %job.bullet_id, %err, "failed to store embedding");
                            unembedded += 1;
                            continue;
                        }
                        if let Some(client) = &vector {
                            client.notify_add(&job.bullet_id, vec);
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(%err, n = batch.len(), "embedding batch failed — bullets left unembedded");
                    unembedded += batch.len() as u64;
                }
            }
        }
        Ok(unembedded)
    })
    .await;

    match result {
        Ok(Ok(unembedded)) => unembedded,
        Ok(Err(err)) => {
            tracing::error!(%err, "embedding pass failed");
            0
        }
        Err(err) => {
            tracing::error!(%err, "embedding task panicked");
            0
        }
    }
}

/// Recalibrate when enough of the index changed since the last pass.
async fn maybe_calibrate(db_path: PathBuf, threshold: f64, vector: Option<Arc<VectorClient>>) {
    let result = tokio::task::spawn_blocking(move || -> Result<()> {
        let conn = Connection::open(&db_path)?;
        conn.pragma_update(None, "busy_timeout", "5000")?;

        let due = calibrate::never_calibrated(&conn)
            || calibrate::staleness(&conn).map(|s| s >= threshold).unwrap_or(false);
        if !due {
            return Ok(());
        }

        let search = vector
            .as_ref()
            .map(|client| move |text: &str, k: usize| client.search_text(text, k));
        let search_ref: Option<&dyn Fn(&str, usize) -> Result<Vec<(String, f64)>>> =
            search.as_ref().map(|f| f as _);

        let report = calibrate::calibrate(&conn, search_ref, calibrate::DEFAULT_SAMPLE_SIZE)?;
        tracing::info!(
            sampled = report.sampled,
            fts = report.fts_calibrated,
            vec = report.vec_calibrated,
            "auto-calibration complete"
        );
        Ok(())
    })
    .await;

    match result {
        Ok(Ok(())) => {}
        Ok(Err(err)) => tracing::error!(%err, "auto-calibration failed"),
        Err(err) => tracing::error!(%err, "calibration task panicked"),
    }
}

fn write_status(path: &Path, status: &WatcherStatus, dirty: usize) {
    let snapshot = WatcherStatus {
        pid: status.pid,
        started_at: status.started_at.clone(),
        last_flush: status.last_flush.clone(),
        dirty,
        indexed_total: status.indexed_total,
        unembedded: status.unembedded,
        last_error: status.last_error.clone(),
    };
    if let Ok(json) = serde_json::to_string_pretty(&snapshot) {
        let tmp = path.with_extension("json.tmp");
        if std::fs::write(&tmp, json).is_ok() {
            let _ = std::fs::rename(&tmp, path);
        }
    }
}

/// Read the status file left by a running (or exited) watcher.
pub fn read_status(path: &Path) -> Option<WatcherStatus> {
    let raw = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_routes_node_logs_only() {
        let nodes = PathBuf::from("/p/.grove/nodes");
        let sources = vec![(PathBuf::from("/p/docs"), SourceConfig::default())];

        match classify(&nodes, &sources, Path::new("/p/.grove/nodes/my-node/node.jsonl")) {
            Some(Change::Node(slug)) => assert_eq!(slug, "my-node"),
            _ => panic!("expected node change"),
        }
        match classify(&nodes, &sources, Path::new("/p/.grove/nodes/my-node/meta.jsonl")) {
            Some(Change::Node(slug)) => assert_eq!(slug, "my-node"),
            _ => panic!("expected node change"),
        }
        assert!(classify(&nodes, &sources, Path::new("/p/.grove/nodes/my-node/.swp")).is_none());

        match classify(&nodes, &sources, Path::new("/p/docs/guide.md")) {
            Some(Change::SourceFile(0, rel)) => assert_eq!(rel, "guide.md"),
            _ => panic!("expected source change"),
        }
        assert!(classify(&nodes, &sources, Path::new("/elsewhere/x")).is_none());
    }

    #[test]
    fn status_file_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("status.json");
        let status = WatcherStatus {
            pid: 42,
            started_at: "2026-01-01T00:00:00Z".into(),
            last_flush: Some("2026-01-01T00:01:00Z".into()),
            indexed_total: 7,
            ..Default::default()
        };
        write_status(&path, &status, 3);

        let read = read_status(&path).unwrap();
        assert_eq!(read.pid, 42);
        assert_eq!(read.dirty, 3);
        assert_eq!(read.indexed_total, 7);
    }
}
