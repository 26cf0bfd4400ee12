//! CLI command implementations.
//!
//! Commands mutate the record files and read the derived store; the
//! running watcher projects record changes. `reindex` and `calibrate` are
//! the exceptions — maintenance commands that write the derived store
//! directly and expect the watcher to be stopped (or tolerate its lock).

use anyhow::Result;
use std::path::Path;

use crate::config::GroveConfig;
use crate::error::GroveError;
use crate::rank::{calibrate, RankRequest};
use crate::store::records::BulletKind;
use crate::store::RecordStore;

pub fn init(path: &Path, name: Option<&str>) -> Result<()> {
    let config_path = crate::config::init_config(path, name)?;
    let config = GroveConfig::load_from_root(path)?;
    config.ensure_dirs()?;
    println!("Initialized grove project at {}", config_path.display());
    println!("Records: {}", config.nodes_dir().display());
    println!("Index:   {}", config.db_path().display());
    Ok(())
}

pub fn add(config: &GroveConfig, slug: &str, text: &str, kind: &str) -> Result<()> {
    let kind: BulletKind = kind.parse().map_err(GroveError::Input)?;
    let store = RecordStore::new(config.nodes_dir());
    let bullet = store.add(slug, text, kind)?;
    println!("{}", bullet.id);
    Ok(())
}

pub fn update(config: &GroveConfig, bullet_id: &str, text: &str) -> Result<()> {
    let store = RecordStore::new(config.nodes_dir());
    let slug = store.update(bullet_id, text)?;
    println!("Updated {bullet_id} in [{slug}]");
    Ok(())
}

pub fn delete(config: &GroveConfig, bullet_id: &str) -> Result<()> {
    let store = RecordStore::new(config.nodes_dir());
    let slug = store.delete(bullet_id)?;
    println!("Deleted {bullet_id} from [{slug}]");
    Ok(())
}

pub fn show(config: &GroveConfig, slug: &str) -> Result<()> {
    let store = RecordStore::new(config.nodes_dir());
    let node = store
        .get(slug)?
        .ok_or_else(|| GroveError::Input(format!("node not found: {slug}")))?;
    println!("# {} [{}]", node.title(), node.slug);
    for bullet in node.live_bullets() {
        let votes = if bullet.useful > 0 || bullet.harmful > 0 {
            format!("  (+{}/-{})", bullet.useful, bullet.harmful)
        } else {
            String::new()
        };
        println!("- ({}) {}  ←{}{votes}", bullet.kind, bullet.text, bullet.id);
    }
    Ok(())
}

pub fn search(config: &GroveConfig, query: &str, limit: usize) -> Result<()> {
    let conn = crate::db::open_readonly(config.db_path())?;
    let hits = crate::index::search_keyword(&conn, query, limit)?;
    if hits.is_empty() {
        println!("(no results)");
        return Ok(());
    }
    for hit in hits {
        let preview: String = hit.text.chars().take(120).collect();
        println!("[{}] {} ←{}", hit.slug, preview, hit.bullet_id);
    }
    Ok(())
}

pub async fn context(
    config: &GroveConfig,
    query: &str,
    session_id: Option<String>,
    max_chars: usize,
) -> Result<()> {
    let ranker = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || crate::server::build_ranker(&config)).await?
    };
    let mut request = RankRequest::new(query);
    request.session_id = session_id;
    let outcome = ranker.rank(request).await?;

    let conn = crate::db::open_readonly(config.db_path())?;
    let packed = crate::rank::context::build_context(
        &conn,
        &outcome.candidates,
        max_chars,
        config.review.budget_threshold,
    )?;
    if packed.nodes.is_empty() {
        println!("(no results)");
        return Ok(());
    }
    drop(conn);

    let budget_conn = crate::db::open_budget_writer(config.db_path())?;
    crate::review::accrue_served(&budget_conn, &packed.served_chars())?;

    println!("{}", packed.format_compact());
    if outcome.partial {
        println!("\n(partial: some retrieval channels unavailable)");
    }
    Ok(())
}

pub fn reindex(config: &GroveConfig) -> Result<()> {
    config.ensure_dirs()?;
    let store = RecordStore::new(config.nodes_dir());
    let (mut conn, _) = crate::db::open_rw(config.db_path())?;

    let model_id = crate::db::migrations::get_embedding_model(&conn)?.unwrap_or_default();
    let (nodes, pending) = crate::index::reindex_all(&mut conn, &store, &model_id)?;
    println!("Reindexed {nodes} nodes ({} embeddings pending).", pending.len());

    for source in &config.sources {
        let report = crate::sources::sync_source(&conn, &config.source_root(source), source)?;
        println!(
            "Source [{}]: {} indexed, {} unchanged, {} removed.",
            source.name, report.indexed, report.unchanged, report.removed
        );
    }
    Ok(())
}

pub fn run_calibrate(config: &GroveConfig) -> Result<()> {
    let (conn, _) = crate::db::open_rw(config.db_path())?;

    let vector = crate::embedding::create_provider(
        &config.embeddings.model,
        &config.embedding_cache_dir(),
    )
    .ok()
    .map(|provider| {
        crate::vector::VectorClient::new(
            config.server.vector_port,
            config.db_path(),
            std::sync::Arc::from(provider),
        )
    });
    let search = vector
        .as_ref()
        .map(|client| move |text: &str, k: usize| client.search_text(text, k));
    let search_ref: Option<&dyn Fn(&str, usize) -> Result<Vec<(String, f64)>>> =
        search.as_ref().map(|f| f as _);

    let report = calibrate::calibrate(&conn, search_ref, calibrate::DEFAULT_SAMPLE_SIZE)?;
    println!(
        "Calibrated from {} samples: keyword {} ({} scores), vector {} ({} scores).",
        report.sampled,
        if report.fts_calibrated { "ok" } else { "skipped" },
        report.fts_scores,
        if report.vec_calibrated { "ok" } else { "skipped" },
        report.vec_scores,
    );
    Ok(())
}

pub fn review(config: &GroveConfig, threshold: Option<f64>, limit: usize) -> Result<()> {
    let conn = crate::db::open_readonly(config.db_path())?;
    let entries = crate::review::review_list(
        &conn,
        threshold.unwrap_or(config.review.budget_threshold),
        limit,
    )?;
    println!("{}", crate::review::format_review_list(&entries));
    Ok(())
}

pub fn mark_reviewed(config: &GroveConfig, slug: &str) -> Result<()> {
    let store = RecordStore::new(config.nodes_dir());
    store.mark_reviewed(slug)?;
    if let Ok(conn) = crate::db::open_budget_writer(config.db_path()) {
        conn.execute(
            "UPDATE node_budget SET served_chars = 0, cleared_at = ?2 WHERE slug = ?1",
            rusqlite::params![
                slug,
                chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true)
            ],
        )?;
    }
    println!("Marked reviewed: {slug}");
    Ok(())
}

pub fn status(config: &GroveConfig) -> Result<()> {
    println!("Project: {} ({})", config.name, config.root.display());

    match crate::db::open_readonly(config.db_path()) {
        Ok(conn) => {
            let health = crate::db::check_health(&conn)?;
            println!(
                "Index:   {} nodes, {} bullets, {} backlinks, {} embedded (schema v{})",
                health.node_count,
                health.bullet_count,
                health.backlink_count,
                health.embedded_count,
                health.schema_version,
            );
            if let Some(model) = health.embedding_model {
                println!("Model:   {model}");
            }
            println!(
                "Calibration: {} ({} ops since last pass)",
                if health.calibrated { "ok" } else { "never run" },
                health.ops_since_calibration,
            );
            let flagged =
                crate::review::review_list(&conn, config.review.budget_threshold, 100)?;
            if !flagged.is_empty() {
                println!("Review:  {} node(s) flagged — run `grove review`", flagged.len());
            }
        }
        Err(err) => println!("Index:   unavailable ({err})"),
    }

    let vector_addr = format!("127.0.0.1:{}", config.server.vector_port);
    let vector_up = vector_addr
        .parse()
        .ok()
        .and_then(|addr| {
            std::net::TcpStream::connect_timeout(&addr, std::time::Duration::from_millis(300)).ok()
        })
        .is_some();
    println!(
        "Vector:  {} on port {}",
        if vector_up { "running" } else { "not running" },
        config.server.vector_port
    );

    match crate::watcher::read_status(&config.status_path()) {
        Some(ws) => {
            println!(
                "Watcher: pid {} since {}, {} indexed, {} dirty{}",
                ws.pid,
                ws.started_at,
                ws.indexed_total,
                ws.dirty,
                ws.last_error
                    .map(|e| format!(", last error: {e}"))
                    .unwrap_or_default(),
            );
        }
        None => println!("Watcher: not running (no status file)"),
    }
    Ok(())
}
