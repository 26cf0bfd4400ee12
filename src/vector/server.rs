//! The vector server process.
//!
//! Keeps the embedding model and the in-memory index warm across queries.
//! Loads all vectors from the derived store at start; the watcher POSTs
//! `/add` after each reindex so the index follows the store. Any crash is
//! recovered by restarting and reloading.
//!
//! Routes:
//! - `GET  /health`    → `{"status": "ok", "n_vectors": N}`
//! - `POST /embed`     → `{"vectors": [[f32, …]]}`
//! - `POST /search`    → `{"results": [{"id": …, "score": …}]}`
//! - `POST /add`       → `{"ok": true}`
//! - `POST /add_batch` → `{"ok": true, "n": N}`

use anyhow::{Context, Result};
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;

use super::index::VectorIndex;
use crate::config::GroveConfig;
use crate::embedding::{self, EmbeddingProvider};

#[derive(Clone)]
struct AppState {
    index: Arc<VectorIndex>,
    provider: Arc<dyn EmbeddingProvider>,
}

/// Load `(bullet_id, vector)` rows from the derived store.
pub fn load_vectors(db_path: &std::path::Path) -> Result<Vec<(String, Vec<f32>)>> {
    if !db_path.exists() {
        return Ok(Vec::new());
    }
    let conn = crate::db::open_readonly(db_path)?;
    let mut stmt = conn.prepare("SELECT bullet_id, vector FROM embeddings")?;
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let blob: Vec<u8> = row.get(1)?;
            Ok((id, embedding::blob_to_vec(&blob)))
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(rows)
}

/// Run the vector server until the process is killed.
pub async fn run(config: GroveConfig) -> Result<()> {
    let provider: Arc<dyn EmbeddingProvider> = Arc::from(embedding::create_provider(
        &config.embeddings.model,
        &config.embedding_cache_dir(),
    )?);

    let index = Arc::new(VectorIndex::new());
    let db_path = config.db_path();
    let rows = tokio::task::spawn_blocking(move || load_vectors(&db_path)).await??;
    let loaded = rows.len();
    index.load(rows);
    tracing::info!(n_vectors = loaded, "vector index loaded from store");

    let state = AppState { index, provider };
    let app = Router::new()
        .route("/health", get(health))
        .route("/embed", post(embed))
        .route("/search", post(search))
        .route("/add", post(add))
        .route("/add_batch", post(add_batch))
        .with_state(state);

    let bind = format!("127.0.0.1:{}", config.server.vector_port);
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind {bind}"))?;
    tracing::info!(addr = %bind, "vector server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("vector server shutting down");
        })
        .await?;
    Ok(())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({ "status": "ok", "n_vectors": state.index.len() }))
}

#[derive(Deserialize)]
struct EmbedRequest {
    texts: Vec<String>,
}

async fn embed(
    State(state): State<AppState>,
    Json(req): Json<EmbedRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if req.texts.is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "texts must be non-empty"));
    }
    let provider = state.provider.clone();
    let vectors = tokio::task::spawn_blocking(move || {
        let refs: Vec<&str> = req.texts.iter().map(String::as_str).collect();
        provider.embed_batch(&refs)
    })
    .await
    .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?
    .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string()))?;

    Ok(Json(json!({ "vectors": vectors })))
}

#[derive(Deserialize)]
struct SearchRequest {
    vector: Vec<f32>,
    #[serde(default = "default_k")]
    k: usize,
}

fn default_k() -> usize {
    20
}

async fn search(
    State(state): State<AppState>,
    Json(req): Json<SearchRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if req.vector.is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "vector must be non-empty"));
    }
    let results: Vec<Value> = state
        .index
        .search(&req.vector, req.k)
        .into_iter()
        .map(|(id, score)| json!({ "id": id, "score": score }))
        .collect();
    Ok(Json(json!({ "results": results })))
}

#[derive(Deserialize)]
struct AddRequest {
    id: String,
    vector: Vec<f32>,
}

async fn add(
    State(state): State<AppState>,
    Json(req): Json<AddRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if req.id.is_empty() || req.vector.is_empty() {
        return Err(error(StatusCode::BAD_REQUEST, "id and vector are required"));
    }
    state.index.add(&req.id, req.vector);
    Ok(Json(json!({ "ok": true })))
}

#[derive(Deserialize)]
struct AddBatchRequest {
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
}

async fn add_batch(
    State(state): State<AppState>,
    Json(req): Json<AddBatchRequest>,
) -> Result<Json<Value>, (StatusCode, Json<Value>)> {
    if req.ids.len() != req.vectors.len() {
        return Err(error(
            StatusCode::BAD_REQUEST,
            "ids and vectors must have the same length",
        ));
    }
    let n = req.ids.len();
    for (id, vector) in req.ids.into_iter().zip(req.vectors) {
        state.index.add(&id, vector);
    }
    Ok(Json(json!({ "ok": true, "n": n })))
}

fn error(status: StatusCode, message: &str) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": message })))
}
