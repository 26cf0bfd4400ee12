//! Client side of the vector server: warm path over HTTP, cold fallback
//! straight against the derived store.
//!
//! All calls are blocking; async callers wrap them in `spawn_blocking`.

use anyhow::Result;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::index::VectorIndex;
use crate::embedding::EmbeddingProvider;

const TIMEOUT: Duration = Duration::from_secs(5);

pub struct VectorClient {
    base_url: String,
    db_path: PathBuf,
    provider: Arc<dyn EmbeddingProvider>,
    http: Client,
}

impl VectorClient {
    pub fn new(vector_port: u16, db_path: PathBuf, provider: Arc<dyn EmbeddingProvider>) -> Self {
        Self {
            base_url: format!("http://127.0.0.1:{vector_port}"),
            db_path,
            provider,
            http: Client::builder()
                .timeout(TIMEOUT)
                .build()
                .expect("reqwest client"),
        }
    }

    /// Embed a query: server first (keeps its model warm), local provider
    /// as fallback.
    pub fn embed_query(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(response) = self.post("/embed", &json!({ "texts": [text] })) {
            if let Some(vector) = response
                .get("vectors")
                .and_then(Value::as_array)
                .and_then(|vs| vs.first())
                .and_then(Value::as_array)
            {
                return Ok(vector
                    .iter()
                    .map(|v| v.as_f64().unwrap_or(0.0) as f32)
                    .collect());
            }
        }
        self.provider.embed(text)
    }

    /// Nearest bullets by cosine: server first, local store scan fallback.
    pub fn search(&self, vector: &[f32], k: usize) -> Result<Vec<(String, f64)>> {
        if let Some(response) = self.post("/search", &json!({ "vector": vector, "k": k })) {
            if let Some(results) = response.get("results").and_then(Value::as_array) {
                return Ok(results
                    .iter()
                    .filter_map(|r| {
                        let id = r.get("id")?.as_str()?.to_string();
                        let score = r.get("score")?.as_f64()?;
                        Some((id, score))
                    })
                    .collect());
            }
        }

        // Cold path: score against the store directly.
        let rows = super::server::load_vectors(&self.db_path)?;
        let index = VectorIndex::new();
        index.load(rows);
        Ok(index.search(vector, k))
    }

    /// Embed then search, the common retrieval path.
    pub fn search_text(&self, text: &str, k: usize) -> Result<Vec<(String, f64)>> {
        let vector = self.embed_query(text)?;
        self.search(&vector, k)
    }

    /// Push a freshly stored vector to the running server. Best-effort:
    /// a dead server just reloads from the store on restart.
    pub fn notify_add(&self, bullet_id: &str, vector: &[f32]) {
        let _ = self.post("/add", &json!({ "id": bullet_id, "vector": vector }));
    }

    /// POST returning `None` on any transport error (server not running).
    fn post(&self, path: &str, body: &Value) -> Option<Value> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .ok()?;
        if !response.status().is_success() {
            return None;
        }
        response.json().ok()
    }
}
