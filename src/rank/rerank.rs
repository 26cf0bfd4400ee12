//! Cross-encoder reranking over (query, bullet text) pairs.
//!
//! Scores the top candidates with a fastembed cross-encoder. A rerank
//! failure is a channel failure: the caller keeps the fused order.

use anyhow::{bail, Context, Result};
use fastembed::{RerankInitOptions, RerankerModel, TextRerank};
use std::sync::Mutex;

pub struct Reranker {
    // fastembed's rerank() takes &mut self.
    model: Mutex<TextRerank>,
    model_id: String,
}

impl Reranker {
    pub fn new(model_name: &str) -> Result<Self> {
        let model = TextRerank::try_new(
            RerankInitOptions::new(resolve_model(model_name)?).with_show_download_progress(false),
        )
        .context("failed to initialize cross-encoder")?;
        tracing::info!(model = model_name, "cross-encoder ready");
        Ok(Self {
            model: Mutex::new(model),
            model_id: model_name.to_string(),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    /// Score documents against the query. Returns raw cross-encoder scores
    /// in input order (higher is better).
    pub fn score(&self, query: &str, documents: &[&str]) -> Result<Vec<f64>> {
        if documents.is_empty() {
            return Ok(Vec::new());
        }
        let mut model = self
            .model
            .lock()
            .map_err(|e| anyhow::anyhow!("reranker lock poisoned: {e}"))?;
        let results = model
            .rerank(query, documents.to_vec(), false, None)
            .map_err(|e| anyhow::anyhow!("rerank failed: {e}"))?;

        // fastembed returns results best-first; restore input order.
        let mut scores = vec![0.0f64; documents.len()];
        for result in results {
            if let Some(slot) = scores.get_mut(result.index) {
                *slot = result.score as f64;
            }
        }
        Ok(scores)
    }
}

fn resolve_model(name: &str) -> Result<RerankerModel> {
    Ok(match name {
        "jinaai/jina-reranker-v1-turbo-en" => RerankerModel::JINARerankerV1TurboEn,
        "BAAI/bge-reranker-base" => RerankerModel::BGERerankerBase,
        other => bail!(
            "unknown reranker model: '{other}'. Supported: \
             jinaai/jina-reranker-v1-turbo-en, BAAI/bge-reranker-base"
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_resolve() {
        assert!(resolve_model("jinaai/jina-reranker-v1-turbo-en").is_ok());
        assert!(resolve_model("BAAI/bge-reranker-base").is_ok());
        assert!(resolve_model("nonsense").is_err());
    }
}
