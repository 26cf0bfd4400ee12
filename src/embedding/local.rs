//! Local on-device embedding via fastembed (bundled ONNX runtime).
//!
//! Models are downloaded on first use and cached by fastembed; after that
//! no network access is needed.

use anyhow::{bail, Context, Result};
use fastembed::{EmbeddingModel, InitOptions, TextEmbedding};
use std::sync::Mutex;

use super::EmbeddingProvider;

pub struct FastembedProvider {
    // fastembed's embed() takes &mut self.
    model: Mutex<TextEmbedding>,
    model_id: String,
    dim: usize,
}

impl FastembedProvider {
    pub fn new(model_name: &str) -> Result<Self> {
        let (fe_model, dim) = resolve_model(model_name)?;
        let model = TextEmbedding::try_new(
            InitOptions::new(fe_model).with_show_download_progress(false),
        )
        .context("failed to initialize local embedding model")?;
        tracing::info!(model = model_name, dim, "local embedding model ready");

        Ok(Self {
            model: Mutex::new(model),
            model_id: format!("fastembed:{model_name}"),
            dim,
        })
    }
}

impl EmbeddingProvider for FastembedProvider {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let owned: Vec<String> = texts.iter().map(|t| t.to_string()).collect();
        let mut model = self
            .model
            .lock()
            .map_err(|e| anyhow::anyhow!("embedding model lock poisoned: {e}"))?;
        model
            .embed(owned, None)
            .map_err(|e| anyhow::anyhow!("local embedding failed: {e}"))
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

fn resolve_model(name: &str) -> Result<(EmbeddingModel, usize)> {
    Ok(match name {
        "all-minilm-l6-v2" => (EmbeddingModel::AllMiniLML6V2, 384),
        "bge-small-en-v1.5" => (EmbeddingModel::BGESmallENV15, 384),
        "bge-base-en-v1.5" => (EmbeddingModel::BGEBaseENV15, 768),
        "bge-large-en-v1.5" => (EmbeddingModel::BGELargeENV15, 1024),
        "nomic-embed-text-v1.5" => (EmbeddingModel::NomicEmbedTextV15, 768),
        "multilingual-e5-small" => (EmbeddingModel::MultilingualE5Small, 384),
        other => bail!(
            "unknown local embedding model: '{other}'. Supported: all-minilm-l6-v2, \
             bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5, \
             nomic-embed-text-v1.5, multilingual-e5-small"
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_models_resolve() {
        assert_eq!(resolve_model("bge-small-en-v1.5").unwrap().1, 384);
        assert_eq!(resolve_model("bge-base-en-v1.5").unwrap().1, 768);
        assert!(resolve_model("not-a-model").is_err());
    }
}
