//! Text-to-vector embedding: provider trait, factory, and vector helpers.
//!
//! Providers are selected by a prefixed model string:
//! - `fastembed:<model>` (or a bare model name) — local ONNX inference
//! - `gemini:<model>` — Gemini embeddings REST API
//! - `openai:<model>` — OpenAI embeddings REST API
//!
//! All methods are synchronous — callers on async paths should use
//! `tokio::task::spawn_blocking`. [`create_provider`] wraps every provider
//! in a content-addressed disk cache shared across projects.

pub mod cache;
pub mod local;
pub mod remote;

use anyhow::Result;
use sha2::{Digest, Sha256};
use std::path::Path;

/// Trait for embedding text into dense vectors.
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a batch of texts, one vector per input, in order.
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>>;

    /// Embed a single text.
    fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let mut vectors = self.embed_batch(&[text])?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("provider returned no vector"))
    }

    /// Number of dimensions this provider produces.
    fn dim(&self) -> usize;

    /// Stable identifier pinning stored vectors to the producing model.
    fn model_id(&self) -> &str;
}

/// Create the configured provider, wrapped in the disk cache.
pub fn create_provider(
    model: &str,
    cache_dir: &Path,
) -> Result<Box<dyn EmbeddingProvider>> {
    let inner: Box<dyn EmbeddingProvider> = if let Some(bare) = model.strip_prefix("gemini:") {
        Box::new(remote::GeminiProvider::new(bare)?)
    } else if let Some(bare) = model.strip_prefix("openai:") {
        Box::new(remote::OpenAiProvider::new(bare)?)
    } else {
        let bare = model.strip_prefix("fastembed:").unwrap_or(model);
        Box::new(local::FastembedProvider::new(bare)?)
    };
    Ok(Box::new(cache::CachedProvider::new(inner, cache_dir)))
}

/// SHA-256 hex digest of a bullet's text — pins a stored vector to the
/// exact text that produced it.
pub fn content_hash(text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}

/// Encode a float vector as little-endian f32 bytes for BLOB storage.
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blob_roundtrip() {
        let vec = vec![1.0f32, -2.5, 3.125, 0.0, -0.001];
        assert_eq!(blob_to_vec(&vec_to_blob(&vec)), vec);
    }

    #[test]
    fn content_hash_is_stable_and_distinct() {
        assert_eq!(content_hash("alpha"), content_hash("alpha"));
        assert_ne!(content_hash("alpha"), content_hash("beta"));
        assert_eq!(content_hash("alpha").len(), 64);
    }
}
