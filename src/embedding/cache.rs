//! Content-addressed disk cache for embeddings.
//!
//! Layout: `<cache_dir>/<safe_model_id>/<sha256(text)>.vec`, raw
//! little-endian f32 bytes. The cache survives process restarts and is
//! shared across projects; keys include the model so a model switch never
//! serves stale vectors.

use anyhow::Result;
use std::path::PathBuf;

use super::{blob_to_vec, content_hash, vec_to_blob, EmbeddingProvider};

pub struct CachedProvider {
    inner: Box<dyn EmbeddingProvider>,
    dir: PathBuf,
}

impl CachedProvider {
    pub fn new(inner: Box<dyn EmbeddingProvider>, cache_dir: &std::path::Path) -> Self {
        let dir = cache_dir.join(safe_model_name(inner.model_id()));
        Self { inner, dir }
    }

    fn entry_path(&self, text: &str) -> PathBuf {
        self.dir.join(format!("{}.vec", content_hash(text)))
    }

    fn read_entry(&self, text: &str) -> Option<Vec<f32>> {
        let path = self.entry_path(text);
        let bytes = std::fs::read(path).ok()?;
        let vec = blob_to_vec(&bytes);
        (vec.len() == self.inner.dim()).then_some(vec)
    }

    fn write_entry(&self, text: &str, vector: &[f32]) {
        if std::fs::create_dir_all(&self.dir).is_err() {
            return;
        }
        // Tmp + rename so concurrent readers never see a torn write.
        let path = self.entry_path(text);
        let tmp = path.with_extension("tmp");
        if std::fs::write(&tmp, vec_to_blob(vector)).is_ok() {
            let _ = std::fs::rename(&tmp, &path);
        }
    }
}

impl EmbeddingProvider for CachedProvider {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut results: Vec<Option<Vec<f32>>> = texts.iter().map(|t| self.read_entry(t)).collect();

        let misses: Vec<usize> = (0..texts.len()).filter(|&i| results[i].is_none()).collect();
        if !misses.is_empty() {
            let miss_texts: Vec<&str> = misses.iter().map(|&i| texts[i]).collect();
            let computed = self.inner.embed_batch(&miss_texts)?;
            anyhow::ensure!(
                computed.len() == misses.len(),
                "provider returned {} vectors for {} texts",
                computed.len(),
                misses.len()
            );
            for (&i, vector) in misses.iter().zip(computed) {
                self.write_entry(texts[i], &vector);
                results[i] = Some(vector);
            }
        }

        Ok(results.into_iter().flatten().collect())
    }

    fn dim(&self) -> usize {
        self.inner.dim()
    }

    fn model_id(&self) -> &str {
        self.inner.model_id()
    }
}

/// Sanitize a model string for use as a directory name.
fn safe_model_name(model: &str) -> String {
    model
        .chars()
        .map(|c| if c == '/' || c == ':' { '_' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Counts how many texts reach the backing provider.
    struct CountingProvider {
        calls: Arc<AtomicUsize>,
    }

    impl EmbeddingProvider for CountingProvider {
        fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(texts.len(), Ordering::SeqCst);
            Ok(texts.iter().map(|t| vec![t.len() as f32, 1.0]).collect())
        }
        fn dim(&self) -> usize {
            2
        }
        fn model_id(&self) -> &str {
            "test/counting:v1"
        }
    }

    #[test]
    fn cache_hits_skip_the_provider() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let cached = CachedProvider::new(
            Box::new(CountingProvider { calls: calls.clone() }),
            dir.path(),
        );

        let first = cached.embed_batch(&["alpha", "beta"]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let second = cached.embed_batch(&["alpha", "beta", "gamma"]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 3, "only gamma was a miss");
        assert_eq!(first[0], second[0]);
        assert_eq!(first[1], second[1]);
    }

    #[test]
    fn cache_survives_a_new_instance() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        {
            let cached = CachedProvider::new(
                Box::new(CountingProvider { calls: calls.clone() }),
                dir.path(),
            );
            cached.embed_batch(&["persistent"]).unwrap();
        }
        let cached = CachedProvider::new(
            Box::new(CountingProvider { calls: calls.clone() }),
            dir.path(),
        );
        cached.embed_batch(&["persistent"]).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn model_names_are_directory_safe() {
        assert_eq!(safe_model_name("gemini:models/embed-001"), "gemini_models_embed-001");
    }
}
