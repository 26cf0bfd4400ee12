//! Thread-safe in-memory cosine-similarity index.
//!
//! Vectors are L2-normalized on insert, so similarity is a dot product.
//! The index is rebuilt from the embeddings table at process start and
//! kept current via incremental inserts.

use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Default)]
struct Inner {
    ids: Vec<String>,
    vectors: Vec<Vec<f32>>,
    by_id: HashMap<String, usize>,
}

#[derive(Default)]
pub struct VectorIndex {
    inner: RwLock<Inner>,
}

impl VectorIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("index lock").ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Insert or replace a single vector.
    pub fn add(&self, id: &str, vector: Vec<f32>) {
        let vector = normalize(vector);
        let mut inner = self.inner.write().expect("index lock");
        match inner.by_id.get(id).copied() {
            Some(idx) => inner.vectors[idx] = vector,
            None => {
                let idx = inner.ids.len();
                inner.ids.push(id.to_string());
                inner.vectors.push(vector);
                inner.by_id.insert(id.to_string(), idx);
            }
        }
    }

    /// Bulk-load, replacing the whole index.
    pub fn load(&self, entries: Vec<(String, Vec<f32>)>) {
        let mut inner = self.inner.write().expect("index lock");
        inner.ids.clear();
        inner.vectors.clear();
        inner.by_id.clear();
        for (id, vector) in entries {
            let idx = inner.ids.len();
            inner.by_id.insert(id.clone(), idx);
            inner.ids.push(id);
            inner.vectors.push(normalize(vector));
        }
    }

    pub fn remove(&self, id: &str) {
        let mut inner = self.inner.write().expect("index lock");
        if let Some(idx) = inner.by_id.remove(id) {
            inner.ids.swap_remove(idx);
            inner.vectors.swap_remove(idx);
            if idx < inner.ids.len() {
                let moved = inner.ids[idx].clone();
                inner.by_id.insert(moved, idx);
            }
        }
    }

    /// Top-k by cosine similarity, best first. Ties break on ascending ID
    /// so results are deterministic.
    pub fn search(&self, query: &[f32], k: usize) -> Vec<(String, f64)> {
        let query = normalize(query.to_vec());
        let inner = self.inner.read().expect("index lock");

        let mut scored: Vec<(usize, f32)> = inner
            .vectors
            .iter()
            .enumerate()
            .filter(|(_, v)| v.len() == query.len())
            .map(|(i, v)| (i, dot(&query, v)))
            .collect();
        scored.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| inner.ids[a.0].cmp(&inner.ids[b.0]))
        });
        scored
            .into_iter()
            .take(k)
            .map(|(i, score)| (inner.ids[i].clone(), score as f64))
            .collect()
    }
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn normalize(mut v: Vec<f32>) -> Vec<f32> {
    let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 0.0 {
        for x in &mut v {
            *x /= norm;
        }
    }
    v
}
