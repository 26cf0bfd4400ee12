//! Remote embedding providers: Gemini and OpenAI.
//!
//! Both retry transient failures (HTTP 429/5xx, network errors) three
//! times with jittered exponential backoff and fail immediately on other
//! client errors — a bad API key or unknown model will not improve with
//! retries.

use anyhow::Result;
use rand::Rng;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::time::Duration;

use super::EmbeddingProvider;
use crate::error::GroveError;

const MAX_RETRIES: u32 = 3;
const TIMEOUT: Duration = Duration::from_secs(30);

/// Gemini embeddings (`gemini:<model>`). Reads `GEMINI_API_KEY` (or
/// `GOOGLE_API_KEY`) from the environment.
pub struct GeminiProvider {
    client: Client,
    model: String,
    model_id: String,
    api_key: String,
}

impl GeminiProvider {
    pub fn new(model: &str) -> Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .or_else(|_| std::env::var("GOOGLE_API_KEY"))
            .map_err(|_| {
                GroveError::ProviderHardFailure(
                    "GEMINI_API_KEY (or GOOGLE_API_KEY) not set".into(),
                )
            })?;
        Ok(Self {
            client: Client::builder().timeout(TIMEOUT).build()?,
            model: model.to_string(),
            model_id: format!("gemini:{model}"),
            api_key,
        })
    }
}

impl EmbeddingProvider for GeminiProvider {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:batchEmbedContents?key={}",
            self.model, self.api_key
        );
        let requests: Vec<Value> = texts
            .iter()
            .map(|t| {
                json!({
                    "model": format!("models/{}", self.model),
                    "content": {"parts": [{"text": t}]},
                    "outputDimensionality": self.dim(),
                })
            })
            .collect();
        let body = json!({ "requests": requests });

        let response = post_with_retry(&self.client, &url, &body, &[])?;
        let embeddings = response
            .get("embeddings")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow::anyhow!("Gemini response missing embeddings array"))?;

        embeddings
            .iter()
            .map(|e| {
                e.get("values")
                    .and_then(Value::as_array)
                    .map(|v| values_to_f32(v))
                    .ok_or_else(|| anyhow::anyhow!("Gemini embedding missing values"))
            })
            .collect()
    }

    fn dim(&self) -> usize {
        768
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

/// OpenAI embeddings (`openai:<model>`). Reads `OPENAI_API_KEY` from the
/// environment.
pub struct OpenAiProvider {
    client: Client,
    model: String,
    model_id: String,
    api_key: String,
    dim: usize,
}

impl OpenAiProvider {
    pub fn new(model: &str) -> Result<Self> {
        let api_key = std::env::var("OPENAI_API_KEY").map_err(|_| {
            GroveError::ProviderHardFailure("OPENAI_API_KEY not set".into())
        })?;
        let dim = match model {
            "text-embedding-3-large" => 3072,
            // text-embedding-3-small, text-embedding-ada-002
            _ => 1536,
        };
        Ok(Self {
            client: Client::builder().timeout(TIMEOUT).build()?,
            model: model.to_string(),
            model_id: format!("openai:{model}"),
            api_key,
            dim,
        })
    }
}

impl EmbeddingProvider for OpenAiProvider {
    fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let body = json!({ "model": self.model, "input": texts });
        let auth = format!("Bearer {}", self.api_key);
        let response = post_with_retry(
            &self.client,
            "https://api.openai.com/v1/embeddings",
            &body,
            &[("Authorization", auth.as_str())],
        )?;

        let data = response
            .get("data")
            .and_then(Value::as_array)
            .ok_or_else(|| anyhow::anyhow!("OpenAI response missing data array"))?;

        data.iter()
            .map(|item| {
                item.get("embedding")
                    .and_then(Value::as_array)
                    .map(|v| values_to_f32(v))
                    .ok_or_else(|| anyhow::anyhow!("OpenAI item missing embedding"))
            })
            .collect()
    }

    fn dim(&self) -> usize {
        self.dim
    }

    fn model_id(&self) -> &str {
        &self.model_id
    }
}

fn values_to_f32(values: &[Value]) -> Vec<f32> {
    values
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect()
}

/// POST JSON with retry: 429/5xx and network errors back off and retry,
/// other 4xx fail immediately as hard provider errors.
fn post_with_retry(
    client: &Client,
    url: &str,
    body: &Value,
    headers: &[(&str, &str)],
) -> Result<Value> {
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 0..=MAX_RETRIES {
        if attempt > 0 {
            std::thread::sleep(backoff_delay(attempt));
        }

        let mut request = client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        match request.send() {
            Ok(response) => {
                let status = response.status();
                if status.is_success() {
                    return response
                        .json::<Value>()
                        .map_err(|e| anyhow::anyhow!("invalid JSON from provider: {e}"));
                }
                let text = response.text().unwrap_or_default();
                if status.as_u16() == 429 || status.is_server_error() {
                    last_err = Some(
                        GroveError::ProviderTransient(format!("HTTP {status}: {text}")).into(),
                    );
                    continue;
                }
                return Err(GroveError::ProviderHardFailure(format!("HTTP {status}: {text}")).into());
            }
            Err(e) => {
                last_err = Some(GroveError::ProviderTransient(e.to_string()).into());
                continue;
            }
        }
    }

    Err(last_err
        .unwrap_or_else(|| GroveError::ProviderTransient("embedding failed after retries".into()).into()))
}

/// Exponential backoff with jitter: base 500 ms doubling, ±25%.
fn backoff_delay(attempt: u32) -> Duration {
    let base_ms = 500u64 << (attempt - 1).min(5);
    let jitter = rand::thread_rng().gen_range(0.75..1.25);
    Duration::from_millis((base_ms as f64 * jitter) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_with_attempts() {
        let first = backoff_delay(1);
        let third = backoff_delay(3);
        assert!(first >= Duration::from_millis(375));
        assert!(first <= Duration::from_millis(625));
        assert!(third >= Duration::from_millis(1500));
    }

    #[test]
    fn values_parse_to_f32() {
        let values = vec![json!(0.5), json!(-1.25), json!("bad")];
        assert_eq!(values_to_f32(&values), vec![0.5, -1.25, 0.0]);
    }
}
