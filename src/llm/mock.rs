//! A scriptable, deterministic `LlmClient` used by tests: callers queue one
//! or more responses per schema name, and the mock also counts calls so
//! invariant 7 ("fingerprint stability ⇒ zero LLM calls") can be asserted
//! directly.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{LlmClient, Message};
use crate::error::{ReflexioError, Result};

#[derive(Default)]
pub struct MockLlmClient {
    responses: Mutex<HashMap<String, VecDeque<serde_json::Value>>>,
    generate_calls: AtomicUsize,
    embed_calls: AtomicUsize,
}

impl MockLlmClient {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues `value` to be returned the next time `generate_structured` is
    /// called with `schema_name`. Multiple queued values are returned FIFO.
    pub fn push_response(&self, schema_name: &str, value: serde_json::Value) {
        self.responses
            .lock()
            .entry(schema_name.to_string())
            .or_default()
            .push_back(value);
    }

    pub fn generate_call_count(&self) -> usize {
        self.generate_calls.load(Ordering::SeqCst)
    }

    pub fn embed_call_count(&self) -> usize {
        self.embed_calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn generate_structured(
        &self,
        _model: &str,
        _messages: Vec<Message>,
        schema_name: &str,
    ) -> Result<serde_json::Value> {
        self.generate_calls.fetch_add(1, Ordering::SeqCst);
        let mut responses = self.responses.lock();
        let queue = responses.get_mut(schema_name).ok_or_else(|| {
            ReflexioError::Llm(format!("MockLlmClient: no scripted response for {schema_name}"))
        })?;
        queue
            .pop_front()
            .ok_or_else(|| ReflexioError::Llm(format!("MockLlmClient: response queue exhausted for {schema_name}")))
    }

    /// Deterministic pseudo-embedding: a fixed-dimension vector derived from
    /// the byte sum of `text`, stable across calls and processes — good
    /// enough for clustering/search tests that only need "similar text ⇒
    /// similar vector, different text ⇒ different vector", not semantic
    /// accuracy.
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.embed_calls.fetch_add(1, Ordering::SeqCst);
        const DIM: usize = 8;
        let mut v = vec![0.0f32; DIM];
        for (i, byte) in text.bytes().enumerate() {
            v[i % DIM] += byte as f32;
        }
        let norm: f32 = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in v.iter_mut() {
                *x /= norm;
            }
        }
        Ok(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn embed_is_deterministic_for_identical_text() {
        let client = MockLlmClient::new();
        let a = client.embed("hello world").await.unwrap();
        let b = client.embed("hello world").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(client.embed_call_count(), 2);
    }

    #[tokio::test]
    async fn generate_structured_returns_queued_responses_fifo() {
        let client = MockLlmClient::new();
        client.push_response("test_schema", serde_json::json!({"n": 1}));
        client.push_response("test_schema", serde_json::json!({"n": 2}));

        let first = client.generate_structured("m", vec![], "test_schema").await.unwrap();
        let second = client.generate_structured("m", vec![], "test_schema").await.unwrap();
        assert_eq!(first, serde_json::json!({"n": 1}));
        assert_eq!(second, serde_json::json!({"n": 2}));
        assert_eq!(client.generate_call_count(), 2);
    }

    #[tokio::test]
    async fn generate_structured_errors_when_queue_exhausted() {
        let client = MockLlmClient::new();
        let result = client.generate_structured("m", vec![], "unknown_schema").await;
        assert!(result.is_err());
    }
}
