//! The `LlmClient` trait and prompt-templating helper the three generation
//! services consume (spec §6): typed structured outputs rather than a raw
//! JSON schema (the REDESIGN FLAG on dynamic Pydantic models, spec §9), and
//! a fixed-dimension embedding call.
//!
//! Grounded on the teacher's `engine::traits` small async-trait adapter
//! style, insulating a service from a concrete backend behind one boundary.

mod mock;
mod prompts;

pub use mock::MockLlmClient;
pub use prompts::{PromptManager, PromptTemplate};

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ReflexioError, Result};

/// A single chat message in the conversation sent to the LLM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self { role: "system".into(), content: content.into() }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self { role: "user".into(), content: content.into() }
    }
}

/// Ties a Rust type to the named schema the LLM backend is asked to
/// conform to. Every extractor/deduplicator/evaluator output implements
/// this instead of handing the client a runtime `serde_json::Value` schema
/// — the REDESIGN FLAG on "dynamic Pydantic models / runtime JSON schema"
/// (spec §9) rejected at the type level: there is no code path that can
/// construct a `LlmClient` call without a concrete `StructuredOutput` type.
pub trait StructuredOutput: DeserializeOwned + Send + Sync + 'static {
    /// Stable schema identifier the backend registers/validates against.
    fn schema_name() -> &'static str;
}

/// The client's expectation of the core (spec §6). Kept free of generic
/// methods so it stays object-safe (`Arc<dyn LlmClient>` is threaded
/// through every service); the typed boundary lives in `generate`, the
/// free function built on top of `generate_structured`.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Issues a structured-output completion against the schema named by
    /// `schema_name`, returning the raw decoded JSON value.
    async fn generate_structured(
        &self,
        model: &str,
        messages: Vec<Message>,
        schema_name: &str,
    ) -> Result<serde_json::Value>;

    /// Computes a dense embedding for `text`. Dimension is fixed per model.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;
}

/// Calls `client.generate_structured` with `T::schema_name()` and decodes
/// the result into `T`. This is the only way extractors/deduplicators/
/// evaluators should invoke the LLM for structured output.
pub async fn generate<T: StructuredOutput>(
    client: &dyn LlmClient,
    model: &str,
    messages: Vec<Message>,
) -> Result<T> {
    let value = client
        .generate_structured(model, messages, T::schema_name())
        .await?;
    serde_json::from_value(value)
        .map_err(|e| ReflexioError::Llm(format!("schema violation for {}: {e}", T::schema_name())))
}
