//! LLM adapter. Only handlers use it; the core never inspects content.

use async_trait::async_trait;
use serde_json::Value as JsonValue;

use super::AdapterError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageInput {
    pub mime_type: String,
    pub bytes: Vec<u8>,
}

#[async_trait]
pub trait LlmClient: Send + Sync {
    async fn generate_text(&self, prompt: &str) -> Result<String, AdapterError>;

    /// Generate a JSON document conforming to `schema`.
    async fn generate_json(&self, prompt: &str, schema: &JsonValue) -> Result<JsonValue, AdapterError>;

    async fn generate_text_with_images(
        &self,
        prompt: &str,
        images: &[ImageInput],
    ) -> Result<String, AdapterError>;

    async fn embed(&self, batch: &[String]) -> Result<Vec<Vec<f32>>, AdapterError>;
}
