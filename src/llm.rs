//! Chat-completions oracle
//!
//! `LlmClient` talks to any OpenAI-compatible `/chat/completions` endpoint and
//! implements [`Oracle`]. The response schema is sent along with the prompt;
//! the reply content is unwrapped from code fences before parsing.

use crate::config::OracleConfig;
use crate::error::{Result, SchemaError};
use crate::step::{Oracle, OracleRequest};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, warn};

#[derive(Clone)]
pub struct LlmClient {
    http: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
}

impl LlmClient {
    pub fn new(api_key: String, model: String, base_url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            api_key,
            base_url,
            model,
        }
    }

    /// Client for a configured key; `None` when no key is set
    pub fn from_config(config: &OracleConfig) -> Option<Self> {
        config
            .api_key
            .as_ref()
            .map(|key| Self::new(key.clone(), config.model.clone(), config.base_url.clone()))
    }

    fn request_body(&self, request: &OracleRequest) -> Value {
        let system = format!(
            "{}\n\nRespond with a single JSON object matching this schema, no text around it:\n{}",
            request.system_prompt, request.output_schema
        );
        let mut body = json!({
            "model": self.model,
            "messages": [
                {"role": "system", "content": system},
                {"role": "user", "content": request.render_human_prompt()}
            ],
            "temperature": 0.1,
            "response_format": {"type": "json_object"},
        });
        if self.model.starts_with("gpt-5") || self.model.contains("o1") {
            body["max_completion_tokens"] = json!(4000);
        } else {
            body["max_tokens"] = json!(2000);
        }
        body
    }

    /// Post one chat completion and return the message content
    pub async fn call_llm(&self, body: &Value) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await
            .map_err(|e| SchemaError::Oracle(format!("LLM API call failed: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            return Err(SchemaError::Oracle(format!("LLM API error ({}): {}", status, error_text)));
        }

        let response_json: Value = response
            .json()
            .await
            .map_err(|e| SchemaError::Oracle(format!("Failed to parse LLM response: {}", e)))?;

        if let Some(error) = response_json.get("error") {
            return Err(SchemaError::Oracle(format!("LLM API error: {}", error)));
        }

        let choice = response_json
            .get("choices")
            .and_then(|c| c.as_array())
            .and_then(|c| c.first())
            .ok_or_else(|| SchemaError::Oracle(format!("No choices in LLM response: {}", response_json)))?;

        match choice.get("finish_reason").and_then(|r| r.as_str()) {
            Some("length") => warn!("⚠️  LLM response was truncated due to length limit"),
            Some("content_filter") => {
                return Err(SchemaError::Oracle("LLM response was filtered by content policy".to_string()))
            }
            _ => {}
        }

        let content = choice["message"]["content"].as_str().unwrap_or_default();
        if content.trim().is_empty() {
            return Err(SchemaError::Oracle(format!("Empty content in LLM response: {}", response_json)));
        }
        Ok(content.to_string())
    }
}

#[async_trait]
impl Oracle for LlmClient {
    fn name(&self) -> &str {
        &self.model
    }

    async fn invoke(&self, request: &OracleRequest) -> Result<Value> {
        let body = self.request_body(request);
        let content = self.call_llm(&body).await?;
        debug!("LLM reply for step '{}': {}", request.step, content);
        Ok(extract_json(&content))
    }
}

/// Parse the JSON object out of a reply.
///
/// Code fences and surrounding prose are stripped. Content with no parseable
/// object comes back as a JSON string, so the step sees a schema mismatch and
/// can issue its repair prompt.
pub fn extract_json(content: &str) -> Value {
    let cleaned = content
        .trim()
        .trim_start_matches("```json")
        .trim_start_matches("```")
        .trim_end_matches("```")
        .trim();

    if let Ok(value) = serde_json::from_str::<Value>(cleaned) {
        return value;
    }
    if let (Some(start), Some(end)) = (cleaned.find('{'), cleaned.rfind('}')) {
        if start < end {
            if let Ok(value) = serde_json::from_str::<Value>(&cleaned[start..=end]) {
                return value;
            }
        }
    }
    Value::String(content.to_string())
}
