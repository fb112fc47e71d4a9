//! Oracle Boundary
//!
//! The oracle is the external language model. The core only depends on the
//! [`Oracle`] trait: given a request it returns a JSON value or fails.

use crate::error::{Result, SchemaError};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

/// A single oracle invocation
#[derive(Debug, Clone, Serialize)]
pub struct OracleRequest {
    /// Name of the step issuing the call
    pub step: String,
    pub system_prompt: String,
    pub human_prompt: String,
    pub input_variables: BTreeMap<String, Value>,
    /// JSON schema the response must conform to
    pub output_schema: Value,
}

impl OracleRequest {
    /// Human prompt with `{name}` placeholders replaced by input variables.
    ///
    /// String values are inserted bare, everything else as compact JSON.
    pub fn render_human_prompt(&self) -> String {
        let mut rendered = self.human_prompt.clone();
        for (name, value) in &self.input_variables {
            let placeholder = format!("{{{}}}", name);
            if !rendered.contains(&placeholder) {
                continue;
            }
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            rendered = rendered.replace(&placeholder, &text);
        }
        rendered
    }
}

/// Closed-world response schema for one call site.
///
/// Implementors are serde structs with `deny_unknown_fields`; `json_schema`
/// declares required vs optional fields for the oracle.
pub trait OracleSchema: DeserializeOwned + Send + 'static {
    fn json_schema() -> Value;
}

#[async_trait]
pub trait Oracle: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(&self, request: &OracleRequest) -> Result<Value>;
}

/// Oracle that is never reachable; every step resolves through its fallback
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineOracle;

#[async_trait]
impl Oracle for OfflineOracle {
    fn name(&self) -> &str {
        "offline"
    }

    async fn invoke(&self, request: &OracleRequest) -> Result<Value> {
        Err(SchemaError::Oracle(format!(
            "No oracle configured for step '{}'",
            request.step
        )))
    }
}

#[derive(Debug, Clone)]
enum ScriptedReply {
    Value(Value),
    Error(String),
}

/// Oracle that replays canned replies per step name, in order.
///
/// Used for dry runs and tests. A step with no remaining replies fails like an
/// unreachable oracle.
#[derive(Debug, Default)]
pub struct ScriptedOracle {
    replies: Mutex<HashMap<String, VecDeque<ScriptedReply>>>,
    calls: Mutex<Vec<OracleRequest>>,
}

impl ScriptedOracle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, step: &str, reply: Value) -> &Self {
        self.enqueue(step, ScriptedReply::Value(reply));
        self
    }

    pub fn push_error(&self, step: &str, message: &str) -> &Self {
        self.enqueue(step, ScriptedReply::Error(message.to_string()));
        self
    }

    fn enqueue(&self, step: &str, reply: ScriptedReply) {
        if let Ok(mut replies) = self.replies.lock() {
            replies.entry(step.to_string()).or_default().push_back(reply);
        }
    }

    /// Every request received so far
    pub fn calls(&self) -> Vec<OracleRequest> {
        self.calls.lock().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn calls_for(&self, step: &str) -> Vec<OracleRequest> {
        self.calls()
            .into_iter()
            .filter(|c| c.step == step)
            .collect()
    }
}

#[async_trait]
impl Oracle for ScriptedOracle {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn invoke(&self, request: &OracleRequest) -> Result<Value> {
        if let Ok(mut calls) = self.calls.lock() {
            calls.push(request.clone());
        }
        let next = self
            .replies
            .lock()
            .ok()
            .and_then(|mut replies| replies.get_mut(&request.step).and_then(|q| q.pop_front()));
        match next {
            Some(ScriptedReply::Value(value)) => Ok(value),
            Some(ScriptedReply::Error(message)) => Err(SchemaError::Oracle(message)),
            None => Err(SchemaError::Oracle(format!(
                "No scripted reply left for step '{}'",
                request.step
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(step: &str) -> OracleRequest {
        OracleRequest {
            step: step.to_string(),
            system_prompt: String::new(),
            human_prompt: "Type of {attribute} in {entity}: {hints}".to_string(),
            input_variables: BTreeMap::from([
                ("attribute".to_string(), json!("price")),
                ("entity".to_string(), json!("Product")),
                ("hints".to_string(), json!(["money"])),
            ]),
            output_schema: json!({}),
        }
    }

    #[test]
    fn test_render_human_prompt() {
        assert_eq!(
            request("s").render_human_prompt(),
            "Type of price in Product: [\"money\"]"
        );
    }

    #[tokio::test]
    async fn test_scripted_oracle_replays_in_order() {
        let oracle = ScriptedOracle::new();
        oracle.push("a", json!({"n": 1})).push_error("a", "boom");

        assert_eq!(oracle.invoke(&request("a")).await.unwrap(), json!({"n": 1}));
        assert!(oracle.invoke(&request("a")).await.is_err());
        assert!(oracle.invoke(&request("a")).await.is_err());
        assert!(oracle.invoke(&request("b")).await.is_err());
        assert_eq!(oracle.calls_for("a").len(), 3);
    }

    #[tokio::test]
    async fn test_offline_oracle_always_fails() {
        let err = OfflineOracle.invoke(&request("x")).await.unwrap_err();
        assert!(err.is_oracle_failure());
    }
}
