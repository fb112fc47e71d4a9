//! Oracle-backed steps.
//!
//! A [`Step`] describes one call site: its prompt, its closed-world response
//! schema, how a response is validated into the step's output, how the repair
//! prompt is built and which deterministic value stands in when the oracle
//! cannot be trusted. [`StepExecutor`] drives any step through the same loop.

pub mod executor;
pub mod oracle;
pub mod outcome;

pub use executor::*;
pub use oracle::*;
pub use outcome::*;

use serde_json::Value;
use std::collections::BTreeMap;

/// Prompt text plus the variables it is rendered with
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PromptContext {
    pub system_prompt: String,
    pub human_prompt: String,
    pub input_variables: BTreeMap<String, Value>,
}

impl PromptContext {
    pub fn new(system_prompt: impl Into<String>, human_prompt: impl Into<String>) -> Self {
        Self {
            system_prompt: system_prompt.into(),
            human_prompt: human_prompt.into(),
            input_variables: BTreeMap::new(),
        }
    }

    pub fn with_variable(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.input_variables.insert(name.to_string(), value.into());
        self
    }

    /// Original context with the rejection reason appended
    pub fn with_repair(&self, error_detail: &str) -> Self {
        let mut repaired = self.clone();
        repaired.human_prompt = format!(
            "{}\n\nYour previous response was rejected:\n{}\n\nReturn a corrected response that fixes every issue above. Return JSON only.",
            self.human_prompt, error_detail
        );
        repaired
            .input_variables
            .insert("validation_error".to_string(), Value::String(error_detail.to_string()));
        repaired
    }
}

/// One oracle call site
pub trait Step: Send + Sync {
    /// Closed-world schema the raw response is parsed into
    type Response: OracleSchema;
    /// Validated value handed to the caller
    type Output: Send + 'static;

    fn name(&self) -> &str;

    fn prompt(&self) -> PromptContext;

    /// Check a parsed response and turn it into the step's output.
    ///
    /// `Err` carries the detail quoted back to the oracle in the repair prompt.
    fn validate(&self, response: Self::Response) -> std::result::Result<Self::Output, String>;

    fn repair_prompt(&self, original: &PromptContext, error_detail: &str) -> PromptContext {
        original.with_repair(error_detail)
    }

    /// Deterministic stand-in; must not call out to anything
    fn fallback(&self) -> Self::Output;
}
