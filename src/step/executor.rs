//! Step Executor
//!
//! Call / validate / repair / fallback around a single oracle invocation:
//! - one primary call, parsed against the step's closed-world schema
//! - at most one repair call carrying the validation error
//! - the step's deterministic fallback when the repair fails or the oracle errors
//!
//! Nothing raised by the oracle escapes this boundary.

use super::oracle::{Oracle, OracleRequest, OracleSchema};
use super::outcome::{FallbackCause, StepOutcome};
use super::{PromptContext, Step};
use crate::error::{Result, SchemaError};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Result of one oracle call + validation
enum Attempt<T> {
    Valid(T),
    Invalid(String),
    OracleFailed(String),
}

#[derive(Clone)]
pub struct StepExecutor {
    oracle: Arc<dyn Oracle>,
    call_timeout: Duration,
    limiter: Arc<Semaphore>,
}

impl StepExecutor {
    pub fn new(oracle: Arc<dyn Oracle>) -> Self {
        Self {
            oracle,
            call_timeout: DEFAULT_CALL_TIMEOUT,
            limiter: Arc::new(Semaphore::new(DEFAULT_MAX_CONCURRENCY)),
        }
    }

    pub fn with_call_timeout(mut self, call_timeout: Duration) -> Self {
        self.call_timeout = call_timeout;
        self
    }

    /// Bound the number of oracle calls in flight across all clones
    pub fn with_max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.limiter = Arc::new(Semaphore::new(max_concurrency.max(1)));
        self
    }

    pub fn oracle_name(&self) -> &str {
        self.oracle.name()
    }

    /// Run one step to a validated result
    pub async fn execute<S>(&self, step: &S) -> StepOutcome<S::Output>
    where
        S: Step + ?Sized,
    {
        let context = step.prompt();
        info!("🤖 Step '{}' calling oracle '{}'", step.name(), self.oracle.name());

        let error_detail = match self.attempt(step, &context).await {
            Attempt::Valid(output) => {
                debug!("Step '{}' accepted on first call", step.name());
                return StepOutcome::Ok(output);
            }
            Attempt::OracleFailed(reason) => return self.fall_back(step, FallbackCause::Oracle, reason),
            Attempt::Invalid(detail) => detail,
        };

        warn!(
            "⚠️  Step '{}' response rejected, issuing repair: {}",
            step.name(),
            error_detail
        );
        let repair_context = step.repair_prompt(&context, &error_detail);
        match self.attempt(step, &repair_context).await {
            Attempt::Valid(output) => {
                info!("✅ Step '{}' accepted after repair", step.name());
                StepOutcome::Repaired(output)
            }
            Attempt::Invalid(detail) => self.fall_back(
                step,
                FallbackCause::Validation,
                format!("repair attempt rejected: {}", detail),
            ),
            Attempt::OracleFailed(reason) => {
                self.fall_back(step, FallbackCause::Oracle, format!("repair call failed: {}", reason))
            }
        }
    }

    /// Run independent steps concurrently; outcomes come back in input order.
    ///
    /// A step whose task dies resolves through its own fallback.
    pub async fn execute_all<S>(&self, steps: Vec<S>) -> Vec<StepOutcome<S::Output>>
    where
        S: Step + 'static,
    {
        let handles: Vec<_> = steps
            .into_iter()
            .map(|step| {
                let step = Arc::new(step);
                let task_step = Arc::clone(&step);
                let executor = self.clone();
                let handle = tokio::spawn(async move { executor.execute(task_step.as_ref()).await });
                (step, handle)
            })
            .collect();

        let mut outcomes = Vec::with_capacity(handles.len());
        for (step, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => outcomes.push(self.fall_back(
                    step.as_ref(),
                    FallbackCause::Task,
                    format!("step task failed: {}", e),
                )),
            }
        }
        outcomes
    }

    async fn attempt<S>(&self, step: &S, context: &PromptContext) -> Attempt<S::Output>
    where
        S: Step + ?Sized,
    {
        let request = OracleRequest {
            step: step.name().to_string(),
            system_prompt: context.system_prompt.clone(),
            human_prompt: context.human_prompt.clone(),
            input_variables: context.input_variables.clone(),
            output_schema: S::Response::json_schema(),
        };

        let raw = match self.call_oracle(&request).await {
            Ok(raw) => raw,
            Err(e) => return Attempt::OracleFailed(e.to_string()),
        };

        let response: S::Response = match serde_json::from_value(raw) {
            Ok(response) => response,
            Err(e) => {
                return Attempt::Invalid(format!(
                    "response does not match the expected schema: {}",
                    e
                ))
            }
        };

        match step.validate(response) {
            Ok(output) => Attempt::Valid(output),
            Err(detail) => Attempt::Invalid(detail),
        }
    }

    async fn call_oracle(&self, request: &OracleRequest) -> Result<serde_json::Value> {
        let _permit = self
            .limiter
            .acquire()
            .await
            .map_err(|e| SchemaError::Oracle(format!("Oracle limiter closed: {}", e)))?;

        match tokio::time::timeout(self.call_timeout, self.oracle.invoke(request)).await {
            Ok(result) => result,
            Err(_) => Err(SchemaError::Oracle(format!(
                "Oracle call for step '{}' timed out after {:?}",
                request.step, self.call_timeout
            ))),
        }
    }

    fn fall_back<S>(&self, step: &S, cause: FallbackCause, reason: String) -> StepOutcome<S::Output>
    where
        S: Step + ?Sized,
    {
        warn!("⚠️  Step '{}' using deterministic fallback: {}", step.name(), reason);
        StepOutcome::Fallback {
            value: step.fallback(),
            cause,
            reason,
        }
    }
}
