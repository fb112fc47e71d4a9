//! Pipeline Configuration
//!
//! Environment-driven settings for the oracle client, fan-out width and the
//! constraint convergence budget. The binary loads `.env` before calling
//! [`PipelineConfig::from_env`].

use crate::error::{Result, SchemaError};
use std::env;
use std::time::Duration;

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// Connection settings for the chat-completions oracle
#[derive(Debug, Clone)]
pub struct OracleConfig {
    /// API key; `None` means no oracle is reachable and every step falls back
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    /// Timeout applied to each individual oracle call
    pub call_timeout: Duration,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: DEFAULT_MODEL.to_string(),
            base_url: DEFAULT_BASE_URL.to_string(),
            call_timeout: Duration::from_secs(60),
        }
    }
}

/// Budget for the constraint convergence loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConvergenceBudget {
    pub max_iterations: usize,
    pub max_time: Duration,
}

impl Default for ConvergenceBudget {
    fn default() -> Self {
        Self {
            max_iterations: 5,
            max_time: Duration::from_secs(120),
        }
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub oracle: OracleConfig,
    /// Maximum number of oracle calls in flight during a fan-out
    pub max_concurrency: usize,
    pub convergence: ConvergenceBudget,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            oracle: OracleConfig::default(),
            max_concurrency: 8,
            convergence: ConvergenceBudget::default(),
        }
    }
}

impl PipelineConfig {
    /// Read configuration from the process environment.
    ///
    /// Unset variables keep their defaults; set-but-unparseable numbers are a
    /// configuration error.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let api_key = env::var("OPENAI_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());
        let model = env::var("OPENAI_MODEL").unwrap_or(defaults.oracle.model);
        let base_url = env::var("OPENAI_BASE_URL").unwrap_or(defaults.oracle.base_url);

        let call_timeout = read_number("SCHEMA_SYNTH_ORACLE_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.oracle.call_timeout);
        let max_concurrency = read_number("SCHEMA_SYNTH_MAX_CONCURRENCY")?
            .map(|n| n as usize)
            .unwrap_or(defaults.max_concurrency);
        let max_iterations = read_number("SCHEMA_SYNTH_CONSTRAINT_MAX_ITERATIONS")?
            .map(|n| n as usize)
            .unwrap_or(defaults.convergence.max_iterations);
        let max_time = read_number("SCHEMA_SYNTH_CONSTRAINT_MAX_TIME_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.convergence.max_time);

        if max_concurrency == 0 {
            return Err(SchemaError::Config(
                "SCHEMA_SYNTH_MAX_CONCURRENCY must be at least 1".to_string(),
            ));
        }

        Ok(Self {
            oracle: OracleConfig {
                api_key,
                model,
                base_url: base_url.trim_end_matches('/').to_string(),
                call_timeout,
            },
            max_concurrency,
            convergence: ConvergenceBudget {
                max_iterations,
                max_time,
            },
        })
    }
}

fn read_number(name: &str) -> Result<Option<u64>> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| SchemaError::Config(format!("{} must be a non-negative integer ({}): {:?}", name, e, raw))),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::default();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.convergence.max_iterations, 5);
        assert_eq!(config.oracle.model, DEFAULT_MODEL);
        assert!(config.oracle.api_key.is_none());
    }
}
