//! schema-synth
//!
//! Validation-repair substrate for oracle-backed schema synthesis, plus the
//! attribute dependency graph and type propagation engine.

pub mod cardinality;
pub mod config;
pub mod convergence;
pub mod dependency;
pub mod error;
pub mod formula;
pub mod grounding;
pub mod llm;
pub mod model;
pub mod pipeline;
pub mod propagation;
pub mod state;
pub mod step;
pub mod types;

pub use config::PipelineConfig;
pub use error::{Result, SchemaError};
pub use pipeline::{PipelineReport, SchemaInput, SchemaPipeline};
pub use state::GenerationState;
pub use step::{Oracle, StepExecutor, StepOutcome};
