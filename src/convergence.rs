//! Constraint Convergence Loop
//!
//! Repeats a constraint-refinement step until the oracle reports
//! `no_more_changes`, the iteration budget is spent, or the wall-clock
//! deadline passes. Each round goes through the `StepExecutor` and is
//! validated, repaired once, or replaced by the baseline fallback.

use crate::config::ConvergenceBudget;
use crate::grounding::{split_words, CanonicalIndex};
use crate::model::{Attribute, AttributeKey};
use crate::step::{OracleSchema, PromptContext, Provenance, Step, StepExecutor};
use crate::types::{DataType, TypeAssignment};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

const NON_NEGATIVE_WORDS: &[&str] = &["price", "amount", "cost", "total", "fee", "salary", "quantity", "qty", "count"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    NotNull,
    Unique,
    Check,
    Default,
}

impl ConstraintKind {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().replace(|c: char| c == ' ' || c == '-', "_").as_str() {
            "not_null" | "notnull" => Some(ConstraintKind::NotNull),
            "unique" => Some(ConstraintKind::Unique),
            "check" => Some(ConstraintKind::Check),
            "default" => Some(ConstraintKind::Default),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConstraintKind::NotNull => "not_null",
            ConstraintKind::Unique => "unique",
            ConstraintKind::Check => "check",
            ConstraintKind::Default => "default",
        }
    }

    fn needs_expression(&self) -> bool {
        matches!(self, ConstraintKind::Check | ConstraintKind::Default)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraint {
    pub name: String,
    pub kind: ConstraintKind,
    pub entity: String,
    pub attributes: Vec<String>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub reasoning: String,
}

impl Constraint {
    pub fn new(kind: ConstraintKind, entity: impl Into<String>, attributes: Vec<String>) -> Self {
        let entity = entity.into();
        Self {
            name: default_name(kind, &entity, &attributes),
            kind,
            entity,
            attributes,
            expression: None,
            reasoning: String::new(),
        }
    }

    pub fn with_expression(mut self, expression: impl Into<String>) -> Self {
        self.expression = Some(expression.into());
        self
    }

    pub fn with_reasoning(mut self, reasoning: impl Into<String>) -> Self {
        self.reasoning = reasoning.into();
        self
    }

    /// Attribute keys this constraint mentions
    pub fn references(&self) -> impl Iterator<Item = AttributeKey> + '_ {
        self.attributes.iter().map(move |a| AttributeKey::new(&self.entity, a))
    }

    /// Two constraints with the same identity are duplicates regardless of name
    fn identity(&self) -> (String, ConstraintKind, BTreeSet<String>, Option<String>) {
        (
            self.entity.clone(),
            self.kind,
            self.attributes.iter().cloned().collect(),
            self.expression.as_ref().map(|e| e.split_whitespace().collect::<Vec<_>>().join(" ")),
        )
    }
}

fn default_name(kind: ConstraintKind, entity: &str, attributes: &[String]) -> String {
    let mut name = format!("{}_{}", split_words(entity).join("_"), kind.as_str());
    for attribute in attributes {
        name.push('_');
        name.push_str(&attribute.to_lowercase());
    }
    name
}

/// Read-only view of the schema the loop refines constraints for
#[derive(Debug, Clone, Default)]
pub struct ConstraintContext {
    pub attributes: BTreeMap<String, Vec<Attribute>>,
    pub primary_keys: BTreeMap<String, Vec<String>>,
    /// Types keyed `entity.attribute`
    pub data_types: BTreeMap<String, TypeAssignment>,
}

impl ConstraintContext {
    fn knows(&self, key: &AttributeKey) -> bool {
        self.attributes
            .get(&key.entity)
            .map_or(false, |list| list.iter().any(|a| a.name == key.attribute))
    }

    /// NOT NULL for non-nullable attributes, UNIQUE for primary keys and a
    /// non-negative CHECK for amount/quantity-like numeric attributes
    pub fn baseline(&self) -> Vec<Constraint> {
        let mut baseline = Vec::new();
        for (entity, attributes) in &self.attributes {
            if let Some(pk) = self.primary_keys.get(entity).filter(|pk| !pk.is_empty()) {
                baseline.push(
                    Constraint::new(ConstraintKind::Unique, entity, pk.clone()).with_reasoning("primary key is unique"),
                );
            }
            for attribute in attributes {
                if !attribute.nullable {
                    baseline.push(
                        Constraint::new(ConstraintKind::NotNull, entity, vec![attribute.name.clone()])
                            .with_reasoning("attribute is declared non-nullable"),
                    );
                }
                let numeric = self
                    .data_types
                    .get(&AttributeKey::new(entity, &attribute.name).to_string())
                    .map_or(false, |t| {
                        t.data_type.is_integer() || matches!(t.data_type, DataType::Decimal | DataType::Double)
                    });
                let amount_like = split_words(&attribute.name)
                    .iter()
                    .any(|w| NON_NEGATIVE_WORDS.contains(&w.as_str()));
                if numeric && amount_like {
                    baseline.push(
                        Constraint::new(ConstraintKind::Check, entity, vec![attribute.name.clone()])
                            .with_expression(format!("{} >= 0", attribute.name))
                            .with_reasoning("amounts and quantities are non-negative"),
                    );
                }
            }
        }
        baseline
    }
}

/// Oracle schema for one refinement round
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RefinementResponse {
    #[serde(default)]
    pub additions: Vec<ConstraintProposal>,
    /// Names of constraints to drop
    #[serde(default)]
    pub removals: Vec<String>,
    pub no_more_changes: bool,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConstraintProposal {
    #[serde(default)]
    pub name: Option<String>,
    pub kind: String,
    pub entity: String,
    pub attributes: Vec<String>,
    #[serde(default)]
    pub expression: Option<String>,
    #[serde(default)]
    pub reasoning: String,
}

impl OracleSchema for RefinementResponse {
    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "additions": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "name": {"type": "string"},
                            "kind": {"type": "string", "enum": ["not_null", "unique", "check", "default"]},
                            "entity": {"type": "string"},
                            "attributes": {"type": "array", "items": {"type": "string"}, "minItems": 1},
                            "expression": {"type": "string"},
                            "reasoning": {"type": "string"}
                        },
                        "required": ["kind", "entity", "attributes"],
                        "additionalProperties": false
                    }
                },
                "removals": {"type": "array", "items": {"type": "string"}},
                "no_more_changes": {"type": "boolean"},
                "reasoning": {"type": "string"}
            },
            "required": ["no_more_changes"],
            "additionalProperties": false
        })
    }
}

/// Validated changes for one round
#[derive(Debug, Clone, PartialEq)]
pub struct Refinement {
    pub additions: Vec<Constraint>,
    pub removals: Vec<String>,
    pub no_more_changes: bool,
}

const REFINEMENT_SYSTEM_PROMPT: &str = "You are reviewing the integrity constraints of a relational schema. \
Propose constraints to add (not_null, unique, check, default) and names of existing constraints to remove. \
Set no_more_changes to true once the set is complete. Return JSON only.";

/// One refinement round over the current constraint set
#[derive(Debug, Clone)]
pub struct ConstraintRefinementStep {
    pub context: Arc<ConstraintContext>,
    pub current: Vec<Constraint>,
    pub round: usize,
}

impl Step for ConstraintRefinementStep {
    type Response = RefinementResponse;
    type Output = Refinement;

    fn name(&self) -> &str {
        "constraint_refinement"
    }

    fn prompt(&self) -> PromptContext {
        let schema: BTreeMap<&String, Vec<String>> = self
            .context
            .attributes
            .iter()
            .map(|(entity, attributes)| {
                let columns = attributes
                    .iter()
                    .map(|a| {
                        let key = AttributeKey::new(entity, &a.name).to_string();
                        match self.context.data_types.get(&key) {
                            Some(t) => format!("{} {}", a.name, t.sql()),
                            None => a.name.clone(),
                        }
                    })
                    .collect();
                (entity, columns)
            })
            .collect();
        PromptContext::new(
            REFINEMENT_SYSTEM_PROMPT,
            "Round {round}.\nSchema:\n{schema}\nPrimary keys:\n{primary_keys}\nCurrent constraints:\n{constraints}\n\nReturn additions, removals and no_more_changes.",
        )
        .with_variable("round", self.round)
        .with_variable("schema", json!(schema))
        .with_variable("primary_keys", json!(self.context.primary_keys))
        .with_variable("constraints", json!(self.current))
    }

    fn validate(&self, response: RefinementResponse) -> std::result::Result<Refinement, String> {
        let entities = CanonicalIndex::new(self.context.attributes.keys());
        let mut problems = Vec::new();
        let mut additions = Vec::new();

        for proposal in response.additions {
            let Some(entity) = entities.canonicalize(&proposal.entity) else {
                problems.push(format!("unknown entity '{}'", proposal.entity));
                continue;
            };
            let Some(kind) = ConstraintKind::parse(&proposal.kind) else {
                problems.push(format!(
                    "constraint kind '{}' must be one of not_null, unique, check, default",
                    proposal.kind
                ));
                continue;
            };
            let columns = CanonicalIndex::new(
                self.context
                    .attributes
                    .get(&entity)
                    .into_iter()
                    .flatten()
                    .map(|a| a.name.as_str()),
            );
            let mut attributes = Vec::new();
            for raw in &proposal.attributes {
                match columns.canonicalize(raw) {
                    Some(name) => attributes.push(name),
                    None => problems.push(format!("'{}' is not an attribute of {}", raw, entity)),
                }
            }
            if proposal.attributes.is_empty() {
                problems.push(format!("{} constraint on {} names no attributes", kind.as_str(), entity));
            }
            let expression = proposal.expression.filter(|e| !e.trim().is_empty());
            if kind.needs_expression() && expression.is_none() {
                problems.push(format!("{} constraint on {} needs an expression", kind.as_str(), entity));
            }
            let mut constraint = Constraint::new(kind, entity, attributes).with_reasoning(proposal.reasoning);
            constraint.expression = expression;
            if let Some(name) = proposal.name.filter(|n| !n.trim().is_empty()) {
                constraint.name = name;
            }
            additions.push(constraint);
        }

        let existing: BTreeSet<&str> = self.current.iter().map(|c| c.name.as_str()).collect();
        for removal in &response.removals {
            if !existing.contains(removal.as_str()) {
                problems.push(format!("cannot remove unknown constraint '{}'", removal));
            }
        }

        if !problems.is_empty() {
            return Err(problems.join("; "));
        }
        Ok(Refinement {
            additions,
            removals: response.removals,
            no_more_changes: response.no_more_changes,
        })
    }

    fn fallback(&self) -> Refinement {
        let present: BTreeSet<_> = self.current.iter().map(Constraint::identity).collect();
        Refinement {
            additions: self
                .context
                .baseline()
                .into_iter()
                .filter(|c| !present.contains(&c.identity()))
                .collect(),
            removals: Vec::new(),
            no_more_changes: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminatedBy {
    ConditionMet,
    MaxIterations,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundSummary {
    pub round: usize,
    pub provenance: Provenance,
    pub added: Vec<String>,
    pub removed: Vec<String>,
    /// Dropped after the merge for referencing unknown attributes
    pub retracted: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConvergenceResult {
    pub constraints: Vec<Constraint>,
    pub terminated_by: TerminatedBy,
    pub iterations: usize,
    pub rounds: Vec<RoundSummary>,
    pub elapsed_ms: u128,
}

pub struct ConstraintConvergenceLoop {
    executor: StepExecutor,
    budget: ConvergenceBudget,
}

impl ConstraintConvergenceLoop {
    pub fn new(executor: StepExecutor, budget: ConvergenceBudget) -> Self {
        Self { executor, budget }
    }

    /// Refine `initial` until converged or out of budget
    pub async fn run(&self, context: ConstraintContext, initial: Vec<Constraint>) -> ConvergenceResult {
        let started = Instant::now();
        // A budget too large to represent as an instant means no deadline
        let deadline = started.checked_add(self.budget.max_time);
        let context = Arc::new(context);
        let mut constraints = Vec::new();
        merge(&mut constraints, initial);
        retract_unknown(&context, &mut constraints);

        let mut rounds = Vec::new();
        let mut terminated_by = TerminatedBy::MaxIterations;

        for round in 1..=self.budget.max_iterations {
            let now = Instant::now();
            if deadline.map_or(false, |d| now >= d) {
                terminated_by = TerminatedBy::Timeout;
                break;
            }
            info!("Constraint refinement round {} of {}", round, self.budget.max_iterations);

            let step = ConstraintRefinementStep {
                context: Arc::clone(&context),
                current: constraints.clone(),
                round,
            };
            let outcome = match deadline {
                Some(deadline) => match tokio::time::timeout(deadline - now, self.executor.execute(&step)).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        warn!("⚠️  Constraint refinement round {} hit the deadline", round);
                        terminated_by = TerminatedBy::Timeout;
                        break;
                    }
                },
                None => self.executor.execute(&step).await,
            };

            let provenance = outcome.provenance();
            let refinement = outcome.into_value();
            let removed: Vec<String> = refinement.removals.clone();
            constraints.retain(|c| !removed.contains(&c.name));
            let added = merge(&mut constraints, refinement.additions);
            let retracted = retract_unknown(&context, &mut constraints);

            rounds.push(RoundSummary {
                round,
                provenance,
                added,
                removed,
                retracted,
            });

            // Only the oracle, or a first-round baseline, can settle the set
            if refinement.no_more_changes && (provenance == Provenance::Oracle || round == 1) {
                terminated_by = TerminatedBy::ConditionMet;
                break;
            }
        }

        info!(
            "✅ Constraints settled: {} constraints after {} rounds ({:?})",
            constraints.len(),
            rounds.len(),
            terminated_by
        );
        ConvergenceResult {
            constraints,
            terminated_by,
            iterations: rounds.len(),
            rounds,
            elapsed_ms: started.elapsed().as_millis(),
        }
    }
}

/// Add new constraints, replacing same-named ones and skipping duplicates.
/// Returns the names that changed the set.
fn merge(constraints: &mut Vec<Constraint>, additions: Vec<Constraint>) -> Vec<String> {
    let mut added = Vec::new();
    for addition in additions {
        if constraints.iter().any(|c| c.identity() == addition.identity()) {
            continue;
        }
        constraints.retain(|c| c.name != addition.name);
        added.push(addition.name.clone());
        constraints.push(addition);
    }
    added
}

fn retract_unknown(context: &ConstraintContext, constraints: &mut Vec<Constraint>) -> Vec<String> {
    let mut retracted = Vec::new();
    constraints.retain(|c| {
        let known = c.references().all(|key| context.knows(&key));
        if !known {
            warn!("⚠️  Retracting constraint '{}': references unknown attributes", c.name);
            retracted.push(c.name.clone());
        }
        known
    });
    retracted
}
