//! Schema Pipeline
//!
//! Runs the core phases over a snapshot of upstream output:
//! entities (grounding + consolidation) → attributes → relations
//! (cardinality) → keys (FK synthesis) → dependency graph → data types →
//! constraints. Each phase reads the state, produces a `PhaseOutput`, and
//! only this orchestrator merges it.

use crate::cardinality::RelationCardinalityStep;
use crate::config::{ConvergenceBudget, PipelineConfig};
use crate::convergence::{Constraint, ConstraintConvergenceLoop, ConstraintContext, ConvergenceResult};
use crate::dependency::{synthesize_foreign_keys, DependencyGraphBuilder, DependencyInputs, DependencySummary};
use crate::error::{IssueKind, ItemIssue, Result};
use crate::grounding::{CanonicalIndex, EvidenceGrounder, GroundingOutcome};
use crate::model::{Attribute, AttributeKey, DerivedFormula, Entity, ForeignKey, Relation};
use crate::propagation::TypePropagationEngine;
use crate::state::{GenerationState, PhaseOutput, Reclassification};
use crate::step::{Oracle, Provenance, StepExecutor, StepOutcome};
use crate::types::TypeAssignment;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::{info, warn};

/// Upstream phase output the core runs on
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchemaInput {
    pub source_text: String,
    pub entities: Vec<Entity>,
    #[serde(default)]
    pub decisions: Vec<Reclassification>,
    #[serde(default)]
    pub attributes: BTreeMap<String, Vec<Attribute>>,
    #[serde(default)]
    pub relations: Vec<Relation>,
    #[serde(default)]
    pub primary_keys: BTreeMap<String, Vec<String>>,
    #[serde(default)]
    pub foreign_keys: Vec<ForeignKey>,
    #[serde(default)]
    pub formulas: Vec<DerivedFormula>,
    #[serde(default)]
    pub constraints: Vec<Constraint>,
}

/// Downstream view of a finished run
#[derive(Debug, Clone, Serialize)]
pub struct PipelineReport {
    pub run_id: String,
    pub oracle: String,
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub relation_provenance: BTreeMap<String, Provenance>,
    pub foreign_keys: Vec<ForeignKey>,
    pub dependencies: Option<DependencySummary>,
    pub data_types: BTreeMap<String, TypeAssignment>,
    pub constraints: Option<ConvergenceResult>,
    pub issues: Vec<ItemIssue>,
}

impl PipelineReport {
    pub fn from_state(state: &GenerationState, oracle: &str) -> Self {
        Self {
            run_id: state.run_id().to_string(),
            oracle: oracle.to_string(),
            entities: state.entities().to_vec(),
            relations: state.relations().to_vec(),
            relation_provenance: state.relation_provenance().clone(),
            foreign_keys: state.foreign_keys().to_vec(),
            dependencies: state.dependency_graph().map(|g| g.summary()),
            data_types: state.data_types().clone(),
            constraints: state.constraints().cloned(),
            issues: state.issues().to_vec(),
        }
    }
}

pub struct SchemaPipeline {
    executor: StepExecutor,
    budget: ConvergenceBudget,
}

impl SchemaPipeline {
    pub fn new(oracle: Arc<dyn Oracle>, config: &PipelineConfig) -> Self {
        let executor = StepExecutor::new(oracle)
            .with_call_timeout(config.oracle.call_timeout)
            .with_max_concurrency(config.max_concurrency);
        Self::with_executor(executor, config.convergence)
    }

    pub fn with_executor(executor: StepExecutor, budget: ConvergenceBudget) -> Self {
        Self { executor, budget }
    }

    pub fn oracle_name(&self) -> &str {
        self.executor.oracle_name()
    }

    pub async fn run(&self, input: SchemaInput) -> Result<GenerationState> {
        info!("🤖 Starting schema run with oracle '{}'", self.executor.oracle_name());
        let mut state = GenerationState::new(input.source_text.clone());

        let (output, issues) = entities_phase(&state, &input);
        state.apply(output, issues)?;

        let resolver = EntityResolver::new(&state);
        let (output, issues) = attributes_phase(&resolver, &input);
        state.apply(output, issues)?;

        let (output, issues) = self.relations_phase(&state, &resolver, &input).await;
        state.apply(output, issues)?;

        let (output, issues) = keys_phase(&state, &resolver, &input);
        state.apply(output, issues)?;

        let graph = DependencyGraphBuilder::new(DependencyInputs {
            entities: state.entities(),
            attributes: state.attributes(),
            primary_keys: state.primary_keys(),
            foreign_keys: state.foreign_keys(),
            formulas: state.formulas(),
        })
        .build();
        let issues = graph.issues.clone();
        state.apply(PhaseOutput::Dependencies { graph }, issues)?;

        let (output, issues) = self.data_types_phase(&state).await;
        state.apply(output, issues)?;

        let (output, issues) = self.constraints_phase(&state, &resolver, &input).await;
        state.apply(output, issues)?;

        info!(
            "✅ Schema run {} finished with {} issues",
            state.run_id(),
            state.issues().len()
        );
        Ok(state)
    }

    async fn relations_phase(
        &self,
        state: &GenerationState,
        resolver: &EntityResolver,
        input: &SchemaInput,
    ) -> (PhaseOutput, Vec<ItemIssue>) {
        let mut issues = Vec::new();
        let descriptions: BTreeMap<String, String> = state
            .entities()
            .iter()
            .map(|e| (e.name.clone(), e.description.clone()))
            .collect();

        let mut steps = Vec::new();
        for relation in &input.relations {
            let mut relation = relation.clone();
            let (resolved, unknown): (Vec<_>, Vec<_>) = relation
                .entities
                .iter()
                .map(|raw| (raw, resolver.resolve(raw)))
                .partition(|(_, name)| name.is_some());
            if !unknown.is_empty() {
                let names: Vec<&str> = unknown.iter().map(|(raw, _)| raw.as_str()).collect();
                issues.push(ItemIssue::structural(
                    relation.id.clone(),
                    format!("relation names unknown entities: {}", names.join(", ")),
                ));
                continue;
            }
            relation.entities = resolved.into_iter().filter_map(|(_, name)| name).collect();
            relation.entity_cardinalities.clear();
            relation.entity_participations.clear();
            if let Err(e) = relation.validate_structure() {
                issues.push(ItemIssue::structural(relation.id.clone(), e.to_string()));
                continue;
            }
            let relation_descriptions = relation
                .entities
                .iter()
                .filter_map(|e| descriptions.get(e).map(|d| (e.clone(), d.clone())))
                .collect();
            steps.push(RelationCardinalityStep::new(relation, relation_descriptions));
        }

        let relations_in: Vec<Relation> = steps.iter().map(|s| s.relation.clone()).collect();
        let outcomes = self.executor.execute_all(steps).await;

        let mut relations = Vec::with_capacity(relations_in.len());
        let mut provenance = BTreeMap::new();
        for (mut relation, outcome) in relations_in.into_iter().zip(outcomes) {
            issues.extend(fallback_issue(&relation.id, &outcome));
            provenance.insert(relation.id.clone(), outcome.provenance());
            outcome.into_value().apply_to(&mut relation);
            relations.push(relation);
        }

        (PhaseOutput::Relations { relations, provenance }, issues)
    }

    async fn data_types_phase(&self, state: &GenerationState) -> (PhaseOutput, Vec<ItemIssue>) {
        let mut issues = Vec::new();
        let Some(graph) = state.dependency_graph() else {
            return (
                PhaseOutput::DataTypes {
                    data_types: BTreeMap::new(),
                },
                issues,
            );
        };

        let engine = TypePropagationEngine::new(self.executor.clone());
        let resolution = engine
            .resolve(graph, state.entities(), state.attributes(), state.formulas())
            .await;

        for (key, fallback) in &resolution.fallback_reasons {
            issues.push(ItemIssue::new(
                key.to_string(),
                fallback.cause.issue_kind(),
                fallback.reason.clone(),
            ));
        }
        for warning in &resolution.warnings {
            issues.push(ItemIssue::structural("data_types", warning.clone()));
        }
        for key in resolution.fk_mismatches(graph) {
            issues.push(ItemIssue::structural(key.to_string(), "FK type differs from referenced key"));
        }

        (
            PhaseOutput::DataTypes {
                data_types: resolution.keyed(),
            },
            issues,
        )
    }

    async fn constraints_phase(
        &self,
        state: &GenerationState,
        resolver: &EntityResolver,
        input: &SchemaInput,
    ) -> (PhaseOutput, Vec<ItemIssue>) {
        let context = ConstraintContext {
            attributes: state.attributes().clone(),
            primary_keys: state.primary_keys().clone(),
            data_types: state.data_types().clone(),
        };
        let initial: Vec<Constraint> = input
            .constraints
            .iter()
            .filter_map(|c| {
                let mut constraint = c.clone();
                constraint.entity = resolver.resolve(&c.entity)?;
                Some(constraint)
            })
            .collect();

        let result = ConstraintConvergenceLoop::new(self.executor.clone(), self.budget)
            .run(context, initial)
            .await;
        let issues = result
            .rounds
            .iter()
            .flat_map(|round| {
                round
                    .retracted
                    .iter()
                    .map(move |name| ItemIssue::structural(name.clone(), format!("retracted in round {}", round.round)))
            })
            .collect();
        (PhaseOutput::Constraints { result }, issues)
    }
}

fn entities_phase(state: &GenerationState, input: &SchemaInput) -> (PhaseOutput, Vec<ItemIssue>) {
    let grounder = EvidenceGrounder::new(state.source_text());
    let mut issues = Vec::new();
    let mut seen = BTreeSet::new();
    let mut entities = Vec::new();

    for entity in &input.entities {
        if !seen.insert(entity.name.clone()) {
            issues.push(ItemIssue::structural(entity.name.clone(), "duplicate entity name"));
            continue;
        }
        let grounded = grounder.ground_entity(entity);
        if let GroundingOutcome::Rejected { claim } = &grounded.outcome {
            issues.push(ItemIssue::new(
                entity.name.clone(),
                IssueKind::GroundingFailure,
                format!("evidence not found in source: {:?}", claim),
            ));
        }
        entities.push(grounded.entity);
    }

    (
        PhaseOutput::Entities {
            entities,
            decisions: input.decisions.clone(),
        },
        issues,
    )
}

fn attributes_phase(resolver: &EntityResolver, input: &SchemaInput) -> (PhaseOutput, Vec<ItemIssue>) {
    let mut issues = Vec::new();
    let mut attributes: BTreeMap<String, Vec<Attribute>> = BTreeMap::new();

    for (raw_entity, list) in &input.attributes {
        let Some(entity) = resolver.resolve(raw_entity) else {
            issues.push(ItemIssue::structural(
                raw_entity.clone(),
                format!("{} attributes dropped: unknown entity", list.len()),
            ));
            continue;
        };
        let merged = attributes.entry(entity.clone()).or_default();
        for attribute in list {
            if merged.iter().any(|a| a.name == attribute.name) {
                issues.push(ItemIssue::structural(
                    AttributeKey::new(&entity, &attribute.name).to_string(),
                    "duplicate attribute",
                ));
                continue;
            }
            merged.push(attribute.clone());
        }
    }

    let formulas = input
        .formulas
        .iter()
        .filter_map(|formula| {
            let remap = |key: &AttributeKey| -> Option<AttributeKey> {
                Some(AttributeKey::new(resolver.resolve(&key.entity)?, &key.attribute))
            };
            let attribute = remap(&formula.attribute);
            let operands: Option<Vec<AttributeKey>> = formula.operands.iter().map(remap).collect();
            match (attribute, operands) {
                (Some(attribute), Some(operands)) => {
                    Some(DerivedFormula::new(attribute, formula.expression.clone(), operands))
                }
                _ => {
                    issues.push(ItemIssue::structural(
                        formula.attribute.to_string(),
                        "formula references an unknown entity",
                    ));
                    None
                }
            }
        })
        .collect();

    (PhaseOutput::Attributes { attributes, formulas }, issues)
}

fn keys_phase(state: &GenerationState, resolver: &EntityResolver, input: &SchemaInput) -> (PhaseOutput, Vec<ItemIssue>) {
    let mut issues = Vec::new();

    let mut primary_keys = BTreeMap::new();
    for (raw_entity, pk) in &input.primary_keys {
        match resolver.resolve(raw_entity) {
            Some(entity) => {
                primary_keys.insert(entity, pk.clone());
            }
            None => issues.push(ItemIssue::structural(raw_entity.clone(), "primary key for unknown entity")),
        }
    }

    let mut foreign_keys = Vec::new();
    for fk in &input.foreign_keys {
        match (resolver.resolve(&fk.from_entity), resolver.resolve(&fk.to_entity)) {
            (Some(from_entity), Some(to_entity)) => foreign_keys.push(ForeignKey {
                from_entity,
                to_entity,
                ..fk.clone()
            }),
            _ => issues.push(ItemIssue::structural(fk.to_string(), "foreign key for unknown entity")),
        }
    }

    let synthesis = synthesize_foreign_keys(state.relations(), &primary_keys, state.attributes(), &foreign_keys);
    if !synthesis.foreign_keys.is_empty() {
        info!("Derived {} foreign keys from 1:N relations", synthesis.foreign_keys.len());
    }
    foreign_keys.extend(synthesis.foreign_keys);
    issues.extend(synthesis.issues);

    (
        PhaseOutput::Keys {
            primary_keys,
            foreign_keys,
            implied_attributes: synthesis.implied_attributes,
        },
        issues,
    )
}

/// Maps raw entity names from the snapshot onto the consolidated entity set
struct EntityResolver {
    index: CanonicalIndex,
    aliases: BTreeMap<String, String>,
    removed: BTreeSet<String>,
}

impl EntityResolver {
    fn new(state: &GenerationState) -> Self {
        let mut aliases = BTreeMap::new();
        let mut removed = BTreeSet::new();
        for decision in state.reclassifications() {
            match decision {
                Reclassification::Rename { from, to, .. } => {
                    aliases.insert(from.clone(), to.clone());
                }
                Reclassification::Merge { sources, into, .. } => {
                    for source in sources {
                        aliases.insert(source.clone(), into.clone());
                    }
                }
                Reclassification::Remove { entity, .. } => {
                    removed.insert(entity.clone());
                }
            }
        }
        Self {
            index: CanonicalIndex::new(state.entities().iter().map(|e| e.name.as_str())),
            aliases,
            removed,
        }
    }

    fn resolve(&self, raw: &str) -> Option<String> {
        if let Some(target) = self.aliases.get(raw) {
            return Some(target.clone());
        }
        if self.removed.contains(raw) {
            return None;
        }
        self.index.canonicalize(raw)
    }
}

fn fallback_issue<T>(item: &str, outcome: &StepOutcome<T>) -> Option<ItemIssue> {
    let (cause, reason) = outcome.fallback_cause().zip(outcome.fallback_reason())?;
    warn!("⚠️  {} resolved by fallback: {}", item, reason);
    Some(ItemIssue::new(item, cause.issue_kind(), reason))
}
