//! Generation State
//!
//! Append-only accumulator threaded through one run. Each phase hands back a
//! [`PhaseOutput`]; the orchestrator applies it exactly once, in phase order.
//! Nothing else mutates the state, and readers only get shared references.

use crate::convergence::ConvergenceResult;
use crate::dependency::DependencyGraph;
use crate::error::{ItemIssue, IssueKind, Result, SchemaError};
use crate::model::{Attribute, DerivedFormula, Entity, ForeignKey, Relation};
use crate::step::Provenance;
use crate::types::TypeAssignment;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Entities,
    Attributes,
    Relations,
    Keys,
    Dependencies,
    DataTypes,
    Constraints,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Entities => "entities",
            Phase::Attributes => "attributes",
            Phase::Relations => "relations",
            Phase::Keys => "keys",
            Phase::Dependencies => "dependencies",
            Phase::DataTypes => "data_types",
            Phase::Constraints => "constraints",
        }
    }
}

/// Explicit consolidation decision; the only way an entity leaves the state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Reclassification {
    Rename { from: String, to: String, reason: String },
    Merge { sources: Vec<String>, into: String, reason: String },
    Remove { entity: String, reason: String },
}

/// What one phase contributes
#[derive(Debug, Clone)]
pub enum PhaseOutput {
    Entities {
        entities: Vec<Entity>,
        decisions: Vec<Reclassification>,
    },
    Attributes {
        attributes: BTreeMap<String, Vec<Attribute>>,
        formulas: Vec<DerivedFormula>,
    },
    Relations {
        relations: Vec<Relation>,
        /// Where each relation's cardinality came from, keyed by relation id
        provenance: BTreeMap<String, Provenance>,
    },
    Keys {
        primary_keys: BTreeMap<String, Vec<String>>,
        foreign_keys: Vec<ForeignKey>,
        /// FK attributes added to the "N" side of 1:N relations
        implied_attributes: Vec<(String, Attribute)>,
    },
    Dependencies {
        graph: DependencyGraph,
    },
    DataTypes {
        data_types: BTreeMap<String, TypeAssignment>,
    },
    Constraints {
        result: ConvergenceResult,
    },
}

impl PhaseOutput {
    pub fn phase(&self) -> Phase {
        match self {
            PhaseOutput::Entities { .. } => Phase::Entities,
            PhaseOutput::Attributes { .. } => Phase::Attributes,
            PhaseOutput::Relations { .. } => Phase::Relations,
            PhaseOutput::Keys { .. } => Phase::Keys,
            PhaseOutput::Dependencies { .. } => Phase::Dependencies,
            PhaseOutput::DataTypes { .. } => Phase::DataTypes,
            PhaseOutput::Constraints { .. } => Phase::Constraints,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedPhase {
    pub phase: Phase,
    pub applied_at: DateTime<Utc>,
    pub issues: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationState {
    run_id: Uuid,
    created_at: DateTime<Utc>,
    source_text: String,
    entities: Vec<Entity>,
    attributes: BTreeMap<String, Vec<Attribute>>,
    formulas: Vec<DerivedFormula>,
    relations: Vec<Relation>,
    relation_provenance: BTreeMap<String, Provenance>,
    primary_keys: BTreeMap<String, Vec<String>>,
    foreign_keys: Vec<ForeignKey>,
    dependency_graph: Option<DependencyGraph>,
    data_types: BTreeMap<String, TypeAssignment>,
    constraints: Option<ConvergenceResult>,
    reclassifications: Vec<Reclassification>,
    issues: Vec<ItemIssue>,
    phase_log: Vec<AppliedPhase>,
}

impl GenerationState {
    pub fn new(source_text: impl Into<String>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            created_at: Utc::now(),
            source_text: source_text.into(),
            entities: Vec::new(),
            attributes: BTreeMap::new(),
            formulas: Vec::new(),
            relations: Vec::new(),
            relation_provenance: BTreeMap::new(),
            primary_keys: BTreeMap::new(),
            foreign_keys: Vec::new(),
            dependency_graph: None,
            data_types: BTreeMap::new(),
            constraints: None,
            reclassifications: Vec::new(),
            issues: Vec::new(),
            phase_log: Vec::new(),
        }
    }

    /// Merge one phase's output.
    ///
    /// Phases must arrive in order and at most once; a phase may be skipped.
    pub fn apply(&mut self, output: PhaseOutput, mut issues: Vec<ItemIssue>) -> Result<()> {
        let phase = output.phase();
        if let Some(last) = self.phase_log.last() {
            if phase <= last.phase {
                return Err(SchemaError::Structural(format!(
                    "Phase '{}' cannot be applied after '{}'",
                    phase.as_str(),
                    last.phase.as_str()
                )));
            }
        }

        match output {
            PhaseOutput::Entities { entities, decisions } => {
                self.entities = entities;
                for decision in decisions {
                    if let Err(issue) = self.consolidate(&decision) {
                        issues.push(issue);
                    } else {
                        self.reclassifications.push(decision);
                    }
                }
            }
            PhaseOutput::Attributes { attributes, formulas } => {
                self.attributes = attributes;
                self.formulas = formulas;
            }
            PhaseOutput::Relations { relations, provenance } => {
                self.relations = relations;
                self.relation_provenance = provenance;
            }
            PhaseOutput::Keys {
                primary_keys,
                foreign_keys,
                implied_attributes,
            } => {
                self.primary_keys = primary_keys;
                self.foreign_keys = foreign_keys;
                for (entity, attribute) in implied_attributes {
                    self.attributes.entry(entity).or_default().push(attribute);
                }
            }
            PhaseOutput::Dependencies { graph } => self.dependency_graph = Some(graph),
            PhaseOutput::DataTypes { data_types } => self.data_types = data_types,
            PhaseOutput::Constraints { result } => self.constraints = Some(result),
        }

        info!("Applied phase '{}' ({} issues)", phase.as_str(), issues.len());
        self.phase_log.push(AppliedPhase {
            phase,
            applied_at: Utc::now(),
            issues: issues.len(),
        });
        self.issues.extend(issues);
        Ok(())
    }

    fn consolidate(&mut self, decision: &Reclassification) -> std::result::Result<(), ItemIssue> {
        let known: BTreeSet<String> = self.entities.iter().map(|e| e.name.clone()).collect();
        let unknown = |name: &str| {
            ItemIssue::new(
                name,
                IssueKind::StructuralInconsistency,
                "consolidation decision names an unknown entity",
            )
        };

        match decision {
            Reclassification::Rename { from, to, .. } => {
                if !known.contains(from) {
                    return Err(unknown(from));
                }
                if known.contains(to) {
                    return Err(ItemIssue::structural(from, format!("cannot rename onto existing entity '{}'", to)));
                }
                if let Some(entity) = self.entities.iter_mut().find(|e| &e.name == from) {
                    entity.name = to.clone();
                }
            }
            Reclassification::Merge { sources, into, .. } => {
                if !known.contains(into) {
                    return Err(unknown(into));
                }
                if let Some(missing) = sources.iter().find(|s| !known.contains(*s)) {
                    return Err(unknown(missing));
                }
                self.entities.retain(|e| &e.name == into || !sources.contains(&e.name));
            }
            Reclassification::Remove { entity, reason } => {
                if !known.contains(entity) {
                    return Err(unknown(entity));
                }
                warn!("⚠️  Removing entity '{}': {}", entity, reason);
                self.entities.retain(|e| &e.name != entity);
            }
        }
        Ok(())
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn source_text(&self) -> &str {
        &self.source_text
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn attributes(&self) -> &BTreeMap<String, Vec<Attribute>> {
        &self.attributes
    }

    pub fn formulas(&self) -> &[DerivedFormula] {
        &self.formulas
    }

    pub fn relations(&self) -> &[Relation] {
        &self.relations
    }

    pub fn relation_provenance(&self) -> &BTreeMap<String, Provenance> {
        &self.relation_provenance
    }

    pub fn primary_keys(&self) -> &BTreeMap<String, Vec<String>> {
        &self.primary_keys
    }

    pub fn foreign_keys(&self) -> &[ForeignKey] {
        &self.foreign_keys
    }

    pub fn dependency_graph(&self) -> Option<&DependencyGraph> {
        self.dependency_graph.as_ref()
    }

    pub fn data_types(&self) -> &BTreeMap<String, TypeAssignment> {
        &self.data_types
    }

    pub fn constraints(&self) -> Option<&ConvergenceResult> {
        self.constraints.as_ref()
    }

    pub fn reclassifications(&self) -> &[Reclassification] {
        &self.reclassifications
    }

    pub fn issues(&self) -> &[ItemIssue] {
        &self.issues
    }

    pub fn phase_log(&self) -> &[AppliedPhase] {
        &self.phase_log
    }

    pub fn is_applied(&self, phase: Phase) -> bool {
        self.phase_log.iter().any(|p| p.phase == phase)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entities() -> PhaseOutput {
        PhaseOutput::Entities {
            entities: vec![
                Entity::new("Customer", ""),
                Entity::new("Client", ""),
                Entity::new("Order", ""),
                Entity::new("Temp", ""),
            ],
            decisions: vec![
                Reclassification::Merge {
                    sources: vec!["Client".to_string()],
                    into: "Customer".to_string(),
                    reason: "synonym".to_string(),
                },
                Reclassification::Rename {
                    from: "Order".to_string(),
                    to: "PurchaseOrder".to_string(),
                    reason: "reserved word".to_string(),
                },
                Reclassification::Remove {
                    entity: "Temp".to_string(),
                    reason: "not a domain concept".to_string(),
                },
                Reclassification::Remove {
                    entity: "Ghost".to_string(),
                    reason: "never existed".to_string(),
                },
            ],
        }
    }

    #[test]
    fn test_consolidation_decisions() {
        let mut state = GenerationState::new("text");
        state.apply(entities(), Vec::new()).unwrap();

        let names: Vec<&str> = state.entities().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["Customer", "PurchaseOrder"]);
        assert_eq!(state.reclassifications().len(), 3);
        assert_eq!(state.issues().len(), 1);
        assert_eq!(state.issues()[0].item, "Ghost");
    }

    #[test]
    fn test_phases_apply_once_in_order() {
        let mut state = GenerationState::new("text");
        state.apply(entities(), Vec::new()).unwrap();
        state
            .apply(
                PhaseOutput::Relations {
                    relations: Vec::new(),
                    provenance: BTreeMap::new(),
                },
                Vec::new(),
            )
            .unwrap();

        let again = state.apply(entities(), Vec::new());
        assert!(matches!(again, Err(SchemaError::Structural(_))));
        let earlier = state.apply(
            PhaseOutput::Attributes {
                attributes: BTreeMap::new(),
                formulas: Vec::new(),
            },
            Vec::new(),
        );
        assert!(earlier.is_err());

        assert!(state.is_applied(Phase::Relations));
        assert!(!state.is_applied(Phase::Attributes));
        assert_eq!(state.phase_log().len(), 2);
        assert!(state.phase_log()[0].applied_at <= state.phase_log()[1].applied_at);
    }
}
