//! Attribute Dependency Graph
//!
//! Nodes are `(entity, attribute)` keys. An edge points from a dependent
//! attribute to what its type depends on:
//! - a foreign-key attribute depends on the primary-key attribute it references
//! - a derived attribute depends on each operand of its formula
//!
//! Attributes without outgoing edges are independent and are typed first.
//! Cycles are only possible (and only checked) among formula edges; an FK edge
//! ends at another entity's key.

use crate::error::{ItemIssue, Result, SchemaError};
use crate::grounding::split_words;
use crate::model::{Attribute, AttributeKey, Cardinality, DerivedFormula, Entity, ForeignKey, Participation, Relation};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

/// Everything the builder reads; a read-only snapshot of earlier phases
#[derive(Debug, Clone, Copy)]
pub struct DependencyInputs<'a> {
    pub entities: &'a [Entity],
    pub attributes: &'a BTreeMap<String, Vec<Attribute>>,
    pub primary_keys: &'a BTreeMap<String, Vec<String>>,
    pub foreign_keys: &'a [ForeignKey],
    pub formulas: &'a [DerivedFormula],
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependencyGraph {
    pub independent: BTreeSet<AttributeKey>,
    pub dependent: BTreeSet<AttributeKey>,
    /// FK attribute -> referenced PK attribute
    pub fk_dependencies: BTreeMap<AttributeKey, AttributeKey>,
    /// Derived attribute -> formula operands
    pub derived_dependencies: BTreeMap<AttributeKey, Vec<AttributeKey>>,
    /// Derivation cycles, each listed in edge order
    pub cycles: Vec<Vec<AttributeKey>>,
    /// Rejected keys, formulas and cycles
    pub issues: Vec<ItemIssue>,
}

/// Downstream view consumed by strategy selection and DDL compilation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DependencySummary {
    pub independent_attributes: Vec<String>,
    pub dependent_attributes: Vec<String>,
    pub fk_dependencies: BTreeMap<String, String>,
}

impl DependencyGraph {
    /// Outgoing edges of a node (what it depends on)
    pub fn dependencies(&self, node: &AttributeKey) -> Vec<AttributeKey> {
        let mut deps: Vec<AttributeKey> = self.fk_dependencies.get(node).into_iter().cloned().collect();
        if let Some(operands) = self.derived_dependencies.get(node) {
            for operand in operands {
                if !deps.contains(operand) {
                    deps.push(operand.clone());
                }
            }
        }
        deps
    }

    pub fn nodes(&self) -> impl Iterator<Item = &AttributeKey> {
        self.independent.iter().chain(self.dependent.iter())
    }

    pub fn is_on_cycle(&self, node: &AttributeKey) -> bool {
        self.cycles.iter().any(|cycle| cycle.contains(node))
    }

    /// Hard error for callers that cannot tolerate derivation cycles
    pub fn ensure_acyclic(&self) -> Result<()> {
        match self.cycles.first() {
            Some(cycle) => Err(SchemaError::DependencyCycle(
                cycle.iter().map(|k| k.to_string()).collect(),
            )),
            None => Ok(()),
        }
    }

    /// All nodes ordered so every node comes after its dependencies.
    ///
    /// Ties are broken by key order, so the result is deterministic. When only
    /// blocked nodes remain, the members of recorded cycles are released first
    /// (they are typed without their operands), then ordering resumes so that
    /// anything depending on a cycle, such as an FK to a cyclic key, still
    /// comes after it.
    pub fn resolution_order(&self) -> Vec<AttributeKey> {
        let mut remaining: BTreeMap<AttributeKey, BTreeSet<AttributeKey>> = self
            .nodes()
            .map(|node| (node.clone(), self.dependencies(node).into_iter().collect()))
            .collect();
        let mut order = Vec::with_capacity(remaining.len());

        while !remaining.is_empty() {
            let mut ready: Vec<AttributeKey> = remaining
                .iter()
                .filter(|(_, deps)| deps.iter().all(|d| !remaining.contains_key(d)))
                .map(|(node, _)| node.clone())
                .collect();
            if ready.is_empty() {
                ready = remaining.keys().filter(|n| self.is_on_cycle(n)).cloned().collect();
                if ready.is_empty() {
                    ready = remaining.keys().next().cloned().into_iter().collect();
                }
                debug!("Releasing {} blocked attribute(s): {:?}", ready.len(), ready);
            }
            for node in ready {
                remaining.remove(&node);
                order.push(node);
            }
        }
        order
    }

    pub fn summary(&self) -> DependencySummary {
        DependencySummary {
            independent_attributes: self.independent.iter().map(|k| k.to_string()).collect(),
            dependent_attributes: self.dependent.iter().map(|k| k.to_string()).collect(),
            fk_dependencies: self
                .fk_dependencies
                .iter()
                .map(|(from, to)| (from.to_string(), to.to_string()))
                .collect(),
        }
    }
}

pub struct DependencyGraphBuilder<'a> {
    inputs: DependencyInputs<'a>,
}

impl<'a> DependencyGraphBuilder<'a> {
    pub fn new(inputs: DependencyInputs<'a>) -> Self {
        Self { inputs }
    }

    pub fn build(&self) -> DependencyGraph {
        let mut graph = DependencyGraph::default();
        let nodes = self.collect_nodes(&mut graph.issues);

        self.add_foreign_keys(&nodes, &mut graph);
        self.add_formulas(&nodes, &mut graph);

        for node in &nodes {
            if graph.fk_dependencies.contains_key(node) || graph.derived_dependencies.contains_key(node) {
                graph.dependent.insert(node.clone());
            } else {
                graph.independent.insert(node.clone());
            }
        }

        graph.cycles = find_derivation_cycles(&graph.derived_dependencies);
        for cycle in &graph.cycles {
            let path: Vec<String> = cycle.iter().map(|k| k.to_string()).collect();
            warn!("Derivation cycle detected: {}", path.join(" -> "));
            graph.issues.push(ItemIssue::structural(
                path.first().cloned().unwrap_or_default(),
                format!("derived attributes form a cycle: {}", path.join(" -> ")),
            ));
        }

        debug!(
            "Dependency graph: {} independent, {} dependent, {} FK edges, {} derived attributes",
            graph.independent.len(),
            graph.dependent.len(),
            graph.fk_dependencies.len(),
            graph.derived_dependencies.len()
        );
        graph
    }

    fn collect_nodes(&self, issues: &mut Vec<ItemIssue>) -> BTreeSet<AttributeKey> {
        let known_entities: BTreeSet<&str> = self.inputs.entities.iter().map(|e| e.name.as_str()).collect();
        let mut nodes = BTreeSet::new();
        for (entity, attributes) in self.inputs.attributes {
            if !known_entities.contains(entity.as_str()) {
                issues.push(ItemIssue::structural(
                    entity.clone(),
                    "attributes declared for an unknown entity",
                ));
            }
            for attribute in attributes {
                nodes.insert(AttributeKey::new(entity, &attribute.name));
            }
        }
        nodes
    }

    fn add_foreign_keys(&self, nodes: &BTreeSet<AttributeKey>, graph: &mut DependencyGraph) {
        for fk in self.inputs.foreign_keys {
            if let Err(e) = fk.validate() {
                graph.issues.push(ItemIssue::structural(fk.to_string(), e.to_string()));
                continue;
            }

            match self.inputs.primary_keys.get(&fk.to_entity) {
                Some(pk) => {
                    let referenced: BTreeSet<&String> = fk.to_attributes.iter().collect();
                    let declared: BTreeSet<&String> = pk.iter().collect();
                    if referenced != declared {
                        graph.issues.push(ItemIssue::structural(
                            fk.to_string(),
                            format!(
                                "referenced attributes are not the primary key of {} ({})",
                                fk.to_entity,
                                pk.join(", ")
                            ),
                        ));
                        continue;
                    }
                }
                None => {
                    graph.issues.push(ItemIssue::structural(
                        fk.to_string(),
                        format!("{} has no declared primary key", fk.to_entity),
                    ));
                    continue;
                }
            }

            for (from, to) in fk.pairs() {
                if !nodes.contains(&from) || !nodes.contains(&to) {
                    graph.issues.push(ItemIssue::structural(
                        fk.to_string(),
                        format!("{} -> {} references an unknown attribute", from, to),
                    ));
                    continue;
                }
                if let Some(existing) = graph.fk_dependencies.get(&from) {
                    if existing != &to {
                        graph.issues.push(ItemIssue::structural(
                            from.to_string(),
                            format!("already references {}; ignoring second reference to {}", existing, to),
                        ));
                    }
                    continue;
                }
                graph.fk_dependencies.insert(from, to);
            }
        }
    }

    fn add_formulas(&self, nodes: &BTreeSet<AttributeKey>, graph: &mut DependencyGraph) {
        for formula in self.inputs.formulas {
            let derived = &formula.attribute;
            if !nodes.contains(derived) {
                graph.issues.push(ItemIssue::structural(
                    derived.to_string(),
                    "formula declared for an unknown attribute",
                ));
                continue;
            }
            if graph.derived_dependencies.contains_key(derived) {
                graph.issues.push(ItemIssue::structural(
                    derived.to_string(),
                    "more than one formula declared; keeping the first",
                ));
                continue;
            }

            let mut operands = Vec::new();
            for operand in &formula.operands {
                if !nodes.contains(operand) {
                    graph.issues.push(ItemIssue::structural(
                        derived.to_string(),
                        format!("formula operand {} is not a known attribute", operand),
                    ));
                    continue;
                }
                if !operands.contains(operand) {
                    operands.push(operand.clone());
                }
            }
            if operands.is_empty() {
                graph.issues.push(ItemIssue::structural(
                    derived.to_string(),
                    "formula has no usable operands",
                ));
                continue;
            }
            graph.derived_dependencies.insert(derived.clone(), operands);
        }
    }
}

/// Cycles in the formula subgraph, found by depth-first search in key order
fn find_derivation_cycles(edges: &BTreeMap<AttributeKey, Vec<AttributeKey>>) -> Vec<Vec<AttributeKey>> {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
        InProgress,
        Done,
    }

    fn visit(
        node: &AttributeKey,
        edges: &BTreeMap<AttributeKey, Vec<AttributeKey>>,
        marks: &mut BTreeMap<AttributeKey, Mark>,
        stack: &mut Vec<AttributeKey>,
        cycles: &mut Vec<Vec<AttributeKey>>,
    ) {
        marks.insert(node.clone(), Mark::InProgress);
        stack.push(node.clone());

        for next in edges.get(node).into_iter().flatten() {
            match marks.get(next) {
                Some(Mark::InProgress) => {
                    if let Some(start) = stack.iter().position(|n| n == next) {
                        let mut cycle = stack[start..].to_vec();
                        cycle.push(next.clone());
                        cycles.push(cycle);
                    }
                }
                Some(Mark::Done) => {}
                None => visit(next, edges, marks, stack, cycles),
            }
        }

        stack.pop();
        marks.insert(node.clone(), Mark::Done);
    }

    let mut marks = BTreeMap::new();
    let mut cycles = Vec::new();
    for node in edges.keys() {
        if !marks.contains_key(node) {
            let mut stack = Vec::new();
            visit(node, edges, &mut marks, &mut stack, &mut cycles);
        }
    }
    cycles
}

/// Foreign keys implied by 1:N relations
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FkSynthesis {
    pub foreign_keys: Vec<ForeignKey>,
    /// FK attributes the "N" side does not declare yet, keyed by entity
    pub implied_attributes: Vec<(String, Attribute)>,
    pub issues: Vec<ItemIssue>,
}

/// Derive a foreign key for every binary relation with one "1" side and one
/// "N" side that is not already covered by an existing key.
///
/// The "N" side references the "1" side's primary key. FK columns are named
/// `<one_side>_<pk>` unless the PK column already carries that prefix.
pub fn synthesize_foreign_keys(
    relations: &[Relation],
    primary_keys: &BTreeMap<String, Vec<String>>,
    attributes: &BTreeMap<String, Vec<Attribute>>,
    existing: &[ForeignKey],
) -> FkSynthesis {
    let mut synthesis = FkSynthesis::default();

    for relation in relations {
        let [first, second] = relation.entities.as_slice() else {
            continue;
        };
        let (many_side, one_side) = match (relation.cardinality_of(first), relation.cardinality_of(second)) {
            (Some(Cardinality::Many), Some(Cardinality::One)) => (first, second),
            (Some(Cardinality::One), Some(Cardinality::Many)) => (second, first),
            _ => continue,
        };

        let covered = existing
            .iter()
            .chain(synthesis.foreign_keys.iter())
            .any(|fk| &fk.from_entity == many_side && &fk.to_entity == one_side);
        if covered {
            continue;
        }

        let Some(pk) = primary_keys.get(one_side).filter(|pk| !pk.is_empty()) else {
            synthesis.issues.push(ItemIssue::structural(
                relation.id.clone(),
                format!("cannot derive a foreign key: {} has no primary key", one_side),
            ));
            continue;
        };

        let prefix = split_words(one_side).join("_");
        let from_attributes: Vec<String> = pk
            .iter()
            .map(|pk_attr| {
                if pk_attr.starts_with(&format!("{}_", prefix)) {
                    pk_attr.clone()
                } else {
                    format!("{}_{}", prefix, pk_attr)
                }
            })
            .collect();

        let mandatory = relation.entity_participations.get(many_side) == Some(&Participation::Total);
        let declared = attributes.get(many_side);
        for (from_attr, pk_attr) in from_attributes.iter().zip(pk.iter()) {
            let exists = declared.map_or(false, |attrs| attrs.iter().any(|a| &a.name == from_attr))
                || synthesis
                    .implied_attributes
                    .iter()
                    .any(|(entity, a)| entity == many_side && &a.name == from_attr);
            if !exists {
                let mut attribute = Attribute::new(from_attr.clone());
                attribute.description = format!("References {}.{}", one_side, pk_attr);
                attribute.nullable = !mandatory;
                synthesis.implied_attributes.push((many_side.clone(), attribute));
            }
        }

        synthesis.foreign_keys.push(ForeignKey {
            from_entity: many_side.clone(),
            from_attributes,
            to_entity: one_side.clone(),
            to_attributes: pk.clone(),
        });
    }

    synthesis
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::RelationType;

    fn key(raw: &str) -> AttributeKey {
        AttributeKey::parse(raw).unwrap()
    }

    fn attrs(entries: &[(&str, &[&str])]) -> BTreeMap<String, Vec<Attribute>> {
        entries
            .iter()
            .map(|(entity, names)| (entity.to_string(), names.iter().map(|n| Attribute::new(*n)).collect()))
            .collect()
    }

    fn entities(names: &[&str]) -> Vec<Entity> {
        names.iter().map(|n| Entity::new(*n, "")).collect()
    }

    #[test]
    fn test_fk_and_formula_dependencies() {
        let entities = entities(&["Customer", "Order"]);
        let attributes = attrs(&[
            ("Customer", &["customer_id", "name"]),
            ("Order", &["order_id", "customer_id", "quantity", "unit_price", "total"]),
        ]);
        let primary_keys = BTreeMap::from([
            ("Customer".to_string(), vec!["customer_id".to_string()]),
            ("Order".to_string(), vec!["order_id".to_string()]),
        ]);
        let fks = vec![ForeignKey::new("Order", "customer_id", "Customer", "customer_id")];
        let formulas = vec![DerivedFormula::new(
            key("Order.total"),
            "quantity * unit_price",
            vec![key("Order.quantity"), key("Order.unit_price")],
        )];

        let graph = DependencyGraphBuilder::new(DependencyInputs {
            entities: &entities,
            attributes: &attributes,
            primary_keys: &primary_keys,
            foreign_keys: &fks,
            formulas: &formulas,
        })
        .build();

        assert!(graph.issues.is_empty());
        assert_eq!(graph.dependent, BTreeSet::from([key("Order.customer_id"), key("Order.total")]));
        assert_eq!(graph.independent.len(), 5);
        assert_eq!(graph.fk_dependencies.get(&key("Order.customer_id")), Some(&key("Customer.customer_id")));
        assert!(graph.ensure_acyclic().is_ok());

        let order = graph.resolution_order();
        let pos = |k: &str| order.iter().position(|n| n == &key(k)).unwrap();
        assert!(pos("Customer.customer_id") < pos("Order.customer_id"));
        assert!(pos("Order.unit_price") < pos("Order.total"));

        let summary = graph.summary();
        assert_eq!(summary.fk_dependencies.get("Order.customer_id").map(String::as_str), Some("Customer.customer_id"));
    }

    #[test]
    fn test_derivation_cycle_is_reported_not_fatal() {
        let entities = entities(&["Invoice"]);
        let attributes = attrs(&[("Invoice", &["a", "b", "c", "d"])]);
        let formulas = vec![
            DerivedFormula::new(key("Invoice.a"), "b + 1", vec![key("Invoice.b")]),
            DerivedFormula::new(key("Invoice.b"), "a * 2", vec![key("Invoice.a")]),
            DerivedFormula::new(key("Invoice.c"), "d + 1", vec![key("Invoice.d")]),
        ];
        let graph = DependencyGraphBuilder::new(DependencyInputs {
            entities: &entities,
            attributes: &attributes,
            primary_keys: &BTreeMap::new(),
            foreign_keys: &[],
            formulas: &formulas,
        })
        .build();

        assert_eq!(graph.cycles.len(), 1);
        assert!(graph.is_on_cycle(&key("Invoice.a")));
        assert!(!graph.is_on_cycle(&key("Invoice.c")));
        assert!(matches!(graph.ensure_acyclic(), Err(SchemaError::DependencyCycle(_))));
        assert_eq!(graph.issues.len(), 1);

        let order = graph.resolution_order();
        assert_eq!(order.len(), 4);
        assert!(order.iter().position(|k| k == &key("Invoice.d")) < order.iter().position(|k| k == &key("Invoice.c")));
    }

    #[test]
    fn test_fk_to_cyclic_key_is_ordered_after_it() {
        let entities = entities(&["Alpha", "Zeta"]);
        let attributes = attrs(&[("Alpha", &["alpha_id", "zeta_code"]), ("Zeta", &["code", "total_amount"])]);
        let primary_keys = BTreeMap::from([
            ("Alpha".to_string(), vec!["alpha_id".to_string()]),
            ("Zeta".to_string(), vec!["code".to_string()]),
        ]);
        let fks = vec![ForeignKey::new("Alpha", "zeta_code", "Zeta", "code")];
        let formulas = vec![
            DerivedFormula::new(key("Zeta.code"), "total_amount || ''", vec![key("Zeta.total_amount")]),
            DerivedFormula::new(key("Zeta.total_amount"), "code + 0", vec![key("Zeta.code")]),
        ];
        let graph = DependencyGraphBuilder::new(DependencyInputs {
            entities: &entities,
            attributes: &attributes,
            primary_keys: &primary_keys,
            foreign_keys: &fks,
            formulas: &formulas,
        })
        .build();

        assert!(graph.is_on_cycle(&key("Zeta.code")));
        let order = graph.resolution_order();
        assert_eq!(order.len(), 4);
        let pos = |k: &str| order.iter().position(|n| n == &key(k)).unwrap();
        assert!(pos("Zeta.code") < pos("Alpha.zeta_code"));
        assert!(pos("Zeta.total_amount") < pos("Alpha.zeta_code"));
    }

    #[test]
    fn test_fk_must_target_primary_key() {
        let entities = entities(&["Customer", "Order"]);
        let attributes = attrs(&[("Customer", &["customer_id", "email"]), ("Order", &["order_id", "email"])]);
        let primary_keys = BTreeMap::from([("Customer".to_string(), vec!["customer_id".to_string()])]);
        let fks = vec![ForeignKey::new("Order", "email", "Customer", "email")];

        let graph = DependencyGraphBuilder::new(DependencyInputs {
            entities: &entities,
            attributes: &attributes,
            primary_keys: &primary_keys,
            foreign_keys: &fks,
            formulas: &[],
        })
        .build();

        assert!(graph.fk_dependencies.is_empty());
        assert_eq!(graph.issues.len(), 1);
        assert!(graph.independent.contains(&key("Order.email")));
    }

    #[test]
    fn test_synthesize_foreign_keys_from_one_to_many() {
        let mut relation = Relation::new(
            "places",
            vec!["Customer".to_string(), "Order".to_string()],
            RelationType::OneToMany,
        );
        relation.entity_cardinalities =
            BTreeMap::from([("Customer".to_string(), Cardinality::One), ("Order".to_string(), Cardinality::Many)]);
        relation.entity_participations = BTreeMap::from([
            ("Customer".to_string(), Participation::Partial),
            ("Order".to_string(), Participation::Total),
        ]);
        let primary_keys = BTreeMap::from([("Customer".to_string(), vec!["id".to_string()])]);
        let attributes = attrs(&[("Customer", &["id"]), ("Order", &["order_id"])]);

        let synthesis = synthesize_foreign_keys(&[relation.clone()], &primary_keys, &attributes, &[]);
        assert_eq!(synthesis.foreign_keys, vec![ForeignKey::new("Order", "customer_id", "Customer", "id")]);
        assert_eq!(synthesis.implied_attributes.len(), 1);
        assert!(!synthesis.implied_attributes[0].1.nullable);

        // an existing key between the same entities suppresses synthesis
        let existing = synthesis.foreign_keys.clone();
        let again = synthesize_foreign_keys(&[relation], &primary_keys, &attributes, &existing);
        assert!(again.foreign_keys.is_empty());
    }
}
