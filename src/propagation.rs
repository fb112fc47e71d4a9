//! Type Propagation
//!
//! Resolves a `TypeAssignment` for every attribute node of a dependency graph:
//! 1. independent attributes: one oracle step each, fanned out concurrently,
//!    with the name/hint heuristic as fallback
//! 2. FK attributes: exact copy of the referenced key's assignment
//! 3. derived attributes: inferred from the formula and its operand types
//!
//! Passes 2 and 3 share one walk in resolution order, so FK chains and
//! formulas over FK columns see their dependencies already typed.

use crate::dependency::DependencyGraph;
use crate::formula::infer_formula_type;
use crate::model::{Attribute, AttributeKey, DerivedFormula, Entity};
use crate::step::{FallbackCause, OracleSchema, PromptContext, Step, StepExecutor, StepOutcome};
use crate::types::{infer_from_name, DataType, TypeAssignment, TypeSource};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Oracle schema for one attribute's type
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AttributeTypeResponse {
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub size: Option<u32>,
    #[serde(default)]
    pub precision: Option<u32>,
    #[serde(default)]
    pub scale: Option<u32>,
    #[serde(default)]
    pub reasoning: String,
}

impl OracleSchema for AttributeTypeResponse {
    fn json_schema() -> Value {
        let types: Vec<&str> = [
            DataType::SmallInt,
            DataType::Int,
            DataType::BigInt,
            DataType::Decimal,
            DataType::Double,
            DataType::Boolean,
            DataType::Date,
            DataType::Timestamp,
            DataType::Varchar,
            DataType::Text,
        ]
        .iter()
        .map(DataType::as_str)
        .collect();
        json!({
            "type": "object",
            "properties": {
                "type": {"type": "string", "enum": types},
                "size": {"type": "integer", "minimum": 1},
                "precision": {"type": "integer", "minimum": 1},
                "scale": {"type": "integer", "minimum": 0},
                "reasoning": {"type": "string"}
            },
            "required": ["type", "reasoning"],
            "additionalProperties": false
        })
    }
}

const TYPE_SYSTEM_PROMPT: &str = "You are a database designer choosing SQL column types. \
Pick the narrowest type that safely holds every plausible value. VARCHAR needs a size, \
DECIMAL needs a precision and scale. Return JSON only.";

/// Oracle step typing one independent attribute
#[derive(Debug, Clone)]
pub struct AttributeTypeStep {
    pub key: AttributeKey,
    pub attribute: Attribute,
    pub entity_description: String,
}

impl AttributeTypeStep {
    pub fn new(key: AttributeKey, attribute: Attribute, entity_description: impl Into<String>) -> Self {
        Self {
            key,
            attribute,
            entity_description: entity_description.into(),
        }
    }
}

impl Step for AttributeTypeStep {
    type Response = AttributeTypeResponse;
    type Output = TypeAssignment;

    fn name(&self) -> &str {
        "attribute_type"
    }

    fn prompt(&self) -> PromptContext {
        PromptContext::new(
            TYPE_SYSTEM_PROMPT,
            "Entity: {entity} ({entity_description})\nAttribute: {attribute}\nDescription: {attribute_description}\nType hint: {type_hint}\nNullable: {nullable}\n\nChoose the SQL type for this attribute.",
        )
        .with_variable("attribute_key", self.key.to_string())
        .with_variable("entity", self.key.entity.clone())
        .with_variable("entity_description", self.entity_description.clone())
        .with_variable("attribute", self.attribute.name.clone())
        .with_variable("attribute_description", self.attribute.description.clone())
        .with_variable("type_hint", self.attribute.type_hint.clone().unwrap_or_else(|| "none".to_string()))
        .with_variable("nullable", self.attribute.nullable)
    }

    fn validate(&self, response: AttributeTypeResponse) -> std::result::Result<TypeAssignment, String> {
        TypeAssignment::from_parts(
            &response.data_type,
            response.size,
            response.precision,
            response.scale,
            TypeSource::Oracle,
            response.reasoning,
        )
        .map_err(|e| format!("{}: {}", self.key, e))
    }

    fn fallback(&self) -> TypeAssignment {
        infer_from_name(&self.attribute.name, self.attribute.type_hint.as_deref())
    }
}

/// An independent attribute typed by the heuristic instead of the oracle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeFallback {
    pub cause: FallbackCause,
    pub reason: String,
}

/// Result of the three passes
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TypeResolution {
    pub assignments: BTreeMap<AttributeKey, TypeAssignment>,
    /// Independent attributes whose oracle step fell back
    pub fallback_reasons: BTreeMap<AttributeKey, TypeFallback>,
    pub warnings: Vec<String>,
}

impl TypeResolution {
    pub fn get(&self, key: &AttributeKey) -> Option<&TypeAssignment> {
        self.assignments.get(key)
    }

    /// Assignments keyed `entity.attribute`
    pub fn keyed(&self) -> BTreeMap<String, TypeAssignment> {
        self.assignments
            .iter()
            .map(|(key, assignment)| (key.to_string(), assignment.clone()))
            .collect()
    }

    /// FK attributes whose type differs from the referenced key's
    pub fn fk_mismatches(&self, graph: &DependencyGraph) -> Vec<AttributeKey> {
        graph
            .fk_dependencies
            .iter()
            .filter(|(fk, pk)| match (self.assignments.get(*fk), self.assignments.get(*pk)) {
                (Some(a), Some(b)) => !a.same_type_as(b),
                _ => true,
            })
            .map(|(fk, _)| fk.clone())
            .collect()
    }
}

/// Drives type resolution over a dependency graph
#[derive(Clone)]
pub struct TypePropagationEngine {
    executor: StepExecutor,
}

impl TypePropagationEngine {
    pub fn new(executor: StepExecutor) -> Self {
        Self { executor }
    }

    /// Type every node of `graph`
    pub async fn resolve(
        &self,
        graph: &DependencyGraph,
        entities: &[Entity],
        attributes: &BTreeMap<String, Vec<Attribute>>,
        formulas: &[DerivedFormula],
    ) -> TypeResolution {
        let lookup = attribute_lookup(attributes);
        let mut resolution = TypeResolution::default();

        self.resolve_independent(graph, entities, &lookup, &mut resolution).await;
        propagate_dependents(graph, &lookup, formulas, &mut resolution);

        info!(
            "✅ Typed {} attributes ({} fallbacks, {} warnings)",
            resolution.assignments.len(),
            resolution.fallback_reasons.len(),
            resolution.warnings.len()
        );
        resolution
    }

    async fn resolve_independent(
        &self,
        graph: &DependencyGraph,
        entities: &[Entity],
        lookup: &BTreeMap<AttributeKey, &Attribute>,
        resolution: &mut TypeResolution,
    ) {
        let descriptions: BTreeMap<&str, &str> = entities
            .iter()
            .map(|e| (e.name.as_str(), e.description.as_str()))
            .collect();

        let steps: Vec<AttributeTypeStep> = graph
            .independent
            .iter()
            .filter_map(|key| {
                let attribute = lookup.get(key)?;
                let description = descriptions.get(key.entity.as_str()).copied().unwrap_or("");
                Some(AttributeTypeStep::new(key.clone(), (*attribute).clone(), description))
            })
            .collect();
        let keys: Vec<AttributeKey> = steps.iter().map(|s| s.key.clone()).collect();

        info!("🤖 Typing {} independent attributes", steps.len());
        let outcomes = self.executor.execute_all(steps).await;

        for (key, outcome) in keys.into_iter().zip(outcomes) {
            if let StepOutcome::Fallback { cause, reason, .. } = &outcome {
                resolution.fallback_reasons.insert(
                    key.clone(),
                    TypeFallback {
                        cause: *cause,
                        reason: reason.clone(),
                    },
                );
            }
            resolution.assignments.insert(key, outcome.into_value());
        }
    }
}

fn attribute_lookup(attributes: &BTreeMap<String, Vec<Attribute>>) -> BTreeMap<AttributeKey, &Attribute> {
    attributes
        .iter()
        .flat_map(|(entity, list)| list.iter().map(move |a| (AttributeKey::new(entity, &a.name), a)))
        .collect()
}

/// FK copy and formula inference for every dependent node, in resolution order
fn propagate_dependents(
    graph: &DependencyGraph,
    lookup: &BTreeMap<AttributeKey, &Attribute>,
    formulas: &[DerivedFormula],
    resolution: &mut TypeResolution,
) {
    let formulas: BTreeMap<&AttributeKey, &DerivedFormula> = formulas.iter().map(|f| (&f.attribute, f)).collect();

    for key in graph.resolution_order() {
        if resolution.assignments.contains_key(&key) {
            continue;
        }
        if let Some(target) = graph.fk_dependencies.get(&key) {
            let assignment = copy_foreign_key(&key, target, resolution);
            resolution.assignments.insert(key, assignment);
        } else if graph.derived_dependencies.contains_key(&key) {
            let assignment = infer_derived(graph, &key, lookup, formulas.get(&key).copied(), resolution);
            resolution.assignments.insert(key, assignment);
        }
    }
}

fn copy_foreign_key(key: &AttributeKey, target: &AttributeKey, resolution: &mut TypeResolution) -> TypeAssignment {
    match resolution.assignments.get(target) {
        Some(pk) => {
            debug!("FK {} copies {} from {}", key, pk, target);
            pk.retyped(TypeSource::ForeignKey, format!("copied from referenced key {}", target))
        }
        None => {
            let message = format!("FK {} references {} which has no type; defaulting to BIGINT", key, target);
            warn!("⚠️  {}", message);
            resolution.warnings.push(message);
            TypeAssignment::new(DataType::BigInt, TypeSource::Fallback, format!("unresolved reference to {}", target))
        }
    }
}

fn infer_derived(
    graph: &DependencyGraph,
    key: &AttributeKey,
    lookup: &BTreeMap<AttributeKey, &Attribute>,
    formula: Option<&DerivedFormula>,
    resolution: &mut TypeResolution,
) -> TypeAssignment {
    let heuristic = |note: &str| {
        let mut assignment = match lookup.get(key) {
            Some(attribute) => infer_from_name(&attribute.name, attribute.type_hint.as_deref()),
            None => infer_from_name(&key.attribute, None),
        };
        assignment.reasoning = format!("{}; {}", note, assignment.reasoning);
        assignment
    };

    if graph.is_on_cycle(key) {
        let message = format!("{} is on a derivation cycle; typed by name", key);
        warn!("⚠️  {}", message);
        resolution.warnings.push(message);
        return heuristic("derivation cycle");
    }

    let Some(formula) = formula else {
        return heuristic("no formula recorded");
    };
    let operand_types: Vec<&TypeAssignment> = formula
        .operands
        .iter()
        .filter_map(|operand| resolution.assignments.get(operand))
        .collect();
    if operand_types.len() != formula.operands.len() {
        return heuristic("operand types unavailable");
    }

    match infer_formula_type(&formula.expression, &operand_types) {
        Some(mut assignment) => {
            assignment.reasoning = format!("{} from `{}`", assignment.reasoning, formula.expression);
            assignment
        }
        None => heuristic("formula gives no type information"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dependency::{DependencyGraphBuilder, DependencyInputs};
    use crate::error::{Result, SchemaError};
    use crate::model::ForeignKey;
    use std::collections::BTreeSet;
    use crate::step::{OfflineOracle, Oracle, OracleRequest};
    use async_trait::async_trait;
    use std::sync::Arc;

    /// Answers `attribute_type` calls from a table keyed `entity.attribute`
    struct TypeTableOracle(BTreeMap<String, Value>);

    #[async_trait]
    impl Oracle for TypeTableOracle {
        fn name(&self) -> &str {
            "type-table"
        }

        async fn invoke(&self, request: &OracleRequest) -> Result<Value> {
            let key = request
                .input_variables
                .get("attribute_key")
                .and_then(Value::as_str)
                .unwrap_or_default();
            self.0
                .get(key)
                .cloned()
                .ok_or_else(|| SchemaError::Oracle(format!("no answer for {}", key)))
        }
    }

    struct Fixture {
        entities: Vec<Entity>,
        attributes: BTreeMap<String, Vec<Attribute>>,
        primary_keys: BTreeMap<String, Vec<String>>,
        foreign_keys: Vec<ForeignKey>,
        formulas: Vec<DerivedFormula>,
    }

    impl Fixture {
        fn shop() -> Self {
            let attributes = BTreeMap::from([
                (
                    "Customer".to_string(),
                    vec![Attribute::new("customer_id").required(), Attribute::new("email")],
                ),
                (
                    "Order".to_string(),
                    vec![
                        Attribute::new("order_id").required(),
                        Attribute::new("customer_id").required(),
                        Attribute::new("quantity"),
                        Attribute::new("unit_price"),
                        Attribute::new("total_price").derived(),
                    ],
                ),
            ]);
            Self {
                entities: vec![Entity::new("Customer", "A shopper"), Entity::new("Order", "A purchase")],
                attributes,
                primary_keys: BTreeMap::from([
                    ("Customer".to_string(), vec!["customer_id".to_string()]),
                    ("Order".to_string(), vec!["order_id".to_string()]),
                ]),
                foreign_keys: vec![ForeignKey::new("Order", "customer_id", "Customer", "customer_id")],
                formulas: vec![DerivedFormula::new(
                    AttributeKey::new("Order", "total_price"),
                    "quantity * unit_price",
                    vec![AttributeKey::new("Order", "quantity"), AttributeKey::new("Order", "unit_price")],
                )],
            }
        }

        fn graph(&self) -> DependencyGraph {
            DependencyGraphBuilder::new(DependencyInputs {
                entities: &self.entities,
                attributes: &self.attributes,
                primary_keys: &self.primary_keys,
                foreign_keys: &self.foreign_keys,
                formulas: &self.formulas,
            })
            .build()
        }

        async fn resolve(&self, oracle: Arc<dyn Oracle>) -> (DependencyGraph, TypeResolution) {
            let graph = self.graph();
            let engine = TypePropagationEngine::new(StepExecutor::new(oracle));
            let resolution = engine
                .resolve(&graph, &self.entities, &self.attributes, &self.formulas)
                .await;
            (graph, resolution)
        }
    }

    #[tokio::test]
    async fn test_fk_copies_oracle_pk_type() {
        let fixture = Fixture::shop();
        let oracle = TypeTableOracle(BTreeMap::from([
            ("Customer.customer_id".to_string(), json!({"type": "BIGINT", "reasoning": "surrogate key"})),
            ("Order.unit_price".to_string(), json!({"type": "DECIMAL", "precision": 10, "scale": 2, "reasoning": "money"})),
            ("Order.quantity".to_string(), json!({"type": "INT", "reasoning": "count"})),
        ]));
        let (graph, resolution) = fixture.resolve(Arc::new(oracle)).await;

        let fk = resolution.get(&AttributeKey::new("Order", "customer_id")).unwrap();
        assert_eq!(fk.data_type, DataType::BigInt);
        assert_eq!(fk.source, TypeSource::ForeignKey);
        assert!(resolution.fk_mismatches(&graph).is_empty());

        let pk = resolution.get(&AttributeKey::new("Customer", "customer_id")).unwrap();
        assert_eq!(pk.source, TypeSource::Oracle);
        assert!(resolution.fallback_reasons.contains_key(&AttributeKey::new("Customer", "email")));
    }

    #[tokio::test]
    async fn test_derived_decimal_product() {
        let fixture = Fixture::shop();
        let oracle = TypeTableOracle(BTreeMap::from([
            ("Order.unit_price".to_string(), json!({"type": "DECIMAL(10,2)", "reasoning": "money"})),
            ("Order.quantity".to_string(), json!({"type": "INT", "reasoning": "count"})),
        ]));
        let (_, resolution) = fixture.resolve(Arc::new(oracle)).await;

        let total = resolution.get(&AttributeKey::new("Order", "total_price")).unwrap();
        assert_eq!(total.data_type, DataType::Decimal);
        assert!(total.precision.unwrap() >= 10);
        assert_eq!(total.scale, Some(2));
        assert_eq!(total.source, TypeSource::Formula);
    }

    #[tokio::test]
    async fn test_offline_resolution_covers_every_node() {
        let fixture = Fixture::shop();
        let (graph, resolution) = fixture.resolve(Arc::new(OfflineOracle)).await;

        assert_eq!(resolution.assignments.len(), graph.nodes().count());
        assert_eq!(
            resolution.get(&AttributeKey::new("Customer", "customer_id")).unwrap().data_type,
            DataType::BigInt
        );
        assert!(resolution.fk_mismatches(&graph).is_empty());
        assert_eq!(resolution.fallback_reasons.len(), graph.independent.len());
    }

    #[tokio::test]
    async fn test_invalid_oracle_type_falls_back() {
        let fixture = Fixture::shop();
        let oracle = TypeTableOracle(BTreeMap::from([(
            "Order.unit_price".to_string(),
            json!({"type": "CURRENCY", "reasoning": "money"}),
        )]));
        let (_, resolution) = fixture.resolve(Arc::new(oracle)).await;

        let price = resolution.get(&AttributeKey::new("Order", "unit_price")).unwrap();
        assert_eq!(price.source, TypeSource::Fallback);
        assert_eq!(price.data_type, DataType::Decimal);
        let fallback = &resolution.fallback_reasons[&AttributeKey::new("Order", "unit_price")];
        assert!(fallback.reason.contains("CURRENCY"));
        assert_eq!(fallback.cause, FallbackCause::Validation);
    }

    #[tokio::test]
    async fn test_cycle_members_use_name_heuristic() {
        let attributes = BTreeMap::from([(
            "Ledger".to_string(),
            vec![Attribute::new("balance").derived(), Attribute::new("credit_amount").derived()],
        )]);
        let formulas = vec![
            DerivedFormula::new(
                AttributeKey::new("Ledger", "balance"),
                "credit_amount + 1",
                vec![AttributeKey::new("Ledger", "credit_amount")],
            ),
            DerivedFormula::new(
                AttributeKey::new("Ledger", "credit_amount"),
                "balance - 1",
                vec![AttributeKey::new("Ledger", "balance")],
            ),
        ];
        let entities = vec![Entity::new("Ledger", "")];
        let primary_keys = BTreeMap::new();
        let graph = DependencyGraphBuilder::new(DependencyInputs {
            entities: &entities,
            attributes: &attributes,
            primary_keys: &primary_keys,
            foreign_keys: &[],
            formulas: &formulas,
        })
        .build();

        let engine = TypePropagationEngine::new(StepExecutor::new(Arc::new(OfflineOracle)));
        let resolution = engine.resolve(&graph, &entities, &attributes, &formulas).await;

        let credit = resolution.get(&AttributeKey::new("Ledger", "credit_amount")).unwrap();
        assert_eq!(credit.data_type, DataType::Decimal);
        assert!(credit.reasoning.starts_with("derivation cycle"));
        assert_eq!(resolution.warnings.len(), 2);
    }

    #[tokio::test]
    async fn test_fk_to_cyclic_key_copies_its_type() {
        let entities = vec![Entity::new("Alpha", ""), Entity::new("Zeta", "")];
        let attributes = BTreeMap::from([
            (
                "Alpha".to_string(),
                vec![Attribute::new("alpha_id").required(), Attribute::new("zeta_code")],
            ),
            (
                "Zeta".to_string(),
                vec![Attribute::new("code").derived(), Attribute::new("total_amount").derived()],
            ),
        ]);
        let primary_keys = BTreeMap::from([
            ("Alpha".to_string(), vec!["alpha_id".to_string()]),
            ("Zeta".to_string(), vec!["code".to_string()]),
        ]);
        let foreign_keys = vec![ForeignKey::new("Alpha", "zeta_code", "Zeta", "code")];
        let formulas = vec![
            DerivedFormula::new(
                AttributeKey::new("Zeta", "code"),
                "total_amount || ''",
                vec![AttributeKey::new("Zeta", "total_amount")],
            ),
            DerivedFormula::new(
                AttributeKey::new("Zeta", "total_amount"),
                "code + 0",
                vec![AttributeKey::new("Zeta", "code")],
            ),
        ];
        let graph = DependencyGraphBuilder::new(DependencyInputs {
            entities: &entities,
            attributes: &attributes,
            primary_keys: &primary_keys,
            foreign_keys: &foreign_keys,
            formulas: &formulas,
        })
        .build();

        let engine = TypePropagationEngine::new(StepExecutor::new(Arc::new(OfflineOracle)));
        let resolution = engine.resolve(&graph, &entities, &attributes, &formulas).await;

        let pk = resolution.get(&AttributeKey::new("Zeta", "code")).unwrap();
        let fk = resolution.get(&AttributeKey::new("Alpha", "zeta_code")).unwrap();
        assert!(pk.reasoning.starts_with("derivation cycle"));
        assert!(fk.same_type_as(pk));
        assert_eq!(fk.source, TypeSource::ForeignKey);
        assert!(resolution.fk_mismatches(&graph).is_empty());
        assert!(resolution.warnings.iter().all(|w| !w.contains("BIGINT")));
    }

    #[tokio::test]
    async fn test_fk_to_untyped_reference_defaults_to_bigint() {
        let fk_key = AttributeKey::new("Order", "customer_id");
        let target = AttributeKey::new("Customer", "customer_id");
        let graph = DependencyGraph {
            dependent: BTreeSet::from([fk_key.clone()]),
            fk_dependencies: BTreeMap::from([(fk_key.clone(), target.clone())]),
            ..DependencyGraph::default()
        };
        let attributes = BTreeMap::from([("Order".to_string(), vec![Attribute::new("customer_id")])]);
        let entities = vec![Entity::new("Order", "")];

        let engine = TypePropagationEngine::new(StepExecutor::new(Arc::new(OfflineOracle)));
        let resolution = engine.resolve(&graph, &entities, &attributes, &[]).await;

        let fk = resolution.get(&fk_key).unwrap();
        assert_eq!(fk.data_type, DataType::BigInt);
        assert_eq!(fk.source, TypeSource::Fallback);
        assert_eq!(resolution.warnings.len(), 1);
        assert!(resolution.warnings[0].contains("Customer.customer_id"));
        assert_eq!(resolution.fk_mismatches(&graph), vec![fk_key]);
    }
}
