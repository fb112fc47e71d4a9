use schema_synth::config::ConvergenceBudget;
use schema_synth::convergence::TerminatedBy;
use schema_synth::error::IssueKind;
use schema_synth::model::{Cardinality, EntityOrigin, Participation};
use schema_synth::state::Phase;
use schema_synth::step::{OfflineOracle, Oracle, Provenance, ScriptedOracle};
use schema_synth::types::{DataType, TypeSource};
use schema_synth::{GenerationState, PipelineReport, SchemaInput, SchemaPipeline, StepExecutor};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn pipeline(oracle: Arc<dyn Oracle>) -> SchemaPipeline {
    SchemaPipeline::with_executor(
        StepExecutor::new(oracle).with_call_timeout(Duration::from_secs(5)),
        ConvergenceBudget {
            max_iterations: 3,
            max_time: Duration::from_secs(10),
        },
    )
}

fn shop_input() -> SchemaInput {
    serde_json::from_value(json!({
        "source_text": "Customers sign up with an email. A customer places many orders. Each order records a quantity and a unit price.",
        "entities": [
            {"name": "Customer", "description": "A registered shopper", "evidence": "Customers sign up with an email"},
            {"name": "Order", "description": "A purchase placed by a customer", "evidence": "A customer places many orders"}
        ],
        "attributes": {
            "Customer": [
                {"name": "customer_id", "nullable": false},
                {"name": "email"}
            ],
            "Order": [
                {"name": "order_id", "nullable": false},
                {"name": "customer_id", "nullable": false},
                {"name": "quantity", "type_hint": "int"},
                {"name": "unit_price", "type_hint": "decimal(10,2)"},
                {"name": "total_price", "is_derived": true}
            ]
        },
        "relations": [
            {"id": "places", "entities": ["Customer", "Order"], "type": "one-to-many",
             "description": "A customer places many orders."}
        ],
        "primary_keys": {"Customer": ["customer_id"], "Order": ["order_id"]},
        "formulas": [
            {"attribute": "Order.total_price", "expression": "quantity * unit_price",
             "operands": ["Order.quantity", "Order.unit_price"]}
        ]
    }))
    .unwrap()
}

async fn run(oracle: Arc<dyn Oracle>, input: SchemaInput) -> GenerationState {
    pipeline(oracle).run(input).await.unwrap()
}

#[tokio::test]
async fn test_fk_propagation_customer_order() {
    let state = run(Arc::new(OfflineOracle), shop_input()).await;

    let relation = &state.relations()[0];
    assert_eq!(relation.cardinality_of("Customer"), Some(Cardinality::One));
    assert_eq!(relation.cardinality_of("Order"), Some(Cardinality::Many));

    let fk = state
        .foreign_keys()
        .iter()
        .find(|fk| fk.from_entity == "Order")
        .expect("FK synthesized from the 1:N relation");
    assert_eq!(fk.from_attributes, vec!["customer_id".to_string()]);
    assert_eq!(fk.to_entity, "Customer");

    let pk = &state.data_types()["Customer.customer_id"];
    let fk_type = &state.data_types()["Order.customer_id"];
    assert_eq!(pk.data_type, DataType::BigInt);
    assert!(fk_type.same_type_as(pk));
    assert_eq!(fk_type.source, TypeSource::ForeignKey);

    let summary = state.dependency_graph().unwrap().summary();
    assert_eq!(
        summary.fk_dependencies.get("Order.customer_id").map(String::as_str),
        Some("Customer.customer_id")
    );
}

#[tokio::test]
async fn test_derived_type_inference() {
    let state = run(Arc::new(OfflineOracle), shop_input()).await;

    let total = &state.data_types()["Order.total_price"];
    assert_eq!(total.data_type, DataType::Decimal);
    assert!(total.precision.unwrap() >= 10);
    assert_eq!(total.scale, Some(2));
    assert_eq!(total.source, TypeSource::Formula);
}

#[tokio::test]
async fn test_many_to_many_fallback() {
    let input: SchemaInput = serde_json::from_value(json!({
        "source_text": "Cards are used at merchants.",
        "entities": [{"name": "Card"}, {"name": "Merchant"}],
        "relations": [{"id": "used_at", "entities": ["Card", "Merchant"], "type": "many-to-many"}]
    }))
    .unwrap();
    let state = run(Arc::new(OfflineOracle), input).await;

    let relation = &state.relations()[0];
    for entity in ["Card", "Merchant"] {
        assert_eq!(relation.entity_cardinalities[entity], Cardinality::Many);
        assert_eq!(relation.entity_participations[entity], Participation::Partial);
    }
    assert_eq!(state.relation_provenance()["used_at"], Provenance::Fallback);
    assert!(state
        .issues()
        .iter()
        .any(|i| i.item == "used_at" && i.kind == IssueKind::OracleFailure));
}

#[tokio::test]
async fn test_grounding_rejection() {
    let input: SchemaInput = serde_json::from_value(json!({
        "source_text": "Patients book appointments.",
        "entities": [
            {"name": "Patient", "evidence": "Patients book appointments", "confidence": 0.95},
            {"name": "Insurer", "evidence": "Patients are covered by insurers", "confidence": 0.9}
        ]
    }))
    .unwrap();
    let state = run(Arc::new(OfflineOracle), input).await;

    let patient = &state.entities()[0];
    assert_eq!(patient.origin, EntityOrigin::Explicit);
    assert_eq!(patient.confidence, 0.95);

    let insurer = &state.entities()[1];
    assert_eq!(insurer.origin, EntityOrigin::Implied);
    assert!(insurer.evidence.is_none());
    assert!(insurer.confidence <= 0.5);
    assert!(state
        .issues()
        .iter()
        .any(|i| i.item == "Insurer" && i.kind == IssueKind::GroundingFailure));
}

#[tokio::test]
async fn test_cardinality_repair_round_trip() {
    let oracle = Arc::new(ScriptedOracle::new());
    oracle
        .push(
            "relation_cardinality",
            json!({"assignments": [{"entity": "Customer", "cardinality": "1", "participation": "partial"}]}),
        )
        .push(
            "relation_cardinality",
            json!({"assignments": {
                "customers": {"cardinality": "1", "participation": "partial"},
                "orders": {"cardinality": "N", "participation": "total"}
            }}),
        );
    let state = run(oracle.clone(), shop_input()).await;

    assert_eq!(state.relation_provenance()["places"], Provenance::Oracle);
    let calls = oracle.calls_for("relation_cardinality");
    assert_eq!(calls.len(), 2);
    assert!(calls[1].human_prompt.contains("Your previous response was rejected"));
    assert!(calls[1].human_prompt.contains("missing assignments for: Order"));
    assert_eq!(
        state.relations()[0].entity_participations["Order"],
        Participation::Total
    );
}

#[tokio::test]
async fn test_consolidation_remaps_attributes() {
    let mut input = shop_input();
    input.entities.push(serde_json::from_value(json!({"name": "Client"})).unwrap());
    input.decisions = serde_json::from_value(json!([
        {"action": "merge", "sources": ["Client"], "into": "Customer", "reason": "synonym"}
    ]))
    .unwrap();
    input
        .attributes
        .insert("Client".to_string(), serde_json::from_value(json!([{"name": "phone"}])).unwrap());

    let state = run(Arc::new(OfflineOracle), input).await;

    assert!(state.entities().iter().all(|e| e.name != "Client"));
    assert!(state.attributes()["Customer"].iter().any(|a| a.name == "phone"));
    assert_eq!(state.reclassifications().len(), 1);
}

#[tokio::test]
async fn test_offline_run_is_complete_and_reported() {
    let state = run(Arc::new(OfflineOracle), shop_input()).await;

    let phases: Vec<Phase> = state.phase_log().iter().map(|p| p.phase).collect();
    assert_eq!(
        phases,
        vec![
            Phase::Entities,
            Phase::Attributes,
            Phase::Relations,
            Phase::Keys,
            Phase::Dependencies,
            Phase::DataTypes,
            Phase::Constraints
        ]
    );

    let constraints = state.constraints().unwrap();
    assert_eq!(constraints.terminated_by, TerminatedBy::ConditionMet);
    assert!(!constraints.constraints.is_empty());

    let report = PipelineReport::from_state(&state, "offline");
    let rendered = serde_json::to_value(&report).unwrap();
    assert_eq!(rendered["data_types"]["Order.customer_id"]["type"], "BIGINT");
    assert_eq!(rendered["relations"][0]["entity_cardinalities"]["Order"], "N");
}

#[tokio::test]
async fn test_fallback_is_deterministic() {
    let a = run(Arc::new(OfflineOracle), shop_input()).await;
    let b = run(Arc::new(OfflineOracle), shop_input()).await;

    assert_eq!(a.relations(), b.relations());
    assert_eq!(a.data_types(), b.data_types());
    assert_eq!(
        a.constraints().map(|c| c.constraints.clone()),
        b.constraints().map(|c| c.constraints.clone())
    );
    assert_ne!(a.run_id(), b.run_id());
}

#[tokio::test]
async fn test_rejected_repair_is_reported_as_validation_failure() {
    let oracle = Arc::new(ScriptedOracle::new());
    let incomplete = json!({"assignments": [{"entity": "Customer", "cardinality": "1", "participation": "partial"}]});
    oracle
        .push("relation_cardinality", incomplete.clone())
        .push("relation_cardinality", incomplete);
    let state = run(oracle, shop_input()).await;

    assert_eq!(state.relation_provenance()["places"], Provenance::Fallback);
    let issue = state.issues().iter().find(|i| i.item == "places").unwrap();
    assert_eq!(issue.kind, IssueKind::ValidationFailure);
    assert!(state
        .issues()
        .iter()
        .any(|i| i.item == "Customer.email" && i.kind == IssueKind::OracleFailure));
}

#[tokio::test]
async fn test_relation_with_unknown_entity_is_rejected_whole() {
    let mut input = shop_input();
    input.relations.push(
        serde_json::from_value(json!({
            "id": "stocks", "entities": ["Customer", "Order", "Warehouse"], "type": "ternary"
        }))
        .unwrap(),
    );
    let state = run(Arc::new(OfflineOracle), input).await;

    assert_eq!(state.relations().len(), 1);
    assert!(state.relations().iter().all(|r| r.id != "stocks"));
    assert!(!state.relation_provenance().contains_key("stocks"));
    let issue = state.issues().iter().find(|i| i.item == "stocks").unwrap();
    assert_eq!(issue.kind, IssueKind::StructuralInconsistency);
    assert!(issue.detail.contains("Warehouse"));
}
