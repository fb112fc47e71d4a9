//! Relation Cardinality & Participation
//!
//! - `RelationCardinalityStep`: the oracle call for one relation, with a
//!   validator that canonicalizes entity names and rejects incomplete answers
//! - `CardinalityReconciler`: the deterministic text heuristic used as the
//!   step's fallback
//!
//! A partially valid oracle answer is discarded as a whole; missing entities
//! are never patched from the heuristic.

use crate::grounding::{name_variants, split_words, CanonicalIndex};
use crate::model::{Cardinality, Participation, Relation, RelationType};
use crate::step::{OracleSchema, PromptContext, Step};
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;

/// Fact/event/log-like nouns: instances are many per counterpart
const FACT_WORDS: &[&str] = &[
    "order", "transaction", "event", "log", "payment", "line", "item", "entry", "record", "visit", "booking",
    "reservation", "shipment", "review", "invoice", "detail", "history", "activity", "rental", "purchase", "sale",
    "click", "session", "message", "comment", "enrollment", "claim", "ticket", "trip", "appointment", "reading",
];

/// Dimension/lookup-like nouns: instances are referenced by many facts
const DIMENSION_WORDS: &[&str] = &[
    "customer", "user", "category", "type", "status", "country", "region", "department", "store", "account",
    "brand", "supplier", "vendor", "lookup", "master", "company", "organization", "location", "city", "currency",
    "merchant", "product", "employee", "team", "branch", "warehouse", "segment", "plan", "tier", "class",
];

/// Per-entity assignment for one relation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationCardinality {
    pub cardinalities: BTreeMap<String, Cardinality>,
    pub participations: BTreeMap<String, Participation>,
    pub reasoning: String,
}

impl RelationCardinality {
    /// Copy the assignment onto a relation
    pub fn apply_to(&self, relation: &mut Relation) {
        relation.entity_cardinalities = self.cardinalities.clone();
        relation.entity_participations = self.participations.clone();
    }
}

/// Deterministic cardinality/participation heuristic
pub struct CardinalityReconciler;

impl CardinalityReconciler {
    /// Assign cardinality and participation to every entity of `relation`.
    ///
    /// `entity_descriptions` feeds the directional-phrase search and keyword
    /// scoring; missing descriptions are treated as empty.
    pub fn reconcile(relation: &Relation, entity_descriptions: &BTreeMap<String, String>) -> RelationCardinality {
        let text = Self::evidence_text(relation, entity_descriptions);
        let (cardinalities, mut reasoning) = Self::assign_cardinalities(relation, entity_descriptions, &text);

        let one_to_many_shape = cardinalities.len() == 2
            && cardinalities.values().any(|c| *c == Cardinality::One)
            && cardinalities.values().any(|c| *c == Cardinality::Many);

        let mut participations = BTreeMap::new();
        let mut forced = Vec::new();
        for entity in &relation.entities {
            let default = match cardinalities.get(entity) {
                Some(Cardinality::Many) if one_to_many_shape => Participation::Total,
                _ => Participation::Partial,
            };
            let participation = if Self::must_participate(entity, &text) {
                forced.push(entity.as_str());
                Participation::Total
            } else {
                default
            };
            participations.insert(entity.clone(), participation);
        }
        if !forced.is_empty() {
            reasoning.push_str(&format!("; 'must' forces total participation for {}", forced.join(", ")));
        }

        RelationCardinality {
            cardinalities,
            participations,
            reasoning,
        }
    }

    fn evidence_text(relation: &Relation, entity_descriptions: &BTreeMap<String, String>) -> String {
        let mut text = relation.description.clone();
        for entity in &relation.entities {
            if let Some(description) = entity_descriptions.get(entity) {
                text.push_str(". ");
                text.push_str(description);
            }
        }
        text
    }

    fn assign_cardinalities(
        relation: &Relation,
        entity_descriptions: &BTreeMap<String, String>,
        text: &str,
    ) -> (BTreeMap<String, Cardinality>, String) {
        let all = |c: Cardinality| -> BTreeMap<String, Cardinality> {
            relation.entities.iter().map(|e| (e.clone(), c)).collect()
        };

        match relation.relation_type {
            RelationType::OneToOne => return (all(Cardinality::One), "one-to-one: every side is 1".to_string()),
            RelationType::ManyToMany | RelationType::Ternary => {
                return (
                    all(Cardinality::Many),
                    format!("{}: every side is N", relation.relation_type.as_str()),
                )
            }
            RelationType::OneToMany | RelationType::ManyToOne | RelationType::Unknown => {}
        }

        let [first, second] = relation.entities.as_slice() else {
            return (all(Cardinality::Many), "n-ary relation without type information: every side is N".to_string());
        };

        if let Some((many, one, phrase)) = Self::directional(first, second, text) {
            let assigned = BTreeMap::from([(many.to_string(), Cardinality::Many), (one.to_string(), Cardinality::One)]);
            return (assigned, format!("directional phrase ({}) makes {} N and {} 1", phrase, many, one));
        }

        if relation.relation_type == RelationType::Unknown {
            return (all(Cardinality::Many), "unknown relation type and no directional phrase: every side is N".to_string());
        }

        let score_first = Self::fact_score(first, entity_descriptions.get(first));
        let score_second = Self::fact_score(second, entity_descriptions.get(second));
        let (many, one, why) = if score_first > score_second {
            (first, second, "keyword score")
        } else if score_second > score_first {
            (second, first, "keyword score")
        } else if relation.relation_type == RelationType::OneToMany {
            (second, first, "tie broken by declared one-to-many order")
        } else {
            (first, second, "tie broken by declared many-to-one order")
        };
        let assigned = BTreeMap::from([(many.clone(), Cardinality::Many), (one.clone(), Cardinality::One)]);
        (
            assigned,
            format!("{} ({}={}, {}={}) makes {} N and {} 1", why, first, score_first, second, score_second, many, one),
        )
    }

    /// Find "each X ... one Y", "Y can have many X" or "X belongs to a Y".
    /// Returns `(many_side, one_side, phrase_kind)`.
    fn directional<'e>(first: &'e str, second: &'e str, text: &str) -> Option<(&'e str, &'e str, &'static str)> {
        for (x, y) in [(first, second), (second, first)] {
            let (xs, ys) = (variant_alternation(x), variant_alternation(y));
            let patterns = [
                (
                    format!(
                        r"(?i)\beach\s+(?:{})\b[^.;]*?\b(?:one|a\s+single|exactly\s+one|only\s+one|at\s+most\s+one)\s+(?:{})\b",
                        xs, ys
                    ),
                    "each .. one",
                ),
                (
                    format!(
                        r"(?i)\b(?:{})\s+(?:can\s+|may\s+|will\s+|could\s+)?(?:have|has|contain|contains|include|includes|own|owns|place|places|make|makes|hold|holds|receive|receives)\s+(?:many|multiple|several|numerous|one\s+or\s+more)\s+(?:{})\b",
                        ys, xs
                    ),
                    "has many",
                ),
                (
                    format!(
                        r"(?i)\b(?:{})\s+belongs?\s+to\s+(?:one|a|an|exactly\s+one|a\s+single)\s+(?:{})\b",
                        xs, ys
                    ),
                    "belongs to",
                ),
            ];
            for (pattern, kind) in patterns {
                if Regex::new(&pattern).map(|re| re.is_match(text)).unwrap_or(false) {
                    return Some((x, y, kind));
                }
            }
        }
        None
    }

    /// Positive leans "N", negative leans "1". Name words count double.
    fn fact_score(entity: &str, description: Option<&String>) -> i32 {
        let score_words = |words: Vec<String>, weight: i32| -> i32 {
            words
                .iter()
                .map(|w| {
                    let singular = w.strip_suffix('s').unwrap_or(w);
                    let is = |set: &[&str]| set.contains(&w.as_str()) || set.contains(&singular);
                    if is(FACT_WORDS) {
                        weight
                    } else if is(DIMENSION_WORDS) {
                        -weight
                    } else {
                        0
                    }
                })
                .sum()
        };
        score_words(split_words(entity), 2) + description.map(|d| score_words(split_words(d), 1)).unwrap_or(0)
    }

    fn must_participate(entity: &str, text: &str) -> bool {
        let pattern = format!(r"(?i)\b(?:{})\s+must\b", variant_alternation(entity));
        Regex::new(&pattern).map(|re| re.is_match(text)).unwrap_or(false)
    }
}

/// Regex alternation over an entity's name variants, longest first
fn variant_alternation(entity: &str) -> String {
    let mut variants: Vec<String> = name_variants(entity).into_iter().collect();
    variants.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
    variants
        .iter()
        .map(|v| regex::escape(v).replace(' ', r"\s+"))
        .collect::<Vec<_>>()
        .join("|")
}

/// Oracle schema: per-entity assignments as a list or a map keyed by entity
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CardinalityResponse {
    pub assignments: LooseAssignments,
    #[serde(default)]
    pub reasoning: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum LooseAssignments {
    List(Vec<EntityAssignment>),
    Map(BTreeMap<String, AssignmentBody>),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EntityAssignment {
    pub entity: String,
    pub cardinality: String,
    pub participation: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AssignmentBody {
    pub cardinality: String,
    pub participation: String,
}

impl LooseAssignments {
    /// The single normalization point from either accepted shape
    pub fn normalize(self) -> Vec<EntityAssignment> {
        match self {
            LooseAssignments::List(list) => list,
            LooseAssignments::Map(map) => map
                .into_iter()
                .map(|(entity, body)| EntityAssignment {
                    entity,
                    cardinality: body.cardinality,
                    participation: body.participation,
                })
                .collect(),
        }
    }
}

impl OracleSchema for CardinalityResponse {
    fn json_schema() -> Value {
        json!({
            "type": "object",
            "properties": {
                "assignments": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "entity": {"type": "string"},
                            "cardinality": {"type": "string", "enum": ["1", "N"]},
                            "participation": {"type": "string", "enum": ["total", "partial"]}
                        },
                        "required": ["entity", "cardinality", "participation"],
                        "additionalProperties": false
                    }
                },
                "reasoning": {"type": "string"}
            },
            "required": ["assignments"],
            "additionalProperties": false
        })
    }
}

const CARDINALITY_SYSTEM_PROMPT: &str = "You are a database designer. For each entity taking part in a relation, \
decide its cardinality (\"1\" or \"N\") and its participation (\"total\" if every instance must take part, \
\"partial\" otherwise). Use the relation text as evidence. Return JSON only.";

/// Oracle step for one relation
#[derive(Debug, Clone)]
pub struct RelationCardinalityStep {
    pub relation: Relation,
    pub entity_descriptions: BTreeMap<String, String>,
}

impl RelationCardinalityStep {
    pub fn new(relation: Relation, entity_descriptions: BTreeMap<String, String>) -> Self {
        Self {
            relation,
            entity_descriptions,
        }
    }
}

impl Step for RelationCardinalityStep {
    type Response = CardinalityResponse;
    type Output = RelationCardinality;

    fn name(&self) -> &str {
        "relation_cardinality"
    }

    fn prompt(&self) -> PromptContext {
        let descriptions: Vec<String> = self
            .relation
            .entities
            .iter()
            .map(|e| format!("- {}: {}", e, self.entity_descriptions.get(e).map(String::as_str).unwrap_or("")))
            .collect();
        PromptContext::new(
            CARDINALITY_SYSTEM_PROMPT,
            "Relation: {relation_id}\nType: {relation_type}\nText: {relation_text}\nEntities:\n{entity_descriptions}\n\nAssign a cardinality and participation to every entity listed.",
        )
        .with_variable("relation_id", self.relation.id.clone())
        .with_variable("relation_type", self.relation.relation_type.as_str())
        .with_variable("relation_text", self.relation.description.clone())
        .with_variable("entity_descriptions", descriptions.join("\n"))
        .with_variable("entities", json!(self.relation.entities))
    }

    fn validate(&self, response: CardinalityResponse) -> std::result::Result<RelationCardinality, String> {
        let index = CanonicalIndex::new(&self.relation.entities);
        let mut cardinalities = BTreeMap::new();
        let mut participations = BTreeMap::new();
        let mut problems = Vec::new();

        for assignment in response.assignments.normalize() {
            let Some(entity) = index.canonicalize(&assignment.entity) else {
                let hint = index
                    .closest(&assignment.entity)
                    .map(|c| format!(" (did you mean '{}'?)", c))
                    .unwrap_or_default();
                problems.push(format!(
                    "'{}' is not an entity of this relation{}",
                    assignment.entity, hint
                ));
                continue;
            };
            if cardinalities.contains_key(&entity) {
                problems.push(format!("entity '{}' is assigned more than once", entity));
                continue;
            }
            match (
                Cardinality::parse(&assignment.cardinality),
                Participation::parse(&assignment.participation),
            ) {
                (Some(c), Some(p)) => {
                    cardinalities.insert(entity.clone(), c);
                    participations.insert(entity, p);
                }
                (c, p) => {
                    if c.is_none() {
                        problems.push(format!(
                            "cardinality '{}' for '{}' must be \"1\" or \"N\"",
                            assignment.cardinality, entity
                        ));
                    }
                    if p.is_none() {
                        problems.push(format!(
                            "participation '{}' for '{}' must be \"total\" or \"partial\"",
                            assignment.participation, entity
                        ));
                    }
                }
            }
        }

        let missing: Vec<&str> = self
            .relation
            .entities
            .iter()
            .filter(|e| !cardinalities.contains_key(*e))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() && problems.is_empty() {
            problems.push(format!("missing assignments for: {}", missing.join(", ")));
        }

        let binary_one_to_many = matches!(
            self.relation.relation_type,
            RelationType::OneToMany | RelationType::ManyToOne
        ) && self.relation.entities.len() == 2;
        if problems.is_empty() && binary_one_to_many {
            let ones = cardinalities.values().filter(|c| **c == Cardinality::One).count();
            if ones != 1 {
                problems.push(format!(
                    "a {} relation needs exactly one \"1\" side and one \"N\" side",
                    self.relation.relation_type.as_str()
                ));
            }
        }

        if !problems.is_empty() {
            return Err(problems.join("; "));
        }
        Ok(RelationCardinality {
            cardinalities,
            participations,
            reasoning: response.reasoning.unwrap_or_else(|| "oracle assignment".to_string()),
        })
    }

    fn fallback(&self) -> RelationCardinality {
        CardinalityReconciler::reconcile(&self.relation, &self.entity_descriptions)
    }
}
