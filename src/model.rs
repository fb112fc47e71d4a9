//! Schema Records
//!
//! Plain structured records exchanged between phases: entities, attributes,
//! keys, relations and derived-attribute formulas.

use crate::error::{Result, SchemaError};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// How an entity entered the schema
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityOrigin {
    /// Named directly in the source text
    Explicit,
    /// Inferred from the source text without a direct mention
    Implied,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default = "default_origin")]
    pub origin: EntityOrigin,
    /// Verbatim snippet of the source text that justifies this entity
    #[serde(default)]
    pub evidence: Option<String>,
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

fn default_origin() -> EntityOrigin {
    EntityOrigin::Explicit
}

fn default_confidence() -> f64 {
    1.0
}

impl Entity {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            origin: EntityOrigin::Explicit,
            evidence: None,
            confidence: 1.0,
        }
    }

    pub fn with_evidence(mut self, evidence: impl Into<String>) -> Self {
        self.evidence = Some(evidence.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attribute {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Free-form type hint from an upstream step, e.g. "decimal(10,2)" or "date"
    #[serde(default)]
    pub type_hint: Option<String>,
    #[serde(default = "default_nullable")]
    pub nullable: bool,
    #[serde(default)]
    pub is_derived: bool,
    #[serde(default)]
    pub is_multivalued: bool,
}

fn default_nullable() -> bool {
    true
}

impl Attribute {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            type_hint: None,
            nullable: true,
            is_derived: false,
            is_multivalued: false,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.type_hint = Some(hint.into());
        self
    }

    pub fn required(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn derived(mut self) -> Self {
        self.is_derived = true;
        self
    }
}

/// Composite `(entity, attribute)` key, rendered as `entity.attribute`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct AttributeKey {
    pub entity: String,
    pub attribute: String,
}

impl AttributeKey {
    pub fn new(entity: impl Into<String>, attribute: impl Into<String>) -> Self {
        Self {
            entity: entity.into(),
            attribute: attribute.into(),
        }
    }

    pub fn parse(raw: &str) -> Result<Self> {
        match raw.split_once('.') {
            Some((entity, attribute)) if !entity.trim().is_empty() && !attribute.trim().is_empty() => {
                Ok(Self::new(entity.trim(), attribute.trim()))
            }
            _ => Err(SchemaError::Validation(format!(
                "Attribute key '{}' is not of the form entity.attribute",
                raw
            ))),
        }
    }
}

impl fmt::Display for AttributeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.attribute)
    }
}

impl From<AttributeKey> for String {
    fn from(key: AttributeKey) -> Self {
        key.to_string()
    }
}

impl TryFrom<String> for AttributeKey {
    type Error = SchemaError;

    fn try_from(raw: String) -> Result<Self> {
        Self::parse(&raw)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub from_entity: String,
    pub from_attributes: Vec<String>,
    pub to_entity: String,
    pub to_attributes: Vec<String>,
}

impl ForeignKey {
    pub fn new(
        from_entity: impl Into<String>,
        from_attribute: impl Into<String>,
        to_entity: impl Into<String>,
        to_attribute: impl Into<String>,
    ) -> Self {
        Self {
            from_entity: from_entity.into(),
            from_attributes: vec![from_attribute.into()],
            to_entity: to_entity.into(),
            to_attributes: vec![to_attribute.into()],
        }
    }

    /// Check the arity invariant
    pub fn validate(&self) -> Result<()> {
        if self.from_attributes.is_empty() {
            return Err(SchemaError::Structural(format!(
                "Foreign key {} -> {} has no attributes",
                self.from_entity, self.to_entity
            )));
        }
        if self.from_attributes.len() != self.to_attributes.len() {
            return Err(SchemaError::Structural(format!(
                "Foreign key {}({}) -> {}({}) has mismatched arity",
                self.from_entity,
                self.from_attributes.join(", "),
                self.to_entity,
                self.to_attributes.join(", ")
            )));
        }
        Ok(())
    }

    /// Column pairs `(from, to)` in declaration order
    pub fn pairs(&self) -> impl Iterator<Item = (AttributeKey, AttributeKey)> + '_ {
        self.from_attributes
            .iter()
            .zip(self.to_attributes.iter())
            .map(move |(from, to)| {
                (
                    AttributeKey::new(&self.from_entity, from),
                    AttributeKey::new(&self.to_entity, to),
                )
            })
    }
}

impl fmt::Display for ForeignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}({}) -> {}({})",
            self.from_entity,
            self.from_attributes.join(", "),
            self.to_entity,
            self.to_attributes.join(", ")
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String")]
pub enum RelationType {
    #[serde(rename = "one-to-one")]
    OneToOne,
    #[serde(rename = "one-to-many")]
    OneToMany,
    #[serde(rename = "many-to-one")]
    ManyToOne,
    #[serde(rename = "many-to-many")]
    ManyToMany,
    #[serde(rename = "ternary")]
    Ternary,
    #[serde(rename = "unknown")]
    Unknown,
}

impl From<String> for RelationType {
    fn from(raw: String) -> Self {
        RelationType::parse_loose(&raw)
    }
}

impl RelationType {
    /// Lenient parse for loosely formatted labels ("1:N", "Many To Many", ...)
    pub fn parse_loose(raw: &str) -> Self {
        let normalized: String = raw
            .trim()
            .to_lowercase()
            .chars()
            .map(|c| if c.is_alphanumeric() || c == ':' { c } else { '-' })
            .collect();
        match normalized.as_str() {
            "one-to-one" | "1:1" | "onetoone" => RelationType::OneToOne,
            "one-to-many" | "1:n" | "1:m" | "onetomany" => RelationType::OneToMany,
            "many-to-one" | "n:1" | "m:1" | "manytoone" => RelationType::ManyToOne,
            "many-to-many" | "n:n" | "m:n" | "n:m" | "manytomany" => RelationType::ManyToMany,
            "ternary" | "n-ary" | "nary" => RelationType::Ternary,
            _ => RelationType::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationType::OneToOne => "one-to-one",
            RelationType::OneToMany => "one-to-many",
            RelationType::ManyToOne => "many-to-one",
            RelationType::ManyToMany => "many-to-many",
            RelationType::Ternary => "ternary",
            RelationType::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Cardinality {
    #[serde(rename = "1")]
    One,
    #[serde(rename = "N")]
    Many,
}

impl Cardinality {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "1" => Some(Cardinality::One),
            "N" | "n" | "M" | "m" => Some(Cardinality::Many),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Cardinality::One => "1",
            Cardinality::Many => "N",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Participation {
    Total,
    Partial,
}

impl Participation {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "total" => Some(Participation::Total),
            "partial" => Some(Participation::Partial),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Participation::Total => "total",
            Participation::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    pub entities: Vec<String>,
    #[serde(rename = "type")]
    pub relation_type: RelationType,
    /// Free text describing the relation, as extracted from the source
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub entity_cardinalities: BTreeMap<String, Cardinality>,
    #[serde(default)]
    pub entity_participations: BTreeMap<String, Participation>,
}

impl Relation {
    pub fn new(id: impl Into<String>, entities: Vec<String>, relation_type: RelationType) -> Self {
        Self {
            id: id.into(),
            entities,
            relation_type,
            description: String::new(),
            entity_cardinalities: BTreeMap::new(),
            entity_participations: BTreeMap::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// A relation needs at least two distinct entities
    pub fn validate_structure(&self) -> Result<()> {
        let distinct: BTreeSet<&str> = self.entities.iter().map(|e| e.as_str()).collect();
        if self.entities.len() < 2 || distinct.len() != self.entities.len() {
            return Err(SchemaError::Structural(format!(
                "Relation '{}' must list at least two distinct entities, got [{}]",
                self.id,
                self.entities.join(", ")
            )));
        }
        Ok(())
    }

    /// Every listed entity has exactly one cardinality and one participation
    pub fn is_complete(&self) -> bool {
        self.entity_cardinalities.len() == self.entities.len()
            && self.entity_participations.len() == self.entities.len()
            && self.entities.iter().all(|e| {
                self.entity_cardinalities.contains_key(e) && self.entity_participations.contains_key(e)
            })
    }

    pub fn cardinality_of(&self, entity: &str) -> Option<Cardinality> {
        self.entity_cardinalities.get(entity).copied()
    }
}

/// Formula declaration for a derived attribute
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DerivedFormula {
    pub attribute: AttributeKey,
    /// Expression text, e.g. `quantity * unit_price`
    pub expression: String,
    pub operands: Vec<AttributeKey>,
}

impl DerivedFormula {
    pub fn new(attribute: AttributeKey, expression: impl Into<String>, operands: Vec<AttributeKey>) -> Self {
        Self {
            attribute,
            expression: expression.into(),
            operands,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attribute_key_round_trips_through_string() {
        let key = AttributeKey::new("Order", "customer_id");
        let json = serde_json::to_string(&key).unwrap();
        assert_eq!(json, "\"Order.customer_id\"");
        let back: AttributeKey = serde_json::from_str(&json).unwrap();
        assert_eq!(back, key);
        assert!(AttributeKey::parse("no_dot").is_err());
    }

    #[test]
    fn test_foreign_key_arity() {
        let fk = ForeignKey {
            from_entity: "Order".to_string(),
            from_attributes: vec!["a".to_string(), "b".to_string()],
            to_entity: "Customer".to_string(),
            to_attributes: vec!["a".to_string()],
        };
        assert!(fk.validate().is_err());
        assert!(ForeignKey::new("Order", "customer_id", "Customer", "customer_id").validate().is_ok());
    }

    #[test]
    fn test_relation_type_parsing() {
        let rel: Relation = serde_json::from_str(
            r#"{"id":"r1","entities":["A","B"],"type":"something-else"}"#,
        )
        .unwrap();
        assert_eq!(rel.relation_type, RelationType::Unknown);
        assert_eq!(RelationType::parse_loose("Many To Many"), RelationType::ManyToMany);

        let rel: Relation = serde_json::from_str(r#"{"id":"r2","entities":["A","B"],"type":"1:N"}"#).unwrap();
        assert_eq!(rel.relation_type, RelationType::OneToMany);
        assert_eq!(serde_json::to_value(rel.relation_type).unwrap(), "one-to-many");
    }

    #[test]
    fn test_relation_structure() {
        let rel = Relation::new("r1", vec!["A".to_string(), "A".to_string()], RelationType::OneToOne);
        assert!(rel.validate_structure().is_err());
        let rel = Relation::new("r2", vec!["A".to_string()], RelationType::OneToOne);
        assert!(rel.validate_structure().is_err());
    }

    #[test]
    fn test_cardinality_serializes_as_symbols() {
        assert_eq!(serde_json::to_string(&Cardinality::Many).unwrap(), "\"N\"");
        assert_eq!(serde_json::to_string(&Cardinality::One).unwrap(), "\"1\"");
    }
}
