//! SQL Type Assignments
//!
//! The primitive type vocabulary, parsing of loosely written type strings and
//! the deterministic name/hint heuristic used whenever the oracle's type
//! inference is unavailable.

use crate::grounding::split_words;
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

lazy_static! {
    static ref SQL_TYPE: Regex =
        Regex::new(r"^\s*([A-Za-z][A-Za-z0-9 ]*?)\s*(?:\(\s*(\d+)\s*(?:,\s*(\d+)\s*)?\))?\s*$").unwrap();
}

pub const MAX_DECIMAL_PRECISION: u32 = 38;
pub const DEFAULT_VARCHAR_SIZE: u32 = 255;
pub const MAX_VARCHAR_SIZE: u32 = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum DataType {
    SmallInt,
    Int,
    BigInt,
    Decimal,
    Double,
    Boolean,
    Date,
    Timestamp,
    Varchar,
    Text,
}

impl DataType {
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_lowercase();
        let data_type = match normalized.as_str() {
            "smallint" | "tinyint" | "int2" => DataType::SmallInt,
            "int" | "integer" | "int4" | "mediumint" => DataType::Int,
            "bigint" | "int8" | "long" => DataType::BigInt,
            "decimal" | "numeric" | "number" | "money" => DataType::Decimal,
            "double" | "double precision" | "float" | "float8" | "real" => DataType::Double,
            "bool" | "boolean" => DataType::Boolean,
            "date" => DataType::Date,
            "timestamp" | "datetime" | "timestamptz" => DataType::Timestamp,
            "varchar" | "character varying" | "char" | "character" | "string" | "nvarchar" => DataType::Varchar,
            "text" | "clob" => DataType::Text,
            _ => return None,
        };
        Some(data_type)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DataType::SmallInt => "SMALLINT",
            DataType::Int => "INT",
            DataType::BigInt => "BIGINT",
            DataType::Decimal => "DECIMAL",
            DataType::Double => "DOUBLE",
            DataType::Boolean => "BOOLEAN",
            DataType::Date => "DATE",
            DataType::Timestamp => "TIMESTAMP",
            DataType::Varchar => "VARCHAR",
            DataType::Text => "TEXT",
        }
    }

    pub fn is_integer(&self) -> bool {
        matches!(self, DataType::SmallInt | DataType::Int | DataType::BigInt)
    }

    pub fn is_temporal(&self) -> bool {
        matches!(self, DataType::Date | DataType::Timestamp)
    }

    /// Decimal digits needed to hold any value of an integer type
    pub fn integer_digits(&self) -> Option<u32> {
        match self {
            DataType::SmallInt => Some(5),
            DataType::Int => Some(10),
            DataType::BigInt => Some(19),
            _ => None,
        }
    }
}

/// How a type assignment was reached
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TypeSource {
    /// Proposed by the oracle and validated
    Oracle,
    /// Deterministic name/hint heuristic
    Fallback,
    /// Copied from the referenced primary key
    ForeignKey,
    /// Inferred from a derivation formula
    Formula,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TypeAssignment {
    #[serde(rename = "type")]
    pub data_type: DataType,
    pub size: Option<u32>,
    pub precision: Option<u32>,
    pub scale: Option<u32>,
    pub reasoning: String,
    pub source: TypeSource,
}

impl TypeAssignment {
    pub fn new(data_type: DataType, source: TypeSource, reasoning: impl Into<String>) -> Self {
        let mut assignment = Self {
            data_type,
            size: None,
            precision: None,
            scale: None,
            reasoning: reasoning.into(),
            source,
        };
        match data_type {
            DataType::Varchar => assignment.size = Some(DEFAULT_VARCHAR_SIZE),
            DataType::Decimal => {
                assignment.precision = Some(18);
                assignment.scale = Some(2);
            }
            _ => {}
        }
        assignment
    }

    pub fn decimal(precision: u32, scale: u32, source: TypeSource, reasoning: impl Into<String>) -> Self {
        Self {
            data_type: DataType::Decimal,
            size: None,
            precision: Some(precision.min(MAX_DECIMAL_PRECISION)),
            scale: Some(scale.min(precision.min(MAX_DECIMAL_PRECISION))),
            reasoning: reasoning.into(),
            source,
        }
    }

    pub fn varchar(size: u32, source: TypeSource, reasoning: impl Into<String>) -> Self {
        Self {
            data_type: DataType::Varchar,
            size: Some(size.clamp(1, MAX_VARCHAR_SIZE)),
            precision: None,
            scale: None,
            reasoning: reasoning.into(),
            source,
        }
    }

    /// Build an assignment from oracle-supplied parts, rejecting inconsistent ones.
    ///
    /// `raw_type` may carry its own parameters (`DECIMAL(10,2)`); explicit
    /// fields win over embedded ones.
    pub fn from_parts(
        raw_type: &str,
        size: Option<u32>,
        precision: Option<u32>,
        scale: Option<u32>,
        source: TypeSource,
        reasoning: impl Into<String>,
    ) -> std::result::Result<Self, String> {
        let parsed = parse_sql_type(raw_type)
            .ok_or_else(|| format!("unknown data type '{}'", raw_type))?;

        let mut assignment = match parsed.data_type {
            DataType::Varchar => {
                let size = size.or(parsed.first_param).unwrap_or(DEFAULT_VARCHAR_SIZE);
                if size == 0 || size > MAX_VARCHAR_SIZE {
                    return Err(format!("VARCHAR size {} is outside 1..={}", size, MAX_VARCHAR_SIZE));
                }
                TypeAssignment::varchar(size, source, String::new())
            }
            DataType::Decimal => {
                let precision = precision
                    .or(parsed.first_param)
                    .ok_or_else(|| "DECIMAL requires a precision".to_string())?;
                let scale = scale.or(parsed.second_param).unwrap_or(0);
                if precision == 0 || precision > MAX_DECIMAL_PRECISION {
                    return Err(format!(
                        "DECIMAL precision {} is outside 1..={}",
                        precision, MAX_DECIMAL_PRECISION
                    ));
                }
                if scale > precision {
                    return Err(format!(
                        "DECIMAL scale {} exceeds precision {}",
                        scale, precision
                    ));
                }
                TypeAssignment::decimal(precision, scale, source, String::new())
            }
            other => TypeAssignment::new(other, source, String::new()),
        };
        assignment.reasoning = reasoning.into();
        Ok(assignment)
    }

    /// Same type, size, precision and scale
    pub fn same_type_as(&self, other: &TypeAssignment) -> bool {
        self.data_type == other.data_type
            && self.size == other.size
            && self.precision == other.precision
            && self.scale == other.scale
    }

    /// Copy of this type with a different source and reasoning
    pub fn retyped(&self, source: TypeSource, reasoning: impl Into<String>) -> Self {
        Self {
            data_type: self.data_type,
            size: self.size,
            precision: self.precision,
            scale: self.scale,
            reasoning: reasoning.into(),
            source,
        }
    }

    /// SQL rendering, e.g. `DECIMAL(12,2)` or `VARCHAR(255)`
    pub fn sql(&self) -> String {
        match (self.data_type, self.size, self.precision, self.scale) {
            (DataType::Varchar, Some(size), _, _) => format!("VARCHAR({})", size),
            (DataType::Decimal, _, Some(p), Some(s)) => format!("DECIMAL({},{})", p, s),
            (DataType::Decimal, _, Some(p), None) => format!("DECIMAL({})", p),
            (data_type, _, _, _) => data_type.as_str().to_string(),
        }
    }
}

impl fmt::Display for TypeAssignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.sql())
    }
}

/// A parsed `NAME(p[, s])` type string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParsedSqlType {
    pub data_type: DataType,
    pub first_param: Option<u32>,
    pub second_param: Option<u32>,
}

pub fn parse_sql_type(raw: &str) -> Option<ParsedSqlType> {
    let captures = SQL_TYPE.captures(raw)?;
    let data_type = DataType::parse(captures.get(1)?.as_str())?;
    let param = |i: usize| captures.get(i).and_then(|m| m.as_str().parse::<u32>().ok());
    Some(ParsedSqlType {
        data_type,
        first_param: param(2),
        second_param: param(3),
    })
}

const AMOUNT_WORDS: &[&str] = &[
    "price", "amount", "cost", "total", "balance", "fee", "salary", "revenue", "tax", "subtotal", "payment",
    "wage", "budget", "income",
];
const PERCENT_WORDS: &[&str] = &["percent", "percentage", "pct", "ratio", "rate"];
const COUNT_WORDS: &[&str] = &["count", "quantity", "qty"];
const LONG_TEXT_WORDS: &[&str] = &["description", "notes", "comment", "comments", "bio", "body"];

/// Deterministic type inference from an attribute's name and optional hint.
///
/// A parseable hint wins, then keyword hints, then name patterns. Default is
/// `VARCHAR(255)`.
pub fn infer_from_name(name: &str, type_hint: Option<&str>) -> TypeAssignment {
    if let Some(hint) = type_hint.map(str::trim).filter(|h| !h.is_empty()) {
        if let Some(assignment) = infer_from_hint(hint) {
            return assignment;
        }
    }

    let words = split_words(name);
    let first = words.first().map(String::as_str).unwrap_or("");
    let last = words.last().map(String::as_str).unwrap_or("");
    let has_word = |set: &[&str]| words.iter().any(|w| set.contains(&w.as_str()));
    let fallback = |data_type: DataType, why: &str| TypeAssignment::new(data_type, TypeSource::Fallback, why);

    if matches!(first, "is" | "has" | "can") && words.len() > 1 {
        return fallback(DataType::Boolean, "boolean prefix in attribute name");
    }
    if last == "id" {
        return fallback(DataType::BigInt, "identifier suffix in attribute name");
    }
    if last == "date" || last == "dob" {
        return fallback(DataType::Date, "date suffix in attribute name");
    }
    if matches!(last, "at" | "time" | "timestamp") && words.len() > 1 || name.eq_ignore_ascii_case("timestamp") {
        return fallback(DataType::Timestamp, "timestamp suffix in attribute name");
    }
    if has_word(PERCENT_WORDS) {
        return TypeAssignment::decimal(6, 4, TypeSource::Fallback, "percentage-like attribute name");
    }
    if has_word(COUNT_WORDS) || (first == "num" && words.len() > 1) {
        return fallback(DataType::Int, "count-like attribute name");
    }
    if has_word(AMOUNT_WORDS) {
        return TypeAssignment::decimal(12, 2, TypeSource::Fallback, "monetary attribute name");
    }
    if has_word(LONG_TEXT_WORDS) {
        return fallback(DataType::Text, "free-text attribute name");
    }
    TypeAssignment::varchar(DEFAULT_VARCHAR_SIZE, TypeSource::Fallback, "no type signal in name; default string")
}

fn infer_from_hint(hint: &str) -> Option<TypeAssignment> {
    if let Ok(assignment) = TypeAssignment::from_parts(
        hint,
        None,
        None,
        None,
        TypeSource::Fallback,
        format!("type hint '{}'", hint),
    ) {
        return Some(assignment);
    }

    let lowered = hint.to_lowercase();
    let reasoning = format!("keyword in type hint '{}'", hint);
    let contains = |needles: &[&str]| needles.iter().any(|n| lowered.contains(n));
    let assignment = if contains(&["money", "currency", "monetary"]) {
        TypeAssignment::decimal(12, 2, TypeSource::Fallback, reasoning)
    } else if contains(&["percent", "ratio"]) {
        TypeAssignment::decimal(6, 4, TypeSource::Fallback, reasoning)
    } else if contains(&["bool", "flag", "yes/no"]) {
        TypeAssignment::new(DataType::Boolean, TypeSource::Fallback, reasoning)
    } else if contains(&["datetime", "timestamp", "time"]) {
        TypeAssignment::new(DataType::Timestamp, TypeSource::Fallback, reasoning)
    } else if contains(&["date"]) {
        TypeAssignment::new(DataType::Date, TypeSource::Fallback, reasoning)
    } else if contains(&["float", "double", "real"]) {
        TypeAssignment::new(DataType::Double, TypeSource::Fallback, reasoning)
    } else if contains(&["int", "number", "count"]) {
        TypeAssignment::new(DataType::Int, TypeSource::Fallback, reasoning)
    } else if contains(&["text", "string"]) {
        TypeAssignment::varchar(DEFAULT_VARCHAR_SIZE, TypeSource::Fallback, reasoning)
    } else {
        return None;
    };
    Some(assignment)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_sql_type() {
        let parsed = parse_sql_type("DECIMAL(10, 2)").unwrap();
        assert_eq!(parsed.data_type, DataType::Decimal);
        assert_eq!(parsed.first_param, Some(10));
        assert_eq!(parsed.second_param, Some(2));
        assert_eq!(parse_sql_type("double precision").unwrap().data_type, DataType::Double);
        assert!(parse_sql_type("geometry").is_none());
    }

    #[test]
    fn test_from_parts_validation() {
        assert!(TypeAssignment::from_parts("DECIMAL", None, None, None, TypeSource::Oracle, "").is_err());
        assert!(TypeAssignment::from_parts("DECIMAL", None, Some(4), Some(6), TypeSource::Oracle, "").is_err());
        assert!(TypeAssignment::from_parts("VARCHAR", Some(0), None, None, TypeSource::Oracle, "").is_err());

        let a = TypeAssignment::from_parts("numeric(10,2)", None, None, None, TypeSource::Oracle, "").unwrap();
        assert_eq!(a.sql(), "DECIMAL(10,2)");
        let b = TypeAssignment::from_parts("string", None, None, None, TypeSource::Oracle, "").unwrap();
        assert_eq!(b.sql(), "VARCHAR(255)");
    }

    #[test]
    fn test_name_heuristic() {
        assert_eq!(infer_from_name("customer_id", None).data_type, DataType::BigInt);
        assert_eq!(infer_from_name("id", None).data_type, DataType::BigInt);
        assert_eq!(infer_from_name("is_active", None).data_type, DataType::Boolean);
        assert_eq!(infer_from_name("hasShipped", None).data_type, DataType::Boolean);
        assert_eq!(infer_from_name("order_date", None).data_type, DataType::Date);
        assert_eq!(infer_from_name("created_at", None).data_type, DataType::Timestamp);
        assert_eq!(infer_from_name("unit_price", None).sql(), "DECIMAL(12,2)");
        assert_eq!(infer_from_name("discount_percentage", None).sql(), "DECIMAL(6,4)");
        assert_eq!(infer_from_name("item_count", None).data_type, DataType::Int);
        assert_eq!(infer_from_name("nickname", None).sql(), "VARCHAR(255)");
    }

    #[test]
    fn test_hint_overrides_name() {
        assert_eq!(infer_from_name("customer_id", Some("uuid string")).sql(), "VARCHAR(255)");
        assert_eq!(infer_from_name("code", Some("CHAR(3)")).sql(), "VARCHAR(3)");
        assert_eq!(infer_from_name("weight", Some("float")).data_type, DataType::Double);
        assert_eq!(infer_from_name("charge", Some("money")).sql(), "DECIMAL(12,2)");
        // unusable hint falls through to the name
        assert_eq!(infer_from_name("is_open", Some("??")).data_type, DataType::Boolean);
    }

    #[test]
    fn test_heuristic_is_deterministic() {
        for name in ["price", "customer_id", "notes", "signup_date", "x"] {
            assert_eq!(infer_from_name(name, None), infer_from_name(name, None));
        }
    }

    #[test]
    fn test_same_type_ignores_reasoning() {
        let a = TypeAssignment::new(DataType::BigInt, TypeSource::Oracle, "pk");
        let b = a.retyped(TypeSource::ForeignKey, "copied");
        assert!(a.same_type_as(&b));
        assert_ne!(a, b);
    }
}
