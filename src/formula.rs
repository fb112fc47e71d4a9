//! Formula Typing
//!
//! Classifies a derived attribute's expression by operator class and computes
//! the result type from the operand types.

use crate::types::{DataType, TypeAssignment, TypeSource, DEFAULT_VARCHAR_SIZE, MAX_DECIMAL_PRECISION, MAX_VARCHAR_SIZE};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};

lazy_static! {
    static ref COMPARISON: Regex = Regex::new(r"(>=|<=|<>|!=|==|=|>|<)").unwrap();
    static ref BOOLEAN_KEYWORD: Regex =
        Regex::new(r"(?i)\b(and|or|not|is\s+null|is\s+not\s+null|in|between|like|true|false)\b").unwrap();
    static ref DATE_DIFF: Regex = Regex::new(
        r"(?i)\b(datediff|date_diff|days_between|julianday|age|timestampdiff|months_between)\s*\("
    )
    .unwrap();
    static ref DATE_ARITH: Regex =
        Regex::new(r"(?i)\b(date_add|dateadd|date_sub|add_months|interval)\b").unwrap();
    static ref CONCAT: Regex = Regex::new(r"(?i)(\|\||\bconcat(_ws)?\s*\()").unwrap();
    static ref AGGREGATE: Regex = Regex::new(r"(?i)^\s*(count|sum|avg|min|max)\s*\(").unwrap();
    static ref STRING_LITERAL: Regex = Regex::new(r"'[^']*'").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArithmeticOp {
    Additive,
    Multiplicative,
    Divisive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregate {
    Count,
    Sum,
    Avg,
    MinMax,
}

/// Operator class of a derivation expression
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "class", content = "op", rename_all = "snake_case")]
pub enum FormulaClass {
    Comparison,
    DateDifference,
    DateArithmetic,
    Concatenation,
    Aggregate(Aggregate),
    Arithmetic(ArithmeticOp),
    Opaque,
}

/// Classify an expression; string literals are ignored
pub fn classify(expression: &str) -> FormulaClass {
    let expr = STRING_LITERAL.replace_all(expression, "''");
    let expr = expr.trim();

    if let Some(captures) = AGGREGATE.captures(expr) {
        let function = captures[1].to_lowercase();
        return FormulaClass::Aggregate(match function.as_str() {
            "count" => Aggregate::Count,
            "sum" => Aggregate::Sum,
            "avg" => Aggregate::Avg,
            _ => Aggregate::MinMax,
        });
    }
    if DATE_DIFF.is_match(expr) {
        return FormulaClass::DateDifference;
    }
    if DATE_ARITH.is_match(expr) {
        return FormulaClass::DateArithmetic;
    }
    if CONCAT.is_match(expr) {
        return FormulaClass::Concatenation;
    }
    if COMPARISON.is_match(expr) || BOOLEAN_KEYWORD.is_match(expr) {
        return FormulaClass::Comparison;
    }
    if expr.contains('/') {
        return FormulaClass::Arithmetic(ArithmeticOp::Divisive);
    }
    if expr.contains('*') {
        return FormulaClass::Arithmetic(ArithmeticOp::Multiplicative);
    }
    if expr.contains('+') || expr.contains('-') {
        return FormulaClass::Arithmetic(ArithmeticOp::Additive);
    }
    FormulaClass::Opaque
}

/// Result type of `expression` given its operand types.
///
/// `None` when the class needs operand types that are missing or unusable;
/// callers then fall back to the name heuristic.
pub fn infer_formula_type(expression: &str, operands: &[&TypeAssignment]) -> Option<TypeAssignment> {
    let class = classify(expression);
    let formula = |data_type: DataType, why: &str| TypeAssignment::new(data_type, TypeSource::Formula, why);

    match class {
        FormulaClass::Comparison => Some(formula(DataType::Boolean, "comparison/boolean formula")),
        FormulaClass::DateDifference => Some(formula(DataType::Int, "date difference formula")),
        FormulaClass::DateArithmetic => {
            let data_type = if operands.iter().any(|o| o.data_type == DataType::Timestamp) {
                DataType::Timestamp
            } else {
                DataType::Date
            };
            Some(formula(data_type, "date arithmetic formula"))
        }
        FormulaClass::Concatenation => concatenation_type(operands),
        FormulaClass::Aggregate(Aggregate::Count) => Some(formula(DataType::BigInt, "count aggregate")),
        FormulaClass::Aggregate(Aggregate::Sum) => arithmetic_type(ArithmeticOp::Additive, operands),
        FormulaClass::Aggregate(Aggregate::Avg) => average_type(operands),
        FormulaClass::Aggregate(Aggregate::MinMax) => widest_copy(operands, "min/max aggregate of operand"),
        FormulaClass::Arithmetic(op) => {
            if operands.len() >= 2 && operands.iter().all(|o| o.data_type.is_temporal()) && op == ArithmeticOp::Additive {
                return Some(formula(DataType::Int, "difference of temporal operands"));
            }
            if operands.iter().any(|o| o.data_type.is_temporal()) && op == ArithmeticOp::Additive {
                return infer_formula_type("date_add()", operands);
            }
            arithmetic_type(op, operands)
        }
        FormulaClass::Opaque => match operands {
            [single] => Some(single.retyped(TypeSource::Formula, "single-operand formula keeps operand type")),
            _ => None,
        },
    }
}

fn arithmetic_type(op: ArithmeticOp, operands: &[&TypeAssignment]) -> Option<TypeAssignment> {
    if operands.is_empty() {
        return None;
    }
    if !operands
        .iter()
        .all(|o| o.data_type.is_integer() || matches!(o.data_type, DataType::Decimal | DataType::Double))
    {
        return None;
    }

    if operands.iter().any(|o| o.data_type == DataType::Double) {
        return Some(TypeAssignment::new(
            DataType::Double,
            TypeSource::Formula,
            "arithmetic with a floating operand",
        ));
    }

    let decimals: Vec<(u32, u32)> = operands
        .iter()
        .filter(|o| o.data_type == DataType::Decimal)
        .map(|o| (o.precision.unwrap_or(18), o.scale.unwrap_or(0)))
        .collect();

    if decimals.is_empty() {
        return Some(TypeAssignment::new(
            DataType::BigInt,
            TypeSource::Formula,
            "all-integer arithmetic",
        ));
    }

    let max_scale = decimals.iter().map(|(_, s)| *s).max().unwrap_or(0);
    let max_precision = decimals.iter().map(|(p, _)| *p).max().unwrap_or(18);

    let (precision, scale, why) = match op {
        ArithmeticOp::Multiplicative => {
            let digits: u32 = operands
                .iter()
                .map(|o| match o.data_type {
                    DataType::Decimal => o.precision.unwrap_or(18),
                    other => other.integer_digits().unwrap_or(19),
                })
                .sum();
            (digits, max_scale, "decimal multiplication widens precision")
        }
        ArithmeticOp::Additive => (max_precision, max_scale, "decimal addition preserves precision"),
        ArithmeticOp::Divisive => (max_precision + 6, max_scale.max(4), "decimal division widens precision and scale"),
    };
    let precision = precision.clamp(max_scale.max(1), MAX_DECIMAL_PRECISION);
    Some(TypeAssignment::decimal(precision, scale, TypeSource::Formula, why))
}

fn average_type(operands: &[&TypeAssignment]) -> Option<TypeAssignment> {
    let operand = operands.first()?;
    match operand.data_type {
        DataType::Double => Some(operand.retyped(TypeSource::Formula, "average of floating operand")),
        DataType::Decimal => {
            let precision = operand.precision.unwrap_or(18) + 4;
            let scale = operand.scale.unwrap_or(0).max(4);
            Some(TypeAssignment::decimal(precision, scale, TypeSource::Formula, "average of decimal operand"))
        }
        t if t.is_integer() => Some(TypeAssignment::decimal(
            t.integer_digits().unwrap_or(19) + 4,
            4,
            TypeSource::Formula,
            "average of integer operand",
        )),
        _ => None,
    }
}

fn widest_copy(operands: &[&TypeAssignment], why: &str) -> Option<TypeAssignment> {
    operands
        .iter()
        .max_by_key(|o| (o.size.unwrap_or(0), o.precision.unwrap_or(0)))
        .map(|o| o.retyped(TypeSource::Formula, why))
}

fn concatenation_type(operands: &[&TypeAssignment]) -> Option<TypeAssignment> {
    if operands.is_empty() {
        return None;
    }
    if operands.iter().any(|o| o.data_type == DataType::Text) {
        return Some(TypeAssignment::new(
            DataType::Text,
            TypeSource::Formula,
            "concatenation with an unbounded text operand",
        ));
    }
    let widest = operands.iter().map(|o| display_width(o)).max().unwrap_or(DEFAULT_VARCHAR_SIZE);
    Some(TypeAssignment::varchar(
        widest.min(MAX_VARCHAR_SIZE),
        TypeSource::Formula,
        "concatenation sized to widest operand",
    ))
}

/// Characters needed to render a value of this type as text
fn display_width(assignment: &TypeAssignment) -> u32 {
    match assignment.data_type {
        DataType::Varchar => assignment.size.unwrap_or(DEFAULT_VARCHAR_SIZE),
        DataType::Decimal => assignment.precision.unwrap_or(18) + 2,
        DataType::Double => 24,
        DataType::Boolean => 5,
        DataType::Date => 10,
        DataType::Timestamp => 26,
        DataType::Text => MAX_VARCHAR_SIZE,
        other => other.integer_digits().unwrap_or(19) + 1,
    }
}
