//! Field metadata, comparison keys, and the predicate contract that guides
//! skip-list descent and filtering (spec §4.5.4, §9 "Predicate").
//!
//! A [`Predicate`] is `value -> {seek, match}`: `seek` tells the skip-list
//! search which direction to continue in, `match` tells the caller whether
//! a given entry belongs in the result set. [`RangePredicate`] is the one
//! concrete implementation this crate needs — every comparison operator
//! the CLI exposes (`=`, `<`, `>`, `<=`, `>=`) reduces to a lower and/or
//! upper bound.

use std::cmp::Ordering;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// A field's declared storage type, carried in its header metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldType {
    DateTime,
}

/// Metadata stored in a field-header entry's node value (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldMetadata {
    pub name: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub kind: Option<FieldType>,
    pub tx: u8,
}

impl FieldMetadata {
    pub fn new(name: impl Into<String>, kind: Option<FieldType>) -> Self {
        Self { name: name.into(), kind, tx: 0 }
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string(self)
            .map_err(|source| Error::invalid_format("<field metadata>", source.to_string()))
    }

    pub fn from_json_string(s: &str) -> Result<Self> {
        serde_json::from_str(s)
            .map_err(|source| Error::invalid_format("<field metadata>", source.to_string()))
    }

    pub fn in_transaction(&self) -> bool {
        self.tx != 0
    }
}

/// The value stored on a skip-list node, faithful to the original JSON
/// field value (spec §3 `SkipListNode.value`).
#[derive(Debug, Clone, PartialEq)]
pub enum NodeValue {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl NodeValue {
    /// Converts a record's field value to a node value. Arrays and objects
    /// cannot be indexed (spec's data model only names null/bool/number/
    /// string as node values).
    pub fn from_json(value: &Value) -> Result<Self> {
        match value {
            Value::Null => Ok(NodeValue::Null),
            Value::Bool(b) => Ok(NodeValue::Bool(*b)),
            Value::Number(n) => n
                .as_f64()
                .map(NodeValue::Number)
                .ok_or_else(|| Error::invalid_format("<record>", "number is not representable as f64")),
            Value::String(s) => Ok(NodeValue::String(s.clone())),
            Value::Array(_) | Value::Object(_) => Err(Error::invalid_format(
                "<record>",
                "array and object field values cannot be indexed",
            )),
        }
    }

    pub fn type_tag(&self) -> u32 {
        match self {
            NodeValue::Null => 0,
            NodeValue::Bool(_) => 1,
            NodeValue::Number(_) => 2,
            NodeValue::String(_) => 3,
        }
    }
}

/// Returns `true` for JSON values that can be indexed at all (spec §4.6
/// step 1: only scalar field values are collected into insert batches).
pub fn is_indexable(value: &Value) -> bool {
    !matches!(value, Value::Array(_) | Value::Object(_))
}

/// The comparison key used to order a field's skip list. Identical to the
/// node value except for `date-time` fields, where it is the parsed
/// timestamp (spec §4.5.4: "`k` is identity by default, `Date.parse`-
/// equivalent when `type == "date-time"`").
#[derive(Debug, Clone, PartialEq)]
pub enum Key {
    Null,
    Bool(bool),
    Number(f64),
    String(String),
}

impl Key {
    pub fn of(value: &NodeValue, field_type: Option<FieldType>) -> Result<Key> {
        match (value, field_type) {
            (NodeValue::String(s), Some(FieldType::DateTime)) => Ok(Key::Number(parse_date(s)?)),
            (NodeValue::Null, _) => Ok(Key::Null),
            (NodeValue::Bool(b), _) => Ok(Key::Bool(*b)),
            (NodeValue::Number(n), _) => Ok(Key::Number(*n)),
            (NodeValue::String(s), _) => Ok(Key::String(s.clone())),
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Key::Null => 0,
            Key::Bool(_) => 1,
            Key::Number(_) => 2,
            Key::String(_) => 3,
        }
    }

    /// Total order over keys. Values of the same variant compare
    /// naturally; values of different variants (a mixed-type field, which
    /// the data model permits but doesn't expect) fall back to a stable
    /// ordering by type tag so the skip list stays well-ordered.
    pub fn cmp(&self, other: &Key) -> Ordering {
        match (self, other) {
            (Key::Null, Key::Null) => Ordering::Equal,
            (Key::Bool(a), Key::Bool(b)) => a.cmp(b),
            (Key::Number(a), Key::Number(b)) => a.partial_cmp(b).unwrap_or(Ordering::Equal),
            (Key::String(a), Key::String(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

/// Parses an RFC 3339 / ISO 8601 timestamp (or bare date) into milliseconds
/// since the Unix epoch, the `date-time` field type's comparison key.
pub fn parse_date(s: &str) -> Result<f64> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.timestamp_millis() as f64);
    }
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let dt = date
            .and_hms_opt(0, 0, 0)
            .expect("midnight is always a valid time");
        return Ok(dt.and_utc().timestamp_millis() as f64);
    }
    Err(Error::invalid_format(
        "<date-time field>",
        format!("{s:?} is not a recognized date-time value"),
    ))
}

/// One comparison clause parsed from a query string, e.g. `age >= 18`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
}

#[derive(Debug, Clone)]
pub struct Comparison {
    pub op: Op,
    pub key: Key,
}

/// A predicate reduced to (at most) one lower and one upper bound, the
/// only shape spec §4.5.4/§8 requires: equality and the four inequality
/// operators, optionally combined into a range on the same field.
#[derive(Debug, Clone, Default)]
pub struct RangePredicate {
    pub lower: Option<(Key, bool)>,
    pub upper: Option<(Key, bool)>,
}

impl RangePredicate {
    /// Skip-list descent guidance: negative to keep advancing right,
    /// positive once the entry is past the range (search should stop).
    pub fn seek(&self, key: &Key) -> i8 {
        if let Some((lo, inclusive)) = &self.lower {
            let ord = key.cmp(lo);
            if ord == Ordering::Less || (ord == Ordering::Equal && !inclusive) {
                return -1;
            }
        }
        if let Some((hi, inclusive)) = &self.upper {
            let ord = key.cmp(hi);
            if ord == Ordering::Greater || (ord == Ordering::Equal && !inclusive) {
                return 1;
            }
        }
        0
    }

    pub fn matches(&self, key: &Key) -> bool {
        self.seek(key) == 0
    }
}

/// Folds a conjunction of comparisons on a single field into one range
/// (spec §8 literal scenario: `age >= 18 < 35`). Later clauses tighten the
/// bound rather than replacing it.
pub fn build_predicate(comparisons: &[Comparison]) -> Result<RangePredicate> {
    let mut predicate = RangePredicate::default();
    for comparison in comparisons {
        match comparison.op {
            Op::Eq => {
                predicate.lower = Some((comparison.key.clone(), true));
                predicate.upper = Some((comparison.key.clone(), true));
            }
            Op::Lt => tighten_upper(&mut predicate.upper, comparison.key.clone(), false),
            Op::Le => tighten_upper(&mut predicate.upper, comparison.key.clone(), true),
            Op::Gt => tighten_lower(&mut predicate.lower, comparison.key.clone(), false),
            Op::Ge => tighten_lower(&mut predicate.lower, comparison.key.clone(), true),
        }
    }
    Ok(predicate)
}

fn tighten_upper(slot: &mut Option<(Key, bool)>, key: Key, inclusive: bool) {
    let tighter = match slot {
        Some((existing, existing_inclusive)) => {
            match key.cmp(existing) {
                Ordering::Less => true,
                Ordering::Equal => !inclusive && *existing_inclusive,
                Ordering::Greater => false,
            }
        }
        None => true,
    };
    if tighter {
        *slot = Some((key, inclusive));
    }
}

fn tighten_lower(slot: &mut Option<(Key, bool)>, key: Key, inclusive: bool) {
    let tighter = match slot {
        Some((existing, existing_inclusive)) => {
            match key.cmp(existing) {
                Ordering::Greater => true,
                Ordering::Equal => !inclusive && *existing_inclusive,
                Ordering::Less => false,
            }
        }
        None => true,
    };
    if tighter {
        *slot = Some((key, inclusive));
    }
}
