//! Parses `--query` strings of the form `field<op>value[,field<op>value...]`
//! into the engine's comparison types. This is the "small query-predicate
//! helper" that sits outside the storage engine: it knows nothing about
//! skip lists or files, only how to turn CLI text into a [`FieldQuery`]
//! list.

use std::collections::{BTreeMap, HashMap};

use anyhow::bail;
use jify_engine::database::FieldQuery;
use jify_engine::predicate::NodeValue;
use jify_engine::{build_predicate, Comparison, FieldType, Key, Op};

struct RawClause {
    field: String,
    op: Op,
    value: NodeValue,
}

/// Parses one `--query` argument into a conjunction of [`FieldQuery`]
/// clauses, grouping repeated comparisons on the same field (e.g.
/// `age>=18,age<35`) into a single range predicate. `field_kinds` supplies
/// each field's declared storage type, looked up from the index so
/// `date-time` values compare correctly.
pub fn parse_query(input: &str, field_kinds: &HashMap<String, FieldType>) -> anyhow::Result<Vec<FieldQuery>> {
    let mut by_field: BTreeMap<String, Vec<Comparison>> = BTreeMap::new();
    let mut order = Vec::new();

    for clause in input.split(',') {
        let clause = clause.trim();
        if clause.is_empty() {
            continue;
        }
        let raw = parse_clause(clause)?;
        let kind = field_kinds.get(&raw.field).copied();
        let key = Key::of(&raw.value, kind)?;
        if !by_field.contains_key(&raw.field) {
            order.push(raw.field.clone());
        }
        by_field.entry(raw.field).or_default().push(Comparison { op: raw.op, key });
    }

    order
        .into_iter()
        .map(|field| {
            let comparisons = by_field.remove(&field).expect("field was just inserted into both maps");
            let kind = field_kinds.get(&field).copied();
            let predicate = build_predicate(&comparisons)?;
            Ok(FieldQuery { field, kind, predicate })
        })
        .collect()
}

/// Splits `field<op>value` at the first comparison operator, preferring
/// the two-character forms `<=`/`>=` over their single-character prefixes.
fn parse_clause(clause: &str) -> anyhow::Result<RawClause> {
    let bytes = clause.as_bytes();
    for (i, &byte) in bytes.iter().enumerate() {
        if !matches!(byte, b'=' | b'<' | b'>') {
            continue;
        }
        let two_char = byte != b'=' && bytes.get(i + 1) == Some(&b'=');
        let (op, op_len) = match (byte, two_char) {
            (b'=', _) => (Op::Eq, 1),
            (b'<', true) => (Op::Le, 2),
            (b'<', false) => (Op::Lt, 1),
            (b'>', true) => (Op::Ge, 2),
            (b'>', false) => (Op::Gt, 1),
            _ => unreachable!("byte matched the outer guard"),
        };
        let field = clause[..i].trim().to_string();
        if field.is_empty() {
            bail!("query clause {clause:?} has no field name");
        }
        let value = clause[i + op_len..].trim();
        return Ok(RawClause { field, op, value: parse_value(value) });
    }
    bail!("query clause {clause:?} has no comparison operator (expected one of =, <, >, <=, >=)")
}

fn parse_value(s: &str) -> NodeValue {
    match s {
        "null" => NodeValue::Null,
        "true" => NodeValue::Bool(true),
        "false" => NodeValue::Bool(false),
        _ => s
            .parse::<f64>()
            .map(NodeValue::Number)
            .unwrap_or_else(|_| NodeValue::String(s.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_clause_parses_as_equality() {
        let queries = parse_query("age=42", &HashMap::new()).unwrap();
        assert_eq!(queries.len(), 1);
        assert_eq!(queries[0].field, "age");
        assert!(queries[0].predicate.matches(&Key::Number(42.0)));
    }

    #[test]
    fn repeated_field_merges_into_one_range() {
        let queries = parse_query("age>=18,age<35", &HashMap::new()).unwrap();
        assert_eq!(queries.len(), 1);
        assert!(queries[0].predicate.matches(&Key::Number(20.0)));
        assert!(!queries[0].predicate.matches(&Key::Number(35.0)));
    }

    #[test]
    fn distinct_fields_produce_separate_clauses() {
        let queries = parse_query("name=John,age>17", &HashMap::new()).unwrap();
        assert_eq!(queries.len(), 2);
        assert_eq!(queries[0].field, "name");
        assert_eq!(queries[1].field, "age");
    }

    #[test]
    fn missing_operator_is_rejected() {
        assert!(parse_clause("age").is_err());
    }

    #[test]
    fn date_time_field_compares_by_parsed_timestamp() {
        let mut kinds = HashMap::new();
        kinds.insert("created".to_string(), FieldType::DateTime);
        let queries = parse_query("created>=2020-01-01", &kinds).unwrap();
        assert_eq!(queries.len(), 1);
    }
}
