//! On-disk representation of index entries: skip-list nodes encoded with
//! the Z85 codec and wrapped in a single-key JSON object (spec §3, §6).
//!
//! Every numeric field of an encoded entry (`pointer`, `link`, each
//! `levels[i]`) is fixed-width Z85 (10 characters, a 48-bit offset), built
//! only from [`z85`]'s alphabet, which contains no `"` or `\` — so that
//! portion of the payload is exactly as long *after* JSON string escaping
//! as before it. That's what lets [`crate::index::Index`] rewrite a
//! predecessor's forward pointers or a header's `tx` flag in place without
//! touching anything else in the file: the new payload, once embedded as a
//! JSON string, is exactly as long as the old one. The payload as a whole
//! is still a JSON string value, though, so any in-place rewrite must go
//! through [`encode_payload_escaped`] rather than [`encode_payload`]
//! directly — the latter is raw content, not what's actually on disk
//! between the quotes.

use serde_json::{json, Map, Value};

use crate::error::{Error, Result};
use crate::z85;

/// The fixed height of a field-header entry's `levels` array (spec §3).
pub const MAX_HEIGHT: usize = 32;

/// A skip-list node: the forward pointers at each level it participates
/// in, plus the value it holds. Duplicate entries have an empty `levels`.
#[derive(Debug, Clone, PartialEq)]
pub struct SkipListNode {
    pub levels: Vec<u64>,
    pub value: crate::predicate::NodeValue,
}

/// One entry in the index file: root, field-header, value, or duplicate
/// (spec §3).
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub position: u64,
    pub pointer: u64,
    pub link: u64,
    pub node: SkipListNode,
}

/// Encodes an entry's payload as `pointer;link;levelsCSV;type;value`.
pub fn encode_payload(entry: &IndexEntry) -> Result<String> {
    use crate::predicate::NodeValue;

    let levels_csv = entry
        .node
        .levels
        .iter()
        .map(|&offset| z85::encode_u48(offset))
        .collect::<Vec<_>>()
        .join(",");
    let (type_tag, value_str) = match &entry.node.value {
        NodeValue::Null => (0u32, String::new()),
        NodeValue::Bool(b) => (1, z85::encode_u32(u32::from(*b))),
        NodeValue::Number(n) => (2, z85::encode_f64(*n)?),
        NodeValue::String(s) => (3, s.clone()),
    };
    Ok(format!(
        "{};{};{};{};{}",
        z85::encode_u48(entry.pointer),
        z85::encode_u48(entry.link),
        levels_csv,
        z85::encode_u32(type_tag),
        value_str,
    ))
}

/// [`encode_payload`], escaped exactly the way `serde_json` would escape it
/// as the content of a JSON string — i.e. the bytes that actually sit
/// between the quotes of `{"<label>":"<here>"}` on disk. An in-place
/// rewrite of an existing entry's payload must write these bytes, not
/// `encode_payload`'s raw output: the initial `append` that put the entry
/// on disk went through `serde_json::to_string` on the whole object, which
/// escapes any `"`/`\` in the payload (present in every field-header's
/// JSON metadata value, e.g. `{"name":"age","tx":0}`). Writing the
/// unescaped form directly at `payload_offset` would inject literal quotes
/// that terminate the JSON string early.
pub fn encode_payload_escaped(entry: &IndexEntry) -> Result<String> {
    let raw = encode_payload(entry)?;
    let quoted = serde_json::to_string(&Value::String(raw))
        .map_err(|source| Error::invalid_format("<index entry>", source.to_string()))?;
    Ok(quoted[1..quoted.len() - 1].to_string())
}

/// Decodes an entry's payload string, given the byte position of its
/// owning `{` in the index file.
pub fn decode_payload(position: u64, payload: &str) -> Result<IndexEntry> {
    use crate::predicate::NodeValue;

    let bad = || Error::invalid_format("<index entry>", format!("malformed payload {payload:?}"));
    let mut parts = payload.splitn(5, ';');
    let pointer = z85::decode_u48(parts.next().ok_or_else(bad)?)?;
    let link = z85::decode_u48(parts.next().ok_or_else(bad)?)?;
    let levels_csv = parts.next().ok_or_else(bad)?;
    let type_tag = z85::decode_u32(parts.next().ok_or_else(bad)?)?;
    let value_str = parts.next().unwrap_or("");

    let levels = if levels_csv.is_empty() {
        Vec::new()
    } else {
        levels_csv
            .split(',')
            .map(z85::decode_u48)
            .collect::<Result<Vec<_>>>()?
    };
    let value = match type_tag {
        0 => NodeValue::Null,
        1 => NodeValue::Bool(z85::decode_u32(value_str)? != 0),
        2 => NodeValue::Number(z85::decode_f64(value_str)?),
        3 => NodeValue::String(value_str.to_string()),
        other => {
            return Err(Error::invalid_format(
                "<index entry>",
                format!("unknown type tag {other}"),
            ))
        }
    };
    Ok(IndexEntry { position, pointer, link, node: SkipListNode { levels, value } })
}

/// Wraps an encoded entry in its single-key JSON object, using the owning
/// field's name as the key on every entry (root entries use the empty
/// string). This resolves spec §9's open question by always keying on the
/// field name rather than leaving value entries unlabelled: it makes every
/// entry self-describing, at the cost of a few repeated bytes per line.
pub fn entry_to_json(label: &str, entry: &IndexEntry) -> Result<Value> {
    let payload = encode_payload(entry)?;
    let mut map = Map::with_capacity(1);
    map.insert(label.to_string(), json!(payload));
    Ok(Value::Object(map))
}

/// Recovers `(label, entry)` from a scanned array element.
pub fn entry_from_scanned(position: u64, value: &Value) -> Result<(String, IndexEntry)> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::invalid_format("<index entry>", "entry is not a JSON object"))?;
    let (label, payload) = object
        .iter()
        .next()
        .ok_or_else(|| Error::invalid_format("<index entry>", "entry object has no keys"))?;
    let payload_str = payload
        .as_str()
        .ok_or_else(|| Error::invalid_format("<index entry>", "entry payload is not a string"))?;
    Ok((label.clone(), decode_payload(position, payload_str)?))
}

/// Byte offset of the first character of an entry's payload string, i.e.
/// just past `{"` + `label` + `":"` (spec §4.5.1: "offset `position + 4 +
/// fieldLabelLength`, i.e. past `{"` + label + `":`" lands on the opening
/// quote of the value; one more byte reaches its content).
pub fn payload_offset(position: u64, label: &str) -> u64 {
    position + 4 + label.len() as u64 + 1
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::NodeValue;

    #[test]
    fn payload_round_trips_for_every_value_type() {
        for value in [
            NodeValue::Null,
            NodeValue::Bool(true),
            NodeValue::Number(42.5),
            NodeValue::String("hello".to_string()),
        ] {
            let entry = IndexEntry {
                position: 100,
                pointer: 200,
                link: 0,
                node: SkipListNode { levels: vec![300, 0, 400], value },
            };
            let encoded = encode_payload(&entry).unwrap();
            let decoded = decode_payload(100, &encoded).unwrap();
            assert_eq!(decoded.pointer, entry.pointer);
            assert_eq!(decoded.link, entry.link);
            assert_eq!(decoded.node.levels, entry.node.levels);
            assert_eq!(decoded.node.value, entry.node.value);
        }
    }

    #[test]
    fn payload_length_is_stable_across_numeric_rewrites() {
        let mut entry = IndexEntry {
            position: 0,
            pointer: 10,
            link: 0,
            node: SkipListNode { levels: vec![5, 6, 7], value: NodeValue::String("x".into()) },
        };
        let before = encode_payload(&entry).unwrap();
        entry.link = 999_999;
        entry.node.levels = vec![1, 2, 3];
        let after = encode_payload(&entry).unwrap();
        assert_eq!(before.len(), after.len());
    }

    #[test]
    fn json_wrapper_round_trips_through_entry_from_scanned() {
        let entry = IndexEntry {
            position: 2,
            pointer: 0,
            link: 50,
            node: SkipListNode { levels: vec![0; MAX_HEIGHT], value: NodeValue::String("meta".into()) },
        };
        let value = entry_to_json("age", &entry).unwrap();
        let (label, decoded) = entry_from_scanned(2, &value).unwrap();
        assert_eq!(label, "age");
        assert_eq!(decoded.link, 50);
        assert_eq!(decoded.node.levels.len(), MAX_HEIGHT);
    }

    #[test]
    fn escaped_payload_matches_what_serializing_the_whole_entry_produces() {
        // A field-header's metadata value (`{"name":"age","tx":0}`) contains
        // `"` characters that `serde_json` escapes when the whole entry is
        // serialized on append. An in-place rewrite must produce exactly
        // the same escaped bytes, or it corrupts the surrounding JSON string.
        let entry = IndexEntry {
            position: 0,
            pointer: 0,
            link: 0,
            node: SkipListNode {
                levels: vec![0; MAX_HEIGHT],
                value: NodeValue::String(r#"{"name":"age","tx":0}"#.to_string()),
            },
        };
        let appended = serde_json::to_string(&entry_to_json("age", &entry).unwrap()).unwrap();
        let offset = payload_offset(0, "age") as usize;
        let embedded = &appended[offset..appended.len() - 2];
        assert_eq!(embedded, encode_payload_escaped(&entry).unwrap());
    }

    #[test]
    fn escaped_payload_is_longer_than_raw_when_value_needs_escaping() {
        let entry = IndexEntry {
            position: 0,
            pointer: 0,
            link: 0,
            node: SkipListNode { levels: vec![], value: NodeValue::String(r#"a"b"#.to_string()) },
        };
        let raw = encode_payload(&entry).unwrap();
        let escaped = encode_payload_escaped(&entry).unwrap();
        assert!(escaped.len() > raw.len(), "the embedded `\"` must be escaped to `\\\"`");
    }

    #[test]
    fn escaped_payload_is_unchanged_when_value_has_nothing_to_escape() {
        let entry = IndexEntry {
            position: 100,
            pointer: 200,
            link: 300,
            node: SkipListNode { levels: vec![400, 0], value: NodeValue::Number(42.5) },
        };
        assert_eq!(encode_payload(&entry).unwrap(), encode_payload_escaped(&entry).unwrap());
    }

    #[test]
    fn payload_offset_lands_on_value_content() {
        // {"age":"PAYLOAD"} — position 0, label "age" (3 chars):
        // { " a g e " : " P ...
        // 0 1 2 3 4 5 6 7 8
        assert_eq!(payload_offset(0, "age"), 8);
    }
}
