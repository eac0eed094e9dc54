//! The persistent ordered index: a per-field skip list whose nodes are
//! entries of a JSON array on disk (spec §4.5).
//!
//! An [`Index`] owns one [`JsonStore`] (indent 0, one entry per line). Its
//! first entry is always the root; field headers hang off the root's
//! `link` chain, and each header's skip list is threaded through its own
//! `levels`. [`cursor::Cursor`] does the skip-list walking; this module is
//! the public surface: field registration, transactions, batch insert, and
//! find.

mod cursor;

use std::path::Path;

use serde_json::Value;

use crate::entry::{self, IndexEntry, SkipListNode, MAX_HEIGHT};
use crate::error::{Error, Result};
use crate::predicate::{FieldMetadata, FieldType, Key, NodeValue, RangePredicate};
use crate::store::JsonStore;

use cursor::Cursor;

/// Indent 0 means the root entry always starts at byte 2, right after the
/// opening `"[\n"` (spec §4.4's `create` always writes that literal
/// prefix, and indent-0 stores never indent the first element further).
const ROOT_POSITION: u64 = 2;

/// A field to register via [`Index::add_fields`] or build via
/// [`crate::database::Database::index`].
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub kind: Option<FieldType>,
}

impl FieldSpec {
    pub fn new(name: impl Into<String>, kind: Option<FieldType>) -> Self {
        Self { name: name.into(), kind }
    }
}

pub struct Index {
    store: JsonStore,
}

impl Index {
    /// Creates the index file and writes the root entry (spec §4.5.1).
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let root = IndexEntry {
            position: 0,
            pointer: 0,
            link: 0,
            node: SkipListNode { levels: Vec::new(), value: NodeValue::Null },
        };
        let value = entry::entry_to_json("", &root)?;
        let store = JsonStore::create(path, 0, &[value]).await?;
        Ok(Self { store })
    }

    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self { store: JsonStore::open(path, 0).await? })
    }

    pub async fn destroy(&self) -> Result<()> {
        self.store.destroy().await
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    pub async fn stat(&self) -> Result<crate::file::Stat> {
        self.store.stat().await
    }

    async fn read_entry(&self, position: u64) -> Result<(String, IndexEntry)> {
        let scanned = self.store.get(position).await?;
        let value = scanned.value.ok_or_else(|| {
            Error::invalid_format(self.store.path(), format!("no value scanned at {position}"))
        })?;
        entry::entry_from_scanned(scanned.start, &value)
    }

    async fn rewrite_payload(&self, position: u64, label: &str, entry: &IndexEntry) -> Result<()> {
        let payload = entry::encode_payload_escaped(entry)?;
        let offset = entry::payload_offset(position, label);
        self.store.write(payload.as_bytes(), offset).await
    }

    /// Walks the root's `link` chain, returning every registered field
    /// header in order.
    pub async fn headers(&self) -> Result<Vec<(String, IndexEntry)>> {
        let (_, root) = self.read_entry(ROOT_POSITION).await?;
        let mut out = Vec::new();
        let mut link = root.link;
        while link != 0 {
            let (label, entry) = self.read_entry(link).await?;
            link = entry.link;
            out.push((label, entry));
        }
        Ok(out)
    }

    async fn find_header(&self, field: &str) -> Result<Option<(String, IndexEntry)>> {
        Ok(self.headers().await?.into_iter().find(|(name, _)| name == field))
    }

    /// Appends a field-header entry per field not already present,
    /// chaining it from the previous header's `link` (or the root's, if
    /// this is the first field) (spec §4.5.1).
    pub async fn add_fields(&self, fields: &[FieldSpec]) -> Result<()> {
        let guard = self.store.lock(0, true).await;
        let existing = self.headers().await?;
        let mut tail_position = ROOT_POSITION;
        let mut tail_label = String::new();
        if let Some((label, entry)) = existing.last() {
            tail_position = entry.position;
            tail_label = label.clone();
        }

        for field in fields {
            if existing.iter().any(|(name, _)| name == &field.name) {
                continue;
            }
            let metadata = FieldMetadata::new(&field.name, field.kind);
            let header = IndexEntry {
                position: 0,
                pointer: 0,
                link: 0,
                node: SkipListNode {
                    levels: vec![0; MAX_HEIGHT],
                    value: NodeValue::String(metadata.to_json_string()?),
                },
            };
            let json_value = entry::entry_to_json(&field.name, &header)?;
            let (start, _) = self.store.append(&json_value, None).await?;

            let (_, mut tail_entry) = self.read_entry(tail_position).await?;
            tail_entry.link = start;
            self.rewrite_payload(tail_position, &tail_label, &tail_entry).await?;

            tail_position = start;
            tail_label = field.name.clone();
        }
        guard.unlock().await;
        Ok(())
    }

    /// Marks a field header mid-write (spec §4.5.3): sets `tx = 1` and
    /// nothing else. Safe to wrap around a single incremental insert as
    /// well as a full rebuild, since it never touches the existing skip
    /// list — see [`Index::reset_field`] for the destructive half of a
    /// rebuild.
    pub async fn begin_transaction(&self, field: &str) -> Result<()> {
        let (label, header) =
            self.find_header(field).await?.ok_or_else(|| Error::FieldMissing { field: field.to_string() })?;
        let guard = self.store.lock(header.position, true).await;
        let (_, mut current) = self.read_entry(header.position).await?;
        let mut metadata = FieldMetadata::from_json_string(value_as_str(&current.node.value)?)?;
        metadata.tx = 1;
        current.node.value = NodeValue::String(metadata.to_json_string()?);
        self.rewrite_payload(current.position, &label, &current).await?;
        guard.unlock().await;
        Ok(())
    }

    /// Detaches a field's skip list from its header (reset to all-empty
    /// levels): the old chain becomes unreachable garbage, which a fresh
    /// stream of inserts then replaces. Used only by a full field rebuild
    /// ([`crate::database::Database::index`]) — calling this around an
    /// incremental single-record insert would silently discard every
    /// record indexed so far.
    pub async fn reset_field(&self, field: &str) -> Result<()> {
        let (label, header) =
            self.find_header(field).await?.ok_or_else(|| Error::FieldMissing { field: field.to_string() })?;
        let guard = self.store.lock(header.position, true).await;
        let (_, mut current) = self.read_entry(header.position).await?;
        current.node.levels = vec![0; current.node.levels.len().max(MAX_HEIGHT)];
        self.rewrite_payload(current.position, &label, &current).await?;
        guard.unlock().await;
        Ok(())
    }

    /// Clears a field header's `tx` flag once its rebuild has finished.
    pub async fn end_transaction(&self, field: &str) -> Result<()> {
        let (label, header) =
            self.find_header(field).await?.ok_or_else(|| Error::FieldMissing { field: field.to_string() })?;
        let guard = self.store.lock(header.position, true).await;
        let (_, mut current) = self.read_entry(header.position).await?;
        let mut metadata = FieldMetadata::from_json_string(value_as_str(&current.node.value)?)?;
        metadata.tx = 0;
        current.node.value = NodeValue::String(metadata.to_json_string()?);
        self.rewrite_payload(current.position, &label, &current).await?;
        guard.unlock().await;
        Ok(())
    }

    /// Inserts a batch of `(value, record offset)` pairs for one field
    /// (spec §4.5.2). All items are assumed to belong to `field` and are
    /// spliced into its skip list as a single append plus targeted
    /// in-place rewrites of the entries it displaced.
    pub async fn insert_field(&self, field: &str, items: &[(Value, u64)]) -> Result<()> {
        if items.is_empty() {
            return Ok(());
        }
        tracing::trace!(field, count = items.len(), "inserting batch into field index");
        let (label, header) =
            self.find_header(field).await?.ok_or_else(|| Error::FieldMissing { field: field.to_string() })?;
        let guard = self.store.lock(header.position, true).await;
        let result = self.insert_field_locked(&label, &header, items).await;
        guard.unlock().await;
        result
    }

    async fn insert_field_locked(
        &self,
        label: &str,
        header: &IndexEntry,
        items: &[(Value, u64)],
    ) -> Result<()> {
        let (_, current_header) = self.read_entry(header.position).await?;
        let metadata = FieldMetadata::from_json_string(value_as_str(&current_header.node.value)?)?;
        let field_type = metadata.kind;

        let mut keyed = Vec::with_capacity(items.len());
        for (value, pointer) in items {
            let node_value = NodeValue::from_json(value)?;
            let key = Key::of(&node_value, field_type)?;
            keyed.push((key, node_value, *pointer));
        }
        // Descending order, per spec §4.5.2 step 2: groups duplicates
        // together and lets the within-batch splice logic always insert
        // to the left of what it already placed.
        keyed.sort_by(|a, b| b.0.cmp(&a.0));

        let mut cursor = Cursor::new(self, field_type, &current_header.node.levels);
        for (key, node_value, pointer) in keyed {
            cursor.insert(node_value, key, pointer).await?;
        }

        let file_guard = self.store.lock(0, true).await;
        let (append_position, first) = self.store.get_append_position().await?;
        let base = append_position + joiner_len(first, self.store.indent());
        let (raw, offsets) = cursor.serialize(label, base)?;
        self.store.append_raw(&raw, Some(append_position), Some(first)).await?;
        file_guard.unlock().await;

        let resolved_header_levels = cursor.header_levels(&offsets);
        let rewritten_header = IndexEntry {
            position: current_header.position,
            pointer: 0,
            link: current_header.link,
            node: SkipListNode { levels: resolved_header_levels, value: current_header.node.value.clone() },
        };
        self.rewrite_payload(current_header.position, label, &rewritten_header).await?;

        for entry in cursor.dirty_entries(&offsets) {
            self.rewrite_payload(entry.position, label, &entry).await?;
        }
        Ok(())
    }

    /// Looks up the record offsets matching `predicate` on `field` (spec
    /// §4.5.4). Fails with [`Error::FieldMissing`]/[`Error::FieldInTransaction`]
    /// per spec §7.
    pub async fn find(&self, field: &str, predicate: &RangePredicate) -> Result<Vec<u64>> {
        let (_, header) =
            self.find_header(field).await?.ok_or_else(|| Error::FieldMissing { field: field.to_string() })?;
        let guard = self.store.lock(header.position, false).await;
        let (_, current_header) = self.read_entry(header.position).await?;
        let metadata = FieldMetadata::from_json_string(value_as_str(&current_header.node.value)?)?;
        if metadata.in_transaction() {
            guard.unlock().await;
            return Err(Error::FieldInTransaction { field: field.to_string() });
        }
        let mut cursor = Cursor::new(self, metadata.kind, &current_header.node.levels);
        let result = cursor.find(predicate).await;
        guard.unlock().await;
        if let Ok(positions) = &result {
            tracing::trace!(field, matches = positions.len(), "field lookup complete");
        }
        result
    }
}

fn value_as_str(value: &NodeValue) -> Result<&str> {
    match value {
        NodeValue::String(s) => Ok(s),
        _ => Err(Error::invalid_format("<field header>", "header metadata is not a string value")),
    }
}

fn joiner_len(first: bool, indent: usize) -> u64 {
    (if first { 1 } else { 2 } + indent) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    async fn new_index(fields: &[(&str, Option<FieldType>)]) -> (tempfile::TempDir, Index) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("index.json");
        let index = Index::create(&path).await.unwrap();
        let specs: Vec<FieldSpec> = fields.iter().map(|(n, k)| FieldSpec::new(*n, *k)).collect();
        index.add_fields(&specs).await.unwrap();
        (dir, index)
    }

    #[tokio::test]
    async fn add_fields_registers_headers_in_order() {
        let (_dir, index) = new_index(&[("age", None), ("name", None)]).await;
        let headers = index.headers().await.unwrap();
        let names: Vec<&str> = headers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["age", "name"]);
    }

    #[tokio::test]
    async fn insert_then_find_equality() {
        let (_dir, index) = new_index(&[("age", None)]).await;
        index
            .insert_field("age", &[(json!(42), 10), (json!(17), 20), (json!(50), 30)])
            .await
            .unwrap();
        let predicate = crate::predicate::build_predicate(&[crate::predicate::Comparison {
            op: crate::predicate::Op::Eq,
            key: Key::Number(42.0),
        }])
        .unwrap();
        let result = index.find("age", &predicate).await.unwrap();
        assert_eq!(result, vec![10]);
    }

    #[tokio::test]
    async fn find_on_missing_field_errors() {
        let (_dir, index) = new_index(&[]).await;
        let predicate = RangePredicate::default();
        let err = index.find("age", &predicate).await.unwrap_err();
        assert!(matches!(err, Error::FieldMissing { .. }));
    }

    #[tokio::test]
    async fn transaction_flag_blocks_find() {
        let (_dir, index) = new_index(&[("age", None)]).await;
        index.begin_transaction("age").await.unwrap();
        let err = index.find("age", &RangePredicate::default()).await.unwrap_err();
        assert!(matches!(err, Error::FieldInTransaction { .. }));
        index.end_transaction("age").await.unwrap();
        index.find("age", &RangePredicate::default()).await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_values_are_all_returned_via_link_chain() {
        let (_dir, index) = new_index(&[("age", None)]).await;
        let items: Vec<(Value, u64)> = (0..50).map(|i| (json!(4), i * 10)).collect();
        index.insert_field("age", &items).await.unwrap();
        let predicate = crate::predicate::build_predicate(&[crate::predicate::Comparison {
            op: crate::predicate::Op::Eq,
            key: Key::Number(4.0),
        }])
        .unwrap();
        let mut result = index.find("age", &predicate).await.unwrap();
        result.sort_unstable();
        let mut expected: Vec<u64> = (0..50).map(|i| i * 10).collect();
        expected.sort_unstable();
        assert_eq!(result, expected);
    }

    #[tokio::test]
    async fn range_query_over_multiple_batches() {
        let (_dir, index) = new_index(&[("age", None)]).await;
        let fixture: Vec<(Value, u64)> = vec![
            (json!(17), 1),
            (json!(18), 2),
            (json!(20), 3),
            (json!(34), 4),
            (json!(42), 5),
            (json!(43), 6),
            (json!(50), 7),
        ];
        index.insert_field("age", &fixture).await.unwrap();
        let predicate = crate::predicate::build_predicate(&[
            crate::predicate::Comparison { op: crate::predicate::Op::Ge, key: Key::Number(18.0) },
            crate::predicate::Comparison { op: crate::predicate::Op::Lt, key: Key::Number(35.0) },
        ])
        .unwrap();
        let mut result = index.find("age", &predicate).await.unwrap();
        result.sort_unstable();
        assert_eq!(result, vec![2, 3]);
    }
}
