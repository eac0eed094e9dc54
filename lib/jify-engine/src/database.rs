//! Top-level orchestrator: pairs a data file ([`JsonStore`] at indent 2)
//! with its index file and keeps them consistent under concurrent callers.
//!
//! [`Database`] is the only type most callers need. It decides when the
//! index is stale relative to the data file and rebuilds it field by
//! field, using each field header's `tx` flag so a reader never observes
//! a half-built field.

use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::error::{Error, Result};
use crate::file::Stat;
use crate::index::{FieldSpec, Index};
use crate::predicate::{FieldType, NodeValue, RangePredicate};
use crate::store::JsonStore;

const RECORD_INDENT: usize = 2;
/// How many records are batched into one index append while rebuilding a
/// field from scratch, bounding memory use on a large data file.
const REBUILD_BATCH_SIZE: usize = 1000;

fn index_path(data_path: &Path) -> PathBuf {
    let mut name = data_path.file_stem().unwrap_or_default().to_os_string();
    name.push(".idx.json");
    data_path.with_file_name(name)
}

pub struct Database {
    store: JsonStore,
    index_path: PathBuf,
}

impl Database {
    /// Creates an empty data file at `path` and its (empty) index file.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let store = JsonStore::create(&path, RECORD_INDENT, &[]).await?;
        let index_path = index_path(&path);
        Index::create(&index_path).await?;
        Ok(Self { store, index_path })
    }

    /// Opens an existing data file. Does not require the index file to
    /// exist yet; [`Database::index`] will create it on first use.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let index_path = index_path(&path);
        Ok(Self { store: JsonStore::open(&path, RECORD_INDENT).await?, index_path })
    }

    /// Deletes both the data file and its index file.
    pub async fn drop(self) -> Result<()> {
        self.store.destroy().await?;
        if tokio::fs::try_exists(&self.index_path).await.unwrap_or(false) {
            Index::open(&self.index_path).await?.destroy().await?;
        }
        Ok(())
    }

    pub fn path(&self) -> &Path {
        self.store.path()
    }

    /// Appends one JSON object as a new record, returning the byte offset
    /// it can later be looked up at. Record bytes are flushed before any
    /// index entry referencing them (spec §5 ordering guarantee): the
    /// append happens first and fully completes, and only then — if an
    /// index already exists — does every field the record has a header for
    /// get incrementally updated, each wrapped in its own begin/end
    /// transaction (spec §4.6 `insert` step 3) so a crash mid-update leaves
    /// that one field's header `tx = 1` for the next `index(...)` to rebuild
    /// (spec §7, §8 property 6), rather than silently corrupting it.
    pub async fn insert(&self, record: &Value) -> Result<u64> {
        let guard = self.store.lock(0, true).await;
        let result = self.store.append(record, None).await;
        guard.unlock().await;
        let (start, _) = result?;
        tracing::trace!(position = start, path = %self.store.path().display(), "inserted record");

        if tokio::fs::try_exists(&self.index_path).await.unwrap_or(false) {
            let index = Index::open(&self.index_path).await?;
            for (name, _) in index.headers().await? {
                let Some(value) = record.get(&name) else { continue };
                if !crate::predicate::is_indexable(value) {
                    continue;
                }
                index.begin_transaction(&name).await?;
                index.insert_field(&name, &[(value.clone(), start)]).await?;
                index.end_transaction(&name).await?;
            }
        }
        Ok(start)
    }

    /// Reads the record at `position`.
    pub async fn get(&self, position: u64) -> Result<Value> {
        let scanned = self.store.get(position).await?;
        scanned
            .value
            .ok_or_else(|| Error::invalid_format(self.store.path(), format!("no value at {position}")))
    }

    /// Opens (creating and rebuilding as necessary) the index, ensuring
    /// `fields` are registered and current with respect to the data file.
    /// Returns an [`Index`] ready for [`Index::find`].
    pub async fn index(&self, fields: &[FieldSpec]) -> Result<Index> {
        if !tokio::fs::try_exists(&self.index_path).await.unwrap_or(false) {
            Index::create(&self.index_path).await?;
        }
        let index = Index::open(&self.index_path).await?;
        index.add_fields(fields).await?;

        if self.is_outdated(&index).await? {
            // Spec §4.6 `index`: an outdated index is rebuilt wholesale,
            // "re-adding both previously-indexed and new fields" — not just
            // the fields this particular call asked about. `add_fields`
            // above already merged any newly requested fields into the
            // header chain, so every currently-registered header is the
            // complete set to rebuild.
            for (name, _) in index.headers().await? {
                self.rebuild_field(&index, &FieldSpec::new(name, None)).await?;
            }
        } else {
            // Still need to rebuild any field whose header was just added
            // above and therefore starts out empty.
            let existing = index.headers().await?;
            for field in fields {
                let is_new = existing
                    .iter()
                    .find(|(name, _)| name == &field.name)
                    .map(|(_, entry)| entry.node.levels.iter().all(|&l| l == 0))
                    .unwrap_or(true);
                if is_new {
                    self.rebuild_field(&index, field).await?;
                }
            }
        }
        Ok(index)
    }

    /// An index is outdated if the data file was modified after it, or if
    /// a previous rebuild was interrupted mid-field (a sticky `tx` flag).
    async fn is_outdated(&self, index: &Index) -> Result<bool> {
        let data_stat: Stat = self.store.stat().await?;
        let index_stat = index.stat().await?;
        if data_stat.mtime > index_stat.mtime {
            return Ok(true);
        }
        for (_, header) in index.headers().await? {
            let metadata = crate::predicate::FieldMetadata::from_json_string(match &header.node.value {
                NodeValue::String(s) => s,
                _ => continue,
            })?;
            if metadata.in_transaction() {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Rebuilds one field's skip list from scratch: flags it mid-transaction,
    /// streams every record's value for that field in batches, then clears
    /// the flag once the whole field is rebuilt.
    async fn rebuild_field(&self, index: &Index, field: &FieldSpec) -> Result<()> {
        tracing::debug!(field = %field.name, "rebuilding field index");
        index.begin_transaction(&field.name).await?;
        index.reset_field(&field.name).await?;

        let mut all = self.store.get_all().await?;
        let mut batch = Vec::with_capacity(REBUILD_BATCH_SIZE);
        while let Some((position, record)) = all.next().await? {
            if let Some(value) = record.get(&field.name) {
                if crate::predicate::is_indexable(value) {
                    batch.push((value.clone(), position));
                }
            }
            if batch.len() >= REBUILD_BATCH_SIZE {
                index.insert_field(&field.name, &batch).await?;
                batch.clear();
            }
        }
        if !batch.is_empty() {
            index.insert_field(&field.name, &batch).await?;
        }

        index.end_transaction(&field.name).await?;
        tracing::debug!(field = %field.name, "field index rebuilt");
        Ok(())
    }

    /// Finds every record matching `predicate` on `field`, returning the
    /// matching records themselves (not just their offsets).
    pub async fn find(&self, index: &Index, field: &str, predicate: &RangePredicate) -> Result<Vec<Value>> {
        let positions = index.find(field, predicate).await?;
        let mut records = Vec::with_capacity(positions.len());
        for position in positions {
            records.push(self.get(position).await?);
        }
        Ok(records)
    }

    /// Evaluates a set of queries, where each query is a conjunction of
    /// per-field predicates and the overall result is their union (spec
    /// §4.6 `find`/§8 "Conjunction/Disjunction"). Each inner `Query`'s
    /// clauses are intersected by record offset; the per-query offset sets
    /// are then unioned and deduplicated before being resolved to records.
    pub async fn find_queries(&self, index: &Index, queries: &[Query]) -> Result<Vec<Value>> {
        use std::collections::HashSet;

        let mut union: HashSet<u64> = HashSet::new();
        for query in queries {
            let mut intersection: Option<HashSet<u64>> = None;
            for clause in query {
                let positions: HashSet<u64> =
                    index.find(&clause.field, &clause.predicate).await?.into_iter().collect();
                intersection = Some(match intersection {
                    Some(acc) => acc.intersection(&positions).copied().collect(),
                    None => positions,
                });
                if intersection.as_ref().is_some_and(HashSet::is_empty) {
                    break;
                }
            }
            union.extend(intersection.unwrap_or_default());
        }

        let mut records = Vec::with_capacity(union.len());
        for position in union {
            records.push(self.get(position).await?);
        }
        Ok(records)
    }
}

/// One clause of a query: a field, the predicate to evaluate on it, and
/// (for index-building purposes) the field's declared storage type.
#[derive(Debug, Clone)]
pub struct FieldQuery {
    pub field: String,
    pub kind: Option<FieldType>,
    pub predicate: RangePredicate,
}

/// A conjunction of [`FieldQuery`] clauses, all of which must match for a
/// record to belong to this query's result set.
pub type Query = Vec<FieldQuery>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::{build_predicate, Comparison, Key, Op};
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn insert_and_get_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        let database = Database::create(&path).await.unwrap();
        let position = database.insert(&json!({"name": "Ada", "age": 36})).await.unwrap();
        let record = database.get(position).await.unwrap();
        assert_eq!(record, json!({"name": "Ada", "age": 36}));
    }

    #[tokio::test]
    async fn index_then_find_matches_inserted_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        let database = Database::create(&path).await.unwrap();
        database.insert(&json!({"name": "Ada", "age": 36})).await.unwrap();
        database.insert(&json!({"name": "Alan", "age": 41})).await.unwrap();
        database.insert(&json!({"name": "Grace", "age": 85})).await.unwrap();

        let fields = vec![FieldSpec::new("age", None)];
        let index = database.index(&fields).await.unwrap();
        let predicate = build_predicate(&[Comparison { op: Op::Ge, key: Key::Number(40.0) }]).unwrap();
        let results = database.find(&index, "age", &predicate).await.unwrap();
        assert_eq!(results.len(), 2);
        let names: Vec<_> = results.iter().map(|r| r["name"].as_str().unwrap()).collect();
        assert!(names.contains(&"Alan"));
        assert!(names.contains(&"Grace"));
    }

    #[tokio::test]
    async fn disjunction_across_queries_unions_results() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        let database = Database::create(&path).await.unwrap();
        for age in [17, 18, 20, 34, 42, 43, 50] {
            database.insert(&json!({"name": "John", "age": age})).await.unwrap();
        }
        let fields = vec![FieldSpec::new("age", None)];
        let index = database.index(&fields).await.unwrap();

        let queries = vec![
            vec![FieldQuery {
                field: "age".to_string(),
                kind: None,
                predicate: build_predicate(&[Comparison { op: Op::Lt, key: Key::Number(18.0) }]).unwrap(),
            }],
            vec![FieldQuery {
                field: "age".to_string(),
                kind: None,
                predicate: build_predicate(&[Comparison { op: Op::Gt, key: Key::Number(35.0) }]).unwrap(),
            }],
        ];
        let results = database.find_queries(&index, &queries).await.unwrap();
        let mut ages: Vec<i64> = results.iter().map(|r| r["age"].as_i64().unwrap()).collect();
        ages.sort_unstable();
        assert_eq!(ages, vec![17, 42, 43, 50]);
    }

    #[tokio::test]
    async fn reindexing_after_new_inserts_picks_up_new_records() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        let database = Database::create(&path).await.unwrap();
        database.insert(&json!({"age": 10})).await.unwrap();

        let fields = vec![FieldSpec::new("age", None)];
        database.index(&fields).await.unwrap();

        database.insert(&json!({"age": 99})).await.unwrap();
        let index = database.index(&fields).await.unwrap();

        let predicate = build_predicate(&[Comparison { op: Op::Eq, key: Key::Number(99.0) }]).unwrap();
        let results = database.find(&index, "age", &predicate).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn insert_after_indexing_is_visible_without_a_manual_rebuild() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        let database = Database::create(&path).await.unwrap();
        database.insert(&json!({"age": 10})).await.unwrap();

        let fields = vec![FieldSpec::new("age", None)];
        let index = database.index(&fields).await.unwrap();

        // Insert after the index already exists: Database::insert must
        // incrementally update the field's skip list itself (spec §4.6
        // step 3), so the *same* index handle already reflects it.
        database.insert(&json!({"age": 99})).await.unwrap();
        let predicate = build_predicate(&[Comparison { op: Op::Eq, key: Key::Number(99.0) }]).unwrap();
        let results = database.find(&index, "age", &predicate).await.unwrap();
        assert_eq!(results.len(), 1);
    }

    #[tokio::test]
    async fn incremental_insert_never_reopens_an_existing_field_from_scratch() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        let database = Database::create(&path).await.unwrap();
        database.insert(&json!({"age": 1})).await.unwrap();
        database.insert(&json!({"age": 2})).await.unwrap();
        let fields = vec![FieldSpec::new("age", None)];
        database.index(&fields).await.unwrap();

        // Ten more incremental inserts on an already-indexed field must
        // never wipe out what's already there.
        for age in 3..=12 {
            database.insert(&json!({"age": age})).await.unwrap();
        }
        let index = database.index(&fields).await.unwrap();
        let predicate = build_predicate(&[Comparison { op: Op::Ge, key: Key::Number(1.0) }]).unwrap();
        let results = database.find(&index, "age", &predicate).await.unwrap();
        assert_eq!(results.len(), 12);
    }

    #[tokio::test]
    async fn aborted_transaction_is_rebuilt_cleanly_by_the_next_index_call() {
        // Spec §8 property 6: a field header left with tx=1 (simulating a
        // crash between beginTransaction and endTransaction) must be
        // rebuilt from scratch by the next index(...) call, with the same
        // result as a clean build.
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        let database = Database::create(&path).await.unwrap();
        for age in [5, 9, 12] {
            database.insert(&json!({"age": age})).await.unwrap();
        }
        let fields = vec![FieldSpec::new("age", None)];
        let index = database.index(&fields).await.unwrap();
        index.begin_transaction("age").await.unwrap();

        // The field is now flagged mid-write; find must refuse it...
        let err = index
            .find("age", &build_predicate(&[Comparison { op: Op::Ge, key: Key::Number(0.0) }]).unwrap())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::FieldInTransaction { .. }));

        // ...and the next index(...) call must rebuild it cleanly.
        let rebuilt = database.index(&fields).await.unwrap();
        let predicate = build_predicate(&[Comparison { op: Op::Ge, key: Key::Number(0.0) }]).unwrap();
        let results = database.find(&rebuilt, "age", &predicate).await.unwrap();
        assert_eq!(results.len(), 3);
    }

    #[tokio::test]
    async fn outdated_index_rebuilds_previously_indexed_fields_too() {
        // Spec §4.6 `index`: when the index is outdated, the rebuild must
        // re-add *both* previously-indexed fields and newly requested ones
        // — not only whatever this particular call asked about.
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        let database = Database::create(&path).await.unwrap();
        database.insert(&json!({"name": "Ada", "city": "London"})).await.unwrap();
        database.insert(&json!({"name": "Alan", "city": "Manchester"})).await.unwrap();

        let name_index = database.index(&[FieldSpec::new("name", None)]).await.unwrap();
        // Force the "name" header into tx=1 to simulate an outdated index
        // without needing to race real mtimes.
        name_index.begin_transaction("name").await.unwrap();

        // This call only asks about "city", but since the index as a whole
        // is outdated, "name" must come back fully rebuilt too.
        let index = database.index(&[FieldSpec::new("city", None)]).await.unwrap();

        let name_predicate =
            build_predicate(&[Comparison { op: Op::Eq, key: Key::String("Ada".to_string()) }]).unwrap();
        let name_results = database.find(&index, "name", &name_predicate).await.unwrap();
        assert_eq!(name_results.len(), 1);

        let city_predicate =
            build_predicate(&[Comparison { op: Op::Eq, key: Key::String("London".to_string()) }]).unwrap();
        let city_results = database.find(&index, "city", &city_predicate).await.unwrap();
        assert_eq!(city_results.len(), 1);
    }
}
