//! Treats a [`File`] as a JSON array on disk: create, append, random get,
//! and lazy whole-array iteration (spec §4.4).
//!
//! Both the record data file and the index file are `JsonStore`s — they
//! differ only in indentation (2 for records, 0 for index entries) and in
//! who calls which operations. Every append is a single positional write
//! that overwrites the trailing `"\n]\n"` with `joiner + raw + "\n]\n"`, so
//! a successful append atomically extends the array under the caller's
//! lock (spec §9 "Append safety").

use std::path::Path;

use serde_json::Value;

use crate::byte_reader::ByteReader;
use crate::error::{Error, Result};
use crate::file::{File, LockGuard, Stat};
use crate::scanner::{self, Scanned};

/// The canonical trailer every data/index file ends with.
const TRAILER: &[u8] = b"\n]\n";

pub struct JsonStore {
    file: File,
    indent: usize,
}

impl JsonStore {
    /// Creates `path` exclusively and writes `[` + `objects` (formatted at
    /// `indent`) + `"\n]\n"` (spec §4.4 `create`).
    pub async fn create(path: impl AsRef<Path>, indent: usize, objects: &[Value]) -> Result<Self> {
        let file = File::create(path).await?;
        let store = Self { file, indent };
        let indent_str = " ".repeat(indent);
        let text = if objects.is_empty() {
            "[\n]\n".to_string()
        } else {
            let mut body = String::new();
            for (i, object) in objects.iter().enumerate() {
                if i > 0 {
                    body.push_str(",\n");
                    body.push_str(&indent_str);
                }
                body.push_str(&store.stringify(object)?);
            }
            format!("[\n{indent_str}{body}\n]\n")
        };
        store.file.append(text.as_bytes()).await?;
        Ok(store)
    }

    /// Opens an existing store, creating the file if it doesn't exist yet
    /// (matching [`File::open`]'s semantics; callers that require the file
    /// to already exist should check with [`crate::file::Stat`] first).
    pub async fn open(path: impl AsRef<Path>, indent: usize) -> Result<Self> {
        Ok(Self { file: File::open(path).await?, indent })
    }

    pub async fn destroy(&self) -> Result<()> {
        self.file.delete().await
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn indent(&self) -> usize {
        self.indent
    }

    pub async fn stat(&self) -> Result<Stat> {
        self.file.stat().await
    }

    pub async fn lock(&self, position: u64, exclusive: bool) -> LockGuard<'_> {
        self.file.lock(position, exclusive).await
    }

    /// Runs the JSON-element scanner starting at `position` (spec §4.4 `get`).
    pub async fn get(&self, position: u64) -> Result<Scanned> {
        scanner::scan(&self.file, position, true).await
    }

    /// Lazily iterates every element of the array, accepting both the
    /// canonical bracketed form and line-delimited JSON (spec §4.4 `getAll`).
    pub async fn get_all(&self) -> Result<GetAll<'_>> {
        let mut buf = [0u8; 1];
        let n = self.file.read(&mut buf, 0).await?;
        let position = if n > 0 && buf[0] == b'[' { 1 } else { 0 };
        Ok(GetAll { file: &self.file, position, done: false })
    }

    /// Scans the file's tail in reverse to locate the closing `]` (spec
    /// §4.4 `getAppendPosition`). Returns the byte offset to begin
    /// overwriting and whether the array is currently empty.
    pub async fn get_append_position(&self) -> Result<(u64, bool)> {
        let mut reader = ByteReader::new(&self.file, -1, true).await?;
        let close_offset = loop {
            match reader.next().await? {
                None => {
                    return Err(Error::invalid_format(self.file.path(), "no closing ']' found"))
                }
                Some((_, ch)) if ch.is_whitespace() => continue,
                Some((offset, ch)) if ch == ']' => break offset,
                Some((_, ch)) => {
                    return Err(Error::invalid_format(
                        self.file.path(),
                        format!("expected ']' while scanning tail, found {ch:?}"),
                    ))
                }
            }
        };
        let mut first = false;
        loop {
            match reader.next().await? {
                None => break,
                Some((_, ch)) if ch.is_whitespace() => continue,
                Some((_, ch)) => {
                    first = ch == '[';
                    break;
                }
            }
        }
        Ok((close_offset - 1, first))
    }

    /// Stringifies `value` and appends it (spec §4.4 `append`).
    pub async fn append(&self, value: &Value, position: Option<u64>) -> Result<(u64, u64)> {
        let raw = self.stringify(value)?;
        self.append_raw(raw.as_bytes(), position, None).await
    }

    /// Writes `joiner + raw + "\n]\n"` at `position` (computed via
    /// [`Self::get_append_position`] if omitted), where `joiner` is `"\n" +
    /// INDENT` for the first element or `",\n" + INDENT` otherwise (spec
    /// §4.4 `appendRaw`). Returns the byte range the raw bytes now occupy.
    pub async fn append_raw(
        &self,
        raw: &[u8],
        position: Option<u64>,
        first: Option<bool>,
    ) -> Result<(u64, u64)> {
        let (position, first) = match (position, first) {
            (Some(p), Some(f)) => (p, f),
            (p, f) => {
                let (computed_p, computed_f) = self.get_append_position().await?;
                (p.unwrap_or(computed_p), f.unwrap_or(computed_f))
            }
        };
        let indent_str = " ".repeat(self.indent);
        let joiner = if first {
            format!("\n{indent_str}")
        } else {
            format!(",\n{indent_str}")
        };
        let mut buf = Vec::with_capacity(joiner.len() + raw.len() + TRAILER.len());
        buf.extend_from_slice(joiner.as_bytes());
        buf.extend_from_slice(raw);
        buf.extend_from_slice(TRAILER);
        self.file.write(&buf, position).await?;
        Ok((position + joiner.len() as u64, raw.len() as u64))
    }

    /// Raw positional overwrite, for in-place updates of already-written
    /// bytes (e.g. rewriting a skip-list node's encoded payload).
    pub async fn write(&self, buf: &[u8], position: u64) -> Result<()> {
        self.file.write(buf, position).await
    }

    /// Overwrites the JSON value at `position` with `value`'s stringified
    /// form (spec §4.4 `set`). Callers are responsible for ensuring the
    /// replacement doesn't change the byte length of what's on disk.
    pub async fn set(&self, position: u64, value: &Value) -> Result<()> {
        let raw = self.stringify(value)?;
        self.file.write(raw.as_bytes(), position).await
    }

    /// `JSON.stringify(value, null, indent)`, normalized so a value is
    /// formatted at the store's indent with no surrounding whitespace
    /// (spec §4.4 `stringify`). At indent 0 this is compact, single-line
    /// JSON — the index file's "one element per line" format.
    pub fn stringify(&self, value: &Value) -> Result<String> {
        if self.indent == 0 {
            return serde_json::to_string(value)
                .map_err(|source| Error::invalid_format(self.file.path(), source.to_string()));
        }
        let indent_str = " ".repeat(self.indent);
        let formatter = serde_json::ser::PrettyFormatter::with_indent(indent_str.as_bytes());
        let mut buf = Vec::new();
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        serde::Serialize::serialize(value, &mut serializer)
            .map_err(|source| Error::invalid_format(self.file.path(), source.to_string()))?;
        let text = String::from_utf8(buf)
            .map_err(|source| Error::invalid_format(self.file.path(), source.to_string()))?;
        Ok(text.replace('\n', &format!("\n{indent_str}")))
    }
}

/// Lazy forward iterator over every element of a [`JsonStore`]'s array
/// (spec §4.4 `getAll`). Pull-based like [`ByteReader`]: each `next` call
/// scans exactly one element and leaves the stream positioned just past it.
pub struct GetAll<'a> {
    file: &'a File,
    position: u64,
    done: bool,
}

impl<'a> GetAll<'a> {
    pub async fn next(&mut self) -> Result<Option<(u64, Value)>> {
        if self.done {
            return Ok(None);
        }
        let mut reader = ByteReader::new(self.file, self.position as i64, false).await?;
        loop {
            match reader.next().await? {
                None => {
                    self.done = true;
                    return Ok(None);
                }
                Some((_, ch)) if ch.is_whitespace() || ch == ',' => continue,
                Some((_, ch)) if ch == ']' => {
                    self.done = true;
                    return Ok(None);
                }
                Some((offset, _)) => {
                    drop(reader);
                    let scanned = scanner::scan(self.file, offset, true).await?;
                    self.position = scanned.start + scanned.length;
                    return Ok(Some((
                        scanned.start,
                        scanned.value.expect("scan was called with parse=true"),
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[tokio::test]
    async fn create_writes_empty_array_by_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        JsonStore::create(&path, 2, &[]).await.unwrap();
        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(contents, "[\n]\n");
    }

    #[tokio::test]
    async fn append_then_get_all_round_trips() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        let store = JsonStore::create(&path, 2, &[]).await.unwrap();
        store.append(&json!({"name": "John", "age": 42}), None).await.unwrap();
        store.append(&json!({"name": "Jane", "age": 30}), None).await.unwrap();

        let mut all = store.get_all().await.unwrap();
        let mut values = Vec::new();
        while let Some((_, value)) = all.next().await.unwrap() {
            values.push(value);
        }
        assert_eq!(values, vec![json!({"name": "John", "age": 42}), json!({"name": "Jane", "age": 30})]);

        let contents = tokio::fs::read_to_string(&path).await.unwrap();
        assert!(contents.starts_with('['));
        assert!(contents.ends_with("\n]\n"));
        serde_json::from_str::<Value>(&contents).expect("file is valid JSON after append");
    }

    #[tokio::test]
    async fn get_all_accepts_line_delimited_json() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.ndjson");
        tokio::fs::write(&path, "{\"a\":1}\n{\"a\":2}\n").await.unwrap();
        let store = JsonStore::open(&path, 2).await.unwrap();
        let mut all = store.get_all().await.unwrap();
        let mut values = Vec::new();
        while let Some((_, value)) = all.next().await.unwrap() {
            values.push(value);
        }
        assert_eq!(values, vec![json!({"a": 1}), json!({"a": 2})]);
    }

    #[tokio::test]
    async fn invalid_tail_reports_invalid_format() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        tokio::fs::write(&path, "invalid").await.unwrap();
        let store = JsonStore::open(&path, 2).await.unwrap();
        let err = store.get_append_position().await.unwrap_err();
        assert!(matches!(err, Error::InvalidFormat { .. }));
    }

    #[tokio::test]
    async fn get_returns_byte_range_and_value() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("data.json");
        let store = JsonStore::create(&path, 2, &[]).await.unwrap();
        let (start, _) = store.append(&json!({"a": 1}), None).await.unwrap();
        let scanned = store.get(start).await.unwrap();
        assert_eq!(scanned.value.unwrap(), json!({"a": 1}));
    }
}
