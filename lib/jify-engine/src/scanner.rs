//! Locates the exact byte range of a JSON value inside an array on disk,
//! and optionally parses it (spec §4.3).
//!
//! The scanner is handed a position "at or before" a value — typically
//! just past the previous element's trailing comma — and walks forward
//! one codepoint at a time via [`ByteReader`], tracking string/escape and
//! nesting state. It never looks at more of the file than the one value it
//! is scanning, which is what lets [`crate::store::JsonStore::get_all`]
//! chain scans back-to-back to iterate the whole array without holding
//! more than one element in memory at a time.

use serde_json::Value;

use crate::byte_reader::ByteReader;
use crate::error::{Error, Result};
use crate::file::File;

/// The byte range (and, optionally, parsed value) of one scanned element.
#[derive(Debug, Clone)]
pub struct Scanned {
    pub start: u64,
    pub length: u64,
    pub value: Option<Value>,
}

/// Scans the JSON value at or after `position`, returning its byte range
/// and, if `parse` is true, its decoded value.
pub async fn scan(file: &File, position: u64, parse: bool) -> Result<Scanned> {
    let mut reader = ByteReader::new(file, position as i64, false).await?;

    let (start, first) = skip_to_value(&mut reader, file).await?;
    let mut collected = parse.then(Vec::new);
    if let Some(buf) = collected.as_mut() {
        push_char(buf, first);
    }

    let length = match first {
        '{' | '[' => scan_composite(&mut reader, file, first, start, collected.as_mut()).await?,
        '"' => scan_string(&mut reader, file, start, collected.as_mut()).await?,
        _ => scan_primitive(&mut reader, start, first, collected.as_mut()).await?,
    };

    let value = match collected {
        Some(bytes) => Some(serde_json::from_slice(&bytes).map_err(|source| {
            Error::invalid_format(
                file.path(),
                format!("element at {start} did not parse as JSON: {source}"),
            )
        })?),
        None => None,
    };

    Ok(Scanned { start, length, value })
}

/// Skips whitespace and array-separator commas, returning the offset and
/// first character of the value that follows.
async fn skip_to_value(reader: &mut ByteReader<'_>, file: &File) -> Result<(u64, char)> {
    loop {
        match reader.next().await? {
            Some((_, ch)) if ch.is_whitespace() || ch == ',' => continue,
            Some((offset, ch)) => return Ok((offset, ch)),
            None => {
                return Err(Error::invalid_format(
                    file.path(),
                    "reached end of file while looking for a value",
                ))
            }
        }
    }
}

async fn scan_composite(
    reader: &mut ByteReader<'_>,
    file: &File,
    open: char,
    start: u64,
    mut collected: Option<&mut Vec<u8>>,
) -> Result<u64> {
    let close = if open == '{' { '}' } else { ']' };
    let mut depth: u32 = 1;
    let mut in_string = false;
    let mut escaping = false;
    loop {
        let (offset, ch) = reader.next().await?.ok_or_else(|| {
            Error::invalid_format(file.path(), format!("unterminated value starting at {start}"))
        })?;
        if let Some(buf) = collected.as_deref_mut() {
            push_char(buf, ch);
        }
        if in_string {
            if escaping {
                escaping = false;
            } else if ch == '\\' {
                escaping = true;
            } else if ch == '"' {
                in_string = false;
            }
            continue;
        }
        match ch {
            '"' => in_string = true,
            c if c == open => depth += 1,
            c if c == close => {
                depth -= 1;
                if depth == 0 {
                    return Ok(offset + ch.len_utf8() as u64 - start);
                }
            }
            _ => {}
        }
    }
}

async fn scan_string(
    reader: &mut ByteReader<'_>,
    file: &File,
    start: u64,
    mut collected: Option<&mut Vec<u8>>,
) -> Result<u64> {
    let mut escaping = false;
    loop {
        let (offset, ch) = reader.next().await?.ok_or_else(|| {
            Error::invalid_format(file.path(), format!("unterminated string starting at {start}"))
        })?;
        if let Some(buf) = collected.as_deref_mut() {
            push_char(buf, ch);
        }
        if escaping {
            escaping = false;
        } else if ch == '\\' {
            escaping = true;
        } else if ch == '"' {
            return Ok(offset + 1 - start);
        }
    }
}

/// Scans a bare primitive (number, `true`, `false`, `null`). The
/// terminator (whitespace, `,`, `}`, `]`, or EOF) ends the value but is not
/// counted as part of its length.
async fn scan_primitive(
    reader: &mut ByteReader<'_>,
    start: u64,
    first: char,
    mut collected: Option<&mut Vec<u8>>,
) -> Result<u64> {
    let mut end = start + first.len_utf8() as u64;
    loop {
        match reader.next().await? {
            None => break,
            Some((offset, ch)) if ch.is_whitespace() || matches!(ch, ',' | '}' | ']') => {
                let _ = offset;
                break;
            }
            Some((offset, ch)) => {
                if let Some(buf) = collected.as_deref_mut() {
                    push_char(buf, ch);
                }
                end = offset + ch.len_utf8() as u64;
            }
        }
    }
    Ok(end - start)
}

fn push_char(buf: &mut Vec<u8>, ch: char) {
    let mut tmp = [0u8; 4];
    buf.extend_from_slice(ch.encode_utf8(&mut tmp).as_bytes());
}
