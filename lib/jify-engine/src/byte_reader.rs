//! Random-access, bidirectional, UTF-8 aware streaming reader over a
//! [`File`], per spec §4.1.
//!
//! [`ByteReader`] is pull-based: each [`ByteReader::next`] call decodes and
//! returns exactly one `(byte_offset, char)` pair and only then advances
//! its cursor. A caller that stops polling mid-stream (drops the reader,
//! or simply never calls `next` again) leaves no partially-consumed
//! character behind — the item it never accepted was never "used up". This
//! is what spec §9's open question about at-least-once delivery resolves
//! to when the reader is modeled as pull rather than push.

use crate::error::{Error, Result};
use crate::file::File;

const CHUNK_SIZE: usize = 8192;
/// Longest a single UTF-8 encoded scalar value can be.
const MAX_CHAR_LEN: usize = 4;

/// Streams `(byte_offset, char)` pairs forward or backward from a [`File`].
pub struct ByteReader<'a> {
    file: &'a File,
    reverse: bool,
    file_len: u64,
    /// Forward: offset of the next unread byte.
    /// Reverse: exclusive upper bound of the not-yet-yielded region.
    cursor: u64,
    buf: Vec<u8>,
    /// File offset corresponding to `buf[0]`.
    buf_start: u64,
    done: bool,
}

impl<'a> ByteReader<'a> {
    /// Starts reading `file` at `position`. A negative `position` is
    /// interpreted as an offset from end-of-file (`-1` is the last byte).
    pub async fn new(file: &'a File, position: i64, reverse: bool) -> Result<ByteReader<'a>> {
        let file_len = file.stat().await?.len;
        let start = if position < 0 {
            file_len.saturating_sub((-position) as u64)
        } else {
            (position as u64).min(file_len)
        };
        // In reverse mode the cursor tracks the exclusive upper bound of the
        // not-yet-yielded region, so the byte at `start` itself is still
        // included in what gets read.
        let cursor = if reverse {
            (start + 1).min(file_len)
        } else {
            start
        };
        Ok(ByteReader {
            file,
            reverse,
            file_len,
            cursor,
            buf: Vec::new(),
            buf_start: 0,
            done: false,
        })
    }

    /// Returns the next `(byte_offset, char)` pair in stream order, or
    /// `None` once the file boundary in the reading direction is reached.
    pub async fn next(&mut self) -> Result<Option<(u64, char)>> {
        if self.done {
            return Ok(None);
        }
        if self.reverse {
            self.next_reverse().await
        } else {
            self.next_forward().await
        }
    }

    async fn next_forward(&mut self) -> Result<Option<(u64, char)>> {
        if self.cursor >= self.file_len {
            self.done = true;
            return Ok(None);
        }
        self.ensure_forward(self.cursor).await?;
        let idx = (self.cursor - self.buf_start) as usize;
        let available = self.buf.len() - idx;
        let width = utf8_char_width(self.buf[idx]).min(available);
        let ch = decode_char(&self.buf[idx..idx + width], self.file.path())?;
        let offset = self.cursor;
        self.cursor += width as u64;
        Ok(Some((offset, ch)))
    }

    async fn next_reverse(&mut self) -> Result<Option<(u64, char)>> {
        if self.cursor == 0 {
            self.done = true;
            return Ok(None);
        }
        self.ensure_reverse(self.cursor).await?;
        let end_idx = (self.cursor - self.buf_start) as usize;
        // Walk back over UTF-8 continuation bytes (`10xxxxxx`) to find the
        // start of the character ending at `end_idx`.
        let mut start_idx = end_idx - 1;
        while start_idx > 0 && self.buf[start_idx] & 0xC0 == 0x80 && end_idx - start_idx < MAX_CHAR_LEN {
            start_idx -= 1;
        }
        let ch = decode_char(&self.buf[start_idx..end_idx], self.file.path())?;
        let offset = self.buf_start + start_idx as u64;
        self.cursor = offset;
        Ok(Some((offset, ch)))
    }

    /// Ensures the buffer covers at least `[position, position + MAX_CHAR_LEN)`,
    /// refilling from the file if it doesn't.
    async fn ensure_forward(&mut self, position: u64) -> Result<()> {
        let covers = position >= self.buf_start
            && position + MAX_CHAR_LEN as u64 <= self.buf_start + self.buf.len() as u64;
        let at_eof = self.buf_start + self.buf.len() as u64 >= self.file_len;
        if covers || (at_eof && position < self.buf_start + self.buf.len() as u64) {
            return Ok(());
        }
        let read_len = (CHUNK_SIZE as u64).min(self.file_len - position) as usize;
        let mut buf = vec![0u8; read_len];
        let n = self.file.read(&mut buf, position).await?;
        buf.truncate(n);
        self.buf = buf;
        self.buf_start = position;
        Ok(())
    }

    /// Ensures the buffer covers at least `[position - CHUNK_SIZE, position)`
    /// clipped to the start of the file.
    async fn ensure_reverse(&mut self, position: u64) -> Result<()> {
        let covers = self.buf_start < position
            && position <= self.buf_start + self.buf.len() as u64
            && (self.buf_start == 0 || position - self.buf_start >= MAX_CHAR_LEN as u64);
        if covers {
            return Ok(());
        }
        let start = position.saturating_sub(CHUNK_SIZE as u64);
        let read_len = (position - start) as usize;
        let mut buf = vec![0u8; read_len];
        let n = self.file.read(&mut buf, start).await?;
        buf.truncate(n);
        self.buf = buf;
        self.buf_start = start;
        Ok(())
    }
}

fn utf8_char_width(byte: u8) -> usize {
    if byte & 0x80 == 0 {
        1
    } else if byte & 0xE0 == 0xC0 {
        2
    } else if byte & 0xF0 == 0xE0 {
        3
    } else if byte & 0xF8 == 0xF0 {
        4
    } else {
        // Stray continuation byte; treat as a single invalid-but-consumed
        // byte rather than looping forever.
        1
    }
}

fn decode_char(bytes: &[u8], path: &std::path::Path) -> Result<char> {
    std::str::from_utf8(bytes)
        .ok()
        .and_then(|s| s.chars().next())
        .ok_or_else(|| Error::invalid_format(path, "invalid UTF-8 sequence"))
}
