//! Owns a single file handle and exposes random-access read/write plus
//! advisory byte-range locking, reentrant within this process.
//!
//! Per spec §5, each on-disk file has exactly one in-process owner: the
//! [`File`] that opened it. All positional I/O is serialized through that
//! owner's handle; concurrent callers are ordered by the lock manager below
//! rather than by racing on the underlying file descriptor.

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use fs2::FileExt;
use snafu::ResultExt;
use tokio::fs::OpenOptions;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};

use crate::error::{self, Error, Result};

/// Metadata relevant to index-outdatedness checks (spec §3/§9).
#[derive(Debug, Clone, Copy)]
pub struct Stat {
    pub len: u64,
    pub mtime: SystemTime,
}

/// A waiter for a position lock: whether it wants exclusive access, and the
/// notifier it will be woken on once it reaches the front of the queue.
struct Waiter {
    exclusive: bool,
    notify: Arc<Notify>,
}

#[derive(Default)]
struct LockSlot {
    shared: u32,
    exclusive: bool,
    waiters: VecDeque<Waiter>,
}

impl LockSlot {
    fn is_free(&self) -> bool {
        self.shared == 0 && !self.exclusive
    }
}

/// Reentrant, FIFO, byte-position advisory lock table, local to this
/// process. Positions are arbitrary `u64`s: `0` is used by [`crate::store`]
/// as the file-wide write lock, other positions are per-field-header
/// offsets in the index file (spec §4.2).
#[derive(Default)]
struct LockTable {
    slots: Mutex<HashMap<u64, LockSlot>>,
}

impl LockTable {
    async fn lock(&self, position: u64, exclusive: bool) {
        let notify = {
            let mut slots = self.slots.lock().await;
            let slot = slots.entry(position).or_default();
            if slot.waiters.is_empty() && Self::compatible(slot, exclusive) {
                Self::grant(slot, exclusive);
                return;
            }
            let notify = Arc::new(Notify::new());
            slot.waiters.push_back(Waiter {
                exclusive,
                notify: Arc::clone(&notify),
            });
            notify
        };
        notify.notified().await;
        // We were woken because `unlock` determined it was our turn and
        // already granted us the slot; nothing left to do.
    }

    fn compatible(slot: &LockSlot, exclusive: bool) -> bool {
        if exclusive {
            slot.is_free()
        } else {
            !slot.exclusive
        }
    }

    fn grant(slot: &mut LockSlot, exclusive: bool) {
        if exclusive {
            slot.exclusive = true;
        } else {
            slot.shared += 1;
        }
    }

    async fn unlock(&self, position: u64, exclusive: bool) {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(&position) else {
            return;
        };
        if exclusive {
            slot.exclusive = false;
        } else {
            slot.shared = slot.shared.saturating_sub(1);
        }
        if !slot.is_free() {
            return;
        }
        // Wake the next waiter in FIFO order. If it wants a shared lock,
        // grant it and keep waking subsequent shared waiters too, so shared
        // holders are coalesced the way spec §4.2 describes.
        while let Some(front) = slot.waiters.front() {
            if front.exclusive && slot.shared > 0 {
                break;
            }
            let waiter = slot.waiters.pop_front().expect("front just checked");
            Self::grant(slot, waiter.exclusive);
            waiter.notify.notify_one();
            if waiter.exclusive {
                break;
            }
        }
        if slots
            .get(&position)
            .is_some_and(|s| s.is_free() && s.waiters.is_empty())
        {
            slots.remove(&position);
        }
    }
}

/// A guard that releases its held position lock on drop.
///
/// Dropping an unawaited guard (a cancelled future) leaves no state change
/// beyond the release itself: the lock is simply handed to the next waiter,
/// per spec §5's cancellation guarantee.
pub struct LockGuard<'a> {
    file: &'a File,
    position: u64,
    exclusive: bool,
    released: bool,
}

impl<'a> LockGuard<'a> {
    pub async fn unlock(mut self) {
        self.file.lock_table.unlock(self.position, self.exclusive).await;
        self.released = true;
    }
}

impl Drop for LockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            // Best-effort synchronous release; readers/writers should
            // prefer the async `unlock` method, but a panicking caller must
            // not leave the slot wedged.
            let table = &self.file.lock_table;
            let position = self.position;
            let exclusive = self.exclusive;
            tokio::spawn(async move {
                table.unlock(position, exclusive).await;
            });
        }
    }
}

/// Random-access file handle with advisory locking.
///
/// All positional reads/writes go through a single `tokio::fs::File`
/// serialized behind a mutex, matching the single-owner model of spec §5.
pub struct File {
    path: PathBuf,
    handle: Mutex<tokio::fs::File>,
    lock_table: LockTable,
    /// A whole-file OS-advisory lock, held for the lifetime of the process
    /// that opened this handle. This backstops the in-process lock table
    /// against other *processes* racing on the same file, the way
    /// `fs2`-based engines in the wider ecosystem do; it is acquired
    /// shared and only escalated while an exclusive position-0 lock is
    /// actually held.
    os_lock: std::fs::File,
}

impl File {
    /// Opens `path` for reading and writing, creating it if necessary.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let handle = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)
            .await
            .context(error::IoSnafu { path: path.clone() })?;
        let os_lock = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|source| Error::io(path.clone(), source))?;
        Ok(Self {
            path,
            handle: Mutex::new(handle),
            lock_table: LockTable::default(),
            os_lock,
        })
    }

    /// Creates `path` exclusively, failing with [`Error::AlreadyExists`] if
    /// it already exists.
    pub async fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
            .await
            .map_err(|source| {
                if source.kind() == std::io::ErrorKind::AlreadyExists {
                    Error::AlreadyExists { path: path.clone() }
                } else {
                    Error::io(path.clone(), source)
                }
            })?;
        Self::open(&path).await
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn stat(&self) -> Result<Stat> {
        let handle = self.handle.lock().await;
        let metadata = handle
            .metadata()
            .await
            .context(error::IoSnafu { path: self.path.clone() })?;
        Ok(Stat {
            len: metadata.len(),
            mtime: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        })
    }

    /// Reads up to `buf.len()` bytes starting at `position`, returning the
    /// number of bytes actually read (short on EOF).
    pub async fn read(&self, buf: &mut [u8], position: u64) -> Result<usize> {
        let mut handle = self.handle.lock().await;
        handle
            .seek(std::io::SeekFrom::Start(position))
            .await
            .context(error::IoSnafu { path: self.path.clone() })?;
        let mut read = 0;
        while read < buf.len() {
            let n = handle
                .read(&mut buf[read..])
                .await
                .context(error::IoSnafu { path: self.path.clone() })?;
            if n == 0 {
                break;
            }
            read += n;
        }
        Ok(read)
    }

    /// Writes `buf` at `position`, extending the file if needed.
    pub async fn write(&self, buf: &[u8], position: u64) -> Result<()> {
        let mut handle = self.handle.lock().await;
        handle
            .seek(std::io::SeekFrom::Start(position))
            .await
            .context(error::IoSnafu { path: self.path.clone() })?;
        handle
            .write_all(buf)
            .await
            .context(error::IoSnafu { path: self.path.clone() })?;
        handle
            .flush()
            .await
            .context(error::IoSnafu { path: self.path.clone() })
    }

    /// Appends `text` at the current end of file.
    pub async fn append(&self, text: &[u8]) -> Result<()> {
        let mut handle = self.handle.lock().await;
        handle
            .seek(std::io::SeekFrom::End(0))
            .await
            .context(error::IoSnafu { path: self.path.clone() })?;
        handle
            .write_all(text)
            .await
            .context(error::IoSnafu { path: self.path.clone() })?;
        handle
            .flush()
            .await
            .context(error::IoSnafu { path: self.path.clone() })
    }

    pub async fn truncate(&self, position: u64) -> Result<()> {
        let handle = self.handle.lock().await;
        handle
            .set_len(position)
            .await
            .context(error::IoSnafu { path: self.path.clone() })
    }

    /// Removes the file from disk. Does not consume `self`: the handle
    /// this `File` already opened stays valid (POSIX unlink semantics)
    /// until this struct is dropped, which is what lets a caller
    /// destroy-then-recreate a store without juggling ownership.
    pub async fn delete(&self) -> Result<()> {
        tokio::fs::remove_file(&self.path)
            .await
            .context(error::IoSnafu { path: self.path.clone() })
    }

    /// Blocks until the byte at `position` is locked under the requested
    /// mode (spec §4.2). Returns a guard that releases the lock when
    /// dropped or explicitly [`LockGuard::unlock`]ed.
    pub async fn lock(&self, position: u64, exclusive: bool) -> LockGuard<'_> {
        if position == 0 && exclusive {
            // Best-effort cross-process backstop: nothing else in this
            // process contends for the OS lock, so this never blocks on
            // itself; it only matters if another process holds it.
            let _ = self.os_lock.lock_exclusive();
        }
        self.lock_table.lock(position, exclusive).await;
        LockGuard {
            file: self,
            position,
            exclusive,
            released: false,
        }
    }
}

impl Drop for File {
    fn drop(&mut self) {
        let _ = self.os_lock.unlock();
    }
}
