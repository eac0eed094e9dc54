//! Skip-list navigation shared by `find` and batch `insert` (spec §4.5.2,
//! §4.5.4).
//!
//! Both operations are "descend from the header, following the forward
//! pointer at each level that doesn't overshoot the target, then act on
//! what's there at level 0." [`Cursor`] holds the one piece of state that
//! differs between a read-only `find` and a mutating `insert` batch: a set
//! of not-yet-flushed entries (`new_entries`) that exist only in memory
//! until the batch is serialized to disk, referenced by [`Link::New`]
//! rather than a real file offset. `find` never populates it, so the two
//! operations share one descent algorithm without find ever seeing a
//! placeholder.

use std::cmp::Ordering;
use std::collections::{HashMap, HashSet};

use rand::Rng;

use crate::entry::{self, IndexEntry, SkipListNode, MAX_HEIGHT};
use crate::error::{Error, Result};
use crate::index::Index;
use crate::predicate::{FieldType, Key, NodeValue, RangePredicate};

/// A forward or `link` pointer as seen mid-batch: either nothing, an
/// offset already on disk, or a not-yet-assigned entry from this batch.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Link {
    None,
    Disk(u64),
    New(usize),
}

impl Link {
    fn of_offset(offset: u64) -> Link {
        if offset == 0 {
            Link::None
        } else {
            Link::Disk(offset)
        }
    }

    /// Resolves every [`Link::New`] placeholder to its final file offset,
    /// computed once the whole batch's layout is known.
    pub fn resolve(self, offsets: &[u64]) -> u64 {
        match self {
            Link::None => 0,
            Link::Disk(offset) => offset,
            Link::New(index) => offsets[index],
        }
    }
}

/// A position the cursor can currently be standing on.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CurPos {
    Header,
    Disk(u64),
    New(usize),
}

impl CurPos {
    fn from_link(link: Link) -> CurPos {
        match link {
            Link::None => panic!("cannot position a cursor on an empty link"),
            Link::Disk(offset) => CurPos::Disk(offset),
            Link::New(index) => CurPos::New(index),
        }
    }
}

/// A cached view of an on-disk entry, read once per batch/find and reused
/// for every subsequent reference to the same offset (spec §4.5.2's
/// "optional read-through cache keyed by entry offset").
struct DiskNode {
    pointer: u64,
    levels: Vec<Link>,
    link: Link,
    value: NodeValue,
    key: Key,
}

/// An entry created during this batch but not yet assigned a file offset.
pub struct PendingEntry {
    pub pointer: u64,
    pub levels: Vec<Link>,
    pub link: Link,
    pub value: NodeValue,
    pub key: Key,
}

pub struct Cursor<'a> {
    index: &'a Index,
    field_type: Option<FieldType>,
    header_next: Vec<Link>,
    disk_cache: HashMap<u64, DiskNode>,
    dirty: HashSet<u64>,
    new_entries: Vec<PendingEntry>,
    rng: rand::rngs::ThreadRng,
}

impl<'a> Cursor<'a> {
    pub fn new(index: &'a Index, field_type: Option<FieldType>, header_levels: &[u64]) -> Self {
        Self {
            index,
            field_type,
            header_next: header_levels.iter().copied().map(Link::of_offset).collect(),
            disk_cache: HashMap::new(),
            dirty: HashSet::new(),
            new_entries: Vec::new(),
            rng: rand::thread_rng(),
        }
    }

    async fn ensure_cached(&mut self, offset: u64) -> Result<()> {
        if self.disk_cache.contains_key(&offset) {
            return Ok(());
        }
        let (_, entry) = self.index.read_entry(offset).await?;
        let key = Key::of(&entry.node.value, self.field_type)?;
        let node = DiskNode {
            pointer: entry.pointer,
            levels: entry.node.levels.iter().copied().map(Link::of_offset).collect(),
            link: Link::of_offset(entry.link),
            value: entry.node.value,
            key,
        };
        self.disk_cache.insert(offset, node);
        Ok(())
    }

    async fn forward(&mut self, pos: CurPos, level: usize) -> Result<Link> {
        match pos {
            CurPos::Header => Ok(self.header_next.get(level).copied().unwrap_or(Link::None)),
            CurPos::Disk(offset) => {
                self.ensure_cached(offset).await?;
                Ok(self.disk_cache[&offset].levels.get(level).copied().unwrap_or(Link::None))
            }
            CurPos::New(index) => Ok(self.new_entries[index].levels.get(level).copied().unwrap_or(Link::None)),
        }
    }

    fn set_forward(&mut self, pos: CurPos, level: usize, target: Link) {
        match pos {
            CurPos::Header => {
                if level >= self.header_next.len() {
                    self.header_next.resize(level + 1, Link::None);
                }
                self.header_next[level] = target;
            }
            CurPos::Disk(offset) => {
                let node = self.disk_cache.get_mut(&offset).expect("forward() populates the cache");
                if level >= node.levels.len() {
                    node.levels.resize(level + 1, Link::None);
                }
                node.levels[level] = target;
                self.dirty.insert(offset);
            }
            CurPos::New(index) => {
                let entry = &mut self.new_entries[index];
                if level >= entry.levels.len() {
                    entry.levels.resize(level + 1, Link::None);
                }
                entry.levels[level] = target;
            }
        }
    }

    async fn key_of(&mut self, pos: CurPos) -> Result<Key> {
        match pos {
            CurPos::Header => unreachable!("the header has no key"),
            CurPos::Disk(offset) => {
                self.ensure_cached(offset).await?;
                Ok(self.disk_cache[&offset].key.clone())
            }
            CurPos::New(index) => Ok(self.new_entries[index].key.clone()),
        }
    }

    async fn pointer_of(&mut self, pos: CurPos) -> Result<u64> {
        match pos {
            CurPos::Header => unreachable!("the header is never a result"),
            CurPos::Disk(offset) => {
                self.ensure_cached(offset).await?;
                Ok(self.disk_cache[&offset].pointer)
            }
            CurPos::New(index) => Ok(self.new_entries[index].pointer),
        }
    }

    async fn link_field(&mut self, pos: CurPos) -> Result<Link> {
        match pos {
            CurPos::Header => unreachable!("the header's link chains to the next field header"),
            CurPos::Disk(offset) => {
                self.ensure_cached(offset).await?;
                Ok(self.disk_cache[&offset].link)
            }
            CurPos::New(index) => Ok(self.new_entries[index].link),
        }
    }

    fn set_link_field(&mut self, pos: CurPos, target: Link) {
        match pos {
            CurPos::Header => unreachable!("addFields updates the header link directly"),
            CurPos::Disk(offset) => {
                self.disk_cache.get_mut(&offset).expect("forward() populates the cache").link = target;
                self.dirty.insert(offset);
            }
            CurPos::New(index) => self.new_entries[index].link = target,
        }
    }

    /// Descends from the top level to 0, following the forward pointer at
    /// each level while `seek(next.value) <= 0`, and returns the resulting
    /// position plus the per-level predecessor snapshot splicing needs
    /// (spec §4.5.2 step 3).
    async fn descend_for_insert(&mut self, target: &Key) -> Result<(CurPos, Vec<CurPos>)> {
        let mut current = CurPos::Header;
        let mut updates = vec![CurPos::Header; MAX_HEIGHT];
        for level in (0..MAX_HEIGHT).rev() {
            loop {
                let next = self.forward(current, level).await?;
                if matches!(next, Link::None) {
                    break;
                }
                let next_pos = CurPos::from_link(next);
                let next_key = self.key_of(next_pos).await?;
                if next_key.cmp(target) != Ordering::Greater {
                    current = next_pos;
                } else {
                    break;
                }
            }
            updates[level] = current;
        }
        Ok((current, updates))
    }

    /// Descends guided by a predicate's `seek` rather than a target key
    /// (spec §4.5.4). Advances only while the next entry is strictly too
    /// small (`seek < 0`), so `current` always lands on the predecessor of
    /// the first candidate rather than on the first match itself —
    /// `find`'s `forward(current, 0)` then starts exactly at that
    /// candidate instead of one past it.
    async fn descend_for_find(&mut self, predicate: &RangePredicate) -> Result<CurPos> {
        let mut current = CurPos::Header;
        let height = self.header_next.len();
        for level in (0..height).rev() {
            loop {
                let next = self.forward(current, level).await?;
                if matches!(next, Link::None) {
                    break;
                }
                let next_pos = CurPos::from_link(next);
                let next_key = self.key_of(next_pos).await?;
                if predicate.seek(&next_key) < 0 {
                    current = next_pos;
                } else {
                    break;
                }
            }
        }
        Ok(current)
    }

    /// Splices one new value into the skip list, or appends it to the
    /// duplicate chain of an existing entry with an equal value (spec
    /// §4.5.2 step 3).
    pub async fn insert(&mut self, value: NodeValue, key: Key, pointer: u64) -> Result<()> {
        let (current, updates) = self.descend_for_insert(&key).await?;
        let is_duplicate = !matches!(current, CurPos::Header) && self.key_of(current).await? == key;
        let index = self.new_entries.len();

        if is_duplicate {
            let old_link = self.link_field(current).await?;
            self.new_entries.push(PendingEntry {
                pointer,
                levels: Vec::new(),
                link: old_link,
                value,
                key,
            });
            self.set_link_field(current, Link::New(index));
        } else {
            let current_height = self
                .header_next
                .iter()
                .take_while(|link| !matches!(link, Link::None))
                .count()
                .max(1);
            let cap = current_height.saturating_sub(1).min(MAX_HEIGHT - 1);
            let level = random_level(&mut self.rng, cap);

            let mut levels = Vec::with_capacity(level + 1);
            for lvl in 0..=level {
                let predecessor = updates[lvl];
                levels.push(self.forward(predecessor, lvl).await?);
            }
            self.new_entries.push(PendingEntry { pointer, levels, link: Link::None, value, key });
            for lvl in 0..=level {
                self.set_forward(updates[lvl], lvl, Link::New(index));
            }
        }
        Ok(())
    }

    /// Walks the level-0 chain from the descent result, collecting every
    /// matching entry's record pointer and every duplicate reachable
    /// through its `link` chain (spec §4.5.4).
    pub async fn find(&mut self, predicate: &RangePredicate) -> Result<Vec<u64>> {
        let current = self.descend_for_find(predicate).await?;
        let mut results = Vec::new();
        let mut next = self.forward(current, 0).await?;
        let mut matching_started = false;
        while let Link::Disk(offset) = next {
            let pos = CurPos::Disk(offset);
            let key = self.key_of(pos).await?;
            if predicate.matches(&key) {
                matching_started = true;
                results.push(self.pointer_of(pos).await?);
                let mut link = self.link_field(pos).await?;
                while let Link::Disk(dup_offset) = link {
                    let dup_pos = CurPos::Disk(dup_offset);
                    results.push(self.pointer_of(dup_pos).await?);
                    link = self.link_field(dup_pos).await?;
                }
            } else if matching_started {
                break;
            }
            next = self.forward(pos, 0).await?;
        }
        Ok(results)
    }

    /// Serializes every new entry created this batch, given the absolute
    /// file offset the batch will be appended at. Because every numeric
    /// field in the payload format is fixed-width, an entry's serialized
    /// length never depends on what it points to — so a first pass with
    /// zeroed placeholders yields the real lengths, and therefore the real
    /// offsets, before a second pass bakes them in (spec §4.5.2 steps 3-4,
    /// "negative placeholder offsets").
    pub fn serialize(&self, label: &str, base: u64) -> Result<(Vec<u8>, Vec<u64>)> {
        let placeholders = vec![0u64; self.new_entries.len()];
        let draft = self.render(label, &placeholders)?;

        let mut offsets = Vec::with_capacity(self.new_entries.len());
        let mut position = base;
        for (i, rendered) in draft.iter().enumerate() {
            offsets.push(position);
            position += rendered.len() as u64;
            if i + 1 < draft.len() {
                position += 2; // ",\n" between entries sharing this append
            }
        }

        let finished = self.render(label, &offsets)?;
        Ok((finished.join(",\n").into_bytes(), offsets))
    }

    fn render(&self, label: &str, offsets: &[u64]) -> Result<Vec<String>> {
        self.new_entries
            .iter()
            .map(|pending| {
                let entry = IndexEntry {
                    position: 0,
                    pointer: pending.pointer,
                    link: pending.link.resolve(offsets),
                    node: SkipListNode {
                        levels: pending.levels.iter().map(|l| l.resolve(offsets)).collect(),
                        value: pending.value.clone(),
                    },
                };
                serde_json::to_string(&entry::entry_to_json(label, &entry)?)
                    .map_err(|source| Error::invalid_format("<index entry>", source.to_string()))
            })
            .collect()
    }

    /// The header's resolved forward pointers, for the caller to rewrite
    /// in place once offsets are known.
    pub fn header_levels(&self, offsets: &[u64]) -> Vec<u64> {
        self.header_next.iter().map(|l| l.resolve(offsets)).collect()
    }

    /// Every on-disk entry whose forward pointers or `link` changed this
    /// batch, resolved and ready to rewrite in place.
    pub fn dirty_entries(&self, offsets: &[u64]) -> Vec<IndexEntry> {
        self.dirty
            .iter()
            .map(|&offset| {
                let node = &self.disk_cache[&offset];
                IndexEntry {
                    position: offset,
                    pointer: node.pointer,
                    link: node.link.resolve(offsets),
                    node: SkipListNode {
                        levels: node.levels.iter().map(|l| l.resolve(offsets)).collect(),
                        value: node.value.clone(),
                    },
                }
            })
            .collect()
    }
}

fn random_level(rng: &mut impl Rng, cap: usize) -> usize {
    let mut level = 0;
    while level < cap && rng.gen_bool(0.5) {
        level += 1;
    }
    level
}
