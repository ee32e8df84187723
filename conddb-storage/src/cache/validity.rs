//! Validity cache implementation.

use super::{CacheKey, CacheStats};
use conddb_core::{
    ancestors, join_path, node_name, parent_path, ChannelId, ChildNodes, CondObject, ConditionData,
    Iov, Payload, ValidityKey,
};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicU64, Ordering};

/// One cached payload with its interval of validity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub path: String,
    pub channel: ChannelId,
    pub iov: Iov,
    pub description: String,
    pub payload: Payload,
}

impl CacheEntry {
    pub fn new(
        path: impl Into<String>,
        channel: ChannelId,
        iov: Iov,
        description: impl Into<String>,
        payload: Payload,
    ) -> Self {
        Self {
            path: path.into(),
            channel,
            iov,
            description: description.into(),
            payload,
        }
    }

    pub fn since(&self) -> ValidityKey {
        self.iov.since()
    }

    pub fn until(&self) -> ValidityKey {
        self.iov.until()
    }

    pub fn key(&self) -> CacheKey {
        CacheKey::new(self.path.clone(), self.channel)
    }
}

impl From<CacheEntry> for ConditionData {
    fn from(entry: CacheEntry) -> Self {
        ConditionData {
            payload: entry.payload,
            description: entry.description,
            iov: entry.iov,
            channel: entry.channel,
        }
    }
}

/// Node registered in the cache, used to answer structure queries when
/// running without a database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CachedNode {
    Folder {
        description: String,
        channel_names: BTreeMap<String, ChannelId>,
    },
    FolderSet,
}

impl CachedNode {
    pub fn is_folder(&self) -> bool {
        matches!(self, CachedNode::Folder { .. })
    }
}

#[derive(Debug, Clone)]
struct Slot {
    seq: u64,
    entry: CacheEntry,
}

/// Time-indexed cache with two-watermark eviction by insertion order.
#[derive(Debug)]
pub struct ValidityCache {
    nodes: BTreeMap<String, CachedNode>,
    /// Per key, entries ordered by `since`; intervals never intersect.
    entries: BTreeMap<CacheKey, BTreeMap<ValidityKey, Slot>>,
    /// Insertion sequence -> location, oldest first.
    insertion_order: BTreeMap<u64, (CacheKey, ValidityKey)>,
    next_seq: u64,
    /// Bumped by every `clear`.
    generation: u64,
    low_level: usize,
    high_level: usize,
    hits: AtomicU64,
    misses: AtomicU64,
    insertions: u64,
    replaced: u64,
    evictions: u64,
}

impl ValidityCache {
    /// Create an empty cache. `low_level` is clamped to `high_level`.
    pub fn new(low_level: usize, high_level: usize) -> Self {
        Self {
            nodes: BTreeMap::new(),
            entries: BTreeMap::new(),
            insertion_order: BTreeMap::new(),
            next_seq: 0,
            generation: 0,
            low_level: low_level.min(high_level),
            high_level,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            insertions: 0,
            replaced: 0,
            evictions: 0,
        }
    }

    pub fn low_level(&self) -> usize {
        self.low_level
    }

    pub fn high_level(&self) -> usize {
        self.high_level
    }

    /// Total number of stored entries across all keys.
    pub fn len(&self) -> usize {
        self.insertion_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.insertion_order.is_empty()
    }

    /// Number of times the cache has been cleared. Anything fetched under an
    /// older generation must not be inserted.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    // ------------------------------------------------------------------
    // Node registry
    // ------------------------------------------------------------------

    /// Register a folder. Missing parents are registered as folder sets.
    ///
    /// Returns `false` if the path (or one of its parents) is already
    /// registered with the other kind. Re-registering a folder keeps its
    /// channel names and updates the description.
    pub fn add_folder(&mut self, path: &str, description: &str) -> bool {
        if !self.register_parents(path) {
            return false;
        }
        match self.nodes.get_mut(path) {
            Some(CachedNode::FolderSet) => false,
            Some(CachedNode::Folder {
                description: current,
                ..
            }) => {
                *current = description.to_string();
                true
            }
            None => {
                self.nodes.insert(
                    path.to_string(),
                    CachedNode::Folder {
                        description: description.to_string(),
                        channel_names: BTreeMap::new(),
                    },
                );
                true
            }
        }
    }

    /// Register a folder set (container). Returns `false` if a folder
    /// already lives at this path or above it.
    pub fn add_folder_set(&mut self, path: &str) -> bool {
        if !self.register_parents(path) {
            return false;
        }
        match self.nodes.get(path) {
            Some(CachedNode::Folder { .. }) => false,
            Some(CachedNode::FolderSet) => true,
            None => {
                self.nodes.insert(path.to_string(), CachedNode::FolderSet);
                true
            }
        }
    }

    fn register_parents(&mut self, path: &str) -> bool {
        let parents: Vec<String> = ancestors(path).into_iter().map(str::to_string).collect();
        if parents
            .iter()
            .any(|p| matches!(self.nodes.get(p), Some(CachedNode::Folder { .. })))
        {
            return false;
        }
        for parent in parents {
            self.nodes.entry(parent).or_insert(CachedNode::FolderSet);
        }
        true
    }

    /// Attach a channel alias to a registered folder.
    pub fn add_channel_name(&mut self, path: &str, name: &str, channel: ChannelId) -> bool {
        match self.nodes.get_mut(path) {
            Some(CachedNode::Folder { channel_names, .. }) => {
                channel_names.insert(name.to_string(), channel);
                true
            }
            _ => false,
        }
    }

    pub fn node(&self, path: &str) -> Option<&CachedNode> {
        self.nodes.get(path)
    }

    pub fn has_path(&self, path: &str) -> bool {
        self.nodes.contains_key(path)
    }

    pub fn channel_by_name(&self, path: &str, name: &str) -> Option<ChannelId> {
        match self.nodes.get(path) {
            Some(CachedNode::Folder { channel_names, .. }) => channel_names.get(name).copied(),
            _ => None,
        }
    }

    /// Direct children of a registered folder set.
    pub fn child_nodes(&self, path: &str) -> Option<ChildNodes> {
        if !matches!(self.nodes.get(path), Some(CachedNode::FolderSet)) {
            return None;
        }
        let mut children = ChildNodes::default();
        let prefix = join_path(path, "");
        for (child, node) in self.nodes.range(prefix.clone()..) {
            if !child.starts_with(&prefix) {
                break;
            }
            if parent_path(child) != Some(path) {
                continue;
            }
            let name = node_name(child).to_string();
            match node {
                CachedNode::Folder { .. } => children.leaves.push(name),
                CachedNode::FolderSet => children.containers.push(name),
            }
        }
        Some(children)
    }

    // ------------------------------------------------------------------
    // Lookups
    // ------------------------------------------------------------------

    /// Entry whose interval contains `when`, if any.
    pub fn lookup(&self, path: &str, channel: ChannelId, when: ValidityKey) -> Option<CacheEntry> {
        let found = self
            .entries
            .get(&CacheKey::new(path, channel))
            .and_then(|series| series.range(..=when).next_back())
            .map(|(_, slot)| &slot.entry)
            .filter(|entry| entry.iov.contains(when))
            .cloned();

        match &found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Entries intersecting `window`, ascending by `since`.
    pub fn lookup_range(&self, path: &str, channel: ChannelId, window: &Iov) -> Vec<CacheEntry> {
        let Some(series) = self.entries.get(&CacheKey::new(path, channel)) else {
            return Vec::new();
        };
        let mut found: Vec<CacheEntry> = series
            .range(..window.until())
            .rev()
            .take_while(|(_, slot)| slot.entry.iov.intersects(window))
            .map(|(_, slot)| slot.entry.clone())
            .collect();
        found.reverse();
        found
    }

    // ------------------------------------------------------------------
    // Insertion and eviction
    // ------------------------------------------------------------------

    /// Insert an entry. Stored entries for the same key that intersect it are
    /// removed (newest wins), then the watermark eviction runs.
    ///
    /// The entry's folder is registered if unknown. Returns `false` without
    /// storing anything if the path is registered as a folder set.
    pub fn insert(&mut self, entry: CacheEntry) -> bool {
        match self.nodes.get(&entry.path) {
            Some(CachedNode::FolderSet) => {
                tracing::warn!(path = %entry.path, "refusing to cache an object on a folder set");
                return false;
            }
            Some(CachedNode::Folder { .. }) => {}
            None => {
                if !self.add_folder(&entry.path, &entry.description) {
                    tracing::warn!(path = %entry.path, "refusing to cache an object below a folder");
                    return false;
                }
            }
        }

        let key = entry.key();
        let removed = self.remove_overlapping(&key, &entry.iov);
        self.replaced += removed as u64;

        let seq = self.next_seq;
        self.next_seq += 1;
        let since = entry.since();
        tracing::debug!(key = %key, iov = %entry.iov, seq, removed, "cache insert");
        self.insertion_order.insert(seq, (key.clone(), since));
        self.entries
            .entry(key)
            .or_default()
            .insert(since, Slot { seq, entry });
        self.insertions += 1;

        self.evict_if_needed();
        true
    }

    /// Insert a backend object, taking the description from the registered
    /// folder. Returns `false` if `path` is not a registered folder.
    pub fn insert_object(&mut self, path: &str, object: CondObject) -> bool {
        let description = match self.nodes.get(path) {
            Some(CachedNode::Folder { description, .. }) => description.clone(),
            _ => return false,
        };
        self.insert(CacheEntry::new(
            path,
            object.channel,
            object.iov,
            description,
            object.payload,
        ))
    }

    fn remove_overlapping(&mut self, key: &CacheKey, iov: &Iov) -> usize {
        let Some(series) = self.entries.get_mut(key) else {
            return 0;
        };
        let doomed: Vec<ValidityKey> = series
            .range(..iov.until())
            .rev()
            .take_while(|(_, slot)| slot.entry.iov.intersects(iov))
            .map(|(since, _)| *since)
            .collect();
        for since in &doomed {
            if let Some(slot) = series.remove(since) {
                self.insertion_order.remove(&slot.seq);
            }
        }
        if series.is_empty() {
            self.entries.remove(key);
        }
        doomed.len()
    }

    /// Drop oldest-inserted entries once the count exceeds the high
    /// watermark, stopping at the low watermark.
    fn evict_if_needed(&mut self) -> usize {
        if self.len() <= self.high_level {
            return 0;
        }
        let mut evicted = 0;
        while self.len() > self.low_level {
            let Some((_, (key, since))) = self.insertion_order.pop_first() else {
                break;
            };
            if let Some(series) = self.entries.get_mut(&key) {
                series.remove(&since);
                if series.is_empty() {
                    self.entries.remove(&key);
                }
            }
            evicted += 1;
        }
        self.evictions += evicted as u64;
        tracing::debug!(
            evicted,
            remaining = self.len(),
            low = self.low_level,
            high = self.high_level,
            "cache eviction"
        );
        evicted
    }

    /// Drop every entry and every registered node. Statistics are kept.
    pub fn clear(&mut self) {
        self.nodes = BTreeMap::new();
        self.entries = BTreeMap::new();
        self.insertion_order = BTreeMap::new();
        self.generation += 1;
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            insertions: self.insertions,
            replaced: self.replaced,
            evictions: self.evictions,
            entry_count: self.len() as u64,
        }
    }

    /// Human-readable listing of nodes and entries, ordered by key then `since`.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "ValidityCache: {} entries (low={}, high={})",
            self.len(),
            self.low_level,
            self.high_level
        );
        for (path, node) in &self.nodes {
            match node {
                CachedNode::FolderSet => {
                    let _ = writeln!(out, "{} (folder set)", path);
                }
                CachedNode::Folder {
                    description,
                    channel_names,
                } => {
                    let _ = writeln!(out, "{} (folder) {:?}", path, description);
                    for (name, channel) in channel_names {
                        let _ = writeln!(out, "  alias {} -> {}", name, channel);
                    }
                }
            }
        }
        for (key, series) in &self.entries {
            let _ = writeln!(out, "{}", key);
            for slot in series.values() {
                let fields: Vec<&str> = slot.entry.payload.fields().map(|(k, _)| k).collect();
                let _ = writeln!(
                    out,
                    "  {} seq={} fields=[{}]",
                    slot.entry.iov,
                    slot.seq,
                    fields.join(",")
                );
            }
        }
        out
    }
}

impl Default for ValidityCache {
    fn default() -> Self {
        Self::new(10, 100)
    }
}

// =============================================================================
// TESTS
// =============================================================================
