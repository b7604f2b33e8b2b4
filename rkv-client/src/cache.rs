//! # Local Cache
//!
//! Purpose: Keep values read under server-assisted tracking close to the
//! caller, and drop them when the server reports the key as changed.
//!
//! ## Design Principles
//! 1. **Sharded Locks**: Per-shard locks reduce contention under concurrency.
//! 2. **Byte-Based LRU**: Evict by total key+value bytes to bound memory.
//! 3. **Shared Buffers**: Values are `Bytes`, so hits are reference-count bumps.
//! 4. **Server Is Authoritative**: an invalidation for a key always wins; a
//!    nil invalidation flushes everything.
//!
//! ## Structure Overview
//!
//! ```text
//! LocalCache
//!   └── shards: Vec<Shard>
//!         └── inner: RwLock<ShardInner>
//!               ├── map: HashMap<Bytes, usize>
//!               ├── nodes: Vec<Option<Node>>
//!               ├── free: Vec<usize>
//!               └── head/tail: LRU indices
//! ```

use std::hash::{BuildHasher, Hasher};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use ahash::RandomState;
use bytes::Bytes;
use hashbrown::HashMap;
use parking_lot::RwLock;
use tracing::debug;

use rkv_common::Reply;

use crate::connection::{ConnectionId, PushHandler};

const DEFAULT_SHARD_COUNT: usize = 16;

/// Channel carrying invalidations on RESP2 redirect connections.
pub const INVALIDATE_CHANNEL: &[u8] = b"__redis__:invalidate";

/// A decoded invalidation message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Invalidation {
    Keys(Vec<Bytes>),
    /// Nil key list: every cached entry is stale.
    Flush,
}

impl Invalidation {
    /// Recognizes `["invalidate", keys | nil]` (RESP3 push) and
    /// `["message", "__redis__:invalidate", keys | nil]` (RESP2 pub/sub).
    pub fn from_push(items: &[Reply]) -> Option<Invalidation> {
        let payload = match items {
            [kind, payload] if text_eq(kind, b"invalidate") => payload,
            [kind, channel, payload]
                if text_eq(kind, b"message") && text_eq(channel, INVALIDATE_CHANNEL) =>
            {
                payload
            }
            _ => return None,
        };

        match payload {
            Reply::Nil => Some(Invalidation::Flush),
            Reply::Array(keys) | Reply::Set(keys) => {
                let keys = keys
                    .iter()
                    .filter_map(|key| key.as_bytes().map(Bytes::copy_from_slice))
                    .collect();
                Some(Invalidation::Keys(keys))
            }
            _ => None,
        }
    }
}

fn text_eq(reply: &Reply, expected: &[u8]) -> bool {
    reply
        .as_bytes()
        .map(|text| text.eq_ignore_ascii_case(expected))
        .unwrap_or(false)
}

#[derive(Debug)]
struct Node {
    key: Bytes,
    value: Bytes,
    size: usize,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
struct ShardInner {
    map: HashMap<Bytes, usize, RandomState>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    /// Oldest entry.
    head: Option<usize>,
    /// Most recently used entry.
    tail: Option<usize>,
}

impl ShardInner {
    fn new(hash_state: RandomState) -> Self {
        ShardInner {
            map: HashMap::with_hasher(hash_state),
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
        }
    }

    fn lru_remove(&mut self, idx: usize) {
        let (prev, next) = match self.nodes[idx].as_ref() {
            Some(node) => (node.prev, node.next),
            None => return,
        };

        match prev {
            Some(prev_idx) => {
                if let Some(prev_node) = self.nodes[prev_idx].as_mut() {
                    prev_node.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(next_idx) => {
                if let Some(next_node) = self.nodes[next_idx].as_mut() {
                    next_node.prev = prev;
                }
            }
            None => self.tail = prev,
        }

        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = None;
            node.next = None;
        }
    }

    fn lru_push_back(&mut self, idx: usize) {
        let tail = self.tail;
        if let Some(node) = self.nodes[idx].as_mut() {
            node.prev = tail;
            node.next = None;
        }
        match tail {
            Some(tail_idx) => {
                if let Some(tail_node) = self.nodes[tail_idx].as_mut() {
                    tail_node.next = Some(idx);
                }
            }
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn touch(&mut self, idx: usize) {
        if self.tail == Some(idx) {
            return;
        }
        self.lru_remove(idx);
        self.lru_push_back(idx);
    }

    fn insert_new(&mut self, key: Bytes, value: Bytes, size: usize) {
        let idx = match self.free.pop() {
            Some(idx) => idx,
            None => {
                self.nodes.push(None);
                self.nodes.len() - 1
            }
        };
        self.nodes[idx] = Some(Node {
            key: key.clone(),
            value,
            size,
            prev: None,
            next: None,
        });
        self.lru_push_back(idx);
        self.map.insert(key, idx);
    }

    /// Removes a node and returns its byte size.
    fn remove_idx(&mut self, idx: usize) -> Option<usize> {
        let (key, size) = {
            let node = self.nodes[idx].as_ref()?;
            (node.key.clone(), node.size)
        };
        self.lru_remove(idx);
        self.nodes[idx] = None;
        self.map.remove(&key);
        self.free.push(idx);
        Some(size)
    }

    fn pop_lru(&mut self) -> Option<usize> {
        let idx = self.head?;
        self.remove_idx(idx)
    }

    fn clear(&mut self) -> usize {
        let freed = self.nodes.iter().flatten().map(|node| node.size).sum();
        self.map.clear();
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        freed
    }
}

#[derive(Debug)]
struct Shard {
    inner: RwLock<ShardInner>,
}

/// Hit/miss counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub invalidations: u64,
    pub entries: usize,
    pub used_bytes: usize,
}

/// Sharded, byte-bounded LRU of tracked values.
#[derive(Debug)]
pub struct LocalCache {
    shards: Vec<Shard>,
    shard_mask: usize,
    hash_state: RandomState,
    max_bytes: usize,
    used_bytes: AtomicUsize,
    eviction_cursor: AtomicUsize,
    hits: AtomicU64,
    misses: AtomicU64,
    invalidations: AtomicU64,
}

impl LocalCache {
    pub fn new(max_bytes: usize) -> Self {
        Self::with_shards(DEFAULT_SHARD_COUNT, max_bytes)
    }

    /// The shard count is rounded up to a power of two.
    pub fn with_shards(shards: usize, max_bytes: usize) -> Self {
        let shard_count = shards.max(1).next_power_of_two();
        let hash_state = RandomState::new();
        let shards = (0..shard_count)
            .map(|_| Shard {
                inner: RwLock::new(ShardInner::new(hash_state.clone())),
            })
            .collect();
        LocalCache {
            shards,
            shard_mask: shard_count - 1,
            hash_state,
            max_bytes,
            used_bytes: AtomicUsize::new(0),
            eviction_cursor: AtomicUsize::new(0),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    fn shard_for(&self, key: &[u8]) -> &Shard {
        let mut hasher = self.hash_state.build_hasher();
        hasher.write(key);
        &self.shards[(hasher.finish() as usize) & self.shard_mask]
    }

    pub fn get(&self, key: &[u8]) -> Option<Bytes> {
        let mut inner = self.shard_for(key).inner.write();
        let idx = match inner.map.get(key) {
            Some(&idx) => idx,
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                return None;
            }
        };
        let value = inner.nodes[idx].as_ref().map(|node| node.value.clone());
        inner.touch(idx);
        self.hits.fetch_add(1, Ordering::Relaxed);
        value
    }

    /// Inserts or replaces a value, evicting least-recently used entries when
    /// over budget. Entries larger than the whole budget are not cached.
    pub fn insert(&self, key: Bytes, value: Bytes) {
        let size = key.len() + value.len();
        if size > self.max_bytes {
            self.remove(&key);
            return;
        }

        let mut inner = self.shard_for(&key).inner.write();
        let existing = inner.map.get(&key).copied();
        match existing {
            Some(idx) => {
                if let Some(node) = inner.nodes[idx].as_mut() {
                    let old_size = node.size;
                    node.value = value;
                    node.size = size;
                    if size >= old_size {
                        self.used_bytes.fetch_add(size - old_size, Ordering::Relaxed);
                    } else {
                        self.used_bytes.fetch_sub(old_size - size, Ordering::Relaxed);
                    }
                }
                inner.touch(idx);
            }
            None => {
                inner.insert_new(key, value, size);
                self.used_bytes.fetch_add(size, Ordering::Relaxed);
            }
        }
        drop(inner);
        self.evict_if_needed();
    }

    /// Drops one key; returns true when it was cached.
    pub fn remove(&self, key: &[u8]) -> bool {
        let mut inner = self.shard_for(key).inner.write();
        let idx = match inner.map.get(key) {
            Some(&idx) => idx,
            None => return false,
        };
        match inner.remove_idx(idx) {
            Some(size) => {
                self.used_bytes.fetch_sub(size, Ordering::Relaxed);
                true
            }
            None => false,
        }
    }

    pub fn clear(&self) {
        for shard in &self.shards {
            let freed = shard.inner.write().clear();
            self.used_bytes.fetch_sub(freed, Ordering::Relaxed);
        }
    }

    pub fn apply(&self, invalidation: &Invalidation) {
        self.invalidations.fetch_add(1, Ordering::Relaxed);
        match invalidation {
            Invalidation::Flush => {
                debug!("flushing local cache");
                self.clear();
            }
            Invalidation::Keys(keys) => {
                for key in keys {
                    self.remove(key);
                }
            }
        }
    }

    pub fn len(&self) -> usize {
        self.shards.iter().map(|shard| shard.inner.read().map.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn used_bytes(&self) -> usize {
        self.used_bytes.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            invalidations: self.invalidations.load(Ordering::Relaxed),
            entries: self.len(),
            used_bytes: self.used_bytes(),
        }
    }

    /// Push handler applying invalidations to this cache; other pushes are
    /// ignored.
    pub fn push_handler(self: &Arc<Self>) -> PushHandler {
        let cache = Arc::clone(self);
        Arc::new(move |id: ConnectionId, items: &[Reply]| {
            if let Some(invalidation) = Invalidation::from_push(items) {
                debug!(id = %id, ?invalidation, "invalidation received");
                cache.apply(&invalidation);
            }
        })
    }

    /// Evicts entries until within the byte budget, scanning shards
    /// round-robin.
    fn evict_if_needed(&self) {
        while self.used_bytes.load(Ordering::Relaxed) > self.max_bytes {
            let start = self.eviction_cursor.fetch_add(1, Ordering::Relaxed);
            let mut evicted = false;
            for offset in 0..self.shards.len() {
                let idx = (start + offset) & self.shard_mask;
                if let Some(size) = self.shards[idx].inner.write().pop_lru() {
                    self.used_bytes.fetch_sub(size, Ordering::Relaxed);
                    evicted = true;
                    break;
                }
            }
            if !evicted {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(text: &'static str) -> Bytes {
        Bytes::from_static(text.as_bytes())
    }

    #[test]
    fn insert_get_remove() {
        let cache = LocalCache::with_shards(4, 1024);
        cache.insert(b("alpha"), b("value"));
        assert_eq!(cache.get(b"alpha"), Some(b("value")));
        assert_eq!(cache.used_bytes(), 10);
        assert!(cache.remove(b"alpha"));
        assert!(cache.get(b"alpha").is_none());
        assert_eq!(cache.used_bytes(), 0);
    }

    #[test]
    fn evicts_lru_by_bytes() {
        let cache = LocalCache::with_shards(1, 10);
        cache.insert(b("a"), b("1234"));
        cache.insert(b("b"), b("1234"));
        cache.get(b"a");
        cache.insert(b("c"), b("1234"));

        assert!(cache.get(b"b").is_none());
        assert!(cache.get(b"a").is_some());
        assert!(cache.get(b"c").is_some());
    }

    #[test]
    fn oversized_values_are_not_cached() {
        let cache = LocalCache::with_shards(1, 4);
        cache.insert(b("k"), b("too long"));
        assert!(cache.is_empty());
    }

    #[test]
    fn parses_resp3_and_resp2_invalidations() {
        let resp3 = vec![Reply::bulk("invalidate"), Reply::Array(vec![Reply::bulk("k1"), Reply::bulk("k2")])];
        assert_eq!(Invalidation::from_push(&resp3), Some(Invalidation::Keys(vec![b("k1"), b("k2")])));

        let resp2 = vec![Reply::bulk("message"), Reply::bulk("__redis__:invalidate"), Reply::Nil];
        assert_eq!(Invalidation::from_push(&resp2), Some(Invalidation::Flush));

        let other = vec![Reply::bulk("message"), Reply::bulk("news"), Reply::bulk("hi")];
        assert_eq!(Invalidation::from_push(&other), None);
    }

    #[test]
    fn push_handler_applies_invalidations() {
        let cache = Arc::new(LocalCache::new(1024));
        cache.insert(b("k1"), b("v1"));
        cache.insert(b("k2"), b("v2"));
        let handler = cache.push_handler();

        let id = crate::connection::Connection::new((), crate::connection::Role::Master, "none").id();
        handler(id, &[Reply::bulk("invalidate"), Reply::Array(vec![Reply::bulk("k1")])]);
        assert!(cache.get(b"k1").is_none());
        assert!(cache.get(b"k2").is_some());

        handler(id, &[Reply::bulk("invalidate"), Reply::Nil]);
        assert!(cache.is_empty());
        assert_eq!(cache.used_bytes(), 0);
        assert_eq!(cache.stats().invalidations, 2);
    }
}
