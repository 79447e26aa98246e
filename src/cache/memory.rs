//! In-Memory Cache Engine
//!
//! The bundled implementation of the [`Cache`] traits: a sharded, thread-safe
//! map from keys to opaque payload bytes with per-entry expiration and the
//! dogpile bookkeeping that backs `getde`.
//!
//! ## Concurrency Model
//!
//! Keys are hashed onto a fixed number of shards, each guarded by its own
//! `RwLock`, so readers and writers of different keys rarely contend. A
//! committed [`MemTxn`] swaps the whole entry in under one shard write lock,
//! which gives readers the all-or-nothing visibility the command layer
//! depends on: an `Item` handed out before the commit keeps serving the old
//! payload, one handed out after serves the new payload, and nothing in
//! between is observable.
//!
//! ## Expiry
//!
//! Entries are checked lazily on access; the background sweeper
//! (see [`super::sweeper`]) reclaims expired entries that are never touched
//! again.

use super::{Cache, CacheError, Item, SetTxn};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

/// Number of shards. More shards mean less lock contention at the price of
/// a little fixed memory overhead.
const NUM_SHARDS: usize = 64;

/// A stored entry: opaque payload plus optional expiry.
#[derive(Debug, Clone)]
struct Entry {
    payload: Bytes,
    expires_at: Option<Instant>,
}

impl Entry {
    #[inline]
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map(|at| now >= at).unwrap_or(false)
    }

    fn ttl(&self, now: Instant) -> Option<Duration> {
        self.expires_at.map(|at| at.saturating_duration_since(now))
    }
}

#[derive(Debug, Default)]
struct Shard {
    entries: RwLock<HashMap<Bytes, Entry>>,
    /// Keys currently being recomputed by an elected client, with the
    /// deadline until which other clients are held off.
    pending: Mutex<HashMap<Bytes, Instant>>,
}

/// Sharded in-memory content cache.
///
/// Cloning is cheap and yields a handle to the same underlying storage.
#[derive(Debug, Clone)]
pub struct MemoryCache {
    shards: Arc<Vec<Shard>>,
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

fn shard_index(key: &[u8]) -> usize {
    let mut hasher = DefaultHasher::new();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % NUM_SHARDS
}

impl MemoryCache {
    pub fn new() -> Self {
        let shards = (0..NUM_SHARDS).map(|_| Shard::default()).collect();
        Self {
            shards: Arc::new(shards),
        }
    }

    fn shard(&self, key: &[u8]) -> &Shard {
        &self.shards[shard_index(key)]
    }

    /// Number of live entries across all shards. Expired entries that have
    /// not been reclaimed yet are counted.
    pub fn len(&self) -> usize {
        self.shards
            .iter()
            .map(|s| s.entries.read().unwrap().len())
            .sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes expired entries and stale dogpile marks. Returns how many
    /// entries were reclaimed.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;
        for shard in self.shards.iter() {
            let mut entries = shard.entries.write().unwrap();
            let before = entries.len();
            entries.retain(|_, entry| !entry.is_expired(now));
            removed += before - entries.len();
            shard
                .pending
                .lock()
                .unwrap()
                .retain(|_, deadline| *deadline > now);
        }
        removed
    }
}

impl Cache for MemoryCache {
    type Item = MemItem;
    type Txn = MemTxn;

    fn get_item(&self, key: &[u8]) -> Result<MemItem, CacheError> {
        let shard = self.shard(key);
        let now = Instant::now();
        {
            let entries = shard.entries.read().unwrap();
            match entries.get(key) {
                None => return Err(CacheError::Miss),
                Some(entry) if !entry.is_expired(now) => {
                    return Ok(MemItem {
                        payload: entry.payload.clone(),
                        ttl: entry.ttl(now),
                    });
                }
                Some(_) => {}
            }
        }
        // The entry expired; reclaim it under the write lock.
        let mut entries = shard.entries.write().unwrap();
        if entries.get(key).map(|e| e.is_expired(now)).unwrap_or(false) {
            entries.remove(key);
        }
        Err(CacheError::Miss)
    }

    fn get_de_async_item(
        &self,
        key: &[u8],
        grace: Duration,
    ) -> Result<MemItem, CacheError> {
        match self.get_item(key) {
            Ok(item) => Ok(item),
            Err(CacheError::Miss) => {
                let shard = self.shard(key);
                let mut pending = shard.pending.lock().unwrap();
                let now = Instant::now();
                match pending.get(key) {
                    Some(&deadline) if deadline > now => Err(CacheError::WouldBlock),
                    _ => {
                        // Elect this caller to recompute; hold everyone else
                        // off until the grace window elapses.
                        pending.insert(Bytes::copy_from_slice(key), now + grace);
                        Err(CacheError::Miss)
                    }
                }
            }
            Err(err) => Err(err),
        }
    }

    fn new_set_txn(
        &self,
        key: &[u8],
        size: usize,
        expiration: Option<Duration>,
    ) -> Result<MemTxn, CacheError> {
        Ok(MemTxn {
            shards: Arc::clone(&self.shards),
            key: Bytes::copy_from_slice(key),
            staged: BytesMut::with_capacity(size),
            declared: size,
            expires_at: expiration.map(|ttl| Instant::now() + ttl),
        })
    }

    fn delete(&self, key: &[u8]) -> bool {
        let shard = self.shard(key);
        shard.pending.lock().unwrap().remove(key);
        shard.entries.write().unwrap().remove(key).is_some()
    }

    fn clear(&self) {
        for shard in self.shards.iter() {
            shard.entries.write().unwrap().clear();
            shard.pending.lock().unwrap().clear();
        }
    }
}

/// Read handle over one entry. The payload is a cheap refcounted slice, so
/// the shard lock is not held while the item is streamed out.
#[derive(Debug)]
pub struct MemItem {
    payload: Bytes,
    ttl: Option<Duration>,
}

impl Buf for MemItem {
    fn remaining(&self) -> usize {
        self.payload.remaining()
    }

    fn chunk(&self) -> &[u8] {
        self.payload.chunk()
    }

    fn advance(&mut self, cnt: usize) {
        self.payload.advance(cnt);
    }
}

impl Item for MemItem {
    fn ttl(&self) -> Option<Duration> {
        self.ttl
    }
}

/// Staged write of a pre-declared size. Nothing is visible until `commit`.
#[derive(Debug)]
pub struct MemTxn {
    shards: Arc<Vec<Shard>>,
    key: Bytes,
    staged: BytesMut,
    declared: usize,
    expires_at: Option<Instant>,
}

impl SetTxn for MemTxn {
    fn write(&mut self, src: &[u8]) -> Result<(), CacheError> {
        if self.staged.len() + src.len() > self.declared {
            return Err(CacheError::Backend(format!(
                "set txn overflow: declared {} bytes, writing past {}",
                self.declared,
                self.staged.len()
            )));
        }
        self.staged.extend_from_slice(src);
        Ok(())
    }

    fn remaining(&self) -> usize {
        self.declared - self.staged.len()
    }

    fn commit(self) -> Result<(), CacheError> {
        if self.staged.len() != self.declared {
            return Err(CacheError::Backend(format!(
                "set txn committed with {} of {} declared bytes",
                self.staged.len(),
                self.declared
            )));
        }
        let shard = &self.shards[shard_index(&self.key)];
        let entry = Entry {
            payload: self.staged.freeze(),
            expires_at: self.expires_at,
        };
        shard.entries.write().unwrap().insert(self.key.clone(), entry);
        // The value exists now; lift the dogpile hold so readers stop
        // getting WOULDBLOCK.
        shard.pending.lock().unwrap().remove(&self.key);
        Ok(())
    }

    fn rollback(self) {
        // Staged bytes are simply dropped. The dogpile mark (if any) is left
        // to lapse at its deadline.
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn put(cache: &MemoryCache, key: &[u8], payload: &[u8], ttl: Option<Duration>) {
        let mut txn = cache.new_set_txn(key, payload.len(), ttl).unwrap();
        txn.write(payload).unwrap();
        txn.commit().unwrap();
    }

    fn read_all(mut item: MemItem) -> Vec<u8> {
        let mut out = Vec::new();
        while item.has_remaining() {
            let chunk = item.chunk();
            out.extend_from_slice(chunk);
            let n = chunk.len();
            item.advance(n);
        }
        out
    }

    #[test]
    fn test_set_then_get_roundtrip() {
        let cache = MemoryCache::new();
        put(&cache, b"key", b"hello world", None);

        let item = cache.get_item(b"key").unwrap();
        assert_eq!(item.remaining(), 11);
        assert_eq!(item.ttl(), None);
        assert_eq!(read_all(item), b"hello world");
    }

    #[test]
    fn test_get_missing_key() {
        let cache = MemoryCache::new();
        assert!(matches!(cache.get_item(b"nope"), Err(CacheError::Miss)));
    }

    #[test]
    fn test_zero_byte_entry() {
        let cache = MemoryCache::new();
        put(&cache, b"empty", b"", None);

        let item = cache.get_item(b"empty").unwrap();
        assert_eq!(item.remaining(), 0);
    }

    #[test]
    fn test_rollback_leaves_no_trace() {
        let cache = MemoryCache::new();
        let mut txn = cache.new_set_txn(b"key", 5, None).unwrap();
        txn.write(b"hel").unwrap();
        txn.rollback();

        assert!(matches!(cache.get_item(b"key"), Err(CacheError::Miss)));
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_overwrite_replaces_whole_entry() {
        let cache = MemoryCache::new();
        put(&cache, b"key", b"first", None);
        put(&cache, b"key", b"second value", None);

        let item = cache.get_item(b"key").unwrap();
        assert_eq!(read_all(item), b"second value");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_txn_overflow_is_backend_error() {
        let cache = MemoryCache::new();
        let mut txn = cache.new_set_txn(b"key", 4, None).unwrap();
        assert!(txn.write(b"12345").is_err());
    }

    #[test]
    fn test_short_commit_is_backend_error() {
        let cache = MemoryCache::new();
        let mut txn = cache.new_set_txn(b"key", 10, None).unwrap();
        txn.write(b"1234").unwrap();
        assert_eq!(txn.remaining(), 6);
        assert!(txn.commit().is_err());
    }

    #[test]
    fn test_delete() {
        let cache = MemoryCache::new();
        put(&cache, b"key", b"value", None);

        assert!(cache.delete(b"key"));
        assert!(!cache.delete(b"key"));
        assert!(matches!(cache.get_item(b"key"), Err(CacheError::Miss)));
    }

    #[test]
    fn test_clear() {
        let cache = MemoryCache::new();
        for i in 0..100u32 {
            put(&cache, format!("key:{i}").as_bytes(), b"value", None);
        }
        assert_eq!(cache.len(), 100);

        cache.clear();
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_expired_entry_is_a_miss() {
        let cache = MemoryCache::new();
        put(&cache, b"key", b"value", Some(Duration::from_millis(20)));

        assert!(cache.get_item(b"key").is_ok());
        std::thread::sleep(Duration::from_millis(40));
        assert!(matches!(cache.get_item(b"key"), Err(CacheError::Miss)));
        // Lazy expiry reclaimed the entry on access.
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn test_item_reports_remaining_ttl() {
        let cache = MemoryCache::new();
        put(&cache, b"key", b"value", Some(Duration::from_secs(60)));

        let ttl = cache.get_item(b"key").unwrap().ttl().unwrap();
        assert!(ttl <= Duration::from_secs(60));
        assert!(ttl > Duration::from_secs(58));
    }

    #[test]
    fn test_dogpile_elects_exactly_one_client() {
        let cache = MemoryCache::new();
        let grace = Duration::from_secs(5);

        // First caller is elected to recompute and sees a plain miss.
        assert!(matches!(
            cache.get_de_async_item(b"key", grace),
            Err(CacheError::Miss)
        ));
        // Everyone else is held off while the grace window is open.
        assert!(matches!(
            cache.get_de_async_item(b"key", grace),
            Err(CacheError::WouldBlock)
        ));
    }

    #[test]
    fn test_dogpile_hold_lifted_by_commit() {
        let cache = MemoryCache::new();
        let grace = Duration::from_secs(5);

        assert!(matches!(
            cache.get_de_async_item(b"key", grace),
            Err(CacheError::Miss)
        ));
        put(&cache, b"key", b"fresh", None);

        let item = cache.get_de_async_item(b"key", grace).unwrap();
        assert_eq!(read_all(item), b"fresh");
    }

    #[test]
    fn test_dogpile_hold_lapses_after_grace() {
        let cache = MemoryCache::new();
        let grace = Duration::from_millis(20);

        assert!(matches!(
            cache.get_de_async_item(b"key", grace),
            Err(CacheError::Miss)
        ));
        std::thread::sleep(Duration::from_millis(40));
        // The elected client never delivered; the next caller takes over.
        assert!(matches!(
            cache.get_de_async_item(b"key", grace),
            Err(CacheError::Miss)
        ));
    }

    #[test]
    fn test_delete_lifts_dogpile_hold() {
        let cache = MemoryCache::new();
        let grace = Duration::from_secs(5);

        assert!(matches!(
            cache.get_de_async_item(b"key", grace),
            Err(CacheError::Miss)
        ));
        cache.delete(b"key");
        assert!(matches!(
            cache.get_de_async_item(b"key", grace),
            Err(CacheError::Miss)
        ));
    }

    #[test]
    fn test_concurrent_writers_distinct_keys() {
        use std::thread;

        let cache = MemoryCache::new();
        let handles: Vec<_> = (0..4)
            .map(|t| {
                let cache = cache.clone();
                thread::spawn(move || {
                    for i in 0..1_000u32 {
                        let key = format!("key:{t}:{i}");
                        let mut txn =
                            cache.new_set_txn(key.as_bytes(), 5, None).unwrap();
                        txn.write(b"value").unwrap();
                        txn.commit().unwrap();
                        assert!(cache.get_item(key.as_bytes()).is_ok());
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(cache.len(), 4_000);
    }

    #[test]
    fn test_cleanup_expired_reclaims_untouched_keys() {
        let cache = MemoryCache::new();
        for i in 0..10u32 {
            put(
                &cache,
                format!("key:{i}").as_bytes(),
                b"value",
                Some(Duration::from_millis(10)),
            );
        }
        put(&cache, b"persistent", b"value", None);

        std::thread::sleep(Duration::from_millis(30));
        let removed = cache.cleanup_expired();
        assert_eq!(removed, 10);
        assert_eq!(cache.len(), 1);
    }
}
