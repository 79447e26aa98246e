//! Content Cache Abstraction
//!
//! The server core never owns the stored bytes; it talks to a content cache
//! through the traits in this module. The cache is a pure byte-blob keyvalue
//! store: all entry metadata (flags, etags, validate TTLs) lives *inside* the
//! cached payload, written there by the command layer.
//!
//! Three pieces make up the contract:
//!
//! - [`Cache`]: keyed lookup, dogpile-suppressing lookup, transactional
//!   writes, delete and clear.
//! - [`Item`]: a read handle over one entry's remaining payload bytes. It is
//!   a [`bytes::Buf`], so header fields can be peeled off the front with
//!   `get_u32_le`/`get_u64_le` and the rest streamed out chunk by chunk.
//!   Dropping the item releases it; there is no explicit close.
//! - [`SetTxn`]: a staged write of a pre-declared size. The entry becomes
//!   visible only on `commit`; `rollback` leaves no trace. The commit path
//!   requires the written byte count to equal the declared size.
//!
//! [`MemoryCache`] is the bundled engine; anything that satisfies the traits
//! can be plugged in instead.

pub mod memory;
pub mod sweeper;

pub use memory::{MemItem, MemTxn, MemoryCache};
pub use sweeper::{start_expiry_sweeper, ExpirySweeper, SweeperConfig};

use bytes::Buf;
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced by cache operations.
///
/// `Miss` and `WouldBlock` are routine outcomes that handlers translate into
/// protocol replies. `Backend` signals a broken storage engine; the server
/// treats it as unrecoverable.
#[derive(Debug, Error)]
pub enum CacheError {
    /// The key is not present (or its entry has expired).
    #[error("cache miss")]
    Miss,

    /// Another client has been elected to refresh this key and its grace
    /// window has not elapsed yet.
    #[error("value is being refreshed by another client")]
    WouldBlock,

    /// The storage engine failed in a way the server cannot recover from.
    #[error("cache backend failure: {0}")]
    Backend(String),
}

/// A read handle over a single cache entry's payload bytes.
///
/// `Buf::remaining` doubles as the entry's available byte count; `ttl`
/// reports how long the entry has left to live (`None` = no expiration).
pub trait Item: Buf {
    /// Remaining time until this entry expires, captured at lookup time.
    fn ttl(&self) -> Option<Duration>;
}

/// A staged write into the cache of a pre-declared total size.
pub trait SetTxn {
    /// Appends bytes to the staged entry. Writing past the declared size is
    /// a backend error.
    fn write(&mut self, src: &[u8]) -> Result<(), CacheError>;

    /// Bytes still to be written before the txn may commit.
    fn remaining(&self) -> usize;

    /// Makes the entry visible atomically. Fails if fewer bytes were
    /// written than declared.
    fn commit(self) -> Result<(), CacheError>;

    /// Discards the staged entry. No visible state changes.
    fn rollback(self);
}

/// The content cache the server runs against.
pub trait Cache: Send + Sync + 'static {
    type Item: Item + Send;
    type Txn: SetTxn + Send;

    /// Looks up a key. `Err(Miss)` for absent or expired entries.
    fn get_item(&self, key: &[u8]) -> Result<Self::Item, CacheError>;

    /// Dogpile-suppressing lookup. On a miss, at most one caller per key is
    /// told `Miss` (and is expected to recompute and `set` the value);
    /// every other caller within the grace window gets `Err(WouldBlock)`.
    fn get_de_async_item(&self, key: &[u8], grace: Duration)
        -> Result<Self::Item, CacheError>;

    /// Opens a write transaction of exactly `size` bytes with the given
    /// expiration offset (`None` = never expires).
    fn new_set_txn(
        &self,
        key: &[u8],
        size: usize,
        expiration: Option<Duration>,
    ) -> Result<Self::Txn, CacheError>;

    /// Removes a key. Returns whether it was present.
    fn delete(&self, key: &[u8]) -> bool;

    /// Removes every entry.
    fn clear(&self);
}
