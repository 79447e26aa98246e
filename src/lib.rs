//! # embercache - A Text-Protocol Cache Server
//!
//! embercache speaks an extended memcached-style line protocol over TCP
//! against a pluggable content cache. Alongside the classic verbs it adds
//! two extensions: `getde`, a dogpile-suppressing get that lets exactly one
//! client recompute an expired value while the rest back off, and
//! `cget`/`cset`, a validator/etag protocol that lets clients revalidate a
//! cached copy without re-downloading it.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐   ┌────────────────────┐   ┌─────────────────┐
//! │  TCP Server  │──>│ ConnectionHandler  │──>│ CommandHandler  │
//! │ (server.rs)  │   │ (line dispatcher)  │   │  (eight verbs)  │
//! └──────────────┘   └────────────────────┘   └────────┬────────┘
//!                            │                         │
//!                            ▼                         ▼
//!                    ┌──────────────┐        ┌──────────────────┐
//!                    │   protocol   │        │   Cache trait    │
//!                    │ tokens/reply │        │ (MemoryCache or  │
//!                    │   framing    │        │  your backend)   │
//!                    └──────────────┘        └──────────────────┘
//! ```
//!
//! One tokio task per connection; payloads stream directly between the
//! socket buffers and the cache with no intermediate copy. Entry metadata
//! (flags, etags, validate TTLs) is stored inside the cached payload in a
//! fixed little-endian layout, so the storage backend stays a pure
//! byte-blob keyvalue store and metadata is committed atomically with the
//! payload.
//!
//! ## Quick Start
//!
//! ```ignore
//! use embercache::{MemoryCache, Server, ServerConfig};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let cache = Arc::new(MemoryCache::new());
//!     let mut server = Server::new(cache, ServerConfig::default());
//!     server.start().await?;
//!     tokio::signal::ctrl_c().await?;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Module Overview
//!
//! - [`protocol`]: token scanner, reply formatting, payload framing
//! - [`connection`]: per-connection request loop
//! - [`commands`]: the eight request verbs
//! - [`cache`]: the cache traits and the bundled in-memory engine
//! - [`server`]: TCP acceptor with orderly shutdown

pub mod cache;
pub mod commands;
pub mod connection;
pub mod protocol;
pub mod server;

// Re-export commonly used types for convenience
pub use cache::{Cache, CacheError, ExpirySweeper, Item, MemoryCache, SetTxn, SweeperConfig};
pub use commands::CommandHandler;
pub use connection::{handle_connection, ConnectionError, ConnectionHandler};
pub use server::{Server, ServerConfig};

/// The default port embercache listens on (same as memcached)
pub const DEFAULT_PORT: u16 = 11211;

/// The default host embercache binds to
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Version of embercache
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
