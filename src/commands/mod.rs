//! Command Processing
//!
//! The request verbs and their reply grammar:
//!
//! | request | success reply |
//! |---|---|
//! | `get <key>...` | `VALUE <k> <flags> <size>\r\n<bytes>\r\n`... then `END\r\n` |
//! | `gets <key>...` | as `get`, with a trailing ` 0` CAS placeholder |
//! | `getde <key> <graceMs>` | `WOULDBLOCK\r\n` \| `VALUE ...END\r\n` \| `END\r\n` |
//! | `cget <key> <etag>` | `NOT_FOUND\r\n` \| `NOT_MODIFIED\r\n` \| `VALUE <size> <exp> <etag> <vms>\r\n<bytes>\r\n` |
//! | `set <key> <flags> <exp> <size>[ noreply]` | `STORED\r\n` |
//! | `cset <key> <exp> <size> <etag> <vms>[ noreply]` | `STORED\r\n` |
//! | `delete <key>[ noreply]` | `DELETED\r\n` \| `NOT_FOUND\r\n` |
//! | `flush_all [<exp>][ noreply]` | `OK\r\n` |
//!
//! `noreply` suppresses the success reply only; failures still close the
//! connection.

pub mod handler;

pub use handler::CommandHandler;
