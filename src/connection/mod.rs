//! Connection Handling
//!
//! Each accepted socket is owned by one [`ConnectionHandler`] running on its
//! own tokio task. The handler drives the request loop: read one
//! CRLF-terminated line, dispatch it, and flush batched replies once the
//! read buffer drains. Requests on a connection are strictly serialised,
//! which preserves response order under client pipelining.
//!
//! All per-connection state (buffers, the pending `flush_all` timer) lives
//! inside the handler and dies with it; the shared cache is the only thing
//! connections have in common.

pub mod handler;

pub use handler::{handle_connection, ConnectionError, ConnectionHandler};
