//! Wire Protocol Implementation
//!
//! The ASCII, line-oriented request protocol and the framing of opaque
//! payloads that follow storage commands.
//!
//! ## Modules
//!
//! - `tokens`: cursor-based scanner for request line tails and the typed
//!   field parsers built on it
//! - `reply`: fixed reply literals and `VALUE` header formatting
//! - `framing`: zero-copy streaming of payload bytes between the socket
//!   buffers and the cache
//!
//! Requests are CRLF-terminated lines; integers are decimal ASCII; keys are
//! opaque byte strings free of whitespace and CRLF. Storage commands carry
//! a payload of a pre-declared size after the line, itself followed by CRLF.

pub mod framing;
pub mod reply;
pub mod tokens;

pub use framing::FrameError;
pub use tokens::{ParseError, Tokens};
