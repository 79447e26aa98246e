//! Reply Literals and Header Formatting
//!
//! The fixed one-line replies of the protocol, plus the formatters for the
//! two `VALUE` header shapes. Headers are rendered into a caller-provided
//! scratch buffer that is reused across requests, so a response line costs
//! no allocation once the buffer has warmed up.

use crate::protocol::tokens::MAX_RELATIVE_EXPIRATION_SECS;
use std::io::{self, Write};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub const CRLF: &[u8] = b"\r\n";
pub const END: &[u8] = b"END\r\n";
pub const STORED: &[u8] = b"STORED\r\n";
pub const DELETED: &[u8] = b"DELETED\r\n";
pub const NOT_FOUND: &[u8] = b"NOT_FOUND\r\n";
pub const NOT_MODIFIED: &[u8] = b"NOT_MODIFIED\r\n";
pub const WOULDBLOCK: &[u8] = b"WOULDBLOCK\r\n";
pub const OK: &[u8] = b"OK\r\n";

/// Renders `VALUE <key> <flags> <size>[ 0]\r\n` into `buf`.
///
/// The trailing ` 0` is the CAS placeholder emitted for `gets`; the server
/// does not implement CAS and the field exists for client compatibility.
pub fn value_header(
    buf: &mut Vec<u8>,
    key: &[u8],
    flags: u32,
    size: usize,
    cas: bool,
) -> io::Result<()> {
    buf.clear();
    buf.extend_from_slice(b"VALUE ");
    buf.extend_from_slice(key);
    write!(buf, " {flags} {size}")?;
    if cas {
        buf.extend_from_slice(b" 0");
    }
    buf.extend_from_slice(CRLF);
    Ok(())
}

/// Renders `VALUE <size> <expiration> <etag> <validate_ttl_ms>\r\n` for the
/// conditional-get reply. Note there is no key field in this shape.
pub fn cget_header(
    buf: &mut Vec<u8>,
    size: usize,
    ttl: Option<Duration>,
    etag: u64,
    validate_ttl_ms: i32,
) -> io::Result<()> {
    buf.clear();
    write!(
        buf,
        "VALUE {size} {} {etag} {validate_ttl_ms}",
        encode_expiration(ttl)
    )?;
    buf.extend_from_slice(CRLF);
    Ok(())
}

/// Re-encodes a remaining TTL in the wire's dual form: `0` for no
/// expiration, plain seconds up to 30 days, absolute Unix seconds beyond.
pub fn encode_expiration(ttl: Option<Duration>) -> u64 {
    match ttl {
        None => 0,
        Some(ttl) => {
            let secs = ttl.as_secs();
            if secs > MAX_RELATIVE_EXPIRATION_SECS {
                let now = SystemTime::now()
                    .duration_since(UNIX_EPOCH)
                    .unwrap_or_default()
                    .as_secs();
                now + secs
            } else {
                secs
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_header() {
        let mut buf = Vec::new();
        value_header(&mut buf, b"foo", 17, 5, false).unwrap();
        assert_eq!(buf, b"VALUE foo 17 5\r\n");
    }

    #[test]
    fn test_value_header_with_cas_placeholder() {
        let mut buf = Vec::new();
        value_header(&mut buf, b"foo", 17, 5, true).unwrap();
        assert_eq!(buf, b"VALUE foo 17 5 0\r\n");
    }

    #[test]
    fn test_value_header_reuses_buffer() {
        let mut buf = Vec::new();
        value_header(&mut buf, b"a-long-key-name", 1, 100, true).unwrap();
        value_header(&mut buf, b"k", 0, 1, false).unwrap();
        assert_eq!(buf, b"VALUE k 0 1\r\n");
    }

    #[test]
    fn test_cget_header() {
        let mut buf = Vec::new();
        cget_header(&mut buf, 3, None, 42, 1000).unwrap();
        assert_eq!(buf, b"VALUE 3 0 42 1000\r\n");
    }

    #[test]
    fn test_cget_header_negative_validate_ttl() {
        let mut buf = Vec::new();
        cget_header(&mut buf, 3, Some(Duration::from_secs(60)), 7, -1).unwrap();
        assert_eq!(buf, b"VALUE 3 60 7 -1\r\n");
    }

    #[test]
    fn test_encode_expiration_none_is_zero() {
        assert_eq!(encode_expiration(None), 0);
    }

    #[test]
    fn test_encode_expiration_relative() {
        assert_eq!(encode_expiration(Some(Duration::from_secs(300))), 300);
        assert_eq!(
            encode_expiration(Some(Duration::from_secs(MAX_RELATIVE_EXPIRATION_SECS))),
            MAX_RELATIVE_EXPIRATION_SECS
        );
    }

    #[test]
    fn test_encode_expiration_absolute_beyond_thirty_days() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let encoded =
            encode_expiration(Some(Duration::from_secs(MAX_RELATIVE_EXPIRATION_SECS + 60)));
        assert!(encoded >= now + MAX_RELATIVE_EXPIRATION_SECS + 60);
        // Drift allowance for the two clock reads.
        assert!(encoded <= now + MAX_RELATIVE_EXPIRATION_SECS + 62);
    }
}
