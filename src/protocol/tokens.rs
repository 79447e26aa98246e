//! Request Line Token Scanner
//!
//! Splits the tail of a request line (everything after the command verb)
//! into whitespace-separated tokens and parses the typed fields the
//! commands are built from: keys, flags, sizes, dual-form expirations,
//! millisecond durations, etags and the `noreply` sentinel.
//!
//! The scanner is deliberately strict: each token is preceded by exactly
//! one space, empty tokens are an error, and a command tail must be fully
//! consumed ([`Tokens::eof`]) or the request is rejected. Any parse failure
//! aborts the request and closes the connection, because the stream has
//! lost frame synchronisation.

use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Largest expiration value treated as a relative offset in seconds.
/// Anything bigger is an absolute Unix timestamp. 30 days, as in classic
/// memcached.
pub const MAX_RELATIVE_EXPIRATION_SECS: u64 = 30 * 24 * 3600;

/// Errors produced while tokenising a request line.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The line ended where another token was required.
    #[error("cannot find {0} token")]
    MissingToken(&'static str),

    /// Two separators in a row, i.e. a zero-length token.
    #[error("empty {0} token")]
    EmptyToken(&'static str),

    /// The byte where a separator was expected is not a space.
    #[error("malformed line near {0} token")]
    BadSeparator(&'static str),

    /// A numeric token failed to parse in its expected range.
    #[error("invalid {0} value")]
    InvalidNumber(&'static str),

    /// A token other than the literal `noreply` in the noreply position.
    #[error("expected noreply token")]
    ExpectedNoreply,

    /// Bytes left over after the last expected token.
    #[error("unexpected trailing bytes after the last token")]
    TrailingBytes,
}

/// Cursor-based scanner over a request line tail.
///
/// The tail by convention starts with the single space that separated it
/// from the verb (or is empty), so the scanner consumes one separator
/// before each token.
#[derive(Debug)]
pub struct Tokens<'a> {
    line: &'a [u8],
    /// Index of the separator expected before the next token.
    cursor: usize,
}

impl<'a> Tokens<'a> {
    pub fn new(line: &'a [u8]) -> Self {
        Self { line, cursor: 0 }
    }

    /// Returns the next token, labelled for error reporting.
    pub fn next(&mut self, label: &'static str) -> Result<&'a [u8], ParseError> {
        let sep = self.cursor;
        if sep >= self.line.len() {
            return Err(ParseError::MissingToken(label));
        }
        if self.line[sep] != b' ' {
            return Err(ParseError::BadSeparator(label));
        }
        let first = sep + 1;
        let last = self.line[first..]
            .iter()
            .position(|&b| b == b' ')
            .map(|pos| first + pos)
            .unwrap_or(self.line.len());
        if first == last {
            return Err(ParseError::EmptyToken(label));
        }
        self.cursor = last;
        Ok(&self.line[first..last])
    }

    /// A key is any non-empty token; contents are opaque bytes.
    pub fn key(&mut self) -> Result<&'a [u8], ParseError> {
        self.next("key")
    }

    pub fn flags(&mut self) -> Result<u32, ParseError> {
        let token = self.next("flags")?;
        parse_decimal(token, "flags")
    }

    pub fn size(&mut self) -> Result<usize, ParseError> {
        let token = self.next("size")?;
        parse_decimal(token, "size")
    }

    pub fn etag(&mut self) -> Result<u64, ParseError> {
        let token = self.next("etag")?;
        parse_decimal(token, "etag")
    }

    /// A plain decimal count of milliseconds.
    pub fn milliseconds(&mut self, label: &'static str) -> Result<u64, ParseError> {
        let token = self.next(label)?;
        parse_decimal(token, label)
    }

    /// Dual-form expiration: `0` = none, small values are relative seconds,
    /// large values absolute Unix seconds.
    pub fn expiration(&mut self) -> Result<Option<Duration>, ParseError> {
        let token = self.next("expiration")?;
        expiration_from_token(token)
    }

    /// Consumes the literal `noreply` token.
    pub fn noreply(&mut self) -> Result<(), ParseError> {
        let token = self.next("noreply")?;
        if token != b"noreply" {
            return Err(ParseError::ExpectedNoreply);
        }
        Ok(())
    }

    pub fn at_eof(&self) -> bool {
        self.cursor >= self.line.len()
    }

    /// Asserts the whole tail has been consumed.
    pub fn eof(&self) -> Result<(), ParseError> {
        if self.at_eof() {
            Ok(())
        } else {
            Err(ParseError::TrailingBytes)
        }
    }
}

fn parse_decimal<T: std::str::FromStr>(
    token: &[u8],
    label: &'static str,
) -> Result<T, ParseError> {
    std::str::from_utf8(token)
        .map_err(|_| ParseError::InvalidNumber(label))?
        .parse()
        .map_err(|_| ParseError::InvalidNumber(label))
}

/// Parses a dual-form expiration token into a duration offset from now.
pub fn expiration_from_token(token: &[u8]) -> Result<Option<Duration>, ParseError> {
    let secs: u64 = parse_decimal(token, "expiration")?;
    Ok(expiration_from_secs(secs))
}

/// `0` means no expiration; values up to 30 days are relative seconds;
/// larger values are absolute Unix timestamps converted against the
/// current clock (timestamps in the past expire immediately).
pub fn expiration_from_secs(secs: u64) -> Option<Duration> {
    if secs == 0 {
        None
    } else if secs <= MAX_RELATIVE_EXPIRATION_SECS {
        Some(Duration::from_secs(secs))
    } else {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        Some(Duration::from_secs(secs.saturating_sub(now)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_token() {
        let mut tokens = Tokens::new(b" foo");
        assert_eq!(tokens.next("key").unwrap(), b"foo");
        assert!(tokens.at_eof());
        assert!(tokens.eof().is_ok());
    }

    #[test]
    fn test_token_sequence() {
        let mut tokens = Tokens::new(b" foo 17 0 5");
        assert_eq!(tokens.key().unwrap(), b"foo");
        assert_eq!(tokens.flags().unwrap(), 17);
        assert_eq!(tokens.expiration().unwrap(), None);
        assert_eq!(tokens.size().unwrap(), 5);
        assert!(tokens.eof().is_ok());
    }

    #[test]
    fn test_missing_token() {
        let mut tokens = Tokens::new(b" foo");
        tokens.key().unwrap();
        assert_eq!(tokens.flags(), Err(ParseError::MissingToken("flags")));
    }

    #[test]
    fn test_double_space_is_empty_token() {
        let mut tokens = Tokens::new(b" foo  5");
        tokens.key().unwrap();
        assert_eq!(tokens.size(), Err(ParseError::EmptyToken("size")));
    }

    #[test]
    fn test_tail_not_starting_with_space() {
        let mut tokens = Tokens::new(b"foo 5");
        assert_eq!(tokens.key(), Err(ParseError::BadSeparator("key")));
    }

    #[test]
    fn test_trailing_bytes_detected() {
        let mut tokens = Tokens::new(b" foo junk");
        tokens.key().unwrap();
        assert_eq!(tokens.eof(), Err(ParseError::TrailingBytes));
    }

    #[test]
    fn test_binary_key_bytes() {
        let mut tokens = Tokens::new(b" \xffbin\x01key");
        assert_eq!(tokens.key().unwrap(), b"\xffbin\x01key");
    }

    #[test]
    fn test_flags_bounds() {
        let mut tokens = Tokens::new(b" 4294967295");
        assert_eq!(tokens.flags().unwrap(), u32::MAX);

        let mut tokens = Tokens::new(b" 4294967296");
        assert_eq!(tokens.flags(), Err(ParseError::InvalidNumber("flags")));

        let mut tokens = Tokens::new(b" -1");
        assert_eq!(tokens.flags(), Err(ParseError::InvalidNumber("flags")));
    }

    #[test]
    fn test_etag_is_u64() {
        let mut tokens = Tokens::new(b" 18446744073709551615");
        assert_eq!(tokens.etag().unwrap(), u64::MAX);
    }

    #[test]
    fn test_noreply_literal() {
        let mut tokens = Tokens::new(b" noreply");
        assert!(tokens.noreply().is_ok());

        let mut tokens = Tokens::new(b" nope");
        assert_eq!(tokens.noreply(), Err(ParseError::ExpectedNoreply));
    }

    #[test]
    fn test_milliseconds() {
        let mut tokens = Tokens::new(b" 1500");
        assert_eq!(tokens.milliseconds("graceDuration").unwrap(), 1500);
    }

    #[test]
    fn test_expiration_zero_is_none() {
        assert_eq!(expiration_from_token(b"0").unwrap(), None);
    }

    #[test]
    fn test_expiration_relative() {
        assert_eq!(
            expiration_from_token(b"300").unwrap(),
            Some(Duration::from_secs(300))
        );
        assert_eq!(
            expiration_from_token(b"2592000").unwrap(),
            Some(Duration::from_secs(2_592_000))
        );
    }

    #[test]
    fn test_expiration_absolute() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let target = now + 3600;
        let ttl = expiration_from_token(target.to_string().as_bytes())
            .unwrap()
            .unwrap();
        assert!(ttl <= Duration::from_secs(3600));
        assert!(ttl >= Duration::from_secs(3590));
    }

    #[test]
    fn test_expiration_absolute_in_the_past() {
        // An absolute timestamp already behind the clock expires right away.
        assert_eq!(
            expiration_from_token(b"2592001").unwrap(),
            Some(Duration::ZERO)
        );
    }

    #[test]
    fn test_expiration_not_a_number() {
        assert_eq!(
            expiration_from_token(b"soon"),
            Err(ParseError::InvalidNumber("expiration"))
        );
    }
}
