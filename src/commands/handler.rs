//! Command Handler Module
//!
//! Implements the eight request verbs. Each handler parses its line tail
//! with the token scanner, talks to the cache, and writes its reply into
//! the connection's buffered writer.
//!
//! Two conventions shape every handler:
//!
//! - **In-payload metadata.** Classic entries carry a 4-byte little-endian
//!   flags header in front of the user bytes; validator entries carry an
//!   8-byte etag followed by a 4-byte signed validate TTL (milliseconds).
//!   The headers are written into the set transaction before the body is
//!   streamed, so metadata and payload become visible in one commit.
//! - **Error severity.** Parse and socket failures abort the request and
//!   close the connection (the caller does that on any returned error).
//!   A cache failure that is neither a miss nor a would-block means the
//!   storage backend is broken, and the process exits rather than serving
//!   from a corrupt store.

use crate::cache::{Cache, CacheError, Item, SetTxn};
use crate::connection::ConnectionError;
use crate::protocol::framing::{self, FrameError};
use crate::protocol::reply;
use crate::protocol::tokens::{self, ParseError, Tokens};
use bytes::Buf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinHandle;
use tracing::{error, warn};

/// Classic entry header: little-endian u32 flags.
const FLAGS_LEN: usize = 4;
/// Validator entry header: little-endian u64 etag + i32 validate TTL.
const VALIDATOR_LEN: usize = 12;

/// Per-connection command processor.
///
/// Owns the scratch buffer reply headers are rendered into and the
/// connection's pending `flush_all` timer. Dropping the handler cancels
/// the timer, so a disconnecting client takes its scheduled flush with it.
pub struct CommandHandler<C: Cache> {
    cache: Arc<C>,
    scratch: Vec<u8>,
    flush_timer: Option<JoinHandle<()>>,
}

impl<C: Cache> CommandHandler<C> {
    pub fn new(cache: Arc<C>) -> Self {
        Self {
            cache,
            scratch: Vec::with_capacity(1024),
            flush_timer: None,
        }
    }

    /// Routes one request line (CRLF already stripped) to its handler.
    ///
    /// Prefixes are matched longest-first so `gets`/`getde` are not
    /// swallowed by `get`. An unrecognized verb is an error; the caller
    /// closes the connection because the stream may contain a payload the
    /// server cannot frame.
    pub async fn dispatch<R, W>(
        &mut self,
        line: &[u8],
        reader: &mut R,
        writer: &mut W,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        if let Some(tail) = line.strip_prefix(b"gets") {
            self.get(tail, writer, true).await
        } else if let Some(tail) = line.strip_prefix(b"getde") {
            self.getde(tail, writer).await
        } else if let Some(tail) = line.strip_prefix(b"cget") {
            self.cget(tail, writer).await
        } else if let Some(tail) = line.strip_prefix(b"cset") {
            self.cset(tail, reader, writer).await
        } else if let Some(tail) = line.strip_prefix(b"flush_all") {
            self.flush_all(tail, writer).await
        } else if let Some(tail) = line.strip_prefix(b"get") {
            self.get(tail, writer, false).await
        } else if let Some(tail) = line.strip_prefix(b"set") {
            self.set(tail, reader, writer).await
        } else if let Some(tail) = line.strip_prefix(b"delete") {
            self.delete(tail, writer).await
        } else {
            warn!(line = %String::from_utf8_lossy(line), "unrecognized command");
            Err(ConnectionError::UnknownCommand)
        }
    }

    /// `get <key>[ <key>...]` / `gets <key>[ <key>...]`
    ///
    /// Misses emit nothing for their key; every hit emits a `VALUE` line
    /// and payload; `END` closes the response. Repeated spaces between
    /// keys are tolerated.
    async fn get<W>(
        &mut self,
        tail: &[u8],
        writer: &mut W,
        cas: bool,
    ) -> Result<(), ConnectionError>
    where
        W: AsyncWrite + Unpin,
    {
        if !tail.is_empty() && tail[0] != b' ' {
            return Err(ParseError::BadSeparator("key").into());
        }
        for key in tail.split(|&b| b == b' ').filter(|t| !t.is_empty()) {
            let result = self.cache.get_item(key);
            match result {
                Ok(item) => self.write_get_response(writer, key, item, cas).await?,
                Err(CacheError::Miss) => {}
                Err(err) => fatal_cache_error("get_item", key, &err),
            }
        }
        writer.write_all(reply::END).await?;
        Ok(())
    }

    /// `getde <key> <graceMs>`: dogpile-suppressing get.
    async fn getde<W>(&mut self, tail: &[u8], writer: &mut W) -> Result<(), ConnectionError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut t = Tokens::new(tail);
        let key = t.key()?;
        let grace = Duration::from_millis(t.milliseconds("graceDuration")?);
        t.eof()?;

        let result = self.cache.get_de_async_item(key, grace);
        match result {
            Ok(item) => {
                self.write_get_response(writer, key, item, false).await?;
                writer.write_all(reply::END).await?;
            }
            Err(CacheError::WouldBlock) => writer.write_all(reply::WOULDBLOCK).await?,
            Err(CacheError::Miss) => writer.write_all(reply::END).await?,
            Err(err) => fatal_cache_error("get_de_async_item", key, &err),
        }
        Ok(())
    }

    /// `cget <key> <etag>`: conditional get against a validator entry.
    async fn cget<W>(&mut self, tail: &[u8], writer: &mut W) -> Result<(), ConnectionError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut t = Tokens::new(tail);
        let key = t.key()?;
        let etag = t.etag()?;
        t.eof()?;

        let result = self.cache.get_item(key);
        let mut item = match result {
            Ok(item) => item,
            Err(CacheError::Miss) => {
                writer.write_all(reply::NOT_FOUND).await?;
                return Ok(());
            }
            Err(err) => fatal_cache_error("get_item", key, &err),
        };

        if item.remaining() < 8 {
            warn!(key = %String::from_utf8_lossy(key), "cannot read etag from item");
            return Err(ConnectionError::TruncatedHeader("etag"));
        }
        let stored_etag = item.get_u64_le();
        if stored_etag == etag {
            writer.write_all(reply::NOT_MODIFIED).await?;
            return Ok(());
        }

        if item.remaining() < 4 {
            warn!(key = %String::from_utf8_lossy(key), "cannot read validateTtl from item");
            return Err(ConnectionError::TruncatedHeader("validateTtl"));
        }
        let validate_ttl_ms = item.get_i32_le();

        reply::cget_header(
            &mut self.scratch,
            item.remaining(),
            item.ttl(),
            stored_etag,
            validate_ttl_ms,
        )?;
        writer.write_all(&self.scratch).await?;
        framing::copy_from_item(writer, &mut item).await?;
        Ok(())
    }

    /// `set <key> <flags> <expiration> <size>[ noreply]`
    async fn set<R, W>(
        &mut self,
        tail: &[u8],
        reader: &mut R,
        writer: &mut W,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut t = Tokens::new(tail);
        let key = t.key()?;
        let flags = t.flags()?;
        let expiration = t.expiration()?;
        let size = t.size()?;
        let noreply = optional_noreply(&mut t)?;

        let total = size
            .checked_add(FLAGS_LEN)
            .ok_or(ParseError::InvalidNumber("size"))?;
        self.store(
            reader,
            writer,
            key,
            &flags.to_le_bytes(),
            size,
            total,
            expiration,
            noreply,
        )
        .await
    }

    /// `cset <key> <expiration> <size> <etag> <validateTtlMs>[ noreply]`
    async fn cset<R, W>(
        &mut self,
        tail: &[u8],
        reader: &mut R,
        writer: &mut W,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut t = Tokens::new(tail);
        let key = t.key()?;
        let expiration = t.expiration()?;
        let size = t.size()?;
        let etag = t.etag()?;
        // Stored as a signed 32-bit field; larger inputs truncate.
        let validate_ttl_ms = t.milliseconds("validateTtl")? as i32;
        let noreply = optional_noreply(&mut t)?;

        let mut header = [0u8; VALIDATOR_LEN];
        header[..8].copy_from_slice(&etag.to_le_bytes());
        header[8..].copy_from_slice(&validate_ttl_ms.to_le_bytes());

        let total = size
            .checked_add(VALIDATOR_LEN)
            .ok_or(ParseError::InvalidNumber("size"))?;
        self.store(reader, writer, key, &header, size, total, expiration, noreply)
            .await
    }

    /// Shared tail of the set family: open a transaction of the full entry
    /// size, write the metadata header, stream the user payload, verify the
    /// CRLF, commit, reply. Any stream failure rolls the transaction back
    /// before the error propagates.
    #[allow(clippy::too_many_arguments)]
    async fn store<R, W>(
        &mut self,
        reader: &mut R,
        writer: &mut W,
        key: &[u8],
        header: &[u8],
        size: usize,
        total: usize,
        expiration: Option<Duration>,
        noreply: bool,
    ) -> Result<(), ConnectionError>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let result = self.cache.new_set_txn(key, total, expiration);
        let mut txn = match result {
            Ok(txn) => txn,
            Err(err) => fatal_cache_error("new_set_txn", key, &err),
        };

        match stream_entry(reader, &mut txn, header, size).await {
            Ok(()) => {}
            Err(FrameError::Cache(err)) => fatal_cache_error("set_txn write", key, &err),
            Err(err) => {
                txn.rollback();
                return Err(err.into());
            }
        }

        if let Err(err) = txn.commit() {
            fatal_cache_error("set_txn commit", key, &err);
        }
        if !noreply {
            writer.write_all(reply::STORED).await?;
        }
        Ok(())
    }

    /// `delete <key>[ noreply]`
    async fn delete<W>(&mut self, tail: &[u8], writer: &mut W) -> Result<(), ConnectionError>
    where
        W: AsyncWrite + Unpin,
    {
        let mut t = Tokens::new(tail);
        let key = t.key()?;
        let noreply = optional_noreply(&mut t)?;

        let deleted = self.cache.delete(key);
        if !noreply {
            let response = if deleted { reply::DELETED } else { reply::NOT_FOUND };
            writer.write_all(response).await?;
        }
        Ok(())
    }

    /// `flush_all [<expiration>][ noreply]`
    ///
    /// Zero or missing expiration clears immediately. A positive one arms a
    /// timer on this connection, cancelling whatever timer was armed before;
    /// the timer dies with the connection.
    async fn flush_all<W>(&mut self, tail: &[u8], writer: &mut W) -> Result<(), ConnectionError>
    where
        W: AsyncWrite + Unpin,
    {
        let (expiration, noreply) = parse_flush_all(tail)?;

        if let Some(timer) = self.flush_timer.take() {
            timer.abort();
        }
        match expiration {
            Some(delay) if !delay.is_zero() => {
                let cache = Arc::clone(&self.cache);
                self.flush_timer = Some(tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    cache.clear();
                }));
            }
            _ => self.cache.clear(),
        }

        if !noreply {
            writer.write_all(reply::OK).await?;
        }
        Ok(())
    }

    /// Emits `VALUE <key> <flags> <size>[ 0]\r\n` plus the payload for one
    /// hit of the classic get family.
    async fn write_get_response<W>(
        &mut self,
        writer: &mut W,
        key: &[u8],
        mut item: C::Item,
        cas: bool,
    ) -> Result<(), ConnectionError>
    where
        W: AsyncWrite + Unpin,
    {
        if item.remaining() < FLAGS_LEN {
            warn!(key = %String::from_utf8_lossy(key), "cannot read flags from item");
            return Err(ConnectionError::TruncatedHeader("flags"));
        }
        let flags = item.get_u32_le();

        reply::value_header(&mut self.scratch, key, flags, item.remaining(), cas)?;
        writer.write_all(&self.scratch).await?;
        framing::copy_from_item(writer, &mut item).await?;
        Ok(())
    }
}

impl<C: Cache> Drop for CommandHandler<C> {
    fn drop(&mut self) {
        if let Some(timer) = self.flush_timer.take() {
            timer.abort();
        }
    }
}

/// Writes the metadata header and streams the declared payload into the
/// transaction, ending with the CRLF check.
async fn stream_entry<R, T>(
    reader: &mut R,
    txn: &mut T,
    header: &[u8],
    size: usize,
) -> Result<(), FrameError>
where
    R: AsyncBufRead + Unpin,
    T: SetTxn,
{
    txn.write(header)?;
    framing::copy_to_txn(reader, txn, size).await
}

/// Accepts either end-of-line or a final `noreply` token.
fn optional_noreply(t: &mut Tokens<'_>) -> Result<bool, ParseError> {
    if t.at_eof() {
        return Ok(false);
    }
    t.noreply()?;
    t.eof()?;
    Ok(true)
}

/// `flush_all` tails: empty, `noreply`, `<expiration>`, or
/// `<expiration> noreply`.
fn parse_flush_all(tail: &[u8]) -> Result<(Option<Duration>, bool), ParseError> {
    if tail.is_empty() {
        return Ok((None, false));
    }
    let mut t = Tokens::new(tail);
    let token = t.next("expiration_or_noreply")?;
    if token == b"noreply" {
        t.eof()?;
        return Ok((None, true));
    }
    let expiration = tokens::expiration_from_token(token)?;
    let noreply = optional_noreply(&mut t)?;
    Ok((expiration, noreply))
}

/// A cache error that is neither a miss nor a would-block signals a broken
/// backend. Serving on top of it would mask corruption, so the process
/// terminates.
fn fatal_cache_error(op: &'static str, key: &[u8], err: &CacheError) -> ! {
    error!(
        op,
        key = %String::from_utf8_lossy(key),
        error = %err,
        "unexpected cache error, shutting down"
    );
    std::process::exit(1);
}
