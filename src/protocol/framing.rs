//! Payload Framing
//!
//! Moves opaque payload bytes between the socket buffers and the cache
//! without materialising them in an intermediate buffer.
//!
//! On the read side, a request body of a declared size is streamed from the
//! connection's buffered reader straight into an open [`SetTxn`], chunk by
//! chunk as the reader's internal buffer fills, and the mandatory CRLF
//! terminator is verified afterwards. On the write side an [`Item`]'s
//! remaining bytes are streamed into the buffered writer and terminated
//! with CRLF.
//!
//! Short reads, over-long bodies and a missing terminator are hard errors:
//! the caller rolls back its transaction and closes the connection, because
//! the byte stream can no longer be trusted to be on a line boundary.

use crate::cache::{CacheError, Item, SetTxn};
use std::io;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The peer closed the connection before the declared payload arrived.
    #[error("connection closed before the full payload arrived")]
    UnexpectedEof,

    /// The two bytes after the payload were not CRLF.
    #[error("payload not terminated by CRLF")]
    MissingCrlf,

    /// The transaction refused a write; the backend is in trouble.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Streams exactly `remaining` bytes from `reader` into `txn`, then
/// requires the CRLF terminator.
pub async fn copy_to_txn<R, T>(
    reader: &mut R,
    txn: &mut T,
    mut remaining: usize,
) -> Result<(), FrameError>
where
    R: AsyncBufRead + Unpin,
    T: SetTxn,
{
    while remaining > 0 {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Err(FrameError::UnexpectedEof);
        }
        let take = chunk.len().min(remaining);
        txn.write(&chunk[..take])?;
        reader.consume(take);
        remaining -= take;
    }
    expect_crlf(reader).await
}

/// Consumes a literal CRLF from the reader.
pub async fn expect_crlf<R>(reader: &mut R) -> Result<(), FrameError>
where
    R: AsyncBufRead + Unpin,
{
    let mut terminator = [0u8; 2];
    reader.read_exact(&mut terminator).await.map_err(|err| {
        if err.kind() == io::ErrorKind::UnexpectedEof {
            FrameError::UnexpectedEof
        } else {
            FrameError::Io(err)
        }
    })?;
    if &terminator != b"\r\n" {
        return Err(FrameError::MissingCrlf);
    }
    Ok(())
}

/// Streams an item's remaining bytes into the writer, followed by CRLF.
pub async fn copy_from_item<W, I>(writer: &mut W, item: &mut I) -> Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
    I: Item,
{
    while item.has_remaining() {
        let chunk = item.chunk();
        let len = chunk.len();
        writer.write_all(chunk).await?;
        item.advance(len);
    }
    writer.write_all(b"\r\n").await?;
    Ok(())
}
