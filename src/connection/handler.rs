//! Connection Handler Module
//!
//! One handler per accepted socket, running on its own tokio task. The
//! handler owns the buffered reader and writer halves, a reusable line
//! buffer, and the connection's [`CommandHandler`]; nothing here is shared,
//! so a connection needs no locks of its own.
//!
//! ## Request Loop
//!
//! 1. Read bytes up to the next LF into the line buffer, strip CRLF.
//! 2. Route the line to its command handler, which may consume a payload
//!    from the reader and writes its reply to the writer.
//! 3. Flush the writer only when the reader has no buffered input left:
//!    pipelined requests keep batching replies, while an idle client waits
//!    at most one round-trip for its response.
//!
//! Requests on one connection are strictly serialised; the next line is not
//! read until the current handler returned. An empty line, EOF, or any
//! parse/framing failure ends the loop. On the way out the handler flushes
//! whatever replies were already buffered, cancels the connection's pending
//! `flush_all` timer (by dropping the command handler) and closes the
//! socket.

use crate::cache::Cache;
use crate::commands::CommandHandler;
use crate::protocol::{FrameError, ParseError};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, warn};

/// Initial capacity of the per-connection line buffer. It grows on demand
/// and is reused across requests.
const INITIAL_LINE_CAPACITY: usize = 1024;

/// Errors that end a connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Socket-level failure.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),

    /// The request line failed to tokenise.
    #[error("protocol error: {0}")]
    Protocol(#[from] ParseError),

    /// A payload could not be framed (short body, missing CRLF).
    #[error("framing error: {0}")]
    Frame(#[from] FrameError),

    /// A cached payload was too short for its metadata header.
    #[error("truncated {0} header in cached payload")]
    TruncatedHeader(&'static str),

    /// The request verb matched no command prefix.
    #[error("unrecognized command")]
    UnknownCommand,
}

/// Handles a single client connection.
pub struct ConnectionHandler<C: Cache> {
    reader: BufReader<OwnedReadHalf>,
    writer: BufWriter<OwnedWriteHalf>,
    addr: SocketAddr,
    commands: CommandHandler<C>,
    line: Vec<u8>,
}

impl<C: Cache> ConnectionHandler<C> {
    pub fn new(
        stream: TcpStream,
        addr: SocketAddr,
        cache: Arc<C>,
        read_buffer_size: usize,
        write_buffer_size: usize,
    ) -> Self {
        let (read_half, write_half) = stream.into_split();
        Self {
            reader: BufReader::with_capacity(read_buffer_size, read_half),
            writer: BufWriter::with_capacity(write_buffer_size, write_half),
            addr,
            commands: CommandHandler::new(cache),
            line: Vec::with_capacity(INITIAL_LINE_CAPACITY),
        }
    }

    /// Runs the request loop to completion and tears the connection down.
    pub async fn run(mut self) {
        debug!(client = %self.addr, "client connected");

        let result = self.serve().await;

        // Whatever replies were batched before the failure still belong to
        // the client; the stream is cut after them.
        let _ = self.writer.flush().await;

        match result {
            Ok(()) => debug!(client = %self.addr, "client disconnected"),
            Err(ConnectionError::Io(ref err))
                if err.kind() == io::ErrorKind::ConnectionReset =>
            {
                debug!(client = %self.addr, "connection reset by client");
            }
            Err(err) => {
                warn!(client = %self.addr, error = %err, "closing connection");
            }
        }
        // Dropping `commands` cancels any pending flush_all timer; dropping
        // the halves closes the socket.
    }

    async fn serve(&mut self) -> Result<(), ConnectionError> {
        loop {
            self.line.clear();
            let n = self.reader.read_until(b'\n', &mut self.line).await?;
            if n == 0 {
                return Ok(()); // peer closed
            }
            if self.line.last() != Some(&b'\n') {
                return Ok(()); // EOF in the middle of a line
            }
            self.line.pop();
            if self.line.last() == Some(&b'\r') {
                self.line.pop();
            }
            if self.line.is_empty() {
                return Ok(());
            }

            self.commands
                .dispatch(&self.line, &mut self.reader, &mut self.writer)
                .await?;

            if self.reader.buffer().is_empty() {
                self.writer.flush().await?;
            }
        }
    }
}

/// Convenience wrapper: build a handler for an accepted socket and run it.
pub async fn handle_connection<C: Cache>(
    stream: TcpStream,
    addr: SocketAddr,
    cache: Arc<C>,
    read_buffer_size: usize,
    write_buffer_size: usize,
) {
    ConnectionHandler::new(stream, addr, cache, read_buffer_size, write_buffer_size)
        .run()
        .await;
}
