//! TCP Acceptor
//!
//! Binds the listener, configures per-socket OS buffers, and spawns one
//! connection task per accepted socket. The server tracks outstanding
//! connection tasks through a completion channel so `stop` can wait for
//! in-flight requests to finish after the listener is gone.

use crate::cache::Cache;
use crate::connection::handle_connection;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info};

/// Default size of the per-connection buffered reader.
pub const DEFAULT_READ_BUFFER_SIZE: usize = 4096;
/// Default size of the per-connection buffered writer.
pub const DEFAULT_WRITE_BUFFER_SIZE: usize = 4096;
/// Default OS-level receive buffer per TCP connection.
pub const DEFAULT_OS_READ_BUFFER_SIZE: usize = 224 * 1024;
/// Default OS-level send buffer per TCP connection.
pub const DEFAULT_OS_WRITE_BUFFER_SIZE: usize = 224 * 1024;

/// Server configuration. Zero-valued buffer sizes select the defaults.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// TCP address to listen on, in `host:port` form.
    pub listen_addr: String,
    pub read_buffer_size: usize,
    pub write_buffer_size: usize,
    pub os_read_buffer_size: usize,
    pub os_write_buffer_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: format!("{}:{}", crate::DEFAULT_HOST, crate::DEFAULT_PORT),
            read_buffer_size: 0,
            write_buffer_size: 0,
            os_read_buffer_size: 0,
            os_write_buffer_size: 0,
        }
    }
}

impl ServerConfig {
    fn with_defaults(mut self) -> Self {
        if self.read_buffer_size == 0 {
            self.read_buffer_size = DEFAULT_READ_BUFFER_SIZE;
        }
        if self.write_buffer_size == 0 {
            self.write_buffer_size = DEFAULT_WRITE_BUFFER_SIZE;
        }
        if self.os_read_buffer_size == 0 {
            self.os_read_buffer_size = DEFAULT_OS_READ_BUFFER_SIZE;
        }
        if self.os_write_buffer_size == 0 {
            self.os_write_buffer_size = DEFAULT_OS_WRITE_BUFFER_SIZE;
        }
        self
    }
}

/// The cache server: a TCP front end over a [`Cache`].
pub struct Server<C: Cache> {
    cache: Arc<C>,
    config: ServerConfig,
    running: Option<Running>,
}

struct Running {
    local_addr: SocketAddr,
    accept_task: JoinHandle<()>,
    conns_done_rx: mpsc::Receiver<()>,
}

impl<C: Cache> Server<C> {
    pub fn new(cache: Arc<C>, config: ServerConfig) -> Self {
        Self {
            cache,
            config,
            running: None,
        }
    }

    /// Binds the listener and starts accepting connections.
    ///
    /// # Panics
    ///
    /// Panics if the server is already running; stop it first.
    pub async fn start(&mut self) -> io::Result<SocketAddr> {
        assert!(
            self.running.is_none(),
            "server is already running; call stop() before start()"
        );

        let config = self.config.clone().with_defaults();
        let listener = TcpListener::bind(&config.listen_addr).await?;
        let local_addr = listener.local_addr()?;

        // Every connection task holds a clone of this sender and nothing
        // ever sends on it; recv() yields None once they are all gone.
        let (conns_done_tx, conns_done_rx) = mpsc::channel::<()>(1);
        let cache = Arc::clone(&self.cache);
        let accept_task = tokio::spawn(accept_loop(listener, cache, config, conns_done_tx));

        info!(addr = %local_addr, "server started");
        self.running = Some(Running {
            local_addr,
            accept_task,
            conns_done_rx,
        });
        Ok(local_addr)
    }

    /// Closes the listener and waits for in-flight connections to finish.
    /// A no-op if the server is not running.
    pub async fn stop(&mut self) {
        let Some(mut running) = self.running.take() else {
            return;
        };
        running.accept_task.abort();
        let _ = running.accept_task.await;
        let _ = running.conns_done_rx.recv().await;
        info!("server stopped");
    }

    /// The bound address while running (useful with a `:0` listen port).
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }
}

async fn accept_loop<C: Cache>(
    listener: TcpListener,
    cache: Arc<C>,
    config: ServerConfig,
    conns_done_tx: mpsc::Sender<()>,
) {
    loop {
        match listener.accept().await {
            Ok((stream, addr)) => {
                if let Err(err) = configure_socket(&stream, &config) {
                    error!(error = %err, "cannot configure client socket, shutting down");
                    std::process::exit(1);
                }
                let cache = Arc::clone(&cache);
                let conns_done_tx = conns_done_tx.clone();
                let (read_buffer, write_buffer) =
                    (config.read_buffer_size, config.write_buffer_size);
                tokio::spawn(async move {
                    handle_connection(stream, addr, cache, read_buffer, write_buffer).await;
                    drop(conns_done_tx);
                });
            }
            Err(err) => {
                error!(error = %err, "failed to accept connection");
            }
        }
    }
}

/// Applies the configured OS-level buffer sizes to an accepted socket.
fn configure_socket(stream: &TcpStream, config: &ServerConfig) -> io::Result<()> {
    let socket = socket2::SockRef::from(stream);
    socket.set_recv_buffer_size(config.os_read_buffer_size)?;
    socket.set_send_buffer_size(config.os_write_buffer_size)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryCache;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn test_config() -> ServerConfig {
        ServerConfig {
            listen_addr: "127.0.0.1:0".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_start_and_stop() {
        let mut server = Server::new(Arc::new(MemoryCache::new()), test_config());
        let addr = server.start().await.unwrap();
        assert_eq!(server.local_addr(), Some(addr));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"set k 0 0 1\r\nv\r\n").await.unwrap();
        let mut buf = [0u8; 8];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"STORED\r\n");

        drop(client);
        server.stop().await;
        assert_eq!(server.local_addr(), None);

        // The listener is gone; new connections are refused.
        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_stop_waits_for_inflight_connection() {
        let mut server = Server::new(Arc::new(MemoryCache::new()), test_config());
        let addr = server.start().await.unwrap();

        let client = TcpStream::connect(addr).await.unwrap();
        // Let the accept loop pick the connection up before closing.
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let stopped = tokio::spawn(async move {
            server.stop().await;
            server
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(!stopped.is_finished());

        drop(client);
        stopped.await.unwrap();
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let mut server = Server::new(Arc::new(MemoryCache::new()), test_config());
        server.start().await.unwrap();
        server.stop().await;

        let addr = server.start().await.unwrap();
        assert!(TcpStream::connect(addr).await.is_ok());
        server.stop().await;
    }

    #[tokio::test]
    #[should_panic(expected = "already running")]
    async fn test_double_start_panics() {
        let mut server = Server::new(Arc::new(MemoryCache::new()), test_config());
        server.start().await.unwrap();
        let _ = server.start().await;
    }

    #[tokio::test]
    async fn test_stop_when_not_running_is_a_noop() {
        let mut server = Server::new(Arc::new(MemoryCache::new()), test_config());
        server.stop().await;
    }
}
