//! embercache - A Text-Protocol Cache Server
//!
//! Entry point: parses command-line flags, wires the in-memory cache and
//! its expiry sweeper to the TCP server, and runs until interrupted.

use embercache::cache::{start_expiry_sweeper, MemoryCache};
use embercache::{Server, ServerConfig};
use std::sync::Arc;
use tokio::signal;
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

/// Server configuration assembled from the command line.
struct Config {
    listen: String,
    read_buffer_size: usize,
    write_buffer_size: usize,
    os_read_buffer_size: usize,
    os_write_buffer_size: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: format!("{}:{}", embercache::DEFAULT_HOST, embercache::DEFAULT_PORT),
            read_buffer_size: 0,
            write_buffer_size: 0,
            os_read_buffer_size: 0,
            os_write_buffer_size: 0,
        }
    }
}

impl Config {
    /// Parse configuration from command-line arguments
    fn from_args() -> Self {
        let mut config = Config::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--listen" | "-l" => {
                    config.listen = take_value(&args, i, "--listen");
                    i += 2;
                }
                "--read-buffer" => {
                    config.read_buffer_size = take_size(&args, i, "--read-buffer");
                    i += 2;
                }
                "--write-buffer" => {
                    config.write_buffer_size = take_size(&args, i, "--write-buffer");
                    i += 2;
                }
                "--os-read-buffer" => {
                    config.os_read_buffer_size = take_size(&args, i, "--os-read-buffer");
                    i += 2;
                }
                "--os-write-buffer" => {
                    config.os_write_buffer_size = take_size(&args, i, "--os-write-buffer");
                    i += 2;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("embercache version {}", embercache::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        config
    }
}

fn take_value(args: &[String], i: usize, flag: &str) -> String {
    match args.get(i + 1) {
        Some(value) => value.clone(),
        None => {
            eprintln!("Error: {flag} requires a value");
            std::process::exit(1);
        }
    }
}

fn take_size(args: &[String], i: usize, flag: &str) -> usize {
    take_value(args, i, flag).parse().unwrap_or_else(|_| {
        eprintln!("Error: {flag} requires a byte count");
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
embercache - A Text-Protocol Cache Server

USAGE:
    embercache [OPTIONS]

OPTIONS:
    -l, --listen <ADDR>          Address to listen on (default: 127.0.0.1:11211)
        --read-buffer <BYTES>    Per-connection read buffer (default: 4096)
        --write-buffer <BYTES>   Per-connection write buffer (default: 4096)
        --os-read-buffer <BYTES> OS receive buffer per socket (default: 229376)
        --os-write-buffer <BYTES> OS send buffer per socket (default: 229376)
    -v, --version                Print version information
        --help                   Print this help message

CONNECTING:
    Any memcached text-protocol client works:
    $ printf 'set greeting 0 0 5\r\nhello\r\nget greeting\r\n' | nc 127.0.0.1 11211
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::from_args();

    // Set up logging
    let _subscriber = FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .init();

    // The sweeper reclaims expired entries that are never read again.
    let cache = MemoryCache::new();
    let _sweeper = start_expiry_sweeper(cache.clone());

    let mut server = Server::new(
        Arc::new(cache),
        ServerConfig {
            listen_addr: config.listen.clone(),
            read_buffer_size: config.read_buffer_size,
            write_buffer_size: config.write_buffer_size,
            os_read_buffer_size: config.os_read_buffer_size,
            os_write_buffer_size: config.os_write_buffer_size,
        },
    );
    server.start().await?;
    info!(addr = %config.listen, "ready to accept connections");

    signal::ctrl_c().await?;
    info!("shutdown signal received, stopping server");
    server.stop().await;
    info!("server shutdown complete");
    Ok(())
}
