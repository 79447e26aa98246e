//! Background Expiry Sweeper
//!
//! Lazy expiry only reclaims an entry when somebody touches its key; a key
//! that expires and is never looked up again would sit in memory forever.
//! The sweeper is a small tokio task that periodically asks the in-memory
//! engine to reclaim expired entries (and stale dogpile marks along the way).

use super::MemoryCache;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

/// Configuration for the expiry sweeper.
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// Interval between sweeps.
    pub interval: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(500),
        }
    }
}

/// Handle to the running sweeper. Dropping it stops the task.
#[derive(Debug)]
pub struct ExpirySweeper {
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts the sweeper as a background task.
    pub fn start(cache: MemoryCache, config: SweeperConfig) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::spawn(sweeper_loop(cache, config, shutdown_rx));
        info!("background expiry sweeper started");
        Self { shutdown_tx }
    }

    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn sweeper_loop(
    cache: MemoryCache,
    config: SweeperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(config.interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("expiry sweeper shutting down");
                    return;
                }
            }
        }

        let removed = cache.cleanup_expired();
        if removed > 0 {
            debug!(removed, remaining = cache.len(), "reclaimed expired entries");
        }
    }
}

/// Starts the sweeper with default configuration.
pub fn start_expiry_sweeper(cache: MemoryCache) -> ExpirySweeper {
    ExpirySweeper::start(cache, SweeperConfig::default())
}
