//! Configuration file watcher for hot reload.
//!
//! Only the rate-limit policy table is applied live; every other section
//! is read once at startup. The watcher therefore forwards just the
//! `rate_limit` section, and only when it actually changed.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::RateLimitConfig;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Watches the service config file and publishes rate-limit changes.
pub struct ConfigWatcher {
    path: PathBuf,
    current: Arc<Mutex<RateLimitConfig>>,
    update_tx: mpsc::UnboundedSender<RateLimitConfig>,
}

impl ConfigWatcher {
    /// `initial` is the rate-limit section the service started with.
    pub fn new(path: &Path, initial: RateLimitConfig) -> (Self, mpsc::UnboundedReceiver<RateLimitConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            current: Arc::new(Mutex::new(initial)),
            update_tx,
        };
        (watcher, update_rx)
    }

    /// Start watching. Drop the returned handle to stop.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self {
            path,
            current,
            update_tx,
        } = self;
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| match res {
                Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
                    if let Some(rate_limit) = reload(&watched, &current) {
                        let _ = update_tx.send(rate_limit);
                    }
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = ?e, "Config watch error"),
            },
            Config::default().with_poll_interval(POLL_INTERVAL),
        )?;

        watcher.watch(&path, RecursiveMode::NonRecursive)?;
        tracing::info!(path = %path.display(), "Config watcher started");
        Ok(watcher)
    }
}

/// Re-read `path`; returns the new rate-limit section if it is valid and differs.
fn reload(path: &Path, current: &Mutex<RateLimitConfig>) -> Option<RateLimitConfig> {
    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "Config reload rejected, keeping current policies");
            return None;
        }
    };

    let mut current = match current.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    if *current == config.rate_limit {
        tracing::debug!(path = %path.display(), "Config changed outside rate_limit; nothing to apply");
        return None;
    }
    *current = config.rate_limit.clone();
    tracing::info!(path = %path.display(), "Rate limit section changed, reloading");
    Some(config.rate_limit)
}
