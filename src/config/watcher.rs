//! Configuration file watcher for hot reload.
//!
//! Only settings that are safe to change at runtime are applied from a
//! reload (spending limits and retry policy); wallets and chains require a
//! restart. Editors often emit several events per save, so a reload is
//! forwarded only when a reloadable section actually changed.

use notify::{Config, Event, RecommendedWatcher, RecursiveMode, Watcher};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::config::loader::load_config;
use crate::config::schema::AppConfig;

/// Serialized form of one config section, used to detect edits.
fn fingerprint<T: Serialize>(section: &T) -> String {
    serde_json::to_string(section).unwrap_or_default()
}

/// Remembers what was last applied and decides whether a freshly loaded
/// file is worth forwarding.
#[derive(Debug, Clone)]
pub struct ReloadFilter {
    reloadable: String,
    chains: String,
    wallets: String,
}

impl ReloadFilter {
    pub fn new(current: &AppConfig) -> Self {
        Self {
            reloadable: Self::reloadable(current),
            chains: fingerprint(&current.chains),
            wallets: fingerprint(&current.wallets),
        }
    }

    fn reloadable(config: &AppConfig) -> String {
        fingerprint(&(&config.spending_limits, &config.submitter))
    }

    /// Sections that changed in `next` but only take effect on restart.
    pub fn restart_only_changes(&self, next: &AppConfig) -> Vec<&'static str> {
        let mut changed = Vec::new();
        if fingerprint(&next.chains) != self.chains {
            changed.push("chains");
        }
        if fingerprint(&next.wallets) != self.wallets {
            changed.push("wallets");
        }
        changed
    }

    /// Returns true (and records `next` as applied) when a reloadable
    /// section differs from the last forwarded config.
    pub fn accept(&mut self, next: &AppConfig) -> bool {
        let reloadable = Self::reloadable(next);
        if reloadable == self.reloadable {
            return false;
        }
        self.reloadable = reloadable;
        true
    }
}

/// A watcher that monitors the configuration file for changes.
pub struct ConfigWatcher {
    path: PathBuf,
    filter: ReloadFilter,
    update_tx: mpsc::UnboundedSender<AppConfig>,
}

impl ConfigWatcher {
    /// Returns the watcher and a receiver for validated, changed configs.
    pub fn new(path: &Path, current: &AppConfig) -> (Self, mpsc::UnboundedReceiver<AppConfig>) {
        let (update_tx, update_rx) = mpsc::unbounded_channel();
        let watcher = Self {
            path: path.to_path_buf(),
            filter: ReloadFilter::new(current),
            update_tx,
        };
        (watcher, update_rx)
    }

    /// Start watching the file in a background thread.
    ///
    /// The returned handle must be kept alive for as long as updates are wanted.
    pub fn run(self) -> Result<RecommendedWatcher, notify::Error> {
        let Self {
            path,
            mut filter,
            update_tx,
        } = self;
        let watched = path.clone();

        let mut watcher = RecommendedWatcher::new(
            move |res: notify::Result<Event>| {
                let event = match res {
                    Ok(event) => event,
                    Err(e) => {
                        tracing::error!(error = ?e, "Config watch error");
                        return;
                    }
                };
                if !(event.kind.is_modify() || event.kind.is_create()) {
                    return;
                }
                let next = match load_config(&path) {
                    Ok(next) => next,
                    Err(e) => {
                        tracing::error!(error = %e, "Reload failed. Keeping current configuration.");
                        return;
                    }
                };
                let ignored = filter.restart_only_changes(&next);
                if !ignored.is_empty() {
                    tracing::warn!(sections = ?ignored, "Changes to these sections apply after a restart");
                }
                if filter.accept(&next) {
                    tracing::info!(path = %path.display(), "Config change detected");
                    let _ = update_tx.send(next);
                }
            },
            Config::default().with_poll_interval(Duration::from_secs(2)),
        )?;

        watcher.watch(&watched, RecursiveMode::NonRecursive)?;

        tracing::info!(path = %watched.display(), "Config watcher started");
        Ok(watcher)
    }
}
