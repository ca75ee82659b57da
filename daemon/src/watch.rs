//! Filesystem subscriptions: one `notify` watcher per registered path, all
//! feeding the same bounded event queue.
use std::path::PathBuf;

use notify::{Config as NotifyConfig, RecommendedWatcher, RecursiveMode, Watcher};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::event::FileEvent;
use crate::registry::{PathRegistry, WatchRule};

/// A configured path could not be watched. Fatal at startup.
#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Can't stat watch path {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Watch path {path} is neither a directory nor a regular file")]
    UnsupportedType { path: PathBuf },

    #[error("Failed to create watcher for {path}: {source}")]
    Init {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },

    #[error("Failed to watch {path}: {source}")]
    Watch {
        path: PathBuf,
        #[source]
        source: notify::Error,
    },
}

struct Subscription {
    path: PathBuf,
    watcher: RecommendedWatcher,
}

/// The live watchers for every rule in a [`PathRegistry`].
pub struct Subscriptions {
    subs: Vec<Subscription>,
}

impl Subscriptions {
    /// Starts one watcher per rule. Each watcher forwards close-after-write and
    /// move-into events to `tx`, blocking its backend thread while the queue
    /// is full.
    ///
    /// Fails on the first path that cannot be watched; watchers already
    /// started are dropped.
    pub fn start(registry: &PathRegistry, tx: mpsc::Sender<FileEvent>) -> Result<Self, WatchError> {
        let subs = registry
            .rules()
            .iter()
            .map(|rule| subscribe(rule, tx.clone()))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { subs })
    }

    pub fn len(&self) -> usize {
        self.subs.len()
    }

    /// Unwatches every path and drops the watchers.
    pub fn stop(self) {
        for mut sub in self.subs {
            match sub.watcher.unwatch(&sub.path) {
                Ok(()) => tracing::info!(path = %sub.path.display(), "Stopped watch path"),
                Err(e) => tracing::warn!(
                    path = %sub.path.display(),
                    error = %e,
                    "Can't unwatch path"
                ),
            }
        }
    }
}

fn subscribe(rule: &WatchRule, tx: mpsc::Sender<FileEvent>) -> Result<Subscription, WatchError> {
    let meta = std::fs::metadata(&rule.path).map_err(|source| WatchError::Stat {
        path: rule.path.clone(),
        source,
    })?;
    if !(meta.is_dir() || meta.is_file()) {
        return Err(WatchError::UnsupportedType { path: rule.path.clone() });
    }

    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<notify::Event>| match res {
            Ok(event) => {
                for file_event in FileEvent::from_notify(&event) {
                    // The dispatcher is gone once shutdown has drained.
                    if tx.blocking_send(file_event).is_err() {
                        return;
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "File watch error"),
        },
        NotifyConfig::default(),
    )
    .map_err(|source| WatchError::Init {
        path: rule.path.clone(),
        source,
    })?;

    let mode = if rule.recursive {
        RecursiveMode::Recursive
    } else {
        RecursiveMode::NonRecursive
    };
    watcher.watch(&rule.path, mode).map_err(|source| WatchError::Watch {
        path: rule.path.clone(),
        source,
    })?;

    tracing::info!(
        path = %rule.path.display(),
        recursive = rule.recursive,
        "Started watch path"
    );

    Ok(Subscription {
        path: rule.path.clone(),
        watcher,
    })
}
