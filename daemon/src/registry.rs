//! The set of watched paths and the commands bound to each of them.
//!
//! Built once at startup and shared read-only (behind an `Arc`) by the watch
//! setup and the dispatch loop.
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::config::Config;
use crate::exec::Invocation;

/// How an event path is matched against a rule path.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathMatch {
    /// Whole-component prefix. Non-recursive rules only match the watched
    /// path itself and its direct children.
    #[default]
    Prefix,
    /// Raw substring containment of the rule path in the event path. Kept for
    /// configs that relied on it; `/var/log` also matches `/var/log2/x`.
    Contains,
}

/// One watched path and the commands it triggers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchRule {
    pub path: PathBuf,
    pub recursive: bool,
    /// Run in order; the first failure skips the rest for that event.
    pub commands: Vec<String>,
    /// Shell to run the commands through, if any.
    pub shell: Option<String>,
    pub workdir: Option<PathBuf>,
    pub timeout: Option<Duration>,
}

impl WatchRule {
    /// A rule with direct execution and no deadline.
    pub fn new(path: impl Into<PathBuf>, recursive: bool, commands: Vec<String>) -> Self {
        Self {
            path: path.into(),
            recursive,
            commands,
            shell: None,
            workdir: None,
            timeout: None,
        }
    }

    pub fn matches(&self, event_path: &Path, mode: PathMatch) -> bool {
        match mode {
            PathMatch::Prefix => {
                event_path.starts_with(&self.path)
                    && (self.recursive
                        || event_path == self.path
                        || event_path.parent() == Some(self.path.as_path()))
            }
            PathMatch::Contains => event_path
                .to_string_lossy()
                .contains(self.path.to_string_lossy().as_ref()),
        }
    }

    /// Builds the invocation for one of this rule's command lines.
    pub fn invocation(&self, line: &str) -> Invocation {
        Invocation {
            line: line.to_string(),
            shell: self.shell.clone(),
            workdir: self.workdir.clone(),
            timeout: self.timeout,
        }
    }
}

/// Ordered collection of [`WatchRule`]s, unique by path.
#[derive(Debug, Default)]
pub struct PathRegistry {
    rules: Vec<WatchRule>,
    path_match: PathMatch,
}

impl PathRegistry {
    pub fn new(path_match: PathMatch) -> Self {
        Self {
            rules: Vec::new(),
            path_match,
        }
    }

    /// Builds the registry from a validated config, normalizing every watch
    /// path. Fails if a path cannot be resolved.
    pub fn from_config(config: &Config) -> Result<Self> {
        let mut registry = Self::new(config.exec.path_match);

        for watch in &config.watch {
            let path = normalize(&watch.path, config.exec.resolve_symlinks)
                .with_context(|| format!("Can't resolve watch path {}", watch.path.display()))?;

            let mut rule = WatchRule::new(path, watch.recursive, watch.commands.clone());
            rule.shell = watch.effective_shell(&config.exec).map(str::to_string);
            rule.workdir = watch.workdir.clone();
            rule.timeout = watch.effective_timeout(&config.exec);

            if let Some(previous) = registry.insert(rule) {
                tracing::warn!(
                    path = %previous.path.display(),
                    "Duplicate watch path in config; the last entry wins"
                );
            }
        }

        Ok(registry)
    }

    /// Adds `rule`, replacing (in place) and returning any rule with the same path.
    pub fn insert(&mut self, rule: WatchRule) -> Option<WatchRule> {
        match self.rules.iter_mut().find(|r| r.path == rule.path) {
            Some(existing) => Some(std::mem::replace(existing, rule)),
            None => {
                self.rules.push(rule);
                None
            }
        }
    }

    pub fn rules(&self) -> &[WatchRule] {
        &self.rules
    }

    pub fn path_match(&self) -> PathMatch {
        self.path_match
    }

    /// Every rule whose path covers `event_path`, in registry order.
    pub fn matching<'a>(&'a self, event_path: &'a Path) -> impl Iterator<Item = &'a WatchRule> {
        let mode = self.path_match;
        self.rules.iter().filter(move |r| r.matches(event_path, mode))
    }
}

/// Makes a watch path stable for matching: canonical when `resolve_symlinks`
/// is set, otherwise lexically cleaned (no trailing slash, no `.` segments).
pub fn normalize(path: &Path, resolve_symlinks: bool) -> std::io::Result<PathBuf> {
    if resolve_symlinks {
        std::fs::canonicalize(path)
    } else {
        Ok(path.components().collect())
    }
}
