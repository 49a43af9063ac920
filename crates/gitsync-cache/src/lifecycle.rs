//! Cache enumeration, description and cleanup.
//!
//! The lifecycle manager works on the cache root as a whole, outside any single
//! build's critical section. Each deletion still takes the directory's cache
//! lock so that a running fetch is never pulled out from under its holder.
//! Deletions are also broadcast to remote agents, which apply the same
//! [`CacheMessage`] to their own cache roots.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gitsync_types::AccessData;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::lock::lock_file_for;
use crate::paths::{CachePaths, cache_key};
use crate::registry::{CacheLockRegistry, LockError};

/// Description attached to cache directories no known repository uses.
pub const UNUSED_CACHE_DESCRIPTION: &str = "Description unavailable for unused cache";

/// A repository configuration known to the host.
#[derive(Debug, Clone)]
pub struct CatalogEntry {
    /// Name of the plan or configuration that uses the repository.
    pub name: String,
    pub access: AccessData,
}

/// Source of the repository configurations currently in use.
pub trait RepositoryCatalog: Send + Sync {
    fn repositories(&self) -> Vec<CatalogEntry>;
}

impl RepositoryCatalog for Vec<CatalogEntry> {
    fn repositories(&self) -> Vec<CatalogEntry> {
        self.clone()
    }
}

/// Delivers cache messages to every active remote agent.
pub trait AgentBroadcaster: Send + Sync {
    /// Returns the names of the agents the message was sent to.
    fn broadcast(&self, message: &CacheMessage) -> Vec<String>;
}

/// A broadcaster for hosts without remote agents.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAgents;

impl AgentBroadcaster for NoAgents {
    fn broadcast(&self, _message: &CacheMessage) -> Vec<String> {
        Vec::new()
    }
}

/// Cross-host cleanup instruction. Idempotent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "keys", rename_all = "snake_case")]
pub enum CacheMessage {
    /// Delete the named cache directories.
    DeleteSpecified(Vec<String>),
    /// Delete every cache directory except the named ones.
    DeleteUnused(Vec<String>),
}

impl CacheMessage {
    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(json: &str) -> serde_json::Result<Self> {
        serde_json::from_str(json)
    }
}

/// One cache directory as shown to an administrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheDescription {
    pub key: String,
    pub path: PathBuf,
    pub description: String,
    /// Names of the configurations using this cache; empty when orphaned.
    pub used_by: Vec<String>,
}

impl CacheDescription {
    pub fn is_orphaned(&self) -> bool {
        self.used_by.is_empty()
    }
}

/// What happened to one cache key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeletionOutcome {
    Deleted,
    /// Nothing to delete under that key.
    Skipped,
    Failed(String),
}

/// Per-key results of a delete request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeletionReport {
    pub outcomes: Vec<(String, DeletionOutcome)>,
    /// Remote agents the deletion was forwarded to.
    pub agents: Vec<String>,
}

impl DeletionReport {
    pub fn is_empty(&self) -> bool {
        self.outcomes.is_empty()
    }

    pub fn deleted(&self) -> impl Iterator<Item = &str> {
        self.with_outcome(|o| matches!(o, DeletionOutcome::Deleted))
    }

    pub fn skipped(&self) -> impl Iterator<Item = &str> {
        self.with_outcome(|o| matches!(o, DeletionOutcome::Skipped))
    }

    pub fn failed(&self) -> impl Iterator<Item = &str> {
        self.with_outcome(|o| matches!(o, DeletionOutcome::Failed(_)))
    }

    fn with_outcome<F>(&self, pred: F) -> impl Iterator<Item = &str>
    where
        F: Fn(&DeletionOutcome) -> bool,
    {
        self.outcomes
            .iter()
            .filter(move |(_, outcome)| pred(outcome))
            .map(|(key, _)| key.as_str())
    }

    /// Human-readable lines, one per key plus a broadcast note.
    pub fn messages(&self) -> Vec<String> {
        if self.outcomes.is_empty() && self.agents.is_empty() {
            return vec!["No caches to delete".to_string()];
        }
        let mut lines: Vec<String> = self
            .outcomes
            .iter()
            .map(|(key, outcome)| match outcome {
                DeletionOutcome::Deleted => format!("Deleted cache {}", key),
                DeletionOutcome::Skipped => format!("Cache {} does not exist, skipped", key),
                DeletionOutcome::Failed(reason) => {
                    format!("Failed to delete cache {}: {}", key, reason)
                }
            })
            .collect();
        if !self.agents.is_empty() {
            lines.push(format!(
                "Scheduled the same deletion on agents: {}",
                self.agents.join(", ")
            ));
        }
        lines
    }
}

/// Enumerates, describes and deletes cache directories.
pub struct CacheLifecycle {
    paths: CachePaths,
    catalog: Arc<dyn RepositoryCatalog>,
    broadcaster: Arc<dyn AgentBroadcaster>,
    locks: Arc<CacheLockRegistry>,
}

impl CacheLifecycle {
    pub fn new(
        paths: CachePaths,
        catalog: Arc<dyn RepositoryCatalog>,
        broadcaster: Arc<dyn AgentBroadcaster>,
        locks: Arc<CacheLockRegistry>,
    ) -> Self {
        Self {
            paths,
            catalog,
            broadcaster,
            locks,
        }
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    /// Describes every cache in use and every orphaned directory on disk.
    pub fn describe_all(&self) -> io::Result<Vec<CacheDescription>> {
        let mut used: BTreeMap<String, (AccessData, Vec<String>)> = BTreeMap::new();
        for entry in self.catalog.repositories() {
            let key = cache_key(&entry.access);
            used.entry(key)
                .or_insert_with(|| (entry.access.clone(), Vec::new()))
                .1
                .push(entry.name);
        }

        let mut descriptions: Vec<CacheDescription> = used
            .iter()
            .map(|(key, (access, names))| CacheDescription {
                key: key.clone(),
                path: self.paths.cache_dir_for_key(key),
                description: describe(access),
                used_by: names.clone(),
            })
            .collect();

        for key in list_cache_dirs(&self.paths.cache_root())? {
            if !used.contains_key(&key) {
                descriptions.push(CacheDescription {
                    path: self.paths.cache_dir_for_key(&key),
                    key,
                    description: UNUSED_CACHE_DESCRIPTION.to_string(),
                    used_by: Vec::new(),
                });
            }
        }

        Ok(descriptions)
    }

    /// Deletes the named caches here and on every remote agent.
    pub fn delete_specific(&self, keys: &[String]) -> DeletionReport {
        if keys.is_empty() {
            log::info!("No cache directories to delete");
            return DeletionReport::default();
        }

        let outcomes = keys
            .iter()
            .map(|key| (key.clone(), self.delete_key(key)))
            .collect();

        let agents = self
            .broadcaster
            .broadcast(&CacheMessage::DeleteSpecified(keys.to_vec()));
        DeletionReport { outcomes, agents }
    }

    /// Deletes every cache no catalog entry uses, here and on remote agents.
    pub fn delete_unused(&self) -> io::Result<DeletionReport> {
        let used: BTreeSet<String> = self
            .catalog
            .repositories()
            .iter()
            .map(|entry| cache_key(&entry.access))
            .collect();
        self.delete_unused_except(&used.into_iter().collect::<Vec<_>>())
    }

    /// Deletes every cache except `active_keys`, here and on remote agents.
    pub fn delete_unused_except(&self, active_keys: &[String]) -> io::Result<DeletionReport> {
        let outcomes = list_cache_dirs(&self.paths.cache_root())?
            .into_iter()
            .filter(|key| !active_keys.contains(key))
            .map(|key| {
                let outcome = self.delete_key(&key);
                (key, outcome)
            })
            .collect();

        let agents = self
            .broadcaster
            .broadcast(&CacheMessage::DeleteUnused(active_keys.to_vec()));
        Ok(DeletionReport { outcomes, agents })
    }

    fn delete_key(&self, key: &str) -> DeletionOutcome {
        if !is_cache_key(key) {
            return DeletionOutcome::Failed("not a cache directory name".to_string());
        }
        delete_cache_dir(&self.locks, &self.paths.cache_dir_for_key(key))
    }
}

/// Applies a cache message received from another host to the local cache root.
///
/// Unknown keys are skipped, so delivering the same message twice is harmless.
pub fn apply_message(
    message: &CacheMessage,
    paths: &CachePaths,
    locks: &CacheLockRegistry,
) -> io::Result<DeletionReport> {
    let root = paths.cache_root();
    let existing = list_cache_dirs(&root)?;
    let targets: Vec<String> = match message {
        CacheMessage::DeleteSpecified(keys) => keys
            .iter()
            .filter(|key| existing.contains(key))
            .cloned()
            .collect(),
        CacheMessage::DeleteUnused(keep) => existing
            .into_iter()
            .filter(|key| !keep.contains(key))
            .collect(),
    };

    if targets.is_empty() {
        log::info!("No cache directories to delete found");
    }

    let outcomes = targets
        .into_iter()
        .map(|key| {
            let outcome = delete_cache_dir(locks, &root.join(&key));
            (key, outcome)
        })
        .collect();
    Ok(DeletionReport {
        outcomes,
        agents: Vec::new(),
    })
}

/// `URL: '<url>', Username: '<user>' (shallow clones, remote agent caching)`
pub fn describe(access: &AccessData) -> String {
    let mut out = format!("URL: '{}'", without_password(access.url()));
    if let Some(username) = access.username() {
        out.push_str(&format!(", Username: '{}'", username));
    }

    let mut features = Vec::with_capacity(2);
    if access.is_shallow() {
        features.push("shallow clones");
    }
    if access.uses_remote_agent_cache() {
        features.push("remote agent caching");
    }
    if !features.is_empty() {
        out.push_str(&format!(" ({})", features.join(", ")));
    }
    out
}

/// `url` with any embedded password removed. Anything that does not parse
/// as a URL (scp-like syntax, local paths) is returned unchanged.
fn without_password(url: &str) -> String {
    match Url::parse(url) {
        Ok(mut parsed) if parsed.password().is_some() => match parsed.set_password(None) {
            Ok(()) => parsed.to_string(),
            Err(()) => url.to_string(),
        },
        _ => url.to_string(),
    }
}

/// Names of the directories directly under the cache root, sorted.
/// A missing cache root has no caches.
fn list_cache_dirs(root: &Path) -> io::Result<Vec<String>> {
    let entries = match fs::read_dir(root) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };

    let mut names = Vec::new();
    for entry in entries {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
    }
    names.sort();
    Ok(names)
}

fn is_cache_key(key: &str) -> bool {
    !key.is_empty() && !key.starts_with('.') && !key.contains(['/', '\\'])
}

fn delete_cache_dir(locks: &CacheLockRegistry, dir: &Path) -> DeletionOutcome {
    if !dir.is_dir() {
        return DeletionOutcome::Skipped;
    }

    let lock = locks.lock_for(dir);
    let result = lock.with_lock(|| -> Result<(), DeleteError> {
        fs::remove_dir_all(dir)?;
        match fs::remove_file(lock_file_for(dir)) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => {
                log::warn!("Unable to remove lock file of {}: {}", dir.display(), e)
            }
            _ => {}
        }
        Ok(())
    });

    match result {
        Ok(()) => {
            log::info!("Successfully deleted cache directory: {}", dir.display());
            DeletionOutcome::Deleted
        }
        Err(e) => {
            log::error!("Failed to delete cache directory {}: {}", dir.display(), e);
            DeletionOutcome::Failed(e.to_string())
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum DeleteError {
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error(transparent)]
    Io(#[from] io::Error),
}
