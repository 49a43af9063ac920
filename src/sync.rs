//! Build-facing orchestration over one repository.
//!
//! Every mutation of a shared cache directory happens inside that
//! directory's [`CacheLock`](gitsync_cache::CacheLock). A failure that is not
//! a transport failure is treated as local corruption: the directory is
//! deleted and the step is retried exactly once (see [`with_recovery`]).

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use gitsync_cache::{CacheLockRegistry, CachePaths};
use gitsync_types::{AccessData, CommitRecord};

use crate::error::GitError;
use crate::ops::{GitOperations, Identity};

/// Author of the placeholder commit reported when changes can't be listed.
pub const UNKNOWN_AUTHOR: &str = "Unknown";

/// Creates the operation helper for an access record.
pub trait OperationsProvider: Send + Sync {
    fn operations_for(&self, access: &AccessData) -> Box<dyn GitOperations>;
}

/// Where the build consuming the source runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Host {
    /// On the machine that owns the shared caches.
    Local,
    /// On a remote agent. Uses a cache only when the repository asks for the
    /// remote agent cache.
    Remote,
}

/// Result of change detection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildChanges {
    /// Revision the build should use.
    pub revision: String,
    /// Newest first.
    pub commits: Vec<CommitRecord>,
    pub skipped: usize,
}

impl BuildChanges {
    pub fn unchanged(revision: impl Into<String>) -> Self {
        Self {
            revision: revision.into(),
            commits: Vec::new(),
            skipped: 0,
        }
    }
}

/// Runs `attempt`; after a non-transport failure deletes `dir` and runs it
/// once more. A second failure is reported together with the first.
pub fn with_recovery<T, F>(dir: &Path, operation: &str, mut attempt: F) -> Result<T, GitError>
where
    F: FnMut() -> Result<T, GitError>,
{
    let first = match attempt() {
        Ok(value) => return Ok(value),
        Err(e) if e.is_transport() => return Err(e),
        Err(e) => e,
    };

    log::warn!(
        "Failed to {} in {}, deleting directory: {}",
        operation,
        dir.display(),
        first
    );
    remove_directory(dir);
    log::info!("Retrying {} once in {}", operation, dir.display());

    attempt().map_err(|retry| GitError::RecoveryFailed {
        first: Box::new(first),
        retry: Box::new(retry),
    })
}

fn remove_directory(dir: &Path) {
    match fs::remove_dir_all(dir) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => log::error!("Unable to delete {}: {}, expect trouble", dir.display(), e),
    }
}

/// Makes sure `revision` names a commit in `cache_dir`, fetching it once
/// more when it does not. A missing revision never deletes the cache.
fn ensure_in_cache(ops: &dyn GitOperations, cache_dir: &Path, revision: &str) -> Result<(), GitError> {
    if ops.revision_exists(cache_dir, revision)? {
        return Ok(());
    }
    log::info!("{} is not in {} yet, fetching it", revision, cache_dir.display());
    ops.fetch(cache_dir, revision, false)?;
    if ops.revision_exists(cache_dir, revision)? {
        Ok(())
    } else {
        Err(GitError::NotFound(format!(
            "revision {} in cache {}",
            revision,
            cache_dir.display()
        )))
    }
}

/// One repository as seen by a build.
pub struct RepositorySync {
    access: AccessData,
    provider: Arc<dyn OperationsProvider>,
    paths: CachePaths,
    locks: Arc<CacheLockRegistry>,
    host: Host,
    shallow_clones: bool,
}

impl RepositorySync {
    pub fn new(
        access: AccessData,
        provider: Arc<dyn OperationsProvider>,
        paths: CachePaths,
        locks: Arc<CacheLockRegistry>,
    ) -> Self {
        Self {
            access,
            provider,
            paths,
            locks,
            host: Host::Local,
            shallow_clones: true,
        }
    }

    pub fn on_host(mut self, host: Host) -> Self {
        self.host = host;
        self
    }

    /// Global switch; shallow fetches also need the repository to ask for them.
    pub fn shallow_clones(mut self, enabled: bool) -> Self {
        self.shallow_clones = enabled;
        self
    }

    pub fn access(&self) -> &AccessData {
        &self.access
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.paths.cache_dir(&self.access)
    }

    fn uses_cache(&self) -> bool {
        self.host == Host::Local || self.access.uses_remote_agent_cache()
    }

    /// Changes since `last`, or up to `custom` when given.
    ///
    /// With no `last` the cache is only primed. When the commits can't be
    /// listed even after recovery, a single placeholder commit by
    /// [`UNKNOWN_AUTHOR`] is returned instead.
    pub fn collect_changes(&self, last: Option<&str>, custom: Option<&str>) -> Result<BuildChanges, GitError> {
        let ops = self.provider.operations_for(&self.access);
        let latest = ops.obtain_latest_revision()?;
        let fetch_revision = custom.unwrap_or(self.access.branch());
        let target = custom.unwrap_or(&latest);

        if custom.is_none() && last == Some(latest.as_str()) {
            return Ok(BuildChanges::unchanged(latest));
        }

        let cache_dir = self.cache_dir();
        let lock = self.locks.lock_for(&cache_dir);

        let Some(last) = last else {
            log::info!("Repository never checked, fetching {}", fetch_revision);
            lock.with_lock(|| {
                with_recovery(&cache_dir, "fetch cache", || {
                    ops.fetch(&cache_dir, fetch_revision, false)
                })
            })?;
            return Ok(BuildChanges::unchanged(target));
        };

        let extracted = lock.with_lock(|| {
            with_recovery(&cache_dir, "collect changes", || {
                ops.fetch(&cache_dir, fetch_revision, false)?;
                ops.extract_commits(&cache_dir, Some(last), target)
            })
        });

        match extracted {
            Ok(batch) if !batch.commits.is_empty() => Ok(BuildChanges {
                revision: target.to_string(),
                commits: batch.commits,
                skipped: batch.skipped,
            }),
            Ok(_) => Ok(unknown_changes(&latest, last, target)),
            Err(e @ (GitError::Lock(_) | GitError::Configuration(_))) => Err(e),
            Err(e) if e.is_transport() => Err(e),
            Err(e) => {
                log::error!("Failed to extract changes between {} and {}: {}", last, target, e);
                Ok(unknown_changes(&latest, last, target))
            }
        }
    }

    /// Checks out `revision` (the latest one when `None`) into `source_dir`
    /// and returns it.
    pub fn retrieve_source(&self, revision: Option<&str>, source_dir: &Path, depth: u32) -> Result<String, GitError> {
        let shallow = self.shallow_clones && self.access.is_shallow() && depth == 1 && self.host != Host::Local;
        let access = self.access.to_builder().shallow(shallow).build()?;
        let ops = self.provider.operations_for(&access);

        let revision = match revision {
            Some(revision) => revision.to_string(),
            None => ops.obtain_latest_revision()?,
        };
        let branch = access.branch();
        let previous = source_dir
            .join(".git")
            .is_dir()
            .then(|| ops.current_revision(source_dir).ok())
            .flatten();

        if self.uses_cache() {
            let cache_dir = self.paths.cache_dir(&access);
            return self.locks.lock_for(&cache_dir).with_lock(|| {
                with_recovery(&cache_dir, "fetch cache", || ops.fetch(&cache_dir, branch, false))?;
                ensure_in_cache(ops.as_ref(), &cache_dir, &revision)?;

                let mut previous = previous.clone();
                with_recovery(source_dir, "checkout", || {
                    ops.checkout(Some(&cache_dir), source_dir, &revision, previous.take().as_deref())
                })
            });
        }

        let mut shallow = shallow;
        let mut previous = previous;
        with_recovery(source_dir, "fetch and checkout", || {
            ops.fetch(source_dir, branch, std::mem::replace(&mut shallow, false))?;
            ops.checkout(None, source_dir, &revision, previous.take().as_deref())
        })
    }

    /// Fetches `target` and merges it into `workspace_dir` without
    /// committing. True when the merge changed something.
    pub fn merge_workspace_with(
        &self,
        workspace_dir: &Path,
        target: &str,
        identity: &Identity,
    ) -> Result<bool, GitError> {
        let access = self.access.to_builder().shallow(false).build()?;
        let ops = self.provider.operations_for(&access);

        let revision = if self.uses_cache() {
            let cache_dir = self.paths.cache_dir(&access);
            self.locks.lock_for(&cache_dir).with_lock(|| {
                with_recovery(&cache_dir, "fetch cache", || ops.fetch(&cache_dir, target, false))?;
                ensure_in_cache(ops.as_ref(), &cache_dir, target)?;
                // The workspace borrows the cache's objects but not its refs.
                ops.commit_at(&cache_dir, target).map(|commit| commit.id)
            })?
        } else {
            with_recovery(workspace_dir, "fetch workspace", || {
                ops.fetch(workspace_dir, target, false)
            })?;
            target.to_string()
        };

        ops.merge(workspace_dir, &revision, identity)
    }

    /// The commit at the tip of the configured branch. Fetches only when the
    /// cache does not have it yet.
    pub fn last_commit(&self) -> Result<CommitRecord, GitError> {
        let ops = self.provider.operations_for(&self.access);
        let target = ops.obtain_latest_revision()?;
        let cache_dir = self.cache_dir();

        self.locks.lock_for(&cache_dir).with_lock(|| {
            match ops.commit_at(&cache_dir, &target) {
                Ok(commit) => {
                    log::info!("Found {} as the last commit", commit.id);
                    Ok(commit)
                }
                Err(e) => {
                    log::debug!("{} not in cache ({}), fetching", target, e);
                    ops.fetch(&cache_dir, &target, false)?;
                    ops.commit_at(&cache_dir, &target)
                }
            }
        })
    }

    pub fn open_branches(&self) -> Result<Vec<String>, GitError> {
        self.provider.operations_for(&self.access).open_branches()
    }

    pub fn commit(&self, source_dir: &Path, message: &str, identity: &Identity) -> Result<String, GitError> {
        self.provider
            .operations_for(&self.access)
            .commit(source_dir, message, identity)
    }

    pub fn push(&self, source_dir: &Path) -> Result<(), GitError> {
        self.provider.operations_for(&self.access).push(source_dir)
    }
}

fn unknown_changes(latest: &str, last: &str, target: &str) -> BuildChanges {
    let mut commit = CommitRecord::new(target, UNKNOWN_AUTHOR, Utc::now());
    commit.message = format!("Unable to detect changes between {} and {}", last, target);
    BuildChanges {
        revision: latest.to_string(),
        commits: vec![commit],
        skipped: 0,
    }
}
