//! Fetch, checkout and history operations behind one interface.
//!
//! Two backends implement [`GitOperations`]: [`NativeGit`] drives the `git`
//! executable and [`LibraryGit`] uses libgit2. Callers pick one per
//! repository and never branch on which one they hold, except where an
//! operation returns [`GitError::Unsupported`].

mod library;
pub mod history;
mod native;
pub mod probe;
pub mod refs;

use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gitsync_types::{AccessData, CommitBatch, CommitRecord};

use crate::command::{DEFAULT_COMMAND_TIMEOUT, Redactor};
use crate::error::GitError;
use crate::proxy::CredentialAdapter;

pub use library::LibraryGit;
pub use native::{GitCli, NativeGit};
pub use probe::GitProbe;
pub use refs::RemoteRefCache;

/// Which implementation is doing the work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Native,
    Library,
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Backend::Native => write!(f, "native git"),
            Backend::Library => write!(f, "libgit2"),
        }
    }
}

/// Committer and author for commit and merge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub name: String,
    pub email: String,
}

impl Identity {
    pub fn new(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
        }
    }

    /// Environment understood by `git commit` and `git merge`.
    pub fn environment(&self) -> [(&'static str, String); 4] {
        [
            ("GIT_COMMITTER_NAME", self.name.clone()),
            ("GIT_COMMITTER_EMAIL", self.email.clone()),
            ("GIT_AUTHOR_NAME", self.name.clone()),
            ("GIT_AUTHOR_EMAIL", self.email.clone()),
        ]
    }
}

/// Everything an operation helper needs besides its backend specifics.
#[derive(Clone)]
pub struct OperationContext {
    pub access: AccessData,
    pub adapter: CredentialAdapter,
    pub ref_cache: Arc<RemoteRefCache>,
    pub max_commits: usize,
    pub default_timeout: Duration,
}

impl OperationContext {
    pub fn new(access: AccessData, adapter: CredentialAdapter, ref_cache: Arc<RemoteRefCache>) -> Self {
        Self {
            access,
            adapter,
            ref_cache,
            max_commits: 100,
            default_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    pub fn with_max_commits(mut self, max_commits: usize) -> Self {
        self.max_commits = max_commits;
        self
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Per-process timeout: the record's own, else the configured default.
    pub fn command_timeout(&self) -> Duration {
        self.access.command_timeout().unwrap_or(self.default_timeout)
    }

    /// Masks this record's secrets plus `extra`.
    pub fn redactor(&self, extra: &[String]) -> Redactor {
        Redactor::new(self.access.secrets()).with(extra)
    }
}

/// The fetch/checkout/history protocol for one repository.
pub trait GitOperations: Send + Sync {
    fn backend(&self) -> Backend;

    /// Hash the configured branch points at on the remote. Does not touch
    /// local state.
    fn obtain_latest_revision(&self) -> Result<String, GitError>;

    /// Fetches `target` (a branch, tag, fully qualified ref or commit id;
    /// blank means the configured branch) into the repository at
    /// `target_dir`, creating it when needed. A non-shallow fetch into a
    /// shallow repository deepens it.
    fn fetch(&self, target_dir: &Path, target: &str, shallow: bool) -> Result<(), GitError>;

    /// Forces the working tree at `target_dir` to `target_revision`, sharing
    /// objects with `cache_dir` when the repository has to be created.
    fn checkout(
        &self,
        cache_dir: Option<&Path>,
        target_dir: &Path,
        target_revision: &str,
        previous_revision: Option<&str>,
    ) -> Result<String, GitError>;

    /// Commits in `from..to`, newest first, or just `to` when there is no
    /// usable `from`.
    fn extract_commits(&self, repo_dir: &Path, from: Option<&str>, to: &str) -> Result<CommitBatch, GitError>;

    /// The single commit at `revision`, without files.
    fn commit_at(&self, repo_dir: &Path, revision: &str) -> Result<CommitRecord, GitError>;

    fn current_revision(&self, repo_dir: &Path) -> Result<String, GitError>;

    fn revision_exists(&self, repo_dir: &Path, revision: &str) -> Result<bool, GitError>;

    /// Branch names advertised by the remote.
    fn open_branches(&self) -> Result<Vec<String>, GitError>;

    /// Commits every tracked change. Returns the new head, or the current one
    /// when there is nothing to commit.
    fn commit(&self, repo_dir: &Path, message: &str, identity: &Identity) -> Result<String, GitError>;

    fn push(&self, repo_dir: &Path) -> Result<(), GitError>;

    /// Merges `revision` without committing. True when the merge changed
    /// something.
    fn merge(&self, repo_dir: &Path, revision: &str, identity: &Identity) -> Result<bool, GitError>;
}

/// Removes a stale `index.lock` left by an interrupted git process.
pub(crate) fn remove_index_lock(repo_dir: &Path) {
    let lock = repo_dir.join(".git").join("index.lock");
    match std::fs::remove_file(&lock) {
        Ok(()) => log::info!("Removed stale {}", lock.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => log::warn!("Could not remove {}: {}", lock.display(), e),
    }
}

/// Checks the file git writes after every fetch. Some servers answer a
/// fetch with nothing and no error.
pub(crate) fn ensure_fetch_head(repo_dir: &Path) -> Result<(), GitError> {
    let fetch_head = repo_dir.join(".git").join("FETCH_HEAD");
    match std::fs::read_to_string(&fetch_head) {
        Ok(content) if !content.trim().is_empty() => Ok(()),
        Ok(_) | Err(_) => Err(GitError::Parse("FETCH_HEAD is empty after fetch".to_string())),
    }
}

pub(crate) fn has_work_tree_repo(dir: &Path) -> bool {
    dir.join(".git").is_dir()
}
