//! The libgit2 backend. Reads and fetches only; writing operations report
//! [`GitError::Unsupported`].

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;

use chrono::DateTime;
use git2::build::CheckoutBuilder;
use git2::{
    AutotagOption, Commit, Cred, CredentialType, Direction, FetchOptions, Oid, Remote, RemoteCallbacks, Repository,
    Sort,
};
use gitsync_types::{CommitBatch, CommitRecord, Secret};

use super::history::shallow_commits;
use super::refs::{DEFAULT_BRANCH, FetchPlan, HEADS_PREFIX, RemoteRefs, branch_names, is_fully_qualified, resolve_branch};
use super::{
    Backend, GitOperations, Identity, OperationContext, ensure_fetch_head, has_work_tree_repo, remove_index_lock,
};
use crate::command::Redactor;
use crate::error::{GitError, LibraryResultExt};
use crate::proxy::ProxyCredentials;

/// libgit2 asks again after a rejected credential; give up after this many.
const MAX_AUTH_ATTEMPTS: usize = 3;

/// Credentials and masking for one operation.
struct Session {
    credentials: Option<ProxyCredentials>,
    username: Option<String>,
    redactor: Redactor,
}

impl Session {
    fn callbacks(&self) -> RemoteCallbacks<'_> {
        let mut callbacks = RemoteCallbacks::new();
        let mut attempts = 0;
        callbacks.credentials(move |_url, url_user, allowed| {
            attempts += 1;
            if attempts > MAX_AUTH_ATTEMPTS {
                return Err(git2::Error::from_str("authentication failed"));
            }
            let user = self.username.as_deref().or(url_user).unwrap_or("git");
            match &self.credentials {
                Some(ProxyCredentials::KeyPair {
                    private_key,
                    passphrase,
                }) if allowed.contains(CredentialType::SSH_MEMORY) => Cred::ssh_key_from_memory(
                    user,
                    None,
                    private_key.expose(),
                    passphrase.as_ref().map(Secret::expose),
                ),
                Some(ProxyCredentials::Password(password)) if allowed.contains(CredentialType::USER_PASS_PLAINTEXT) => {
                    Cred::userpass_plaintext(user, password.expose())
                }
                _ if allowed.contains(CredentialType::USERNAME) => Cred::username(user),
                _ => Cred::default(),
            }
        });
        callbacks
    }
}

/// Operation helper backed by libgit2.
pub struct LibraryGit {
    ctx: OperationContext,
}

impl LibraryGit {
    pub fn new(ctx: OperationContext) -> Self {
        Self { ctx }
    }

    fn session(&self) -> Result<Session, GitError> {
        let credentials = self.ctx.adapter.resolve(&self.ctx.access)?;
        let extra: Vec<String> = match &credentials {
            Some(ProxyCredentials::KeyPair {
                private_key,
                passphrase,
            }) => std::iter::once(private_key)
                .chain(passphrase.as_ref())
                .map(|secret| secret.expose().to_string())
                .collect(),
            _ => Vec::new(),
        };
        Ok(Session {
            credentials,
            username: self.ctx.access.username().map(str::to_string),
            redactor: self.ctx.redactor(&extra),
        })
    }

    fn list_remote(&self, session: &Session) -> Result<RemoteRefs, GitError> {
        let redactor = &session.redactor;
        let mut remote = Remote::create_detached(self.ctx.access.url()).masked(redactor)?;
        let connection = remote
            .connect_auth(Direction::Fetch, Some(session.callbacks()), None)
            .masked(redactor)?;
        let refs = connection
            .list()
            .masked(redactor)?
            .iter()
            .filter(|head| !head.name().contains("^{}"))
            .map(|head| (head.name().to_string(), head.oid().to_string()))
            .collect();
        Ok(refs)
    }

    fn remote_refs(&self, session: &Session) -> Result<Arc<RemoteRefs>, GitError> {
        self.ctx
            .ref_cache
            .get_or_fetch(&self.ctx.access, || self.list_remote(session))
    }

    fn open(&self, repo_dir: &Path) -> Result<Repository, GitError> {
        Repository::open(repo_dir).masked(&self.ctx.redactor(&[]))
    }

    fn open_or_init(&self, repo_dir: &Path) -> Result<Repository, GitError> {
        if has_work_tree_repo(repo_dir) {
            return self.open(repo_dir);
        }
        fs::create_dir_all(repo_dir)?;
        Repository::init(repo_dir).masked(&self.ctx.redactor(&[]))
    }

    fn force_checkout_branch(repo: &Repository, branch: &str) -> Result<(), git2::Error> {
        repo.set_head(&format!("{}{}", HEADS_PREFIX, branch))?;
        repo.checkout_head(Some(CheckoutBuilder::new().force()))
    }

    /// Local branch to attach HEAD to after checking out `commit`. A branch
    /// missing locally is created when the cache's copy of it is at `commit`.
    fn possible_branch(repo: &Repository, cache_dir: Option<&Path>, commit: &Commit<'_>, configured: &str) -> Option<String> {
        let branch = Some(configured.trim())
            .filter(|b| !b.is_empty())
            .map(|b| b.strip_prefix(HEADS_PREFIX).unwrap_or(b))
            .unwrap_or(DEFAULT_BRANCH);
        let reference = format!("{}{}", HEADS_PREFIX, branch);

        if let Ok(local) = repo.refname_to_id(&reference) {
            return (local == commit.id()).then(|| branch.to_string());
        }
        let cached = cache_dir
            .and_then(|dir| Repository::open(dir).ok())
            .and_then(|cache| cache.refname_to_id(&reference).ok());
        if cached == Some(commit.id()) && repo.branch(branch, commit, false).is_ok() {
            return Some(branch.to_string());
        }
        None
    }

    fn record(repo: &Repository, commit: &Commit<'_>, shallows: &HashSet<String>, with_files: bool) -> Result<CommitRecord, git2::Error> {
        let author = commit.author();
        let timestamp = DateTime::from_timestamp(commit.time().seconds(), 0).unwrap_or_default();
        let mut record = CommitRecord::new(commit.id().to_string(), author.name().unwrap_or_default(), timestamp);
        record.email = author.email().filter(|e| !e.is_empty()).map(str::to_string);
        record.message = commit.message().unwrap_or_default().trim_end().to_string();

        if with_files && !shallows.contains(&record.id) {
            let parent_tree = match commit.parent_count() {
                0 => None,
                _ => Some(commit.parent(0)?.tree()?),
            };
            let diff = repo.diff_tree_to_tree(parent_tree.as_ref(), Some(&commit.tree()?), None)?;
            for delta in diff.deltas() {
                if let Some(path) = delta.new_file().path().or_else(|| delta.old_file().path()) {
                    record.add_file(path.to_string_lossy());
                }
            }
        }
        Ok(record)
    }
}

/// Points `repo` at the object store of `cache_dir` so a checkout does not
/// copy objects.
fn link_alternates(repo: &Repository, cache_dir: &Path) -> std::io::Result<()> {
    let objects = [cache_dir.join(".git").join("objects"), cache_dir.join("objects")]
        .into_iter()
        .find(|dir| dir.is_dir());
    let Some(objects) = objects else {
        return Ok(());
    };
    let info = repo.path().join("objects").join("info");
    fs::create_dir_all(&info)?;
    fs::write(info.join("alternates"), format!("{}\n", objects.display()))
}

fn changed_files(repo: &Repository, previous: &str, commit: &Commit<'_>) -> Result<usize, git2::Error> {
    let old = repo.revparse_single(previous)?.peel_to_tree()?;
    let diff = repo.diff_tree_to_tree(Some(&old), Some(&commit.tree()?), None)?;
    Ok(diff.deltas().len())
}

impl GitOperations for LibraryGit {
    fn backend(&self) -> Backend {
        Backend::Library
    }

    fn obtain_latest_revision(&self) -> Result<String, GitError> {
        let session = self.session()?;
        let refs = self.remote_refs(&session)?;
        let branch = self.ctx.access.branch();
        resolve_branch(&refs, branch)
            .map(|(_, hash)| hash.to_string())
            .ok_or_else(|| {
                GitError::NotFound(format!(
                    "latest revision of branch '{}' in {}",
                    branch,
                    session.redactor.mask(self.ctx.access.url())
                ))
            })
    }

    fn fetch(&self, target_dir: &Path, target: &str, shallow: bool) -> Result<(), GitError> {
        let target = Some(target.trim())
            .filter(|t| !t.is_empty())
            .unwrap_or(self.ctx.access.branch());
        let session = self.session()?;
        let redactor = &session.redactor;
        let repo = self.open_or_init(target_dir)?;

        let plan = if is_fully_qualified(target) {
            FetchPlan::exact(target)
        } else {
            let refs = self.remote_refs(&session)?;
            FetchPlan::resolve(&refs, target).ok_or_else(|| {
                GitError::NotFound(format!(
                    "branch or revision '{}' in {}",
                    target,
                    redactor.mask(self.ctx.access.url())
                ))
            })?
        };

        let mut options = FetchOptions::new();
        options
            .remote_callbacks(session.callbacks())
            .download_tags(AutotagOption::None)
            .update_fetchhead(true);
        if shallow {
            options.depth(1);
        } else if repo.is_shallow() {
            log::info!(
                "Converting {} to a full clone while fetching {}",
                target_dir.display(),
                plan.refspec
            );
            options.depth(i32::MAX);
        }

        log::info!(
            "Fetching {} into {} with {}{}",
            plan.refspec,
            target_dir.display(),
            Backend::Library,
            if shallow { " (shallow)" } else { "" }
        );
        let mut remote = repo.remote_anonymous(self.ctx.access.url()).masked(redactor)?;
        remote
            .fetch(&[plan.refspec.as_str()], Some(&mut options), None)
            .masked(redactor)?;
        ensure_fetch_head(target_dir)?;

        if let Some(commit) = &plan.commit {
            if !self.revision_exists(target_dir, commit)? {
                return Err(GitError::NotFound(format!("revision {}", commit)));
            }
        } else if let Some(branch) = plan.local_branch() {
            Self::force_checkout_branch(&repo, branch).masked(redactor)?;
        }
        Ok(())
    }

    fn checkout(
        &self,
        cache_dir: Option<&Path>,
        target_dir: &Path,
        target_revision: &str,
        previous_revision: Option<&str>,
    ) -> Result<String, GitError> {
        let redactor = self.ctx.redactor(&[]);
        let cache_dir = cache_dir.filter(|dir| dir.is_dir());
        let repo = if has_work_tree_repo(target_dir) {
            self.open(target_dir)?
        } else {
            let repo = self.open_or_init(target_dir)?;
            match cache_dir {
                Some(cache) => {
                    link_alternates(&repo, cache)?;
                    // Reopen so the object database picks up the alternates.
                    self.open(target_dir)?
                }
                None => repo,
            }
        };
        remove_index_lock(target_dir);

        let commit = repo
            .revparse_single(target_revision)
            .and_then(|object| object.peel_to_commit())
            .masked(&redactor)?;
        repo.checkout_tree(commit.as_object(), Some(CheckoutBuilder::new().force()))
            .masked(&redactor)?;
        let head = match Self::possible_branch(&repo, cache_dir, &commit, self.ctx.access.branch()) {
            Some(branch) => repo.set_head(&format!("{}{}", HEADS_PREFIX, branch)),
            None => repo.set_head_detached(commit.id()),
        };
        head.masked(&redactor)?;

        match previous_revision.map(|previous| (previous, changed_files(&repo, previous, &commit))) {
            Some((previous, Ok(count))) => {
                log::info!(
                    "Checked out {} in {}, {} files changed since {}",
                    commit.id(),
                    target_dir.display(),
                    count,
                    previous
                )
            }
            Some((previous, Err(e))) => log::debug!("Could not diff against {}: {}", previous, e.message()),
            None => log::info!("Checked out {} in {}", commit.id(), target_dir.display()),
        }
        if self.ctx.access.submodules() {
            log::warn!("Submodules are not updated by {}", Backend::Library);
        }
        Ok(commit.id().to_string())
    }

    fn extract_commits(&self, repo_dir: &Path, from: Option<&str>, to: &str) -> Result<CommitBatch, GitError> {
        let redactor = self.ctx.redactor(&[]);
        let repo = self.open(repo_dir)?;
        let shallows = shallow_commits(repo_dir);
        let to_commit = repo
            .revparse_single(to)
            .and_then(|object| object.peel_to_commit())
            .masked(&redactor)?;

        let mut batch = CommitBatch::default();
        let Some(from) = from.filter(|f| !f.trim().is_empty() && *f != to) else {
            batch
                .commits
                .push(Self::record(&repo, &to_commit, &shallows, true).masked(&redactor)?);
            return Ok(batch);
        };

        let walk = || -> Result<Vec<Oid>, git2::Error> {
            let mut walk = repo.revwalk()?;
            walk.set_sorting(Sort::TOPOLOGICAL | Sort::TIME)?;
            walk.push(to_commit.id())?;
            walk.hide(repo.revparse_single(from)?.peel_to_commit()?.id())?;
            walk.collect()
        };
        for oid in walk().masked(&redactor)? {
            if batch.commits.len() >= self.ctx.max_commits {
                batch.skipped += 1;
                continue;
            }
            let commit = repo.find_commit(oid).masked(&redactor)?;
            batch
                .commits
                .push(Self::record(&repo, &commit, &shallows, true).masked(&redactor)?);
        }
        Ok(batch)
    }

    fn commit_at(&self, repo_dir: &Path, revision: &str) -> Result<CommitRecord, GitError> {
        let repo = self.open(repo_dir)?;
        let commit = repo
            .revparse_single(revision)
            .and_then(|object| object.peel_to_commit())
            .map_err(|_| GitError::NotFound(format!("commit with revision {}", revision)))?;
        Self::record(&repo, &commit, &HashSet::new(), false).masked(&self.ctx.redactor(&[]))
    }

    fn current_revision(&self, repo_dir: &Path) -> Result<String, GitError> {
        let repo = self.open(repo_dir)?;
        let head = repo
            .head()
            .and_then(|head| head.peel_to_commit())
            .masked(&self.ctx.redactor(&[]))?;
        Ok(head.id().to_string())
    }

    fn revision_exists(&self, repo_dir: &Path, revision: &str) -> Result<bool, GitError> {
        if !has_work_tree_repo(repo_dir) {
            return Ok(false);
        }
        let repo = self.open(repo_dir)?;
        Ok(repo
            .revparse_single(revision)
            .and_then(|object| object.peel_to_commit())
            .is_ok())
    }

    fn open_branches(&self) -> Result<Vec<String>, GitError> {
        let session = self.session()?;
        let refs = self.remote_refs(&session)?;
        Ok(branch_names(&refs))
    }

    fn commit(&self, _repo_dir: &Path, _message: &str, _identity: &Identity) -> Result<String, GitError> {
        Err(GitError::unsupported("commit", Backend::Library))
    }

    fn push(&self, _repo_dir: &Path) -> Result<(), GitError> {
        Err(GitError::unsupported("push", Backend::Library))
    }

    fn merge(&self, _repo_dir: &Path, _revision: &str, _identity: &Identity) -> Result<bool, GitError> {
        Err(GitError::unsupported("merge", Backend::Library))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ops::RemoteRefCache;
    use crate::ops::testing::{file_url, git, git_available, upstream};
    use crate::proxy::{CredentialAdapter, InMemoryCredentials, LocalProxyRegistry};
    use gitsync_types::AccessData;
    use std::time::Duration;
    use tempfile::tempdir;

    fn library(url: &str) -> LibraryGit {
        let access = AccessData::builder(url).branch("master").build().unwrap();
        let adapter = CredentialAdapter::new(
            Arc::new(LocalProxyRegistry::new("127.0.0.1", 2222)),
            Arc::new(InMemoryCredentials::new()),
        );
        LibraryGit::new(OperationContext::new(
            access,
            adapter,
            Arc::new(RemoteRefCache::new(Duration::ZERO)),
        ))
    }

    #[test]
    fn test_lists_remote_refs() {
        if !git_available() {
            return;
        }
        let tmp = tempdir().unwrap();
        let hashes = upstream(&tmp.path().join("up"), 2);
        let ops = library(&file_url(&tmp.path().join("up")));
        assert_eq!(ops.obtain_latest_revision().unwrap(), hashes[1]);
        assert_eq!(ops.open_branches().unwrap(), vec!["master"]);
    }

    #[test]
    fn test_fetch_checkout_and_history() {
        if !git_available() {
            return;
        }
        let tmp = tempdir().unwrap();
        let hashes = upstream(&tmp.path().join("up"), 3);
        let ops = library(&file_url(&tmp.path().join("up")));
        let cache = tmp.path().join("cache");
        let work = tmp.path().join("work");

        ops.fetch(&cache, "", false).unwrap();
        assert_eq!(ops.current_revision(&cache).unwrap(), hashes[2]);
        assert!(ops.revision_exists(&cache, &hashes[0]).unwrap());
        assert!(!ops.revision_exists(&cache, &"0".repeat(40)).unwrap());

        ops.checkout(Some(&cache), &work, &hashes[0], None).unwrap();
        assert!(work.join("file0.txt").exists());
        assert!(!work.join("file1.txt").exists());
        assert!(work.join(".git/objects/info/alternates").exists());

        ops.checkout(Some(&cache), &work, &hashes[2], Some(&hashes[0])).unwrap();
        assert!(work.join("file2.txt").exists());
        assert_eq!(git(&work, &["rev-parse", "--abbrev-ref", "HEAD"]), "master");

        let batch = ops.extract_commits(&cache, Some(&hashes[0]), &hashes[2]).unwrap();
        let ids: Vec<_> = batch.commits.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, vec![hashes[2].as_str(), hashes[1].as_str()]);
        assert_eq!(batch.commits[1].files[0].path, "file1.txt");
        assert_eq!(batch.commits[1].message, "commit 1");

        let record = ops.commit_at(&cache, &hashes[0]).unwrap();
        assert_eq!(record.author, "Test");
        assert_eq!(record.email.as_deref(), Some("test@example.com"));
        assert!(record.files.is_empty());
    }

    #[test]
    fn test_full_fetch_completes_shallow_cache() {
        if !git_available() {
            return;
        }
        let tmp = tempdir().unwrap();
        upstream(&tmp.path().join("up"), 4);
        let ops = library(&file_url(&tmp.path().join("up")));
        let cache = tmp.path().join("cache");

        // libgit2's local transport may ignore the depth, so only the
        // completed state is checked.
        ops.fetch(&cache, "master", true).unwrap();
        ops.fetch(&cache, "master", false).unwrap();
        assert_eq!(git(&cache, &["rev-list", "--count", "HEAD"]), "4");
        assert!(!ops.open(&cache).unwrap().is_shallow());
    }

    #[test]
    fn test_branch_names_are_revisions() {
        if !git_available() {
            return;
        }
        let tmp = tempdir().unwrap();
        let up = tmp.path().join("up");
        upstream(&up, 1);
        git(&up, &["branch", "feature"]);
        let ops = library(&file_url(&up));
        let cache = tmp.path().join("cache");

        ops.fetch(&cache, "feature", false).unwrap();
        assert!(ops.revision_exists(&cache, "feature").unwrap());
        assert!(ops.revision_exists(&cache, "refs/heads/feature").unwrap());
        assert!(!ops.revision_exists(&cache, "nope").unwrap());
    }

    #[test]
    fn test_history_is_capped() {
        if !git_available() {
            return;
        }
        let tmp = tempdir().unwrap();
        let hashes = upstream(&tmp.path().join("up"), 5);
        let mut ops = library(&file_url(&tmp.path().join("up")));
        ops.ctx.max_commits = 2;
        let cache = tmp.path().join("cache");
        ops.fetch(&cache, "", false).unwrap();

        let batch = ops.extract_commits(&cache, Some(&hashes[0]), &hashes[4]).unwrap();
        assert_eq!(batch.commits.len(), 2);
        assert_eq!(batch.skipped, 2);
        assert_eq!(batch.commits[0].id, hashes[4]);
    }

    #[test]
    fn test_writes_are_unsupported() {
        let tmp = tempdir().unwrap();
        let ops = library("https://example.com/r.git");
        let identity = Identity::new("a", "a@example.com");
        assert!(matches!(
            ops.commit(tmp.path(), "m", &identity),
            Err(GitError::Unsupported { .. })
        ));
        assert!(matches!(ops.push(tmp.path()), Err(GitError::Unsupported { .. })));
        assert!(matches!(
            ops.merge(tmp.path(), "HEAD", &identity),
            Err(GitError::Unsupported { .. })
        ));
    }

    #[test]
    fn test_unknown_target_is_not_found() {
        if !git_available() {
            return;
        }
        let tmp = tempdir().unwrap();
        upstream(&tmp.path().join("up"), 1);
        let ops = library(&file_url(&tmp.path().join("up")));
        assert!(matches!(
            ops.fetch(&tmp.path().join("cache"), "no-such-branch", false),
            Err(GitError::NotFound(_))
        ));
    }
}
