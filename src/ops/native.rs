//! The native backend: every operation is a `git` child process.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use gitsync_types::{CommitBatch, CommitRecord};

use super::history::{CommitLogParser, log_format, shallow_commits};
use super::refs::{
    DEFAULT_BRANCH, FetchPlan, HEADS_PREFIX, RemoteRefs, branch_names, is_fully_qualified, parse_ls_remote,
    resolve_branch,
};
use super::{
    Backend, GitOperations, Identity, OperationContext, ensure_fetch_head, has_work_tree_repo, remove_index_lock,
};
use crate::command::{CommandOutput, CommandRunner, GitCommand};
use crate::error::GitError;
use crate::proxy::RepositoryAccess;

const ENCODING_OPTION: &str = "--encoding=UTF-8";
/// Depth used to turn a shallow repository into a complete one.
const UNBOUNDED_DEPTH: &str = "--depth=99999999";
const REMOTE_ORIGIN: &str = "refs/remotes/origin/";

/// Thin wrapper over the git executable for one set of secrets.
///
/// Every command gets the configured executable, the ssh wrapper script and
/// a runner whose redactor knows the secrets in play.
pub struct GitCli {
    executable: Option<PathBuf>,
    ssh_script: Option<PathBuf>,
    runner: CommandRunner,
    verbose: bool,
}

impl GitCli {
    pub fn new(executable: Option<PathBuf>, ssh_script: Option<PathBuf>, runner: CommandRunner) -> Self {
        Self {
            executable,
            ssh_script,
            runner,
            verbose: false,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn command<I, S>(&self, verbs: I) -> GitCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        GitCommand::new(verbs)
            .executable(self.executable.as_deref())
            .ssh_script(self.ssh_script.as_deref())
    }

    pub fn run(&self, command: &GitCommand, dir: &Path) -> Result<CommandOutput, GitError> {
        self.runner.run(command, dir)
    }

    pub fn init(&self, dir: &Path) -> Result<(), GitError> {
        self.run(&self.command(["init"]), dir)?;
        Ok(())
    }

    /// `status --porcelain` lines, untracked files excluded.
    pub fn status(&self, dir: &Path) -> Result<Vec<String>, GitError> {
        let output = self.run(
            &self.command(["status", "--porcelain", "--untracked-files=no"]),
            dir,
        )?;
        Ok(output.lines().map(str::to_string).collect())
    }

    pub fn ls_remote(&self, dir: &Path, url: &str) -> Result<RemoteRefs, GitError> {
        let output = self.run(&self.command(["ls-remote", url]), dir)?;
        Ok(parse_ls_remote(&output.stdout))
    }

    /// Fetches `refspec`. A non-shallow fetch into a shallow repository
    /// asks for unbounded depth so the history is completed.
    pub fn fetch(&self, dir: &Path, url: &str, refspec: &str, shallow: bool) -> Result<(), GitError> {
        let mut command = self.command(["fetch", url, refspec, "--update-head-ok"]);
        if shallow {
            command = command.shallow();
        } else if dir.join(".git").join("shallow").exists() {
            log::info!(
                "Converting {} to a full clone while fetching {}",
                dir.display(),
                refspec
            );
            command = command.arg(UNBOUNDED_DEPTH);
        }
        if self.verbose {
            command = command.verbose(true).arg("--progress");
        }
        self.run(&command, dir)?;
        ensure_fetch_head(dir)
    }

    /// Clones `cache_dir` without checking out, borrowing its objects through
    /// `objects/info/alternates`.
    pub fn local_clone(&self, dir: &Path, cache_dir: &Path) -> Result<(), GitError> {
        let cache = cache_dir.to_string_lossy();
        let command = self
            .command(["clone".to_string(), format!("file://{}", cache)])
            .args(["-n", "--reference"])
            .arg(cache.into_owned())
            .destination(dir.to_string_lossy());
        self.run(&command, dir)?;
        Ok(())
    }

    pub fn checkout_force(&self, dir: &Path, destination: &str) -> Result<(), GitError> {
        self.run(&self.command(["checkout", "-f", destination]), dir)?;
        Ok(())
    }

    pub fn submodule_update(&self, dir: &Path) -> Result<(), GitError> {
        self.run(
            &self.command(["submodule", "update", "--init", "--recursive"]),
            dir,
        )?;
        Ok(())
    }

    /// Full hash of `revision`.
    pub fn revision_hash(&self, dir: &Path, revision: &str) -> Result<String, GitError> {
        let output = self.run(
            &self.command(["log", "-1", ENCODING_OPTION, "--format=%H", revision]),
            dir,
        )?;
        Ok(output.stdout.trim().to_string())
    }

    /// Full hash of the commit `revision` names, or `None` when it names none.
    pub fn verify_commit(&self, dir: &Path, revision: &str) -> Result<Option<String>, GitError> {
        let command = self.command(["rev-parse", "--verify", "--quiet"]).arg(format!("{}^{{commit}}", revision));
        let output = self.runner.run_allowing(&command, dir, &[1])?;
        let hash = output.stdout.trim();
        Ok((!hash.is_empty()).then(|| hash.to_string()))
    }

    /// The branch to check out instead of `revision`, so HEAD is not left
    /// detached. Empty when `revision` is not the tip of the configured
    /// branch, or when a local branch of that name points elsewhere.
    pub fn possible_branch(&self, dir: &Path, revision: &str, configured: &str) -> Result<String, GitError> {
        let branch = Some(configured.trim())
            .filter(|b| !b.is_empty())
            .map(|b| b.strip_prefix(HEADS_PREFIX).unwrap_or(b))
            .unwrap_or(DEFAULT_BRANCH);
        // show-ref exits with 1 when nothing matches.
        let output = self
            .runner
            .run_allowing(&self.command(["show-ref", branch]), dir, &[1])?;

        let mut remote_match = false;
        for line in output.lines() {
            let mut parts = line.split_whitespace();
            let (Some(sha), Some(name)) = (parts.next(), parts.last()) else {
                continue;
            };
            if name.strip_prefix(HEADS_PREFIX) == Some(branch) {
                return Ok(if sha == revision {
                    branch.to_string()
                } else {
                    String::new()
                });
            }
            if name.strip_prefix(REMOTE_ORIGIN) == Some(branch) && sha == revision {
                remote_match = true;
            }
        }
        Ok(if remote_match {
            branch.to_string()
        } else {
            String::new()
        })
    }

    pub fn log(&self, dir: &Path, range: &[&str], parser: &CommitLogParser) -> Result<CommitBatch, GitError> {
        let command = self
            .command(["log", "-p", "--name-only", ENCODING_OPTION])
            .arg(log_format())
            .args(range.iter().copied());
        let output = self.run(&command, dir)?;
        parser.parse(&output.stdout)
    }
}

/// Operation helper backed by the git executable.
pub struct NativeGit {
    ctx: OperationContext,
    executable: Option<PathBuf>,
    ssh_script: Option<PathBuf>,
}

impl NativeGit {
    pub fn new(ctx: OperationContext, executable: Option<PathBuf>, ssh_script: Option<PathBuf>) -> Self {
        Self {
            ctx,
            executable,
            ssh_script,
        }
    }

    fn cli(&self, secrets: &[String]) -> GitCli {
        let runner = CommandRunner::new(self.ctx.command_timeout(), self.ctx.redactor(secrets));
        GitCli::new(self.executable.clone(), self.ssh_script.clone(), runner)
            .verbose(self.ctx.access.is_verbose())
    }

    fn remote_refs(&self, cli: &GitCli, dir: &Path, access: &RepositoryAccess) -> Result<Arc<RemoteRefs>, GitError> {
        self.ctx
            .ref_cache
            .get_or_fetch(&self.ctx.access, || cli.ls_remote(dir, &access.url))
    }

    fn scratch_dir() -> PathBuf {
        std::env::temp_dir()
    }

    fn create_local_repository(&self, cli: &GitCli, dir: &Path, cache_dir: Option<&Path>) -> Result<(), GitError> {
        if has_work_tree_repo(dir) {
            return Ok(());
        }
        std::fs::create_dir_all(dir)?;
        match cache_dir.filter(|cache| cache.is_dir()) {
            Some(cache) => cli.local_clone(dir, cache),
            None => cli.init(dir),
        }
    }

    fn contains_something_to_commit(&self, cli: &GitCli, dir: &Path) -> Result<bool, GitError> {
        if dir.join(".git").join("MERGE_HEAD").is_file() {
            log::debug!("Has modified index");
            return Ok(true);
        }
        Ok(!cli.status(dir)?.is_empty())
    }
}

impl GitOperations for NativeGit {
    fn backend(&self) -> Backend {
        Backend::Native
    }

    fn obtain_latest_revision(&self) -> Result<String, GitError> {
        let access = self.ctx.adapter.adjust(&self.ctx.access)?;
        let cli = self.cli(&access.secrets);
        let refs = self.remote_refs(&cli, &Self::scratch_dir(), &access)?;
        let branch = self.ctx.access.branch();
        resolve_branch(&refs, branch)
            .map(|(_, hash)| hash.to_string())
            .ok_or_else(|| {
                GitError::NotFound(format!(
                    "latest revision of branch '{}' in {}",
                    branch,
                    cli.runner.redactor().mask(self.ctx.access.url())
                ))
            })
    }

    fn fetch(&self, target_dir: &Path, target: &str, shallow: bool) -> Result<(), GitError> {
        let target = Some(target.trim())
            .filter(|t| !t.is_empty())
            .unwrap_or(self.ctx.access.branch());
        let base = self.cli(&[]);
        self.create_local_repository(&base, target_dir, None)?;

        // The registration, if any, is released when `access` drops.
        let access = self.ctx.adapter.adjust(&self.ctx.access)?;
        let cli = self.cli(&access.secrets);

        let plan = if is_fully_qualified(target) {
            FetchPlan::exact(target)
        } else {
            let remote = self.remote_refs(&cli, target_dir, &access)?;
            FetchPlan::resolve(&remote, target).ok_or_else(|| {
                GitError::NotFound(format!(
                    "branch or revision '{}' in {}",
                    target,
                    cli.runner.redactor().mask(&access.url)
                ))
            })?
        };

        log::info!(
            "Fetching {} into {}{}",
            plan.refspec,
            target_dir.display(),
            if shallow { " (shallow)" } else { "" }
        );
        cli.fetch(target_dir, &access.url, &plan.refspec, shallow)?;

        if let Some(commit) = &plan.commit {
            if !self.revision_exists(target_dir, commit)? {
                return Err(GitError::NotFound(format!("revision {}", commit)));
            }
        } else if let Some(branch) = plan.local_branch() {
            cli.checkout_force(target_dir, branch)?;
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
        log::info!(
            "Checking out {} in {}{}",
            target_revision,
            target_dir.display(),
            previous_revision
                .map(|prev| format!(" (was {})", prev))
                .unwrap_or_default()
        );
        let cli = self.cli(&[]);
        self.create_local_repository(&cli, target_dir, cache_dir)?;
        remove_index_lock(target_dir);

        let branch = cli.possible_branch(target_dir, target_revision, self.ctx.access.branch())?;
        let destination = if branch.is_empty() {
            target_revision
        } else {
            branch.as_str()
        };
        cli.checkout_force(target_dir, destination)?;
        if self.ctx.access.submodules() {
            cli.submodule_update(target_dir)?;
        }
        Ok(target_revision.to_string())
    }

    fn extract_commits(&self, repo_dir: &Path, from: Option<&str>, to: &str) -> Result<CommitBatch, GitError> {
        let range = match from.filter(|f| !f.trim().is_empty() && *f != to) {
            Some(from) => vec![format!("{}..{}", from, to)],
            None => vec![to.to_string(), "-1".to_string()],
        };
        log::info!("Extracting commits {:?} from {}", range, repo_dir.display());
        let parser = CommitLogParser::new(shallow_commits(repo_dir), self.ctx.max_commits);
        let range: Vec<&str> = range.iter().map(String::as_str).collect();
        self.cli(&[]).log(repo_dir, &range, &parser)
    }

    fn commit_at(&self, repo_dir: &Path, revision: &str) -> Result<CommitRecord, GitError> {
        let cli = self.cli(&[]);
        let command = cli
            .command(["log", "-1", ENCODING_OPTION])
            .arg(log_format())
            .arg(revision);
        let output = cli.run(&command, repo_dir)?;
        CommitLogParser::new(HashSet::new(), 1)
            .parse(&output.stdout)?
            .commits
            .into_iter()
            .next()
            .ok_or_else(|| GitError::NotFound(format!("commit with revision {}", revision)))
    }

    fn current_revision(&self, repo_dir: &Path) -> Result<String, GitError> {
        self.cli(&[]).revision_hash(repo_dir, "HEAD")
    }

    fn revision_exists(&self, repo_dir: &Path, revision: &str) -> Result<bool, GitError> {
        if !has_work_tree_repo(repo_dir) {
            return Ok(false);
        }
        Ok(self.cli(&[]).verify_commit(repo_dir, revision)?.is_some())
    }

    fn open_branches(&self) -> Result<Vec<String>, GitError> {
        let access = self.ctx.adapter.adjust(&self.ctx.access)?;
        let cli = self.cli(&access.secrets);
        let refs = self.remote_refs(&cli, &Self::scratch_dir(), &access)?;
        Ok(branch_names(&refs))
    }

    fn commit(&self, repo_dir: &Path, message: &str, identity: &Identity) -> Result<String, GitError> {
        let cli = self.cli(&[]);
        if !self.contains_something_to_commit(&cli, repo_dir)? {
            log::debug!("Nothing to commit");
            return self.current_revision(repo_dir);
        }
        let command = cli
            .command(["commit", "-m", message, "--all"])
            .envs(identity.environment())
            .verbose(self.ctx.access.is_verbose());
        cli.run(&command, repo_dir)?;
        self.current_revision(repo_dir)
    }

    fn push(&self, repo_dir: &Path) -> Result<(), GitError> {
        let cli = self.cli(&[]);
        let revision = self.current_revision(repo_dir)?;
        let branch = cli.possible_branch(repo_dir, &revision, self.ctx.access.branch())?;
        if branch.is_empty() {
            return Err(GitError::InvalidInput("Can't guess branch name".to_string()));
        }

        let access = self.ctx.adapter.adjust(&self.ctx.access)?;
        let cli = self.cli(&access.secrets);
        let command = cli
            .command(["push", access.url.as_str(), branch.as_str()])
            .verbose(self.ctx.access.is_verbose());
        cli.run(&command, repo_dir)?;
        refs_changed(&self.ctx);
        Ok(())
    }

    fn merge(&self, repo_dir: &Path, revision: &str, identity: &Identity) -> Result<bool, GitError> {
        let cli = self.cli(&[]);
        let before = self.current_revision(repo_dir)?;
        let command = cli
            .command(["merge", "--no-commit", revision])
            .envs(identity.environment());
        cli.run(&command, repo_dir)?;

        if self.contains_something_to_commit(&cli, repo_dir)? {
            return Ok(true);
        }
        let after = self.current_revision(repo_dir)?;
        log::debug!("Revision before merge: {}, after merge: {}", before, after);
        Ok(after != before)
    }
}

/// A push moves remote refs; the memoized listing is stale.
fn refs_changed(ctx: &OperationContext) {
    ctx.ref_cache.invalidate(&ctx.access);
}
