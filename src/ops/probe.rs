//! Memoized `git version` checks.

use std::path::{Path, PathBuf};
use std::time::Duration;

use gitsync_cache::TtlCache;

use crate::command::{CommandRunner, GitCommand, Redactor};
use crate::error::GitError;

const PROBE_TTL: Duration = Duration::from_secs(15 * 60);
const PROBE_TIMEOUT: Duration = Duration::from_secs(60);
const VERSION_PREFIX: &str = "git version ";

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ProbeKey {
    directory: PathBuf,
    executable: String,
}

/// Answers "does this git executable work here", at most once per 15 minutes
/// per executable. Relative executables (`./git`) depend on the working
/// directory and are probed per directory.
pub struct GitProbe {
    results: TtlCache<ProbeKey, String>,
}

impl Default for GitProbe {
    fn default() -> Self {
        Self::new()
    }
}

impl GitProbe {
    pub fn new() -> Self {
        Self {
            results: TtlCache::with_ttl(PROBE_TTL),
        }
    }

    /// The reported version, e.g. `2.43.0`.
    pub fn version(&self, executable: Option<&Path>, working_dir: &Path) -> Result<String, GitError> {
        let name = executable
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| "git".to_string());
        let directory = if name.trim().starts_with('.') {
            working_dir.to_path_buf()
        } else {
            PathBuf::from("/")
        };
        let key = ProbeKey {
            directory: directory.clone(),
            executable: name,
        };

        self.results.get_or_try_insert_with(key, || {
            let runner = CommandRunner::new(PROBE_TIMEOUT, Redactor::default());
            let output = runner.run(&GitCommand::new(["version"]).executable(executable), &directory)?;
            parse_version(&output.stdout).ok_or_else(|| {
                GitError::Parse(format!("unable to parse git version output: {}", output.stdout.trim()))
            })
        })
    }

    pub fn is_available(&self, executable: Option<&Path>, working_dir: &Path) -> bool {
        match self.version(executable, working_dir) {
            Ok(version) => {
                log::debug!("Found git {}", version);
                true
            }
            Err(e) => {
                log::info!("Native git is not available: {}", e);
                false
            }
        }
    }
}

pub fn parse_version(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix(VERSION_PREFIX))
        .map(|version| version.trim().to_string())
        .filter(|version| !version.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_version_lines() {
        assert_eq!(parse_version("git version 2.43.0\n").as_deref(), Some("2.43.0"));
        assert_eq!(
            parse_version("git version 2.39.3 (Apple Git-146)").as_deref(),
            Some("2.39.3 (Apple Git-146)")
        );
        assert_eq!(parse_version("bash: git: command not found"), None);
    }

    #[test]
    fn test_missing_executable_is_unavailable() {
        let probe = GitProbe::new();
        let dir = tempfile::tempdir().unwrap();
        assert!(!probe.is_available(Some(Path::new("/definitely/not/git")), dir.path()));
    }

    #[test]
    fn test_failures_are_not_memoized() {
        let probe = GitProbe::new();
        let dir = tempfile::tempdir().unwrap();
        let missing = Path::new("/definitely/not/git");
        assert!(probe.version(Some(missing), dir.path()).is_err());
        let key = ProbeKey {
            directory: PathBuf::from("/"),
            executable: "/definitely/not/git".to_string(),
        };
        assert_eq!(probe.results.get(&key), None);
    }
}
