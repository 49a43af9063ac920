//! Error taxonomy for repository operations.
//!
//! Every variant that can carry a command line or process output holds text
//! that has already been through a [`Redactor`](crate::command::Redactor).

use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gitsync_cache::LockError;
use gitsync_types::ValidationError;
use thiserror::Error;

use crate::command::{Redactor, looks_like_transport_failure};
use crate::ops::Backend;

/// A git process exited unsuccessfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandFailure {
    pub command_line: String,
    pub exit_code: Option<i32>,
    pub working_dir: PathBuf,
    /// Combined stdout and stderr.
    pub output: String,
    /// The output reads like a network or authentication failure.
    pub transport: bool,
}

impl CommandFailure {
    pub fn new(
        command_line: String,
        exit_code: Option<i32>,
        working_dir: &Path,
        output: String,
    ) -> Self {
        Self {
            transport: looks_like_transport_failure(&output),
            command_line,
            exit_code,
            working_dir: working_dir.to_path_buf(),
            output,
        }
    }
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = self
            .exit_code
            .map_or_else(|| "signal".to_string(), |c| c.to_string());
        write!(
            f,
            "command {} failed with code {}. Working directory was [{}].",
            self.command_line,
            code,
            self.working_dir.display()
        )?;
        let output = self.output.trim();
        if !output.is_empty() {
            write!(f, "\n{}", output)?;
        }
        Ok(())
    }
}

/// Errors returned by repository operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// Rejected access data. Never retried.
    #[error("invalid repository configuration: {0}")]
    Configuration(#[from] ValidationError),
    /// Invalid inputs were provided.
    #[error("invalid input: {0}")]
    InvalidInput(String),
    /// The remote could not be reached or rejected the credentials.
    #[error("transport failure: {0}")]
    Transport(String),
    #[error("{0}")]
    Command(CommandFailure),
    #[error("failed to start {command_line}: {source}")]
    Spawn {
        command_line: String,
        #[source]
        source: io::Error,
    },
    #[error("command {command_line} produced no output for {timeout:?} and was killed")]
    Timeout {
        command_line: String,
        timeout: Duration,
    },
    #[error("{operation} is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: Backend,
    },
    /// Both the first attempt and the retry on a wiped directory failed.
    #[error("{retry} (first attempt failed with: {first})")]
    RecoveryFailed {
        first: Box<GitError>,
        #[source]
        retry: Box<GitError>,
    },
    /// libgit2 reported an error; the message is masked.
    #[error("git operation failed: {message}")]
    Library {
        message: String,
        class: git2::ErrorClass,
        code: git2::ErrorCode,
    },
    #[error("SSH proxy error: {0}")]
    Proxy(String),
    /// Output parsing or unexpected git data.
    #[error("failed to parse git data: {0}")]
    Parse(String),
    #[error("{0} not found")]
    NotFound(String),
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error(transparent)]
    Lock(#[from] LockError),
}

impl GitError {
    /// Wraps a libgit2 error, masking its message.
    pub fn library(err: git2::Error, redactor: &Redactor) -> Self {
        GitError::Library {
            message: redactor.mask(err.message()),
            class: err.class(),
            code: err.code(),
        }
    }

    /// True for network-layer failures, which must not trigger the
    /// wipe-and-retry recovery. Walks the `source()` chain.
    pub fn is_transport(&self) -> bool {
        if self.is_transport_here() {
            return true;
        }
        let mut source = self.source();
        while let Some(err) = source {
            if let Some(git) = err.downcast_ref::<GitError>() {
                if git.is_transport_here() {
                    return true;
                }
            } else if let Some(io) = err.downcast_ref::<io::Error>() {
                if is_network_io(io) {
                    return true;
                }
            }
            source = err.source();
        }
        false
    }

    fn is_transport_here(&self) -> bool {
        match self {
            GitError::Transport(_) => true,
            GitError::Command(failure) => failure.transport,
            GitError::Library { class, .. } => matches!(
                class,
                git2::ErrorClass::Net
                    | git2::ErrorClass::Ssh
                    | git2::ErrorClass::Http
                    | git2::ErrorClass::Ssl
            ),
            GitError::Io(io) => is_network_io(io),
            _ => false,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, GitError::Timeout { .. })
    }

    pub fn unsupported(operation: &'static str, backend: Backend) -> Self {
        GitError::Unsupported { operation, backend }
    }
}

fn is_network_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionRefused
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::NotConnected
            | io::ErrorKind::AddrNotAvailable
    )
}

/// Masks libgit2 errors on the way out of a call.
pub trait LibraryResultExt<T> {
    fn masked(self, redactor: &Redactor) -> Result<T, GitError>;
}

impl<T> LibraryResultExt<T> for Result<T, git2::Error> {
    fn masked(self, redactor: &Redactor) -> Result<T, GitError> {
        self.map_err(|err| GitError::library(err, redactor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(output: &str) -> GitError {
        GitError::Command(CommandFailure::new(
            "git fetch".to_string(),
            Some(128),
            Path::new("/work"),
            output.to_string(),
        ))
    }

    #[test]
    fn test_command_failure_display() {
        let err = failure("fatal: bad object\n");
        assert_eq!(
            err.to_string(),
            "command git fetch failed with code 128. Working directory was [/work].\nfatal: bad object"
        );
    }

    #[test]
    fn test_network_output_is_transport() {
        assert!(failure("fatal: Could not read from remote repository.").is_transport());
        assert!(!failure("error: index.lock exists").is_transport());
    }

    #[test]
    fn test_library_error_class() {
        let net = GitError::library(
            git2::Error::new(git2::ErrorCode::GenericError, git2::ErrorClass::Net, "timeout"),
            &Redactor::default(),
        );
        let odb = GitError::library(
            git2::Error::new(git2::ErrorCode::GenericError, git2::ErrorClass::Odb, "corrupt"),
            &Redactor::default(),
        );
        assert!(net.is_transport());
        assert!(!odb.is_transport());
    }

    #[test]
    fn test_library_message_is_masked() {
        let err = GitError::library(
            git2::Error::from_str("failed for https://u:hunter2@h/"),
            &Redactor::new(["hunter2"]),
        );
        assert!(!err.to_string().contains("hunter2"));
    }

    #[test]
    fn test_transport_found_in_source_chain() {
        let err = GitError::RecoveryFailed {
            first: Box::new(failure("fatal: bad object")),
            retry: Box::new(GitError::Transport("offline".to_string())),
        };
        assert!(err.is_transport());
    }

    #[test]
    fn test_timeout_is_not_transport() {
        let err = GitError::Timeout {
            command_line: "git fetch".to_string(),
            timeout: Duration::from_secs(1),
        };
        assert!(err.is_timeout());
        assert!(!err.is_transport());
    }

    #[test]
    fn test_network_io_kinds() {
        let refused = GitError::Io(io::Error::from(io::ErrorKind::ConnectionRefused));
        let missing = GitError::Io(io::Error::from(io::ErrorKind::NotFound));
        assert!(refused.is_transport());
        assert!(!missing.is_transport());
    }
}
