//! Argument vectors and environments for the git executable.
//!
//! A [`GitCommand`] is assembled from an operation verb plus typed options and
//! turned into `argv`/`env` by [`GitCommand::argv`] and
//! [`GitCommand::environment`]. The option order follows git's own grammar:
//!
//! ```text
//! <git> <verbs and appended args> [--verbose] [--branch B] [--rev R] [source] [destination] [--depth 1]
//! ```

mod redact;
mod runner;
mod ssh;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub use redact::{MASK, Redactor};
pub use runner::{CommandOutput, CommandRunner, DEFAULT_COMMAND_TIMEOUT, looks_like_transport_failure};
pub use ssh::{empty_output_command, ensure_wrapper_script, wrapper_script_content};

pub const GIT_SSH: &str = "GIT_SSH";
pub const SSH_ASKPASS: &str = "SSH_ASKPASS";

/// A git invocation being assembled.
#[derive(Debug, Clone, Default)]
pub struct GitCommand {
    executable: Option<PathBuf>,
    args: Vec<String>,
    verbose: bool,
    branch: Option<String>,
    revision: Option<String>,
    source: Option<String>,
    destination: Option<String>,
    shallow: bool,
    env: BTreeMap<String, String>,
}

impl GitCommand {
    pub fn new<I, S>(verbs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: verbs.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Path to the executable. `None` runs the bare `git` command.
    pub fn executable(mut self, executable: Option<&Path>) -> Self {
        self.executable = executable.map(Path::to_path_buf);
        self
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Adds `--branch <branch>` unless blank.
    pub fn branch(mut self, branch: &str) -> Self {
        self.branch = Some(branch.to_string()).filter(|b| !b.trim().is_empty());
        self
    }

    pub fn revision(mut self, revision: impl Into<String>) -> Self {
        self.revision = Some(revision.into());
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn destination(mut self, destination: impl Into<String>) -> Self {
        self.destination = Some(destination.into());
        self
    }

    /// Adds `--depth 1`.
    pub fn shallow(mut self) -> Self {
        self.shallow = true;
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Points `GIT_SSH` at the wrapper script.
    pub fn ssh_script(self, script: Option<&Path>) -> Self {
        match script {
            Some(script) => self.env(GIT_SSH, script.to_string_lossy()),
            None => self,
        }
    }

    /// The full argument vector, executable first.
    pub fn argv(&self) -> Vec<String> {
        let mut argv = Vec::with_capacity(self.args.len() + 8);
        argv.push(
            self.executable
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_else(|| "git".to_string()),
        );
        argv.extend(self.args.iter().cloned());

        if self.verbose {
            argv.push("--verbose".to_string());
        }
        if let Some(branch) = &self.branch {
            argv.push("--branch".to_string());
            argv.push(branch.clone());
        }
        if let Some(revision) = &self.revision {
            argv.push("--rev".to_string());
            argv.push(revision.clone());
        }
        if let Some(source) = &self.source {
            argv.push(source.clone());
        }
        if let Some(destination) = &self.destination {
            argv.push(destination.clone());
        }
        if self.shallow {
            argv.push("--depth".to_string());
            argv.push("1".to_string());
        }
        argv
    }

    /// Environment variables for the child, including the `SSH_ASKPASS`
    /// fallback when neither the caller nor the parent process set one.
    pub fn environment(&self) -> BTreeMap<String, String> {
        let mut env = self.env.clone();
        if std::env::var_os(SSH_ASKPASS).is_none() && !env.contains_key(SSH_ASKPASS) {
            if let Some(echo) = empty_output_command() {
                env.insert(SSH_ASKPASS.to_string(), echo.to_string());
            }
        }
        env
    }

    /// The argument vector as a single display string.
    pub fn command_line(&self) -> String {
        display_command_line(&self.argv())
    }
}

/// Joins arguments for display, quoting the ones that need it.
pub fn display_command_line(argv: &[String]) -> String {
    argv.iter()
        .map(|arg| {
            if arg.is_empty() || arg.contains(|c: char| c.is_whitespace() || c == '"' || c == '\'') {
                format!("'{}'", arg.replace('\'', r"'\''"))
            } else {
                arg.clone()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
