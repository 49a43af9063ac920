//! The `git log` format used for change collection and its parser.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use chrono::DateTime;
use gitsync_types::{CommitBatch, CommitRecord};

use crate::error::GitError;

const COMMIT_START: &str = "[gitsync~commit~a1f3]";
const MESSAGE_START: &str = "[gitsync~message~a1f3]";
const MESSAGE_END: &str = "[gitsync~message-end~a1f3]";

/// `--format=` argument understood by [`CommitLogParser`].
pub fn log_format() -> String {
    format!(
        "--format={}%n%H%n%aN%n%ae%n%ct%n{}%n%B%n{}",
        COMMIT_START, MESSAGE_START, MESSAGE_END
    )
}

/// Commits at the shallow boundary of a repository, from `.git/shallow` (or
/// `shallow` in a bare repository).
pub fn shallow_commits(repo_dir: &Path) -> HashSet<String> {
    [repo_dir.join(".git").join("shallow"), repo_dir.join("shallow")]
        .iter()
        .find_map(|path| fs::read_to_string(path).ok())
        .map(|content| {
            content
                .lines()
                .map(str::trim)
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

enum State {
    Header(usize),
    Message,
    Files,
}

/// Parses output produced with [`log_format`] plus `--name-only`.
///
/// Commits in `shallows` are recorded without files. Commits beyond
/// `max_commits` are counted in [`CommitBatch::skipped`].
pub struct CommitLogParser {
    shallows: HashSet<String>,
    max_commits: usize,
}

impl CommitLogParser {
    pub fn new(shallows: HashSet<String>, max_commits: usize) -> Self {
        Self {
            shallows,
            max_commits,
        }
    }

    pub fn parse(&self, output: &str) -> Result<CommitBatch, GitError> {
        let mut batch = CommitBatch::default();
        let mut current: Option<CommitRecord> = None;
        let mut header: Vec<&str> = Vec::with_capacity(4);
        let mut message: Vec<&str> = Vec::new();
        let mut state = State::Files;

        for line in output.lines() {
            if line == COMMIT_START {
                self.finish(&mut batch, current.take());
                header.clear();
                state = State::Header(0);
                continue;
            }
            match state {
                State::Header(n) => {
                    if line == MESSAGE_START {
                        current = Some(record_from_header(&header)?);
                        message.clear();
                        state = State::Message;
                    } else {
                        header.push(line);
                        state = State::Header(n + 1);
                    }
                }
                State::Message => {
                    if line == MESSAGE_END {
                        if let Some(commit) = current.as_mut() {
                            commit.message = message.join("\n").trim_end().to_string();
                        }
                        state = State::Files;
                    } else {
                        message.push(line);
                    }
                }
                State::Files => {
                    let path = line.trim();
                    if path.is_empty() {
                        continue;
                    }
                    if let Some(commit) = current.as_mut() {
                        if !self.shallows.contains(&commit.id) {
                            commit.add_file(path);
                        }
                    }
                }
            }
        }
        if matches!(state, State::Header(_) | State::Message) {
            return Err(GitError::Parse("truncated commit log output".to_string()));
        }
        self.finish(&mut batch, current);
        Ok(batch)
    }

    fn finish(&self, batch: &mut CommitBatch, commit: Option<CommitRecord>) {
        if let Some(commit) = commit {
            if batch.commits.len() < self.max_commits {
                batch.commits.push(commit);
            } else {
                batch.skipped += 1;
            }
        }
    }
}

fn record_from_header(header: &[&str]) -> Result<CommitRecord, GitError> {
    let [id, author, email, timestamp] = header else {
        return Err(GitError::Parse(format!(
            "expected 4 header lines in commit log, got {}",
            header.len()
        )));
    };
    let seconds: i64 = timestamp
        .trim()
        .parse()
        .map_err(|_| GitError::Parse(format!("invalid commit timestamp '{}'", timestamp)))?;
    let timestamp = DateTime::from_timestamp(seconds, 0)
        .ok_or_else(|| GitError::Parse(format!("commit timestamp out of range: {}", seconds)))?;

    let mut record = CommitRecord::new(id.trim(), author.trim(), timestamp);
    record.email = Some(email.trim().to_string()).filter(|e| !e.is_empty());
    Ok(record)
}
