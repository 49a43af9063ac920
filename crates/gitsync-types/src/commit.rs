//! Commit records produced by change collection.

use chrono::{DateTime, Utc};

/// A file touched by a commit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitFile {
    pub path: String,
    /// The commit that changed the file.
    pub revision: String,
}

/// One change set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    /// Full commit hash.
    pub id: String,
    pub author: String,
    pub email: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub message: String,
    pub files: Vec<CommitFile>,
}

impl CommitRecord {
    pub fn new(id: impl Into<String>, author: impl Into<String>, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            author: author.into(),
            email: None,
            timestamp,
            message: String::new(),
            files: Vec::new(),
        }
    }

    /// First line of the message.
    pub fn summary(&self) -> &str {
        self.message.lines().next().unwrap_or("")
    }

    pub fn add_file(&mut self, path: impl Into<String>) {
        self.files.push(CommitFile {
            path: path.into(),
            revision: self.id.clone(),
        });
    }
}

/// Result of walking a commit range.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitBatch {
    /// Newest first.
    pub commits: Vec<CommitRecord>,
    /// Commits in range that were not returned because the cap was reached.
    pub skipped: usize,
}
