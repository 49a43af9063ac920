//! Cache directory path management
//!
//! This module provides the `CachePaths` struct which manages all filesystem paths
//! for the cache directory layout:
//!
//! ```text
//! <working root>/
//! └── _git-repositories-cache/
//!     ├── <sha1 hex>/              # One mirror per cache identity
//!     └── .<sha1 hex>.lock         # flock taken while the mirror is written
//! ```
//!
//! The directory name is a SHA-1 over the repository URL and username, plus the
//! branch when the access data asks for shallow clones. Every field is followed
//! by a zero byte so that `("ab", "c")` and `("a", "bc")` never collide.

use std::path::{Path, PathBuf};

use gitsync_types::AccessData;
use sha1::{Digest, Sha1};

/// Name of the directory under the working root that holds every mirror.
pub const CACHE_DIR_NAME: &str = "_git-repositories-cache";

/// Computes the cache identity of an access record.
///
/// Password and key material never take part, so records differing only in
/// credentials share a mirror.
pub fn cache_key(data: &AccessData) -> String {
    let mut hasher = Sha1::new();
    write_field(&mut hasher, Some(data.url()));
    write_field(&mut hasher, data.username());
    if data.is_shallow() {
        write_field(&mut hasher, Some(data.branch()));
    }
    hex::encode(hasher.finalize())
}

fn write_field(hasher: &mut Sha1, value: Option<&str>) {
    if let Some(value) = value {
        hasher.update(value.as_bytes());
    }
    hasher.update([0u8]);
}

/// Manages all filesystem paths for the cache directory layout
#[derive(Debug, Clone)]
pub struct CachePaths {
    root: PathBuf,
}

impl CachePaths {
    /// Creates a new CachePaths with the specified working root
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Returns the working root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Returns the cache root: `{root}/_git-repositories-cache`
    pub fn cache_root(&self) -> PathBuf {
        self.root.join(CACHE_DIR_NAME)
    }

    /// Returns the mirror directory for a cache key: `{cache_root}/{key}`
    pub fn cache_dir_for_key(&self, key: &str) -> PathBuf {
        self.cache_root().join(key)
    }

    /// Returns the mirror directory for an access record.
    pub fn cache_dir(&self, data: &AccessData) -> PathBuf {
        self.cache_dir_for_key(&cache_key(data))
    }
}

impl Default for CachePaths {
    /// Creates a CachePaths using the system cache directory + "gitsync"
    ///
    /// Uses `dirs::cache_dir()` which resolves to:
    /// - Linux: `~/.cache`
    /// - macOS: `~/Library/Caches`
    /// - Windows: `C:\Users\<user>\AppData\Local`
    fn default() -> Self {
        let cache_dir = dirs::cache_dir().unwrap_or_else(|| PathBuf::from(".cache"));
        Self::new(cache_dir.join("gitsync"))
    }
}
