//! Git repository synchronization for build hosts.
//!
//! Mirrors remote repositories into shared cache directories, keeps those
//! caches consistent under concurrent builds, and materializes working copies
//! and change lists from them. Operations run either through the `git`
//! executable or through libgit2.

pub mod agents;
pub mod command;
pub mod config;
pub mod error;
pub mod ops;
pub mod proxy;
pub mod service;
pub mod sync;

pub use agents::AgentHub;
pub use config::{ConfigError, RepositoryConfig, SyncConfig};
pub use error::{CommandFailure, GitError};
pub use ops::{Backend, GitOperations, Identity};
pub use service::{BackendChoice, SyncServices};
pub use sync::{BuildChanges, Host, OperationsProvider, RepositorySync, with_recovery};

pub use gitsync_cache as cache;
pub use gitsync_types as types;
