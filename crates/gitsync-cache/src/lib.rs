//! Cache identity, locking and lifecycle for repository mirrors

mod lifecycle;
mod lock;
mod paths;
mod registry;
mod ttl;

pub use lifecycle::{
    AgentBroadcaster, CacheDescription, CacheLifecycle, CacheMessage, CatalogEntry,
    DeletionOutcome, DeletionReport, NoAgents, RepositoryCatalog, UNUSED_CACHE_DESCRIPTION,
    apply_message, describe,
};
pub use lock::{DEFAULT_LOCK_TIMEOUT, DirectoryFileLock, lock_file_for};
pub use paths::{CACHE_DIR_NAME, CachePaths, cache_key};
pub use registry::{CacheLock, CacheLockGuard, CacheLockRegistry, LockError};
pub use ttl::{DEFAULT_TTL, TtlCache};
