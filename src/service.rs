//! Process-wide collaborators.
//!
//! Created once at startup and shared by every repository: the lock table,
//! the remote-ref memo, the git probe, the proxy registry and the credential
//! store. Tests build a fresh [`SyncServices`] per case.

use std::path::PathBuf;
use std::sync::{Arc, OnceLock};

use gitsync_cache::{AgentBroadcaster, CacheLifecycle, CacheLockRegistry, CachePaths};
use gitsync_types::AccessData;

use crate::command::ensure_wrapper_script;
use crate::config::{ConfigError, SyncConfig};
use crate::ops::{GitOperations, GitProbe, LibraryGit, NativeGit, OperationContext, RemoteRefCache};
use crate::proxy::{CredentialAdapter, CredentialStore, InMemoryCredentials, LocalProxyRegistry, SshProxyService};
use crate::sync::{Host, OperationsProvider, RepositorySync};

/// Which backend new operation helpers get.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendChoice {
    /// The git executable; `None` is `git` from `PATH`.
    Native(Option<PathBuf>),
    Library,
}

pub struct SyncServices {
    config: SyncConfig,
    paths: CachePaths,
    locks: Arc<CacheLockRegistry>,
    ref_cache: Arc<RemoteRefCache>,
    probe: GitProbe,
    proxy: Arc<dyn SshProxyService>,
    credentials: Arc<dyn CredentialStore>,
    ssh_script: OnceLock<Option<PathBuf>>,
}

impl SyncServices {
    /// Services with the built-in proxy registry and an empty credential store.
    pub fn new(config: SyncConfig) -> Self {
        let proxy = Arc::new(LocalProxyRegistry::new(config.proxy_host.clone(), config.proxy_port));
        Self::with_collaborators(config, proxy, Arc::new(InMemoryCredentials::new()))
    }

    pub fn with_collaborators(
        config: SyncConfig,
        proxy: Arc<dyn SshProxyService>,
        credentials: Arc<dyn CredentialStore>,
    ) -> Self {
        let locks = if config.cross_process_locks {
            CacheLockRegistry::with_file_locks(Some(config.lock_timeout()))
        } else {
            CacheLockRegistry::new()
        };
        Self {
            paths: CachePaths::new(config.working_root.clone()),
            locks: Arc::new(locks),
            ref_cache: Arc::new(RemoteRefCache::new(config.ref_cache_ttl())),
            probe: GitProbe::new(),
            proxy,
            credentials,
            ssh_script: OnceLock::new(),
            config,
        }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn paths(&self) -> &CachePaths {
        &self.paths
    }

    pub fn locks(&self) -> &Arc<CacheLockRegistry> {
        &self.locks
    }

    pub fn adapter(&self) -> CredentialAdapter {
        CredentialAdapter::new(Arc::clone(&self.proxy), Arc::clone(&self.credentials))
    }

    /// Native git when it is configured (or preferred) and answers
    /// `git version`; libgit2 otherwise.
    pub fn backend_choice(&self) -> BackendChoice {
        let probe_dir = Some(self.paths.root())
            .filter(|root| root.is_dir())
            .map(PathBuf::from)
            .unwrap_or_else(std::env::temp_dir);

        if let Some(executable) = &self.config.git_executable {
            if self.probe.is_available(Some(executable), &probe_dir) {
                return BackendChoice::Native(Some(executable.clone()));
            }
            log::warn!(
                "Configured git executable {} is not usable, falling back to libgit2",
                executable.display()
            );
            return BackendChoice::Library;
        }
        if self.config.prefer_native && self.probe.is_available(None, &probe_dir) {
            return BackendChoice::Native(None);
        }
        BackendChoice::Library
    }

    /// The `GIT_SSH` wrapper, written on first use.
    fn ssh_script(&self) -> Option<PathBuf> {
        self.ssh_script
            .get_or_init(|| {
                let dir = self.paths.root().join("ssh");
                match ensure_wrapper_script(&dir, self.config.ssh_command.as_deref()) {
                    Ok(path) => Some(path),
                    Err(e) => {
                        log::warn!("Unable to write ssh wrapper script in {}: {}", dir.display(), e);
                        None
                    }
                }
            })
            .clone()
    }

    fn context(&self, access: AccessData) -> OperationContext {
        OperationContext::new(access, self.adapter(), Arc::clone(&self.ref_cache))
            .with_max_commits(self.config.max_commits)
            .with_default_timeout(self.config.command_timeout())
    }

    /// Lifecycle manager over the configured repositories.
    pub fn lifecycle(&self, broadcaster: Arc<dyn AgentBroadcaster>) -> Result<CacheLifecycle, ConfigError> {
        Ok(CacheLifecycle::new(
            self.paths.clone(),
            Arc::new(self.config.catalog()?),
            broadcaster,
            Arc::clone(&self.locks),
        ))
    }

    /// Build-facing handle for one repository.
    pub fn repository(self: &Arc<Self>, access: AccessData, host: Host) -> RepositorySync {
        RepositorySync::new(
            access,
            Arc::clone(self) as Arc<dyn OperationsProvider>,
            self.paths.clone(),
            Arc::clone(&self.locks),
        )
        .on_host(host)
        .shallow_clones(self.config.use_shallow_clones)
    }
}

impl OperationsProvider for SyncServices {
    fn operations_for(&self, access: &AccessData) -> Box<dyn GitOperations> {
        let ctx = self.context(access.clone());
        match self.backend_choice() {
            BackendChoice::Native(executable) => Box::new(NativeGit::new(ctx, executable, self.ssh_script())),
            BackendChoice::Library => Box::new(LibraryGit::new(ctx)),
        }
    }
}
