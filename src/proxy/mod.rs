//! Routes SSH-authenticated remotes through a local proxy endpoint and folds
//! URL-embeddable credentials into the repository URL.

pub mod uri;

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use gitsync_types::{AccessData, Authentication, Secret};

use crate::error::GitError;
pub use uri::{RepositoryUri, has_scp_syntax, is_local, normalise, requires_ssh_transport};

/// Secret material the proxy presents to the real remote.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyCredentials {
    KeyPair {
        private_key: Secret,
        passphrase: Option<Secret>,
    },
    Password(Secret),
}

/// Where the proxy connects and how it authenticates.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyConnectionData {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub credentials: ProxyCredentials,
    /// `(absolute, as written)` for scp paths relative to the remote home.
    pub path_mapping: Option<(String, String)>,
}

/// A registered proxy endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyEndpoint {
    pub id: u64,
    pub host: String,
    pub port: u16,
    /// The user name the client presents to the proxy; identifies the
    /// registration.
    pub username: String,
}

/// The local SSH proxy. Registrations are removed explicitly once the
/// operation that needed them finishes.
pub trait SshProxyService: Send + Sync {
    fn register(&self, connection: ProxyConnectionData) -> Result<ProxyEndpoint, GitError>;
    fn unregister(&self, endpoint: &ProxyEndpoint);
}

/// In-process registry consulted by an embedded proxy server.
pub struct LocalProxyRegistry {
    host: String,
    port: u16,
    next_id: AtomicU64,
    connections: DashMap<u64, ProxyConnectionData>,
}

impl LocalProxyRegistry {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            next_id: AtomicU64::new(1),
            connections: DashMap::new(),
        }
    }

    /// Connection registered under a proxy user name.
    pub fn lookup(&self, proxy_user: &str) -> Option<ProxyConnectionData> {
        let id = proxy_user.strip_prefix("proxy-")?.parse::<u64>().ok()?;
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }
}

impl SshProxyService for LocalProxyRegistry {
    fn register(&self, connection: ProxyConnectionData) -> Result<ProxyEndpoint, GitError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        log::debug!(
            "Registering proxy connection {} to {}:{}",
            id,
            connection.host,
            connection.port
        );
        self.connections.insert(id, connection);
        Ok(ProxyEndpoint {
            id,
            host: self.host.clone(),
            port: self.port,
            username: format!("proxy-{}", id),
        })
    }

    fn unregister(&self, endpoint: &ProxyEndpoint) {
        if self.connections.remove(&endpoint.id).is_some() {
            log::debug!("Unregistered proxy connection {}", endpoint.id);
        }
    }
}

/// A key pair held in a shared credential store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SharedCredential {
    pub private_key: Secret,
    pub passphrase: Option<Secret>,
}

/// Resolves shared credential references. Key material is only fetched when
/// a connection is about to be made.
pub trait CredentialStore: Send + Sync {
    fn resolve(&self, id: &str) -> Option<SharedCredential>;
}

#[derive(Default)]
pub struct InMemoryCredentials {
    entries: DashMap<String, SharedCredential>,
}

impl InMemoryCredentials {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, id: impl Into<String>, credential: SharedCredential) {
        self.entries.insert(id.into(), credential);
    }
}

impl CredentialStore for InMemoryCredentials {
    fn resolve(&self, id: &str) -> Option<SharedCredential> {
        self.entries.get(id).map(|entry| entry.value().clone())
    }
}

/// Unregisters its proxy endpoint when dropped.
pub struct Registration {
    service: Arc<dyn SshProxyService>,
    endpoint: ProxyEndpoint,
}

impl Registration {
    pub fn endpoint(&self) -> &ProxyEndpoint {
        &self.endpoint
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.service.unregister(&self.endpoint);
    }
}

/// The URL to hand to git for one operation, plus whatever must stay alive
/// while it runs.
#[derive(Debug)]
pub struct RepositoryAccess {
    pub url: String,
    pub registration: Option<Registration>,
    /// Every plaintext secret involved, including resolved shared keys.
    pub secrets: Vec<String>,
}

impl RepositoryAccess {
    pub fn is_proxied(&self) -> bool {
        self.registration.is_some()
    }
}

/// Chooses between proxying and URL normalisation for an access record.
#[derive(Clone)]
pub struct CredentialAdapter {
    proxy: Arc<dyn SshProxyService>,
    credentials: Arc<dyn CredentialStore>,
}

impl CredentialAdapter {
    pub fn new(proxy: Arc<dyn SshProxyService>, credentials: Arc<dyn CredentialStore>) -> Self {
        Self { proxy, credentials }
    }

    /// Key pair and password credentials for an access record, with shared
    /// references resolved.
    pub fn resolve(&self, access: &AccessData) -> Result<Option<ProxyCredentials>, GitError> {
        Ok(match access.authentication() {
            Authentication::None => None,
            Authentication::Password { password } => password.clone().map(ProxyCredentials::Password),
            Authentication::KeyPair {
                private_key,
                passphrase,
            } => Some(ProxyCredentials::KeyPair {
                private_key: private_key.clone(),
                passphrase: passphrase.clone(),
            }),
            Authentication::SharedCredentials { id } => {
                let shared = self
                    .credentials
                    .resolve(id)
                    .ok_or_else(|| GitError::NotFound(format!("shared credentials '{}'", id)))?;
                Some(ProxyCredentials::KeyPair {
                    private_key: shared.private_key,
                    passphrase: shared.passphrase,
                })
            }
        })
    }

    pub fn adjust(&self, access: &AccessData) -> Result<RepositoryAccess, GitError> {
        let url = access.url();
        let credentials = self.resolve(access)?;
        let mut secrets: Vec<String> = access.secrets().into_iter().map(str::to_string).collect();
        if let Some(ProxyCredentials::KeyPair {
            private_key,
            passphrase,
        }) = &credentials
        {
            for secret in std::iter::once(private_key).chain(passphrase) {
                let secret = secret.expose();
                if !secret.trim().is_empty() && !secrets.iter().any(|s| s == secret) {
                    secrets.push(secret.to_string());
                }
            }
        }

        let key_pair = access.authentication().uses_key_pair();
        let password = matches!(access.authentication(), Authentication::Password { .. });
        let needs_proxy = key_pair || (password && requires_ssh_transport(url));

        if needs_proxy && !is_local(url) {
            let uri = RepositoryUri::parse(url)?;
            if uri.is_ssh() || uri.scheme() == "git" {
                let credentials = match credentials {
                    Some(credentials) => credentials,
                    None => ProxyCredentials::Password(Secret::new("")),
                };
                let path_mapping = uri
                    .is_relative_path()
                    .then(|| (uri.absolute_path(), uri.raw_path().to_string()));
                let connection = ProxyConnectionData {
                    host: uri.host().to_string(),
                    port: uri.port_or_default(),
                    username: uri
                        .user()
                        .or(access.username())
                        .map(str::to_string),
                    credentials,
                    path_mapping,
                };
                let endpoint = self
                    .proxy
                    .register(connection)
                    .map_err(|e| GitError::Proxy(format!("cannot create SSH proxy: {}", e)))?;
                let proxied = uri.via_proxy(&endpoint.username, &endpoint.host, endpoint.port);
                return Ok(RepositoryAccess {
                    url: proxied,
                    registration: Some(Registration {
                        service: Arc::clone(&self.proxy),
                        endpoint,
                    }),
                    secrets,
                });
            }
        }

        let url = if password {
            normalise(
                url,
                access.username(),
                access.authentication().password().map(Secret::expose),
            )?
        } else {
            url.to_string()
        };
        Ok(RepositoryAccess {
            url,
            registration: None,
            secrets,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> (Arc<LocalProxyRegistry>, Arc<InMemoryCredentials>, CredentialAdapter) {
        let registry = Arc::new(LocalProxyRegistry::new("127.0.0.1", 2222));
        let store = Arc::new(InMemoryCredentials::new());
        let adapter = CredentialAdapter::new(registry.clone(), store.clone());
        (registry, store, adapter)
    }

    #[test]
    fn test_key_pair_over_scp_is_proxied_and_unregistered() {
        let (registry, _, adapter) = adapter();
        let access = AccessData::builder("git@example.com:team/repo.git")
            .key_pair("-----KEY-----", Some(Secret::new("phrase")))
            .build()
            .unwrap();

        let adjusted = adapter.adjust(&access).unwrap();
        assert!(adjusted.is_proxied());
        assert_eq!(registry.len(), 1);
        assert!(
            adjusted
                .url
                .starts_with("ssh://proxy-1@127.0.0.1:2222/team/repo.git")
        );

        let connection = registry.lookup("proxy-1").unwrap();
        assert_eq!(connection.host, "example.com");
        assert_eq!(connection.port, 22);
        assert_eq!(connection.username.as_deref(), Some("git"));
        assert_eq!(
            connection.path_mapping,
            Some(("/team/repo.git".to_string(), "team/repo.git".to_string()))
        );
        assert!(adjusted.secrets.contains(&"phrase".to_string()));

        drop(adjusted);
        assert!(registry.is_empty());
    }

    #[test]
    fn test_password_over_ssh_is_proxied() {
        let (registry, _, adapter) = adapter();
        let access = AccessData::builder("ssh://example.com:2200/srv/repo.git")
            .username("bob")
            .password("pw")
            .build()
            .unwrap();

        let adjusted = adapter.adjust(&access).unwrap();
        let connection = registry.lookup(&adjusted.registration.as_ref().unwrap().endpoint().username).unwrap();
        assert_eq!(connection.port, 2200);
        assert_eq!(connection.username.as_deref(), Some("bob"));
        assert_eq!(connection.credentials, ProxyCredentials::Password(Secret::new("pw")));
        assert_eq!(connection.path_mapping, None);
    }

    #[test]
    fn test_password_over_https_is_normalised() {
        let (registry, _, adapter) = adapter();
        let access = AccessData::builder("https://example.com/r.git")
            .username("bob")
            .password("pw")
            .build()
            .unwrap();

        let adjusted = adapter.adjust(&access).unwrap();
        assert!(!adjusted.is_proxied());
        assert!(registry.is_empty());
        assert_eq!(adjusted.url, "https://bob:pw@example.com/r.git");
        assert_eq!(adjusted.secrets, vec!["pw".to_string()]);
    }

    #[test]
    fn test_local_paths_are_untouched() {
        let (registry, _, adapter) = adapter();
        let access = AccessData::builder("/srv/git/repo")
            .key_pair("key", None)
            .build()
            .unwrap();
        let adjusted = adapter.adjust(&access).unwrap();
        assert_eq!(adjusted.url, "/srv/git/repo");
        assert!(registry.is_empty());
    }

    #[test]
    fn test_shared_credentials_resolved_lazily() {
        let (registry, store, adapter) = adapter();
        let access = AccessData::builder("git@example.com:r.git")
            .authentication(Authentication::SharedCredentials {
                id: "deploy".to_string(),
            })
            .build()
            .unwrap();

        let err = adapter.adjust(&access).unwrap_err();
        assert!(matches!(err, GitError::NotFound(_)));

        store.insert(
            "deploy",
            SharedCredential {
                private_key: Secret::new("shared-key"),
                passphrase: None,
            },
        );
        let adjusted = adapter.adjust(&access).unwrap();
        assert!(adjusted.secrets.contains(&"shared-key".to_string()));
        let endpoint = adjusted.registration.as_ref().unwrap().endpoint().clone();
        assert!(matches!(
            registry.lookup(&endpoint.username).unwrap().credentials,
            ProxyCredentials::KeyPair { .. }
        ));
    }

    #[test]
    fn test_anonymous_access_keeps_url() {
        let (_, _, adapter) = adapter();
        let access = AccessData::builder("https://example.com/r.git").build().unwrap();
        assert_eq!(adapter.adjust(&access).unwrap().url, "https://example.com/r.git");
    }
}
