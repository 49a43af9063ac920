//! Service configuration: a JSON file plus `GITSYNC_*` environment overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use gitsync_cache::CatalogEntry;
use gitsync_types::{AccessData, Authentication, Secret, ValidationError};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid value for {name}: {value:?}")]
    InvalidValue { name: &'static str, value: String },

    #[error("repository '{name}': {source}")]
    Repository {
        name: String,
        #[source]
        source: ValidationError,
    },

    #[error("repository '{name}': failed to read key {path}: {source}")]
    KeyFile {
        name: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A repository known to this host.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RepositoryConfig {
    pub name: String,
    pub url: String,
    pub branch: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// File holding a private key for key pair authentication.
    pub private_key_file: Option<PathBuf>,
    pub passphrase: Option<String>,
    /// Id of a credential held by the credential store.
    pub shared_credentials: Option<String>,
    pub shallow: bool,
    pub submodules: bool,
    pub remote_agent_cache: bool,
    pub verbose: bool,
    pub command_timeout_secs: Option<u64>,
}

impl RepositoryConfig {
    pub fn to_access(&self) -> Result<AccessData, ConfigError> {
        let mut builder = AccessData::builder(self.url.as_str())
            .branch(self.branch.as_str())
            .username_opt(self.username.clone())
            .shallow(self.shallow)
            .submodules(self.submodules)
            .remote_agent_cache(self.remote_agent_cache)
            .verbose(self.verbose)
            .command_timeout(self.command_timeout_secs.map(Duration::from_secs));

        if let Some(id) = &self.shared_credentials {
            builder = builder.authentication(Authentication::SharedCredentials { id: id.clone() });
        } else if let Some(path) = &self.private_key_file {
            let key = fs::read_to_string(path).map_err(|source| ConfigError::KeyFile {
                name: self.name.clone(),
                path: path.clone(),
                source,
            })?;
            builder = builder.key_pair(key, self.passphrase.clone().map(Secret::new));
        } else if let Some(password) = &self.password {
            builder = builder.password(password.as_str());
        }

        builder.build().map_err(|source| ConfigError::Repository {
            name: self.name.clone(),
            source,
        })
    }
}

/// Settings shared by every repository on this host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Parent of the `_git-repositories-cache` directory.
    pub working_root: PathBuf,
    /// Explicit native git. `None` falls back to `git` on `PATH` when
    /// `prefer_native` is set, and to libgit2 otherwise.
    pub git_executable: Option<PathBuf>,
    pub prefer_native: bool,
    /// Custom SSH binary for the wrapper script.
    pub ssh_command: Option<String>,
    pub command_timeout_secs: u64,
    pub max_commits: usize,
    pub ref_cache_ttl_secs: u64,
    pub use_shallow_clones: bool,
    pub cross_process_locks: bool,
    pub lock_timeout_secs: u64,
    pub proxy_host: String,
    pub proxy_port: u16,
    pub repositories: Vec<RepositoryConfig>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            working_root: default_working_root(),
            git_executable: None,
            prefer_native: true,
            ssh_command: None,
            command_timeout_secs: 180 * 60,
            max_commits: 100,
            ref_cache_ttl_secs: 60,
            use_shallow_clones: true,
            cross_process_locks: true,
            lock_timeout_secs: 300,
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: 2222,
            repositories: Vec::new(),
        }
    }
}

fn default_working_root() -> PathBuf {
    dirs::cache_dir()
        .map(|p| p.join("gitsync"))
        .unwrap_or_else(|| PathBuf::from(".gitsync"))
}

impl SyncConfig {
    /// Reads a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// The file at `path` if given, else defaults; then environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self, ConfigError> {
        let config = match path {
            Some(path) => Self::load(path)?,
            None => Self::default(),
        };
        config.with_env_overrides(|name| std::env::var(name).ok())
    }

    /// Applies `GITSYNC_*` overrides read through `lookup`.
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        if let Some(root) = get("GITSYNC_WORKING_ROOT") {
            self.working_root = PathBuf::from(root);
        }
        if let Some(git) = get("GITSYNC_GIT") {
            self.git_executable = Some(PathBuf::from(git));
        }
        if let Some(ssh) = get("GITSYNC_SSH_COMMAND") {
            self.ssh_command = Some(ssh);
        }
        if let Some(value) = get("GITSYNC_COMMAND_TIMEOUT") {
            self.command_timeout_secs = parse_number("GITSYNC_COMMAND_TIMEOUT", &value)?;
        }
        if let Some(value) = get("GITSYNC_MAX_COMMITS") {
            self.max_commits = parse_number("GITSYNC_MAX_COMMITS", &value)?;
        }
        if let Some(value) = get("GITSYNC_SHALLOW") {
            self.use_shallow_clones = parse_flag("GITSYNC_SHALLOW", &value)?;
        }
        Ok(self)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn ref_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.ref_cache_ttl_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn repository(&self, name: &str) -> Option<&RepositoryConfig> {
        self.repositories.iter().find(|repo| repo.name == name)
    }

    /// Every configured repository as a lifecycle catalog entry.
    pub fn catalog(&self) -> Result<Vec<CatalogEntry>, ConfigError> {
        self.repositories
            .iter()
            .map(|repo| {
                Ok(CatalogEntry {
                    name: repo.name.clone(),
                    access: repo.to_access()?,
                })
            })
            .collect()
    }
}

fn parse_number<T: std::str::FromStr>(name: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        name,
        value: value.to_string(),
    })
}

fn parse_flag(name: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            name,
            value: value.to_string(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = SyncConfig::default();
        assert!(config.prefer_native);
        assert_eq!(config.command_timeout(), Duration::from_secs(10800));
        assert_eq!(config.max_commits, 100);
        assert_eq!(config.ref_cache_ttl(), Duration::from_secs(60));
        assert!(config.use_shallow_clones);
        assert!(config.cross_process_locks);
        assert_eq!(config.lock_timeout(), Duration::from_secs(300));
        assert_eq!(config.proxy_host, "127.0.0.1");
        assert_eq!(config.proxy_port, 2222);
        assert!(config.repositories.is_empty());
    }

    #[test]
    fn test_load_partial_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gitsync.json");
        fs::write(
            &path,
            r#"{
                "working_root": "/srv/builds",
                "max_commits": 5,
                "repositories": [
                    {"name": "app", "url": "https://example.com/app.git", "branch": "main", "shallow": true}
                ]
            }"#,
        )
        .unwrap();

        let config = SyncConfig::load(&path).unwrap();
        assert_eq!(config.working_root, PathBuf::from("/srv/builds"));
        assert_eq!(config.max_commits, 5);
        assert_eq!(config.proxy_port, 2222);

        let repo = config.repository("app").unwrap();
        let access = repo.to_access().unwrap();
        assert_eq!(access.branch(), "main");
        assert!(access.is_shallow());
        assert!(config.repository("missing").is_none());
    }

    #[test]
    fn test_load_reports_path() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("broken.json");
        fs::write(&path, "{ not json").unwrap();
        let err = SyncConfig::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.json"));

        let missing = SyncConfig::load(&dir.path().join("nope.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Read { .. }));
    }

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("GITSYNC_WORKING_ROOT", "/tmp/gs"),
            ("GITSYNC_GIT", "/usr/local/bin/git"),
            ("GITSYNC_COMMAND_TIMEOUT", "30"),
            ("GITSYNC_MAX_COMMITS", "7"),
            ("GITSYNC_SHALLOW", "off"),
            ("GITSYNC_SSH_COMMAND", ""),
        ]
        .into_iter()
        .collect();

        let config = SyncConfig::default()
            .with_env_overrides(|name| env.get(name).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(config.working_root, PathBuf::from("/tmp/gs"));
        assert_eq!(config.git_executable, Some(PathBuf::from("/usr/local/bin/git")));
        assert_eq!(config.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.max_commits, 7);
        assert!(!config.use_shallow_clones);
        assert_eq!(config.ssh_command, None);
    }

    #[test]
    fn test_invalid_env_value() {
        let err = SyncConfig::default()
            .with_env_overrides(|name| (name == "GITSYNC_MAX_COMMITS").then(|| "many".to_string()))
            .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "GITSYNC_MAX_COMMITS",
                ..
            }
        ));
    }

    #[test]
    fn test_repository_credentials() {
        let dir = tempdir().unwrap();
        let key = dir.path().join("id_rsa");
        fs::write(&key, "-----BEGIN KEY-----").unwrap();

        let keyed = RepositoryConfig {
            name: "keyed".into(),
            url: "git@example.com:team/app.git".into(),
            private_key_file: Some(key),
            ..Default::default()
        };
        assert!(keyed.to_access().unwrap().authentication().uses_key_pair());

        let missing_key = RepositoryConfig {
            private_key_file: Some(dir.path().join("absent")),
            ..keyed.clone()
        };
        assert!(matches!(missing_key.to_access(), Err(ConfigError::KeyFile { .. })));

        let shared = RepositoryConfig {
            name: "shared".into(),
            url: "ssh://example.com/app.git".into(),
            shared_credentials: Some("deploy-key".into()),
            ..Default::default()
        };
        assert!(shared.to_access().unwrap().authentication().uses_key_pair());

        let bad = RepositoryConfig {
            name: "bad".into(),
            url: "https://example.com/app.git; rm -rf /".into(),
            ..Default::default()
        };
        assert!(matches!(bad.to_access(), Err(ConfigError::Repository { .. })));
    }
}
