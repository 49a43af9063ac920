//! Repository access description.
//!
//! An [`AccessData`] is built once per build invocation and never mutated
//! afterwards. Variations (a different branch, shallow turned off for a merge)
//! are produced with [`AccessData::to_builder`], which copies every field into
//! a fresh builder.

use std::fmt;
use std::time::Duration;

use crate::validate::{ValidationError, validate_access};

/// A credential value.
///
/// `Debug` never prints the contents, so access data can be logged freely.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the plaintext value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_blank(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(********)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// How the remote is authenticated. Exactly one mode is active.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Authentication {
    #[default]
    None,
    Password {
        password: Option<Secret>,
    },
    KeyPair {
        private_key: Secret,
        passphrase: Option<Secret>,
    },
    /// Key material lives in an external credential store under `id` and is
    /// resolved only when a connection is made.
    SharedCredentials {
        id: String,
    },
}

impl Authentication {
    pub fn kind(&self) -> &'static str {
        match self {
            Authentication::None => "none",
            Authentication::Password { .. } => "password",
            Authentication::KeyPair { .. } => "keypair",
            Authentication::SharedCredentials { .. } => "shared-credentials",
        }
    }

    pub fn password(&self) -> Option<&Secret> {
        match self {
            Authentication::Password { password } => password.as_ref(),
            _ => None,
        }
    }

    pub fn private_key(&self) -> Option<&Secret> {
        match self {
            Authentication::KeyPair { private_key, .. } => Some(private_key),
            _ => None,
        }
    }

    pub fn passphrase(&self) -> Option<&Secret> {
        match self {
            Authentication::KeyPair { passphrase, .. } => passphrase.as_ref(),
            _ => None,
        }
    }

    /// True for modes that carry (or resolve to) an SSH key pair.
    pub fn uses_key_pair(&self) -> bool {
        matches!(
            self,
            Authentication::KeyPair { .. } | Authentication::SharedCredentials { .. }
        )
    }
}

/// Turns stored secret values into their plaintext form.
pub trait SecretDecoder: Send + Sync {
    fn decode(&self, secret: &Secret) -> Result<Secret, ValidationError>;
}

/// Decoder for secrets that are already stored in plaintext.
#[derive(Debug, Default, Clone, Copy)]
pub struct PlainSecrets;

impl SecretDecoder for PlainSecrets {
    fn decode(&self, secret: &Secret) -> Result<Secret, ValidationError> {
        Ok(secret.clone())
    }
}

/// Everything needed to reach one repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessData {
    url: String,
    branch: String,
    username: Option<String>,
    authentication: Authentication,
    shallow: bool,
    submodules: bool,
    remote_agent_cache: bool,
    verbose: bool,
    command_timeout: Option<Duration>,
}

impl AccessData {
    pub fn builder(url: impl Into<String>) -> AccessDataBuilder {
        AccessDataBuilder {
            data: AccessData {
                url: url.into(),
                branch: String::new(),
                username: None,
                authentication: Authentication::None,
                shallow: false,
                submodules: false,
                remote_agent_cache: false,
                verbose: false,
                command_timeout: None,
            },
        }
    }

    /// Starts a builder pre-filled with this record's fields.
    pub fn to_builder(&self) -> AccessDataBuilder {
        AccessDataBuilder { data: self.clone() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// The configured branch, tag or revision. May be blank.
    pub fn branch(&self) -> &str {
        &self.branch
    }

    /// The configured username, `None` when unset or blank.
    pub fn username(&self) -> Option<&str> {
        self.username
            .as_deref()
            .filter(|name| !name.trim().is_empty())
    }

    pub fn authentication(&self) -> &Authentication {
        &self.authentication
    }

    pub fn is_shallow(&self) -> bool {
        self.shallow
    }

    pub fn submodules(&self) -> bool {
        self.submodules
    }

    pub fn uses_remote_agent_cache(&self) -> bool {
        self.remote_agent_cache
    }

    pub fn is_verbose(&self) -> bool {
        self.verbose
    }

    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout
    }

    /// Every non-blank plaintext credential on this record.
    pub fn secrets(&self) -> Vec<&str> {
        let auth = &self.authentication;
        [auth.password(), auth.private_key(), auth.passphrase()]
            .into_iter()
            .flatten()
            .filter(|secret| !secret.is_blank())
            .map(Secret::expose)
            .collect()
    }

    /// Expands `${name}` placeholders in the URL, branch and username and
    /// decodes the stored credentials, producing a ready-to-use record.
    ///
    /// Unknown placeholders are left in place.
    pub fn substituted<F>(
        &self,
        lookup: F,
        decoder: &dyn SecretDecoder,
    ) -> Result<AccessData, ValidationError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let authentication = match &self.authentication {
            Authentication::Password { password } => Authentication::Password {
                password: password.as_ref().map(|p| decoder.decode(p)).transpose()?,
            },
            Authentication::KeyPair {
                private_key,
                passphrase,
            } => Authentication::KeyPair {
                private_key: decoder.decode(private_key)?,
                passphrase: passphrase.as_ref().map(|p| decoder.decode(p)).transpose()?,
            },
            other => other.clone(),
        };

        self.to_builder()
            .url(expand_variables(&self.url, &lookup))
            .branch(expand_variables(&self.branch, &lookup))
            .username_opt(
                self.username
                    .as_deref()
                    .map(|name| expand_variables(name, &lookup)),
            )
            .authentication(authentication)
            .build()
    }
}

/// Builder for [`AccessData`]; `build` validates the result.
#[derive(Debug, Clone)]
pub struct AccessDataBuilder {
    data: AccessData,
}

impl AccessDataBuilder {
    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.data.url = url.into();
        self
    }

    pub fn branch(mut self, branch: impl Into<String>) -> Self {
        self.data.branch = branch.into();
        self
    }

    pub fn username(mut self, username: impl Into<String>) -> Self {
        self.data.username = Some(username.into());
        self
    }

    pub fn username_opt(mut self, username: Option<String>) -> Self {
        self.data.username = username;
        self
    }

    pub fn authentication(mut self, authentication: Authentication) -> Self {
        self.data.authentication = authentication;
        self
    }

    pub fn password(self, password: impl Into<Secret>) -> Self {
        self.authentication(Authentication::Password {
            password: Some(password.into()),
        })
    }

    pub fn key_pair(self, private_key: impl Into<Secret>, passphrase: Option<Secret>) -> Self {
        self.authentication(Authentication::KeyPair {
            private_key: private_key.into(),
            passphrase,
        })
    }

    pub fn shallow(mut self, shallow: bool) -> Self {
        self.data.shallow = shallow;
        self
    }

    pub fn submodules(mut self, submodules: bool) -> Self {
        self.data.submodules = submodules;
        self
    }

    pub fn remote_agent_cache(mut self, enabled: bool) -> Self {
        self.data.remote_agent_cache = enabled;
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.data.verbose = verbose;
        self
    }

    pub fn command_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.data.command_timeout = timeout;
        self
    }

    pub fn build(self) -> Result<AccessData, ValidationError> {
        validate_access(&self.data)?;
        Ok(self.data)
    }
}

fn expand_variables<F>(input: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(input.len());
    let mut rest = input;

    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                match lookup(name) {
                    Some(value) => out.push_str(&value),
                    None => out.push_str(&rest[start..start + 2 + end + 1]),
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn vars() -> HashMap<&'static str, &'static str> {
        HashMap::from([("repo", "widgets"), ("branch", "release/2.x")])
    }

    #[test]
    fn test_builder_defaults() {
        let data = AccessData::builder("https://example.com/repo.git")
            .build()
            .unwrap();
        assert_eq!(data.url(), "https://example.com/repo.git");
        assert_eq!(data.branch(), "");
        assert_eq!(data.username(), None);
        assert_eq!(data.authentication(), &Authentication::None);
        assert!(!data.is_shallow());
        assert!(data.command_timeout().is_none());
    }

    #[test]
    fn test_blank_username_is_none() {
        let data = AccessData::builder("https://example.com/repo.git")
            .username("   ")
            .build()
            .unwrap();
        assert_eq!(data.username(), None);
    }

    #[test]
    fn test_to_builder_overrides_only_named_fields() {
        let original = AccessData::builder("https://example.com/repo.git")
            .branch("main")
            .username("ci")
            .password("hunter2")
            .shallow(true)
            .build()
            .unwrap();

        let deep = original.to_builder().shallow(false).build().unwrap();

        assert!(original.is_shallow());
        assert!(!deep.is_shallow());
        assert_eq!(deep.branch(), "main");
        assert_eq!(deep.username(), Some("ci"));
        assert_eq!(deep.authentication(), original.authentication());
    }

    #[test]
    fn test_secret_debug_is_redacted() {
        let data = AccessData::builder("https://example.com/repo.git")
            .password("hunter2")
            .build()
            .unwrap();
        let debug = format!("{:?}", data);
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("********"));
    }

    #[test]
    fn test_secrets_skips_blank_values() {
        let data = AccessData::builder("ssh://git@example.com/repo.git")
            .key_pair("-----BEGIN KEY-----", Some(Secret::new("")))
            .build()
            .unwrap();
        assert_eq!(data.secrets(), vec!["-----BEGIN KEY-----"]);
    }

    #[test]
    fn test_substituted_expands_known_variables() {
        let vars = vars();
        let data = AccessData::builder("https://example.com/${repo}.git")
            .branch("${branch}")
            .username("${user}")
            .build()
            .unwrap();

        let resolved = data
            .substituted(|name| vars.get(name).map(|v| v.to_string()), &PlainSecrets)
            .unwrap();

        assert_eq!(resolved.url(), "https://example.com/widgets.git");
        assert_eq!(resolved.branch(), "release/2.x");
        assert_eq!(resolved.username(), Some("${user}"));
    }

    #[test]
    fn test_substituted_decodes_secrets() {
        struct Reversing;
        impl SecretDecoder for Reversing {
            fn decode(&self, secret: &Secret) -> Result<Secret, ValidationError> {
                Ok(Secret::new(secret.expose().chars().rev().collect::<String>()))
            }
        }

        let data = AccessData::builder("https://example.com/repo.git")
            .password("2retnuh")
            .build()
            .unwrap();
        let resolved = data.substituted(|_| None, &Reversing).unwrap();
        assert_eq!(
            resolved.authentication().password().map(Secret::expose),
            Some("hunter2")
        );
    }

    #[test]
    fn test_expand_unterminated_placeholder() {
        let out = expand_variables("abc${def", &|_: &str| Some("x".to_string()));
        assert_eq!(out, "abc${def");
    }

    #[test]
    fn test_authentication_kind() {
        assert_eq!(Authentication::None.kind(), "none");
        assert!(
            Authentication::SharedCredentials { id: "7".into() }.uses_key_pair()
        );
        assert!(!Authentication::Password { password: None }.uses_key_pair());
    }
}
