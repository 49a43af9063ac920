//! Input validation for access data and ref names.

use thiserror::Error;

use crate::access::{AccessData, Authentication};

/// Rejected configuration. Never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("repository URL is required")]
    MissingUrl,
    #[error("{field} contains shell metacharacters")]
    ShellInjection { field: &'static str },
    #[error("SSH key pair authentication cannot be used with an {scheme} URL")]
    KeyPairOverHttp { scheme: String },
    #[error("{0} is set both in the URL and in the repository settings")]
    DuplicateCredential(&'static str),
    #[error("a username cannot be used with a repository URL that has no host")]
    UsernameWithoutHost,
    #[error("{name} {reason}")]
    InvalidRef { name: String, reason: &'static str },
    #[error("failed to decode credential: {0}")]
    Decode(String),
}

const SHELL_METACHARACTERS: &[&str] = &["`", "$(", ";", "|", "&&", "\n", "\r", "\0"];

fn check_shell_injection(value: &str, field: &'static str) -> Result<(), ValidationError> {
    if SHELL_METACHARACTERS.iter().any(|m| value.contains(m)) {
        return Err(ValidationError::ShellInjection { field });
    }
    Ok(())
}

/// Validate that a git ref does not contain dangerous patterns.
///
/// Rejects:
/// - Empty strings
/// - Strings containing `..`
/// - Strings starting with `-` (could be interpreted as flags)
/// - Strings containing null bytes or control characters
pub fn validate_ref(value: &str, name: &str) -> Result<(), ValidationError> {
    let invalid = |reason| ValidationError::InvalidRef {
        name: name.to_string(),
        reason,
    };
    if value.is_empty() {
        return Err(invalid("cannot be empty"));
    }
    if value.contains("..") {
        return Err(invalid("cannot contain '..'"));
    }
    if value.starts_with('-') {
        return Err(invalid("cannot start with '-'"));
    }
    if value.bytes().any(|b| b < 0x20 || b == 0x7f) {
        return Err(invalid("cannot contain null or control characters"));
    }
    Ok(())
}

/// Checks an access record before it is used.
pub fn validate_access(data: &AccessData) -> Result<(), ValidationError> {
    let url = data.url().trim();
    if url.is_empty() {
        return Err(ValidationError::MissingUrl);
    }

    check_shell_injection(url, "repository URL")?;
    check_shell_injection(data.branch(), "branch")?;
    if let Some(username) = data.username() {
        check_shell_injection(username, "username")?;
    }
    if !data.branch().trim().is_empty() {
        validate_ref(data.branch().trim(), "branch")?;
    }

    let scheme = scheme_of(url);
    if let Authentication::KeyPair { .. } = data.authentication() {
        if let Some(scheme @ ("http" | "https")) = scheme.as_deref() {
            return Err(ValidationError::KeyPairOverHttp {
                scheme: scheme.to_string(),
            });
        }
    }

    let (url_user, url_password) = embedded_credentials(url);
    if url_user.is_some() && data.username().is_some() {
        return Err(ValidationError::DuplicateCredential("username"));
    }
    if url_password.is_some() && data.authentication().password().is_some() {
        return Err(ValidationError::DuplicateCredential("password"));
    }

    if data.username().is_some() && !has_host(url) {
        return Err(ValidationError::UsernameWithoutHost);
    }

    Ok(())
}

fn scheme_of(url: &str) -> Option<String> {
    url.find("://")
        .map(|idx| url[..idx].to_ascii_lowercase())
}

fn is_scp_like(url: &str) -> bool {
    if url.contains("://") {
        return false;
    }
    let head = url.split('/').next().unwrap_or("");
    head.contains(':')
}

/// The `user[:password]@` part of a URL or scp-style location.
fn embedded_credentials(url: &str) -> (Option<&str>, Option<&str>) {
    let authority = match url.find("://") {
        Some(idx) => {
            let rest = &url[idx + 3..];
            rest.split('/').next().unwrap_or("")
        }
        None if is_scp_like(url) => url.split(':').next().unwrap_or(""),
        None => return (None, None),
    };
    match authority.rfind('@') {
        Some(at) => {
            let user_info = &authority[..at];
            match user_info.split_once(':') {
                Some((user, password)) => (Some(user), Some(password).filter(|p| !p.is_empty())),
                None => (Some(user_info), None),
            }
        }
        None => (None, None),
    }
}

fn has_host(url: &str) -> bool {
    match scheme_of(url).as_deref() {
        Some("file") => false,
        Some(_) => {
            let rest = &url[url.find("://").map_or(0, |idx| idx + 3)..];
            let authority = rest.split('/').next().unwrap_or("");
            let host = authority.rsplit('@').next().unwrap_or("");
            !host.is_empty()
        }
        None => is_scp_like(url),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Secret;

    fn build(url: &str) -> crate::AccessDataBuilder {
        AccessData::builder(url)
    }

    mod refs {
        use super::*;

        #[test]
        fn test_accepts_plain_names() {
            assert!(validate_ref("main", "branch").is_ok());
            assert!(validate_ref("feature/x-1", "branch").is_ok());
            assert!(validate_ref("refs/tags/v1.0", "branch").is_ok());
        }

        #[test]
        fn test_rejects_flag_like_values() {
            assert!(matches!(
                validate_ref("--upload-pack=evil", "branch"),
                Err(ValidationError::InvalidRef { .. })
            ));
        }

        #[test]
        fn test_rejects_traversal_and_control() {
            assert!(validate_ref("a..b", "branch").is_err());
            assert!(validate_ref("a\tb", "branch").is_err());
            assert!(validate_ref("", "branch").is_err());
        }
    }

    mod access {
        use super::*;

        #[test]
        fn test_missing_url() {
            assert_eq!(build("  ").build(), Err(ValidationError::MissingUrl));
        }

        #[test]
        fn test_shell_injection_in_each_field() {
            assert_eq!(
                build("https://example.com/r.git; rm -rf /").build(),
                Err(ValidationError::ShellInjection {
                    field: "repository URL"
                })
            );
            assert_eq!(
                build("https://example.com/r.git").branch("main`id`").build(),
                Err(ValidationError::ShellInjection { field: "branch" })
            );
            assert_eq!(
                build("https://example.com/r.git")
                    .username("me$(id)")
                    .build(),
                Err(ValidationError::ShellInjection { field: "username" })
            );
        }

        #[test]
        fn test_key_pair_over_https_is_rejected() {
            let result = build("https://example.com/r.git")
                .key_pair("key", None)
                .build();
            assert!(matches!(
                result,
                Err(ValidationError::KeyPairOverHttp { scheme }) if scheme == "https"
            ));
        }

        #[test]
        fn test_key_pair_over_ssh_is_fine() {
            assert!(
                build("git@example.com:team/r.git")
                    .key_pair("key", Some(Secret::new("pass")))
                    .build()
                    .is_ok()
            );
        }

        #[test]
        fn test_duplicate_username() {
            assert_eq!(
                build("https://bob@example.com/r.git").username("alice").build(),
                Err(ValidationError::DuplicateCredential("username"))
            );
        }

        #[test]
        fn test_duplicate_password() {
            assert_eq!(
                build("https://bob:pw@example.com/r.git")
                    .password("other")
                    .build(),
                Err(ValidationError::DuplicateCredential("password"))
            );
        }

        #[test]
        fn test_username_without_host() {
            assert_eq!(
                build("/srv/git/r.git").username("alice").build(),
                Err(ValidationError::UsernameWithoutHost)
            );
            assert_eq!(
                build("file:///srv/git/r.git").username("alice").build(),
                Err(ValidationError::UsernameWithoutHost)
            );
        }

        #[test]
        fn test_scp_location_has_host() {
            assert!(
                build("example.com:team/r.git")
                    .username("alice")
                    .build()
                    .is_ok()
            );
        }
    }

    #[test]
    fn test_embedded_credentials() {
        assert_eq!(
            embedded_credentials("https://u:p@h/x"),
            (Some("u"), Some("p"))
        );
        assert_eq!(embedded_credentials("git@h:x/y.git"), (Some("git"), None));
        assert_eq!(embedded_credentials("/local/path"), (None, None));
    }
}
