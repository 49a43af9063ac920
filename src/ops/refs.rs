//! Advertised remote refs and branch resolution against them.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use gitsync_cache::TtlCache;
use gitsync_types::{AccessData, Authentication};
use sha1::{Digest, Sha1};

pub const HEADS_PREFIX: &str = "refs/heads/";
pub const TAGS_PREFIX: &str = "refs/tags/";
pub const REFS_PREFIX: &str = "refs/";
pub const DEFAULT_BRANCH: &str = "master";

/// Ref name to commit hash, as advertised by the remote.
pub type RemoteRefs = BTreeMap<String, String>;

/// Parses `ls-remote` output. Peeled tag entries (`^{}`) are dropped so a tag
/// maps to the object it names directly.
pub fn parse_ls_remote(output: &str) -> RemoteRefs {
    output
        .lines()
        .filter(|line| !line.contains("^{}"))
        .filter_map(|line| {
            let (hash, name) = line.split_once(char::is_whitespace)?;
            let name = name.trim();
            (is_full_hash(hash) && !name.is_empty()).then(|| (name.to_string(), hash.to_string()))
        })
        .collect()
}

fn is_full_hash(value: &str) -> bool {
    value.len() == 40 && value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

/// Looks like an abbreviated or full commit id.
pub fn looks_like_commit(value: &str) -> bool {
    (7..=40).contains(&value.len()) && value.bytes().all(|b| b.is_ascii_hexdigit())
}

pub fn is_fully_qualified(branch: &str) -> bool {
    branch.starts_with(REFS_PREFIX)
}

/// Refs to try, in order, for a configured branch.
pub fn branch_candidates(branch: &str) -> Vec<String> {
    let branch = branch.trim();
    if branch.is_empty() {
        vec![format!("{}{}", HEADS_PREFIX, DEFAULT_BRANCH), "HEAD".to_string()]
    } else if is_fully_qualified(branch) {
        vec![branch.to_string()]
    } else {
        vec![
            branch.to_string(),
            format!("{}{}", HEADS_PREFIX, branch),
            format!("{}{}", TAGS_PREFIX, branch),
        ]
    }
}

/// The first candidate the remote advertises, with its hash.
pub fn resolve_branch<'a>(refs: &'a RemoteRefs, branch: &str) -> Option<(&'a str, &'a str)> {
    branch_candidates(branch)
        .iter()
        .find_map(|candidate| refs.get_key_value(candidate.as_str()))
        .map(|(name, hash)| (name.as_str(), hash.as_str()))
}

/// Refspec for one fetch and what to check once it is done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchPlan {
    pub refspec: String,
    /// Set when the target was not advertised and is fetched as a commit id.
    pub commit: Option<String>,
}

impl FetchPlan {
    /// Force-updates `name` to whatever the remote has.
    pub fn exact(name: &str) -> Self {
        Self {
            refspec: format!("+{0}:{0}", name),
            commit: None,
        }
    }

    /// Resolves `target` against the advertised refs. An unknown target that
    /// looks like a commit id fetches every branch; anything else is `None`.
    pub fn resolve(refs: &RemoteRefs, target: &str) -> Option<Self> {
        match resolve_branch(refs, target) {
            Some(("HEAD", _)) => Some(Self {
                refspec: "HEAD".to_string(),
                commit: None,
            }),
            Some((name, _)) => Some(Self::exact(name)),
            None if looks_like_commit(target.trim()) => Some(Self {
                refspec: format!("+{0}*:{0}*", HEADS_PREFIX),
                commit: Some(target.trim().to_string()),
            }),
            None => None,
        }
    }

    /// The branch this fetch updates, if it updates exactly one.
    pub fn local_branch(&self) -> Option<&str> {
        if self.commit.is_some() {
            return None;
        }
        self.refspec
            .strip_prefix('+')?
            .split(':')
            .next()?
            .strip_prefix(HEADS_PREFIX)
    }
}

/// Short names of advertised branches.
pub fn branch_names(refs: &RemoteRefs) -> Vec<String> {
    refs.keys()
        .filter_map(|name| name.strip_prefix(HEADS_PREFIX))
        .map(str::to_string)
        .collect()
}

/// What a remote listing depends on. Passwords are not part of it and key
/// material only by fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RefCacheKey {
    url: String,
    username: Option<String>,
    key_fingerprint: Option<String>,
}

impl RefCacheKey {
    pub fn for_access(access: &AccessData) -> Self {
        let key_fingerprint = match access.authentication() {
            Authentication::KeyPair { private_key, .. } => {
                Some(hex::encode(Sha1::digest(private_key.expose().as_bytes())))
            }
            Authentication::SharedCredentials { id } => Some(format!("shared:{}", id)),
            _ => None,
        };
        Self {
            url: access.url().to_string(),
            username: access.username().map(str::to_string),
            key_fingerprint,
        }
    }
}

/// Short-lived memo of remote listings, shared by every operation helper.
pub struct RemoteRefCache {
    entries: TtlCache<RefCacheKey, Arc<RemoteRefs>>,
}

impl RemoteRefCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: TtlCache::with_ttl(ttl),
        }
    }

    pub fn get_or_fetch<E, F>(&self, access: &AccessData, fetch: F) -> Result<Arc<RemoteRefs>, E>
    where
        F: FnOnce() -> Result<RemoteRefs, E>,
    {
        self.entries
            .get_or_try_insert_with(RefCacheKey::for_access(access), || fetch().map(Arc::new))
    }

    pub fn invalidate(&self, access: &AccessData) {
        self.entries.invalidate(&RefCacheKey::for_access(access));
    }
}

impl Default for RemoteRefCache {
    fn default() -> Self {
        Self::new(gitsync_cache::DEFAULT_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    const FIXTURE: &str = "\
1111111111111111111111111111111111111111\tHEAD
1111111111111111111111111111111111111111\trefs/heads/master
2222222222222222222222222222222222222222\trefs/heads/feature/x
3333333333333333333333333333333333333333\trefs/tags/v1.0
4444444444444444444444444444444444444444\trefs/tags/v1.0^{}
warning: redirecting to https://example.com/
";

    #[test]
    fn test_peeled_tags_are_excluded() {
        let refs = parse_ls_remote(FIXTURE);
        assert_eq!(
            refs.get("refs/tags/v1.0").map(String::as_str),
            Some("3333333333333333333333333333333333333333")
        );
        assert!(!refs.contains_key("refs/tags/v1.0^{}"));
        assert!(!refs.values().any(|hash| hash.starts_with('4')));
        assert_eq!(refs.len(), 4);
    }

    #[test]
    fn test_blank_branch_prefers_master_then_head() {
        let refs = parse_ls_remote(FIXTURE);
        assert_eq!(resolve_branch(&refs, "").map(|r| r.0), Some("refs/heads/master"));

        let mut only_head = RemoteRefs::new();
        only_head.insert("HEAD".to_string(), "a".repeat(40));
        assert_eq!(resolve_branch(&only_head, " ").map(|r| r.0), Some("HEAD"));
    }

    #[test]
    fn test_short_names_try_heads_then_tags() {
        let refs = parse_ls_remote(FIXTURE);
        assert_eq!(
            resolve_branch(&refs, "feature/x").map(|r| r.0),
            Some("refs/heads/feature/x")
        );
        assert_eq!(resolve_branch(&refs, "v1.0").map(|r| r.0), Some("refs/tags/v1.0"));
        assert_eq!(resolve_branch(&refs, "missing"), None);
    }

    #[test]
    fn test_qualified_refs_are_used_as_is() {
        assert_eq!(branch_candidates("refs/pull/1/head"), vec!["refs/pull/1/head"]);
    }

    #[test]
    fn test_commit_like_values() {
        assert!(looks_like_commit("abc1234"));
        assert!(looks_like_commit(&"f".repeat(40)));
        assert!(!looks_like_commit("abc12"));
        assert!(!looks_like_commit("feature"));
    }

    #[test]
    fn test_fetch_plans() {
        let refs = parse_ls_remote(FIXTURE);
        let branch = FetchPlan::resolve(&refs, "feature/x").unwrap();
        assert_eq!(branch.refspec, "+refs/heads/feature/x:refs/heads/feature/x");
        assert_eq!(branch.local_branch(), Some("feature/x"));

        let tag = FetchPlan::resolve(&refs, "v1.0").unwrap();
        assert_eq!(tag.local_branch(), None);

        let commit = FetchPlan::resolve(&refs, "abcdef0").unwrap();
        assert_eq!(commit.refspec, "+refs/heads/*:refs/heads/*");
        assert_eq!(commit.commit.as_deref(), Some("abcdef0"));
        assert_eq!(commit.local_branch(), None);

        assert_eq!(FetchPlan::resolve(&refs, "missing"), None);

        let mut only_head = RemoteRefs::new();
        only_head.insert("HEAD".to_string(), "a".repeat(40));
        assert_eq!(FetchPlan::resolve(&only_head, "").unwrap().refspec, "HEAD");
    }

    #[test]
    fn test_lists_branch_names() {
        let refs = parse_ls_remote(FIXTURE);
        assert_eq!(branch_names(&refs), vec!["feature/x", "master"]);
    }

    #[test]
    fn test_cache_key_ignores_password() {
        let a = AccessData::builder("https://h/r").password("one").build().unwrap();
        let b = AccessData::builder("https://h/r").password("two").build().unwrap();
        assert_eq!(RefCacheKey::for_access(&a), RefCacheKey::for_access(&b));

        let k1 = AccessData::builder("ssh://h/r").key_pair("k1", None).build().unwrap();
        let k2 = AccessData::builder("ssh://h/r").key_pair("k2", None).build().unwrap();
        assert_ne!(RefCacheKey::for_access(&k1), RefCacheKey::for_access(&k2));
    }

    #[test]
    fn test_listing_is_memoized_per_access() {
        let cache = RemoteRefCache::new(Duration::from_secs(60));
        let access = AccessData::builder("https://h/r").build().unwrap();
        let calls = Cell::new(0);
        let fetch = || -> Result<RemoteRefs, ()> {
            calls.set(calls.get() + 1);
            Ok(parse_ls_remote(FIXTURE))
        };

        cache.get_or_fetch(&access, fetch).unwrap();
        cache.get_or_fetch(&access, fetch).unwrap();
        assert_eq!(calls.get(), 1);

        cache.invalidate(&access);
        cache.get_or_fetch(&access, fetch).unwrap();
        assert_eq!(calls.get(), 2);
    }
}
