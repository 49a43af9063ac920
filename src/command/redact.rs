//! Secret masking for command lines, output and error messages.

/// Text that replaces every secret.
pub const MASK: &str = "********";

/// Replaces known secrets (and their URL-encoded forms) with [`MASK`].
#[derive(Debug, Clone, Default)]
pub struct Redactor {
    secrets: Vec<String>,
}

impl Redactor {
    pub fn new<I, S>(secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut redactor = Self::default();
        redactor.extend(secrets);
        redactor
    }

    /// Adds more secrets.
    pub fn extend<I, S>(&mut self, secrets: I)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        for secret in secrets {
            let secret = secret.as_ref();
            if secret.trim().is_empty() {
                continue;
            }
            self.push(secret.to_string());
            if let Some(encoded) = userinfo_encoded(secret) {
                self.push(encoded);
            }
        }
        // Longest first so that a secret containing another is masked whole.
        self.secrets.sort_by_key(|s| std::cmp::Reverse(s.len()));
    }

    fn push(&mut self, secret: String) {
        if !self.secrets.contains(&secret) {
            self.secrets.push(secret);
        }
    }

    pub fn with<I, S>(&self, secrets: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut out = self.clone();
        out.extend(secrets);
        out
    }

    pub fn is_empty(&self) -> bool {
        self.secrets.is_empty()
    }

    pub fn mask(&self, text: &str) -> String {
        let mut out = text.to_string();
        for secret in &self.secrets {
            if out.contains(secret.as_str()) {
                out = out.replace(secret.as_str(), MASK);
            }
        }
        out
    }
}

/// The secret as it appears in the password part of a URL, when that differs.
fn userinfo_encoded(secret: &str) -> Option<String> {
    let mut url = url::Url::parse("http://mask@localhost/").ok()?;
    url.set_password(Some(secret)).ok()?;
    url.password()
        .filter(|encoded| *encoded != secret)
        .map(str::to_string)
}
