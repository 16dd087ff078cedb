use serde::{Deserialize, Serialize};

/// Stored session cookie, wire-compatible with the `data.json` account file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Cookie {
    pub key: String,
    pub value: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// RFC 3339 expiry, absent for session cookies
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires: Option<String>,
    #[serde(default)]
    pub secure: bool,
    #[serde(default, rename = "httpOnly")]
    pub http_only: bool,
    #[serde(default, rename = "sameSite", skip_serializing_if = "Option::is_none")]
    pub same_site: Option<String>,
}

impl Cookie {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            domain: None,
            path: None,
            expires: None,
            secure: false,
            http_only: false,
            same_site: None,
        }
    }

    /// `key=value` form expected by the driver's cookie installer.
    pub fn pair(&self) -> String {
        format!("{}={}", self.key, self.value)
    }
}

/// Scraping account as persisted in `data.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub username: String,
    pub password: String,
    pub email: String,
    /// TOTP secret for challenge-gated logins
    #[serde(rename = "2fa", default)]
    pub two_factor_secret: String,
    /// Soft gate: unusable accounts are skipped by selection but kept on file
    #[serde(default = "default_usable")]
    pub usable: bool,
    /// Hard gate: cleared only by admin action
    #[serde(rename = "isLocked", default)]
    pub is_locked: bool,
    #[serde(rename = "cookie", default, skip_serializing_if = "Vec::is_empty")]
    pub cookies: Vec<Cookie>,
}

fn default_usable() -> bool {
    true
}

impl Account {
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        email: impl Into<String>,
        two_factor_secret: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            email: email.into(),
            two_factor_secret: two_factor_secret.into(),
            usable: true,
            is_locked: false,
            cookies: Vec::new(),
        }
    }

    /// Whether a stored session exists that can be installed without a login.
    pub fn has_session(&self) -> bool {
        !self.cookies.is_empty()
    }

    /// Cookie pairs in the `key=value` form the driver installs.
    pub fn cookie_pairs(&self) -> Vec<String> {
        self.cookies.iter().map(Cookie::pair).collect()
    }
}

/// Mask a username for log output, keeping only a short prefix.
pub fn mask_username(username: &str) -> String {
    let prefix: String = username.chars().take(3).collect();
    format!("{}***", prefix)
}
