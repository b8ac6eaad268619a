//! Proxy resolution and scheme classification.
//!
//! [`ProxyResolver`] turns configuration (see [`crate::config`]) into an
//! optional [`ProxyConfig`]. Resolution never fails: anything ambiguous
//! resolves to "no proxy".
//!
//! ```rust
//! use std::collections::HashMap;
//! use std::sync::Arc;
//! use cloudpool::{ProxyKind, ProxyResolver};
//!
//! let mut source = HashMap::new();
//! source.insert("SOCKS5_PROXY_URL".to_string(), "socks5h://127.0.0.1:1080".to_string());
//!
//! let resolver = ProxyResolver::new(Arc::new(source));
//! let proxy = resolver.resolve().unwrap();
//! assert_eq!(proxy.kind(), ProxyKind::Socks);
//! ```

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cloudpool::config::{ConfigSource, EnvSource, ProxySettings};

const SOCKS_PREFIXES: [&str; 4] = ["socks5://", "socks5h://", "socks4://", "socks4h://"];
const HTTP_PREFIXES: [&str; 2] = ["http://", "https://"];

/// Transport family a proxy URL belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    /// SOCKS4/SOCKS5; needs a dedicated transport.
    Socks,
    /// Plain HTTP/HTTPS forward proxy.
    Http,
    /// Unknown scheme, passed through untouched.
    Unclassified,
}

impl ProxyKind {
    pub fn classify(url: &str) -> Self {
        if has_prefix(url, &SOCKS_PREFIXES) {
            ProxyKind::Socks
        } else if has_prefix(url, &HTTP_PREFIXES) {
            ProxyKind::Http
        } else {
            ProxyKind::Unclassified
        }
    }
}

fn has_prefix(url: &str, prefixes: &[&str]) -> bool {
    prefixes.iter().any(|prefix| {
        url.get(..prefix.len())
            .map_or(false, |head| head.eq_ignore_ascii_case(prefix))
    })
}

/// A resolved proxy URL together with its classification.
///
/// Serialises as the bare URL string; the kind is recomputed on deserialisation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct ProxyConfig {
    url: String,
    kind: ProxyKind,
}

impl ProxyConfig {
    /// Classifies `url` (trimmed). Any string is accepted.
    pub fn new(url: impl Into<String>) -> Self {
        let url = url.into().trim().to_string();
        let kind = ProxyKind::classify(&url);
        ProxyConfig { url, kind }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn kind(&self) -> ProxyKind {
        self.kind
    }

    pub fn is_socks(&self) -> bool {
        self.kind == ProxyKind::Socks
    }

    /// The URL in the form reqwest expects.
    ///
    /// reqwest spells remote-DNS SOCKS4 as `socks4a`, so `socks4h://` is rewritten.
    pub fn transport_url(&self) -> String {
        match self.url.get(..10) {
            Some(head) if head.eq_ignore_ascii_case("socks4h://") => {
                format!("socks4a://{}", &self.url[10..])
            }
            _ => self.url.clone(),
        }
    }

    /// The URL with any `user:password@` part masked, for logging.
    ///
    /// Only the authority is inspected, so an `@` in the path or query is kept.
    pub fn redacted(&self) -> String {
        let Some(scheme_end) = self.url.find("://").map(|i| i + 3) else {
            return self.url.clone();
        };
        let rest = &self.url[scheme_end..];
        let authority_len = rest.find(['/', '?', '#']).unwrap_or(rest.len());
        match rest[..authority_len].rfind('@') {
            Some(at) => format!("{}***{}", &self.url[..scheme_end], &rest[at..]),
            None => self.url.clone(),
        }
    }

    /// Builds the reqwest proxy routing every scheme through this URL.
    pub fn to_reqwest(&self) -> reqwest::Result<reqwest::Proxy> {
        reqwest::Proxy::all(self.transport_url())
    }
}

impl From<String> for ProxyConfig {
    fn from(url: String) -> Self {
        ProxyConfig::new(url)
    }
}

impl From<ProxyConfig> for String {
    fn from(config: ProxyConfig) -> Self {
        config.url
    }
}

/// Displays the redacted URL.
impl fmt::Display for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

/// Resolves the configured proxy from a [`ConfigSource`].
#[derive(Clone)]
pub struct ProxyResolver {
    source: Option<Arc<dyn ConfigSource>>,
}

impl fmt::Debug for ProxyResolver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyResolver")
            .field("disabled", &self.source.is_none())
            .finish()
    }
}

impl Default for ProxyResolver {
    fn default() -> Self {
        Self::from_env()
    }
}

impl ProxyResolver {
    pub fn new(source: Arc<dyn ConfigSource>) -> Self {
        ProxyResolver {
            source: Some(source),
        }
    }

    /// Reads `PROXY_ENABLED` / `SOCKS5_PROXY_URL` / `PROXY_TIMEOUT` from the environment.
    pub fn from_env() -> Self {
        Self::new(Arc::new(EnvSource))
    }

    /// A resolver that never yields a proxy.
    pub fn disabled() -> Self {
        ProxyResolver { source: None }
    }

    /// Current settings. Configuration is re-read on every call.
    pub fn settings(&self) -> ProxySettings {
        match &self.source {
            Some(source) => ProxySettings::from_source(source.as_ref()),
            None => ProxySettings::default(),
        }
    }

    pub fn resolve(&self) -> Option<ProxyConfig> {
        self.settings().active_url().map(ProxyConfig::new)
    }

    pub fn proxy_enabled(&self) -> bool {
        self.settings().is_active()
    }

    pub fn proxy_timeout(&self) -> Duration {
        self.settings().timeout
    }
}
