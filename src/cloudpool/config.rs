//! Configuration inputs for proxy resolution.
//!
//! Settings are read through the [`ConfigSource`] trait so the same resolution
//! policy works against the process environment, a JSON file, or an in-memory
//! map in tests.
//!
//! # Example
//!
//! ```rust
//! use std::collections::HashMap;
//! use cloudpool::config::{ProxyEnabled, ProxySettings, PROXY_ENABLED_VAR, PROXY_URL_VAR};
//!
//! let mut source = HashMap::new();
//! source.insert(PROXY_ENABLED_VAR.to_string(), "false".to_string());
//! source.insert(PROXY_URL_VAR.to_string(), "socks5://127.0.0.1:1080".to_string());
//!
//! let settings = ProxySettings::from_source(&source);
//! assert_eq!(settings.enabled, ProxyEnabled::Disabled);
//! assert!(!settings.is_active());
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::cloudpool::error::ConfigError;

/// Tri-state proxy switch.
pub const PROXY_ENABLED_VAR: &str = "PROXY_ENABLED";
/// Proxy URL, SOCKS or HTTP despite the name.
pub const PROXY_URL_VAR: &str = "SOCKS5_PROXY_URL";
/// Proxy timeout in seconds.
pub const PROXY_TIMEOUT_VAR: &str = "PROXY_TIMEOUT";

/// Used when `PROXY_TIMEOUT` is missing or not a usable number.
pub const DEFAULT_PROXY_TIMEOUT: Duration = Duration::from_secs(30);

/// A read-only key/value view over some configuration backend.
pub trait ConfigSource: Send + Sync {
    /// Returns the raw value for `key`, or `None` when it is not set.
    fn get(&self, key: &str) -> Option<String>;
}

/// Reads values from the process environment.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvSource;

impl ConfigSource for EnvSource {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl ConfigSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        HashMap::get(self, key).cloned()
    }
}

/// Values loaded once from a flat JSON object, e.g.
/// `{"PROXY_ENABLED": true, "SOCKS5_PROXY_URL": "socks5://127.0.0.1:1080"}`.
///
/// Scalars are stringified so booleans and numbers read the same way as their
/// environment counterparts. Nested values and `null` are ignored.
#[derive(Debug, Clone, Default)]
pub struct JsonFileSource {
    values: HashMap<String, String>,
}

impl JsonFileSource {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: display.clone(),
            source,
        })?;
        let parsed: JsonValue = serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: display.clone(),
            source,
        })?;
        let object = match parsed {
            JsonValue::Object(object) => object,
            _ => return Err(ConfigError::NotAnObject { path: display }),
        };

        let values = object
            .into_iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    JsonValue::String(s) => s,
                    JsonValue::Bool(b) => b.to_string(),
                    JsonValue::Number(n) => n.to_string(),
                    _ => return None,
                };
                Some((key, value))
            })
            .collect();

        Ok(JsonFileSource { values })
    }
}

impl ConfigSource for JsonFileSource {
    fn get(&self, key: &str) -> Option<String> {
        self.values.get(key).cloned()
    }
}

/// Explicit proxy switch. `Unset` lets the presence of a URL decide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyEnabled {
    Enabled,
    Disabled,
    #[default]
    Unset,
}

impl ProxyEnabled {
    /// Parses the raw flag. Only `true`/`false` (any case) are meaningful;
    /// blank or unrecognised text counts as `Unset`.
    pub fn parse(raw: Option<&str>) -> Self {
        let Some(raw) = raw.map(str::trim).filter(|s| !s.is_empty()) else {
            return ProxyEnabled::Unset;
        };
        if raw.eq_ignore_ascii_case("true") {
            ProxyEnabled::Enabled
        } else if raw.eq_ignore_ascii_case("false") {
            ProxyEnabled::Disabled
        } else {
            log::debug!(
                "cloudpool::config: ignoring unrecognised {} value '{}'",
                PROXY_ENABLED_VAR,
                raw
            );
            ProxyEnabled::Unset
        }
    }
}

/// Proxy configuration as read from a [`ConfigSource`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProxySettings {
    pub enabled: ProxyEnabled,
    /// Trimmed proxy URL; `None` when blank.
    pub url: Option<String>,
    pub timeout: Duration,
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            enabled: ProxyEnabled::Unset,
            url: None,
            timeout: DEFAULT_PROXY_TIMEOUT,
        }
    }
}

impl ProxySettings {
    pub fn from_source(source: &dyn ConfigSource) -> Self {
        let enabled = ProxyEnabled::parse(source.get(PROXY_ENABLED_VAR).as_deref());
        let url = source
            .get(PROXY_URL_VAR)
            .map(|url| url.trim().to_string())
            .filter(|url| !url.is_empty());
        let timeout = parse_timeout(source.get(PROXY_TIMEOUT_VAR).as_deref());

        ProxySettings {
            enabled,
            url,
            timeout,
        }
    }

    /// Whether a proxy should be applied at all.
    ///
    /// `Disabled` always wins; otherwise a proxy is active iff a URL is present.
    pub fn is_active(&self) -> bool {
        match self.enabled {
            ProxyEnabled::Disabled => false,
            ProxyEnabled::Enabled | ProxyEnabled::Unset => self.url.is_some(),
        }
    }

    /// The URL to route through, if the settings call for a proxy.
    pub fn active_url(&self) -> Option<&str> {
        if self.is_active() {
            self.url.as_deref()
        } else {
            None
        }
    }
}

fn parse_timeout(raw: Option<&str>) -> Duration {
    raw.and_then(|raw| raw.trim().parse::<f64>().ok())
        .filter(|secs| secs.is_finite() && *secs >= 0.0)
        .map(Duration::from_secs_f64)
        .unwrap_or(DEFAULT_PROXY_TIMEOUT)
}
