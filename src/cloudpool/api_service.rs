//! Base contract for services that call remote APIs through the client pool.
//!
//! A concrete service embeds a [`ServiceBase`] (which holds the pool) and
//! implements [`ApiService`]. It must override [`ApiService::get_config`];
//! everything else has working defaults.
//!
//! # Example
//!
//! ```rust
//! use cloudpool::{ApiService, ClientRequest, ServiceBase, ServiceConfig, ServiceError};
//!
//! struct Weather {
//!     base: ServiceBase,
//! }
//!
//! impl ApiService for Weather {
//!     fn base(&self) -> &ServiceBase {
//!         &self.base
//!     }
//!
//!     fn get_config(&self) -> Result<ServiceConfig, ServiceError> {
//!         Ok(ServiceConfig::new(
//!             ClientRequest::new("weather").with_base_url("https://api.weather.test"),
//!         ))
//!     }
//! }
//!
//! let service = Weather { base: ServiceBase::default() };
//! let handle = service.client().unwrap();
//! assert_eq!(handle.url_for("/today"), "https://api.weather.test/today");
//! ```

use std::error::Error;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};

use crate::cloudpool::client_handle::ClientHandle;
use crate::cloudpool::error::{PoolError, ServiceError};
use crate::cloudpool::http_client_pool::{ClientRequest, HttpClientPool};

/// Uniform failure payload returned by [`ApiService::handle_error`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub error: String,
}

impl ErrorResponse {
    pub fn failure(message: impl Into<String>) -> Self {
        ErrorResponse {
            success: false,
            error: message.into(),
        }
    }
}

/// A service's configuration: how to reach it, plus free-form settings
/// (model names, API versions, ...).
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub client: ClientRequest,
    pub settings: Map<String, JsonValue>,
}

impl ServiceConfig {
    pub fn new(client: ClientRequest) -> Self {
        ServiceConfig {
            client,
            settings: Map::new(),
        }
    }

    pub fn with_setting(mut self, key: impl Into<String>, value: impl Into<JsonValue>) -> Self {
        self.settings.insert(key.into(), value.into());
        self
    }

    pub fn setting(&self, key: &str) -> Option<&JsonValue> {
        self.settings.get(key)
    }
}

/// Turns a failure into a human readable message for a given provider.
pub trait ErrorFormatter: Send + Sync {
    fn format_api_error(&self, error: &(dyn Error + 'static), provider: &str) -> String;
}

impl<F> ErrorFormatter for F
where
    F: Fn(&(dyn Error + 'static), &str) -> String + Send + Sync,
{
    fn format_api_error(&self, error: &(dyn Error + 'static), provider: &str) -> String {
        self(error, provider)
    }
}

/// Delegates to [`format_api_error`].
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultErrorFormatter;

impl ErrorFormatter for DefaultErrorFormatter {
    fn format_api_error(&self, error: &(dyn Error + 'static), provider: &str) -> String {
        format_api_error(error, provider)
    }
}

/// Formats `error` as `"<provider> API error: <detail>"`.
///
/// Transport errors are classified (timeout, connection, HTTP status,
/// redirect loop, decoding) wherever they sit in the source chain.
pub fn format_api_error(error: &(dyn Error + 'static), provider: &str) -> String {
    format!("{} API error: {}", provider_label(provider), describe(error))
}

fn provider_label(provider: &str) -> &str {
    match provider.trim() {
        "" => "unknown provider",
        trimmed => trimmed,
    }
}

fn describe(error: &(dyn Error + 'static)) -> String {
    if let Some(err) = error.downcast_ref::<ServiceError>() {
        return match err {
            ServiceError::Pool(pool) => describe_pool(pool),
            other => other.to_string(),
        };
    }
    if let Some(err) = error.downcast_ref::<PoolError>() {
        return describe_pool(err);
    }

    let mut current: Option<&(dyn Error + 'static)> = Some(error);
    while let Some(err) = current {
        if let Some(reqwest_err) = err.downcast_ref::<reqwest::Error>() {
            return describe_reqwest(reqwest_err);
        }
        current = err.source();
    }
    error.to_string()
}

fn describe_pool(error: &PoolError) -> String {
    match error {
        PoolError::Request(err) => describe_reqwest(err),
        other => other.to_string(),
    }
}

fn describe_reqwest(error: &reqwest::Error) -> String {
    if error.is_timeout() {
        "request timed out".to_string()
    } else if error.is_connect() {
        format!("connection failed: {}", error)
    } else if let Some(status) = error.status() {
        match status.canonical_reason() {
            Some(reason) => format!("HTTP {} {}", status.as_u16(), reason),
            None => format!("HTTP {}", status.as_u16()),
        }
    } else if error.is_redirect() {
        "too many redirects".to_string()
    } else if error.is_decode() {
        format!("could not decode response: {}", error)
    } else {
        error.to_string()
    }
}

fn generic_error_message(provider: &str) -> String {
    format!("{} API call failed", provider_label(provider))
}

/// Holds the pool a service draws its clients from.
#[derive(Clone)]
pub struct ServiceBase {
    pool: Arc<HttpClientPool>,
}

impl Default for ServiceBase {
    /// Uses [`HttpClientPool::global`].
    fn default() -> Self {
        Self::new(None)
    }
}

impl ServiceBase {
    /// Uses `pool`, or the global pool when `None`.
    pub fn new(pool: Option<Arc<HttpClientPool>>) -> Self {
        ServiceBase {
            pool: pool.unwrap_or_else(HttpClientPool::global),
        }
    }

    pub fn with_pool(pool: Arc<HttpClientPool>) -> Self {
        Self::new(Some(pool))
    }

    pub fn pool(&self) -> &Arc<HttpClientPool> {
        &self.pool
    }
}

/// Contract shared by every API-calling service.
pub trait ApiService: Send + Sync {
    fn base(&self) -> &ServiceBase;

    /// The service configuration. Services must override this; the default
    /// reports [`ServiceError::Unimplemented`].
    fn get_config(&self) -> Result<ServiceConfig, ServiceError> {
        Err(ServiceError::Unimplemented {
            capability: "get_config",
        })
    }

    fn pool(&self) -> &HttpClientPool {
        self.base().pool()
    }

    /// The pooled client for this service's configuration.
    fn client(&self) -> Result<ClientHandle, ServiceError> {
        let config = self.get_config()?;
        Ok(self.pool().get_client(&config.client)?)
    }

    fn error_formatter(&self) -> &dyn ErrorFormatter {
        &DefaultErrorFormatter
    }

    /// Translates `error` into an [`ErrorResponse`]. Never panics: a
    /// formatter that panics or returns nothing yields a generic message.
    fn handle_error(&self, error: &(dyn Error + 'static), provider: &str) -> ErrorResponse {
        let formatter = self.error_formatter();
        let formatted =
            panic::catch_unwind(AssertUnwindSafe(|| formatter.format_api_error(error, provider)));
        let message = match formatted {
            Ok(message) if !message.trim().is_empty() => message,
            Ok(_) => generic_error_message(provider),
            Err(_) => {
                log::error!(
                    "cloudpool::api_service: error formatter panicked while handling a {} error",
                    provider_label(provider)
                );
                generic_error_message(provider)
            }
        };
        ErrorResponse::failure(message)
    }
}
