//! Error types for the client pool and the services built on top of it.
//!
//! Proxy misconfiguration never shows up here: the pool degrades to a direct
//! connection and logs a warning instead. What remains are the failures a
//! caller can actually act on.

use thiserror::Error;

/// Errors raised by [`HttpClientPool`](crate::HttpClientPool) and [`ClientHandle`](crate::ClientHandle).
#[derive(Debug, Error)]
pub enum PoolError {
    /// The underlying transport could not be constructed, even without a proxy.
    #[error("failed to build HTTP client for '{key}': {source}")]
    Build {
        key: String,
        #[source]
        source: reqwest::Error,
    },

    /// The handle was closed, either individually or by a pool shutdown.
    #[error("client handle #{id} is closed")]
    Closed { id: u64 },

    /// In-flight requests did not finish within the close grace period.
    #[error("client handle #{id} still had requests in flight after {grace_ms}ms")]
    CloseTimeout { id: u64, grace_ms: u128 },

    /// A request issued through a handle failed.
    #[error(transparent)]
    Request(#[from] reqwest::Error),
}

/// Errors raised while loading a file-backed [`ConfigSource`](crate::config::ConfigSource).
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file '{path}': {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    /// The file parsed, but its top level is not a JSON object.
    #[error("config file '{path}' must contain a JSON object")]
    NotAnObject { path: String },
}

/// Errors raised by [`ApiService`](crate::ApiService) implementations.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// A required capability was not overridden by the concrete service.
    #[error("unimplemented capability: {capability}")]
    Unimplemented { capability: &'static str },

    #[error(transparent)]
    Pool(#[from] PoolError),
}
