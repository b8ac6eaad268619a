//! # cloudpool
//!
//! cloudpool manages the HTTP clients an application uses to talk to remote APIs. Instead of
//! building a fresh `reqwest::Client` per call (and paying for DNS, TCP and TLS every time),
//! services ask a shared [`HttpClientPool`] for a client keyed by destination and get the same
//! warm client back on every call.
//!
//! The crate provides:
//!
//! * **Client pooling**: [`HttpClientPool`] caches one [`ClientHandle`] per cache key (the base
//!   URL, or the provider name when there is none), with connection limits, timeouts, TLS and
//!   redirect policy bound at creation time
//! * **Execution-context awareness**: cached clients are discarded wholesale when the pool sees
//!   a different [`ContextToken`], e.g. after a test harness restarts its runtime
//! * **Proxy routing**: SOCKS4/SOCKS5 and HTTP(S) proxies, taken from the call site or resolved
//!   from `PROXY_ENABLED` / `SOCKS5_PROXY_URL` by [`ProxyResolver`]; system proxy variables are
//!   never applied behind your back
//! * **Service contract**: [`ApiService`] plus [`ServiceBase`] give API-calling services a pool
//!   and a uniform `{ "success": false, "error": ... }` error translation
//!
//! ## Getting a client
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use cloudpool::{ClientRequest, HttpClientPool};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     cloudpool::init_logger();
//!
//!     let pool = HttpClientPool::global();
//!     let request = ClientRequest::new("anthropic")
//!         .with_base_url("https://api.anthropic.com/v1")
//!         .with_timeout(Duration::from_secs(120));
//!
//!     // Same key, same client.
//!     let handle = pool.get_client(&request)?;
//!     assert_eq!(handle, pool.get_client(&request)?);
//!
//!     let response = handle.send(handle.get("/models")).await?;
//!     println!("{}", response.status());
//!
//!     pool.close_all().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Proxies
//!
//! An explicit proxy always wins. Without one, the pool consults its [`ProxyResolver`]:
//!
//! | `PROXY_ENABLED` | `SOCKS5_PROXY_URL` | result        |
//! |-----------------|--------------------|---------------|
//! | `false`         | anything           | direct        |
//! | `true`          | empty              | direct        |
//! | unset           | empty              | direct        |
//! | unset / `true`  | `socks5://...`     | SOCKS proxy   |
//! | unset / `true`  | `http://...`       | HTTP proxy    |
//!
//! SOCKS transports need the `socks` feature (on by default). Without it, or when a proxy URL
//! cannot be used, the pool logs a warning and connects directly rather than failing.
//!
//! ```rust,no_run
//! use cloudpool::{ClientRequest, HttpClientPool};
//!
//! # fn main() -> Result<(), cloudpool::PoolError> {
//! let pool = HttpClientPool::global();
//! let handle = pool.get_client(
//!     &ClientRequest::new("vlm")
//!         .with_base_url("https://vision.example.com")
//!         .with_proxy("socks5h://127.0.0.1:1080"),
//! )?;
//! assert!(handle.proxy().map_or(false, |proxy| proxy.is_socks()));
//! # Ok(())
//! # }
//! ```
//!
//! ## Services
//!
//! See [`api_service`] for implementing [`ApiService`].

use std::sync::Once;

static INIT_LOGGER: Once = Once::new();

/// Initialise the global [`env_logger`] subscriber exactly once.
///
/// Applications embedding cloudpool can opt in to `RUST_LOG` driven diagnostics (client
/// creation, invalidations, proxy fallbacks) without picking a logging backend upfront.
///
/// ```rust
/// cloudpool::init_logger();
/// log::info!("Logger is ready");
/// ```
pub fn init_logger() {
    INIT_LOGGER.call_once(|| {
        env_logger::init();
    });
}

// Import the top-level `cloudpool` module.
pub mod cloudpool;

// Re-exporting key items for easier external access.
pub use cloudpool::api_service;
pub use cloudpool::api_service::{
    format_api_error, ApiService, DefaultErrorFormatter, ErrorFormatter, ErrorResponse,
    ServiceBase, ServiceConfig,
};
pub use cloudpool::client_handle::{ClientHandle, ClientSettings, PoolLimits, Timeouts};
pub use cloudpool::config;
pub use cloudpool::error::{ConfigError, PoolError, ServiceError};
pub use cloudpool::execution_context::{
    advance_runtime_epoch, ContextToken, ExecutionContext, TokioRuntimeContext,
};
pub use cloudpool::http_client_pool::{
    get_or_create_client, ClientOptions, ClientRequest, HttpClientPool, PoolStats,
    DEFAULT_CLOSE_GRACE, DEFAULT_TIMEOUT,
};
pub use cloudpool::proxy_config::{ProxyConfig, ProxyKind, ProxyResolver};
