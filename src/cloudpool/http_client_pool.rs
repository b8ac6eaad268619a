//! HTTP client pool for maintaining persistent connections.
//!
//! [`HttpClientPool`] keeps one configured `reqwest::Client` per cache key,
//! so repeated calls to the same destination reuse TCP/TLS connections
//! instead of paying DNS and handshake costs every time. The cache key is the
//! target base URL when one is given, otherwise the provider identifier.
//!
//! Lifecycle of a pooled client:
//!
//! 1. **Created lazily** on the first [`get_client`](HttpClientPool::get_client) for its key.
//! 2. **Reused** while it stays open and the execution context is unchanged.
//! 3. **Discarded** when the pool observes a new [`ContextToken`]: every entry is
//!    dropped, since connections owned by a finished runtime are not reusable.
//! 4. **Closed** when superseded or when [`close_all`](HttpClientPool::close_all)
//!    drains the pool.
//!
//! Proxy selection happens once, at creation time. An explicit proxy on the
//! [`ClientRequest`] wins over the configured one (see [`ProxyResolver`]), and
//! the transport never picks up `HTTP_PROXY`/`HTTPS_PROXY` on its own, so
//! loopback calls are not routed through a proxy by accident.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use cloudpool::{ClientRequest, HttpClientPool};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = HttpClientPool::global();
//! let request = ClientRequest::new("openai")
//!     .with_base_url("https://api.openai.com/v1")
//!     .with_timeout(Duration::from_secs(30));
//!
//! let handle = pool.get_client(&request)?;
//! let response = handle.send(handle.get("/models")).await?;
//! println!("status: {}", response.status());
//!
//! pool.close_all().await;
//! # Ok(())
//! # }
//! ```

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures_util::future::join_all;
use once_cell::sync::Lazy;
use reqwest::header::HeaderMap;
use reqwest::redirect::Policy;

use crate::cloudpool::client_handle::{ClientHandle, ClientSettings, PoolLimits, Timeouts};
use crate::cloudpool::error::PoolError;
use crate::cloudpool::execution_context::{ContextToken, ExecutionContext, TokioRuntimeContext};
use crate::cloudpool::proxy_config::{ProxyConfig, ProxyKind, ProxyResolver};

/// Per-request timeout used when the caller does not pick one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
/// How long [`HttpClientPool::close_all`] waits for in-flight requests per client.
pub const DEFAULT_CLOSE_GRACE: Duration = Duration::from_secs(5);
const MAX_REDIRECTS: usize = 20;

/// Process-wide pool, created on first access.
static GLOBAL_POOL: Lazy<Arc<HttpClientPool>> = Lazy::new(|| Arc::new(HttpClientPool::new()));

/// Overrides for the transport defaults. `None` keeps the default.
#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    pub max_connections: Option<usize>,
    pub max_idle_connections: Option<usize>,
    pub keepalive_expiry: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    pub read_timeout: Option<Duration>,
    pub follow_redirects: Option<bool>,
    /// Allow HTTP/2 negotiation. Clients are HTTP/1.1 only by default.
    pub http2: Option<bool>,
    pub user_agent: Option<String>,
    pub default_headers: Option<HeaderMap>,
}

/// Arguments to [`HttpClientPool::get_client`].
#[derive(Debug, Clone)]
pub struct ClientRequest {
    /// Service identifier; the cache key when no base URL is set.
    pub provider: String,
    pub base_url: Option<String>,
    pub timeout: Duration,
    /// Explicit proxy URL, overriding the configured one.
    pub proxy: Option<String>,
    pub verify_ssl: bool,
    pub options: ClientOptions,
}

impl ClientRequest {
    pub fn new(provider: impl Into<String>) -> Self {
        ClientRequest {
            provider: provider.into(),
            base_url: None,
            timeout: DEFAULT_TIMEOUT,
            proxy: None,
            verify_ssl: true,
            options: ClientOptions::default(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        self.proxy = Some(proxy.into());
        self
    }

    pub fn with_verify_ssl(mut self, verify_ssl: bool) -> Self {
        self.verify_ssl = verify_ssl;
        self
    }

    pub fn with_options(mut self, options: ClientOptions) -> Self {
        self.options = options;
        self
    }

    /// The base URL if non-empty, otherwise the provider.
    pub fn cache_key(&self) -> &str {
        match self.base_url.as_deref() {
            Some(base_url) if !base_url.is_empty() => base_url,
            _ => &self.provider,
        }
    }

    fn settings(&self) -> ClientSettings {
        let options = &self.options;
        let defaults = PoolLimits::default();
        let mut timeouts = Timeouts::for_request(self.timeout);
        if let Some(connect) = options.connect_timeout {
            timeouts.connect = connect;
        }
        if let Some(read) = options.read_timeout {
            timeouts.read = read;
        }

        ClientSettings {
            base_url: self.base_url.clone().filter(|url| !url.is_empty()),
            proxy: None,
            limits: PoolLimits {
                max_connections: options.max_connections.unwrap_or(defaults.max_connections),
                max_idle_connections: options
                    .max_idle_connections
                    .unwrap_or(defaults.max_idle_connections),
                keepalive_expiry: options.keepalive_expiry.unwrap_or(defaults.keepalive_expiry),
            },
            timeouts,
            verify_ssl: self.verify_ssl,
            follow_redirects: options.follow_redirects.unwrap_or(true),
            http2: options.http2.unwrap_or(false),
            user_agent: options.user_agent.clone(),
        }
    }
}

/// Snapshot of pool counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    /// Clients currently cached.
    pub cached: usize,
    /// Clients built since the pool was created.
    pub created: u64,
    /// Times the cache was dropped because the execution context changed.
    pub invalidations: u64,
}

/// Cache of pooled clients keyed by destination.
///
/// Share it behind an `Arc`; every method takes `&self`.
pub struct HttpClientPool {
    clients: DashMap<String, ClientHandle>,
    /// Held shared by `get_client`, exclusively while `close_all` drains.
    gate: RwLock<()>,
    recorded_context: Mutex<Option<ContextToken>>,
    context: Arc<dyn ExecutionContext>,
    resolver: ProxyResolver,
    socks_supported: bool,
    close_grace: Duration,
    next_id: AtomicU64,
    created: AtomicU64,
    invalidations: AtomicU64,
}

impl Default for HttpClientPool {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpClientPool {
    /// An empty pool resolving proxies from the environment and tracking tokio runtimes.
    pub fn new() -> Self {
        HttpClientPool {
            clients: DashMap::new(),
            gate: RwLock::new(()),
            recorded_context: Mutex::new(None),
            context: Arc::new(TokioRuntimeContext),
            resolver: ProxyResolver::from_env(),
            socks_supported: cfg!(feature = "socks"),
            close_grace: DEFAULT_CLOSE_GRACE,
            next_id: AtomicU64::new(0),
            created: AtomicU64::new(0),
            invalidations: AtomicU64::new(0),
        }
    }

    /// The process-wide pool.
    pub fn global() -> Arc<HttpClientPool> {
        Arc::clone(&GLOBAL_POOL)
    }

    pub fn with_resolver(mut self, resolver: ProxyResolver) -> Self {
        self.resolver = resolver;
        self
    }

    pub fn with_execution_context(mut self, context: Arc<dyn ExecutionContext>) -> Self {
        self.context = context;
        self
    }

    /// Turns SOCKS transports off (or back on, when compiled with the `socks` feature).
    pub fn with_socks_support(mut self, supported: bool) -> Self {
        self.socks_supported = supported && cfg!(feature = "socks");
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn resolver(&self) -> &ProxyResolver {
        &self.resolver
    }

    pub fn socks_supported(&self) -> bool {
        self.socks_supported
    }

    /// Returns the cached client for `request`, building one if needed.
    ///
    /// The cached client is returned when it is still open and the execution
    /// context has not changed since the cache was populated. Otherwise a new
    /// client is built and cached. Lookup, build and insert happen under the
    /// key's entry lock, so concurrent callers for the same key share one client.
    pub fn get_client(&self, request: &ClientRequest) -> Result<ClientHandle, PoolError> {
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        let observed = self.check_context();
        self.lookup(request, observed)
    }

    /// Entry-locked lookup for a caller that observed context `observed`.
    ///
    /// A client built after another context took over is returned to its
    /// caller but not cached.
    fn lookup(
        &self,
        request: &ClientRequest,
        observed: Option<ContextToken>,
    ) -> Result<ClientHandle, PoolError> {
        let key = request.cache_key();
        match self.clients.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                if !entry.get().is_closed() {
                    log::debug!(
                        "cloudpool::http_client_pool: reusing client #{} for '{}'",
                        entry.get().id(),
                        key
                    );
                    return Ok(entry.get().clone());
                }
                let handle = self.build(key, request)?;
                if self.context_is_current(observed) {
                    entry.insert(handle.clone());
                }
                Ok(handle)
            }
            Entry::Vacant(entry) => {
                let handle = self.build(key, request)?;
                if self.context_is_current(observed) {
                    entry.insert(handle.clone());
                } else {
                    log::debug!(
                        "cloudpool::http_client_pool: execution context moved on while building client #{} for '{}', not caching it",
                        handle.id(),
                        key
                    );
                }
                Ok(handle)
            }
        }
    }

    /// Closes every cached client and empties the pool.
    ///
    /// The cache is drained in one step that `get_client` cannot interleave
    /// with; callers arriving afterwards build fresh clients. Each drained
    /// client gets up to the close grace period for in-flight requests, and
    /// close failures are ignored.
    pub async fn close_all(&self) {
        let drained: Vec<(String, ClientHandle)> = {
            let _gate = self.gate.write().unwrap_or_else(PoisonError::into_inner);
            let drained = self
                .clients
                .iter()
                .map(|entry| (entry.key().clone(), entry.value().clone()))
                .collect();
            self.clients.clear();
            drained
        };
        if drained.is_empty() {
            return;
        }

        let grace = self.close_grace;
        let results = join_all(drained.iter().map(|(_, handle)| handle.close(grace))).await;
        for ((key, _), result) in drained.iter().zip(results) {
            if let Err(err) = result {
                log::debug!(
                    "cloudpool::http_client_pool: ignoring close failure for '{}': {}",
                    key,
                    err
                );
            }
        }
        log::info!(
            "cloudpool::http_client_pool: closed {} pooled client(s)",
            drained.len()
        );
    }

    /// Evicts the client cached under `key` without closing it.
    pub fn remove(&self, key: &str) -> Option<ClientHandle> {
        let _gate = self.gate.read().unwrap_or_else(PoisonError::into_inner);
        self.clients.remove(key).map(|(_, handle)| handle)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.clients.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            cached: self.clients.len(),
            created: self.created.load(Ordering::SeqCst),
            invalidations: self.invalidations.load(Ordering::SeqCst),
        }
    }

    /// Drops the whole cache if the execution context changed, and returns
    /// the context observed.
    ///
    /// Outside any context nothing is invalidated. Dropped clients are not
    /// closed: their runtime is gone, so there is nothing left to drain. The
    /// new token is recorded before the cache is cleared, and no lock is held
    /// across the clear.
    fn check_context(&self) -> Option<ContextToken> {
        let current = self.context.current()?;
        let previous = self
            .recorded_context
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(current);

        if let Some(previous) = previous.filter(|previous| *previous != current) {
            let dropped = self.clients.len();
            self.clients.clear();
            self.invalidations.fetch_add(1, Ordering::SeqCst);
            log::info!(
                "cloudpool::http_client_pool: execution context changed ({} -> {}), discarded {} cached client(s)",
                previous.raw(),
                current.raw(),
                dropped
            );
        }
        Some(current)
    }

    /// Whether `observed` is still the recorded context. `None` always is.
    fn context_is_current(&self, observed: Option<ContextToken>) -> bool {
        match observed {
            None => true,
            Some(observed) => {
                *self
                    .recorded_context
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    == Some(observed)
            }
        }
    }

    fn build(&self, key: &str, request: &ClientRequest) -> Result<ClientHandle, PoolError> {
        let mut settings = request.settings();
        let proxy = self.effective_proxy(key, request.proxy.as_deref());
        let routed = self.route(key, proxy);

        let mut builder = transport_builder(&settings, &request.options);
        if let Some((_, proxy)) = &routed {
            builder = builder.proxy(proxy.clone());
        }
        let client = match builder.build() {
            Ok(client) => {
                settings.proxy = routed.map(|(config, _)| config);
                client
            }
            Err(err) => {
                let Some((config, _)) = routed else {
                    return Err(PoolError::Build {
                        key: key.to_string(),
                        source: err,
                    });
                };
                log::warn!(
                    "cloudpool::http_client_pool: failed to build client for '{}' through proxy {}: {}; connecting directly",
                    key,
                    config,
                    err
                );
                transport_builder(&settings, &request.options)
                    .build()
                    .map_err(|source| PoolError::Build {
                        key: key.to_string(),
                        source,
                    })?
            }
        };

        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.fetch_add(1, Ordering::SeqCst);
        match &settings.proxy {
            Some(proxy) => log::info!(
                "cloudpool::http_client_pool: created client #{} for '{}' via proxy {}",
                id,
                key,
                proxy
            ),
            None => log::info!(
                "cloudpool::http_client_pool: created client #{} for '{}'",
                id,
                key
            ),
        }
        Ok(ClientHandle::new(id, client, settings))
    }

    /// The explicit proxy if one was given, otherwise the configured one.
    fn effective_proxy(&self, key: &str, explicit: Option<&str>) -> Option<ProxyConfig> {
        let resolved = self.resolver.resolve();
        let explicit = explicit
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(ProxyConfig::new);

        match (explicit, resolved) {
            (Some(explicit), Some(resolved)) => {
                if explicit != resolved {
                    if explicit.kind() == ProxyKind::Http {
                        log::warn!(
                            "cloudpool::http_client_pool: explicit proxy {} for '{}' overrides configured proxy {}",
                            explicit,
                            key,
                            resolved
                        );
                    } else {
                        log::debug!(
                            "cloudpool::http_client_pool: explicit proxy {} for '{}' overrides configured proxy {}",
                            explicit,
                            key,
                            resolved
                        );
                    }
                }
                Some(explicit)
            }
            (Some(explicit), None) => Some(explicit),
            (None, resolved) => resolved,
        }
    }

    /// Turns the effective proxy into a transport proxy, or `None` to connect directly.
    fn route(&self, key: &str, proxy: Option<ProxyConfig>) -> Option<(ProxyConfig, reqwest::Proxy)> {
        let proxy = proxy?;
        if proxy.is_socks() && !self.socks_supported {
            log::warn!(
                "cloudpool::http_client_pool: SOCKS proxy {} requested for '{}' but SOCKS support is unavailable; connecting directly",
                proxy,
                key
            );
            return None;
        }
        match proxy.to_reqwest() {
            Ok(transport) => Some((proxy, transport)),
            Err(err) => {
                log::warn!(
                    "cloudpool::http_client_pool: invalid proxy {} for '{}': {}; connecting directly",
                    proxy,
                    key,
                    err
                );
                None
            }
        }
    }
}

/// A builder carrying `settings`, with system proxy detection switched off.
fn transport_builder(settings: &ClientSettings, options: &ClientOptions) -> reqwest::ClientBuilder {
    let redirect = if settings.follow_redirects {
        Policy::limited(MAX_REDIRECTS)
    } else {
        Policy::none()
    };
    let mut builder = reqwest::Client::builder()
        .no_proxy()
        .pool_max_idle_per_host(settings.limits.max_idle_connections)
        .pool_idle_timeout(settings.limits.keepalive_expiry)
        .connect_timeout(settings.timeouts.connect)
        .read_timeout(settings.timeouts.read)
        .timeout(settings.timeouts.total)
        .danger_accept_invalid_certs(!settings.verify_ssl)
        .redirect(redirect);
    if !settings.http2 {
        builder = builder.http1_only();
    }
    if let Some(user_agent) = &settings.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    if let Some(headers) = &options.default_headers {
        builder = builder.default_headers(headers.clone());
    }
    builder
}

/// Fetches (or creates) the global pool's client for `base_url`.
pub fn get_or_create_client(base_url: &str) -> Result<ClientHandle, PoolError> {
    GLOBAL_POOL.get_client(&ClientRequest::new(base_url).with_base_url(base_url))
}
