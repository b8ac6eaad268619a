//! Pooled client handles.
//!
//! A [`ClientHandle`] is what [`HttpClientPool::get_client`](crate::HttpClientPool::get_client)
//! hands out: a cheap clone of a shared `reqwest::Client` together with the
//! [`ClientSettings`] it was built from. Handles compare equal only when they
//! point at the same pooled client.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;

use crate::cloudpool::error::PoolError;
use crate::cloudpool::proxy_config::ProxyConfig;

/// Connection limits applied to a pooled client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolLimits {
    /// Requests allowed in flight at once through one handle.
    pub max_connections: usize,
    /// Idle keep-alive connections retained per host.
    pub max_idle_connections: usize,
    /// How long an idle connection is kept before being dropped.
    pub keepalive_expiry: Duration,
}

impl Default for PoolLimits {
    fn default() -> Self {
        Self {
            max_connections: 20,
            max_idle_connections: 10,
            keepalive_expiry: Duration::from_secs(60),
        }
    }
}

/// Transport timeouts. reqwest has no separate write phase, uploads are
/// bounded by `total`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
    pub total: Duration,
}

impl Timeouts {
    pub const DEFAULT_CONNECT: Duration = Duration::from_secs(10);

    /// Connect timeout of 10s, `request` for everything else.
    pub fn for_request(request: Duration) -> Self {
        Self {
            connect: Self::DEFAULT_CONNECT,
            read: request,
            total: request,
        }
    }
}

/// Everything a handle was configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    pub base_url: Option<String>,
    /// The proxy actually applied to the transport; `None` means direct.
    pub proxy: Option<ProxyConfig>,
    pub limits: PoolLimits,
    pub timeouts: Timeouts,
    pub verify_ssl: bool,
    pub follow_redirects: bool,
    pub http2: bool,
    pub user_agent: Option<String>,
}

struct HandleInner {
    id: u64,
    client: reqwest::Client,
    settings: ClientSettings,
    permits: Semaphore,
    closed: AtomicBool,
}

/// Shared, reusable client owned by an [`HttpClientPool`](crate::HttpClientPool).
#[derive(Clone)]
pub struct ClientHandle {
    inner: Arc<HandleInner>,
}

impl ClientHandle {
    pub(crate) fn new(id: u64, client: reqwest::Client, settings: ClientSettings) -> Self {
        let permits = Semaphore::new(permit_count(&settings.limits));
        ClientHandle {
            inner: Arc::new(HandleInner {
                id,
                client,
                settings,
                permits,
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Pool-unique identifier, increasing with creation order.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// The underlying reqwest client. Requests sent directly through it bypass
    /// the handle's connection limit.
    pub fn client(&self) -> &reqwest::Client {
        &self.inner.client
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.inner.settings
    }

    pub fn proxy(&self) -> Option<&ProxyConfig> {
        self.inner.settings.proxy.as_ref()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Resolves `path` against the handle's base URL. Absolute URLs pass through.
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with("http://") || path.starts_with("https://") {
            return path.to_string();
        }
        match &self.inner.settings.base_url {
            Some(base) if path.is_empty() => base.clone(),
            Some(base) => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                path.trim_start_matches('/')
            ),
            None => path.to_string(),
        }
    }

    pub fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        self.inner.client.request(method, self.url_for(path))
    }

    pub fn get(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::GET, path)
    }

    pub fn post(&self, path: &str) -> reqwest::RequestBuilder {
        self.request(reqwest::Method::POST, path)
    }

    /// Builds and executes `request`. See [`ClientHandle::execute`].
    pub async fn send(&self, request: reqwest::RequestBuilder) -> Result<reqwest::Response, PoolError> {
        let request = request.build()?;
        self.execute(request).await
    }

    /// Executes `request` while holding one of the handle's connection permits.
    ///
    /// The permit is held until the response head arrives; body streaming is
    /// not counted. Fails with [`PoolError::Closed`] once the handle is closed.
    pub async fn execute(&self, request: reqwest::Request) -> Result<reqwest::Response, PoolError> {
        if self.is_closed() {
            return Err(PoolError::Closed { id: self.inner.id });
        }
        let _permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| PoolError::Closed { id: self.inner.id })?;
        Ok(self.inner.client.execute(request).await?)
    }

    /// Closes the handle, waiting up to `grace` for in-flight requests.
    ///
    /// New requests are rejected as soon as this is called. Closing twice
    /// reports [`PoolError::Closed`]; running out of grace reports
    /// [`PoolError::CloseTimeout`], though the handle is closed either way.
    pub async fn close(&self, grace: Duration) -> Result<(), PoolError> {
        let id = self.inner.id;
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Err(PoolError::Closed { id });
        }

        let all = u32::try_from(permit_count(&self.inner.settings.limits)).unwrap_or(u32::MAX);
        let drained = tokio::time::timeout(grace, self.inner.permits.acquire_many(all)).await;
        self.inner.permits.close();

        match drained {
            Ok(_) => Ok(()),
            Err(_) => Err(PoolError::CloseTimeout {
                id,
                grace_ms: grace.as_millis(),
            }),
        }
    }
}

fn permit_count(limits: &PoolLimits) -> usize {
    limits.max_connections.clamp(1, Semaphore::MAX_PERMITS)
}

impl PartialEq for ClientHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for ClientHandle {}

impl fmt::Debug for ClientHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientHandle")
            .field("id", &self.inner.id)
            .field("settings", &self.inner.settings)
            .field("closed", &self.is_closed())
            .finish()
    }
}
