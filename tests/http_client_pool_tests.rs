mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use cloudpool::{
    ClientHandle, ClientRequest, ContextToken, HttpClientPool, ProxyKind, ProxyResolver,
};

fn isolated_pool() -> HttpClientPool {
    HttpClientPool::new()
        .with_resolver(ProxyResolver::disabled())
        .with_execution_context(Arc::new(|| None::<ContextToken>))
}

fn resolver_with(pairs: &[(&str, &str)]) -> ProxyResolver {
    let source: HashMap<String, String> = pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    ProxyResolver::new(Arc::new(source))
}

/// A pool whose execution context is whatever `token` currently holds (0 = none).
fn pool_with_switchable_context(token: Arc<AtomicU64>) -> HttpClientPool {
    HttpClientPool::new()
        .with_resolver(ProxyResolver::disabled())
        .with_execution_context(Arc::new(move || match token.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(ContextToken::new(raw)),
        }))
}

#[test]
fn test_same_key_returns_same_handle() {
    let pool = isolated_pool();
    let request = ClientRequest::new("llm").with_base_url("https://api.example.com/v1");

    let first = pool.get_client(&request).unwrap();
    let second = pool.get_client(&request).unwrap();

    assert_eq!(first, second);
    assert_eq!(first.id(), second.id());
    assert_eq!(pool.stats().created, 1);
}

#[test]
fn test_provider_is_cache_key_without_base_url() {
    let pool = isolated_pool();
    let handle = pool.get_client(&ClientRequest::new("baidu")).unwrap();

    assert!(pool.contains("baidu"));
    assert_eq!(handle.settings().base_url, None);
}

#[test]
fn test_context_change_invalidates_every_client() {
    let token = Arc::new(AtomicU64::new(1));
    let pool = pool_with_switchable_context(Arc::clone(&token));
    let llm = ClientRequest::new("llm").with_base_url("https://llm.example.com");
    let vlm = ClientRequest::new("vlm").with_base_url("https://vlm.example.com");

    let old_llm = pool.get_client(&llm).unwrap();
    pool.get_client(&vlm).unwrap();
    assert_eq!(pool.len(), 2);

    token.store(2, Ordering::SeqCst);
    let new_llm = pool.get_client(&llm).unwrap();

    assert_ne!(old_llm, new_llm);
    // The whole cache went, not only the requested key.
    assert_eq!(pool.len(), 1);
    assert!(!pool.contains("https://vlm.example.com"));
    // Discarded, not closed.
    assert!(!old_llm.is_closed());
    assert_eq!(pool.stats().invalidations, 1);
    assert_eq!(pool.get_client(&llm).unwrap(), new_llm);
}

#[test]
fn test_leaving_context_does_not_invalidate() {
    let token = Arc::new(AtomicU64::new(7));
    let pool = pool_with_switchable_context(Arc::clone(&token));
    let request = ClientRequest::new("svc");

    let inside = pool.get_client(&request).unwrap();
    token.store(0, Ordering::SeqCst);
    let outside = pool.get_client(&request).unwrap();
    token.store(7, Ordering::SeqCst);
    let back = pool.get_client(&request).unwrap();

    assert_eq!(inside, outside);
    assert_eq!(inside, back);
    assert_eq!(pool.stats().invalidations, 0);
}

#[test]
fn test_new_runtime_invalidates_default_pool() {
    let pool = Arc::new(HttpClientPool::new().with_resolver(ProxyResolver::disabled()));
    let request = ClientRequest::new("runtime-svc");

    let first_runtime = tokio::runtime::Runtime::new().unwrap();
    let first = first_runtime.block_on(async {
        let first = pool.get_client(&request).unwrap();
        assert_eq!(pool.get_client(&request).unwrap(), first);
        first
    });
    drop(first_runtime);

    let second_runtime = tokio::runtime::Runtime::new().unwrap();
    let second = second_runtime.block_on(async { pool.get_client(&request).unwrap() });

    assert_ne!(first, second);
    assert_eq!(pool.stats().invalidations, 1);
    assert_eq!(pool.stats().created, 2);
}

#[tokio::test]
async fn test_closed_handle_is_replaced() {
    let pool = isolated_pool();
    let request = ClientRequest::new("svc");

    let first = pool.get_client(&request).unwrap();
    first.close(Duration::from_millis(100)).await.unwrap();
    let second = pool.get_client(&request).unwrap();

    assert_ne!(first, second);
    assert!(!second.is_closed());
    assert!(second.id() > first.id());
    assert_eq!(pool.len(), 1);
}

#[test]
fn test_explicit_proxy_beats_configured_proxy() {
    common::init_capture_logger();
    let pool = HttpClientPool::new()
        .with_resolver(resolver_with(&[("SOCKS5_PROXY_URL", "http://b.proxy.test:8102")]))
        .with_execution_context(Arc::new(|| None::<ContextToken>));

    let handle = pool
        .get_client(&ClientRequest::new("svc").with_proxy("http://a.proxy.test:8101"))
        .unwrap();

    let proxy = handle.proxy().expect("explicit proxy applied");
    assert_eq!(proxy.url(), "http://a.proxy.test:8101");
    assert_eq!(proxy.kind(), ProxyKind::Http);
    let warnings = common::warnings_containing("http://b.proxy.test:8102");
    assert_eq!(warnings.len(), 1);
    assert!(warnings[0].contains("http://a.proxy.test:8101"));
}

#[test]
fn test_configured_proxy_used_without_explicit_one() {
    let pool = HttpClientPool::new()
        .with_resolver(resolver_with(&[
            ("PROXY_ENABLED", "true"),
            ("SOCKS5_PROXY_URL", "http://configured.proxy.test:8103"),
        ]))
        .with_execution_context(Arc::new(|| None::<ContextToken>));

    let handle = pool.get_client(&ClientRequest::new("svc")).unwrap();
    assert_eq!(
        handle.proxy().map(|proxy| proxy.url()),
        Some("http://configured.proxy.test:8103")
    );
}

#[test]
fn test_disabled_flag_means_direct_connection() {
    let pool = HttpClientPool::new()
        .with_resolver(resolver_with(&[
            ("PROXY_ENABLED", "false"),
            ("SOCKS5_PROXY_URL", "socks5://127.0.0.1:8104"),
        ]))
        .with_execution_context(Arc::new(|| None::<ContextToken>));

    let handle = pool.get_client(&ClientRequest::new("svc")).unwrap();
    assert_eq!(handle.proxy(), None);
}

#[tokio::test]
async fn test_socks_unavailable_falls_back_to_direct() {
    common::init_capture_logger();
    let server = common::spawn_http_server().await;
    let pool = isolated_pool().with_socks_support(false);

    let handle = pool
        .get_client(
            &ClientRequest::new("svc")
                .with_base_url(server.as_str())
                .with_proxy("socks5://127.0.0.1:8105"),
        )
        .unwrap();

    assert_eq!(handle.proxy(), None);
    assert!(!pool.socks_supported());
    assert_eq!(common::warnings_containing("socks5://127.0.0.1:8105").len(), 1);

    // Direct connection works.
    let response = handle.send(handle.get("/")).await.unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), "ok");
}

#[cfg(feature = "socks")]
#[test]
fn test_socks_proxy_is_applied_when_supported() {
    let pool = isolated_pool();
    let handle = pool
        .get_client(&ClientRequest::new("svc").with_proxy("socks5h://127.0.0.1:8106"))
        .unwrap();

    let proxy = handle.proxy().expect("socks proxy applied");
    assert!(proxy.is_socks());
    assert_eq!(proxy.url(), "socks5h://127.0.0.1:8106");
}

#[test]
fn test_unusable_proxy_degrades_to_direct() {
    common::init_capture_logger();
    let pool = isolated_pool();

    let handle = pool
        .get_client(&ClientRequest::new("svc").with_proxy("not a proxy 8107"))
        .unwrap();

    assert_eq!(handle.proxy(), None);
    assert_eq!(common::warnings_containing("not a proxy 8107").len(), 1);
}

#[tokio::test]
async fn test_loopback_request_ignores_system_proxy() {
    let server = common::spawn_http_server().await;
    let pool = isolated_pool();

    let handle = pool
        .get_client(&ClientRequest::new("local").with_base_url(server.as_str()))
        .unwrap();
    let response = handle.send(handle.get("/health")).await.unwrap();

    assert_eq!(response.status(), 200);
    assert_eq!(handle.proxy(), None);
}

#[tokio::test]
async fn test_close_all_drains_pool() {
    let pool = isolated_pool();
    let a = pool.get_client(&ClientRequest::new("a")).unwrap();
    let b = pool.get_client(&ClientRequest::new("b")).unwrap();

    pool.close_all().await;

    assert!(pool.is_empty());
    assert!(a.is_closed());
    assert!(b.is_closed());
    assert!(a.send(a.get("http://127.0.0.1:9/")).await.is_err());

    let fresh = pool.get_client(&ClientRequest::new("a")).unwrap();
    assert_ne!(fresh, a);
    assert!(!fresh.is_closed());
    assert_eq!(pool.stats().created, 3);
}

#[tokio::test]
async fn test_close_all_on_empty_pool() {
    let pool = isolated_pool();
    pool.close_all().await;
    pool.close_all().await;
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_close_all_swallows_close_failures() {
    let pool = isolated_pool();
    let handle = pool.get_client(&ClientRequest::new("svc")).unwrap();
    // Closed behind the pool's back, so the pool's own close fails.
    handle.close(Duration::from_millis(10)).await.unwrap();

    pool.close_all().await;
    assert!(pool.is_empty());
}

#[tokio::test]
async fn test_close_waits_for_in_flight_requests_up_to_grace() {
    let server = common::spawn_silent_server().await;
    let pool = Arc::new(isolated_pool().with_close_grace(Duration::from_millis(200)));
    let handle = pool
        .get_client(
            &ClientRequest::new("slow")
                .with_base_url(server.as_str())
                .with_timeout(Duration::from_secs(5)),
        )
        .unwrap();

    let in_flight = {
        let handle = handle.clone();
        tokio::spawn(async move { handle.send(handle.get("/")).await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    pool.close_all().await;
    assert!(started.elapsed() >= Duration::from_millis(150));
    assert!(handle.is_closed());

    in_flight.abort();
}

#[test]
fn test_concurrent_first_callers_share_one_client() {
    let pool = Arc::new(isolated_pool());
    let request = ClientRequest::new("svc").with_base_url("https://race.example.com");
    let callers = 16;
    let barrier = Arc::new(Barrier::new(callers));

    let handles: Vec<ClientHandle> = thread::scope(|scope| {
        let spawned: Vec<_> = (0..callers)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let barrier = Arc::clone(&barrier);
                let request = request.clone();
                scope.spawn(move || {
                    barrier.wait();
                    pool.get_client(&request).unwrap()
                })
            })
            .collect();
        spawned.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert!(handles.iter().all(|handle| *handle == handles[0]));
    assert_eq!(pool.stats().created, 1);
    assert_eq!(pool.len(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_tasks_share_one_client() {
    let pool = Arc::new(isolated_pool());
    let mut tasks = Vec::new();

    for _ in 0..32 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            pool.get_client(&ClientRequest::new("shared")).unwrap()
        }));
    }

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().id());
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(pool.stats().created, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_close_all_never_leaves_closed_clients_cached() {
    let pool = Arc::new(isolated_pool());
    let mut tasks = Vec::new();

    for worker in 0..4 {
        let pool = Arc::clone(&pool);
        tasks.push(tokio::spawn(async move {
            for i in 0..50 {
                let key = format!("svc-{}", (worker + i) % 5);
                pool.get_client(&ClientRequest::new(key)).unwrap();
                tokio::task::yield_now().await;
            }
        }));
    }
    pool.close_all().await;
    for task in tasks {
        task.await.unwrap();
    }

    for key in 0..5 {
        if let Some(handle) = pool.remove(&format!("svc-{}", key)) {
            assert!(!handle.is_closed());
        }
    }
}

#[test]
fn test_request_settings_are_bound_to_handle() {
    let pool = isolated_pool();
    let handle = pool
        .get_client(
            &ClientRequest::new("svc")
                .with_timeout(Duration::from_secs(15))
                .with_verify_ssl(false),
        )
        .unwrap();

    let settings = handle.settings();
    assert_eq!(settings.timeouts.connect, Duration::from_secs(10));
    assert_eq!(settings.timeouts.read, Duration::from_secs(15));
    assert_eq!(settings.timeouts.total, Duration::from_secs(15));
    assert!(!settings.verify_ssl);
    assert!(settings.follow_redirects);
    assert_eq!(settings.limits.max_connections, 20);
    assert_eq!(settings.limits.max_idle_connections, 10);
    assert_eq!(settings.limits.keepalive_expiry, Duration::from_secs(60));
}
