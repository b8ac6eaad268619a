//! Execution-context identity.
//!
//! A reqwest client spawns its connection tasks onto whichever runtime first
//! drives it, so a client cached under one runtime is not safe to reuse once
//! that runtime is gone. The pool asks an [`ExecutionContext`] for the current
//! [`ContextToken`] before every lookup and drops its cache when the token
//! changes.
//!
//! Tokens are opaque and compared by value. `None` means "not inside any
//! execution context", which the pool treats as "unchanged".

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};

/// Opaque identity of an execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ContextToken(u64);

impl ContextToken {
    pub const fn new(raw: u64) -> Self {
        ContextToken(raw)
    }

    pub const fn raw(self) -> u64 {
        self.0
    }
}

/// Supplies the token of the context the caller is currently running in.
pub trait ExecutionContext: Send + Sync {
    fn current(&self) -> Option<ContextToken>;
}

impl<F> ExecutionContext for F
where
    F: Fn() -> Option<ContextToken> + Send + Sync,
{
    fn current(&self) -> Option<ContextToken> {
        self()
    }
}

static RUNTIME_EPOCH: AtomicU64 = AtomicU64::new(0);

/// Starts a new runtime epoch and returns its number.
///
/// Runtime changes are detected on their own. This forces every pool using
/// [`TokioRuntimeContext`] to drop its clients anyway, e.g. after the host
/// swapped its TLS roots or network namespace under a long-lived runtime.
pub fn advance_runtime_epoch() -> u64 {
    RUNTIME_EPOCH.fetch_add(1, Ordering::SeqCst) + 1
}

/// The default provider: `None` outside a tokio runtime, otherwise a token
/// derived from the current runtime's [`Id`](tokio::runtime::Id) and the
/// runtime epoch.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioRuntimeContext;

impl ExecutionContext for TokioRuntimeContext {
    fn current(&self) -> Option<ContextToken> {
        let handle = tokio::runtime::Handle::try_current().ok()?;
        Some(runtime_token(handle.id(), RUNTIME_EPOCH.load(Ordering::SeqCst)))
    }
}

fn runtime_token(id: tokio::runtime::Id, epoch: u64) -> ContextToken {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    epoch.hash(&mut hasher);
    ContextToken(hasher.finish())
}
