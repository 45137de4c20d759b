//! Component B: per-key serialiser. Guarantees at most one in-process
//! task runs for a given key at a time, FIFO among local contenders,
//! without retaining one mutex per key ever seen.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, Weak};

use tokio::sync::Mutex as AsyncMutex;

use crate::error::{Error, Result};

/// A cache of per-key mutual-exclusion primitives, reclaimed once no
/// pending work references them. Backed by `Weak` so entries never
/// outlive their last waiter, satisfying §9's "avoid a naive unbounded
/// mapping" requirement.
#[derive(Default)]
pub struct Bulkhead {
    locks: StdMutex<HashMap<String, Weak<AsyncMutex<()>>>>,
}

impl Bulkhead {
    pub fn new() -> Self {
        Bulkhead {
            locks: StdMutex::new(HashMap::new()),
        }
    }

    fn lock_for(&self, key: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("bulkhead map poisoned");
        if let Some(existing) = locks.get(key).and_then(Weak::upgrade) {
            return existing;
        }
        // Only a fresh key pays for the prune: an already-live key is the
        // hot path and must not pay an O(n) scan on every call.
        locks.retain(|_, weak| weak.strong_count() > 0);
        let fresh = Arc::new(AsyncMutex::new(()));
        locks.insert(key.to_string(), Arc::downgrade(&fresh));
        fresh
    }

    /// Runs `fn` with exclusive access to `key`, releasing the primitive
    /// on every exit path (success, failure, cancellation). `ct` is
    /// observed up front: an already-cancelled token short-circuits
    /// before any lock is taken (§8 property 6).
    pub async fn run<F, Fut, T>(&self, key: &str, ct: &tokio_util::sync::CancellationToken, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if ct.is_cancelled() {
            return Err(Error::Cancelled);
        }
        let primitive = self.lock_for(key);
        tokio::select! {
            guard = primitive.lock() => {
                let result = f().await;
                drop(guard);
                result
            }
            _ = ct.cancelled() => Err(Error::Cancelled),
        }
    }

    #[cfg(test)]
    pub fn live_key_count(&self) -> usize {
        self.locks.lock().unwrap().len()
    }
}
