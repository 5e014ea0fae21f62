//! Per-key single-flight execution.

use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;

/// Deduplicates concurrent executions keyed by `K`.
///
/// The first caller for a key starts the work; callers arriving while it is
/// in flight await the same result. The entry is cleared once the shared
/// execution completes, so the next call starts fresh.
pub struct SingleFlight<K, T>
where
    T: Clone,
{
    inflight: Mutex<HashMap<K, Shared<BoxFuture<'static, T>>>>,
}

impl<K, T> Default for SingleFlight<K, T>
where
    T: Clone,
{
    fn default() -> Self {
        Self {
            inflight: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, T> SingleFlight<K, T>
where
    K: Eq + Hash + Clone,
    T: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `make()` for `key` unless an execution is already in flight, in
    /// which case wait for that one instead.
    pub async fn run<F, Fut>(&self, key: K, make: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T> + Send + 'static,
    {
        let shared = {
            let mut inflight = self.inflight.lock();
            match inflight.get(&key) {
                Some(existing) => existing.clone(),
                None => {
                    let fut = make().boxed().shared();
                    inflight.insert(key.clone(), fut.clone());
                    fut
                }
            }
        };

        let result = shared.clone().await;

        let mut inflight = self.inflight.lock();
        if inflight
            .get(&key)
            .is_some_and(|current| Shared::ptr_eq(current, &shared))
        {
            inflight.remove(&key);
        }
        result
    }

    /// Returns true if an execution for `key` is in flight.
    pub fn is_inflight(&self, key: &K) -> bool {
        self.inflight.lock().contains_key(key)
    }
}
