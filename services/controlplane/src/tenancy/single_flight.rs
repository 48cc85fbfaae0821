use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use tokio::sync::OnceCell;

/// Collapses concurrent calls for the same key into one execution.
///
/// Callers that arrive while a call is in flight wait for it and receive a
/// clone of its value. Once the call finishes the key is forgotten, so a
/// later call runs again; callers are expected to consult their own cache
/// inside `init` first. A failed call is not shared: the next waiter runs its
/// own `init`.
pub struct SingleFlight<K, V> {
    calls: Mutex<HashMap<K, Arc<OnceCell<V>>>>,
}

impl<K, V> Default for SingleFlight<K, V> {
    fn default() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
        }
    }
}

impl<K, V> SingleFlight<K, V>
where
    K: Eq + Hash + Clone,
    V: Clone,
{
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn run<F, Fut, E>(&self, key: K, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = self.calls.lock().entry(key.clone()).or_default().clone();
        let result = cell.get_or_try_init(init).await.cloned();

        let mut calls = self.calls.lock();
        if let Some(current) = calls.get(&key)
            && Arc::ptr_eq(current, &cell)
        {
            calls.remove(&key);
        }
        result
    }

    /// Keys with a call in flight.
    pub fn in_flight(&self) -> usize {
        self.calls.lock().len()
    }
}
