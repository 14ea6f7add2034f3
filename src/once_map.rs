use std::{
    collections::HashMap,
    future::Future,
    sync::{Arc, Mutex, PoisonError},
};

use tokio::sync::OnceCell;

/// String-keyed map whose values are built lazily, at most once per key.
///
/// Concurrent callers for the same key wait on the same construction. A
/// failed construction leaves the key empty so the next caller retries.
pub struct OnceMap<V> {
    cells: Mutex<HashMap<String, Arc<OnceCell<V>>>>,
}

impl<V: Clone> OnceMap<V> {
    pub fn new() -> Self {
        OnceMap {
            cells: Mutex::new(HashMap::new()),
        }
    }

    pub async fn get_or_try_init<F, Fut, E>(&self, key: &str, init: F) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        let cell = {
            let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
            cells.entry(key.to_string()).or_default().clone()
        };
        let result = cell.get_or_try_init(init).await.cloned();
        if result.is_err() {
            self.evict_empty(key, &cell);
        }
        result
    }

    /// Drop the key's cell if it is still `cell` and was never filled, so
    /// keys that only ever fail do not accumulate.
    fn evict_empty(&self, key: &str, cell: &Arc<OnceCell<V>>) {
        let mut cells = self.cells.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = cells.get(key) {
            if Arc::ptr_eq(current, cell) && !current.initialized() {
                cells.remove(key);
            }
        }
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.cells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

impl<V: Clone> Default for OnceMap<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::atomic::{AtomicUsize, Ordering},
        time::Duration,
    };

    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_callers_share_one_construction() {
        let map = Arc::new(OnceMap::<Arc<String>>::new());
        let builds = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let map = map.clone();
                let builds = builds.clone();
                tokio::spawn(async move {
                    map.get_or_try_init("us-west-2", || async {
                        builds.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Ok::<_, ()>(Arc::new("client".to_string()))
                    })
                    .await
                })
            })
            .collect();

        let values = futures::future::join_all(handles).await;
        assert_eq!(builds.load(Ordering::SeqCst), 1);
        assert!(values
            .into_iter()
            .all(|v| v.unwrap().unwrap().as_str() == "client"));
        assert_eq!(map.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_construction_is_retried() {
        let map = OnceMap::<u32>::new();

        let first = map
            .get_or_try_init("eu-west-1", || async { Err::<u32, _>("unreachable") })
            .await;
        assert_eq!(first, Err("unreachable"));
        assert_eq!(map.len(), 0);

        let second = map
            .get_or_try_init("eu-west-1", || async { Ok::<_, &str>(7) })
            .await;
        assert_eq!(second, Ok(7));
        assert_eq!(map.len(), 1);

        let third = map
            .get_or_try_init("eu-west-1", || async { Ok::<_, &str>(8) })
            .await;
        assert_eq!(third, Ok(7));
    }

    #[tokio::test]
    async fn test_keys_that_only_fail_are_not_kept() {
        let map = OnceMap::<u32>::new();
        for region in ["bogus-1", "bogus-2", "bogus-3"] {
            let result = map
                .get_or_try_init(region, || async { Err::<u32, _>("no such region") })
                .await;
            assert!(result.is_err());
        }
        assert_eq!(map.len(), 0);

        map.get_or_try_init("us-west-2", || async { Ok::<_, &str>(1) })
            .await
            .unwrap();
        assert_eq!(map.len(), 1);
    }
}
