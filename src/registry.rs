//! Process-wide association of test contexts with running topologies.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;

use crate::error::Result;

/// Maps opaque per-context keys to their provisioned entry.
///
/// `compute_if_absent` is atomic and idempotent: concurrent calls for the
/// same key run the supplier at most once, the other callers await its
/// outcome. Suppliers for different keys never serialize on each other.
/// The registry owns its entries; callers get shared references.
pub struct Registry<V> {
    entries: Mutex<HashMap<String, Arc<OnceCell<Arc<V>>>>>,
}

impl<V> Registry<V> {
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the entry for `key`, running `supplier` to create it if
    /// absent. A failed supplier leaves the key vacant, so a later call may
    /// retry.
    pub async fn compute_if_absent<F, Fut>(&self, key: &str, supplier: F) -> Result<Arc<V>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<V>>>,
    {
        let cell = {
            let mut entries = self.entries.lock().unwrap();
            entries
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };
        let value = cell.get_or_try_init(supplier).await?;
        Ok(value.clone())
    }

    /// Looks up the entry for `key`; `None` for unknown keys.
    pub fn get(&self, key: &str) -> Option<Arc<V>> {
        self.entries
            .lock()
            .unwrap()
            .get(key)
            .and_then(|cell| cell.get().cloned())
    }

    /// Removes and returns the entry for `key`, if any. An entry whose
    /// supplier is still running stays in the map, so the finished value
    /// remains reachable for a later removal instead of leaking.
    pub fn remove(&self, key: &str) -> Option<Arc<V>> {
        let mut entries = self.entries.lock().unwrap();
        let value = entries.get(key).and_then(|cell| cell.get().cloned())?;
        entries.remove(key);
        Some(value)
    }
}

impl<V> Default for Registry<V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;
    use crate::error::Error;

    #[tokio::test]
    async fn concurrent_compute_if_absent_runs_supplier_once() {
        let registry = Arc::new(Registry::<u32>::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..50)
            .map(|_| {
                let registry = registry.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    registry
                        .compute_if_absent("context", || async move {
                            calls.fetch_add(1, Ordering::SeqCst);
                            tokio::time::sleep(Duration::from_millis(20)).await;
                            Ok(Arc::new(42))
                        })
                        .await
                        .unwrap()
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(*task.await.unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn separate_keys_get_separate_entries() {
        let registry = Registry::<String>::new();
        let a = registry
            .compute_if_absent("a", || async { Ok(Arc::new("a".to_string())) })
            .await
            .unwrap();
        let b = registry
            .compute_if_absent("b", || async { Ok(Arc::new("b".to_string())) })
            .await
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(registry.get("a"), Some(a));
        assert_eq!(registry.get("b"), Some(b));
    }

    #[tokio::test]
    async fn unknown_keys_yield_none() {
        let registry = Registry::<u32>::new();
        assert!(registry.get("missing").is_none());
        assert!(registry.remove("missing").is_none());
    }

    #[tokio::test]
    async fn failed_supplier_leaves_key_vacant() {
        let registry = Registry::<u32>::new();
        let result = registry
            .compute_if_absent("context", || async {
                Err(Error::Validation("boom".to_string()))
            })
            .await;
        assert!(result.is_err());
        assert!(registry.get("context").is_none());

        // A retry runs the supplier again.
        let value = registry
            .compute_if_absent("context", || async { Ok(Arc::new(7)) })
            .await
            .unwrap();
        assert_eq!(*value, 7);
    }

    #[tokio::test]
    async fn remove_during_initialization_keeps_the_entry() {
        let registry = Arc::new(Registry::<u32>::new());
        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

        let handle = {
            let registry = registry.clone();
            tokio::spawn(async move {
                registry
                    .compute_if_absent("context", || async move {
                        release_rx.await.unwrap();
                        Ok(Arc::new(9))
                    })
                    .await
                    .unwrap()
            })
        };
        // Let the supplier start and block on the channel.
        tokio::task::yield_now().await;

        // Removal while the supplier runs must not orphan the entry.
        assert!(registry.remove("context").is_none());

        release_tx.send(()).unwrap();
        assert_eq!(*handle.await.unwrap(), 9);
        assert_eq!(registry.remove("context").as_deref(), Some(&9));
    }

    #[tokio::test]
    async fn remove_yields_entry_exactly_once() {
        let registry = Registry::<u32>::new();
        registry
            .compute_if_absent("context", || async { Ok(Arc::new(1)) })
            .await
            .unwrap();
        assert!(registry.remove("context").is_some());
        assert!(registry.remove("context").is_none());
        assert!(registry.get("context").is_none());
    }
}
