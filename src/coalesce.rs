use rocket::tokio::sync::{watch, Mutex};
use std::collections::HashMap;
use std::future::Future;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

enum Slot<V> {
    Ready(Arc<V>),
    Pending {
        fetch_id: u64,
        rx: watch::Receiver<Option<Arc<V>>>,
    },
}

/// Keyed fetch-once cache. A lookup for a key either returns the cached
/// value, joins the fetch already in flight for that key, or becomes the
/// single fetcher every concurrent caller waits on. `invalidate` drops a
/// key; a fetch that settles after its key was invalidated still hands its
/// value to the callers that joined it but does not re-populate the cache.
pub struct CoalescingCache<K, V> {
    slots: Mutex<HashMap<K, Slot<V>>>,
    next_fetch_id: AtomicU64,
}

impl<K: Eq + Hash + Clone, V> Default for CoalescingCache<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: Eq + Hash + Clone, V> CoalescingCache<K, V> {
    pub fn new() -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            next_fetch_id: AtomicU64::new(0),
        }
    }

    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Arc<V>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = V>,
    {
        loop {
            let rx = {
                let mut slots = self.slots.lock().await;
                match slots.get(&key) {
                    Some(Slot::Ready(value)) => return value.clone(),
                    Some(Slot::Pending { rx, .. }) => rx.clone(),
                    None => {
                        let fetch_id = self.next_fetch_id.fetch_add(1, Ordering::Relaxed);
                        let (tx, rx) = watch::channel(None);
                        slots.insert(key.clone(), Slot::Pending { fetch_id, rx });
                        drop(slots);

                        let value = Arc::new(fetch().await);

                        let mut slots = self.slots.lock().await;
                        // only our own marker may be replaced: an invalidation
                        // while the fetch ran must win over the fetched value
                        let still_ours = matches!(
                            slots.get(&key),
                            Some(Slot::Pending { fetch_id: id, .. }) if *id == fetch_id
                        );
                        if still_ours {
                            slots.insert(key.clone(), Slot::Ready(value.clone()));
                        }
                        drop(slots);
                        let _ = tx.send(Some(value.clone()));
                        return value;
                    }
                }
            };

            if let Some(value) = Self::join_pending(rx).await {
                return value;
            }
            // the fetcher went away without delivering; clear its dead marker
            // and start over
            let mut slots = self.slots.lock().await;
            let marker_dead = matches!(
                slots.get(&key),
                Some(Slot::Pending { rx, .. }) if rx.has_changed().is_err()
            );
            if marker_dead {
                slots.remove(&key);
            }
        }
    }

    async fn join_pending(mut rx: watch::Receiver<Option<Arc<V>>>) -> Option<Arc<V>> {
        loop {
            let current = rx.borrow_and_update().clone();
            if current.is_some() {
                return current;
            }
            if rx.changed().await.is_err() {
                return None;
            }
        }
    }

    pub async fn invalidate(&self, key: &K) {
        self.slots.lock().await.remove(key);
    }
}
