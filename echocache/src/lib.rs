//! Keyed caching with request coalescing.
//!
//! A [`CacheMap`] stores values fetched by async functions on the tokio runtime. Concurrent
//! requests for a key which is not cached yet are coalesced: the first caller runs the fetch,
//! everyone else arriving while it is in flight waits on the same fetch and receives the same
//! outcome. Successful values are cached, errors are handed to all waiters and then forgotten.

use std::{
    fmt,
    future::Future,
    hash::Hash,
    pin::Pin,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    task::{Context, Poll},
};

use dashmap::{mapref::entry::Entry, DashMap};
use futures::future::{FutureExt, Shared, WeakShared};

/// A boxed, sendable future.
pub type BoxFut<'f, O> = Pin<Box<dyn Future<Output = O> + Send + 'f>>;

type Fetch<V, E> = BoxFut<'static, Result<Arc<V>, E>>;

enum Slot<V, E> {
    Cached(Arc<V>),
    Inflight {
        id: u64,
        fetch: WeakShared<Fetch<V, E>>,
    },
}

impl<V, E> fmt::Debug for Slot<V, E>
where
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Slot::Cached(value) => f.debug_tuple("Cached").field(value).finish(),
            Slot::Inflight { id, .. } => f.debug_struct("Inflight").field("id", id).finish(),
        }
    }
}

/// How a [`Handle`] came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lookup {
    /// The value was already cached.
    Cached,

    /// Another caller is fetching this key, and this handle waits for its outcome.
    Joined,

    /// This handle started the fetch.
    Owner,
}

/// A pending (or ready) outcome for a single key.
///
/// Dropping a handle withdraws from the fetch. The fetch keeps running for as long as at least
/// one handle is still waiting on it, and is dropped with the last one.
pub struct Handle<V, E> {
    lookup: Lookup,
    fut: Fetch<V, E>,
}

impl<V, E> fmt::Debug for Handle<V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Handle")
            .field("lookup", &self.lookup)
            .finish()
    }
}

impl<V, E> Handle<V, E>
where
    V: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn ready(value: Arc<V>) -> Self {
        Self {
            lookup: Lookup::Cached,
            fut: Box::pin(std::future::ready(Ok(value))),
        }
    }

    fn shared(lookup: Lookup, fetch: Shared<Fetch<V, E>>) -> Self {
        Self {
            lookup,
            fut: Box::pin(fetch),
        }
    }

    /// Whether this handle was served from cache, joined a fetch, or started one.
    pub fn lookup(&self) -> Lookup {
        self.lookup
    }
}

impl<V, E> Future for Handle<V, E> {
    type Output = Result<Arc<V>, E>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.fut.poll_unpin(cx)
    }
}

/// Clears the record of a fetch which was dropped before it finished.
struct Abandoned<K, V, E>
where
    K: Eq + Hash,
{
    slots: Arc<DashMap<K, Slot<V, E>>>,
    key: Option<K>,
    id: u64,
}

impl<K, V, E> Drop for Abandoned<K, V, E>
where
    K: Eq + Hash,
{
    fn drop(&mut self) {
        if let Some(key) = self.key.take() {
            tracing::trace!("Removing abandoned request");
            let id = self.id;
            self.slots.remove_if(&key, |_, slot| {
                matches!(slot, Slot::Inflight { id: current, .. } if *current == id)
            });
        }
    }
}

/// A concurrent map of cached values, with at most one fetch in flight per key.
///
/// The map is sharded, so operations on unrelated keys do not contend with each other.
/// Cloning a `CacheMap` is cheap and yields a handle to the same underlying cache.
pub struct CacheMap<K, V, E> {
    slots: Arc<DashMap<K, Slot<V, E>>>,
    ids: Arc<AtomicU64>,
}

impl<K, V, E> fmt::Debug for CacheMap<K, V, E>
where
    K: Eq + Hash + fmt::Debug,
    V: fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheMap")
            .field("slots", &self.slots)
            .finish()
    }
}

impl<K, V, E> Clone for CacheMap<K, V, E> {
    fn clone(&self) -> Self {
        Self {
            slots: Arc::clone(&self.slots),
            ids: Arc::clone(&self.ids),
        }
    }
}

impl<K, V, E> Default for CacheMap<K, V, E>
where
    K: Eq + Hash,
{
    fn default() -> Self {
        Self {
            slots: Arc::new(DashMap::new()),
            ids: Arc::new(AtomicU64::new(0)),
        }
    }
}

impl<K, V, E> CacheMap<K, V, E>
where
    K: Eq + Hash + Clone + Send + Sync + 'static,
    V: Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Create an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached value for `key`, without waiting on any fetch in flight.
    pub fn get(&self, key: &K) -> Option<Arc<V>> {
        self.slots.get(key).and_then(|slot| match slot.value() {
            Slot::Cached(value) => Some(Arc::clone(value)),
            Slot::Inflight { .. } => None,
        })
    }

    /// Replace the cached value for `key`.
    pub fn insert(&self, key: K, value: V) -> Arc<V> {
        let value = Arc::new(value);
        self.slots.insert(key, Slot::Cached(Arc::clone(&value)));
        value
    }

    /// Remove the cached value for `key`.
    ///
    /// A fetch in flight for `key` is left alone.
    pub fn remove(&self, key: &K) -> Option<Arc<V>> {
        self.slots
            .remove_if(key, |_, slot| matches!(slot, Slot::Cached(_)))
            .and_then(|(_, slot)| match slot {
                Slot::Cached(value) => Some(value),
                Slot::Inflight { .. } => None,
            })
    }

    /// Remove every cached value. Fetches in flight are left alone.
    pub fn clear(&self) {
        self.slots.retain(|_, slot| matches!(slot, Slot::Inflight { .. }));
    }

    /// Number of cached values.
    pub fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Cached(_)))
            .count()
    }

    /// Whether no values are cached.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of fetch records currently installed.
    pub fn inflight(&self) -> usize {
        self.slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Inflight { .. }))
            .count()
    }

    /// Get a handle to the value for `key`, fetching it with `fetch` if required.
    ///
    /// `fetch` is only called when this caller becomes the owner of a new fetch. It is called
    /// while the key's shard is locked, so it must only construct the future and must not
    /// touch this cache.
    pub fn handle<F, Fut>(&self, key: K, fetch: F) -> Handle<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        match self.slots.entry(key.clone()) {
            Entry::Occupied(mut entry) => {
                let joined = match entry.get() {
                    Slot::Cached(value) => return Handle::ready(Arc::clone(value)),
                    Slot::Inflight { fetch: weak, .. } => weak.upgrade(),
                };

                if let Some(shared) = joined {
                    tracing::trace!("Found inflight request");
                    return Handle::shared(Lookup::Joined, shared);
                }

                tracing::trace!("Replacing abandoned request");
                let (id, shared) = self.launch(key, fetch);
                if let Some(weak) = shared.downgrade() {
                    entry.insert(Slot::Inflight { id, fetch: weak });
                }
                Handle::shared(Lookup::Owner, shared)
            }
            Entry::Vacant(entry) => {
                tracing::trace!("Launching new request");
                let (id, shared) = self.launch(key, fetch);
                if let Some(weak) = shared.downgrade() {
                    entry.insert(Slot::Inflight { id, fetch: weak });
                }
                Handle::shared(Lookup::Owner, shared)
            }
        }
    }

    /// Get the value for `key`, fetching it with `fetch` if required.
    pub async fn get_or_fetch<F, Fut>(&self, key: K, fetch: F) -> Result<Arc<V>, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        self.handle(key, fetch).await
    }

    fn launch<F, Fut>(&self, key: K, fetch: F) -> (u64, Shared<Fetch<V, E>>)
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>> + Send + 'static,
    {
        let id = self.ids.fetch_add(1, Ordering::Relaxed);
        let slots = Arc::clone(&self.slots);
        let fut = fetch();
        let guard = Abandoned {
            slots: Arc::clone(&slots),
            key: Some(key),
            id,
        };

        let task: Fetch<V, E> = Box::pin(async move {
            let mut guard = guard;
            let result = fut.await.map(Arc::new);
            let Some(key) = guard.key.take() else {
                return result;
            };

            // The slot is settled before any waiter sees the outcome, so a caller arriving
            // after completion finds either the cached value or an empty slot.
            match &result {
                Ok(value) => {
                    slots.insert(key, Slot::Cached(Arc::clone(value)));
                }
                Err(_) => {
                    slots.remove_if(&key, |_, slot| {
                        matches!(slot, Slot::Inflight { id: current, .. } if *current == id)
                    });
                }
            }
            result
        });

        (id, task.shared())
    }
}
