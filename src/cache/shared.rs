//! Reference-counted owner of a cache handle.
//!
//! A [`SharedCacheHandle<T>`] ties one cache reference to a typed view of the
//! entry's value. Clones share that single reference; when the last clone is
//! dropped the handle goes back to the cache with [`Cache::release`]. While
//! any clone is alive the entry cannot be evicted, and the cache itself is
//! kept alive too.
//!
//! ```text
//!   SharedCacheHandle<T> ─┐
//!   SharedCacheHandle<T> ─┼─► Arc<Guard> ──► Handle ──► cache entry (pinned)
//!   SharedCacheHandle<T> ─┘         │
//!                                   └────► Arc<T>  (downcast of the value)
//! ```
//!
//! ## Example Usage
//!
//! ```
//! use std::sync::Arc;
//! use cache_entry_stats::cache::Cache;
//! use cache_entry_stats::cache::shared::SharedCacheHandle;
//! use cache_entry_stats::cache::sharded::ShardedCache;
//!
//! let cache: Arc<dyn Cache> = Arc::new(ShardedCache::new(16));
//! let handle = cache.insert(b"answer", Arc::new(42u64), 1, None).unwrap();
//!
//! let shared = SharedCacheHandle::<u64>::from_handle(Arc::clone(&cache), handle).unwrap();
//! assert_eq!(*shared, 42);
//!
//! let other = shared.clone();
//! drop(shared);
//! assert_eq!(*other, 42);
//! ```

use std::any::Any;
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use crate::cache::{Cache, Handle};

struct HandleGuard<T> {
    cache: Arc<dyn Cache>,
    handle: Option<Handle>,
    value: Arc<T>,
}

impl<T> Drop for HandleGuard<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.cache.release(handle);
        }
    }
}

/// Cloneable, typed owner of one cache reference.
pub struct SharedCacheHandle<T> {
    guard: Arc<HandleGuard<T>>,
}

impl<T> SharedCacheHandle<T>
where
    T: Any + Send + Sync,
{
    /// Takes ownership of `handle`'s reference.
    ///
    /// Returns `None`, after releasing the handle, if the entry's value is not
    /// a `T`.
    pub fn from_handle(cache: Arc<dyn Cache>, handle: Handle) -> Option<Self> {
        match Arc::clone(handle.value()).downcast::<T>() {
            Ok(value) => Some(Self {
                guard: Arc::new(HandleGuard {
                    cache,
                    handle: Some(handle),
                    value,
                }),
            }),
            Err(_) => {
                cache.release(handle);
                None
            },
        }
    }
}

impl<T> SharedCacheHandle<T> {
    /// The cache this handle pins an entry of.
    pub fn cache(&self) -> &Arc<dyn Cache> {
        &self.guard.cache
    }

    /// The shared value.
    pub fn value(&self) -> &Arc<T> {
        &self.guard.value
    }

    /// Returns `true` if both handles point at the same value.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.guard.value, &other.guard.value)
    }

    /// Number of live clones of this handle.
    pub fn owner_count(&self) -> usize {
        Arc::strong_count(&self.guard)
    }
}

impl<T> Clone for SharedCacheHandle<T> {
    fn clone(&self) -> Self {
        Self {
            guard: Arc::clone(&self.guard),
        }
    }
}

impl<T> Deref for SharedCacheHandle<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard.value
    }
}

impl<T: fmt::Debug> fmt::Debug for SharedCacheHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedCacheHandle")
            .field("value", &self.guard.value)
            .field("owners", &self.owner_count())
            .finish()
    }
}
