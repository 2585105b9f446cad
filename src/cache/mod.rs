//! The cache abstraction statistics are collected over.
//!
//! [`Cache`] is an object-safe, thread-safe key/value store with explicit
//! reference-counted handles, per-entry cleanup functions, and a bulk
//! "visit every resident entry" operation. The collector only ever talks to
//! `dyn Cache`, so any backend implementing the trait can host collectors;
//! [`ShardedCache`](sharded::ShardedCache) is the implementation shipped with
//! the crate.
//!
//! ## Entry lifecycle
//!
//! ```text
//!   insert ──► resident + referenced ──release──► resident, unreferenced
//!                   │                                   │
//!                 erase / replace                  evict / erase
//!                   ▼                                   ▼
//!           detached + referenced ──last release──► freed (deleter runs once)
//! ```
//!
//! An entry is freed when it is both out of the cache and unreferenced,
//! whichever happens last. Its [`Deleter`] runs exactly once at that point,
//! outside any cache lock.
//!
//! ## Handles
//!
//! [`Handle`] is a counted reference returned by `lookup` and `insert`. It
//! keeps the entry from being evicted and must be passed back to
//! [`Cache::release`]; dropping a raw handle leaks its reference. Wrap it in a
//! [`SharedCacheHandle`](shared::SharedCacheHandle) to get release-on-drop.

pub mod sharded;
pub mod shared;

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize};

use crate::error::CacheError;

/// Type-erased cached value.
pub type CacheValue = Arc<dyn Any + Send + Sync>;

/// Cleanup function run once when an entry is freed.
///
/// Receives the entry key and a clone of its value. Function pointer
/// addresses are not unique across crates, so a deleter is not an identity
/// tag for the value's type.
pub type Deleter = fn(key: &[u8], value: CacheValue);

/// One cache entry, shared between the cache and outstanding handles.
pub struct CacheEntry {
    key: Box<[u8]>,
    value: CacheValue,
    charge: usize,
    deleter: Option<Deleter>,
    // Bookkeeping owned by the cache implementation; only mutated while the
    // owning shard is locked.
    pub(crate) refs: AtomicUsize,
    pub(crate) resident: AtomicBool,
    pub(crate) seq: u64,
}

impl CacheEntry {
    /// Creates an entry that is resident and has no outstanding references.
    pub fn new(key: &[u8], value: CacheValue, charge: usize, deleter: Option<Deleter>) -> Self {
        Self::with_seq(key, value, charge, deleter, 0)
    }

    pub(crate) fn with_seq(
        key: &[u8],
        value: CacheValue,
        charge: usize,
        deleter: Option<Deleter>,
        seq: u64,
    ) -> Self {
        Self {
            key: key.into(),
            value,
            charge,
            deleter,
            refs: AtomicUsize::new(0),
            resident: AtomicBool::new(true),
            seq,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &CacheValue {
        &self.value
    }

    pub fn charge(&self) -> usize {
        self.charge
    }

    pub fn deleter(&self) -> Option<Deleter> {
        self.deleter
    }

    /// Runs the deleter, if any. Callers guarantee this happens once.
    pub(crate) fn run_deleter(&self) {
        if let Some(deleter) = self.deleter {
            deleter(&self.key, Arc::clone(&self.value));
        }
    }
}

impl fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("charge", &self.charge)
            .field("has_deleter", &self.deleter.is_some())
            .finish_non_exhaustive()
    }
}

/// Counted reference to a cache entry.
///
/// Not `Clone`: every handle corresponds to exactly one reference, which must
/// be returned with [`Cache::release`].
#[must_use = "a handle holds a cache reference that must be released"]
#[derive(Debug)]
pub struct Handle {
    entry: Arc<CacheEntry>,
}

impl Handle {
    /// Wraps an entry whose reference count the caller already incremented.
    pub fn new(entry: Arc<CacheEntry>) -> Self {
        Self { entry }
    }

    pub fn key(&self) -> &[u8] {
        self.entry.key()
    }

    pub fn value(&self) -> &CacheValue {
        self.entry.value()
    }

    pub fn charge(&self) -> usize {
        self.entry.charge()
    }

    pub fn entry(&self) -> &Arc<CacheEntry> {
        &self.entry
    }

    pub(crate) fn into_entry(self) -> Arc<CacheEntry> {
        self.entry
    }
}

/// Borrowed view of one resident entry, passed to
/// [`Cache::apply_to_all_entries`] callbacks.
#[derive(Clone, Copy)]
pub struct EntryRef<'a> {
    pub key: &'a [u8],
    pub value: &'a (dyn Any + Send + Sync),
    pub charge: usize,
    pub deleter: Option<Deleter>,
}

impl<'a> EntryRef<'a> {
    pub(crate) fn from_entry(entry: &'a CacheEntry) -> Self {
        Self {
            key: entry.key(),
            value: &**entry.value(),
            charge: entry.charge(),
            deleter: entry.deleter(),
        }
    }
}

impl fmt::Debug for EntryRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("key", &self.key)
            .field("charge", &self.charge)
            .field("has_deleter", &self.deleter.is_some())
            .finish_non_exhaustive()
    }
}

/// Options for [`Cache::apply_to_all_entries`].
#[derive(Debug, Clone, Default)]
#[non_exhaustive]
pub struct ApplyToAllEntriesOptions {}

/// Thread-safe cache with handle-based references.
pub trait Cache: Send + Sync {
    /// Looks up `key`, returning a referenced handle if resident.
    fn lookup(&self, key: &[u8]) -> Option<Handle>;

    /// Inserts `value` under `key`, replacing any previous entry, and returns a
    /// referenced handle to the new entry.
    ///
    /// # Errors
    ///
    /// Fails if the cache is closed or the entry cannot fit under a strict
    /// capacity limit. The value is dropped without running `deleter`.
    fn insert(
        &self,
        key: &[u8],
        value: CacheValue,
        charge: usize,
        deleter: Option<Deleter>,
    ) -> Result<Handle, CacheError>;

    /// Returns one reference. Returns `true` if this freed the entry.
    fn release(&self, handle: Handle) -> bool;

    /// Removes `key` from the cache. The entry is freed once unreferenced.
    fn erase(&self, key: &[u8]);

    /// Returns the deleter the entry was inserted with.
    fn get_deleter(&self, handle: &Handle) -> Option<Deleter> {
        handle.entry().deleter()
    }

    /// Invokes `callback` once per resident entry.
    ///
    /// Best effort: entries inserted or removed concurrently may or may not be
    /// visited. The callback must not hold on to the borrowed entry.
    fn apply_to_all_entries(
        &self,
        callback: &mut dyn FnMut(&EntryRef<'_>),
        options: &ApplyToAllEntriesOptions,
    );

    /// Total charge the cache may hold.
    fn capacity(&self) -> usize;

    /// Charge of resident entries.
    fn usage(&self) -> usize;

    /// Number of resident entries.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
