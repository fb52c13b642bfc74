//! Per-resource driver object cache
//!
//! Every logical resource (program, kernel, buffer) keeps one small table
//! mapping an owning key to the driver object created for it. Programs and
//! buffers are keyed by context, kernels by compiled program.
//!
//! An entry, once created for a key, is returned by every later lookup for
//! that key. It is only released by forgetting its key or by clearing (or
//! dropping) the whole table.

use crate::driver::Driver;
use crate::error::{ComputeError, Result};
use crate::handle::DriverObject;
use std::fmt;
use std::sync::Arc;
use tracing::{trace, warn};

/// A driver object released when dropped
pub struct Owned<H>
where
    H: Into<DriverObject> + Copy,
{
    handle: H,
    driver: Arc<dyn Driver>,
}

impl<H> Owned<H>
where
    H: Into<DriverObject> + Copy,
{
    pub fn new(handle: H, driver: Arc<dyn Driver>) -> Self {
        Self { handle, driver }
    }

    pub fn handle(&self) -> H {
        self.handle
    }
}

impl<H> Drop for Owned<H>
where
    H: Into<DriverObject> + Copy,
{
    fn drop(&mut self) {
        let object = self.handle.into();
        if let Err(e) = self.driver.release(object) {
            warn!("Failed to release {:?}: {}", object, e);
        }
    }
}

impl<H> fmt::Debug for Owned<H>
where
    H: Into<DriverObject> + Copy + fmt::Debug,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Owned").field(&self.handle).finish()
    }
}

/// Bounded key -> object table
pub struct ResourceCache<K, V> {
    entries: Vec<(K, V)>,
    capacity: usize,
}

impl<K, V> ResourceCache<K, V>
where
    K: Copy + Eq + fmt::Debug,
{
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Vec::new(),
            capacity,
        }
    }

    /// Find the entry for `key`
    pub fn lookup(&self, key: &K) -> Option<&V> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    /// Return the entry for `key`, running `create` on a miss
    ///
    /// `create` runs at most once per key over the life of the table. On a
    /// full table the miss fails before `create` is invoked. A failing
    /// `create` leaves the table unchanged.
    pub fn get_or_create<F>(&mut self, key: K, create: F) -> Result<&V>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(pos) = self.entries.iter().position(|(k, _)| *k == key) {
            trace!("Cache hit for {:?}", key);
            return Ok(&self.entries[pos].1);
        }

        if self.entries.len() >= self.capacity {
            return Err(ComputeError::CacheCapacityExceeded {
                capacity: self.capacity,
            });
        }

        let value = create()?;
        self.entries.push((key, value));
        let (_, value) = &self.entries[self.entries.len() - 1];
        Ok(value)
    }

    /// Keys in creation order
    pub fn keys(&self) -> impl Iterator<Item = K> + '_ {
        self.entries.iter().map(|(k, _)| *k)
    }

    /// Values in creation order
    pub fn values(&self) -> impl Iterator<Item = &V> + '_ {
        self.entries.iter().map(|(_, v)| v)
    }

    /// Drop the entries for `keys`, returning how many were present
    pub fn forget(&mut self, keys: &[K]) -> usize {
        let before = self.entries.len();
        self.entries.retain(|(k, _)| !keys.contains(k));
        before - self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Drop every entry, newest first
    pub fn clear(&mut self) {
        while self.entries.pop().is_some() {}
    }
}

impl<K, V> Drop for ResourceCache<K, V> {
    fn drop(&mut self) {
        while self.entries.pop().is_some() {}
    }
}

impl<K: fmt::Debug, V> fmt::Debug for ResourceCache<K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceCache")
            .field("keys", &self.entries.iter().map(|(k, _)| k).collect::<Vec<_>>())
            .field("capacity", &self.capacity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::cell::Cell;

    #[test]
    fn test_create_once() {
        let mut cache: ResourceCache<u32, String> = ResourceCache::new(4);
        let calls = Cell::new(0);
        let create = || {
            calls.set(calls.get() + 1);
            Ok(format!("object-{}", calls.get()))
        };

        assert_eq!(cache.get_or_create(7, create).unwrap(), "object-1");
        assert_eq!(cache.get_or_create(7, create).unwrap(), "object-1");
        assert_eq!(calls.get(), 1);
        assert_eq!(cache.lookup(&7).map(String::as_str), Some("object-1"));
        assert!(cache.lookup(&8).is_none());
    }

    #[test]
    fn test_failed_create_leaves_table_unchanged() {
        let mut cache: ResourceCache<u32, u32> = ResourceCache::new(2);
        let result = cache.get_or_create(1, || Err(ComputeError::NotSent));
        assert!(matches!(result, Err(ComputeError::NotSent)));
        assert!(cache.is_empty());

        assert_eq!(*cache.get_or_create(1, || Ok(10)).unwrap(), 10);
    }

    #[test]
    fn test_capacity_checked_before_create() {
        let mut cache: ResourceCache<u32, u32> = ResourceCache::new(1);
        cache.get_or_create(1, || Ok(1)).unwrap();

        let result = cache.get_or_create(2, || panic!("must not create past capacity"));
        assert!(matches!(
            result,
            Err(ComputeError::CacheCapacityExceeded { capacity: 1 })
        ));

        // Existing keys still hit on a full table
        assert_eq!(*cache.get_or_create(1, || Ok(99)).unwrap(), 1);
    }

    #[test]
    fn test_clear_resets_to_uncached() {
        let mut cache: ResourceCache<u32, u32> = ResourceCache::new(2);
        cache.get_or_create(1, || Ok(1)).unwrap();
        cache.get_or_create(2, || Ok(2)).unwrap();
        cache.clear();
        assert!(cache.is_empty());
        assert_eq!(*cache.get_or_create(1, || Ok(3)).unwrap(), 3);
    }

    #[test]
    fn test_forget_frees_slots() {
        let mut cache: ResourceCache<u32, u32> = ResourceCache::new(2);
        cache.get_or_create(1, || Ok(1)).unwrap();
        cache.get_or_create(2, || Ok(2)).unwrap();

        assert_eq!(cache.forget(&[1, 5]), 1);
        assert!(cache.lookup(&1).is_none());
        assert_eq!(cache.values().copied().collect::<Vec<_>>(), vec![2]);
        assert_eq!(*cache.get_or_create(3, || Ok(3)).unwrap(), 3);
    }

    proptest! {
        #[test]
        fn prop_one_entry_per_key(keys in proptest::collection::vec(0u8..12, 0..64)) {
            let mut cache: ResourceCache<u8, usize> = ResourceCache::new(8);
            let mut created = Vec::new();

            for key in keys {
                let known = created.contains(&key);
                let full = created.len() == 8;
                let result = cache.get_or_create(key, || {
                    created.push(key);
                    Ok(created.len())
                });
                prop_assert_eq!(result.is_err(), !known && full);
            }

            prop_assert!(cache.len() <= 8);
            let keys: Vec<u8> = cache.keys().collect();
            prop_assert_eq!(&keys, &created);
        }
    }
}
