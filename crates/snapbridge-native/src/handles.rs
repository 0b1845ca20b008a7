use crate::error::{BridgeError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use tracing::trace;

/// Opaque token standing in for a registered value while a native call runs
///
/// A handle is the only thing handed to native code as callback user data.
/// It carries no payload; it is resolved back to the value through the
/// [`HandleTable`] that issued it. Handles are never zero, so a null
/// user-data pointer is never a valid handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Handle(usize);

impl Handle {
    /// Raw integer form, as passed through the native user-data word
    pub fn as_raw(self) -> usize {
        self.0
    }

    /// Rebuild a handle from a raw user-data word
    pub fn from_raw(raw: usize) -> Self {
        Self(raw)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Concurrency-safe map from freshly minted handles to per-call values
///
/// `add` and `remove` take the write lock; `lookup` takes the read lock, so
/// lookups of distinct handles from native-owned threads do not serialize
/// against each other.
pub struct HandleTable<T> {
    entries: RwLock<HashMap<usize, T>>,
    next: AtomicUsize,
}

impl<T: Clone> HandleTable<T> {
    pub fn new() -> Self {
        Self::starting_at(1)
    }

    fn starting_at(first: usize) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            next: AtomicUsize::new(first),
        }
    }

    /// Register a value and return a handle distinct from every live one
    pub fn add(&self, value: T) -> Handle {
        let mut entries = self.entries.write();
        loop {
            let raw = self.next.fetch_add(1, Ordering::Relaxed);
            // Zero is reserved, and after wrap-around a value may still be live.
            if raw == 0 || entries.contains_key(&raw) {
                continue;
            }
            entries.insert(raw, value);
            trace!("Registered handle {} ({} live)", raw, entries.len());
            return Handle(raw);
        }
    }

    /// Return the value registered for `handle`
    ///
    /// An unknown handle means the bridge protocol was broken, so the error is
    /// a consistency violation rather than a user error.
    pub fn lookup(&self, handle: Handle) -> Result<T> {
        self.entries
            .read()
            .get(&handle.0)
            .cloned()
            .ok_or_else(|| BridgeError::bridge_consistency_violation(handle.0))
    }

    /// Drop the association for `handle`. Removing twice is a no-op.
    pub fn remove(&self, handle: Handle) {
        if self.entries.write().remove(&handle.0).is_some() {
            trace!("Removed handle {}", handle);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<T: Clone> Default for HandleTable<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_lookup_after_add_returns_value() {
        let table = HandleTable::new();
        let a = table.add("alpha".to_string());
        let b = table.add("beta".to_string());

        assert_ne!(a, b);
        assert_eq!(table.lookup(a).unwrap(), "alpha");
        assert_eq!(table.lookup(b).unwrap(), "beta");
        // Lookup has no side effects
        assert_eq!(table.lookup(a).unwrap(), "alpha");
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_remove_is_idempotent() {
        let table = HandleTable::new();
        let h = table.add(7u32);

        table.remove(h);
        table.remove(h);
        assert!(table.is_empty());
        assert!(matches!(
            table.lookup(h),
            Err(BridgeError::BridgeConsistencyViolation { handle }) if handle == h.as_raw()
        ));
    }

    #[test]
    fn test_unknown_handle_is_consistency_violation() {
        let table: HandleTable<u32> = HandleTable::new();
        let err = table.lookup(Handle::from_raw(42)).unwrap_err();
        assert!(matches!(err, BridgeError::BridgeConsistencyViolation { handle: 42 }));
    }

    #[test]
    fn test_add_never_returns_live_handle() {
        let table = HandleTable::new();
        let mut live = HashSet::new();

        for round in 0..200u32 {
            let h = table.add(round);
            assert_ne!(h.as_raw(), 0);
            assert!(live.insert(h), "handle {} issued while still live", h);
            // Free every third handle so the live set churns
            if round % 3 == 0 {
                table.remove(h);
                live.remove(&h);
            }
        }
        assert_eq!(table.len(), live.len());
    }

    #[test]
    fn test_wraparound_skips_zero_and_live_handles() {
        let table = HandleTable::starting_at(usize::MAX - 1);
        let a = table.add('a');
        let b = table.add('b');
        assert_eq!(a.as_raw(), usize::MAX - 1);
        assert_eq!(b.as_raw(), usize::MAX);

        // Counter wrapped: zero is skipped, then fresh values continue.
        let c = table.add('c');
        assert_eq!(c.as_raw(), 1);

        // Force the counter onto a live value; it must be skipped.
        table.next.store(usize::MAX - 1, Ordering::Relaxed);
        let d = table.add('d');
        assert_ne!(d, a);
        assert_ne!(d, b);
        assert_ne!(d, c);
        assert_eq!(table.lookup(a).unwrap(), 'a');
        assert_eq!(table.lookup(d).unwrap(), 'd');
    }

    fn concurrent_adds(n: usize) {
        let table = HandleTable::new();
        let handles: Vec<Handle> = std::thread::scope(|s| {
            let workers: Vec<_> = (0..n)
                .map(|i| {
                    let table = &table;
                    s.spawn(move || table.add(i))
                })
                .collect();
            workers.into_iter().map(|w| w.join().unwrap()).collect()
        });

        let distinct: HashSet<_> = handles.iter().copied().collect();
        assert_eq!(distinct.len(), n);
        assert_eq!(table.len(), n);
        for h in handles {
            // Each handle resolves to exactly one of the submitted values
            assert!(table.lookup(h).unwrap() < n);
        }
    }

    #[test]
    fn test_concurrent_add_2_threads() {
        concurrent_adds(2);
    }

    #[test]
    fn test_concurrent_add_8_threads() {
        concurrent_adds(8);
    }

    #[test]
    fn test_concurrent_add_64_threads() {
        concurrent_adds(64);
    }

    #[test]
    fn test_concurrent_lookup_and_remove() {
        let table = HandleTable::new();
        let handles: Vec<Handle> = (0..32u64).map(|i| table.add(i * 10)).collect();

        std::thread::scope(|s| {
            for (i, h) in handles.iter().copied().enumerate() {
                let table = &table;
                s.spawn(move || {
                    for _ in 0..100 {
                        assert_eq!(table.lookup(h).unwrap(), i as u64 * 10);
                    }
                    table.remove(h);
                });
            }
        });

        assert!(table.is_empty());
    }
}
