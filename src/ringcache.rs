//! Cache of per-service hash rings.
//!
//! A ring exists only while the service's traffic policy selects consistent
//! hashing; the cache is where policy updates create and drop rings.

use crate::hashring::HashRing;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;

/// Concurrent map of qualified service name → hash ring.
#[derive(Default)]
pub struct RingCache {
    rings: DashMap<String, Arc<HashRing>>,
}

impl RingCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the ring for a service, if one exists.
    pub fn get(&self, service: &str) -> Option<Arc<HashRing>> {
        self.rings.get(service).map(|entry| entry.value().clone())
    }

    /// Inserts a ring only if the service has none. Returns `true` if the
    /// supplied ring was installed; concurrent callers race through the map
    /// entry, so exactly one wins.
    pub fn insert_if_absent(&self, service: &str, ring: Arc<HashRing>) -> bool {
        match self.rings.entry(service.to_string()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(slot) => {
                slot.insert(ring);
                true
            }
        }
    }

    /// Drops a service's ring. Absent entries are ignored.
    pub fn remove(&self, service: &str) {
        self.rings.remove(service);
    }

    pub fn contains(&self, service: &str) -> bool {
        self.rings.contains_key(service)
    }

    pub fn len(&self) -> usize {
        self.rings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rings.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RingConfig;
    use crate::hashring::ServiceInstance;

    fn empty_ring() -> Arc<HashRing> {
        Arc::new(HashRing::new(RingConfig::default()))
    }

    #[test]
    fn test_insert_if_absent_keeps_first_ring() {
        let cache = RingCache::new();
        let first = empty_ring();
        first.add(ServiceInstance::new("default", "web", "10.1.0.1"));

        assert!(cache.insert_if_absent("default.web", first.clone()));
        assert!(!cache.insert_if_absent("default.web", empty_ring()));

        let held = cache.get("default.web").unwrap();
        assert_eq!(held.len(), 1);
        assert!(Arc::ptr_eq(&held, &first));
    }

    #[test]
    fn test_remove_is_idempotent() {
        let cache = RingCache::new();
        cache.insert_if_absent("default.web", empty_ring());
        cache.remove("default.web");
        assert!(!cache.contains("default.web"));
        cache.remove("default.web");
        assert!(cache.is_empty());
    }

    #[test]
    fn test_concurrent_inserts_have_single_winner() {
        let cache = Arc::new(RingCache::new());
        let winners: Vec<bool> = std::thread::scope(|scope| {
            (0..8)
                .map(|_| {
                    let cache = cache.clone();
                    scope.spawn(move || cache.insert_if_absent("default.api", empty_ring()))
                })
                .collect::<Vec<_>>()
                .into_iter()
                .map(|handle| handle.join().unwrap())
                .collect()
        });
        assert_eq!(winners.iter().filter(|won| **won).count(), 1);
        assert_eq!(cache.len(), 1);
    }
}
