//! Hostname to address cache shared between the resolver and the proxy
//!
//! Lookups and writes go through a single lock scoped to the map. Callers do
//! their slow work (talking to the container runtime) before taking it, so a
//! rescan never holds the lock for longer than one insert or removal.

use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;

#[derive(Debug, Default)]
pub struct ResolverCache {
    entries: RwLock<HashMap<String, String>>,
}

pub type SharedResolverCache = Arc<ResolverCache>;

impl ResolverCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached address for `hostname`. `None` means no managed backend is
    /// known under that name, which is an ordinary outcome.
    pub fn address(&self, hostname: &str) -> Option<String> {
        self.entries.read().get(hostname).cloned()
    }

    /// Record `hostname -> address`, replacing any previous address.
    ///
    /// Last writer wins: when several containers claim the same hostname
    /// during one rescan, the one inserted last is kept. Returns the address
    /// that was replaced, if any.
    pub fn insert(&self, hostname: impl Into<String>, address: impl Into<String>) -> Option<String> {
        self.entries.write().insert(hostname.into(), address.into())
    }

    pub fn remove(&self, hostname: &str) -> Option<String> {
        self.entries.write().remove(hostname)
    }

    /// Remove every host not in `seen`, returning the removed hostnames
    pub fn retain_hosts(&self, seen: &HashSet<String>) -> Vec<String> {
        let stale: Vec<String> = self
            .entries
            .read()
            .keys()
            .filter(|host| !seen.contains(*host))
            .cloned()
            .collect();

        for host in &stale {
            self.remove(host);
        }
        stale
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_lookup_is_none() {
        let cache = ResolverCache::new();
        assert!(cache.is_empty());
        assert_eq!(cache.address("testing-app.com"), None);
    }

    #[test]
    fn test_last_writer_wins() {
        let cache = ResolverCache::new();
        assert_eq!(cache.insert("testing-app.com", "172.17.0.2"), None);
        assert_eq!(
            cache.insert("testing-app.com", "172.17.0.3"),
            Some("172.17.0.2".to_string())
        );
        assert_eq!(cache.address("testing-app.com").as_deref(), Some("172.17.0.3"));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_retain_hosts_removes_unseen() {
        let cache = ResolverCache::new();
        cache.insert("a.local", "10.0.0.1");
        cache.insert("b.local", "10.0.0.2");
        cache.insert("c.local", "10.0.0.3");

        let seen: HashSet<String> = ["b.local".to_string()].into_iter().collect();
        let mut removed = cache.retain_hosts(&seen);
        removed.sort();

        assert_eq!(removed, vec!["a.local".to_string(), "c.local".to_string()]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.address("b.local").as_deref(), Some("10.0.0.2"));
    }

    #[test]
    fn test_concurrent_readers_and_writer() {
        let cache = Arc::new(ResolverCache::new());
        let writer = {
            let cache = Arc::clone(&cache);
            std::thread::spawn(move || {
                for i in 0..1000 {
                    cache.insert("app.local", format!("10.0.0.{}", i % 250));
                }
            })
        };

        let readers: Vec<_> = (0..4)
            .map(|_| {
                let cache = Arc::clone(&cache);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        if let Some(addr) = cache.address("app.local") {
                            assert!(addr.starts_with("10.0.0."));
                        }
                    }
                })
            })
            .collect();

        writer.join().unwrap();
        for r in readers {
            r.join().unwrap();
        }
        assert_eq!(cache.len(), 1);
    }
}
