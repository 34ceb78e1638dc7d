//! Pseudo-connection table for the UDP relay
//!
//! Maps a datagram source (its textual address) to the destination handle
//! dialed for it. Entries expire after an idle window that every packet in
//! either direction resets; expiry is checked lazily on access and swept by
//! [`PseudoConnTable::purge_expired`].

use std::collections::HashMap;
use std::time::{Duration, Instant};

/// A mapped source
struct Entry<V> {
    value: V,
    last_active: Instant,
}

/// Source address → dialed destination, with idle expiry
pub struct PseudoConnTable<V> {
    entries: HashMap<String, Entry<V>>,
    /// `None` keeps entries until removed explicitly
    idle: Option<Duration>,
}

impl<V: Clone> PseudoConnTable<V> {
    pub fn new(idle: Option<Duration>) -> Self {
        Self {
            entries: HashMap::new(),
            idle,
        }
    }

    fn is_live(&self, entry: &Entry<V>, now: Instant) -> bool {
        match self.idle {
            Some(idle) => now.duration_since(entry.last_active) < idle,
            None => true,
        }
    }

    /// Live mapping for `source`, refreshing its idle timer
    pub fn get(&mut self, source: &str) -> Option<V> {
        let now = Instant::now();
        let idle = self.idle;
        let entry = self.entries.get_mut(source)?;
        if idle.map_or(false, |idle| now.duration_since(entry.last_active) >= idle) {
            return None;
        }
        entry.last_active = now;
        Some(entry.value.clone())
    }

    /// Map `source` to `value`. Returns whatever it displaced (live or stale)
    /// so the caller can release it.
    pub fn insert(&mut self, source: impl Into<String>, value: V) -> Option<V> {
        self.entries
            .insert(
                source.into(),
                Entry {
                    value,
                    last_active: Instant::now(),
                },
            )
            .map(|old| old.value)
    }

    /// Reset the idle timer of a live mapping. Stale entries are left to expire.
    pub fn touch(&mut self, source: &str) -> bool {
        let now = Instant::now();
        let idle = self.idle;
        match self.entries.get_mut(source) {
            Some(entry) if idle.map_or(true, |idle| now.duration_since(entry.last_active) < idle) => {
                entry.last_active = now;
                true
            }
            _ => false,
        }
    }

    /// Whether `source` has a live mapping (does not refresh it)
    pub fn contains(&self, source: &str) -> bool {
        let now = Instant::now();
        self.entries
            .get(source)
            .map_or(false, |entry| self.is_live(entry, now))
    }

    pub fn remove(&mut self, source: &str) -> Option<V> {
        self.entries.remove(source).map(|e| e.value)
    }

    /// Drop every expired entry and hand back their values
    pub fn purge_expired(&mut self) -> Vec<V> {
        let Some(idle) = self.idle else {
            return Vec::new();
        };
        let now = Instant::now();
        let stale: Vec<String> = self
            .entries
            .iter()
            .filter(|(_, entry)| now.duration_since(entry.last_active) >= idle)
            .map(|(source, _)| source.clone())
            .collect();

        stale
            .iter()
            .filter_map(|source| self.entries.remove(source))
            .map(|entry| entry.value)
            .collect()
    }

    /// Remove everything
    pub fn drain(&mut self) -> Vec<V> {
        self.entries.drain().map(|(_, entry)| entry.value).collect()
    }

    /// Entries held, including ones expired but not yet purged
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn idle(&self) -> Option<Duration> {
        self.idle
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_get() {
        let mut table = PseudoConnTable::new(None);
        assert!(table.insert("127.0.0.1:5000", 1u32).is_none());

        assert_eq!(table.get("127.0.0.1:5000"), Some(1));
        assert!(table.contains("127.0.0.1:5000"));
    }

    #[test]
    fn test_missing_entry() {
        let mut table: PseudoConnTable<u32> = PseudoConnTable::new(None);
        assert_eq!(table.get("127.0.0.1:5000"), None);
        assert!(!table.contains("127.0.0.1:5000"));
    }

    #[test]
    fn test_insert_returns_displaced() {
        let mut table = PseudoConnTable::new(None);
        table.insert("a", 1u32);
        assert_eq!(table.insert("a", 2), Some(1));
        assert_eq!(table.get("a"), Some(2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_remove() {
        let mut table = PseudoConnTable::new(None);
        table.insert("a", 1u32);
        assert_eq!(table.remove("a"), Some(1));
        assert!(!table.contains("a"));
    }

    #[test]
    fn test_expired_entry() {
        let mut table = PseudoConnTable::new(Some(Duration::from_millis(10)));
        table.insert("a", 1u32);
        assert!(table.contains("a"));

        std::thread::sleep(Duration::from_millis(20));

        assert!(!table.contains("a"));
        assert_eq!(table.get("a"), None);
        assert!(!table.touch("a"));
        // Still held until purged or replaced
        assert_eq!(table.len(), 1);
        assert_eq!(table.purge_expired(), vec![1]);
        assert!(table.is_empty());
    }

    #[test]
    fn test_get_refreshes_idle_timer() {
        let mut table = PseudoConnTable::new(Some(Duration::from_millis(60)));
        table.insert("a", 1u32);

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(25));
            assert_eq!(table.get("a"), Some(1));
        }
        assert!(table.purge_expired().is_empty());
    }

    #[test]
    fn test_touch_refreshes_idle_timer() {
        let mut table = PseudoConnTable::new(Some(Duration::from_millis(60)));
        table.insert("a", 1u32);

        for _ in 0..4 {
            std::thread::sleep(Duration::from_millis(25));
            assert!(table.touch("a"));
        }
        assert!(table.contains("a"));
    }

    #[test]
    fn test_no_idle_never_expires() {
        let mut table = PseudoConnTable::new(None);
        table.insert("a", 1u32);
        std::thread::sleep(Duration::from_millis(20));
        assert!(table.purge_expired().is_empty());
        assert_eq!(table.get("a"), Some(1));
        assert_eq!(table.idle(), None);
    }

    #[test]
    fn test_purge_keeps_live_entries() {
        let mut table = PseudoConnTable::new(Some(Duration::from_millis(40)));
        table.insert("old", 1u32);
        std::thread::sleep(Duration::from_millis(50));
        table.insert("new", 2);

        assert_eq!(table.purge_expired(), vec![1]);
        assert!(table.contains("new"));
    }

    #[test]
    fn test_drain() {
        let mut table = PseudoConnTable::new(None);
        table.insert("a", 1u32);
        table.insert("b", 2);

        let mut drained = table.drain();
        drained.sort();
        assert_eq!(drained, vec![1, 2]);
        assert!(table.is_empty());
    }
}
