//! In-process coordination store for single-replica deployments and tests.
//!
//! Each operation runs under the DashMap shard lock of its key, which gives
//! the same per-key atomicity the Redis scripts provide. Expired entries are
//! treated as absent and dropped lazily or by [`LocalStore::cleanup_expired`].

use std::time::{Duration, Instant};

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use super::CounterOutcome;

#[derive(Debug, Clone)]
enum LocalValue {
    Counter(u64),
    Bytes(Vec<u8>),
}

#[derive(Debug, Clone)]
struct LocalEntry {
    value: LocalValue,
    expires_at: Instant,
}

impl LocalEntry {
    fn new(value: LocalValue, ttl: Duration) -> Self {
        Self {
            value,
            expires_at: Instant::now() + ttl,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }

    fn remaining_ttl(&self, now: Instant) -> Duration {
        self.expires_at.saturating_duration_since(now)
    }
}

#[derive(Debug, Default)]
pub struct LocalStore {
    entries: DashMap<String, LocalEntry>,
}

impl LocalStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn consume(&self, key: &str, limit: u64, window: Duration, cost: u64) -> CounterOutcome {
        let now = Instant::now();

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                let live = match occupied.get() {
                    LocalEntry {
                        value: LocalValue::Counter(current),
                        ..
                    } if occupied.get().is_live(now) => {
                        Some((*current, occupied.get().remaining_ttl(now)))
                    }
                    _ => None,
                };

                match live {
                    Some((current, reset)) if current.saturating_add(cost) <= limit => {
                        occupied.get_mut().value = LocalValue::Counter(current + cost);
                        CounterOutcome::allowed(limit - current - cost, reset)
                    }
                    Some((current, reset)) => {
                        CounterOutcome::denied(limit.saturating_sub(current), reset)
                    }
                    None if cost > limit => {
                        occupied.remove();
                        CounterOutcome::denied(limit, Duration::ZERO)
                    }
                    None => {
                        occupied.insert(LocalEntry::new(LocalValue::Counter(cost), window));
                        CounterOutcome::allowed(limit - cost, window)
                    }
                }
            }
            Entry::Vacant(_) if cost > limit => CounterOutcome::denied(limit, Duration::ZERO),
            Entry::Vacant(vacant) => {
                vacant.insert(LocalEntry::new(LocalValue::Counter(cost), window));
                CounterOutcome::allowed(limit - cost, window)
            }
        }
    }

    pub fn peek(&self, key: &str, limit: u64) -> CounterOutcome {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => match entry.value {
                LocalValue::Counter(current) => CounterOutcome::allowed(
                    limit.saturating_sub(current),
                    entry.remaining_ttl(now),
                ),
                LocalValue::Bytes(_) => CounterOutcome::allowed(limit, Duration::ZERO),
            },
            _ => CounterOutcome::allowed(limit, Duration::ZERO),
        }
    }

    pub fn set_if_absent(&self, key: &str, value: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        let entry = LocalEntry::new(LocalValue::Bytes(value.as_bytes().to_vec()), ttl);

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(occupied) if occupied.get().is_live(now) => false,
            Entry::Occupied(mut occupied) => {
                occupied.insert(entry);
                true
            }
            Entry::Vacant(vacant) => {
                vacant.insert(entry);
                true
            }
        }
    }

    pub fn delete_if_equals(&self, key: &str, value: &str) -> bool {
        let now = Instant::now();
        self.entries
            .remove_if(key, |_, entry| {
                entry.is_live(now)
                    && matches!(&entry.value, LocalValue::Bytes(bytes) if bytes.as_slice() == value.as_bytes())
            })
            .is_some()
    }

    pub fn get_many(&self, keys: &[String]) -> Vec<Option<Vec<u8>>> {
        let now = Instant::now();
        keys.iter()
            .map(|key| {
                self.entries
                    .get(key)
                    .filter(|entry| entry.is_live(now))
                    .and_then(|entry| match &entry.value {
                        LocalValue::Bytes(bytes) => Some(bytes.clone()),
                        LocalValue::Counter(_) => None,
                    })
            })
            .collect()
    }

    pub fn set_many(&self, entries: &[(String, Vec<u8>)], ttl: Duration) {
        for (key, value) in entries {
            self.entries.insert(
                key.clone(),
                LocalEntry::new(LocalValue::Bytes(value.clone()), ttl),
            );
        }
    }

    pub fn delete_many(&self, keys: &[String]) {
        for key in keys {
            self.entries.remove(key);
        }
    }

    /// Number of entries currently held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Remove expired entries, returning how many were dropped.
    pub fn cleanup_expired(&self) -> usize {
        let now = Instant::now();
        let mut removed = 0;

        self.entries.retain(|_, entry| {
            if entry.is_live(now) {
                true
            } else {
                removed += 1;
                false
            }
        });

        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: Duration = Duration::from_secs(60);

    #[test]
    fn test_first_consumption_opens_window() {
        let store = LocalStore::new();
        let outcome = store.consume("k", 10, WINDOW, 3);
        assert!(outcome.allowed);
        assert_eq!(outcome.remaining, 7);
        assert_eq!(outcome.reset_in_millis, 60_000);
    }

    #[test]
    fn test_denial_does_not_charge() {
        let store = LocalStore::new();
        assert!(store.consume("k", 4, WINDOW, 1).allowed);

        let denied = store.consume("k", 4, WINDOW, 4);
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 3);
        assert!(denied.reset_in_millis > 0);

        let allowed = store.consume("k", 4, WINDOW, 3);
        assert!(allowed.allowed);
        assert_eq!(allowed.remaining, 0);
    }

    #[test]
    fn test_oversized_cost_on_missing_key_creates_nothing() {
        let store = LocalStore::new();
        let outcome = store.consume("k", 2, WINDOW, 5);
        assert!(!outcome.allowed);
        assert_eq!(outcome.remaining, 2);
        assert_eq!(outcome.reset_in_millis, 0);
        assert!(store.is_empty());
    }

    #[test]
    fn test_window_is_not_renewed_by_consumption() {
        let store = LocalStore::new();
        store.consume("k", 10, Duration::from_millis(50), 1);
        std::thread::sleep(Duration::from_millis(30));
        let second = store.consume("k", 10, Duration::from_millis(50), 1);
        assert!(second.reset_in_millis <= 20);

        std::thread::sleep(Duration::from_millis(30));
        let fresh = store.consume("k", 10, Duration::from_millis(50), 1);
        assert_eq!(fresh.remaining, 9);
    }

    #[test]
    fn test_peek_reports_without_creating() {
        let store = LocalStore::new();
        let outcome = store.peek("k", 5);
        assert_eq!(outcome.remaining, 5);
        assert!(store.is_empty());

        store.consume("k", 5, WINDOW, 2);
        assert_eq!(store.peek("k", 5).remaining, 3);
    }

    #[test]
    fn test_set_if_absent_and_compare_delete() {
        let store = LocalStore::new();
        assert!(store.set_if_absent("lock", "a", WINDOW));
        assert!(!store.set_if_absent("lock", "b", WINDOW));

        assert!(!store.delete_if_equals("lock", "b"));
        assert!(store.delete_if_equals("lock", "a"));
        assert!(store.set_if_absent("lock", "b", WINDOW));
    }

    #[test]
    fn test_expired_lock_can_be_taken_over() {
        let store = LocalStore::new();
        assert!(store.set_if_absent("lock", "a", Duration::from_millis(10)));
        std::thread::sleep(Duration::from_millis(20));
        assert!(store.set_if_absent("lock", "b", WINDOW));
        assert!(!store.delete_if_equals("lock", "a"));
    }

    #[test]
    fn test_cleanup_expired() {
        let store = LocalStore::new();
        store.set_many(
            &[
                ("a".to_string(), b"1".to_vec()),
                ("b".to_string(), b"2".to_vec()),
            ],
            Duration::from_millis(10),
        );
        store.set_many(&[("c".to_string(), b"3".to_vec())], WINDOW);
        std::thread::sleep(Duration::from_millis(20));

        assert_eq!(store.cleanup_expired(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(
            store.get_many(&["a".to_string(), "c".to_string()]),
            vec![None, Some(b"3".to_vec())]
        );
    }
}
