//! Per-request retry bookkeeping
//!
//! Keys are `host + url`. An entry lives from the first failure until the
//! next success, exhaustion or expiry, and the map never holds more than
//! `capacity` entries.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;

#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Retries per key before giving up
    pub max_retries: u32,

    /// Delay of retry `n` is `n * step`
    pub step: Duration,

    /// Entries untouched for this long are dropped
    pub ttl: Duration,

    pub capacity: usize,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 20,
            step: Duration::from_millis(250),
            ttl: Duration::from_secs(120),
            capacity: 1024,
        }
    }
}

struct Entry {
    count: u32,
    touched: Instant,
}

pub struct RetryCounter {
    policy: RetryPolicy,
    entries: Mutex<HashMap<String, Entry>>,
}

impl RetryCounter {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Count a failure and return how long to wait before retrying, or
    /// `None` once the key has used up its retries
    pub fn next_delay(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let mut entries = self.entries.lock();

        if !entries.contains_key(key) {
            self.make_room(&mut entries, now);
        }
        let entry = entries.entry(key.to_string()).or_insert(Entry {
            count: 0,
            touched: now,
        });
        if now.duration_since(entry.touched) > self.policy.ttl {
            entry.count = 0;
        }
        entry.count += 1;
        entry.touched = now;

        if entry.count > self.policy.max_retries {
            entries.remove(key);
            return None;
        }
        Some(self.policy.step * entry.count)
    }

    /// Forget a key after a success
    pub fn reset(&self, key: &str) {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn make_room(&self, entries: &mut HashMap<String, Entry>, now: Instant) {
        let ttl = self.policy.ttl;
        entries.retain(|_, entry| now.duration_since(entry.touched) <= ttl);

        while entries.len() >= self.policy.capacity.max(1) {
            let oldest = entries
                .iter()
                .min_by_key(|(_, entry)| entry.touched)
                .map(|(key, _)| key.clone());
            match oldest {
                Some(key) => entries.remove(&key),
                None => break,
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_backoff_until_exhausted() {
        let counter = RetryCounter::new(RetryPolicy::default());

        let delays: Vec<Duration> = std::iter::from_fn(|| counter.next_delay("host/api"))
            .take(100)
            .collect();

        assert_eq!(delays.len(), 20);
        assert_eq!(delays[0], Duration::from_millis(250));
        assert_eq!(delays[19], Duration::from_millis(5000));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
        // Exhaustion evicts the key
        assert!(counter.is_empty());
    }

    #[test]
    fn test_reset_on_success() {
        let counter = RetryCounter::new(RetryPolicy::default());
        counter.next_delay("a");
        counter.next_delay("a");
        counter.reset("a");
        assert!(counter.is_empty());
        assert_eq!(counter.next_delay("a"), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_keys_are_independent() {
        let counter = RetryCounter::new(RetryPolicy::default());
        counter.next_delay("a");
        counter.next_delay("a");
        assert_eq!(counter.next_delay("b"), Some(Duration::from_millis(250)));
    }

    #[test]
    fn test_capacity_is_bounded() {
        let counter = RetryCounter::new(RetryPolicy {
            capacity: 3,
            ..Default::default()
        });
        for key in ["a", "b", "c", "d", "e"] {
            counter.next_delay(key);
        }
        assert_eq!(counter.len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_entries_are_dropped() {
        let counter = RetryCounter::new(RetryPolicy {
            ttl: Duration::from_secs(1),
            ..Default::default()
        });
        counter.next_delay("a");
        counter.next_delay("a");

        tokio::time::advance(Duration::from_secs(2)).await;
        assert_eq!(counter.next_delay("a"), Some(Duration::from_millis(250)));

        tokio::time::advance(Duration::from_secs(2)).await;
        counter.next_delay("b");
        assert_eq!(counter.len(), 1);
    }
}
