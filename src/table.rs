//! Concurrent key-value table with per-bucket locking.
//!
//! The table is a fixed array of buckets, each guarded by its own lock and
//! holding a chain of `(key, value)` pairs. Keys hash to a bucket by simple
//! modulo, so two operations on different buckets proceed fully in parallel
//! while same-bucket racers serialize on that bucket's lock. The table is
//! linearizable per key; no ordering is promised across keys.
//!
//! There is no delete operation and the bucket count is fixed for the table
//! lifetime.

use parking_lot::Mutex;

/// Value returned for keys that were never put.
pub const ABSENT_VALUE: u32 = 0;

/// Fixed-bucket concurrent hash table.
pub struct KvTable {
    buckets: Vec<Mutex<Vec<(u32, u32)>>>,
}

impl KvTable {
    /// Create a table with `buckets` buckets.
    ///
    /// # Panics
    /// Panics if `buckets` is zero; a zero-bucket table is a construction
    /// error, not a runtime condition.
    pub fn with_buckets(buckets: usize) -> Self {
        assert!(buckets > 0, "table bucket count must be > 0");
        let mut v = Vec::with_capacity(buckets);
        v.resize_with(buckets, || Mutex::new(Vec::new()));
        Self { buckets: v }
    }

    #[inline]
    fn bucket(&self, key: u32) -> &Mutex<Vec<(u32, u32)>> {
        &self.buckets[key as usize % self.buckets.len()]
    }

    /// Insert or overwrite the value for `key`.
    pub fn put(&self, key: u32, value: u32) {
        let mut chain = self.bucket(key).lock();
        for entry in chain.iter_mut() {
            if entry.0 == key {
                entry.1 = value;
                return;
            }
        }
        chain.push((key, value));
    }

    /// Current value for `key`, or [`ABSENT_VALUE`] if the key was never
    /// put. Holds the bucket lock only for the lookup.
    pub fn get(&self, key: u32) -> u32 {
        let chain = self.bucket(key).lock();
        chain
            .iter()
            .find(|entry| entry.0 == key)
            .map(|entry| entry.1)
            .unwrap_or(ABSENT_VALUE)
    }

    /// Number of buckets
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    /// Number of distinct keys stored
    pub fn len(&self) -> usize {
        self.buckets.iter().map(|b| b.lock().len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_put_get_roundtrip() {
        let table = KvTable::with_buckets(16);
        table.put(1, 10);
        assert_eq!(table.get(1), 10);

        // Overwrite
        table.put(1, 11);
        assert_eq!(table.get(1), 11);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_absent_key_returns_zero() {
        let table = KvTable::with_buckets(4);
        assert_eq!(table.get(12345), ABSENT_VALUE);
        // Repeated reads of an unmodified key are stable
        assert_eq!(table.get(12345), ABSENT_VALUE);
        table.put(7, 70);
        assert_eq!(table.get(7), 70);
        assert_eq!(table.get(7), 70);
    }

    #[test]
    fn test_same_bucket_collision() {
        // Two buckets; keys 1 and 3 both land in bucket 1
        let table = KvTable::with_buckets(2);
        table.put(1, 10);
        table.put(3, 30);
        assert_eq!(table.get(1), 10);
        assert_eq!(table.get(3), 30);
        assert_eq!(table.len(), 2);
    }

    #[test]
    #[should_panic]
    fn test_zero_buckets_panics() {
        let _ = KvTable::with_buckets(0);
    }

    #[test]
    fn test_concurrent_disjoint_ranges() {
        let table = Arc::new(KvTable::with_buckets(8));
        let mut handles = Vec::new();

        for t in 0..4u32 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                let base = t * 1000;
                for i in 0..100 {
                    table.put(base + i, base + i + 1);
                    assert_eq!(table.get(base + i), base + i + 1);
                }
                // Overwrite pass; the final value must win
                for i in 0..100 {
                    table.put(base + i, i);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        for t in 0..4u32 {
            let base = t * 1000;
            for i in 0..100 {
                assert_eq!(table.get(base + i), i);
            }
        }
        assert_eq!(table.len(), 400);
    }

    #[test]
    fn test_concurrent_same_key_some_write_wins() {
        let table = Arc::new(KvTable::with_buckets(1));
        let mut handles = Vec::new();

        for t in 1..=4u32 {
            let table = Arc::clone(&table);
            handles.push(thread::spawn(move || {
                for _ in 0..50 {
                    table.put(42, t);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        let v = table.get(42);
        assert!((1..=4).contains(&v));
        assert_eq!(table.len(), 1);
    }
}
