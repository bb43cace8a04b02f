//! The flat ordered key-value substrate.
//!
//! Everything the lock store persists lives in one ordered byte key space.
//! [`KvStore`] is the narrow interface the index and engine code is written
//! against; [`MemStore`] is the in-memory implementation backed by a
//! `BTreeMap`.

use std::{collections::BTreeMap, ops::Bound};

use sha2::{Digest, Sha256};
use tracing::debug;

use crate::encoding::{bound_as_slice, is_empty_range, prefix_range};

/// A key/value pair as returned by range scans.
pub type KvPair = (Vec<u8>, Vec<u8>);

// ---------------------------------------------------------------------------
// WriteBatch
// ---------------------------------------------------------------------------

/// Set of pending writes applied as one unit. The last write to a key wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteBatch {
    pub(crate) ops: BTreeMap<Vec<u8>, Option<Vec<u8>>>,
}

impl WriteBatch {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.ops.insert(key, Some(value));
    }

    pub fn delete(&mut self, key: Vec<u8>) {
        self.ops.insert(key, None);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Pending writes in key order. `None` is a delete.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.ops
            .iter()
            .map(|(k, v)| (k.as_slice(), v.as_deref()))
    }
}

// ---------------------------------------------------------------------------
// KvStore
// ---------------------------------------------------------------------------

/// Ordered byte key-value store.
///
/// Reads see every write made through the same handle. Range scans return
/// pairs in ascending key order; an empty or inverted range yields nothing.
pub trait KvStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>>;

    fn has(&self, key: &[u8]) -> bool {
        self.get(key).is_some()
    }

    fn set(&mut self, key: &[u8], value: &[u8]);

    fn delete(&mut self, key: &[u8]);

    fn range(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Vec<KvPair>;

    /// All pairs whose key starts with `prefix`.
    fn prefix_scan(&self, prefix: &[u8]) -> Vec<KvPair> {
        let (lower, upper) = prefix_range(prefix.to_vec());
        self.range(bound_as_slice(&lower), bound_as_slice(&upper))
    }

    /// Apply every write of `batch`.
    fn write(&mut self, batch: WriteBatch) {
        for (key, value) in batch.ops {
            match value {
                Some(value) => self.set(&key, &value),
                None => self.delete(&key),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MemStore
// ---------------------------------------------------------------------------

/// In-memory [`KvStore`].
#[derive(Debug, Clone, Default)]
pub struct MemStore {
    map: BTreeMap<Vec<u8>, Vec<u8>>,
}

impl MemStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.map.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    /// SHA-256 over the whole key space in key order, hex encoded.
    ///
    /// Two stores hold identical state iff their digests match (up to
    /// collisions), which makes "this rejected call left no trace" a
    /// one-line assertion.
    #[must_use]
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        for (key, value) in &self.map {
            hasher.update((key.len() as u64).to_be_bytes());
            hasher.update(key);
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value);
        }
        hex::encode(hasher.finalize())
    }
}

impl KvStore for MemStore {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.map.get(key).cloned()
    }

    fn has(&self, key: &[u8]) -> bool {
        self.map.contains_key(key)
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.map.insert(key.to_vec(), value.to_vec());
    }

    fn delete(&mut self, key: &[u8]) {
        self.map.remove(key);
    }

    fn range(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Vec<KvPair> {
        if is_empty_range(lower, upper) {
            return Vec::new();
        }
        self.map
            .range::<[u8], _>((lower, upper))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn write(&mut self, batch: WriteBatch) {
        let writes = batch.len();
        for (key, value) in batch.ops {
            match value {
                Some(value) => {
                    self.map.insert(key, value);
                }
                None => {
                    self.map.remove(&key);
                }
            }
        }
        debug!(writes, keys = self.map.len(), "Applied write batch");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store(pairs: &[(&str, &str)]) -> MemStore {
        let mut s = MemStore::new();
        for (k, v) in pairs {
            s.set(k.as_bytes(), v.as_bytes());
        }
        s
    }

    fn slice(s: &str) -> &[u8] {
        s.as_bytes()
    }

    #[test]
    fn get_set_delete() {
        let mut s = MemStore::new();
        assert!(s.get(b"a").is_none());
        s.set(b"a", b"1");
        assert_eq!(s.get(b"a"), Some(b"1".to_vec()));
        assert!(s.has(b"a"));
        s.delete(b"a");
        assert!(!s.has(b"a"));
        assert!(s.is_empty());
    }

    #[test]
    fn range_is_ordered_and_bounded() {
        let s = store(&[("a", "1"), ("b", "2"), ("c", "3"), ("d", "4")]);
        let keys: Vec<_> = s
            .range(Bound::Included(slice("b")), Bound::Excluded(slice("d")))
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn inverted_range_is_empty_not_a_panic() {
        let s = store(&[("a", "1"), ("b", "2")]);
        assert!(s.range(Bound::Included(slice("b")), Bound::Included(slice("a"))).is_empty());
        assert!(s.range(Bound::Excluded(slice("a")), Bound::Excluded(slice("a"))).is_empty());
    }

    #[test]
    fn prefix_scan_respects_prefix() {
        let mut s = MemStore::new();
        s.set(&[0x01, 0x00], b"x");
        s.set(&[0x01, 0xFF], b"y");
        s.set(&[0x02], b"z");
        s.set(&[0x00, 0xFF], b"w");
        let hits = s.prefix_scan(&[0x01]);
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].1, b"x".to_vec());
        assert_eq!(hits[1].1, b"y".to_vec());
    }

    #[test]
    fn write_batch_last_write_wins() {
        let mut s = store(&[("a", "1")]);
        let mut batch = WriteBatch::new();
        batch.put(b"b".to_vec(), b"2".to_vec());
        batch.delete(b"b".to_vec());
        batch.delete(b"a".to_vec());
        batch.put(b"c".to_vec(), b"3".to_vec());
        assert_eq!(batch.len(), 3);
        s.write(batch);
        assert!(!s.has(b"a"));
        assert!(!s.has(b"b"));
        assert_eq!(s.get(b"c"), Some(b"3".to_vec()));
    }

    #[test]
    fn digest_tracks_content() {
        let a = store(&[("k", "v")]);
        let b = store(&[("k", "v")]);
        let c = store(&[("k", "w")]);
        assert_eq!(a.digest(), b.digest());
        assert_ne!(a.digest(), c.digest());
        assert_eq!(a.digest().len(), 64);
    }
}
