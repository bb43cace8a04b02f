//! Buffered write layer with all-or-nothing commit.
//!
//! A [`CacheStore`] reads through to its parent and keeps every write in a
//! private [`WriteBatch`]. Dropping the cache discards the writes; handing
//! the batch to the parent's [`KvStore::write`] applies all of them.

use std::{collections::BTreeMap, ops::Bound};

use crate::{
    encoding::is_empty_range,
    kv::{KvPair, KvStore, WriteBatch},
};

pub struct CacheStore<'a, S: KvStore + ?Sized> {
    parent: &'a S,
    pending: WriteBatch,
}

impl<'a, S: KvStore + ?Sized> CacheStore<'a, S> {
    #[must_use]
    pub fn new(parent: &'a S) -> Self {
        Self {
            parent,
            pending: WriteBatch::new(),
        }
    }

    /// Number of keys written so far.
    #[must_use]
    pub fn pending_writes(&self) -> usize {
        self.pending.len()
    }

    /// Release the parent borrow and hand back the buffered writes.
    #[must_use]
    pub fn into_batch(self) -> WriteBatch {
        self.pending
    }
}

impl<S: KvStore + ?Sized> KvStore for CacheStore<'_, S> {
    fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        match self.pending.ops.get(key) {
            Some(write) => write.clone(),
            None => self.parent.get(key),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) {
        self.pending.put(key.to_vec(), value.to_vec());
    }

    fn delete(&mut self, key: &[u8]) {
        self.pending.delete(key.to_vec());
    }

    fn range(&self, lower: Bound<&[u8]>, upper: Bound<&[u8]>) -> Vec<KvPair> {
        if is_empty_range(lower, upper) {
            return Vec::new();
        }
        let mut merged: BTreeMap<Vec<u8>, Vec<u8>> =
            self.parent.range(lower, upper).into_iter().collect();
        for (key, write) in self.pending.ops.range::<[u8], _>((lower, upper)) {
            match write {
                Some(value) => {
                    merged.insert(key.clone(), value.clone());
                }
                None => {
                    merged.remove(key);
                }
            }
        }
        merged.into_iter().collect()
    }
}
