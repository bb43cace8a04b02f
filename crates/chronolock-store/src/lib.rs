//! # chronolock-store
//!
//! The ordered key-value substrate beneath the lock store.
//!
//! - [`KvStore`]: ordered byte map with range scans
//! - [`MemStore`]: in-memory implementation with a content digest
//! - [`CacheStore`]: buffered writes committed as one [`WriteBatch`]
//! - [`encoding`]: order-preserving key encodings and prefix ranges

pub mod cache;
pub mod encoding;
pub mod kv;

pub use cache::CacheStore;
pub use kv::{KvPair, KvStore, MemStore, WriteBatch};
