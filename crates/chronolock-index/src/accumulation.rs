//! Per-denomination accumulation trees.
//!
//! A B+-style sum tree keyed by duration, persisted node by node in the
//! key-value store. Leaves hold `(duration, amount)` entries; branches hold
//! one `(min duration, child, subtree sum)` entry per child. Updates touch
//! one root-to-leaf path and `subset_sum` reads one path plus the sums
//! beside it, so both are `O(fanout · log n)` in the number of distinct
//! durations.
//!
//! ## Key layout
//!
//! `[0x20][len ‖ denom][0x00]` holds the tree metadata and
//! `[0x20][len ‖ denom][0x01][node id]` holds each node.

use std::time::Duration;

use chronolock_store::KvStore;
use chronolock_types::{LockupError, Result};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::keys::{ACCUMULATION_PREFIX, malformed, push_len_prefixed};

const META_TAG: u8 = 0x00;
const NODE_TAG: u8 = 0x01;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Meta {
    root: Option<u64>,
    next_node: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    duration: Duration,
    amount: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Child {
    min: Duration,
    node: u64,
    sum: Decimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
enum Node {
    Leaf(Vec<Entry>),
    Branch(Vec<Child>),
}

/// What a node update reports to its parent.
enum Outcome {
    Updated { min: Duration, sum: Decimal },
    Split(Child, Child),
    Emptied,
}

/// Prefix shared by every accumulation tree.
#[must_use]
pub fn all_trees_prefix() -> Vec<u8> {
    vec![ACCUMULATION_PREFIX]
}

/// Denoms that currently have a non-empty tree, in key order.
///
/// # Errors
/// `InternalInconsistency` on a malformed tree key.
pub fn stored_denoms(store: &impl KvStore) -> Result<Vec<String>> {
    let mut denoms = Vec::new();
    for (key, _) in store.prefix_scan(&all_trees_prefix()) {
        let len = usize::from(*key.get(1).ok_or_else(|| malformed("tree key", &key))?);
        let denom = key.get(2..2 + len).ok_or_else(|| malformed("tree key", &key))?;
        if key.get(2 + len..) == Some(&[META_TAG][..]) {
            denoms.push(String::from_utf8_lossy(denom).into_owned());
        }
    }
    Ok(denoms)
}

/// Handle on the tree for one denomination.
#[derive(Debug, Clone)]
pub struct AccumulationTree {
    denom: String,
    prefix: Vec<u8>,
    fanout: usize,
}

impl AccumulationTree {
    /// # Errors
    /// Returns `InvalidDenom` for denoms longer than 255 bytes.
    pub fn new(denom: &str, fanout: usize) -> Result<Self> {
        let mut prefix = vec![ACCUMULATION_PREFIX];
        push_len_prefixed(&mut prefix, denom.as_bytes())?;
        Ok(Self {
            denom: denom.to_string(),
            prefix,
            fanout,
        })
    }

    #[must_use]
    pub fn denom(&self) -> &str {
        &self.denom
    }

    // =====================================================================
    // Public operations
    // =====================================================================

    /// Add `amount` at `duration`, creating the entry if absent.
    ///
    /// # Errors
    /// `InvariantViolation` for a negative amount; codec errors on corrupt
    /// nodes.
    pub fn increase(
        &self,
        store: &mut impl KvStore,
        duration: Duration,
        amount: Decimal,
    ) -> Result<()> {
        if amount < Decimal::ZERO {
            return Err(LockupError::InvariantViolation {
                reason: format!("negative accumulation increase {amount}"),
            });
        }
        self.update(store, duration, amount)
    }

    /// Subtract `amount` at `duration`. An entry reaching zero is removed.
    ///
    /// # Errors
    /// `InvariantViolation` if the entry is missing or would go negative.
    pub fn decrease(
        &self,
        store: &mut impl KvStore,
        duration: Duration,
        amount: Decimal,
    ) -> Result<()> {
        if amount < Decimal::ZERO {
            return Err(LockupError::InvariantViolation {
                reason: format!("negative accumulation decrease {amount}"),
            });
        }
        self.update(store, duration, -amount)
    }

    /// Sum of every entry with duration `>= min`.
    ///
    /// # Errors
    /// Codec errors on corrupt nodes.
    pub fn subset_sum(&self, store: &impl KvStore, min: Duration) -> Result<Decimal> {
        let Some(mut node_id) = self.load_meta(store)?.root else {
            return Ok(Decimal::ZERO);
        };
        let mut total = Decimal::ZERO;
        loop {
            match self.load_node(store, node_id)? {
                Node::Leaf(entries) => {
                    let from = entries.partition_point(|e| e.duration < min);
                    total += entries[from..].iter().map(|e| e.amount).sum::<Decimal>();
                    return Ok(total);
                }
                Node::Branch(children) => {
                    let idx = route(&children, min);
                    total += children[idx + 1..].iter().map(|c| c.sum).sum::<Decimal>();
                    node_id = children[idx].node;
                }
            }
        }
    }

    /// Amount stored at exactly `duration`.
    ///
    /// # Errors
    /// Codec errors on corrupt nodes.
    pub fn get(&self, store: &impl KvStore, duration: Duration) -> Result<Decimal> {
        let Some(mut node_id) = self.load_meta(store)?.root else {
            return Ok(Decimal::ZERO);
        };
        loop {
            match self.load_node(store, node_id)? {
                Node::Leaf(entries) => {
                    return Ok(entries
                        .binary_search_by(|e| e.duration.cmp(&duration))
                        .map_or(Decimal::ZERO, |i| entries[i].amount));
                }
                Node::Branch(children) => node_id = children[route(&children, duration)].node,
            }
        }
    }

    /// Sum over every duration.
    ///
    /// # Errors
    /// Codec errors on corrupt nodes.
    pub fn total(&self, store: &impl KvStore) -> Result<Decimal> {
        self.subset_sum(store, Duration::ZERO)
    }

    /// Every `(duration, amount)` entry in ascending duration order.
    ///
    /// # Errors
    /// Codec errors on corrupt nodes.
    pub fn entries(&self, store: &impl KvStore) -> Result<Vec<(Duration, Decimal)>> {
        let mut out = Vec::new();
        if let Some(root) = self.load_meta(store)?.root {
            self.collect(store, root, &mut out)?;
        }
        Ok(out)
    }

    /// Check that every branch sum and minimum matches its subtree.
    ///
    /// # Errors
    /// `InternalInconsistency` naming the first bad node.
    pub fn verify(&self, store: &impl KvStore) -> Result<()> {
        if let Some(root) = self.load_meta(store)?.root {
            self.verify_node(store, root)?;
        }
        Ok(())
    }

    // =====================================================================
    // Update path
    // =====================================================================

    fn update(&self, store: &mut impl KvStore, key: Duration, delta: Decimal) -> Result<()> {
        if delta.is_zero() {
            return Ok(());
        }
        let mut meta = self.load_meta(store)?;
        match meta.root {
            None => {
                if delta < Decimal::ZERO {
                    return Err(self.underflow(key));
                }
                let id = alloc(&mut meta);
                self.save_node(
                    store,
                    id,
                    &Node::Leaf(vec![Entry {
                        duration: key,
                        amount: delta,
                    }]),
                )?;
                meta.root = Some(id);
            }
            Some(root) => match self.update_node(store, &mut meta, root, key, delta)? {
                Outcome::Updated { .. } => self.collapse_root(store, &mut meta)?,
                Outcome::Split(left, right) => {
                    let id = alloc(&mut meta);
                    self.save_node(store, id, &Node::Branch(vec![left, right]))?;
                    meta.root = Some(id);
                }
                Outcome::Emptied => meta.root = None,
            },
        }
        self.save_meta(store, &meta)?;
        debug!(denom = %self.denom, ?key, %delta, "Accumulation updated");
        Ok(())
    }

    fn update_node(
        &self,
        store: &mut impl KvStore,
        meta: &mut Meta,
        node_id: u64,
        key: Duration,
        delta: Decimal,
    ) -> Result<Outcome> {
        match self.load_node(store, node_id)? {
            Node::Leaf(mut entries) => {
                match entries.binary_search_by(|e| e.duration.cmp(&key)) {
                    Ok(i) => {
                        let next = entries[i].amount + delta;
                        if next < Decimal::ZERO {
                            return Err(self.underflow(key));
                        }
                        if next.is_zero() {
                            entries.remove(i);
                        } else {
                            entries[i].amount = next;
                        }
                    }
                    Err(i) => {
                        if delta < Decimal::ZERO {
                            return Err(self.underflow(key));
                        }
                        entries.insert(
                            i,
                            Entry {
                                duration: key,
                                amount: delta,
                            },
                        );
                    }
                }
                if entries.is_empty() {
                    store.delete(&self.node_key(node_id));
                    return Ok(Outcome::Emptied);
                }
                if entries.len() > self.fanout {
                    let right = entries.split_off(entries.len() / 2);
                    let right_id = alloc(meta);
                    let left = leaf_child(node_id, &entries);
                    let right_child = leaf_child(right_id, &right);
                    self.save_node(store, node_id, &Node::Leaf(entries))?;
                    self.save_node(store, right_id, &Node::Leaf(right))?;
                    return Ok(Outcome::Split(left, right_child));
                }
                let summary = leaf_child(node_id, &entries);
                self.save_node(store, node_id, &Node::Leaf(entries))?;
                Ok(Outcome::Updated {
                    min: summary.min,
                    sum: summary.sum,
                })
            }
            Node::Branch(mut children) => {
                let idx = route(&children, key);
                match self.update_node(store, meta, children[idx].node, key, delta)? {
                    Outcome::Updated { min, sum } => {
                        children[idx].min = min;
                        children[idx].sum = sum;
                    }
                    Outcome::Split(left, right) => {
                        children[idx] = left;
                        children.insert(idx + 1, right);
                    }
                    Outcome::Emptied => {
                        children.remove(idx);
                    }
                }
                if children.is_empty() {
                    store.delete(&self.node_key(node_id));
                    return Ok(Outcome::Emptied);
                }
                if children.len() > self.fanout {
                    let right = children.split_off(children.len() / 2);
                    let right_id = alloc(meta);
                    let left = branch_child(node_id, &children);
                    let right_child = branch_child(right_id, &right);
                    self.save_node(store, node_id, &Node::Branch(children))?;
                    self.save_node(store, right_id, &Node::Branch(right))?;
                    return Ok(Outcome::Split(left, right_child));
                }
                let summary = branch_child(node_id, &children);
                self.save_node(store, node_id, &Node::Branch(children))?;
                Ok(Outcome::Updated {
                    min: summary.min,
                    sum: summary.sum,
                })
            }
        }
    }

    /// Replace a single-child branch root by its child, repeatedly.
    fn collapse_root(&self, store: &mut impl KvStore, meta: &mut Meta) -> Result<()> {
        while let Some(root) = meta.root {
            match self.load_node(store, root)? {
                Node::Branch(children) if children.len() == 1 => {
                    store.delete(&self.node_key(root));
                    meta.root = Some(children[0].node);
                }
                _ => break,
            }
        }
        Ok(())
    }

    fn collect(
        &self,
        store: &impl KvStore,
        node_id: u64,
        out: &mut Vec<(Duration, Decimal)>,
    ) -> Result<()> {
        match self.load_node(store, node_id)? {
            Node::Leaf(entries) => out.extend(entries.into_iter().map(|e| (e.duration, e.amount))),
            Node::Branch(children) => {
                for child in children {
                    self.collect(store, child.node, out)?;
                }
            }
        }
        Ok(())
    }

    /// Returns `(min, sum)` of the subtree.
    fn verify_node(&self, store: &impl KvStore, node_id: u64) -> Result<(Duration, Decimal)> {
        let bad = |what: &str| LockupError::InternalInconsistency {
            reason: format!("accumulation tree {} node {node_id}: {what}", self.denom),
        };
        match self.load_node(store, node_id)? {
            Node::Leaf(entries) => {
                if entries.is_empty() {
                    return Err(bad("empty leaf"));
                }
                if entries.windows(2).any(|w| w[0].duration >= w[1].duration) {
                    return Err(bad("unsorted leaf"));
                }
                if entries.iter().any(|e| e.amount <= Decimal::ZERO) {
                    return Err(bad("non-positive entry"));
                }
                let summary = leaf_child(node_id, &entries);
                Ok((summary.min, summary.sum))
            }
            Node::Branch(children) => {
                if children.is_empty() {
                    return Err(bad("empty branch"));
                }
                for child in &children {
                    let (min, sum) = self.verify_node(store, child.node)?;
                    if min != child.min || sum != child.sum {
                        return Err(bad("stale child summary"));
                    }
                }
                let summary = branch_child(node_id, &children);
                Ok((summary.min, summary.sum))
            }
        }
    }

    // =====================================================================
    // Persistence
    // =====================================================================

    fn meta_key(&self) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.push(META_TAG);
        key
    }

    fn node_key(&self, id: u64) -> Vec<u8> {
        let mut key = self.prefix.clone();
        key.push(NODE_TAG);
        key.extend_from_slice(&id.to_be_bytes());
        key
    }

    fn load_meta(&self, store: &impl KvStore) -> Result<Meta> {
        match store.get(&self.meta_key()) {
            Some(bytes) => Ok(serde_json::from_slice(&bytes)?),
            None => Ok(Meta::default()),
        }
    }

    fn save_meta(&self, store: &mut impl KvStore, meta: &Meta) -> Result<()> {
        if meta.root.is_none() {
            // An empty tree leaves no keys behind.
            store.delete(&self.meta_key());
            return Ok(());
        }
        store.set(&self.meta_key(), &serde_json::to_vec(meta)?);
        Ok(())
    }

    fn load_node(&self, store: &impl KvStore, id: u64) -> Result<Node> {
        let bytes = store
            .get(&self.node_key(id))
            .ok_or_else(|| LockupError::InternalInconsistency {
                reason: format!("accumulation tree {} missing node {id}", self.denom),
            })?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    fn save_node(&self, store: &mut impl KvStore, id: u64, node: &Node) -> Result<()> {
        store.set(&self.node_key(id), &serde_json::to_vec(node)?);
        Ok(())
    }

    fn underflow(&self, duration: Duration) -> LockupError {
        LockupError::InvariantViolation {
            reason: format!("accumulation for {} at {duration:?} would go negative", self.denom),
        }
    }
}

/// Child whose subtree may contain `key`.
fn route(children: &[Child], key: Duration) -> usize {
    children
        .partition_point(|c| c.min <= key)
        .saturating_sub(1)
}

fn alloc(meta: &mut Meta) -> u64 {
    let id = meta.next_node;
    meta.next_node += 1;
    id
}

fn leaf_child(node: u64, entries: &[Entry]) -> Child {
    Child {
        min: entries.first().map_or(Duration::ZERO, |e| e.duration),
        node,
        sum: entries.iter().map(|e| e.amount).sum(),
    }
}

fn branch_child(node: u64, children: &[Child]) -> Child {
    Child {
        min: children.first().map_or(Duration::ZERO, |c| c.min),
        node,
        sum: children.iter().map(|c| c.sum).sum(),
    }
}
