//! One-time repairs of persisted state.
//!
//! - [`LockupKeeper::migrate_legacy_references`] re-keys references stored
//!   in the legacy layout, where each reference key held a JSON array of
//!   lock ids, into the id-folded layout used by the reference index.
//! - [`LockupKeeper::rebuild_accumulation`] recomputes every accumulation
//!   tree from the records, repairing aggregates that missed writes.

use std::collections::BTreeSet;

use chronolock_index::{OverlayView, accumulation, keys, reference};
use chronolock_store::KvStore;
use chronolock_types::{LockId, LockState, Result};
use serde::{Deserialize, Serialize};

use crate::{
    bank::Bank,
    keeper::{LockupKeeper, require_overlay_amount},
    records,
};

/// Value stored under a legacy reference key.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LegacyRefs {
    pub ids: Vec<LockId>,
}

/// Outcome of a legacy reference migration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MigrationReport {
    /// Legacy keys read and deleted.
    pub legacy_entries: usize,
    /// Locks whose references were rewritten.
    pub locks_reindexed: Vec<LockId>,
    /// Ids named by legacy entries with no lock record.
    pub stale_ids: Vec<LockId>,
}

/// Key of a legacy reference entry with the given tail.
#[must_use]
pub fn legacy_key(tail: &[u8]) -> Vec<u8> {
    let mut key = Vec::with_capacity(tail.len() + 1);
    key.push(keys::LEGACY_REFS_PREFIX);
    key.extend_from_slice(tail);
    key
}

impl<S: KvStore, B: Bank> LockupKeeper<S, B> {
    /// Drain the legacy reference layout and re-reference every lock it
    /// named (with its overlays) under the current layout. Stale ids are
    /// dropped. Idempotent: a second run finds nothing to migrate.
    ///
    /// # Errors
    /// `Serialization` on an undecodable legacy value; nothing is written in
    /// that case.
    pub fn migrate_legacy_references(&mut self) -> Result<MigrationReport> {
        let report = self.atomically("migrate_legacy_references", |tx| {
            let entries = tx.store.prefix_scan(&[keys::LEGACY_REFS_PREFIX]);
            let mut ids = BTreeSet::new();
            for (key, value) in &entries {
                let legacy: LegacyRefs = serde_json::from_slice(value)?;
                ids.extend(legacy.ids);
                tx.store.delete(key);
            }

            let mut report = MigrationReport {
                legacy_entries: entries.len(),
                ..MigrationReport::default()
            };
            for id in ids {
                let Some(lock) = records::get_lock(&tx.store, id)? else {
                    tracing::warn!(lock = %id, "Dropping legacy reference to a missing lock");
                    report.stale_ids.push(id);
                    continue;
                };
                // Only the not-unlocking keys of an unlocking lock are
                // computable; a not-unlocking lock has no end time to key by.
                if lock.is_unlocking() {
                    reference::remove_references(&mut tx.store, &lock, LockState::NotUnlocking)?;
                }
                reference::add_references(&mut tx.store, &lock)?;
                for overlay in records::overlays_of_lock(&tx.store, id)? {
                    reference::add_references(
                        &mut tx.store,
                        &OverlayView {
                            overlay: &overlay,
                            owner: &lock.owner,
                        },
                    )?;
                }
                report.locks_reindexed.push(id);
            }
            Ok(report)
        })?;
        tracing::info!(
            entries = report.legacy_entries,
            reindexed = report.locks_reindexed.len(),
            stale = report.stale_ids.len(),
            "Legacy references migrated"
        );
        Ok(report)
    }

    /// Discard every accumulation tree and rebuild from lock and overlay
    /// records. Returns the number of denoms with a non-empty tree.
    ///
    /// # Errors
    /// `InvariantViolation` if a lock carrying overlays is multi-denom;
    /// codec errors on corrupt records.
    pub fn rebuild_accumulation(&mut self) -> Result<usize> {
        let denoms = self.atomically("rebuild_accumulation", |tx| {
            for (key, _) in tx.store.prefix_scan(&accumulation::all_trees_prefix()) {
                tx.store.delete(&key);
            }
            for lock in records::all_locks(&tx.store)? {
                tx.accumulate(&lock.coins, lock.duration, true)?;
                let overlays = records::overlays_of_lock(&tx.store, lock.id)?;
                if overlays.is_empty() {
                    continue;
                }
                let amount = require_overlay_amount(&lock)?;
                for overlay in &overlays {
                    tx.accumulate_overlay(overlay, amount, true)?;
                }
            }
            accumulation::stored_denoms(&tx.store)
        })?;
        tracing::info!(trees = denoms.len(), "Accumulation rebuilt");
        Ok(denoms.len())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::{TimeZone, Utc};
    use chronolock_index::{AccumulationTree, Scope};
    use chronolock_store::MemStore;
    use chronolock_types::{Coins, LockupConfig, Owner, constants};
    use rust_decimal::Decimal;

    use super::*;
    use crate::bank::BalanceManager;

    const HOUR: Duration = Duration::from_secs(3600);

    fn keeper() -> LockupKeeper<MemStore, BalanceManager> {
        let mut bank = BalanceManager::new();
        bank.deposit(&Owner::dummy(1), "stake", Decimal::new(1_000, 0)).unwrap();
        LockupKeeper::new(MemStore::new(), bank, LockupConfig::default()).unwrap()
    }

    fn coins(s: &str) -> Coins {
        s.parse().unwrap()
    }

    /// Strip every reference of the given locks, as if they were written by
    /// a version that only knew the legacy layout.
    fn unindex(keeper: &mut LockupKeeper<MemStore, BalanceManager>, ids: &[LockId]) {
        for id in ids {
            let lock = keeper.lock_by_id(*id).unwrap();
            reference::remove_references(&mut keeper.store, &lock, lock.state()).unwrap();
        }
    }

    #[test]
    fn legacy_entries_are_rekeyed_and_deleted() {
        let mut keeper = keeper();
        let owner = Owner::dummy(1);
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let a = keeper.create_lock(&owner, &coins("10stake"), HOUR).unwrap();
        let b = keeper.create_lock(&owner, &coins("20stake"), 2 * HOUR).unwrap();
        keeper.begin_unlock(b, None, now).unwrap();
        unindex(&mut keeper, &[a, b]);
        assert!(keeper.period_locks().unwrap().is_empty());

        let legacy = |ids: Vec<u64>| {
            serde_json::to_vec(&LegacyRefs {
                ids: ids.into_iter().map(LockId).collect(),
            })
            .unwrap()
        };
        keeper.store.set(&legacy_key(b"global/duration"), &legacy(vec![1, 2]));
        keeper.store.set(&legacy_key(b"owner/stake"), &legacy(vec![2, 99]));

        let report = keeper.migrate_legacy_references().unwrap();
        assert_eq!(report.legacy_entries, 2);
        assert_eq!(report.locks_reindexed, vec![a, b]);
        assert_eq!(report.stale_ids, vec![LockId(99)]);
        assert!(keeper.store().prefix_scan(&[keys::LEGACY_REFS_PREFIX]).is_empty());

        let ids: Vec<LockId> = keeper.period_locks().unwrap().iter().map(|l| l.id).collect();
        assert_eq!(ids, vec![a, b]);
        let unlocking: Vec<LockId> =
            reference::scan_all(keeper.store(), Scope::Owner(&owner), LockState::Unlocking)
                .unwrap();
        assert_eq!(unlocking, vec![b]);
        keeper.check_invariants().unwrap();

        assert_eq!(keeper.migrate_legacy_references().unwrap(), MigrationReport::default());
    }

    #[test]
    fn undecodable_legacy_value_writes_nothing() {
        let mut keeper = keeper();
        keeper.store.set(&legacy_key(b"x"), b"not json");
        let before = keeper.store().digest();
        let err = keeper.migrate_legacy_references().unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(keeper.store().digest(), before);
    }

    #[test]
    fn rebuild_restores_missing_plain_lock_aggregates() {
        let mut keeper = keeper();
        let owner = Owner::dummy(1);
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let id = keeper.create_lock(&owner, &coins("10stake"), HOUR).unwrap();
        keeper.create_lock(&owner, &coins("5stake"), 2 * HOUR).unwrap();
        keeper.create_overlay(id, "stake/val1", HOUR, false, now).unwrap();

        // Simulate plain-lock writes that never reached the tree.
        let tree = AccumulationTree::new("stake", constants::DEFAULT_ACCUMULATION_FANOUT).unwrap();
        tree.decrease(&mut keeper.store, HOUR, Decimal::new(10, 0)).unwrap();
        assert!(keeper.check_invariants().is_err());

        assert_eq!(keeper.rebuild_accumulation().unwrap(), 2);
        assert_eq!(keeper.locked_denom("stake", HOUR).unwrap(), Decimal::new(15, 0));
        assert_eq!(keeper.locked_denom("stake/val1", HOUR).unwrap(), Decimal::new(10, 0));
        keeper.check_invariants().unwrap();
    }
}
