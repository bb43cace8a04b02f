//! Whole-store consistency checks.
//!
//! Run from tests, optionally after every maturity sweep, and by operators
//! after a migration. Every check reads only; a failure is reported as
//! `StoreInvariantBroken` naming the first discrepancy found.

use std::{
    collections::{BTreeMap, BTreeSet},
    ops::Bound,
    time::Duration,
};

use chronolock_index::{AccumulationTree, OverlayView, Scope, accumulation, keys, reference};
use chronolock_store::KvStore;
use chronolock_types::{Coins, Lock, LockId, LockState, LockupError, Result, SyntheticLock};
use rust_decimal::Decimal;

use crate::{
    bank::Bank,
    keeper::{LockupKeeper, overlay_amount},
    records,
};

fn broken(reason: String) -> LockupError {
    tracing::error!(%reason, "Store invariant broken");
    LockupError::StoreInvariantBroken { reason }
}

type Expected = BTreeMap<String, BTreeMap<Duration, Decimal>>;

fn credit(expected: &mut Expected, denom: &str, duration: Duration, amount: Decimal) {
    *expected
        .entry(denom.to_string())
        .or_default()
        .entry(duration)
        .or_insert(Decimal::ZERO) += amount;
}

impl<S: KvStore, B: Bank> LockupKeeper<S, B> {
    /// Verify every structural property of the store:
    ///
    /// 1. every lock id is at or below the id high-water mark
    /// 2. every overlay points at an existing single-denom lock, one per lock
    /// 3. the reference key space is exactly the union of every record's
    ///    references under its own partition
    /// 4. the global scans of both partitions together list each lock once
    /// 5. every accumulation tree is well formed and matches the records
    /// 6. escrow equals the sum of all lock coins
    ///
    /// # Errors
    /// `StoreInvariantBroken` on the first failed property; codec errors on
    /// corrupt records.
    pub fn check_invariants(&self) -> Result<()> {
        let locks = records::all_locks(&self.store)?;
        let overlays = records::all_overlays(&self.store)?;
        self.check_ids(&locks)?;
        let by_id = check_overlays(&locks, &overlays)?;
        self.check_references(&locks, &overlays, &by_id)?;
        self.check_partitions(&locks)?;
        self.check_accumulation(&locks, &overlays, &by_id)?;
        self.check_escrow(&locks)?;
        tracing::debug!(locks = locks.len(), overlays = overlays.len(), "Invariants hold");
        Ok(())
    }

    fn check_escrow(&self, locks: &[Lock]) -> Result<()> {
        let locked = locks
            .iter()
            .fold(Coins::empty(), |acc, lock| acc.add(&lock.coins));
        let escrow = self.bank.escrow_balance();
        if locked != escrow {
            return Err(broken(format!("escrow holds {escrow}, locks hold {locked}")));
        }
        Ok(())
    }

    fn check_ids(&self, locks: &[Lock]) -> Result<()> {
        let last = records::last_lock_id(&self.store)?;
        if let Some(lock) = locks.iter().find(|lock| lock.id > last) {
            return Err(broken(format!("{} is above the last assigned id {last}", lock.id)));
        }
        Ok(())
    }

    fn check_references(
        &self,
        locks: &[Lock],
        overlays: &[SyntheticLock],
        by_id: &BTreeMap<LockId, &Lock>,
    ) -> Result<()> {
        let mut expected = BTreeSet::new();
        for lock in locks {
            expected.extend(reference::reference_keys(lock, lock.state())?);
        }
        for overlay in overlays {
            let Some(lock) = by_id.get(&overlay.underlying_lock_id) else {
                continue;
            };
            let view = OverlayView {
                overlay,
                owner: &lock.owner,
            };
            expected.extend(reference::reference_keys(&view, overlay.state())?);
        }

        let lower = [keys::LOCK_REFS_PREFIX];
        let upper = [keys::OVERLAY_REFS_PREFIX + 2];
        let actual: BTreeSet<Vec<u8>> = self
            .store
            .range(Bound::Included(&lower[..]), Bound::Excluded(&upper[..]))
            .into_iter()
            .map(|(key, _)| key)
            .collect();

        if let Some(missing) = expected.difference(&actual).next() {
            return Err(broken(format!("reference {missing:02x?} is missing")));
        }
        if let Some(extra) = actual.difference(&expected).next() {
            return Err(broken(format!("reference {extra:02x?} has no record")));
        }
        Ok(())
    }

    fn check_partitions(&self, locks: &[Lock]) -> Result<()> {
        let mut seen: BTreeMap<LockId, LockState> = BTreeMap::new();
        for partition in LockState::ALL {
            let ids: Vec<LockId> = reference::scan_all(&self.store, Scope::Global, partition)?;
            for id in ids {
                if let Some(other) = seen.insert(id, partition) {
                    return Err(broken(format!(
                        "{id} is referenced as both {other} and {partition}"
                    )));
                }
            }
        }
        for lock in locks {
            match seen.remove(&lock.id) {
                Some(partition) if partition == lock.state() => {}
                Some(partition) => {
                    return Err(broken(format!(
                        "{} is {} but referenced as {partition}",
                        lock.id,
                        lock.state()
                    )));
                }
                None => return Err(broken(format!("{} is not referenced", lock.id))),
            }
        }
        if let Some(id) = seen.keys().next() {
            return Err(broken(format!("{id} is referenced but has no record")));
        }
        Ok(())
    }

    fn check_accumulation(
        &self,
        locks: &[Lock],
        overlays: &[SyntheticLock],
        by_id: &BTreeMap<LockId, &Lock>,
    ) -> Result<()> {
        let mut expected = Expected::new();
        for lock in locks {
            for coin in lock.coins.iter() {
                credit(&mut expected, &coin.denom, lock.duration, coin.amount);
            }
        }
        for overlay in overlays {
            if let Some(amount) = by_id
                .get(&overlay.underlying_lock_id)
                .and_then(|lock| overlay_amount(lock))
            {
                credit(&mut expected, &overlay.synth_denom, overlay.duration, amount);
            }
        }

        let mut denoms: BTreeSet<String> = expected.keys().cloned().collect();
        denoms.extend(accumulation::stored_denoms(&self.store)?);
        for denom in denoms {
            let tree = AccumulationTree::new(&denom, self.config.accumulation_fanout)?;
            tree.verify(&self.store)
                .map_err(|err| broken(format!("tree {denom}: {err}")))?;
            let stored = tree.entries(&self.store)?;
            let wanted: Vec<(Duration, Decimal)> = expected
                .get(&denom)
                .map(|entries| entries.iter().map(|(d, a)| (*d, *a)).collect())
                .unwrap_or_default();
            if stored != wanted {
                return Err(broken(format!(
                    "tree {denom} holds {stored:?}, records give {wanted:?}"
                )));
            }
        }
        Ok(())
    }
}

fn check_overlays<'a>(
    locks: &'a [Lock],
    overlays: &[SyntheticLock],
) -> Result<BTreeMap<LockId, &'a Lock>> {
    let by_id: BTreeMap<LockId, &Lock> = locks.iter().map(|lock| (lock.id, lock)).collect();
    let mut per_lock: BTreeMap<LockId, usize> = BTreeMap::new();
    for overlay in overlays {
        let key = overlay.key();
        let Some(lock) = by_id.get(&overlay.underlying_lock_id) else {
            return Err(broken(format!("overlay {key} references a missing lock")));
        };
        if overlay_amount(lock).is_none() {
            return Err(broken(format!("overlay {key} sits on multi-denom {}", lock.id)));
        }
        let count = per_lock.entry(lock.id).or_insert(0);
        *count += 1;
        if *count > 1 {
            return Err(broken(format!("{} carries more than one overlay", lock.id)));
        }
    }
    Ok(by_id)
}
