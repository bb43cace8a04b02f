//! Synthetic overlays: classification records layered on an existing lock
//! under a second denomination, indexed and accumulated like a lock but
//! never holding escrow of their own.

use std::time::Duration;

use chrono::{DateTime, Utc};
use chronolock_index::{Scope, reference};
use chronolock_store::KvStore;
use chronolock_types::{
    Lock, LockId, LockState, LockupError, OverlayKey, Owner, Result, SyntheticLock,
    unlock_end_time, validate_denom, validate_duration,
};

use crate::{
    bank::Bank,
    keeper::{LockupKeeper, Tx, require_overlay_amount},
    records,
};

impl<S: KvStore> Tx<'_, S> {
    /// The lock an overlay points at. Its absence means the store is
    /// corrupt, not that the caller asked for something missing.
    fn underlying_lock(&self, key: &OverlayKey) -> Result<Lock> {
        records::get_lock(&self.store, key.lock_id)?.ok_or_else(|| {
            tracing::error!(overlay = %key, "Overlay references a missing lock");
            LockupError::InternalInconsistency {
                reason: format!("overlay {key} references missing {}", key.lock_id),
            }
        })
    }

    pub(crate) fn create_overlay(
        &mut self,
        lock_id: LockId,
        synth_denom: &str,
        duration: Duration,
        start_unlocking: bool,
        now: DateTime<Utc>,
    ) -> Result<SyntheticLock> {
        validate_denom(synth_denom)?;
        validate_duration(duration, self.config.max_lock_duration)?;
        let lock = self.load_lock(lock_id)?;
        if records::has_overlays(&self.store, lock_id) {
            return Err(LockupError::OverlayAlreadyExists(lock_id));
        }
        require_overlay_amount(&lock)?;
        if lock.single_denom() == Some(synth_denom) {
            return Err(LockupError::InvariantViolation {
                reason: format!("overlay denom {synth_denom} equals the real denom of {lock_id}"),
            });
        }
        if start_unlocking && duration > lock.duration {
            return Err(LockupError::OverlayDurationExceedsLock {
                lock_id,
                overlay: duration,
                lock: lock.duration,
            });
        }
        let end_time = if start_unlocking {
            Some(unlock_end_time(now, duration)?)
        } else {
            None
        };
        let overlay = SyntheticLock {
            underlying_lock_id: lock_id,
            synth_denom: synth_denom.to_string(),
            end_time,
            duration,
        };
        self.insert_overlay(&overlay, &lock)?;
        tracing::info!(
            overlay = %overlay.key(),
            owner = %lock.owner,
            ?duration,
            ?end_time,
            "Synthetic overlay created"
        );
        Ok(overlay)
    }

    pub(crate) fn delete_overlay(&mut self, key: &OverlayKey) -> Result<SyntheticLock> {
        let overlay = records::load_overlay(&self.store, key)?;
        let lock = self.underlying_lock(key)?;
        self.remove_overlay(&overlay, &lock)?;
        tracing::info!(overlay = %key, owner = %lock.owner, "Synthetic overlay deleted");
        Ok(overlay)
    }

    pub(crate) fn begin_unlock_overlay(
        &mut self,
        key: &OverlayKey,
        now: DateTime<Utc>,
    ) -> Result<SyntheticLock> {
        let mut overlay = records::load_overlay(&self.store, key)?;
        if overlay.state() == LockState::Unlocking {
            return Err(LockupError::AlreadyUnlocking(key.lock_id));
        }
        let lock = self.underlying_lock(key)?;
        if overlay.duration > lock.duration {
            return Err(LockupError::OverlayDurationExceedsLock {
                lock_id: lock.id,
                overlay: overlay.duration,
                lock: lock.duration,
            });
        }
        overlay.end_time = Some(unlock_end_time(now, overlay.duration)?);
        self.migrate_overlay(&overlay, &lock)?;
        tracing::info!(
            overlay = %key,
            end_time = ?overlay.end_time,
            "Synthetic overlay began unlocking"
        );
        Ok(overlay)
    }

    /// Delete every unlocking overlay whose end time is at or before `now`.
    pub(crate) fn sweep_matured_overlays(&mut self, now: DateTime<Utc>) -> Result<Vec<OverlayKey>> {
        let matured: Vec<OverlayKey> = reference::time_before(&self.store, Scope::Global, now)?;
        for key in &matured {
            self.delete_overlay(key)?;
        }
        Ok(matured)
    }
}

impl<S: KvStore, B: Bank> LockupKeeper<S, B> {
    /// Layer an overlay under `synth_denom` on a single-denom lock.
    ///
    /// With `start_unlocking` the overlay's end time is `now + duration` and
    /// `duration` may not exceed the lock's.
    ///
    /// # Errors
    /// `LockNotFound`, `OverlayAlreadyExists` (one overlay per lock),
    /// `OverlayDurationExceedsLock`, `InvariantViolation` for a multi-denom
    /// lock or a synthetic denom equal to the real one, plus validation
    /// errors for the denom and duration.
    pub fn create_overlay(
        &mut self,
        lock_id: LockId,
        synth_denom: &str,
        duration: Duration,
        start_unlocking: bool,
        now: DateTime<Utc>,
    ) -> Result<SyntheticLock> {
        self.atomically("create_overlay", |tx| {
            tx.create_overlay(lock_id, synth_denom, duration, start_unlocking, now)
        })
    }

    /// Remove an overlay without touching the lock's coins.
    ///
    /// # Errors
    /// `OverlayNotFound`; `InternalInconsistency` if the lock is gone.
    pub fn delete_overlay(&mut self, lock_id: LockId, synth_denom: &str) -> Result<()> {
        let key = OverlayKey::new(lock_id, synth_denom);
        self.atomically("delete_overlay", |tx| tx.delete_overlay(&key).map(|_| ()))
    }

    /// Start the overlay's own unlocking clock.
    ///
    /// # Errors
    /// `OverlayNotFound`, `AlreadyUnlocking`, `OverlayDurationExceedsLock`.
    pub fn begin_unlock_overlay(
        &mut self,
        lock_id: LockId,
        synth_denom: &str,
        now: DateTime<Utc>,
    ) -> Result<SyntheticLock> {
        let key = OverlayKey::new(lock_id, synth_denom);
        self.atomically("begin_unlock_overlay", |tx| tx.begin_unlock_overlay(&key, now))
    }

    /// Delete every matured unlocking overlay.
    ///
    /// # Errors
    /// `InternalInconsistency` if a matured overlay's lock is gone; nothing
    /// is deleted in that case.
    pub fn sweep_matured_overlays(&mut self, now: DateTime<Utc>) -> Result<Vec<OverlayKey>> {
        self.atomically("sweep_matured_overlays", |tx| tx.sweep_matured_overlays(now))
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    /// # Errors
    /// `OverlayNotFound`.
    pub fn overlay(&self, lock_id: LockId, synth_denom: &str) -> Result<SyntheticLock> {
        records::load_overlay(&self.store, &OverlayKey::new(lock_id, synth_denom))
    }

    /// Overlays on one lock, ordered by synthetic denom.
    ///
    /// # Errors
    /// Codec errors on corrupt state.
    pub fn overlays_by_lock(&self, lock_id: LockId) -> Result<Vec<SyntheticLock>> {
        records::overlays_of_lock(&self.store, lock_id)
    }

    /// # Errors
    /// Codec errors on corrupt state.
    pub fn all_overlays(&self) -> Result<Vec<SyntheticLock>> {
        records::all_overlays(&self.store)
    }

    /// Overlays on `owner`'s locks, not-unlocking first.
    ///
    /// # Errors
    /// Codec errors on corrupt state.
    pub fn overlays_by_owner(&self, owner: &Owner) -> Result<Vec<SyntheticLock>> {
        let mut out = Vec::new();
        for partition in LockState::ALL {
            let keys: Vec<OverlayKey> =
                reference::scan_all(&self.store, Scope::Owner(owner), partition)?;
            for key in keys {
                out.push(records::load_overlay(&self.store, &key)?);
            }
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use chronolock_index::AccumulationTree;
    use chronolock_store::MemStore;
    use chronolock_types::{Coins, LockupConfig, constants};
    use rust_decimal::Decimal;

    use super::*;
    use crate::bank::BalanceManager;

    const HOUR: Duration = Duration::from_secs(3600);

    fn t0() -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000, 0).unwrap()
    }

    fn keeper_with_lock(
        coins: &str,
        duration: Duration) -> (LockupKeeper<MemStore,
        BalanceManager>, LockId,
    ) {
        let mut bank = BalanceManager::new();
        let owner = Owner::dummy(1);
        bank.deposit(&owner, "stake", Decimal::new(1_000, 0)).unwrap();
        bank.deposit(&owner, "uosmo", Decimal::new(1_000, 0)).unwrap();
        let mut keeper = LockupKeeper::new(MemStore::new(), bank, LockupConfig::default()).unwrap();
        let coins: Coins = coins.parse().unwrap();
        let id = keeper.create_lock(&owner, &coins, duration).unwrap();
        (keeper, id)
    }

    fn synth_sum(keeper: &LockupKeeper<MemStore, BalanceManager>, denom: &str) -> Decimal {
        AccumulationTree::new(denom, constants::DEFAULT_ACCUMULATION_FANOUT)
            .unwrap()
            .total(keeper.store())
            .unwrap()
    }

    #[test]
    fn create_indexes_and_accumulates_under_synthetic_denom() {
        let (mut keeper, id) = keeper_with_lock("10stake", HOUR);
        let overlay = keeper
            .create_overlay(id, "stake/val1", HOUR, false, t0())
            .unwrap();
        assert!(overlay.end_time.is_none());
        assert_eq!(synth_sum(&keeper, "stake/val1"), Decimal::new(10, 0));
        assert_eq!(keeper.overlays_by_owner(&Owner::dummy(1)).unwrap(), vec![overlay.clone()]);
        assert_eq!(keeper.overlays_by_lock(id).unwrap(), vec![overlay]);
        // The underlying escrow is untouched.
        assert_eq!(keeper.bank().escrow_balance(), "10stake".parse::<Coins>().unwrap());
    }

    #[test]
    fn second_overlay_on_a_lock_is_rejected() {
        let (mut keeper, id) = keeper_with_lock("10stake", HOUR);
        keeper.create_overlay(id, "stake/val1", HOUR, false, t0()).unwrap();
        let err = keeper
            .create_overlay(id, "stake/val2", HOUR, false, t0())
            .unwrap_err();
        assert!(matches!(err, LockupError::OverlayAlreadyExists(l) if l == id));
    }

    #[test]
    fn unlocking_overlay_cannot_outlast_lock() {
        let (mut keeper, id) = keeper_with_lock("10stake", HOUR);
        let err = keeper
            .create_overlay(id, "stake/val1", 2 * HOUR, true, t0())
            .unwrap_err();
        assert!(matches!(err, LockupError::OverlayDurationExceedsLock { .. }));
        // Not-unlocking overlays carry no such promise.
        assert!(keeper.create_overlay(id, "stake/val1", 2 * HOUR, false, t0()).is_ok());
    }

    #[test]
    fn multi_denom_and_same_denom_overlays_are_rejected() {
        let (mut keeper, id) = keeper_with_lock("10stake,5uosmo", HOUR);
        let err = keeper.create_overlay(id, "stake/val1", HOUR, false, t0()).unwrap_err();
        assert!(matches!(err, LockupError::InvariantViolation { .. }));

        let (mut keeper, id) = keeper_with_lock("10stake", HOUR);
        let err = keeper.create_overlay(id, "stake", HOUR, false, t0()).unwrap_err();
        assert!(matches!(err, LockupError::InvariantViolation { .. }));
    }

    #[test]
    fn delete_then_recreate_leaves_no_residue() {
        let (mut keeper, id) = keeper_with_lock("10stake", HOUR);
        keeper.create_overlay(id, "stake/val1", HOUR, true, t0()).unwrap();
        keeper.delete_overlay(id, "stake/val1").unwrap();
        assert_eq!(synth_sum(&keeper, "stake/val1"), Decimal::ZERO);
        assert!(keeper.all_overlays().unwrap().is_empty());
        keeper.create_overlay(id, "stake/val1", HOUR, true, t0()).unwrap();

        let err = keeper.delete_overlay(id, "stake/val9").unwrap_err();
        assert!(matches!(err, LockupError::OverlayNotFound(_)));
    }

    #[test]
    fn begin_unlock_overlay_moves_partition_only() {
        let (mut keeper, id) = keeper_with_lock("10stake", HOUR);
        keeper.create_overlay(id, "stake/val1", HOUR, false, t0()).unwrap();
        let overlay = keeper.begin_unlock_overlay(id, "stake/val1", t0()).unwrap();
        assert_eq!(overlay.state(), LockState::Unlocking);
        assert!(!keeper.lock_by_id(id).unwrap().is_unlocking());
        assert!(matches!(
            keeper.begin_unlock_overlay(id, "stake/val1", t0()),
            Err(LockupError::AlreadyUnlocking(_))
        ));
    }

    #[test]
    fn sweep_deletes_matured_overlays_only() {
        let (mut keeper, id) = keeper_with_lock("10stake", 2 * HOUR);
        keeper.create_overlay(id, "stake/val1", HOUR, true, t0()).unwrap();
        assert!(keeper.sweep_matured_overlays(t0()).unwrap().is_empty());
        let swept = keeper
            .sweep_matured_overlays(t0() + chrono::TimeDelta::hours(1))
            .unwrap();
        assert_eq!(swept, vec![OverlayKey::new(id, "stake/val1")]);
        assert!(keeper.all_overlays().unwrap().is_empty());
        assert!(keeper.lock_by_id(id).is_ok());
    }

    #[test]
    fn dangling_overlay_is_fatal() {
        let (mut keeper, id) = keeper_with_lock("10stake", HOUR);
        keeper.create_overlay(id, "stake/val1", HOUR, true, t0()).unwrap();
        // Corrupt the store by dropping the lock record behind the keeper's back.
        records::delete_lock(&mut keeper.store, id);
        let before = keeper.store().digest();
        let err = keeper
            .sweep_matured_overlays(t0() + chrono::TimeDelta::hours(1))
            .unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(keeper.store().digest(), before);
    }
}
