//! Lock lifecycle: create, top up, begin unlock, finalize, and the
//! administrative relock / break / force-unlock / slash paths.
//!
//! State machine per lock: `NotUnlocking -> Unlocking -> (deleted)`.

use std::time::Duration;

use chrono::{DateTime, Utc};
use chronolock_index::{Scope, reference};
use chronolock_store::KvStore;
use chronolock_types::{
    Coin, Coins, Lock, LockId, LockState, LockupError, Owner, Result, unlock_end_time,
    validate_duration,
};

use crate::{
    bank::Bank,
    keeper::{LockupKeeper, Tx},
    records,
};

fn require_coins(coins: &Coins) -> Result<()> {
    if coins.is_empty() {
        return Err(LockupError::InvalidCoins {
            reason: "empty coins".into(),
        });
    }
    Ok(())
}

fn insufficient(lock: &Lock, requested: &Coins) -> LockupError {
    LockupError::InsufficientLocked {
        lock_id: lock.id,
        held: lock.coins.to_string(),
        requested: requested.to_string(),
    }
}

/// `Some(coins)` only for a genuine partial amount: non-empty and different
/// from everything the lock holds.
fn partial<'c>(lock: &Lock, coins: Option<&'c Coins>) -> Option<&'c Coins> {
    coins.filter(|c| !c.is_empty() && **c != lock.coins)
}

// ---------------------------------------------------------------------------
// Transaction-level steps
// ---------------------------------------------------------------------------

impl<S: KvStore> Tx<'_, S> {
    pub(crate) fn create_lock(
        &mut self,
        owner: &Owner,
        coins: &Coins,
        duration: Duration,
    ) -> Result<Lock> {
        require_coins(coins)?;
        validate_duration(duration, self.config.max_lock_duration)?;
        let id = records::next_lock_id(&mut self.store)?;
        let lock = Lock::new(id, owner.clone(), duration, coins.clone());
        self.insert_lock(&lock)?;
        self.deposit(owner, coins);
        tracing::info!(lock = %id, %owner, %coins, ?duration, "Lock created");
        Ok(lock)
    }

    /// Lowest-id not-unlocking lock of `owner` holding only `denom` with
    /// exactly `duration`.
    pub(crate) fn find_lock(
        &self,
        owner: &Owner,
        denom: &str,
        duration: Duration,
    ) -> Result<Option<Lock>> {
        let ids: Vec<LockId> = reference::scan_duration(
            &self.store,
            Scope::OwnerDenom(owner, denom),
            LockState::NotUnlocking,
            std::ops::Bound::Included(duration),
            std::ops::Bound::Included(duration),
        )?;
        for id in ids {
            let lock = self.load_lock(id)?;
            if lock.single_denom() == Some(denom) {
                return Ok(Some(lock));
            }
        }
        Ok(None)
    }

    pub(crate) fn add_tokens(&mut self, id: LockId, owner: &Owner, coins: &Coins) -> Result<Lock> {
        require_coins(coins)?;
        let lock = self.load_lock(id)?;
        if lock.owner != *owner {
            return Err(LockupError::NotOwner(id));
        }
        let mut topped = lock.clone();
        topped.coins = lock.coins.add(coins);
        self.replace_lock(&lock, &topped)?;
        self.deposit(owner, coins);
        tracing::info!(
            lock = %id,
            %owner,
            added = %coins,
            total = %topped.coins,
            "Tokens added to lock"
        );
        Ok(topped)
    }

    /// Start the unlocking clock on the whole lock.
    pub(crate) fn begin_unlock_whole(&mut self, lock: &Lock, now: DateTime<Utc>) -> Result<Lock> {
        if lock.is_unlocking() {
            return Err(LockupError::AlreadyUnlocking(lock.id));
        }
        let mut unlocking = lock.clone();
        unlocking.end_time = Some(unlock_end_time(now, lock.duration)?);
        records::put_lock(&mut self.store, &unlocking)?;
        reference::migrate_partition(&mut self.store, &unlocking, LockState::NotUnlocking)?;
        tracing::info!(
            lock = %lock.id,
            owner = %lock.owner,
            coins = %lock.coins,
            end_time = ?unlocking.end_time,
            "Lock began unlocking"
        );
        Ok(unlocking)
    }

    /// Begin unlocking `coins` of the lock, splitting them into a fresh
    /// lock when they are less than the whole. Returns the unlocking lock.
    pub(crate) fn begin_unlock(
        &mut self,
        id: LockId,
        coins: Option<&Coins>,
        now: DateTime<Utc>,
    ) -> Result<Lock> {
        let lock = self.load_lock(id)?;
        if lock.is_unlocking() {
            return Err(LockupError::AlreadyUnlocking(id));
        }
        let Some(coins) = partial(&lock, coins) else {
            return self.begin_unlock_whole(&lock, now);
        };
        if records::has_overlays(&self.store, id) {
            return Err(LockupError::LockHasOverlays(id));
        }
        let remainder = lock
            .coins
            .checked_sub(coins)
            .ok_or_else(|| insufficient(&lock, coins))?;

        let mut kept = lock.clone();
        kept.coins = remainder;
        self.replace_lock(&lock, &kept)?;

        let split_id = records::next_lock_id(&mut self.store)?;
        let split = Lock::new(split_id, lock.owner.clone(), lock.duration, coins.clone());
        self.insert_lock(&split)?;
        tracing::info!(
            lock = %id,
            split = %split_id,
            coins = %coins,
            "Lock split for partial unlock"
        );
        self.begin_unlock_whole(&split, now)
    }

    /// Release a matured lock back to its owner.
    pub(crate) fn finalize_unlock(&mut self, id: LockId, now: DateTime<Utc>) -> Result<Lock> {
        let lock = self.load_lock(id)?;
        let Some(end_time) = lock.end_time else {
            return Err(LockupError::NotUnlocking(id));
        };
        if now < end_time {
            return Err(LockupError::NotMature {
                lock_id: id,
                end_time,
                now,
            });
        }
        let overlays = self.remove_lock_cascading(&lock)?;
        self.payout(&lock.owner, &lock.coins);
        tracing::info!(
            lock = %id,
            owner = %lock.owner,
            coins = %lock.coins,
            overlays = overlays.len(),
            "Lock unlocked"
        );
        Ok(lock)
    }

    /// Release a lock in either partition, ignoring maturity.
    pub(crate) fn break_lock(&mut self, id: LockId) -> Result<Lock> {
        let lock = self.load_lock(id)?;
        let overlays = self.remove_lock_cascading(&lock)?;
        self.payout(&lock.owner, &lock.coins);
        tracing::info!(
            lock = %id,
            owner = %lock.owner,
            coins = %lock.coins,
            partition = %lock.state(),
            overlays = overlays.len(),
            "Lock broken"
        );
        Ok(lock)
    }
}

// ---------------------------------------------------------------------------
// Public entry points
// ---------------------------------------------------------------------------

impl<S: KvStore, B: Bank> LockupKeeper<S, B> {
    /// Escrow `coins` from `owner` into a new not-unlocking lock.
    ///
    /// # Errors
    /// `InvalidCoins`/`InvalidDuration` on bad input, `InsufficientBalance`
    /// if the owner cannot fund the escrow.
    pub fn create_lock(
        &mut self,
        owner: &Owner,
        coins: &Coins,
        duration: Duration,
    ) -> Result<LockId> {
        self.atomically("create_lock", |tx| {
            tx.create_lock(owner, coins, duration).map(|lock| lock.id)
        })
    }

    /// Add to the owner's matching lock if one exists, otherwise create one.
    ///
    /// A lock matches when it is not unlocking, holds only the coin's denom
    /// and has exactly `duration`. Multi-denom `coins` always create.
    ///
    /// # Errors
    /// As [`LockupKeeper::create_lock`].
    pub fn lock_tokens(
        &mut self,
        owner: &Owner,
        coins: &Coins,
        duration: Duration,
    ) -> Result<LockId> {
        self.atomically("lock_tokens", |tx| {
            if let Some(coin) = coins.as_single() {
                validate_duration(duration, tx.config.max_lock_duration)?;
                if let Some(existing) = tx.find_lock(owner, &coin.denom, duration)? {
                    return tx.add_tokens(existing.id, owner, coins).map(|lock| lock.id);
                }
            }
            tx.create_lock(owner, coins, duration).map(|lock| lock.id)
        })
    }

    /// Whether `owner` has a lock [`LockupKeeper::lock_tokens`] would add to.
    ///
    /// # Errors
    /// Codec errors on corrupt state.
    pub fn has_lock(&self, owner: &Owner, denom: &str, duration: Duration) -> Result<bool> {
        Ok(self.find_lock(owner, denom, duration)?.is_some())
    }

    /// The lock [`LockupKeeper::lock_tokens`] would add to, if any.
    ///
    /// # Errors
    /// Codec errors on corrupt state.
    pub fn find_lock(
        &self,
        owner: &Owner,
        denom: &str,
        duration: Duration,
    ) -> Result<Option<LockId>> {
        let tx = Tx::new(&self.store, &self.config);
        Ok(tx.find_lock(owner, denom, duration)?.map(|lock| lock.id))
    }

    /// Top up the owner's matching lock. `None` if there is none.
    ///
    /// # Errors
    /// `InsufficientBalance` if the owner cannot fund the escrow.
    pub fn add_to_existing_lock(
        &mut self,
        owner: &Owner,
        coin: &Coin,
        duration: Duration,
    ) -> Result<Option<LockId>> {
        let coins = Coins::from(coin.clone());
        self.atomically("add_to_existing_lock", |tx| {
            match tx.find_lock(owner, &coin.denom, duration)? {
                Some(lock) => tx.add_tokens(lock.id, owner, &coins).map(|l| Some(l.id)),
                None => Ok(None),
            }
        })
    }

    /// Escrow more coins into an existing lock, in either partition.
    ///
    /// Denom-scoped references are rewritten when the lock gains a denom.
    ///
    /// # Errors
    /// `LockNotFound`, `NotOwner`, `InsufficientBalance`, or
    /// `InvariantViolation` when a lock carrying overlays would become
    /// multi-denom.
    pub fn add_tokens_to_lock(&mut self, id: LockId, owner: &Owner, coins: &Coins) -> Result<Lock> {
        self.atomically("add_tokens_to_lock", |tx| tx.add_tokens(id, owner, coins))
    }

    /// Begin unlocking a lock, or only `coins` of it.
    ///
    /// A partial amount is split into a new lock (next id, same owner and
    /// duration) which begins unlocking while the original keeps the rest.
    /// Returns the id of the lock that is now unlocking.
    ///
    /// # Errors
    /// `LockNotFound`, `AlreadyUnlocking`, `InsufficientLocked` for more
    /// than the lock holds, `LockHasOverlays` for a partial unlock of a lock
    /// carrying overlays.
    pub fn begin_unlock(
        &mut self,
        id: LockId,
        coins: Option<&Coins>,
        now: DateTime<Utc>,
    ) -> Result<LockId> {
        self.atomically("begin_unlock", |tx| {
            tx.begin_unlock(id, coins, now).map(|lock| lock.id)
        })
    }

    /// Begin unlocking every not-unlocking lock of `owner`, shortest
    /// duration first. Returns the locks as they are after the transition.
    ///
    /// # Errors
    /// `InvalidDuration` if some end time would overflow; nothing is
    /// applied in that case.
    pub fn begin_unlock_all(&mut self, owner: &Owner, now: DateTime<Utc>) -> Result<Vec<Lock>> {
        self.atomically("begin_unlock_all", |tx| {
            let ids: Vec<LockId> =
                reference::scan_all(&tx.store, Scope::Owner(owner), LockState::NotUnlocking)?;
            let mut unlocked = Vec::with_capacity(ids.len());
            for id in ids {
                let lock = tx.load_lock(id)?;
                unlocked.push(tx.begin_unlock_whole(&lock, now)?);
            }
            Ok(unlocked)
        })
    }

    /// Return a matured lock's coins to its owner and delete it, together
    /// with any overlays still on it.
    ///
    /// # Errors
    /// `LockNotFound`, `NotUnlocking`, or `NotMature` if `now < end_time`.
    pub fn finalize_unlock(&mut self, id: LockId, now: DateTime<Utc>) -> Result<Coins> {
        self.atomically("finalize_unlock", |tx| {
            tx.finalize_unlock(id, now).map(|lock| lock.coins)
        })
    }

    /// Finalize every matured lock of `owner`.
    ///
    /// # Errors
    /// Fatal errors only; every scanned lock is matured by construction.
    pub fn unlock_all_unlockable(
        &mut self,
        owner: &Owner,
        now: DateTime<Utc>,
    ) -> Result<(Vec<LockId>, Coins)> {
        self.atomically("unlock_all_unlockable", |tx| {
            let ids: Vec<LockId> = reference::time_before(&tx.store, Scope::Owner(owner), now)?;
            let mut total = Coins::empty();
            for id in &ids {
                total = total.add(&tx.finalize_unlock(*id, now)?.coins);
            }
            Ok((ids, total))
        })
    }

    /// Administrative: swap a lock's coins for `new_coins`, keeping its id,
    /// duration and end time. The old coins go back to the owner and the new
    /// ones are escrowed from them.
    ///
    /// # Errors
    /// `LockNotFound`, `InvalidCoins`, `InsufficientBalance`, or
    /// `InvariantViolation` when a lock carrying overlays would become
    /// multi-denom.
    pub fn admin_relock(&mut self, id: LockId, new_coins: &Coins) -> Result<()> {
        self.atomically("admin_relock", |tx| {
            require_coins(new_coins)?;
            let lock = tx.load_lock(id)?;
            let mut relocked = lock.clone();
            relocked.coins = new_coins.clone();
            tx.replace_lock(&lock, &relocked)?;
            tx.deposit(&lock.owner, new_coins);
            tx.payout(&lock.owner, &lock.coins);
            tracing::info!(
                lock = %id,
                owner = %lock.owner,
                old = %lock.coins,
                new = %new_coins,
                "Lock relocked"
            );
            Ok(())
        })
    }

    /// Administrative: release a lock immediately whatever its partition or
    /// maturity, deleting its overlays first.
    ///
    /// # Errors
    /// `LockNotFound`.
    pub fn admin_break_lock(&mut self, id: LockId) -> Result<Coins> {
        self.atomically("admin_break_lock", |tx| {
            tx.break_lock(id).map(|lock| lock.coins)
        })
    }

    /// Self-service early release for owners on the force-unlock allow list.
    ///
    /// With `coins` less than the whole lock, only those coins are released
    /// and the lock keeps the remainder. Returns the released coins.
    ///
    /// # Errors
    /// `NotOwner` if `sender` does not own the lock, `Unauthorized` if the
    /// owner is not allow-listed, `LockHasOverlays`, `InsufficientLocked`.
    pub fn force_unlock(
        &mut self,
        sender: &Owner,
        id: LockId,
        coins: Option<&Coins>,
    ) -> Result<Coins> {
        let allowed = self.config.is_force_unlock_allowed(sender);
        self.atomically("force_unlock", |tx| {
            let lock = tx.load_lock(id)?;
            if lock.owner != *sender {
                return Err(LockupError::NotOwner(id));
            }
            if !allowed {
                tracing::warn!(
                    lock = %id,
                    %sender,
                    "Force unlock refused: sender not allow-listed"
                );
                return Err(LockupError::Unauthorized {
                    reason: format!("{sender} may not force unlock"),
                });
            }
            if records::has_overlays(&tx.store, id) {
                return Err(LockupError::LockHasOverlays(id));
            }
            let Some(coins) = partial(&lock, coins) else {
                return tx.break_lock(id).map(|lock| lock.coins);
            };
            let remainder = lock
                .coins
                .checked_sub(coins)
                .ok_or_else(|| insufficient(&lock, coins))?;
            let mut kept = lock.clone();
            kept.coins = remainder;
            tx.replace_lock(&lock, &kept)?;
            tx.payout(&lock.owner, coins);
            tracing::info!(
                lock = %id,
                owner = %lock.owner,
                released = %coins,
                "Lock partially force unlocked"
            );
            Ok(coins.clone())
        })
    }

    /// Lengthen a not-unlocking lock's duration.
    ///
    /// # Errors
    /// `NotOwner`, `AlreadyUnlocking`, `LockHasOverlays`, `InvalidDuration`,
    /// or `DurationNotExtended` unless `new_duration` is strictly longer.
    pub fn extend_lockup(
        &mut self,
        owner: &Owner,
        id: LockId,
        new_duration: Duration,
    ) -> Result<()> {
        self.atomically("extend_lockup", |tx| {
            let lock = tx.load_lock(id)?;
            if lock.owner != *owner {
                return Err(LockupError::NotOwner(id));
            }
            if lock.is_unlocking() {
                return Err(LockupError::AlreadyUnlocking(id));
            }
            if records::has_overlays(&tx.store, id) {
                return Err(LockupError::LockHasOverlays(id));
            }
            validate_duration(new_duration, tx.config.max_lock_duration)?;
            if new_duration <= lock.duration {
                return Err(LockupError::DurationNotExtended {
                    lock_id: id,
                    current: lock.duration,
                    requested: new_duration,
                });
            }
            let mut extended = lock.clone();
            extended.duration = new_duration;
            tx.replace_lock(&lock, &extended)?;
            tracing::info!(
                lock = %id,
                %owner,
                from = ?lock.duration,
                to = ?new_duration,
                "Lockup extended"
            );
            Ok(())
        })
    }

    /// Remove `coins` from a lock and pay them to `recipient`. A lock slashed
    /// to nothing is deleted along with its overlays.
    ///
    /// # Errors
    /// `LockNotFound`, `InvalidCoins`, or `InsufficientLocked` if the lock
    /// does not hold every coin.
    pub fn slash_tokens(&mut self, id: LockId, coins: &Coins, recipient: &Owner) -> Result<()> {
        self.atomically("slash_tokens", |tx| {
            require_coins(coins)?;
            let lock = tx.load_lock(id)?;
            let remainder = lock
                .coins
                .checked_sub(coins)
                .ok_or_else(|| insufficient(&lock, coins))?;
            if remainder.is_empty() {
                tx.remove_lock_cascading(&lock)?;
            } else {
                let mut kept = lock.clone();
                kept.coins = remainder;
                tx.replace_lock(&lock, &kept)?;
            }
            tx.payout(recipient, coins);
            tracing::warn!(
                lock = %id,
                owner = %lock.owner,
                slashed = %coins,
                %recipient,
                "Lock slashed"
            );
            Ok(())
        })
    }
}
