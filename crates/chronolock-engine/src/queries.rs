//! Read-only composite queries.
//!
//! Each lock query combines a duration window over the not-unlocking
//! partition with an end-time window over the unlocking partition and
//! concatenates the results, not-unlocking first. "Still locked at `now`"
//! means `end_time > now`; "unlockable" means `end_time <= now`.

use std::ops::Bound;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chronolock_index::{Scope, reference};
use chronolock_store::KvStore;
use chronolock_types::{Coins, Lock, LockId, LockState, Owner, Result};
use rust_decimal::Decimal;

use crate::{bank::Bank, keeper::LockupKeeper, records};

type Window<T> = Option<(Bound<T>, Bound<T>)>;

fn everything<T>() -> Window<T> {
    Some((Bound::Unbounded, Bound::Unbounded))
}

/// `t - now`, clamped at zero.
fn ahead(t: DateTime<Utc>, now: DateTime<Utc>) -> Duration {
    (t - now).to_std().unwrap_or(Duration::ZERO)
}

fn total(locks: &[Lock]) -> Coins {
    locks
        .iter()
        .fold(Coins::empty(), |acc, lock| acc.add(&lock.coins))
}

impl<S: KvStore, B: Bank> LockupKeeper<S, B> {
    fn select(
        &self,
        scope: Scope<'_>,
        durations: Window<Duration>,
        end_times: Window<DateTime<Utc>>,
    ) -> Result<Vec<Lock>> {
        let mut ids: Vec<LockId> = Vec::new();
        if let Some((lo, hi)) = durations {
            ids.extend(reference::scan_duration::<LockId>(
                &self.store,
                scope,
                LockState::NotUnlocking,
                lo,
                hi,
            )?);
        }
        if let Some((lo, hi)) = end_times {
            ids.extend(reference::scan_time::<LockId>(
                &self.store,
                scope,
                LockState::Unlocking,
                lo,
                hi,
            )?);
        }
        ids.into_iter()
            .map(|id| records::load_lock(&self.store, id))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Records
    // -----------------------------------------------------------------------

    /// # Errors
    /// `LockNotFound`.
    pub fn lock_by_id(&self, id: LockId) -> Result<Lock> {
        records::load_lock(&self.store, id)
    }

    /// Highest lock id assigned so far (zero before the first lock).
    ///
    /// # Errors
    /// `InternalInconsistency` on a corrupt counter.
    pub fn last_lock_id(&self) -> Result<LockId> {
        records::last_lock_id(&self.store)
    }

    /// Every lock, not-unlocking first.
    ///
    /// # Errors
    /// Codec errors on corrupt state.
    pub fn period_locks(&self) -> Result<Vec<Lock>> {
        self.select(Scope::Global, everything(), everything())
    }

    /// Every lock of `owner`, not-unlocking first.
    ///
    /// # Errors
    /// Codec errors on corrupt state.
    pub fn account_period_locks(&self, owner: &Owner) -> Result<Vec<Lock>> {
        self.select(Scope::Owner(owner), everything(), everything())
    }

    // -----------------------------------------------------------------------
    // Balances
    // -----------------------------------------------------------------------

    /// Everything held in escrow.
    #[must_use]
    pub fn module_balance(&self) -> Coins {
        self.bank.escrow_balance()
    }

    /// Coins not yet unlockable at `now`, across every owner.
    ///
    /// # Errors
    /// Codec errors on corrupt state.
    pub fn module_locked_coins(&self, now: DateTime<Utc>) -> Result<Coins> {
        let locks = self.select(
            Scope::Global,
            everything(),
            Some((Bound::Excluded(now), Bound::Unbounded)),
        )?;
        Ok(total(&locks))
    }

    /// # Errors
    /// Codec errors on corrupt state.
    pub fn account_locked_coins(&self, owner: &Owner, now: DateTime<Utc>) -> Result<Coins> {
        let locks = self.select(
            Scope::Owner(owner),
            everything(),
            Some((Bound::Excluded(now), Bound::Unbounded)),
        )?;
        Ok(total(&locks))
    }

    /// Coins of `owner` that began unlocking and have not matured.
    ///
    /// # Errors
    /// Codec errors on corrupt state.
    pub fn account_unlocking_coins(&self, owner: &Owner, now: DateTime<Utc>) -> Result<Coins> {
        let locks = self.select(
            Scope::Owner(owner),
            None,
            Some((Bound::Excluded(now), Bound::Unbounded)),
        )?;
        Ok(total(&locks))
    }

    /// Coins of `owner` that could be finalized at `now`.
    ///
    /// # Errors
    /// Codec errors on corrupt state.
    pub fn account_unlockable_coins(&self, owner: &Owner, now: DateTime<Utc>) -> Result<Coins> {
        let locks = self.select(
            Scope::Owner(owner),
            None,
            Some((Bound::Unbounded, Bound::Included(now))),
        )?;
        Ok(total(&locks))
    }

    /// Sum of `denom` committed for at least `min_duration`, from the
    /// accumulation tree. Includes overlays accumulated under `denom`.
    ///
    /// # Errors
    /// Codec errors on corrupt tree nodes.
    pub fn locked_denom(&self, denom: &str, min_duration: Duration) -> Result<Decimal> {
        chronolock_index::AccumulationTree::new(denom, self.config.accumulation_fanout)?
            .subset_sum(&self.store, min_duration)
    }

    // -----------------------------------------------------------------------
    // Locked past a time
    // -----------------------------------------------------------------------

    fn locked_past_time(
        &self,
        scope: Scope<'_>,
        t: DateTime<Utc>,
        now: DateTime<Utc>,
        unlocking: bool,
    ) -> Result<Vec<Lock>> {
        let durations = Some((Bound::Included(ahead(t, now)), Bound::Unbounded));
        let end_times = unlocking.then_some((Bound::Included(t), Bound::Unbounded));
        self.select(scope, durations, end_times)
    }

    /// Locks of `owner` still locked at `t`: unlocking ones ending at or
    /// after `t`, plus not-unlocking ones whose duration reaches past `t`
    /// if they began unlocking at `now`.
    ///
    /// # Errors
    /// Codec errors on corrupt state.
    pub fn account_locked_past_time(
        &self,
        owner: &Owner,
        t: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lock>> {
        self.locked_past_time(Scope::Owner(owner), t, now, true)
    }

    /// # Errors
    /// Codec errors on corrupt state.
    pub fn account_locked_past_time_denom(
        &self,
        owner: &Owner,
        denom: &str,
        t: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lock>> {
        self.locked_past_time(Scope::OwnerDenom(owner, denom), t, now, true)
    }

    /// # Errors
    /// Codec errors on corrupt state.
    pub fn account_locked_past_time_not_unlocking_only(
        &self,
        owner: &Owner,
        t: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lock>> {
        self.locked_past_time(Scope::Owner(owner), t, now, false)
    }

    /// # Errors
    /// Codec errors on corrupt state.
    pub fn locks_past_time_denom(
        &self,
        denom: &str,
        t: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lock>> {
        self.locked_past_time(Scope::Denom(denom), t, now, true)
    }

    /// Locks of `owner` that would be unlocked before `t`: unlocking ones
    /// ending at or before `t`, plus (for `t >= now`) not-unlocking ones
    /// strictly shorter than `t - now`.
    ///
    /// # Errors
    /// Codec errors on corrupt state.
    pub fn account_unlocked_before_time(
        &self,
        owner: &Owner,
        t: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Vec<Lock>> {
        let scope = Scope::Owner(owner);
        let mut ids: Vec<LockId> = if t >= now {
            reference::duration_shorter_than(&self.store, scope, ahead(t, now))?
        } else {
            Vec::new()
        };
        ids.extend(reference::time_before::<LockId>(&self.store, scope, t)?);
        ids.into_iter()
            .map(|id| records::load_lock(&self.store, id))
            .collect()
    }

    // -----------------------------------------------------------------------
    // Locked longer than a duration
    // -----------------------------------------------------------------------

    fn longer_than(&self, scope: Scope<'_>, d: Duration, unlocking: bool) -> Result<Vec<Lock>> {
        let mut locks = reference::duration_at_or_longer::<LockId>(&self.store, scope, d)?;
        if unlocking {
            locks.extend(reference::scan_duration::<LockId>(
                &self.store,
                scope,
                LockState::Unlocking,
                Bound::Included(d),
                Bound::Unbounded,
            )?);
        }
        locks
            .into_iter()
            .map(|id| records::load_lock(&self.store, id))
            .collect()
    }

    /// Locks of `owner` in either partition with duration at least `d`.
    ///
    /// # Errors
    /// Codec errors on corrupt state.
    pub fn account_locked_longer_duration(&self, owner: &Owner, d: Duration) -> Result<Vec<Lock>> {
        self.longer_than(Scope::Owner(owner), d, true)
    }

    /// # Errors
    /// Codec errors on corrupt state.
    pub fn account_locked_longer_duration_denom(
        &self,
        owner: &Owner,
        denom: &str,
        d: Duration,
    ) -> Result<Vec<Lock>> {
        self.longer_than(Scope::OwnerDenom(owner, denom), d, true)
    }

    /// # Errors
    /// Codec errors on corrupt state.
    pub fn account_locked_longer_duration_not_unlocking_only(
        &self,
        owner: &Owner,
        d: Duration,
    ) -> Result<Vec<Lock>> {
        self.longer_than(Scope::Owner(owner), d, false)
    }

    /// Not-unlocking locks of `owner` in `denom` with exactly duration `d`.
    ///
    /// # Errors
    /// Codec errors on corrupt state.
    pub fn account_locked_duration_not_unlocking_only(
        &self,
        owner: &Owner,
        denom: &str,
        d: Duration,
    ) -> Result<Vec<Lock>> {
        self.select(
            Scope::OwnerDenom(owner, denom),
            Some((Bound::Included(d), Bound::Included(d))),
            None,
        )
    }

    /// # Errors
    /// Codec errors on corrupt state.
    pub fn locks_longer_than_duration_denom(&self, denom: &str, d: Duration) -> Result<Vec<Lock>> {
        self.longer_than(Scope::Denom(denom), d, true)
    }
}
