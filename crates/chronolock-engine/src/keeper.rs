//! The lock keeper: owner of the key-value store, the escrow collaborator
//! and the configuration, and the transaction boundary every mutating
//! operation runs inside.
//!
//! A mutating operation is a closure over a [`Tx`]. The transaction stages
//! store writes in a [`CacheStore`] and records escrow movements instead of
//! performing them. Only when the closure succeeds are the escrow transfers
//! executed (deposits first, then payouts) and the write batch committed.
//! Any error before that point leaves both the store and the bank untouched.

use std::time::Duration;

use chronolock_index::{AccumulationTree, OverlayView, reference};
use chronolock_store::{CacheStore, KvStore};
use chronolock_types::{
    Coins, Lock, LockId, LockState, LockupConfig, LockupError, OverlayKey, Owner, Result,
    SyntheticLock,
};
use rust_decimal::Decimal;

use crate::{bank::Bank, records};

// ---------------------------------------------------------------------------
// LockupKeeper
// ---------------------------------------------------------------------------

pub struct LockupKeeper<S: KvStore, B: Bank> {
    pub(crate) store: S,
    pub(crate) bank: B,
    pub(crate) config: LockupConfig,
}

impl<S: KvStore, B: Bank> LockupKeeper<S, B> {
    /// # Errors
    /// `Configuration` if `config` fails validation.
    pub fn new(store: S, bank: B, config: LockupConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            store,
            bank,
            config,
        })
    }

    #[must_use]
    pub fn store(&self) -> &S {
        &self.store
    }

    #[must_use]
    pub fn bank(&self) -> &B {
        &self.bank
    }

    /// Mutable access to the escrow collaborator, e.g. to fund accounts.
    pub fn bank_mut(&mut self) -> &mut B {
        &mut self.bank
    }

    #[must_use]
    pub fn config(&self) -> &LockupConfig {
        &self.config
    }

    /// Replace the configuration (parameter update).
    ///
    /// # Errors
    /// `Configuration` if `config` fails validation.
    pub fn set_config(&mut self, config: LockupConfig) -> Result<()> {
        config.validate()?;
        self.config = config;
        Ok(())
    }

    /// Tear down into the store and bank.
    pub fn into_parts(self) -> (S, B) {
        (self.store, self.bank)
    }

    /// Run `f` as one all-or-nothing unit.
    pub(crate) fn atomically<T>(
        &mut self,
        op: &'static str,
        f: impl FnOnce(&mut Tx<'_, S>) -> Result<T>,
    ) -> Result<T> {
        let (value, batch, deposits, payouts) = {
            let mut tx = Tx::new(&self.store, &self.config);
            let value = match f(&mut tx) {
                Ok(value) => value,
                Err(err) => {
                    if err.is_fatal() {
                        tracing::error!(op, error = %err, "Operation aborted");
                    } else {
                        tracing::debug!(op, error = %err, "Operation rejected");
                    }
                    return Err(err);
                }
            };
            let Tx {
                store,
                deposits,
                payouts,
                ..
            } = tx;
            (value, store.into_batch(), deposits, payouts)
        };

        // Payouts draw on escrow after this batch's deposits land; make sure
        // escrow can cover them before any transfer happens.
        let mut available = self.bank.escrow_balance();
        for (_, coins) in &deposits {
            available = available.add(coins);
        }
        for (recipient, coins) in &payouts {
            available = available.checked_sub(coins).ok_or_else(|| {
                let err = LockupError::InternalInconsistency {
                    reason: format!("escrow cannot cover payout of {coins} to {recipient}"),
                };
                tracing::error!(op, error = %err, "Escrow shortfall");
                err
            })?;
        }

        let mut funded: Vec<&(Owner, Coins)> = Vec::with_capacity(deposits.len());
        for deposit in &deposits {
            if let Err(err) = self.bank.transfer_to_escrow(&deposit.0, &deposit.1) {
                for (owner, coins) in funded.into_iter().rev() {
                    if let Err(refund) = self.bank.transfer_from_escrow(owner, coins) {
                        tracing::error!(op, %owner, %coins, error = %refund, "Refund failed");
                        return Err(LockupError::InternalInconsistency {
                            reason: format!("refund of {coins} to {owner} failed: {refund}"),
                        });
                    }
                }
                tracing::warn!(
                    op,
                    owner = %deposit.0,
                    coins = %deposit.1,
                    error = %err,
                    "Escrow deposit failed, batch discarded"
                );
                return Err(err);
            }
            funded.push(deposit);
        }

        for (recipient, coins) in &payouts {
            self.bank
                .transfer_from_escrow(recipient, coins)
                .map_err(|err| {
                    tracing::error!(op, %recipient, %coins, error = %err, "Escrow payout failed");
                    LockupError::InternalInconsistency {
                        reason: format!("payout of {coins} to {recipient} failed: {err}"),
                    }
                })?;
        }

        let writes = batch.len();
        self.store.write(batch);
        tracing::debug!(op, writes, "Committed");
        Ok(value)
    }
}

// ---------------------------------------------------------------------------
// Tx
// ---------------------------------------------------------------------------

/// One in-flight mutating operation.
pub struct Tx<'a, S: KvStore> {
    pub(crate) store: CacheStore<'a, S>,
    pub(crate) config: &'a LockupConfig,
    deposits: Vec<(Owner, Coins)>,
    payouts: Vec<(Owner, Coins)>,
}

impl<'a, S: KvStore> Tx<'a, S> {
    pub(crate) fn new(store: &'a S, config: &'a LockupConfig) -> Self {
        Self {
            store: CacheStore::new(store),
            config,
            deposits: Vec::new(),
            payouts: Vec::new(),
        }
    }

    // =====================================================================
    // Escrow staging
    // =====================================================================

    /// Owner → escrow, executed at commit.
    pub(crate) fn deposit(&mut self, owner: &Owner, coins: &Coins) {
        if !coins.is_empty() {
            self.deposits.push((owner.clone(), coins.clone()));
        }
    }

    /// Escrow → recipient, executed at commit after every deposit.
    pub(crate) fn payout(&mut self, recipient: &Owner, coins: &Coins) {
        if !coins.is_empty() {
            self.payouts.push((recipient.clone(), coins.clone()));
        }
    }

    // =====================================================================
    // Accumulation
    // =====================================================================

    pub(crate) fn tree(&self, denom: &str) -> Result<AccumulationTree> {
        AccumulationTree::new(denom, self.config.accumulation_fanout)
    }

    /// Add (`increase`) or remove every coin of `coins` at `duration`.
    pub(crate) fn accumulate(
        &mut self,
        coins: &Coins,
        duration: Duration,
        increase: bool,
    ) -> Result<()> {
        for coin in coins.iter() {
            let tree = self.tree(&coin.denom)?;
            if increase {
                tree.increase(&mut self.store, duration, coin.amount)?;
            } else {
                tree.decrease(&mut self.store, duration, coin.amount)?;
            }
        }
        Ok(())
    }

    pub(crate) fn accumulate_overlay(
        &mut self,
        overlay: &SyntheticLock,
        amount: Decimal,
        increase: bool,
    ) -> Result<()> {
        let tree = self.tree(&overlay.synth_denom)?;
        if increase {
            tree.increase(&mut self.store, overlay.duration, amount)
        } else {
            tree.decrease(&mut self.store, overlay.duration, amount)
        }
    }

    // =====================================================================
    // Locks
    // =====================================================================

    pub(crate) fn load_lock(&self, id: LockId) -> Result<Lock> {
        records::load_lock(&self.store, id)
    }

    /// Persist a new lock: record, references under its partition, and
    /// accumulation entries.
    pub(crate) fn insert_lock(&mut self, lock: &Lock) -> Result<()> {
        records::put_lock(&mut self.store, lock)?;
        reference::add_references(&mut self.store, lock)?;
        self.accumulate(&lock.coins, lock.duration, true)
    }

    /// Inverse of [`Tx::insert_lock`]. Overlays are not touched.
    pub(crate) fn remove_lock(&mut self, lock: &Lock) -> Result<()> {
        records::delete_lock(&mut self.store, lock.id);
        reference::remove_references(&mut self.store, lock, lock.state())?;
        self.accumulate(&lock.coins, lock.duration, false)
    }

    /// Replace `old` with `new` (same id, same partition), rewriting only
    /// what changed.
    pub(crate) fn replace_lock(&mut self, old: &Lock, new: &Lock) -> Result<()> {
        if old.id != new.id || old.state() != new.state() {
            return Err(LockupError::Internal(format!(
                "replace_lock across ids or partitions: {} -> {}",
                old.id, new.id
            )));
        }
        records::put_lock(&mut self.store, new)?;
        let denoms_changed = !old.coins.denoms().eq(new.coins.denoms());
        if denoms_changed || old.duration != new.duration || old.end_time != new.end_time {
            reference::remove_references(&mut self.store, old, old.state())?;
            reference::add_references(&mut self.store, new)?;
        }
        self.accumulate(&old.coins, old.duration, false)?;
        self.accumulate(&new.coins, new.duration, true)?;

        // Overlays mirror the lock's single-denom amount.
        let before = overlay_amount(old);
        let overlays = records::overlays_of_lock(&self.store, old.id)?;
        if !overlays.is_empty() {
            let after = overlay_amount(new).ok_or_else(|| LockupError::InvariantViolation {
                reason: format!("{} carries overlays and must hold a single denom", new.id),
            })?;
            let before = before.unwrap_or(Decimal::ZERO);
            for overlay in &overlays {
                self.accumulate_overlay(overlay, before, false)?;
                self.accumulate_overlay(overlay, after, true)?;
            }
        }
        Ok(())
    }

    /// Delete every overlay on `lock`, then the lock itself.
    pub(crate) fn remove_lock_cascading(&mut self, lock: &Lock) -> Result<Vec<OverlayKey>> {
        let overlays = records::overlays_of_lock(&self.store, lock.id)?;
        let mut removed = Vec::with_capacity(overlays.len());
        for overlay in &overlays {
            self.remove_overlay(overlay, lock)?;
            removed.push(overlay.key());
        }
        self.remove_lock(lock)?;
        Ok(removed)
    }

    // =====================================================================
    // Overlays
    // =====================================================================

    pub(crate) fn insert_overlay(&mut self, overlay: &SyntheticLock, lock: &Lock) -> Result<()> {
        let amount = require_overlay_amount(lock)?;
        records::put_overlay(&mut self.store, overlay)?;
        reference::add_references(
            &mut self.store,
            &OverlayView {
                overlay,
                owner: &lock.owner,
            },
        )?;
        self.accumulate_overlay(overlay, amount, true)
    }

    pub(crate) fn remove_overlay(&mut self, overlay: &SyntheticLock, lock: &Lock) -> Result<()> {
        let amount = require_overlay_amount(lock)?;
        records::delete_overlay(&mut self.store, &overlay.key());
        reference::remove_references(
            &mut self.store,
            &OverlayView {
                overlay,
                owner: &lock.owner,
            },
            overlay.state(),
        )?;
        self.accumulate_overlay(overlay, amount, false)
    }

    /// Move an overlay from not-unlocking to unlocking.
    pub(crate) fn migrate_overlay(&mut self, overlay: &SyntheticLock, lock: &Lock) -> Result<()> {
        records::put_overlay(&mut self.store, overlay)?;
        reference::migrate_partition(
            &mut self.store,
            &OverlayView {
                overlay,
                owner: &lock.owner,
            },
            LockState::NotUnlocking,
        )
    }
}

/// The single-denom amount an overlay on `lock` mirrors.
pub(crate) fn overlay_amount(lock: &Lock) -> Option<Decimal> {
    lock.coins.as_single().map(|c| c.amount)
}

pub(crate) fn require_overlay_amount(lock: &Lock) -> Result<Decimal> {
    overlay_amount(lock).ok_or_else(|| LockupError::InvariantViolation {
        reason: format!(
            "{} holds {} denoms; overlays need exactly one",
            lock.id,
            lock.coins.len()
        ),
    })
}
