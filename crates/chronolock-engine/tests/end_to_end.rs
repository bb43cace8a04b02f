//! End-to-end tests of the lock store through its public surface.
//!
//! These follow locks and overlays across their whole lifecycle (create,
//! begin unlock, sweep) and check the store-wide properties after each
//! step: partition exclusivity, index/record consistency, accumulation
//! correctness and escrow coverage.

use std::time::Duration;

use chrono::{DateTime, TimeDelta, TimeZone, Utc};
use chronolock_engine::{BalanceManager, Bank, LockupKeeper};
use chronolock_index::{Scope, keys, reference};
use chronolock_store::{KvStore, MemStore};
use chronolock_types::*;
use rust_decimal::Decimal;
use tracing_subscriber::EnvFilter;

const HOUR: Duration = Duration::from_secs(3600);

type Keeper = LockupKeeper<MemStore, BalanceManager>;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Seconds after a fixed genesis time.
fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(1_700_000_000, 0).unwrap() + TimeDelta::seconds(secs)
}

fn coins(s: &str) -> Coins {
    s.parse().expect("valid coins literal")
}

fn funded_keeper(owners: &[Owner]) -> Keeper {
    init_tracing();
    let mut bank = BalanceManager::new();
    for owner in owners {
        bank.deposit(owner, "stake", Decimal::new(1_000, 0)).unwrap();
        bank.deposit(owner, "uosmo", Decimal::new(1_000, 0)).unwrap();
    }
    LockupKeeper::new(MemStore::new(), bank, LockupConfig::default()).unwrap()
}

fn ids(locks: &[Lock]) -> Vec<LockId> {
    locks.iter().map(|l| l.id).collect()
}

fn reference_count(keeper: &Keeper) -> usize {
    let lower = [keys::LOCK_REFS_PREFIX];
    let upper = [keys::OVERLAY_REFS_PREFIX + 2];
    keeper
        .store()
        .range(
            std::ops::Bound::Included(&lower[..]),
            std::ops::Bound::Excluded(&upper[..]),
        )
        .len()
}

// ---------------------------------------------------------------------------
// Scenarios
// ---------------------------------------------------------------------------

#[test]
fn locked_past_time_boundary() {
    let owner = Owner::dummy(1);
    let mut keeper = funded_keeper(&[owner.clone()]);
    let id = keeper
        .create_lock(&owner, &coins("10stake"), Duration::from_secs(1))
        .unwrap();

    let past = |keeper: &Keeper, t| {
        ids(&keeper.account_locked_past_time(&owner, at(t), at(0)).unwrap())
    };
    assert_eq!(past(&keeper, 0), vec![id]);
    assert_eq!(past(&keeper, 1), vec![id]);
    assert!(past(&keeper, 2).is_empty());
}

#[test]
fn unlockable_coins_appear_at_end_time() {
    let owner = Owner::dummy(1);
    let mut keeper = funded_keeper(&[owner.clone()]);
    let id = keeper
        .create_lock(&owner, &coins("10stake"), Duration::from_secs(1))
        .unwrap();
    keeper.begin_unlock(id, None, at(0)).unwrap();

    assert!(keeper.account_unlockable_coins(&owner, at(0)).unwrap().is_empty());
    assert_eq!(keeper.account_unlockable_coins(&owner, at(1)).unwrap(), coins("10stake"));
    assert_eq!(keeper.account_unlocking_coins(&owner, at(0)).unwrap(), coins("10stake"));
}

#[test]
fn subset_sum_counts_only_long_enough_locks() {
    let owner = Owner::dummy(1);
    let mut keeper = funded_keeper(&[owner.clone()]);
    keeper.create_lock(&owner, &coins("10stake"), HOUR).unwrap();
    keeper.create_lock(&owner, &coins("25stake"), 2 * HOUR).unwrap();

    let ninety_minutes = Duration::from_secs(90 * 60);
    assert_eq!(keeper.locked_denom("stake", ninety_minutes).unwrap(), Decimal::new(25, 0));
    assert_eq!(keeper.locked_denom("stake", HOUR).unwrap(), Decimal::new(35, 0));
}

#[test]
fn unlocking_overlay_may_not_outlast_its_lock() {
    let owner = Owner::dummy(1);
    let mut keeper = funded_keeper(&[owner.clone()]);
    let id = keeper.create_lock(&owner, &coins("10stake"), HOUR).unwrap();
    let before = keeper.store().digest();

    let err = keeper
        .create_overlay(id, "stake/val1", 2 * HOUR, true, at(0))
        .unwrap_err();
    assert!(matches!(err, LockupError::OverlayDurationExceedsLock { .. }), "Got: {err}");
    assert_eq!(keeper.store().digest(), before);
}

#[test]
fn overlay_can_be_recreated_after_deletion() {
    let owner = Owner::dummy(1);
    let mut keeper = funded_keeper(&[owner.clone()]);
    let id = keeper.create_lock(&owner, &coins("10stake"), HOUR).unwrap();

    keeper.create_overlay(id, "stake/val1", HOUR, false, at(0)).unwrap();
    keeper.delete_overlay(id, "stake/val1").unwrap();
    keeper.create_overlay(id, "stake/val1", HOUR, false, at(0)).unwrap();

    assert_eq!(keeper.overlays_by_lock(id).unwrap().len(), 1);
    assert_eq!(keeper.locked_denom("stake/val1", HOUR).unwrap(), Decimal::new(10, 0));
    keeper.check_invariants().unwrap();
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn unlock_round_trip_returns_coins_and_clears_references() {
    let owner = Owner::dummy(1);
    let mut keeper = funded_keeper(&[owner.clone()]);
    let locked = coins("10stake,3uosmo");
    let id = keeper.create_lock(&owner, &locked, HOUR).unwrap();
    // Two denoms: global, owner, and per-denom scopes on both dimensions.
    assert_eq!(reference_count(&keeper), 12);

    keeper.begin_unlock(id, None, at(0)).unwrap();
    assert_eq!(reference_count(&keeper), 12);
    let end_time = keeper.lock_by_id(id).unwrap().end_time.unwrap();

    let released = keeper.finalize_unlock(id, end_time).unwrap();
    assert_eq!(released, locked);
    assert_eq!(reference_count(&keeper), 0);
    assert!(keeper.module_balance().is_empty());
    assert_eq!(keeper.bank().balance(&owner, "stake"), Decimal::new(1_000, 0));
    keeper.check_invariants().unwrap();
}

#[test]
fn partitions_stay_exclusive_across_transitions() {
    let (a, b) = (Owner::dummy(1), Owner::dummy(2));
    let mut keeper = funded_keeper(&[a.clone(), b.clone()]);
    let mut created = Vec::new();
    for (i, owner) in [&a, &b, &a, &b].into_iter().enumerate() {
        let n = u32::try_from(i).unwrap() + 1;
        created.push(keeper.create_lock(owner, &coins("5stake"), n * HOUR).unwrap());
    }
    keeper.begin_unlock(created[0], None, at(0)).unwrap();
    keeper.begin_unlock(created[3], None, at(0)).unwrap();

    for scope in [Scope::Global, Scope::Owner(&a), Scope::Denom("stake")] {
        let not_unlocking: Vec<LockId> =
            reference::scan_all(keeper.store(), scope, LockState::NotUnlocking).unwrap();
        let unlocking: Vec<LockId> =
            reference::scan_all(keeper.store(), scope, LockState::Unlocking).unwrap();
        assert!(not_unlocking.iter().all(|id| !unlocking.contains(id)));
        for id in not_unlocking.iter().chain(&unlocking) {
            let lock = keeper.lock_by_id(*id).unwrap();
            let in_unlocking = unlocking.contains(id);
            assert_eq!(lock.is_unlocking(), in_unlocking);
        }
    }
    assert_eq!(keeper.period_locks().unwrap().len(), 4);
    keeper.check_invariants().unwrap();
}

#[test]
fn full_lifecycle_with_overlays_and_sweeps() {
    let (a, b) = (Owner::dummy(1), Owner::dummy(2));
    let mut keeper = funded_keeper(&[a.clone(), b.clone()]);

    let short = keeper.lock_tokens(&a, &coins("100stake"), HOUR).unwrap();
    let long = keeper.lock_tokens(&b, &coins("50stake"), 3 * HOUR).unwrap();
    // Superbonded: the overlay starts its own unlocking clock immediately.
    keeper.create_overlay(long, "stake/superbonding", HOUR, true, at(0)).unwrap();
    keeper.create_overlay(short, "stake/val1", 2 * HOUR, false, at(0)).unwrap();
    keeper.begin_unlock(short, None, at(0)).unwrap();

    assert_eq!(keeper.module_locked_coins(at(0)).unwrap(), coins("150stake"));
    assert_eq!(keeper.overlays_by_owner(&b).unwrap().len(), 1);
    keeper.check_invariants().unwrap();

    // One hour in: both the lock and the superbonding overlay mature.
    let report = keeper.end_block(at(3600)).unwrap();
    assert_eq!(report.locks_finalized, vec![short]);
    assert_eq!(
        report.overlays_deleted,
        vec![OverlayKey::new(long, "stake/superbonding")]
    );
    assert_eq!(report.released, coins("100stake"));
    // The not-unlocking overlay on the finalized lock went with it.
    assert!(keeper.all_overlays().unwrap().is_empty());
    assert_eq!(keeper.bank().balance(&a, "stake"), Decimal::new(1_000, 0));
    assert_eq!(keeper.locked_denom("stake", Duration::ZERO).unwrap(), Decimal::new(50, 0));
    keeper.check_invariants().unwrap();

    keeper.begin_unlock_all(&b, at(3600)).unwrap();
    assert!(keeper.end_block(at(3600 * 3)).unwrap().is_empty());
    let report = keeper.end_block(at(3600 * 4)).unwrap();
    assert_eq!(report.locks_finalized, vec![long]);
    assert!(keeper.period_locks().unwrap().is_empty());
    assert_eq!(reference_count(&keeper), 0);
    assert!(keeper.module_balance().is_empty());
    keeper.check_invariants().unwrap();
}

#[test]
fn rejected_operations_leave_no_trace() {
    let (a, b) = (Owner::dummy(1), Owner::dummy(2));
    let mut keeper = funded_keeper(&[a.clone(), b.clone()]);
    let id = keeper.create_lock(&a, &coins("10stake"), HOUR).unwrap();
    keeper.create_overlay(id, "stake/val1", HOUR, false, at(0)).unwrap();
    let unlocking = keeper.create_lock(&a, &coins("5uosmo"), HOUR).unwrap();
    keeper.begin_unlock(unlocking, None, at(0)).unwrap();

    let digest = keeper.store().digest();
    let escrow = keeper.module_balance();

    let failures: Vec<(&str, LockupError)> = vec![
        ("create", keeper.create_lock(&a, &coins("5000stake"), HOUR).unwrap_err()),
        ("add", keeper.add_tokens_to_lock(id, &b, &coins("1stake")).unwrap_err()),
        ("missing", keeper.begin_unlock(LockId(99), None, at(0)).unwrap_err()),
        ("twice", keeper.begin_unlock(unlocking, None, at(0)).unwrap_err()),
        ("partial", keeper.begin_unlock(id, Some(&coins("1stake")), at(0)).unwrap_err()),
        ("early", keeper.finalize_unlock(unlocking, at(10)).unwrap_err()),
        ("idle", keeper.finalize_unlock(id, at(10)).unwrap_err()),
        ("overlay", keeper.create_overlay(id, "stake/val2", HOUR, false, at(0)).unwrap_err()),
        ("gone", keeper.delete_overlay(id, "stake/val2").unwrap_err()),
        ("force", keeper.force_unlock(&a, id, None).unwrap_err()),
        ("extend", keeper.extend_lockup(&a, id, 2 * HOUR).unwrap_err()),
        ("slash", keeper.slash_tokens(id, &coins("1uosmo"), &b).unwrap_err()),
        ("relock", keeper.admin_relock(id, &coins("9999uosmo")).unwrap_err()),
    ];
    for (name, err) in &failures {
        assert!(!err.is_fatal(), "{name}: {err}");
    }
    assert_eq!(keeper.store().digest(), digest);
    assert_eq!(keeper.module_balance(), escrow);
    keeper.check_invariants().unwrap();
}

#[test]
fn config_round_trips_through_json() {
    let allowed = Owner::dummy(7);
    let json = format!(
        r#"{{"force_unlock_allowed":["{allowed}"],"accumulation_fanout":4}}"#
    );
    let config = LockupConfig::from_json(&json).unwrap();
    assert!(config.is_force_unlock_allowed(&allowed));
    assert_eq!(config.accumulation_fanout, 4);

    let mut keeper = funded_keeper(&[allowed.clone()]);
    keeper.set_config(config).unwrap();
    // A small fanout forces multi-level trees; queries must not change.
    for i in 1..=20u32 {
        keeper.create_lock(&allowed, &coins("1stake"), i * HOUR).unwrap();
    }
    assert_eq!(keeper.locked_denom("stake", 15 * HOUR).unwrap(), Decimal::new(6, 0));
    let id = keeper.find_lock(&allowed, "stake", 3 * HOUR).unwrap().unwrap();
    assert_eq!(keeper.force_unlock(&allowed, id, None).unwrap(), coins("1stake"));
    keeper.check_invariants().unwrap();

    assert!(matches!(
        LockupConfig::from_json(r#"{"accumulation_fanout":2}"#),
        Err(LockupError::Configuration(_))
    ));
}
