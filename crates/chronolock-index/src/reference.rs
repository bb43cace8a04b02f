//! The reference index: scoped, range-scannable secondary keys over locks
//! and synthetic overlays.
//!
//! Every record is referenced once per (scope, dimension) pair under the
//! partition it currently occupies:
//!
//! - scopes: global, owner, each denom it holds, owner × each denom
//! - dimensions: end time, duration
//!
//! The record id is the key tail, so adding or removing a reference is a
//! single write and an empty set is simply an absent range.

use std::{ops::Bound, time::Duration};

use chrono::{DateTime, Utc};
use chronolock_store::{
    KvStore,
    encoding::{bound_as_slice, prefix_range, successor},
};
use chronolock_types::{
    Lock, LockId, LockState, LockupError, OverlayKey, Owner, Result, SyntheticLock, partition_of,
};
use tracing::debug;

use crate::keys::{
    self, Dimension, REF_MARKER, RefId, Scope, TIME_KEY_LEN, encode_duration, encode_time,
};

// ---------------------------------------------------------------------------
// Indexed records
// ---------------------------------------------------------------------------

/// A record the reference index can key.
pub trait Indexed {
    type Id: RefId;

    fn ref_id(&self) -> Self::Id;
    fn owner(&self) -> &Owner;
    /// Denominations the record is scoped under.
    fn index_denoms(&self) -> Vec<&str>;
    fn duration(&self) -> Duration;
    fn end_time(&self) -> Option<DateTime<Utc>>;

    fn partition(&self) -> LockState {
        partition_of(self.end_time())
    }
}

impl Indexed for Lock {
    type Id = LockId;

    fn ref_id(&self) -> LockId {
        self.id
    }

    fn owner(&self) -> &Owner {
        &self.owner
    }

    fn index_denoms(&self) -> Vec<&str> {
        self.coins.denoms().collect()
    }

    fn duration(&self) -> Duration {
        self.duration
    }

    fn end_time(&self) -> Option<DateTime<Utc>> {
        self.end_time
    }
}

/// An overlay paired with the owner of its underlying lock.
///
/// Overlays are scoped under their synthetic denom instead of the lock's
/// real denoms, and keyed by their own duration and end time.
#[derive(Debug, Clone, Copy)]
pub struct OverlayView<'a> {
    pub overlay: &'a SyntheticLock,
    pub owner: &'a Owner,
}

impl Indexed for OverlayView<'_> {
    type Id = OverlayKey;

    fn ref_id(&self) -> OverlayKey {
        self.overlay.key()
    }

    fn owner(&self) -> &Owner {
        self.owner
    }

    fn index_denoms(&self) -> Vec<&str> {
        vec![self.overlay.synth_denom.as_str()]
    }

    fn duration(&self) -> Duration {
        self.overlay.duration
    }

    fn end_time(&self) -> Option<DateTime<Utc>> {
        self.overlay.end_time
    }
}

// ---------------------------------------------------------------------------
// Mutation
// ---------------------------------------------------------------------------

/// Every reference key of `record` as it would sit in `partition`.
///
/// The not-unlocking end-time key is all zeroes whatever the record's end
/// time, so the keys of the partition a record is leaving are computable
/// after its end time has been set.
///
/// # Errors
/// `InternalInconsistency` when asked for unlocking keys of a record with no
/// end time; `InvalidTimestamp`/`InvalidDenom` from key encoding.
pub fn reference_keys<R: Indexed>(record: &R, partition: LockState) -> Result<Vec<Vec<u8>>> {
    let time_key = match partition {
        LockState::NotUnlocking => [0u8; TIME_KEY_LEN],
        LockState::Unlocking => {
            let end = record
                .end_time()
                .ok_or_else(|| LockupError::InternalInconsistency {
                    reason: "unlocking reference for a record without end time".into(),
                })?;
            encode_time(end)?
        }
    };
    let duration_key = encode_duration(record.duration());
    let id = record.ref_id().encode_ref();
    let owner = record.owner();
    let denoms = record.index_denoms();

    let mut scopes = vec![Scope::Global, Scope::Owner(owner)];
    for denom in &denoms {
        scopes.push(Scope::Denom(denom));
        scopes.push(Scope::OwnerDenom(owner, denom));
    }

    let mut out = Vec::with_capacity(scopes.len() * 2);
    for scope in scopes {
        for dimension in Dimension::ALL {
            let mut key = keys::reference_prefix(R::Id::FAMILY, partition, scope, dimension)?;
            match dimension {
                Dimension::EndTime => key.extend_from_slice(&time_key),
                Dimension::Duration => key.extend_from_slice(&duration_key),
            }
            key.extend_from_slice(&id);
            out.push(key);
        }
    }
    Ok(out)
}

/// Reference `record` under its current partition.
///
/// # Errors
/// See [`reference_keys`].
pub fn add_references<R: Indexed>(store: &mut impl KvStore, record: &R) -> Result<()> {
    let partition = record.partition();
    let refs = reference_keys(record, partition)?;
    for key in &refs {
        store.set(key, REF_MARKER);
    }
    debug!(refs = refs.len(), %partition, "Added references");
    Ok(())
}

/// Drop every reference of `record` from `partition`.
///
/// # Errors
/// See [`reference_keys`].
pub fn remove_references<R: Indexed>(
    store: &mut impl KvStore,
    record: &R,
    partition: LockState,
) -> Result<()> {
    let refs = reference_keys(record, partition)?;
    for key in &refs {
        store.delete(key);
    }
    debug!(refs = refs.len(), %partition, "Removed references");
    Ok(())
}

/// Move `record` from `from` to its current partition.
///
/// # Errors
/// See [`reference_keys`].
pub fn migrate_partition<R: Indexed>(
    store: &mut impl KvStore,
    record: &R,
    from: LockState,
) -> Result<()> {
    remove_references(store, record, from)?;
    add_references(store, record)
}

/// True if every reference key of `record` under `partition` is present.
///
/// # Errors
/// See [`reference_keys`].
pub fn is_fully_referenced<R: Indexed>(
    store: &impl KvStore,
    record: &R,
    partition: LockState,
) -> Result<bool> {
    Ok(reference_keys(record, partition)?
        .iter()
        .all(|key| store.has(key)))
}

// ---------------------------------------------------------------------------
// Range scans
// ---------------------------------------------------------------------------

fn map_bound<T, U>(bound: Bound<T>, f: impl FnOnce(T) -> Result<U>) -> Result<Bound<U>> {
    Ok(match bound {
        Bound::Included(v) => Bound::Included(f(v)?),
        Bound::Excluded(v) => Bound::Excluded(f(v)?),
        Bound::Unbounded => Bound::Unbounded,
    })
}

fn concat(base: &[u8], tail: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(base.len() + tail.len());
    out.extend_from_slice(base);
    out.extend_from_slice(tail);
    out
}

/// Scan one (family, partition, scope, dimension) set between two
/// dimension-key bounds and decode the record ids in key order.
fn scan<I: RefId>(
    store: &impl KvStore,
    partition: LockState,
    scope: Scope<'_>,
    dimension: Dimension,
    lower: Bound<Vec<u8>>,
    upper: Bound<Vec<u8>>,
) -> Result<Vec<I>> {
    let base = keys::reference_prefix(I::FAMILY, partition, scope, dimension)?;
    let (_, prefix_end) = prefix_range(base.clone());

    // The dimension key is fixed-width, so "every id under key k" is the
    // prefix range of `base ‖ k`.
    let lo = match lower {
        Bound::Unbounded => Bound::Included(base.clone()),
        Bound::Included(k) => Bound::Included(concat(&base, &k)),
        Bound::Excluded(k) => match successor(concat(&base, &k)) {
            Some(next) => Bound::Included(next),
            None => return Ok(Vec::new()),
        },
    };
    let hi = match upper {
        Bound::Unbounded => prefix_end,
        Bound::Included(k) => successor(concat(&base, &k)).map_or(prefix_end, Bound::Excluded),
        Bound::Excluded(k) => Bound::Excluded(concat(&base, &k)),
    };

    let skip = base.len() + dimension.key_len();
    store
        .range(bound_as_slice(&lo), bound_as_slice(&hi))
        .into_iter()
        .map(|(key, _)| match key.get(skip..) {
            Some(tail) => I::decode_ref(tail),
            None => Err(keys::malformed("reference key", &key)),
        })
        .collect()
}

/// Records of `partition` whose end time lies within the bounds.
///
/// # Errors
/// `InvalidTimestamp` for a bound outside the nanosecond range, or
/// `InternalInconsistency` on a malformed stored key.
pub fn scan_time<I: RefId>(
    store: &impl KvStore,
    scope: Scope<'_>,
    partition: LockState,
    lower: Bound<DateTime<Utc>>,
    upper: Bound<DateTime<Utc>>,
) -> Result<Vec<I>> {
    let lower = map_bound(lower, |t| encode_time(t).map(|k| k.to_vec()))?;
    let upper = map_bound(upper, |t| encode_time(t).map(|k| k.to_vec()))?;
    scan(store, partition, scope, Dimension::EndTime, lower, upper)
}

/// Records of `partition` whose duration lies within the bounds.
///
/// # Errors
/// `InternalInconsistency` on a malformed stored key.
pub fn scan_duration<I: RefId>(
    store: &impl KvStore,
    scope: Scope<'_>,
    partition: LockState,
    lower: Bound<Duration>,
    upper: Bound<Duration>,
) -> Result<Vec<I>> {
    let lower = map_bound(lower, |d| Ok(encode_duration(d).to_vec()))?;
    let upper = map_bound(upper, |d| Ok(encode_duration(d).to_vec()))?;
    scan(store, partition, scope, Dimension::Duration, lower, upper)
}

/// Unlocking records ending at or after `t`.
///
/// # Errors
/// See [`scan_time`].
pub fn time_at_or_after<I: RefId>(
    store: &impl KvStore,
    scope: Scope<'_>,
    t: DateTime<Utc>,
) -> Result<Vec<I>> {
    scan_time(store, scope, LockState::Unlocking, Bound::Included(t), Bound::Unbounded)
}

/// Unlocking records ending at or before `t` (i.e. matured by `t`).
///
/// # Errors
/// See [`scan_time`].
pub fn time_before<I: RefId>(
    store: &impl KvStore,
    scope: Scope<'_>,
    t: DateTime<Utc>,
) -> Result<Vec<I>> {
    scan_time(store, scope, LockState::Unlocking, Bound::Unbounded, Bound::Included(t))
}

/// Not-unlocking records committed for at least `d`.
///
/// # Errors
/// See [`scan_duration`].
pub fn duration_at_or_longer<I: RefId>(
    store: &impl KvStore,
    scope: Scope<'_>,
    d: Duration,
) -> Result<Vec<I>> {
    scan_duration(store, scope, LockState::NotUnlocking, Bound::Included(d), Bound::Unbounded)
}

/// Not-unlocking records committed for less than `d`.
///
/// # Errors
/// See [`scan_duration`].
pub fn duration_shorter_than<I: RefId>(
    store: &impl KvStore,
    scope: Scope<'_>,
    d: Duration,
) -> Result<Vec<I>> {
    scan_duration(store, scope, LockState::NotUnlocking, Bound::Unbounded, Bound::Excluded(d))
}

/// Every record of one partition, ordered by duration then id.
///
/// # Errors
/// See [`scan_duration`].
pub fn scan_all<I: RefId>(
    store: &impl KvStore,
    scope: Scope<'_>,
    partition: LockState,
) -> Result<Vec<I>> {
    scan_duration(store, scope, partition, Bound::Unbounded, Bound::Unbounded)
}
