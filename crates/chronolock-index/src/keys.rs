//! Byte layout of everything the lock store persists.
//!
//! ## Layout
//!
//! | prefix | key tail | value |
//! |---|---|---|
//! | `0x01` | `lock_id` | lock record |
//! | `0x02` | | last assigned lock id |
//! | `0x03` | `lock_id ‖ synth_denom` | overlay record |
//! | `0x0F` | legacy reference key | legacy id list |
//! | `0x10`/`0x11` | reference key | lock reference (not-unlocking / unlocking) |
//! | `0x12`/`0x13` | reference key | overlay reference (not-unlocking / unlocking) |
//! | `0x20` | `len ‖ denom ‖ ...` | accumulation tree |
//!
//! A reference key is
//! `[family+partition][scope][dimension][scope key][dimension key][record id]`.
//! Integers are big-endian, timestamps are sign-flipped `i64` nanoseconds,
//! durations are `secs: u64 ‖ nanos: u32`. Variable-length components inside
//! a key are prefixed with a `u8` length so no scope is a prefix of another.

use std::time::Duration;

use chrono::{DateTime, Utc};
use chronolock_store::encoding::{decode_i64_sortable, encode_i64_sortable};
use chronolock_types::{LockId, LockState, LockupError, OverlayKey, Owner, Result};

pub const LOCK_PREFIX: u8 = 0x01;
pub const LAST_LOCK_ID_KEY: &[u8] = &[0x02];
pub const OVERLAY_PREFIX: u8 = 0x03;
pub const LEGACY_REFS_PREFIX: u8 = 0x0F;
pub const LOCK_REFS_PREFIX: u8 = 0x10;
pub const OVERLAY_REFS_PREFIX: u8 = 0x12;
pub const ACCUMULATION_PREFIX: u8 = 0x20;

/// Width of an encoded timestamp.
pub const TIME_KEY_LEN: usize = 8;
/// Width of an encoded duration.
pub const DURATION_KEY_LEN: usize = 12;

/// Reference value. The record id lives in the key.
pub const REF_MARKER: &[u8] = &[1];

// ---------------------------------------------------------------------------
// Components
// ---------------------------------------------------------------------------

/// Append `bytes` preceded by a one-byte length.
///
/// # Errors
/// Returns `InvalidDenom` if `bytes` is longer than 255.
pub fn push_len_prefixed(buf: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    let len = u8::try_from(bytes.len())
        .map_err(|_| LockupError::InvalidDenom(String::from_utf8_lossy(bytes).into_owned()))?;
    buf.push(len);
    buf.extend_from_slice(bytes);
    Ok(())
}

/// Sortable timestamp key.
///
/// # Errors
/// Returns `InvalidTimestamp` outside the `i64` nanosecond range.
pub fn encode_time(t: DateTime<Utc>) -> Result<[u8; TIME_KEY_LEN]> {
    let nanos = t
        .timestamp_nanos_opt()
        .ok_or_else(|| LockupError::InvalidTimestamp {
            reason: format!("{t} is outside the nanosecond range"),
        })?;
    Ok(encode_i64_sortable(nanos))
}

#[must_use]
pub fn decode_time(bytes: [u8; TIME_KEY_LEN]) -> DateTime<Utc> {
    DateTime::from_timestamp_nanos(decode_i64_sortable(bytes))
}

/// Sortable duration key: seconds then sub-second nanos.
#[must_use]
pub fn encode_duration(d: Duration) -> [u8; DURATION_KEY_LEN] {
    let mut out = [0u8; DURATION_KEY_LEN];
    out[..8].copy_from_slice(&d.as_secs().to_be_bytes());
    out[8..].copy_from_slice(&d.subsec_nanos().to_be_bytes());
    out
}

#[must_use]
pub fn decode_duration(bytes: [u8; DURATION_KEY_LEN]) -> Duration {
    let mut secs = [0u8; 8];
    let mut nanos = [0u8; 4];
    secs.copy_from_slice(&bytes[..8]);
    nanos.copy_from_slice(&bytes[8..]);
    Duration::new(u64::from_be_bytes(secs), u32::from_be_bytes(nanos))
}

// ---------------------------------------------------------------------------
// Record keys
// ---------------------------------------------------------------------------

#[must_use]
pub fn lock_key(id: LockId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(LOCK_PREFIX);
    key.extend_from_slice(&id.to_be_bytes());
    key
}

#[must_use]
pub fn overlay_key(key: &OverlayKey) -> Vec<u8> {
    let mut out = overlays_of_lock_prefix(key.lock_id);
    out.extend_from_slice(key.synth_denom.as_bytes());
    out
}

/// Prefix of every overlay record on one lock.
#[must_use]
pub fn overlays_of_lock_prefix(lock_id: LockId) -> Vec<u8> {
    let mut key = Vec::with_capacity(9);
    key.push(OVERLAY_PREFIX);
    key.extend_from_slice(&lock_id.to_be_bytes());
    key
}

/// Recover the overlay identity from an overlay record key.
///
/// # Errors
/// Returns `InternalInconsistency` on a malformed key.
pub fn decode_overlay_key(key: &[u8]) -> Result<OverlayKey> {
    match key.split_first() {
        Some((&OVERLAY_PREFIX, rest)) => OverlayKey::decode_ref(rest),
        _ => Err(malformed("overlay record key", key)),
    }
}

pub(crate) fn malformed(what: &str, key: &[u8]) -> LockupError {
    LockupError::InternalInconsistency {
        reason: format!("malformed {what}: {key:02x?}"),
    }
}

// ---------------------------------------------------------------------------
// Reference keys
// ---------------------------------------------------------------------------

/// Which record kind a reference points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Family {
    Lock,
    Overlay,
}

impl Family {
    /// Leading key byte for this family within `partition`.
    #[must_use]
    pub fn partition_byte(self, partition: LockState) -> u8 {
        let base = match self {
            Self::Lock => LOCK_REFS_PREFIX,
            Self::Overlay => OVERLAY_REFS_PREFIX,
        };
        match partition {
            LockState::NotUnlocking => base,
            LockState::Unlocking => base + 1,
        }
    }
}

/// Who a reference set is scoped to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Scope<'a> {
    Global,
    Owner(&'a Owner),
    Denom(&'a str),
    OwnerDenom(&'a Owner, &'a str),
}

impl Scope<'_> {
    fn tag(self) -> u8 {
        match self {
            Self::Global => 0x01,
            Self::Owner(_) => 0x02,
            Self::Denom(_) => 0x03,
            Self::OwnerDenom(..) => 0x04,
        }
    }

    fn push_key(self, buf: &mut Vec<u8>) -> Result<()> {
        match self {
            Self::Global => Ok(()),
            Self::Owner(owner) => push_len_prefixed(buf, owner.as_bytes()),
            Self::Denom(denom) => push_len_prefixed(buf, denom.as_bytes()),
            Self::OwnerDenom(owner, denom) => {
                push_len_prefixed(buf, owner.as_bytes())?;
                push_len_prefixed(buf, denom.as_bytes())
            }
        }
    }
}

/// The ordering axis of a reference set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dimension {
    EndTime,
    Duration,
}

impl Dimension {
    pub const ALL: [Self; 2] = [Self::EndTime, Self::Duration];

    fn tag(self) -> u8 {
        match self {
            Self::EndTime => 0x01,
            Self::Duration => 0x02,
        }
    }

    #[must_use]
    pub fn key_len(self) -> usize {
        match self {
            Self::EndTime => TIME_KEY_LEN,
            Self::Duration => DURATION_KEY_LEN,
        }
    }
}

/// Everything up to (not including) the dimension key.
///
/// # Errors
/// Returns `InvalidDenom` if a scope component is longer than 255 bytes.
pub fn reference_prefix(
    family: Family,
    partition: LockState,
    scope: Scope<'_>,
    dimension: Dimension,
) -> Result<Vec<u8>> {
    let mut key = vec![
        family.partition_byte(partition),
        scope.tag(),
        dimension.tag(),
    ];
    scope.push_key(&mut key)?;
    Ok(key)
}

// ---------------------------------------------------------------------------
// Record identifiers
// ---------------------------------------------------------------------------

/// A record id that can be folded into the tail of a reference key.
pub trait RefId: Sized {
    const FAMILY: Family;

    fn encode_ref(&self) -> Vec<u8>;

    /// # Errors
    /// Returns `InternalInconsistency` on malformed bytes.
    fn decode_ref(bytes: &[u8]) -> Result<Self>;
}

impl RefId for LockId {
    const FAMILY: Family = Family::Lock;

    fn encode_ref(&self) -> Vec<u8> {
        self.to_be_bytes().to_vec()
    }

    fn decode_ref(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; 8] = bytes
            .try_into()
            .map_err(|_| malformed("lock reference", bytes))?;
        Ok(Self::from_be_bytes(arr))
    }
}

impl RefId for OverlayKey {
    const FAMILY: Family = Family::Overlay;

    fn encode_ref(&self) -> Vec<u8> {
        let mut out = self.lock_id.to_be_bytes().to_vec();
        out.extend_from_slice(self.synth_denom.as_bytes());
        out
    }

    fn decode_ref(bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= 8 {
            return Err(malformed("overlay reference", bytes));
        }
        let (id, denom) = bytes.split_at(8);
        let lock_id = LockId::decode_ref(id)?;
        let denom =
            std::str::from_utf8(denom).map_err(|_| malformed("overlay reference", bytes))?;
        Ok(Self::new(lock_id, denom))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duration_key_orders_by_value() {
        let ds = [
            Duration::ZERO,
            Duration::from_nanos(1),
            Duration::from_millis(999),
            Duration::from_secs(1),
            Duration::new(1, 5),
            Duration::from_secs(3600),
        ];
        for pair in ds.windows(2) {
            assert!(encode_duration(pair[0]) < encode_duration(pair[1]));
        }
        for d in ds {
            assert_eq!(decode_duration(encode_duration(d)), d);
        }
    }

    #[test]
    fn time_key_orders_across_epoch() {
        let before = DateTime::from_timestamp(-10, 0).unwrap();
        let epoch = DateTime::from_timestamp(0, 0).unwrap();
        let after = DateTime::from_timestamp(10, 1).unwrap();
        assert!(encode_time(before).unwrap() < encode_time(epoch).unwrap());
        assert!(encode_time(epoch).unwrap() < encode_time(after).unwrap());
        assert_eq!(decode_time(encode_time(after).unwrap()), after);
    }

    #[test]
    fn time_out_of_range_rejected() {
        let far = DateTime::from_timestamp(400 * 365 * 24 * 3600, 0).unwrap();
        assert!(matches!(
            encode_time(far),
            Err(LockupError::InvalidTimestamp { .. })
        ));
    }

    #[test]
    fn scopes_do_not_prefix_each_other() {
        let a = Owner::new(vec![0xAA]).unwrap();
        let ab = Owner::new(vec![0xAA, 0xBB]).unwrap();
        let pa = reference_prefix(
            Family::Lock,
            LockState::NotUnlocking,
            Scope::Owner(&a),
            Dimension::Duration,
        )
        .unwrap();
        let pab = reference_prefix(
            Family::Lock,
            LockState::NotUnlocking,
            Scope::Owner(&ab),
            Dimension::Duration,
        )
        .unwrap();
        assert!(!pab.starts_with(&pa));
    }

    #[test]
    fn partitions_and_families_are_disjoint() {
        let bytes = [
            Family::Lock.partition_byte(LockState::NotUnlocking),
            Family::Lock.partition_byte(LockState::Unlocking),
            Family::Overlay.partition_byte(LockState::NotUnlocking),
            Family::Overlay.partition_byte(LockState::Unlocking),
        ];
        assert_eq!(bytes, [0x10, 0x11, 0x12, 0x13]);
    }

    #[test]
    fn ref_ids_roundtrip() {
        let id = LockId(77);
        assert_eq!(LockId::decode_ref(&id.encode_ref()).unwrap(), id);
        let key = OverlayKey::new(LockId(3), "stake/superbonding/val1");
        assert_eq!(OverlayKey::decode_ref(&key.encode_ref()).unwrap(), key);
        assert_eq!(decode_overlay_key(&overlay_key(&key)).unwrap(), key);
        assert!(LockId::decode_ref(&[1, 2]).is_err());
        assert!(OverlayKey::decode_ref(&[0; 8]).is_err());
    }

    #[test]
    fn oversized_scope_component_rejected() {
        let long = "a".repeat(300);
        assert!(
            reference_prefix(
                Family::Lock,
                LockState::Unlocking,
                Scope::Denom(&long),
                Dimension::EndTime,
            )
            .is_err()
        );
    }
}
