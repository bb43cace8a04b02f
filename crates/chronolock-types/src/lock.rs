//! The canonical lock record and its lifecycle partition.
//!
//! State machine: `NotUnlocking -> Unlocking -> (deleted)`. There is no
//! path back to `NotUnlocking`.

use std::{fmt, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Deserialize, Serialize};

use crate::{Coins, LockId, LockupError, Owner, Result};

/// Which half of the reference index a record lives in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub enum LockState {
    /// No end time yet: the full duration is still ahead.
    NotUnlocking,
    /// End time set: the record matures at `end_time`.
    Unlocking,
}

impl LockState {
    /// Both partitions in query-concatenation order.
    pub const ALL: [Self; 2] = [Self::NotUnlocking, Self::Unlocking];
}

impl fmt::Display for LockState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotUnlocking => write!(f, "NOT_UNLOCKING"),
            Self::Unlocking => write!(f, "UNLOCKING"),
        }
    }
}

/// An escrow record committing an owner's coins for a declared duration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub id: LockId,
    pub owner: Owner,
    pub duration: Duration,
    /// `None` while not unlocking, otherwise `begin_unlock_time + duration`.
    pub end_time: Option<DateTime<Utc>>,
    pub coins: Coins,
}

impl Lock {
    #[must_use]
    pub fn new(id: LockId, owner: Owner, duration: Duration, coins: Coins) -> Self {
        Self {
            id,
            owner,
            duration,
            end_time: None,
            coins,
        }
    }

    #[must_use]
    pub fn state(&self) -> LockState {
        partition_of(self.end_time)
    }

    #[must_use]
    pub fn is_unlocking(&self) -> bool {
        self.end_time.is_some()
    }

    /// Unlocking and `end_time <= now`.
    #[must_use]
    pub fn is_mature(&self, now: DateTime<Utc>) -> bool {
        self.end_time.is_some_and(|end| end <= now)
    }

    /// The lock's denomination when it holds exactly one.
    #[must_use]
    pub fn single_denom(&self) -> Option<&str> {
        self.coins.as_single().map(|c| c.denom.as_str())
    }
}

/// Partition implied by an optional end time.
#[must_use]
pub fn partition_of(end_time: Option<DateTime<Utc>>) -> LockState {
    if end_time.is_some() {
        LockState::Unlocking
    } else {
        LockState::NotUnlocking
    }
}

/// Reject zero durations and durations above `max`.
///
/// # Errors
/// Returns `InvalidDuration`.
pub fn validate_duration(duration: Duration, max: Duration) -> Result<()> {
    if duration.is_zero() {
        return Err(LockupError::InvalidDuration {
            reason: "duration must be positive".into(),
        });
    }
    if duration > max {
        return Err(LockupError::InvalidDuration {
            reason: format!("duration {duration:?} exceeds maximum {max:?}"),
        });
    }
    Ok(())
}

/// Reject timestamps that do not fit in signed 64-bit nanoseconds.
///
/// # Errors
/// Returns `InvalidTimestamp`.
pub fn validate_timestamp(t: DateTime<Utc>) -> Result<()> {
    t.timestamp_nanos_opt()
        .map(|_| ())
        .ok_or_else(|| LockupError::InvalidTimestamp {
            reason: format!("{t} is outside the nanosecond range"),
        })
}

/// `now + duration`, checked against the nanosecond range.
///
/// # Errors
/// Returns `InvalidTimestamp` for a bad `now`, `InvalidDuration` on overflow.
pub fn unlock_end_time(now: DateTime<Utc>, duration: Duration) -> Result<DateTime<Utc>> {
    validate_timestamp(now)?;
    let overflow = || LockupError::InvalidDuration {
        reason: format!("{now} + {duration:?} overflows"),
    };
    let delta = TimeDelta::from_std(duration).map_err(|_| overflow())?;
    let end = now.checked_add_signed(delta).ok_or_else(overflow)?;
    validate_timestamp(end).map_err(|_| overflow())?;
    Ok(end)
}
