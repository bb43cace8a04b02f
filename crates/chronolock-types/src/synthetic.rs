//! Synthetic overlay records.
//!
//! An overlay classifies an existing lock under a second denomination
//! without moving its escrow. It carries its own duration and end time,
//! independent of the lock's own transitions.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{LockId, LockState, OverlayKey, lock::partition_of};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyntheticLock {
    pub underlying_lock_id: LockId,
    pub synth_denom: String,
    pub end_time: Option<DateTime<Utc>>,
    pub duration: Duration,
}

impl SyntheticLock {
    #[must_use]
    pub fn key(&self) -> OverlayKey {
        OverlayKey::new(self.underlying_lock_id, self.synth_denom.clone())
    }

    #[must_use]
    pub fn state(&self) -> LockState {
        partition_of(self.end_time)
    }

    #[must_use]
    pub fn is_mature(&self, now: DateTime<Utc>) -> bool {
        self.end_time.is_some_and(|end| end <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overlay_partition_follows_own_end_time() {
        let mut overlay = SyntheticLock {
            underlying_lock_id: LockId(4),
            synth_denom: "stake/superbonding/val1".into(),
            end_time: None,
            duration: Duration::from_secs(3600),
        };
        assert_eq!(overlay.state(), LockState::NotUnlocking);
        assert_eq!(overlay.key(), OverlayKey::new(LockId(4), "stake/superbonding/val1"));

        let end = DateTime::from_timestamp(100, 0).unwrap();
        overlay.end_time = Some(end);
        assert_eq!(overlay.state(), LockState::Unlocking);
        assert!(overlay.is_mature(end));
        assert!(!overlay.is_mature(DateTime::from_timestamp(99, 0).unwrap()));
    }
}
