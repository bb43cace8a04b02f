//! Per-block maturity sweep.

use chrono::{DateTime, Utc};
use chronolock_index::{Scope, reference};
use chronolock_store::KvStore;
use chronolock_types::{Coins, LockId, OverlayKey, Result};
use serde::{Deserialize, Serialize};

use crate::{bank::Bank, keeper::LockupKeeper};

/// What one sweep removed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    pub overlays_deleted: Vec<OverlayKey>,
    pub locks_finalized: Vec<LockId>,
    /// Coins returned to owners across every finalized lock.
    pub released: Coins,
}

impl SweepReport {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.overlays_deleted.is_empty() && self.locks_finalized.is_empty()
    }
}

impl<S: KvStore, B: Bank> LockupKeeper<S, B> {
    /// Finalize everything that has matured by `now`, overlays first so no
    /// overlay ever outlives its lock. Runs as a single batch.
    ///
    /// # Errors
    /// Only fatal errors: a matured overlay whose lock is gone, corrupt
    /// records, or (when enabled) a failed invariant check after commit.
    pub fn end_block(&mut self, now: DateTime<Utc>) -> Result<SweepReport> {
        let report = self.atomically("end_block", |tx| {
            let overlays_deleted = tx.sweep_matured_overlays(now)?;
            let matured: Vec<LockId> = reference::time_before(&tx.store, Scope::Global, now)?;
            let mut released = Coins::empty();
            for id in &matured {
                released = released.add(&tx.finalize_unlock(*id, now)?.coins);
            }
            Ok(SweepReport {
                overlays_deleted,
                locks_finalized: matured,
                released,
            })
        })?;

        if !report.is_empty() {
            tracing::info!(
                %now,
                overlays = report.overlays_deleted.len(),
                locks = report.locks_finalized.len(),
                released = %report.released,
                "Maturity sweep"
            );
        }
        if self.config.check_invariants_on_sweep {
            self.check_invariants()?;
        }
        Ok(report)
    }
}
