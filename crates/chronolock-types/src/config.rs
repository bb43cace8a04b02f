//! Lock store configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{LockupError, Owner, Result, constants};

/// Runtime parameters of the lock store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LockupConfig {
    /// Owners permitted to break their own not-overlaid locks early.
    pub force_unlock_allowed: Vec<Owner>,
    /// Upper bound on lock and overlay durations.
    pub max_lock_duration: Duration,
    /// Maximum entries per accumulation tree node.
    pub accumulation_fanout: usize,
    /// Run the full invariant checker after every maturity sweep.
    pub check_invariants_on_sweep: bool,
}

impl Default for LockupConfig {
    fn default() -> Self {
        Self {
            force_unlock_allowed: Vec::new(),
            max_lock_duration: constants::DEFAULT_MAX_LOCK_DURATION,
            accumulation_fanout: constants::DEFAULT_ACCUMULATION_FANOUT,
            check_invariants_on_sweep: false,
        }
    }
}

impl LockupConfig {
    /// Parse and validate a JSON document. Missing fields take defaults.
    ///
    /// # Errors
    /// Returns `Configuration` on malformed JSON or out-of-range values.
    pub fn from_json(s: &str) -> Result<Self> {
        let cfg: Self =
            serde_json::from_str(s).map_err(|e| LockupError::Configuration(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// # Errors
    /// Returns `Configuration` if the fanout is below
    /// [`constants::MIN_ACCUMULATION_FANOUT`] or the maximum duration is zero.
    pub fn validate(&self) -> Result<()> {
        if self.accumulation_fanout < constants::MIN_ACCUMULATION_FANOUT {
            return Err(LockupError::Configuration(format!(
                "accumulation_fanout {} below minimum {}",
                self.accumulation_fanout,
                constants::MIN_ACCUMULATION_FANOUT
            )));
        }
        if self.max_lock_duration.is_zero() {
            return Err(LockupError::Configuration(
                "max_lock_duration must be positive".into(),
            ));
        }
        Ok(())
    }

    #[must_use]
    pub fn is_force_unlock_allowed(&self, owner: &Owner) -> bool {
        self.force_unlock_allowed.contains(owner)
    }
}
