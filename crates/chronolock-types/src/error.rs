//! Error types for the chronolock lock store.
//!
//! All errors use the `LK_ERR_` prefix convention for easy grepping in logs.
//! Error codes are grouped by subsystem:
//! - 1xx: Validation errors (rejected before any state mutation)
//! - 2xx: Not-found errors
//! - 3xx: Balance / escrow errors
//! - 4xx: Lifecycle business-rule rejections
//! - 5xx: Invariant violations (caller or programmer error)
//! - 9xx: Fatal / internal errors

use std::time::Duration;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use thiserror::Error;

use crate::{LockId, OverlayKey};

/// Central error enum for all lock store operations.
#[derive(Debug, Error)]
pub enum LockupError {
    // =================================================================
    // Validation Errors (1xx)
    // =================================================================
    /// The owner identifier is empty or too long.
    #[error("LK_ERR_100: Invalid owner: {reason}")]
    InvalidOwner { reason: String },

    /// Zero, oversized, or overflowing duration.
    #[error("LK_ERR_101: Invalid duration: {reason}")]
    InvalidDuration { reason: String },

    /// Empty, unsorted, duplicated, or non-positive coins.
    #[error("LK_ERR_102: Invalid coins: {reason}")]
    InvalidCoins { reason: String },

    /// The denomination string is malformed.
    #[error("LK_ERR_103: Invalid denom: {0:?}")]
    InvalidDenom(String),

    /// A timestamp outside the representable nanosecond range.
    #[error("LK_ERR_104: Invalid timestamp: {reason}")]
    InvalidTimestamp { reason: String },

    // =================================================================
    // Not-Found Errors (2xx)
    // =================================================================
    /// No lock record exists under this id.
    #[error("LK_ERR_200: Lock not found: {0}")]
    LockNotFound(LockId),

    /// No synthetic overlay exists under this key.
    #[error("LK_ERR_201: Synthetic overlay not found: {0}")]
    OverlayNotFound(OverlayKey),

    // =================================================================
    // Balance / Escrow Errors (3xx)
    // =================================================================
    /// The owner cannot fund the requested escrow transfer.
    #[error("LK_ERR_300: Insufficient balance of {denom}: need {needed}, have {available}")]
    InsufficientBalance {
        denom: String,
        needed: Decimal,
        available: Decimal,
    },

    /// More coins were requested from a lock than it holds.
    #[error("LK_ERR_301: Lock {lock_id} holds {held}, cannot take {requested}")]
    InsufficientLocked {
        lock_id: LockId,
        held: String,
        requested: String,
    },

    /// The escrow account could not pay out.
    #[error("LK_ERR_302: Escrow transfer failed: {reason}")]
    EscrowTransferFailed { reason: String },

    // =================================================================
    // Lifecycle Errors (4xx)
    // =================================================================
    /// The caller does not own the lock.
    #[error("LK_ERR_400: Caller is not the owner of {0}")]
    NotOwner(LockId),

    /// The caller is not permitted to use this administrative path.
    #[error("LK_ERR_401: Unauthorized: {reason}")]
    Unauthorized { reason: String },

    /// Finalization was attempted on a lock that never began unlocking.
    #[error("LK_ERR_402: Lock {0} is not unlocking")]
    NotUnlocking(LockId),

    /// Begin-unlock was attempted twice.
    #[error("LK_ERR_403: Lock {0} is already unlocking")]
    AlreadyUnlocking(LockId),

    /// Finalization was attempted before the end time.
    #[error("LK_ERR_404: Lock {lock_id} matures at {end_time}, now is {now}")]
    NotMature {
        lock_id: LockId,
        end_time: DateTime<Utc>,
        now: DateTime<Utc>,
    },

    /// Extension must strictly increase the duration.
    #[error("LK_ERR_405: Lock {lock_id} duration {current:?} cannot be changed to {requested:?}")]
    DurationNotExtended {
        lock_id: LockId,
        current: Duration,
        requested: Duration,
    },

    /// The operation is not allowed while synthetic overlays reference the lock.
    #[error("LK_ERR_406: Lock {0} carries synthetic overlays")]
    LockHasOverlays(LockId),

    // =================================================================
    // Invariant Violations (5xx)
    // =================================================================
    /// A caller broke a structural rule of the store, including an
    /// accumulation entry that would go negative.
    #[error("LK_ERR_500: Invariant violation: {reason}")]
    InvariantViolation { reason: String },

    /// The lock already carries its single permitted overlay.
    #[error("LK_ERR_501: Lock {0} already has a synthetic overlay")]
    OverlayAlreadyExists(LockId),

    /// An unlocking overlay would promise faster liquidity than the lock.
    #[error("LK_ERR_502: Overlay duration {overlay:?} exceeds lock {lock_id} duration {lock:?}")]
    OverlayDurationExceedsLock {
        lock_id: LockId,
        overlay: Duration,
        lock: Duration,
    },

    /// A consistency check over the whole store failed.
    #[error("LK_ERR_503: Store invariant broken: {reason}")]
    StoreInvariantBroken { reason: String },

    // =================================================================
    // Fatal / Internal (9xx)
    // =================================================================
    /// Persisted state contradicts itself. The enclosing batch must abort.
    #[error("LK_ERR_900: Internal inconsistency: {reason}")]
    InternalInconsistency { reason: String },

    /// Serialization / deserialization error.
    #[error("LK_ERR_901: Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid config file, out-of-range values).
    #[error("LK_ERR_902: Configuration error: {0}")]
    Configuration(String),

    /// Unrecoverable internal error.
    #[error("LK_ERR_999: Internal error: {0}")]
    Internal(String),
}

impl LockupError {
    /// Fatal errors leave no recoverable path for the enclosing transaction.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::InternalInconsistency { .. }
                | Self::Serialization(_)
                | Self::StoreInvariantBroken { .. }
                | Self::Internal(_)
        )
    }
}

/// Crate-wide `Result` alias.
pub type Result<T> = std::result::Result<T, LockupError>;

impl From<serde_json::Error> for LockupError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display_contains_prefix() {
        let err = LockupError::LockNotFound(LockId(7));
        let msg = format!("{err}");
        assert!(msg.starts_with("LK_ERR_200"), "Got: {msg}");
        assert!(msg.contains("lock:7"));
    }

    #[test]
    fn insufficient_balance_display() {
        let err = LockupError::InsufficientBalance {
            denom: "stake".into(),
            needed: Decimal::new(100, 0),
            available: Decimal::new(50, 0),
        };
        let msg = format!("{err}");
        assert!(msg.contains("LK_ERR_300"));
        assert!(msg.contains("stake"));
        assert!(msg.contains("100"));
        assert!(msg.contains("50"));
    }

    #[test]
    fn fatal_classification() {
        assert!(
            LockupError::InternalInconsistency {
                reason: "dangling overlay".into()
            }
            .is_fatal()
        );
        assert!(!LockupError::NotUnlocking(LockId(1)).is_fatal());
        assert!(!LockupError::OverlayAlreadyExists(LockId(1)).is_fatal());
    }

    #[test]
    fn serde_errors_convert() {
        let parse: std::result::Result<u64, _> = serde_json::from_str("not json");
        let err: LockupError = parse.unwrap_err().into();
        assert!(matches!(err, LockupError::Serialization(_)));
    }

    #[test]
    fn all_errors_have_lk_err_prefix() {
        let errors: Vec<Box<dyn std::error::Error>> = vec![
            Box::new(LockupError::NotOwner(LockId(3))),
            Box::new(LockupError::AlreadyUnlocking(LockId(3))),
            Box::new(LockupError::InvalidDenom("x".into())),
            Box::new(LockupError::Internal("test".into())),
            Box::new(LockupError::OverlayNotFound(OverlayKey::new(
                LockId(1),
                "stake/val1",
            ))),
        ];
        for err in errors {
            let msg = format!("{err}");
            assert!(
                msg.starts_with("LK_ERR_"),
                "Error missing LK_ERR_ prefix: {msg}"
            );
        }
    }
}
