//! Identifiers used throughout the lock store.
//!
//! Lock ids are dense `u64` counters handed out by the lifecycle manager.
//! Owners are opaque account bytes rendered as lowercase hex.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::{LockupError, Result, constants};

// ---------------------------------------------------------------------------
// LockId
// ---------------------------------------------------------------------------

/// Monotonically assigned lock identifier. The first lock is `lock:1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct LockId(pub u64);

impl LockId {
    /// The id that follows this one.
    ///
    /// # Errors
    /// Returns `Internal` if the id space is exhausted.
    pub fn next(self) -> Result<Self> {
        self.0
            .checked_add(1)
            .map(Self)
            .ok_or_else(|| LockupError::Internal("lock id space exhausted".into()))
    }

    /// Big-endian encoding, sortable by numeric value.
    #[must_use]
    pub fn to_be_bytes(self) -> [u8; 8] {
        self.0.to_be_bytes()
    }

    #[must_use]
    pub fn from_be_bytes(bytes: [u8; 8]) -> Self {
        Self(u64::from_be_bytes(bytes))
    }
}

impl fmt::Display for LockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lock:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Owner
// ---------------------------------------------------------------------------

/// Account that funds a lock and receives its coins back.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Owner(Vec<u8>);

impl Owner {
    /// Wrap raw account bytes.
    ///
    /// # Errors
    /// Returns `InvalidOwner` if the bytes are empty or longer than
    /// [`constants::MAX_OWNER_LEN`].
    pub fn new(bytes: impl Into<Vec<u8>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(LockupError::InvalidOwner {
                reason: "empty owner".into(),
            });
        }
        if bytes.len() > constants::MAX_OWNER_LEN {
            return Err(LockupError::InvalidOwner {
                reason: format!(
                    "owner is {} bytes, max {}",
                    bytes.len(),
                    constants::MAX_OWNER_LEN
                ),
            });
        }
        Ok(Self(bytes))
    }

    /// Parse a hex-encoded owner.
    ///
    /// # Errors
    /// Returns `InvalidOwner` on malformed hex or an out-of-range length.
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s).map_err(|e| LockupError::InvalidOwner {
            reason: format!("bad hex: {e}"),
        })?;
        Self::new(bytes)
    }

    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// A deterministic 20-byte owner filled with `tag`.
    #[cfg(any(test, feature = "test-helpers"))]
    #[must_use]
    pub fn dummy(tag: u8) -> Self {
        Self(vec![tag; 20])
    }
}

impl fmt::Display for Owner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0))
    }
}

impl TryFrom<String> for Owner {
    type Error = LockupError;

    fn try_from(s: String) -> Result<Self> {
        Self::from_hex(&s)
    }
}

impl From<Owner> for String {
    fn from(owner: Owner) -> Self {
        hex::encode(owner.0)
    }
}

// ---------------------------------------------------------------------------
// OverlayKey
// ---------------------------------------------------------------------------

/// Identity of a synthetic overlay: the lock it annotates plus its denom.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct OverlayKey {
    pub lock_id: LockId,
    pub synth_denom: String,
}

impl OverlayKey {
    #[must_use]
    pub fn new(lock_id: LockId, synth_denom: impl Into<String>) -> Self {
        Self {
            lock_id,
            synth_denom: synth_denom.into(),
        }
    }
}

impl fmt::Display for OverlayKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.lock_id, self.synth_denom)
    }
}
