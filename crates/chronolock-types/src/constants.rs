//! System-wide constants for the lock store.

use std::time::Duration;

/// Maximum owner identifier length in bytes.
pub const MAX_OWNER_LEN: usize = 255;

/// Minimum denomination length in characters.
pub const MIN_DENOM_LEN: usize = 2;

/// Maximum denomination length in characters.
pub const MAX_DENOM_LEN: usize = 128;

/// Punctuation allowed after the first character of a denomination.
pub const DENOM_EXTRA_CHARS: &[char] = &['/', ':', '.', '_', '-'];

/// Seconds in one (non-leap) year.
pub const SECONDS_PER_YEAR: u64 = 365 * 24 * 60 * 60;

/// Default upper bound on lock and overlay durations (100 years).
pub const DEFAULT_MAX_LOCK_DURATION: Duration = Duration::from_secs(100 * SECONDS_PER_YEAR);

/// Default maximum entries per accumulation tree node.
pub const DEFAULT_ACCUMULATION_FANOUT: usize = 16;

/// Smallest fanout that still lets a split produce two non-empty halves
/// with room to grow.
pub const MIN_ACCUMULATION_FANOUT: usize = 3;
