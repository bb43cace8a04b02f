//! # chronolock-types
//!
//! Shared types, errors, and configuration for the **chronolock** lock store.
//!
//! This crate is the leaf dependency of the workspace. It defines:
//!
//! - **Identifiers**: [`LockId`], [`Owner`], [`OverlayKey`]
//! - **Value model**: [`Coin`], [`Coins`]
//! - **Lock model**: [`Lock`], [`LockState`], [`SyntheticLock`]
//! - **Configuration**: [`LockupConfig`]
//! - **Errors**: [`LockupError`] with `LK_ERR_` prefix codes
//! - **Constants**: system-wide limits and defaults

pub mod coins;
pub mod config;
pub mod constants;
pub mod error;
pub mod ids;
pub mod lock;
pub mod synthetic;

pub use coins::*;
pub use config::*;
pub use error::*;
pub use ids::*;
pub use lock::*;
pub use synthetic::*;

// Constants are accessed via `chronolock_types::constants::FOO`
// (not re-exported to avoid name collisions).
