//! # chronolock-engine
//!
//! The lock store proper, built on the reference index and accumulation
//! trees of `chronolock-index`:
//!
//! - [`LockupKeeper`]: owner of the store, the escrow collaborator and the
//!   configuration; every mutating operation runs as one atomic batch
//! - [`Bank`] / [`BalanceManager`]: the escrow interface and its in-memory
//!   ledger
//! - [`lifecycle`]: create, top up, begin unlock, finalize, relock, break,
//!   force unlock, extend, slash
//! - [`synthetic`]: overlay create / delete / begin unlock / sweep
//! - [`sweep`]: the per-block maturity sweep ([`SweepReport`])
//! - [`queries`]: composite read-only queries
//! - [`migration`]: legacy reference re-keying and accumulation rebuild
//! - [`invariants`]: whole-store consistency checks
//!
//! ## Lock lifecycle
//!
//! ```text
//! ┌───────────────┐ begin_unlock ┌───────────────┐ finalize_unlock ┌─────────┐
//! │ NOT_UNLOCKING │─────────────▶│   UNLOCKING   │────────────────▶│ deleted │
//! │ end_time: -   │              │ end_time: set │   (end_time     │         │
//! └───────────────┘              └───────────────┘    <= now)      └─────────┘
//!         │                 admin_break_lock / force_unlock             ▲
//!         └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Deleting a lock deletes its overlays in the same batch, and the maturity
//! sweep removes matured overlays before matured locks.

pub mod bank;
pub mod invariants;
pub mod keeper;
pub mod lifecycle;
pub mod migration;
pub mod queries;
pub mod records;
pub mod sweep;
pub mod synthetic;

pub use bank::{BalanceManager, Bank};
pub use keeper::LockupKeeper;
pub use migration::{LegacyRefs, MigrationReport};
pub use sweep::SweepReport;
