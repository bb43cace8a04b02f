//! # chronolock-index
//!
//! The two secondary structures of the lock store, both written directly
//! against the flat key-value substrate:
//!
//! - [`reference`]: the multi-scope reference index (global, owner, denom,
//!   owner × denom) over two dimensions (end time, duration), split into
//!   the not-unlocking and unlocking partitions, with range scans
//! - [`accumulation`]: per-denomination sum trees answering "total
//!   committed for at least duration D"
//! - [`keys`]: the byte layout shared by both and by the record store

pub mod accumulation;
pub mod keys;
pub mod reference;

pub use accumulation::AccumulationTree;
pub use keys::{Dimension, Family, RefId, Scope};
pub use reference::{Indexed, OverlayView};
