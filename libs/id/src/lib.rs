//! # amsync-id
//!
//! Typed identifiers for the records the address-manager synchronizer reads
//! and writes.
//!
//! ## Design Principles
//!
//! - IDs are assigned by the model store when a record is first persisted;
//!   a record without an ID has never been saved
//! - IDs are typed to prevent mixing different record kinds
//! - At the storage boundary an ID is its raw integer; in logs it carries
//!   a prefix so the record kind is visible
//!
//! ## ID Format
//!
//! The display form is `{prefix}_{n}`:
//! - `si_12` (address-manager service instance)
//! - `ap_3` (address pool)
//! - `inst_41` (compute instance)

mod error;
mod macros;
mod types;

pub use error::IdError;
pub use types::*;
