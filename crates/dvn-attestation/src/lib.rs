//! Attestation Ledger: per-submission verifier votes under window control.

pub mod attestations;
pub mod window;

pub use attestations::*;
pub use window::*;
