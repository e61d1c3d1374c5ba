//! Consensus Engine: drives each submission from an open attestation window
//! to a final verdict written back to its studio.

pub mod engine;
pub mod record;
pub mod rule;
pub mod studio;

pub use engine::*;
pub use record::*;
pub use rule::*;
pub use studio::*;
