//! Identity Registry: agent records, staking, reputation and weight.

pub mod registry;
pub mod reputation;

pub use registry::*;
pub use reputation::*;
