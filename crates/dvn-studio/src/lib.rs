//! `PolicyStudio`: an in-memory studio that accepts work from registered
//! workers, charges a verification fee and receives final statuses.

pub mod config;
pub mod studio;

pub use config::*;
pub use studio::*;
