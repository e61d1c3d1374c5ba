pub mod entry;
pub mod traits;

#[cfg(feature = "memory-ledger")]
pub mod memory;

#[cfg(feature = "merkle-ledger")]
pub mod merkle;

pub use entry::*;
pub use traits::*;

#[cfg(feature = "memory-ledger")]
pub use memory::*;

#[cfg(feature = "merkle-ledger")]
pub use merkle::*;
