pub mod agent;
pub mod attestation;
pub mod capability;
pub mod clock;
pub mod error;
pub mod ids;
pub mod params;
pub mod submission;

pub use agent::*;
pub use attestation::*;
pub use capability::*;
pub use clock::*;
pub use error::*;
pub use ids::*;
pub use params::*;
pub use submission::*;
