use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dvn_types::{
    ConsensusCapability, DvnError, GrantId, PoaId, StudioCapability, SubmissionStatus,
};

/// Handed to a studio when it is admitted to the allow-list.
#[derive(Debug)]
pub struct StudioBinding {
    /// Presented by the studio on every call into the engine.
    pub capability: StudioCapability,
    /// The only consensus grant whose status writes the studio may accept.
    pub consensus_authority: GrantId,
}

/// A policy component that owns submissions and receives their final status.
#[async_trait]
pub trait Studio: Send + Sync {
    /// Accept the capability issued at registration.
    async fn bind(&self, binding: StudioBinding) -> Result<(), DvnError>;

    /// Current status of a submission the studio owns.
    async fn submission_status(&self, poa_id: PoaId) -> Result<SubmissionStatus, DvnError>;

    /// Record the final status. Must reject any `authority` other than the
    /// one named in the binding.
    async fn update_status(
        &self,
        poa_id: PoaId,
        status: SubmissionStatus,
        authority: &ConsensusCapability,
    ) -> Result<(), DvnError>;
}

/// Allow-list entry as reported by [`crate::ConsensusEngine::studios`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StudioInfo {
    pub grant: GrantId,
    pub name: String,
    pub registered_at: DateTime<Utc>,
}
