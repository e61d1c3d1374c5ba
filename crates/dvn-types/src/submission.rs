use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::agent::Amount;
use crate::ids::{AgentId, IdentityKey, PoaId};
use crate::params::amount_serde;

/// Verification status of a Proof-of-Agency submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SubmissionStatus {
    Submitted,
    Verified,
    Rejected,
    Disputed,
}

impl SubmissionStatus {
    pub fn is_final(self) -> bool {
        !matches!(self, SubmissionStatus::Submitted)
    }
}

impl fmt::Display for SubmissionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubmissionStatus::Submitted => "SUBMITTED",
            SubmissionStatus::Verified => "VERIFIED",
            SubmissionStatus::Rejected => "REJECTED",
            SubmissionStatus::Disputed => "DISPUTED",
        };
        f.write_str(name)
    }
}

/// A unit of work plus its verification status, as stored by a studio.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Submission {
    pub poa_id: PoaId,
    pub agent_id: AgentId,
    pub action_type: String,
    /// Opaque content-addressed reference to the work package.
    pub metadata_ref: String,
    pub status: SubmissionStatus,
    pub submitter: IdentityKey,
    pub created_at: DateTime<Utc>,
    #[serde(with = "amount_serde")]
    pub fee_paid: Amount,
}

/// Derive a submission id from its origin.
///
/// Fields are length-prefixed before hashing so that distinct
/// `(action_type, metadata_ref)` splits of the same bytes never collide.
pub fn derive_poa_id(
    submitter: &AgentId,
    action_type: &str,
    metadata_ref: &str,
    created_at: DateTime<Utc>,
    sequence: u64,
) -> PoaId {
    let mut hasher = Sha256::new();
    hasher.update(submitter.as_bytes());
    hasher.update((action_type.len() as u64).to_be_bytes());
    hasher.update(action_type.as_bytes());
    hasher.update((metadata_ref.len() as u64).to_be_bytes());
    hasher.update(metadata_ref.as_bytes());
    hasher.update(created_at.timestamp().to_be_bytes());
    hasher.update(created_at.timestamp_subsec_nanos().to_be_bytes());
    hasher.update(sequence.to_be_bytes());
    PoaId::from_bytes(hasher.finalize().into())
}
