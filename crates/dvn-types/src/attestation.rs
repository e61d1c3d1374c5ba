use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{IdentityKey, PoaId};

/// A single verifier's recorded judgment on a submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attestation {
    pub poa_id: PoaId,
    pub verifier: IdentityKey,
    pub approved: bool,
    /// Opaque reference to an off-chain justification document.
    pub justification_ref: Option<String>,
    pub submitted_at: DateTime<Utc>,
    /// Number of times the vote was updated after it was first cast.
    pub revision: u32,
    /// Reserved for a signed attestation; never checked.
    pub signature: Option<Vec<u8>>,
}

/// Approval and rejection counts for one submission.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tally {
    pub approvals: u64,
    pub rejections: u64,
}

impl Tally {
    pub fn total(&self) -> u64 {
        self.approvals.saturating_add(self.rejections)
    }

    pub fn record(&mut self, approved: bool) {
        if approved {
            self.approvals = self.approvals.saturating_add(1);
        } else {
            self.rejections = self.rejections.saturating_add(1);
        }
    }

    pub fn from_votes<'a>(votes: impl IntoIterator<Item = &'a Attestation>) -> Self {
        let mut tally = Tally::default();
        for vote in votes {
            tally.record(vote.approved);
        }
        tally
    }
}
