use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use dvn_attestation::WindowSummary;
use dvn_types::{GrantId, PoaId, SubmissionStatus};

/// Lifecycle of a submission inside the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsensusPhase {
    NotStarted,
    Processing,
    Finalized,
}

/// The engine's bookkeeping for one submission.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub poa_id: PoaId,
    /// Grant of the studio that started processing.
    pub studio: GrantId,
    pub window_opened_at: DateTime<Utc>,
    pub processed: bool,
    pub final_status: Option<SubmissionStatus>,
    pub finalized_at: Option<DateTime<Utc>>,
    /// Set while a finalization is running outside the engine lock.
    pub finalizing: bool,
    /// Votes captured when the window closed, kept so a failed write-back can be retried.
    pub closed_summary: Option<WindowSummary>,
    /// True when readiness came from the timeout rather than quorum.
    pub by_timeout: bool,
    pub emergency: bool,
}

impl ConsensusRecord {
    pub fn new(poa_id: PoaId, studio: GrantId, window_opened_at: DateTime<Utc>) -> Self {
        Self {
            poa_id,
            studio,
            window_opened_at,
            processed: false,
            final_status: None,
            finalized_at: None,
            finalizing: false,
            closed_summary: None,
            by_timeout: false,
            emergency: false,
        }
    }

    pub fn phase(&self) -> ConsensusPhase {
        if self.processed {
            ConsensusPhase::Finalized
        } else {
            ConsensusPhase::Processing
        }
    }
}

/// Running totals of finalized submissions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsensusStats {
    pub processed: u64,
    pub verified: u64,
    pub rejected: u64,
    pub disputed: u64,
    pub emergency: u64,
}

impl ConsensusStats {
    pub fn record(&mut self, status: SubmissionStatus, emergency: bool) {
        self.processed += 1;
        match status {
            SubmissionStatus::Verified => self.verified += 1,
            SubmissionStatus::Rejected => self.rejected += 1,
            SubmissionStatus::Disputed => self.disputed += 1,
            SubmissionStatus::Submitted => {}
        }
        if emergency {
            self.emergency += 1;
        }
    }
}
