use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info};

use dvn_ledger::{Ledger, LedgerEntryKind, journal};
use dvn_registry::IdentityRegistry;
use dvn_types::{
    Attestation, Clock, ConsensusCapability, ConsensusRole, DvnError, GrantId, IdentityKey,
    PoaId, Result, Role, Tally,
};

use crate::window::{WindowEvent, WindowState};

/// Snapshot of a window taken at the moment it closed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSummary {
    pub poa_id: PoaId,
    pub tally: Tally,
    /// Final votes in the order they were first cast.
    pub attestations: Vec<Attestation>,
    pub closed_at: DateTime<Utc>,
}

impl WindowSummary {
    pub fn voters(&self) -> Vec<IdentityKey> {
        self.attestations.iter().map(|a| a.verifier).collect()
    }
}

#[derive(Debug, Default)]
struct AttestationState {
    windows: HashMap<PoaId, WindowState>,
    votes: HashMap<(PoaId, IdentityKey), Attestation>,
    voters: HashMap<PoaId, Vec<IdentityKey>>,
    per_verifier: HashMap<IdentityKey, u64>,
    total_attestations: u64,
    consensus_grant: Option<GrantId>,
}

impl AttestationState {
    fn window(&self, poa_id: &PoaId) -> WindowState {
        self.windows.get(poa_id).copied().unwrap_or_default()
    }

    fn require_open(&self, poa_id: &PoaId) -> Result<()> {
        if self.window(poa_id).is_open() {
            Ok(())
        } else {
            Err(DvnError::NotOpen(*poa_id))
        }
    }

    fn attestations_for(&self, poa_id: &PoaId) -> Vec<Attestation> {
        self.voters
            .get(poa_id)
            .map(|voters| {
                voters
                    .iter()
                    .filter_map(|v| self.votes.get(&(*poa_id, *v)).cloned())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Records verifier judgments per submission.
///
/// Each `(poa_id, verifier)` pair holds at most one attestation. Votes are
/// accepted only while the submission's window is open; the window is opened
/// and closed by the holder of the consensus capability.
pub struct AttestationLedger {
    state: RwLock<AttestationState>,
    registry: Arc<IdentityRegistry>,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
}

impl AttestationLedger {
    pub fn new(registry: Arc<IdentityRegistry>, ledger: Arc<dyn Ledger>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(AttestationState::default()),
            registry,
            ledger,
            clock,
        }
    }

    /// Issue the one consensus capability this ledger will ever accept.
    pub async fn bind_consensus(&self) -> Result<ConsensusCapability> {
        let mut state = self.state.write().await;
        if state.consensus_grant.is_some() {
            return Err(DvnError::AlreadyBound {
                role: ConsensusRole::NAME,
            });
        }
        let cap = ConsensusCapability::mint();
        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::CapabilityBound,
            "attestation",
            cap.grant().to_string(),
            json!({ "role": cap.role() }),
        )
        .await?;
        state.consensus_grant = Some(cap.grant());
        info!(grant = %cap.grant(), "Attestation ledger bound to consensus");
        Ok(cap)
    }

    pub async fn open_for_attestation(&self, poa_id: PoaId, cap: &ConsensusCapability) -> Result<()> {
        let mut state = self.state.write().await;
        cap.authorize(state.consensus_grant)?;
        let next = state.window(&poa_id).transition(WindowEvent::Open, poa_id)?;

        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::WindowOpened,
            "consensus",
            poa_id.to_string(),
            json!({ "opened_at": self.clock.now() }),
        )
        .await?;

        state.windows.insert(poa_id, next);
        info!(poa_id = %poa_id, "Attestation window opened");
        Ok(())
    }

    /// Close the window for good and return the votes it held.
    pub async fn close_for_attestation(
        &self,
        poa_id: PoaId,
        cap: &ConsensusCapability,
    ) -> Result<WindowSummary> {
        let mut state = self.state.write().await;
        cap.authorize(state.consensus_grant)?;
        let next = state.window(&poa_id).transition(WindowEvent::Close, poa_id)?;

        let attestations = state.attestations_for(&poa_id);
        let summary = WindowSummary {
            poa_id,
            tally: Tally::from_votes(&attestations),
            attestations,
            closed_at: self.clock.now(),
        };

        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::WindowClosed,
            "consensus",
            poa_id.to_string(),
            json!({
                "approvals": summary.tally.approvals,
                "rejections": summary.tally.rejections,
                "voters": summary.voters(),
            }),
        )
        .await?;

        state.windows.insert(poa_id, next);
        info!(
            poa_id = %poa_id,
            approvals = summary.tally.approvals,
            rejections = summary.tally.rejections,
            "Attestation window closed"
        );
        Ok(summary)
    }

    /// Forget a window that never reached its close, along with any votes it
    /// collected. Used to roll back a submission whose start failed midway.
    pub async fn discard_window(&self, poa_id: PoaId, cap: &ConsensusCapability) -> Result<()> {
        let mut state = self.state.write().await;
        cap.authorize(state.consensus_grant)?;
        if state.window(&poa_id) == WindowState::Closed {
            return Err(DvnError::WindowFinalized(poa_id));
        }

        let voters = state.voters.remove(&poa_id).unwrap_or_default();
        for verifier in &voters {
            state.votes.remove(&(poa_id, *verifier));
            if let Some(count) = state.per_verifier.get_mut(verifier) {
                *count = count.saturating_sub(1);
            }
        }
        state.total_attestations = state
            .total_attestations
            .saturating_sub(voters.len() as u64);
        state.windows.remove(&poa_id);

        info!(poa_id = %poa_id, discarded_votes = voters.len(), "Attestation window discarded");
        Ok(())
    }

    /// Cast the caller's first vote on an open submission.
    pub async fn submit_vote(
        &self,
        caller: IdentityKey,
        poa_id: PoaId,
        approved: bool,
        justification_ref: Option<String>,
    ) -> Result<Attestation> {
        let mut state = self.state.write().await;
        state.require_open(&poa_id)?;
        if !self.registry.is_active_verifier(caller).await {
            return Err(DvnError::UnknownVerifier(caller));
        }
        if state.votes.contains_key(&(poa_id, caller)) {
            return Err(DvnError::DoubleVote {
                poa_id,
                verifier: caller,
            });
        }

        let attestation = Attestation {
            poa_id,
            verifier: caller,
            approved,
            justification_ref,
            submitted_at: self.clock.now(),
            revision: 0,
            signature: None,
        };
        let count = state.voters.get(&poa_id).map_or(0, Vec::len) + 1;

        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::VoteCast,
            caller.to_string(),
            poa_id.to_string(),
            json!({
                "approved": approved,
                "justification_ref": attestation.justification_ref,
                "attestations": count,
            }),
        )
        .await?;

        state.votes.insert((poa_id, caller), attestation.clone());
        state.voters.entry(poa_id).or_default().push(caller);
        *state.per_verifier.entry(caller).or_default() += 1;
        state.total_attestations += 1;

        info!(poa_id = %poa_id, verifier = %caller, approved, "Vote cast");
        Ok(attestation)
    }

    /// Overwrite the caller's existing vote while the window is still open.
    pub async fn update_vote(
        &self,
        caller: IdentityKey,
        poa_id: PoaId,
        approved: bool,
        justification_ref: Option<String>,
    ) -> Result<Attestation> {
        let mut state = self.state.write().await;
        state.require_open(&poa_id)?;
        if !self.registry.is_active_verifier(caller).await {
            return Err(DvnError::UnknownVerifier(caller));
        }
        let previous = state
            .votes
            .get(&(poa_id, caller))
            .ok_or(DvnError::NoExistingVote {
                poa_id,
                verifier: caller,
            })?;

        let updated = Attestation {
            approved,
            justification_ref,
            submitted_at: self.clock.now(),
            revision: previous.revision.saturating_add(1),
            ..previous.clone()
        };

        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::VoteUpdated,
            caller.to_string(),
            poa_id.to_string(),
            json!({
                "before": previous.approved,
                "after": approved,
                "justification_ref": updated.justification_ref,
                "revision": updated.revision,
            }),
        )
        .await?;

        state.votes.insert((poa_id, caller), updated.clone());
        info!(poa_id = %poa_id, verifier = %caller, approved, revision = updated.revision, "Vote updated");
        Ok(updated)
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub async fn tally(&self, poa_id: PoaId) -> Tally {
        let state = self.state.read().await;
        let tally = Tally::from_votes(&state.attestations_for(&poa_id));
        debug!(poa_id = %poa_id, approvals = tally.approvals, rejections = tally.rejections, "Tally read");
        tally
    }

    /// Verifiers who voted on `poa_id`, in the order they first voted.
    pub async fn voters_for(&self, poa_id: PoaId) -> Vec<IdentityKey> {
        let state = self.state.read().await;
        state.voters.get(&poa_id).cloned().unwrap_or_default()
    }

    pub async fn attestations_for(&self, poa_id: PoaId) -> Vec<Attestation> {
        self.state.read().await.attestations_for(&poa_id)
    }

    pub async fn attestation(&self, poa_id: PoaId, verifier: IdentityKey) -> Option<Attestation> {
        let state = self.state.read().await;
        state.votes.get(&(poa_id, verifier)).cloned()
    }

    pub async fn window_state(&self, poa_id: PoaId) -> WindowState {
        self.state.read().await.window(&poa_id)
    }

    pub async fn total_attestations(&self) -> u64 {
        self.state.read().await.total_attestations
    }

    /// Number of first votes cast by `verifier` across all submissions.
    pub async fn attestations_by(&self, verifier: IdentityKey) -> u64 {
        let state = self.state.read().await;
        state.per_verifier.get(&verifier).copied().unwrap_or(0)
    }
}
