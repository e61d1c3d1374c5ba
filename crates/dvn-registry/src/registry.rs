use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use dvn_ledger::{Ledger, LedgerEntryKind, journal};
use dvn_types::{
    AgentId, AgentKind, AgentRecord, Amount, Clock, ConsensusCapability, ConsensusRole, DvnError,
    GrantId, IdentityKey, ProtocolParams, Reputation, Result, Role, StudioCapability,
    VerifierAgent, Weight, WorkerAgent,
};

use crate::reputation::apply_reputation_delta;

#[derive(Debug, Default)]
struct RegistryState {
    agents: HashMap<IdentityKey, AgentRecord>,
    owners: HashMap<AgentId, IdentityKey>,
    verifier_order: Vec<IdentityKey>,
    worker_order: Vec<IdentityKey>,
    total_staked: Amount,
    slashed_pool: Amount,
    consensus_grant: Option<GrantId>,
    studio_grants: HashSet<GrantId>,
}

impl RegistryState {
    fn verifier(&self, identity: &IdentityKey) -> Result<&VerifierAgent> {
        self.agents
            .get(identity)
            .and_then(AgentRecord::as_verifier)
            .ok_or(DvnError::UnknownVerifier(*identity))
    }

    fn verifier_mut(&mut self, identity: &IdentityKey) -> Result<&mut VerifierAgent> {
        match self.agents.get_mut(identity) {
            Some(AgentRecord::Verifier(v)) => Ok(v),
            _ => Err(DvnError::UnknownVerifier(*identity)),
        }
    }

    fn worker_mut(&mut self, identity: &IdentityKey) -> Result<&mut WorkerAgent> {
        match self.agents.get_mut(identity) {
            Some(AgentRecord::Worker(w)) if w.active => Ok(w),
            _ => Err(DvnError::UnknownWorker(*identity)),
        }
    }
}

/// Owner of every agent record, stake balance and reputation score.
///
/// Callers identify themselves by [`IdentityKey`]. Reputation and slashing
/// require the consensus capability issued by [`IdentityRegistry::bind_consensus`];
/// submission counting requires a studio capability authorised through
/// [`IdentityRegistry::authorize_studio`].
pub struct IdentityRegistry {
    state: RwLock<RegistryState>,
    params: ProtocolParams,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
}

impl IdentityRegistry {
    pub fn new(params: ProtocolParams, ledger: Arc<dyn Ledger>, clock: Arc<dyn Clock>) -> Self {
        Self {
            state: RwLock::new(RegistryState::default()),
            params,
            ledger,
            clock,
        }
    }

    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    /// Issue the one consensus capability this registry will ever accept.
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
            "registry",
            cap.grant().to_string(),
            json!({ "role": cap.role() }),
        )
        .await?;
        state.consensus_grant = Some(cap.grant());
        info!(grant = %cap.grant(), "Registry bound to consensus");
        Ok(cap)
    }

    /// Allow a studio capability to count submissions.
    pub async fn authorize_studio(&self, grant: GrantId, cap: &ConsensusCapability) -> Result<()> {
        let mut state = self.state.write().await;
        cap.authorize(state.consensus_grant)?;
        state.studio_grants.insert(grant);
        debug!(grant = %grant, "Studio capability authorised");
        Ok(())
    }

    pub async fn revoke_studio(&self, grant: GrantId, cap: &ConsensusCapability) -> Result<()> {
        let mut state = self.state.write().await;
        cap.authorize(state.consensus_grant)?;
        state.studio_grants.remove(&grant);
        debug!(grant = %grant, "Studio capability revoked");
        Ok(())
    }

    /// Register the caller as a worker or verifier bound to `agent_id`.
    pub async fn register_agent(
        &self,
        caller: IdentityKey,
        agent_id: AgentId,
        kind: AgentKind,
        endpoint: Option<String>,
    ) -> Result<AgentRecord> {
        let mut state = self.state.write().await;

        if agent_id.is_zero() {
            return Err(DvnError::InvalidIdentifier("agent id must be non-zero".into()));
        }
        if caller.is_zero() {
            return Err(DvnError::InvalidIdentifier(
                "identity key must be non-zero".into(),
            ));
        }
        if state.owners.contains_key(&agent_id) {
            return Err(DvnError::InvalidIdentifier(format!(
                "agent id {agent_id} is already bound"
            )));
        }
        if state.agents.contains_key(&caller) {
            return Err(DvnError::AlreadyRegistered(caller));
        }

        let registered_at = self.clock.now();
        let record = match kind {
            AgentKind::Worker => AgentRecord::Worker(WorkerAgent {
                agent_id,
                identity: caller,
                active: true,
                registered_at,
                submission_count: 0,
            }),
            AgentKind::Verifier => AgentRecord::Verifier(VerifierAgent {
                agent_id,
                identity: caller,
                active: true,
                registered_at,
                staked_amount: 0,
                reputation: self.params.initial_reputation,
                endpoint,
            }),
        };

        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::AgentRegistered,
            caller.to_string(),
            caller.to_string(),
            json!({ "agent_id": agent_id, "record": record }),
        )
        .await?;

        state.owners.insert(agent_id, caller);
        match kind {
            AgentKind::Worker => state.worker_order.push(caller),
            AgentKind::Verifier => state.verifier_order.push(caller),
        }
        state.agents.insert(caller, record.clone());

        info!(identity = %caller, agent_id = %agent_id, kind = ?kind, "Agent registered");
        Ok(record)
    }

    /// Deposit stake. Returns the caller's new balance.
    pub async fn stake(&self, caller: IdentityKey, amount: Amount) -> Result<Amount> {
        let mut state = self.state.write().await;
        let verifier = state.verifier(&caller)?;
        if !verifier.active {
            return Err(DvnError::UnknownVerifier(caller));
        }
        if amount < self.params.min_stake {
            return Err(DvnError::InsufficientStake {
                amount,
                required: self.params.min_stake,
            });
        }

        let before = verifier.staked_amount;
        let after = before
            .checked_add(amount)
            .ok_or(DvnError::InvalidAmount(amount))?;
        let total_after = state
            .total_staked
            .checked_add(amount)
            .ok_or(DvnError::InvalidAmount(amount))?;

        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::StakeDeposited,
            caller.to_string(),
            caller.to_string(),
            json!({
                "amount": amount.to_string(),
                "before": before.to_string(),
                "after": after.to_string(),
                "total_staked": total_after.to_string(),
            }),
        )
        .await?;

        state.verifier_mut(&caller)?.staked_amount = after;
        state.total_staked = total_after;

        info!(verifier = %caller, before = %before, after = %after, "Stake deposited");
        Ok(after)
    }

    /// Withdraw stake. Returns the amount released to the caller.
    ///
    /// Inactive verifiers may still withdraw. The remaining balance must be
    /// either zero or at least the minimum stake.
    pub async fn unstake(&self, caller: IdentityKey, amount: Amount) -> Result<Amount> {
        let mut state = self.state.write().await;
        let before = state.verifier(&caller)?.staked_amount;

        if amount == 0 {
            return Err(DvnError::InvalidAmount(amount));
        }
        if amount > before {
            return Err(DvnError::InsufficientBalance {
                requested: amount,
                available: before,
            });
        }
        let after = before - amount;
        if after != 0 && after < self.params.min_stake {
            return Err(DvnError::BelowMinimum {
                remainder: after,
                minimum: self.params.min_stake,
            });
        }
        let total_after = state.total_staked.saturating_sub(amount);

        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::StakeWithdrawn,
            caller.to_string(),
            caller.to_string(),
            json!({
                "amount": amount.to_string(),
                "before": before.to_string(),
                "after": after.to_string(),
                "total_staked": total_after.to_string(),
            }),
        )
        .await?;

        state.verifier_mut(&caller)?.staked_amount = after;
        state.total_staked = total_after;

        info!(verifier = %caller, before = %before, after = %after, "Stake withdrawn");
        Ok(amount)
    }

    /// Apply a signed reputation delta, saturating at `[0, max_reputation]`.
    pub async fn update_reputation(
        &self,
        verifier: IdentityKey,
        delta: i64,
        cap: &ConsensusCapability,
    ) -> Result<Reputation> {
        let mut state = self.state.write().await;
        if let Err(e) = cap.authorize(state.consensus_grant) {
            warn!(verifier = %verifier, delta, "Rejected reputation update");
            return Err(e);
        }

        let before = state.verifier(&verifier)?.reputation;
        let after = apply_reputation_delta(before, delta, self.params.max_reputation);

        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::ReputationUpdated,
            "consensus",
            verifier.to_string(),
            json!({ "delta": delta, "before": before, "after": after }),
        )
        .await?;

        state.verifier_mut(&verifier)?.reputation = after;

        info!(verifier = %verifier, delta, before, after, "Reputation updated");
        Ok(after)
    }

    /// Move `amount` of a verifier's stake into the slashed pool. Returns the
    /// verifier's remaining stake.
    pub async fn slash_stake(
        &self,
        verifier: IdentityKey,
        amount: Amount,
        cap: &ConsensusCapability,
    ) -> Result<Amount> {
        let mut state = self.state.write().await;
        if let Err(e) = cap.authorize(state.consensus_grant) {
            warn!(verifier = %verifier, amount = %amount, "Rejected slash");
            return Err(e);
        }

        let before = state.verifier(&verifier)?.staked_amount;
        if amount == 0 {
            return Err(DvnError::InvalidAmount(amount));
        }
        if amount > before {
            return Err(DvnError::InsufficientStake {
                amount: before,
                required: amount,
            });
        }
        let after = before - amount;
        let total_after = state.total_staked.saturating_sub(amount);
        let pool_after = state.slashed_pool.saturating_add(amount);

        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::StakeSlashed,
            "consensus",
            verifier.to_string(),
            json!({
                "amount": amount.to_string(),
                "before": before.to_string(),
                "after": after.to_string(),
                "slashed_pool": pool_after.to_string(),
            }),
        )
        .await?;

        state.verifier_mut(&verifier)?.staked_amount = after;
        state.total_staked = total_after;
        state.slashed_pool = pool_after;

        warn!(verifier = %verifier, before = %before, after = %after, "Stake slashed");
        Ok(after)
    }

    /// Bump a worker's submission counter. Returns the new count.
    pub async fn increment_submission_count(
        &self,
        worker: IdentityKey,
        cap: &StudioCapability,
    ) -> Result<u64> {
        let mut state = self.state.write().await;
        if let Err(e) = cap.authorize_in(&state.studio_grants) {
            warn!(worker = %worker, "Rejected submission count from unregistered studio");
            return Err(e);
        }

        let before = state.worker_mut(&worker)?.submission_count;
        let after = before.saturating_add(1);

        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::SubmissionCounted,
            format!("studio:{}", cap.grant()),
            worker.to_string(),
            json!({ "before": before, "after": after }),
        )
        .await?;

        state.worker_mut(&worker)?.submission_count = after;

        debug!(worker = %worker, count = after, "Submission counted");
        Ok(after)
    }

    /// Mark the caller's own agent inactive.
    pub async fn deactivate(&self, caller: IdentityKey) -> Result<()> {
        self.set_active(caller, false).await
    }

    /// Mark the caller's own agent active again.
    pub async fn reactivate(&self, caller: IdentityKey) -> Result<()> {
        self.set_active(caller, true).await
    }

    async fn set_active(&self, caller: IdentityKey, active: bool) -> Result<()> {
        let mut state = self.state.write().await;
        let before = state
            .agents
            .get(&caller)
            .ok_or(DvnError::NotRegistered(caller))?
            .is_active();
        if before == active {
            return Ok(());
        }

        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::AgentStatusChanged,
            caller.to_string(),
            caller.to_string(),
            json!({ "before": before, "after": active }),
        )
        .await?;

        if let Some(record) = state.agents.get_mut(&caller) {
            record.set_active(active);
        }
        info!(identity = %caller, active, "Agent status changed");
        Ok(())
    }

    // ── Reads ───────────────────────────────────────────────────────────

    /// `stake × reputation` for an active verifier at or above the minimum stake, else 0.
    pub async fn get_weight(&self, verifier: IdentityKey) -> Weight {
        let state = self.state.read().await;
        state
            .verifier(&verifier)
            .map(|v| v.weight(self.params.min_stake))
            .unwrap_or(0)
    }

    /// Weights for several verifiers read from one snapshot.
    pub async fn weights_of(&self, verifiers: &[IdentityKey]) -> Vec<(IdentityKey, Weight)> {
        let state = self.state.read().await;
        verifiers
            .iter()
            .map(|id| {
                let weight = state
                    .verifier(id)
                    .map(|v| v.weight(self.params.min_stake))
                    .unwrap_or(0);
                (*id, weight)
            })
            .collect()
    }

    pub async fn is_active_verifier(&self, identity: IdentityKey) -> bool {
        let state = self.state.read().await;
        state.verifier(&identity).map(|v| v.active).unwrap_or(false)
    }

    pub async fn is_active_worker(&self, identity: IdentityKey) -> bool {
        let state = self.state.read().await;
        matches!(state.agents.get(&identity), Some(AgentRecord::Worker(w)) if w.active)
    }

    pub async fn agent(&self, identity: IdentityKey) -> Option<AgentRecord> {
        self.state.read().await.agents.get(&identity).cloned()
    }

    pub async fn verifier(&self, identity: IdentityKey) -> Option<VerifierAgent> {
        self.state.read().await.verifier(&identity).ok().cloned()
    }

    pub async fn worker(&self, identity: IdentityKey) -> Option<WorkerAgent> {
        let state = self.state.read().await;
        state
            .agents
            .get(&identity)
            .and_then(AgentRecord::as_worker)
            .cloned()
    }

    pub async fn agent_id_of(&self, identity: IdentityKey) -> Option<AgentId> {
        let state = self.state.read().await;
        state.agents.get(&identity).map(AgentRecord::agent_id)
    }

    pub async fn identity_of(&self, agent_id: AgentId) -> Option<IdentityKey> {
        self.state.read().await.owners.get(&agent_id).copied()
    }

    /// All verifiers in registration order.
    pub async fn all_verifiers(&self) -> Vec<VerifierAgent> {
        let state = self.state.read().await;
        state
            .verifier_order
            .iter()
            .filter_map(|id| state.verifier(id).ok().cloned())
            .collect()
    }

    /// Active verifiers holding at least the minimum stake, in registration order.
    pub async fn staked_verifiers(&self) -> Vec<VerifierAgent> {
        let state = self.state.read().await;
        state
            .verifier_order
            .iter()
            .filter_map(|id| state.verifier(id).ok())
            .filter(|v| v.active && v.staked_amount >= self.params.min_stake)
            .cloned()
            .collect()
    }

    /// All workers in registration order.
    pub async fn all_workers(&self) -> Vec<WorkerAgent> {
        let state = self.state.read().await;
        state
            .worker_order
            .iter()
            .filter_map(|id| state.agents.get(id).and_then(AgentRecord::as_worker))
            .cloned()
            .collect()
    }

    pub async fn total_staked(&self) -> Amount {
        self.state.read().await.total_staked
    }

    pub async fn slashed_pool(&self) -> Amount {
        self.state.read().await.slashed_pool
    }
}
