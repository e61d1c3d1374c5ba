use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use dvn_attestation::{AttestationLedger, WindowSummary};
use dvn_ledger::{Ledger, LedgerEntryKind, journal};
use dvn_registry::IdentityRegistry;
use dvn_types::{
    AdminCapability, Amount, Clock, ConsensusCapability, DvnError, GrantId, IdentityKey, PoaId,
    ProtocolParams, Reputation, Result, Role, StudioCapability, StudioRole, SubmissionStatus,
    TallyRule, Weight,
};

use crate::record::{ConsensusPhase, ConsensusRecord, ConsensusStats};
use crate::rule::{count_verdict, weighted_verdict};
use crate::studio::{Studio, StudioBinding, StudioInfo};

struct StudioEntry {
    info: StudioInfo,
    studio: Weak<dyn Studio>,
}

#[derive(Default)]
struct EngineState {
    records: HashMap<PoaId, ConsensusRecord>,
    studios: HashMap<GrantId, StudioEntry>,
    stats: ConsensusStats,
}

/// Who asked for a submission to be finalized.
#[derive(Debug, Clone, Copy)]
enum Trigger {
    Studio(GrantId),
    Emergency,
}

/// Everything the unlocked half of a finalization needs.
struct Pending {
    studio: Arc<dyn Studio>,
    studio_name: String,
    summary: Option<WindowSummary>,
    by_timeout: bool,
    emergency: bool,
}

/// Drives each submission from an open attestation window to a final status.
///
/// The engine owns the consensus capabilities of the registry and the
/// attestation ledger, mints the admin capability handed back by
/// [`ConsensusEngine::wire`], and keeps a separate consensus authority it
/// presents to studios on status write-back.
pub struct ConsensusEngine {
    state: Mutex<EngineState>,
    params: ProtocolParams,
    registry: Arc<IdentityRegistry>,
    attestations: Arc<AttestationLedger>,
    ledger: Arc<dyn Ledger>,
    clock: Arc<dyn Clock>,
    registry_cap: ConsensusCapability,
    attestation_cap: ConsensusCapability,
    authority: ConsensusCapability,
    admin_grant: GrantId,
}

impl ConsensusEngine {
    /// Build the registry and attestation ledger, bind their consensus
    /// capabilities to a new engine, and return the operator's admin capability.
    pub async fn wire(
        params: ProtocolParams,
        ledger: Arc<dyn Ledger>,
        clock: Arc<dyn Clock>,
    ) -> Result<(Arc<Self>, AdminCapability)> {
        params.validate()?;

        let registry = Arc::new(IdentityRegistry::new(
            params.clone(),
            ledger.clone(),
            clock.clone(),
        ));
        let attestations = Arc::new(AttestationLedger::new(
            registry.clone(),
            ledger.clone(),
            clock.clone(),
        ));
        let registry_cap = registry.bind_consensus().await?;
        let attestation_cap = attestations.bind_consensus().await?;

        let admin = AdminCapability::mint();
        let authority = ConsensusCapability::mint();
        journal(
            ledger.as_ref(),
            LedgerEntryKind::CapabilityBound,
            "consensus",
            admin.grant().to_string(),
            json!({ "role": admin.role(), "authority": authority.grant() }),
        )
        .await?;

        info!(
            tally_rule = ?params.tally_rule,
            min_attestations = params.min_attestations,
            threshold = params.consensus_threshold,
            "Consensus engine wired"
        );

        let engine = Arc::new(Self {
            state: Mutex::new(EngineState::default()),
            admin_grant: admin.grant(),
            params,
            registry,
            attestations,
            ledger,
            clock,
            registry_cap,
            attestation_cap,
            authority,
        });
        Ok((engine, admin))
    }

    pub fn params(&self) -> &ProtocolParams {
        &self.params
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.registry
    }

    pub fn attestations(&self) -> &Arc<AttestationLedger> {
        &self.attestations
    }

    pub fn ledger(&self) -> &Arc<dyn Ledger> {
        &self.ledger
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Grant a studio must see on `update_status` calls.
    pub fn authority_grant(&self) -> GrantId {
        self.authority.grant()
    }

    fn authorize_admin(&self, admin: &AdminCapability, operation: &'static str) -> Result<()> {
        admin
            .authorize(Some(self.admin_grant))
            .inspect_err(|_| warn!(operation, "Rejected privileged call"))
    }

    fn studio_name(state: &EngineState, grant: GrantId) -> Result<String> {
        match state.studios.get(&grant) {
            Some(entry) => Ok(entry.info.name.clone()),
            None => {
                warn!(grant = %grant, "Rejected call from unregistered studio");
                Err(DvnError::Unauthorized {
                    role: StudioRole::NAME,
                })
            }
        }
    }

    // ── Studio allow-list ───────────────────────────────────────────────

    /// Admit a studio: mint its capability, authorise it in the registry and
    /// hand it the binding. Returns the studio's grant.
    pub async fn register_studio<S: Studio + 'static>(
        &self,
        studio: &Arc<S>,
        name: impl Into<String>,
        admin: &AdminCapability,
    ) -> Result<GrantId> {
        self.authorize_admin(admin, "register_studio")?;
        let name = name.into();
        if name.trim().is_empty() {
            return Err(DvnError::InvalidReference(
                "studio name must not be empty".into(),
            ));
        }

        let capability = StudioCapability::mint();
        let grant = capability.grant();
        let weak: Weak<S> = Arc::downgrade(studio);
        let weak: Weak<dyn Studio> = weak;
        studio
            .bind(StudioBinding {
                capability,
                consensus_authority: self.authority.grant(),
            })
            .await?;

        let mut state = self.state.lock().await;
        let info = StudioInfo {
            grant,
            name,
            registered_at: self.clock.now(),
        };
        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::StudioRegistered,
            "admin",
            grant.to_string(),
            json!({ "name": info.name }),
        )
        .await?;
        self.registry
            .authorize_studio(grant, &self.registry_cap)
            .await?;

        info!(studio = %info.name, grant = %grant, "Studio registered");
        state.studios.insert(grant, StudioEntry { info, studio: weak });
        Ok(grant)
    }

    pub async fn deregister_studio(&self, grant: GrantId, admin: &AdminCapability) -> Result<()> {
        self.authorize_admin(admin, "deregister_studio")?;
        let mut state = self.state.lock().await;
        let name = state
            .studios
            .get(&grant)
            .map(|entry| entry.info.name.clone())
            .ok_or_else(|| DvnError::InvalidReference(format!("unknown studio {grant}")))?;

        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::StudioDeregistered,
            "admin",
            grant.to_string(),
            json!({ "name": name }),
        )
        .await?;
        self.registry.revoke_studio(grant, &self.registry_cap).await?;
        state.studios.remove(&grant);

        info!(studio = %name, grant = %grant, "Studio deregistered");
        Ok(())
    }

    // ── Submission lifecycle ────────────────────────────────────────────

    /// Open the attestation window for a new submission.
    pub async fn start_processing(&self, poa_id: PoaId, cap: &StudioCapability) -> Result<()> {
        let mut state = self.state.lock().await;
        let studio_name = Self::studio_name(&state, cap.grant())?;
        if state.records.contains_key(&poa_id) {
            return Err(DvnError::AlreadyStarted(poa_id));
        }

        let opened_at = self.clock.now();
        let ready_at = self.deadline(opened_at, self.params.attestation_timeout())?;
        self.attestations
            .open_for_attestation(poa_id, &self.attestation_cap)
            .await?;

        let started = journal(
            self.ledger.as_ref(),
            LedgerEntryKind::ProcessingStarted,
            studio_name.as_str(),
            poa_id.to_string(),
            json!({
                "studio": cap.grant(),
                "window_opened_at": opened_at,
                "ready_at": ready_at,
            }),
        )
        .await;
        if let Err(e) = started {
            self.discard_window(poa_id).await;
            return Err(e);
        }

        state
            .records
            .insert(poa_id, ConsensusRecord::new(poa_id, cap.grant(), opened_at));
        info!(poa_id = %poa_id, studio = %studio_name, "Processing started");
        Ok(())
    }

    /// Roll back a submission the studio failed to store after starting it.
    ///
    /// Only the starting studio may abandon, and only before finalization
    /// has begun. The window and any votes it gathered are dropped.
    pub async fn abandon_processing(&self, poa_id: PoaId, cap: &StudioCapability) -> Result<()> {
        let mut state = self.state.lock().await;
        let studio_name = Self::studio_name(&state, cap.grant())?;
        let record = state
            .records
            .get(&poa_id)
            .ok_or(DvnError::NotStarted(poa_id))?;
        if record.studio != cap.grant() {
            warn!(poa_id = %poa_id, "Rejected abandon by a foreign studio");
            return Err(DvnError::Unauthorized {
                role: StudioRole::NAME,
            });
        }
        if record.processed {
            return Err(DvnError::AlreadyProcessed(poa_id));
        }
        if record.finalizing || record.closed_summary.is_some() {
            return Err(DvnError::FinalizationInProgress(poa_id));
        }

        self.attestations
            .discard_window(poa_id, &self.attestation_cap)
            .await?;
        state.records.remove(&poa_id);

        // The rollback stands even if the audit write fails.
        if let Err(e) = journal(
            self.ledger.as_ref(),
            LedgerEntryKind::ProcessingAbandoned,
            studio_name.as_str(),
            poa_id.to_string(),
            json!({ "studio": cap.grant() }),
        )
        .await
        {
            warn!(poa_id = %poa_id, error = %e, "Abandon not journaled");
        }
        info!(poa_id = %poa_id, studio = %studio_name, "Processing abandoned");
        Ok(())
    }

    async fn discard_window(&self, poa_id: PoaId) {
        if let Err(e) = self
            .attestations
            .discard_window(poa_id, &self.attestation_cap)
            .await
        {
            warn!(poa_id = %poa_id, error = %e, "Failed to discard attestation window");
        }
    }

    /// `from + after`, or `InvalidParams` when it leaves the calendar range.
    fn deadline(&self, from: DateTime<Utc>, after: TimeDelta) -> Result<DateTime<Utc>> {
        from.checked_add_signed(after).ok_or_else(|| {
            DvnError::InvalidParams(format!(
                "deadline {from} + {}s is out of range",
                after.num_seconds()
            ))
        })
    }

    /// Finalize a submission once it has quorum or its window has timed out.
    pub async fn process_consensus(
        &self,
        poa_id: PoaId,
        cap: &StudioCapability,
    ) -> Result<SubmissionStatus> {
        self.finalize(poa_id, Trigger::Studio(cap.grant())).await
    }

    /// Finalize regardless of quorum once the emergency timeout has passed.
    pub async fn emergency_process(
        &self,
        poa_id: PoaId,
        admin: &AdminCapability,
    ) -> Result<SubmissionStatus> {
        self.authorize_admin(admin, "emergency_process")?;
        self.finalize(poa_id, Trigger::Emergency).await
    }

    async fn finalize(&self, poa_id: PoaId, trigger: Trigger) -> Result<SubmissionStatus> {
        let pending = self.begin_finalization(poa_id, trigger).await?;

        let outcome = match self.run_finalization(poa_id, &pending).await {
            Ok((status, summary)) => self
                .commit_finalization(poa_id, &pending, status, &summary)
                .await
                .map(|()| status),
            Err(e) => Err(e),
        };

        if let Err(e) = &outcome {
            if let Some(record) = self.state.lock().await.records.get_mut(&poa_id) {
                record.finalizing = false;
            }
            warn!(poa_id = %poa_id, error = %e, "Finalization aborted");
        }
        outcome
    }

    /// Check every precondition and raise the `finalizing` guard.
    async fn begin_finalization(&self, poa_id: PoaId, trigger: Trigger) -> Result<Pending> {
        let mut state = self.state.lock().await;
        if let Trigger::Studio(grant) = trigger {
            Self::studio_name(&state, grant)?;
        }

        let record = state
            .records
            .get(&poa_id)
            .ok_or(DvnError::NotStarted(poa_id))?;
        match trigger {
            Trigger::Studio(grant) if record.studio != grant => {
                warn!(poa_id = %poa_id, grant = %grant, "Rejected finalization by a foreign studio");
                return Err(DvnError::Unauthorized {
                    role: StudioRole::NAME,
                });
            }
            _ => {}
        }
        if record.processed {
            return Err(DvnError::AlreadyProcessed(poa_id));
        }
        if record.finalizing {
            return Err(DvnError::FinalizationInProgress(poa_id));
        }

        let emergency = matches!(trigger, Trigger::Emergency);
        let by_timeout = match &record.closed_summary {
            Some(_) => record.by_timeout,
            None => {
                let tally = self.attestations.tally(poa_id).await;
                let now = self.clock.now();
                let quorum = tally.total() >= self.params.min_attestations;
                let ready_at = self.deadline(
                    record.window_opened_at,
                    if emergency {
                        self.params.emergency_timeout()
                    } else {
                        self.params.attestation_timeout()
                    },
                )?;
                let timed_out = now >= ready_at;
                if (emergency && !timed_out) || (!quorum && !timed_out) {
                    debug!(poa_id = %poa_id, attestations = tally.total(), "Not ready");
                    return Err(DvnError::NotReady {
                        poa_id,
                        attestations: tally.total(),
                        required: self.params.min_attestations,
                        ready_at,
                    });
                }
                !quorum
            }
        };

        let entry = state.studios.get(&record.studio);
        let studio = entry
            .and_then(|e| e.studio.upgrade())
            .ok_or_else(|| {
                DvnError::Internal(format!("studio {} is no longer registered", record.studio))
            })?;
        let studio_name = entry.map(|e| e.info.name.clone()).unwrap_or_default();
        let summary = record.closed_summary.clone();

        if let Some(record) = state.records.get_mut(&poa_id) {
            record.finalizing = true;
            record.by_timeout = by_timeout;
        }

        Ok(Pending {
            studio,
            studio_name,
            summary,
            by_timeout,
            emergency,
        })
    }

    /// Close the window, compute the verdict and write it to the studio.
    /// Runs without the engine lock; re-entrant calls hit the `finalizing` guard.
    async fn run_finalization(
        &self,
        poa_id: PoaId,
        pending: &Pending,
    ) -> Result<(SubmissionStatus, WindowSummary)> {
        let current = pending.studio.submission_status(poa_id).await?;

        let summary = match &pending.summary {
            Some(summary) => summary.clone(),
            None => {
                if current.is_final() {
                    return Err(DvnError::AlreadyProcessed(poa_id));
                }
                let summary = self
                    .attestations
                    .close_for_attestation(poa_id, &self.attestation_cap)
                    .await?;
                if let Some(record) = self.state.lock().await.records.get_mut(&poa_id) {
                    record.closed_summary = Some(summary.clone());
                }
                summary
            }
        };

        // An earlier attempt already wrote the status but failed to commit.
        if current.is_final() {
            return Ok((current, summary));
        }

        let status = self.verdict(&summary).await;
        pending
            .studio
            .update_status(poa_id, status, &self.authority)
            .await?;
        Ok((status, summary))
    }

    async fn commit_finalization(
        &self,
        poa_id: PoaId,
        pending: &Pending,
        status: SubmissionStatus,
        summary: &WindowSummary,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        let window_opened_at = state
            .records
            .get(&poa_id)
            .map(|r| r.window_opened_at)
            .ok_or(DvnError::NotStarted(poa_id))?;

        if pending.by_timeout {
            journal(
                self.ledger.as_ref(),
                LedgerEntryKind::TimeoutReached,
                "consensus",
                poa_id.to_string(),
                json!({
                    "window_opened_at": window_opened_at,
                    "attestations": summary.tally.total(),
                    "required": self.params.min_attestations,
                }),
            )
            .await?;
            info!(poa_id = %poa_id, attestations = summary.tally.total(), "Attestation timeout reached");
        }

        self.distribute_rewards(poa_id, summary).await?;

        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::ConsensusFinalized,
            "consensus",
            poa_id.to_string(),
            json!({
                "studio": pending.studio_name,
                "before": SubmissionStatus::Submitted,
                "after": status,
                "approvals": summary.tally.approvals,
                "rejections": summary.tally.rejections,
                "voters": summary.voters(),
                "tally_rule": self.params.tally_rule,
                "by_timeout": pending.by_timeout,
            }),
        )
        .await?;

        if pending.emergency {
            journal(
                self.ledger.as_ref(),
                LedgerEntryKind::EmergencyProcessed,
                "admin",
                poa_id.to_string(),
                json!({ "status": status }),
            )
            .await?;
        }

        let finalized_at = self.clock.now();
        if let Some(record) = state.records.get_mut(&poa_id) {
            record.processed = true;
            record.finalizing = false;
            record.final_status = Some(status);
            record.finalized_at = Some(finalized_at);
            record.emergency = pending.emergency;
        }
        state.stats.record(status, pending.emergency);

        info!(
            poa_id = %poa_id,
            status = %status,
            approvals = summary.tally.approvals,
            rejections = summary.tally.rejections,
            emergency = pending.emergency,
            "Consensus finalized"
        );
        Ok(())
    }

    async fn verdict(&self, summary: &WindowSummary) -> SubmissionStatus {
        let threshold = self.params.consensus_threshold;
        match self.params.tally_rule {
            TallyRule::VoteCount => count_verdict(&summary.tally, threshold),
            TallyRule::StakeWeighted => {
                let weights = self.registry.weights_of(&summary.voters()).await;
                let votes: Vec<(bool, Weight)> = summary
                    .attestations
                    .iter()
                    .zip(weights)
                    .map(|(vote, (_, weight))| (vote.approved, weight))
                    .collect();
                weighted_verdict(&votes, threshold)
            }
        }
    }

    /// Reward hook. Enumerates the attestors and records the event; moves no value.
    async fn distribute_rewards(&self, poa_id: PoaId, summary: &WindowSummary) -> Result<()> {
        for vote in &summary.attestations {
            debug!(poa_id = %poa_id, verifier = %vote.verifier, approved = vote.approved, "Attestor eligible for reward");
        }
        journal(
            self.ledger.as_ref(),
            LedgerEntryKind::RewardsDistributed,
            "consensus",
            poa_id.to_string(),
            json!({ "attestors": summary.voters(), "amount": "0" }),
        )
        .await?;
        Ok(())
    }

    // ── Governance pass-throughs ────────────────────────────────────────

    pub async fn adjust_reputation(
        &self,
        verifier: IdentityKey,
        delta: i64,
        admin: &AdminCapability,
    ) -> Result<Reputation> {
        self.authorize_admin(admin, "adjust_reputation")?;
        self.registry
            .update_reputation(verifier, delta, &self.registry_cap)
            .await
    }

    pub async fn slash(
        &self,
        verifier: IdentityKey,
        amount: Amount,
        admin: &AdminCapability,
    ) -> Result<Amount> {
        self.authorize_admin(admin, "slash")?;
        self.registry
            .slash_stake(verifier, amount, &self.registry_cap)
            .await
    }

    // ── Reads ───────────────────────────────────────────────────────────

    pub async fn record(&self, poa_id: PoaId) -> Option<ConsensusRecord> {
        self.state.lock().await.records.get(&poa_id).cloned()
    }

    pub async fn phase(&self, poa_id: PoaId) -> ConsensusPhase {
        self.state
            .lock()
            .await
            .records
            .get(&poa_id)
            .map_or(ConsensusPhase::NotStarted, ConsensusRecord::phase)
    }

    pub async fn stats(&self) -> ConsensusStats {
        self.state.lock().await.stats
    }

    /// Registered studios, oldest first.
    pub async fn studios(&self) -> Vec<StudioInfo> {
        let state = self.state.lock().await;
        let mut studios: Vec<StudioInfo> =
            state.studios.values().map(|e| e.info.clone()).collect();
        studios.sort_by(|a, b| a.registered_at.cmp(&b.registered_at).then(a.name.cmp(&b.name)));
        studios
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeDelta;
    use dvn_attestation::WindowState;
    use dvn_ledger::InMemoryLedger;
    use dvn_types::{AgentId, AgentKind, MIN_STAKE, ManualClock};
    use std::sync::OnceLock;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    /// Studio double that keeps statuses in memory and can misbehave on demand.
    struct MockStudio {
        engine: Arc<ConsensusEngine>,
        binding: OnceLock<StudioBinding>,
        statuses: std::sync::Mutex<HashMap<PoaId, SubmissionStatus>>,
        reenter: AtomicBool,
        nested: std::sync::Mutex<Option<DvnError>>,
        failing_writes: AtomicU32,
    }

    impl MockStudio {
        fn new(engine: Arc<ConsensusEngine>) -> Self {
            Self {
                engine,
                binding: OnceLock::new(),
                statuses: std::sync::Mutex::new(HashMap::new()),
                reenter: AtomicBool::new(false),
                nested: std::sync::Mutex::new(None),
                failing_writes: AtomicU32::new(0),
            }
        }

        fn cap(&self) -> &StudioCapability {
            &self.binding.get().unwrap().capability
        }

        async fn submit(&self, label: &str) -> PoaId {
            let poa = PoaId::from_label(label);
            self.statuses
                .lock()
                .unwrap()
                .insert(poa, SubmissionStatus::Submitted);
            self.engine.start_processing(poa, self.cap()).await.unwrap();
            poa
        }

        async fn finalize(&self, poa: PoaId) -> Result<SubmissionStatus> {
            self.engine.process_consensus(poa, self.cap()).await
        }

        fn status(&self, poa: PoaId) -> SubmissionStatus {
            self.statuses.lock().unwrap()[&poa]
        }
    }

    #[async_trait]
    impl Studio for MockStudio {
        async fn bind(&self, binding: StudioBinding) -> Result<()> {
            self.binding
                .set(binding)
                .map_err(|_| DvnError::AlreadyBound { role: "studio" })
        }

        async fn submission_status(&self, poa_id: PoaId) -> Result<SubmissionStatus> {
            self.statuses
                .lock()
                .unwrap()
                .get(&poa_id)
                .copied()
                .ok_or(DvnError::SubmissionNotFound(poa_id))
        }

        async fn update_status(
            &self,
            poa_id: PoaId,
            status: SubmissionStatus,
            authority: &ConsensusCapability,
        ) -> Result<()> {
            authority.authorize(Some(self.binding.get().unwrap().consensus_authority))?;
            if self.reenter.load(Ordering::SeqCst) {
                let nested = self.engine.process_consensus(poa_id, self.cap()).await;
                *self.nested.lock().unwrap() = nested.err();
            }
            if self
                .failing_writes
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(DvnError::Internal("studio storage unavailable".into()));
            }
            self.statuses.lock().unwrap().insert(poa_id, status);
            Ok(())
        }
    }

    struct Harness {
        engine: Arc<ConsensusEngine>,
        admin: AdminCapability,
        clock: Arc<ManualClock>,
        ledger: Arc<InMemoryLedger>,
        studio: Arc<MockStudio>,
    }

    fn id(label: &str) -> IdentityKey {
        IdentityKey::from_label(label)
    }

    async fn harness_with(params: ProtocolParams, stakes: &[(&str, Amount)]) -> Harness {
        let clock = Arc::new(ManualClock::default());
        let ledger = Arc::new(InMemoryLedger::with_clock(clock.clone()));
        let (engine, admin) = ConsensusEngine::wire(params, ledger.clone(), clock.clone())
            .await
            .unwrap();

        for (label, stake) in stakes {
            let registry = engine.registry();
            registry
                .register_agent(id(label), AgentId::from_label(label), AgentKind::Verifier, None)
                .await
                .unwrap();
            registry.stake(id(label), *stake).await.unwrap();
        }

        let studio = Arc::new(MockStudio::new(engine.clone()));
        engine
            .register_studio(&studio, "mock", &admin)
            .await
            .unwrap();

        Harness {
            engine,
            admin,
            clock,
            ledger,
            studio,
        }
    }

    async fn harness() -> Harness {
        harness_with(
            ProtocolParams::default(),
            &[
                ("v1", MIN_STAKE),
                ("v2", MIN_STAKE),
                ("v3", MIN_STAKE),
                ("v4", MIN_STAKE),
            ],
        )
        .await
    }

    impl Harness {
        async fn vote(&self, verifier: &str, poa: PoaId, approved: bool) {
            self.engine
                .attestations()
                .submit_vote(id(verifier), poa, approved, None)
                .await
                .unwrap();
        }

        fn timeout(&self) {
            self.clock
                .advance(self.engine.params().attestation_timeout() + TimeDelta::seconds(1));
        }
    }

    #[tokio::test]
    async fn test_two_of_three_verified() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        h.vote("v1", poa, true).await;
        h.vote("v2", poa, true).await;
        h.vote("v3", poa, false).await;

        assert_eq!(h.studio.finalize(poa).await.unwrap(), SubmissionStatus::Verified);
        assert_eq!(h.studio.status(poa), SubmissionStatus::Verified);

        let record = h.engine.record(poa).await.unwrap();
        assert!(record.processed);
        assert!(!record.finalizing);
        assert!(!record.by_timeout);
        assert_eq!(record.final_status, Some(SubmissionStatus::Verified));
        assert_eq!(h.engine.stats().await.verified, 1);
        assert_eq!(
            h.engine.attestations().window_state(poa).await,
            WindowState::Closed
        );
    }

    #[tokio::test]
    async fn test_one_of_three_rejected() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        h.vote("v1", poa, true).await;
        h.vote("v2", poa, false).await;
        h.vote("v3", poa, false).await;

        assert_eq!(h.studio.finalize(poa).await.unwrap(), SubmissionStatus::Rejected);
        assert_eq!(h.engine.stats().await.rejected, 1);
    }

    #[tokio::test]
    async fn test_split_vote_disputed() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        h.vote("v1", poa, true).await;
        h.vote("v2", poa, true).await;
        h.vote("v3", poa, false).await;
        h.vote("v4", poa, false).await;

        assert_eq!(h.studio.finalize(poa).await.unwrap(), SubmissionStatus::Disputed);
        assert_eq!(h.engine.stats().await.disputed, 1);
    }

    #[tokio::test]
    async fn test_readiness_gate() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        h.vote("v1", poa, true).await;
        h.vote("v2", poa, false).await;

        let err = h.studio.finalize(poa).await.unwrap_err();
        assert!(matches!(
            err,
            DvnError::NotReady {
                attestations: 2,
                required: 3,
                ..
            }
        ));
        assert!(!h.engine.record(poa).await.unwrap().finalizing);
        assert!(h.engine.attestations().window_state(poa).await.is_open());

        h.timeout();
        assert_eq!(h.studio.finalize(poa).await.unwrap(), SubmissionStatus::Disputed);
        assert!(h.engine.record(poa).await.unwrap().by_timeout);
    }

    #[tokio::test]
    async fn test_no_votes_at_timeout_disputed() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        h.timeout();

        assert_eq!(h.studio.finalize(poa).await.unwrap(), SubmissionStatus::Disputed);
        let timeouts = h
            .ledger
            .query_by_kind(LedgerEntryKind::TimeoutReached)
            .await
            .unwrap();
        assert_eq!(timeouts.len(), 1);
        assert_eq!(timeouts[0].subject, poa.to_string());
    }

    #[tokio::test]
    async fn test_process_consensus_idempotent() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        for v in ["v1", "v2", "v3"] {
            h.vote(v, poa, true).await;
        }
        h.studio.finalize(poa).await.unwrap();

        let err = h.studio.finalize(poa).await.unwrap_err();
        assert!(matches!(err, DvnError::AlreadyProcessed(_)));
        assert_eq!(h.engine.stats().await.processed, 1);
        assert_eq!(
            h.ledger
                .query_by_kind(LedgerEntryKind::ConsensusFinalized)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_unknown_submission_not_started() {
        let h = harness().await;
        let err = h
            .studio
            .finalize(PoaId::from_label("missing"))
            .await
            .unwrap_err();
        assert!(matches!(err, DvnError::NotStarted(_)));
        assert_eq!(
            h.engine.phase(PoaId::from_label("missing")).await,
            ConsensusPhase::NotStarted
        );
    }

    #[tokio::test]
    async fn test_start_processing_twice() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        let err = h
            .engine
            .start_processing(poa, h.studio.cap())
            .await
            .unwrap_err();
        assert!(matches!(err, DvnError::AlreadyStarted(_)));
        assert_eq!(h.engine.phase(poa).await, ConsensusPhase::Processing);
    }

    #[tokio::test]
    async fn test_unregistered_studio_rejected() {
        let h = harness().await;
        let rogue = StudioCapability::mint();
        let poa = PoaId::from_label("p1");
        let err = h.engine.start_processing(poa, &rogue).await.unwrap_err();
        assert!(matches!(err, DvnError::Unauthorized { role: "studio" }));
        assert_eq!(h.engine.phase(poa).await, ConsensusPhase::NotStarted);
    }

    #[tokio::test]
    async fn test_foreign_studio_cannot_finalize() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        h.timeout();

        let other = Arc::new(MockStudio::new(h.engine.clone()));
        h.engine
            .register_studio(&other, "other", &h.admin)
            .await
            .unwrap();
        let err = other.finalize(poa).await.unwrap_err();
        assert!(matches!(err, DvnError::Unauthorized { .. }));
        assert!(!h.engine.record(poa).await.unwrap().processed);
    }

    #[tokio::test]
    async fn test_nested_finalization_rejected() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        for v in ["v1", "v2", "v3"] {
            h.vote(v, poa, true).await;
        }
        h.studio.reenter.store(true, Ordering::SeqCst);

        assert_eq!(h.studio.finalize(poa).await.unwrap(), SubmissionStatus::Verified);
        let nested = h.studio.nested.lock().unwrap().take();
        assert!(matches!(nested, Some(DvnError::FinalizationInProgress(_))));
        assert_eq!(h.engine.stats().await.processed, 1);
    }

    #[tokio::test]
    async fn test_failed_write_back_can_be_retried() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        h.vote("v1", poa, true).await;
        h.vote("v2", poa, true).await;
        h.vote("v3", poa, false).await;
        h.studio.failing_writes.store(1, Ordering::SeqCst);

        let err = h.studio.finalize(poa).await.unwrap_err();
        assert!(matches!(err, DvnError::Internal(_)));
        let record = h.engine.record(poa).await.unwrap();
        assert!(!record.processed);
        assert!(!record.finalizing);
        assert!(record.closed_summary.is_some());
        assert_eq!(h.studio.status(poa), SubmissionStatus::Submitted);

        assert_eq!(h.studio.finalize(poa).await.unwrap(), SubmissionStatus::Verified);
        assert_eq!(h.studio.status(poa), SubmissionStatus::Verified);
        assert_eq!(h.engine.stats().await.processed, 1);
    }

    #[tokio::test]
    async fn test_emergency_process() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        h.vote("v1", poa, true).await;

        let forged = AdminCapability::mint();
        let err = h.engine.emergency_process(poa, &forged).await.unwrap_err();
        assert!(matches!(err, DvnError::Unauthorized { role: "admin" }));

        h.timeout();
        let err = h.engine.emergency_process(poa, &h.admin).await.unwrap_err();
        assert!(matches!(err, DvnError::NotReady { .. }));

        h.timeout();
        assert_eq!(
            h.engine.emergency_process(poa, &h.admin).await.unwrap(),
            SubmissionStatus::Verified
        );
        let record = h.engine.record(poa).await.unwrap();
        assert!(record.emergency);
        assert_eq!(h.engine.stats().await.emergency, 1);
        assert_eq!(
            h.ledger
                .query_by_kind(LedgerEntryKind::EmergencyProcessed)
                .await
                .unwrap()
                .len(),
            1
        );
    }

    #[tokio::test]
    async fn test_stake_weighted_rule() {
        let params = ProtocolParams::default().with_tally_rule(TallyRule::StakeWeighted);
        let h = harness_with(
            params,
            &[
                ("whale", 10 * MIN_STAKE),
                ("v2", MIN_STAKE),
                ("v3", MIN_STAKE),
            ],
        )
        .await;
        let poa = h.studio.submit("p1").await;
        h.vote("whale", poa, false).await;
        h.vote("v2", poa, true).await;
        h.vote("v3", poa, true).await;

        assert_eq!(h.studio.finalize(poa).await.unwrap(), SubmissionStatus::Rejected);
    }

    #[tokio::test]
    async fn test_stake_weighted_ignores_unstaked_voters() {
        let params = ProtocolParams::default().with_tally_rule(TallyRule::StakeWeighted);
        let h = harness_with(
            params,
            &[("v1", MIN_STAKE), ("v2", MIN_STAKE), ("v3", MIN_STAKE)],
        )
        .await;
        let poa = h.studio.submit("p1").await;
        h.vote("v1", poa, true).await;
        h.vote("v2", poa, false).await;
        h.vote("v3", poa, false).await;
        h.engine
            .registry()
            .unstake(id("v2"), MIN_STAKE)
            .await
            .unwrap();
        h.engine
            .registry()
            .unstake(id("v3"), MIN_STAKE)
            .await
            .unwrap();

        assert_eq!(h.studio.finalize(poa).await.unwrap(), SubmissionStatus::Verified);
    }

    #[tokio::test]
    async fn test_deregistered_studio_loses_access() {
        let h = harness().await;
        let grant = h.studio.cap().grant();
        h.engine.deregister_studio(grant, &h.admin).await.unwrap();
        assert!(h.engine.studios().await.is_empty());

        let err = h
            .engine
            .start_processing(PoaId::from_label("p1"), h.studio.cap())
            .await
            .unwrap_err();
        assert!(matches!(err, DvnError::Unauthorized { .. }));

        let err = h
            .engine
            .deregister_studio(grant, &h.admin)
            .await
            .unwrap_err();
        assert!(matches!(err, DvnError::InvalidReference(_)));
    }

    #[tokio::test]
    async fn test_studio_registration_requires_admin() {
        let h = harness().await;
        let other = Arc::new(MockStudio::new(h.engine.clone()));
        let err = h
            .engine
            .register_studio(&other, "other", &AdminCapability::mint())
            .await
            .unwrap_err();
        assert!(matches!(err, DvnError::Unauthorized { role: "admin" }));
        assert_eq!(h.engine.studios().await.len(), 1);
    }

    #[tokio::test]
    async fn test_studio_rejects_foreign_authority() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        let forged = ConsensusCapability::mint();
        let err = h
            .studio
            .update_status(poa, SubmissionStatus::Verified, &forged)
            .await
            .unwrap_err();
        assert!(matches!(err, DvnError::Unauthorized { role: "consensus" }));
        assert_eq!(h.studio.status(poa), SubmissionStatus::Submitted);
    }

    #[tokio::test]
    async fn test_admin_pass_throughs() {
        let h = harness().await;
        assert_eq!(
            h.engine
                .adjust_reputation(id("v1"), 250, &h.admin)
                .await
                .unwrap(),
            1_250
        );
        assert_eq!(
            h.engine.slash(id("v1"), MIN_STAKE, &h.admin).await.unwrap(),
            0
        );
        assert_eq!(h.engine.registry().slashed_pool().await, MIN_STAKE);

        let forged = AdminCapability::mint();
        assert!(h.engine.adjust_reputation(id("v1"), 1, &forged).await.is_err());
        assert!(h.engine.slash(id("v2"), 1, &forged).await.is_err());
    }

    #[tokio::test]
    async fn test_wire_rejects_invalid_params() {
        let params = ProtocolParams {
            consensus_threshold: 0,
            ..ProtocolParams::default()
        };
        let ledger = Arc::new(InMemoryLedger::new());
        let result =
            ConsensusEngine::wire(params, ledger, Arc::new(ManualClock::default())).await;
        assert!(matches!(result, Err(DvnError::InvalidParams(_))));
    }

    #[tokio::test]
    async fn test_audit_trail_intact() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        for v in ["v1", "v2", "v3"] {
            h.vote(v, poa, true).await;
        }
        h.studio.finalize(poa).await.unwrap();

        assert!(h.ledger.verify_integrity().await.unwrap());
        let kinds: Vec<_> = h
            .ledger
            .query_by_subject(&poa.to_string())
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(kinds.first(), Some(&LedgerEntryKind::WindowOpened));
        assert_eq!(kinds.get(1), Some(&LedgerEntryKind::ProcessingStarted));
        assert_eq!(kinds.last(), Some(&LedgerEntryKind::ConsensusFinalized));
        assert!(kinds.contains(&LedgerEntryKind::WindowClosed));
        assert!(kinds.contains(&LedgerEntryKind::RewardsDistributed));
    }

    #[tokio::test]
    async fn test_abandon_processing_rolls_back() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;
        h.vote("v1", poa, true).await;

        h.engine
            .abandon_processing(poa, h.studio.cap())
            .await
            .unwrap();
        assert_eq!(h.engine.phase(poa).await, ConsensusPhase::NotStarted);
        assert_eq!(
            h.engine.attestations().window_state(poa).await,
            WindowState::Pending
        );
        assert!(h.engine.attestations().voters_for(poa).await.is_empty());
        assert!(matches!(
            h.studio.finalize(poa).await,
            Err(DvnError::NotStarted(_))
        ));
        let abandoned = h
            .ledger
            .query_by_kind(LedgerEntryKind::ProcessingAbandoned)
            .await
            .unwrap();
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].subject, poa.to_string());

        // A rolled-back id can be started again.
        h.studio.submit("p1").await;
        assert_eq!(h.engine.phase(poa).await, ConsensusPhase::Processing);
    }

    #[tokio::test]
    async fn test_abandon_guards() {
        let h = harness().await;
        let poa = h.studio.submit("p1").await;

        let other = Arc::new(MockStudio::new(h.engine.clone()));
        h.engine
            .register_studio(&other, "other", &h.admin)
            .await
            .unwrap();
        assert!(matches!(
            h.engine.abandon_processing(poa, other.cap()).await,
            Err(DvnError::Unauthorized { .. })
        ));
        assert!(matches!(
            h.engine
                .abandon_processing(PoaId::from_label("unknown"), h.studio.cap())
                .await,
            Err(DvnError::NotStarted(_))
        ));

        h.timeout();
        h.studio.finalize(poa).await.unwrap();
        assert!(matches!(
            h.engine.abandon_processing(poa, h.studio.cap()).await,
            Err(DvnError::AlreadyProcessed(_))
        ));
        assert_eq!(h.engine.phase(poa).await, ConsensusPhase::Finalized);
    }

    #[tokio::test]
    async fn test_deadline_overflow_is_an_error() {
        let h = harness().await;
        h.clock
            .set(DateTime::<Utc>::MAX_UTC - TimeDelta::minutes(1));
        let poa = PoaId::from_label("p1");

        let err = h
            .engine
            .start_processing(poa, h.studio.cap())
            .await
            .unwrap_err();
        assert!(matches!(err, DvnError::InvalidParams(_)));
        assert_eq!(h.engine.phase(poa).await, ConsensusPhase::NotStarted);
        assert_eq!(
            h.engine.attestations().window_state(poa).await,
            WindowState::Pending
        );
    }
}
