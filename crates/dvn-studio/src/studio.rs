use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use serde_json::json;
use tokio::sync::RwLock;
use tracing::{info, warn};

use dvn_consensus::{ConsensusEngine, Studio, StudioBinding};
use dvn_ledger::{LedgerEntryKind, journal};
use dvn_types::{
    AdminCapability, AgentId, Amount, ConsensusCapability, DvnError, GrantId, IdentityKey, PoaId,
    Result, Role, StudioCapability, StudioRole, Submission, SubmissionStatus, derive_poa_id,
};

use crate::config::StudioConfig;

#[derive(Debug, Default)]
struct StudioState {
    submissions: HashMap<PoaId, Submission>,
    order: Vec<PoaId>,
    sequence: u64,
    fees_collected: Amount,
}

/// A studio that accepts work from active workers for a fixed set of action
/// types, charges a flat verification fee and stores each submission until
/// the engine writes back its final status.
pub struct PolicyStudio {
    config: StudioConfig,
    engine: Arc<ConsensusEngine>,
    binding: OnceLock<StudioBinding>,
    state: RwLock<StudioState>,
}

impl PolicyStudio {
    pub fn new(config: StudioConfig, engine: Arc<ConsensusEngine>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            engine,
            binding: OnceLock::new(),
            state: RwLock::new(StudioState::default()),
        })
    }

    pub fn config(&self) -> &StudioConfig {
        &self.config
    }

    /// Grant issued at registration, if the studio has been admitted.
    pub fn grant(&self) -> Option<GrantId> {
        self.binding.get().map(|b| b.capability.grant())
    }

    fn capability(&self) -> Result<&StudioCapability> {
        self.binding
            .get()
            .map(|b| &b.capability)
            .ok_or(DvnError::Unauthorized {
                role: StudioRole::NAME,
            })
    }

    /// Accept a unit of work from `caller` and open it for attestation.
    pub async fn submit_work(
        &self,
        caller: IdentityKey,
        action_type: &str,
        metadata_ref: &str,
        fee_paid: Amount,
    ) -> Result<PoaId> {
        let cap = self.capability()?;
        let registry = self.engine.registry();

        if !registry.is_active_worker(caller).await {
            return Err(DvnError::UnknownWorker(caller));
        }
        if !self.config.supports(action_type) {
            return Err(DvnError::UnsupportedAction(action_type.to_string()));
        }
        if metadata_ref.trim().is_empty() {
            return Err(DvnError::InvalidReference(
                "metadata reference must not be empty".into(),
            ));
        }
        if fee_paid < self.config.verification_fee {
            return Err(DvnError::InsufficientFee {
                paid: fee_paid,
                required: self.config.verification_fee,
            });
        }
        let agent_id = registry
            .agent_id_of(caller)
            .await
            .ok_or(DvnError::UnknownWorker(caller))?;

        let mut state = self.state.write().await;
        let created_at = self.engine.clock().now();
        let poa_id = derive_poa_id(
            &agent_id,
            action_type,
            metadata_ref,
            created_at,
            state.sequence,
        );
        if state.submissions.contains_key(&poa_id) {
            return Err(DvnError::IdentifierCollision(poa_id));
        }

        let submission = Submission {
            poa_id,
            agent_id,
            action_type: action_type.to_string(),
            metadata_ref: metadata_ref.to_string(),
            status: SubmissionStatus::Submitted,
            submitter: caller,
            created_at,
            fee_paid,
        };

        self.engine.start_processing(poa_id, cap).await?;
        let recorded: Result<u64> = async {
            journal(
                self.engine.ledger().as_ref(),
                LedgerEntryKind::SubmissionCreated,
                caller.to_string(),
                poa_id.to_string(),
                json!({ "studio": self.config.name, "submission": submission }),
            )
            .await?;
            registry.increment_submission_count(caller, cap).await
        }
        .await;
        if let Err(e) = recorded {
            if let Err(rollback) = self.engine.abandon_processing(poa_id, cap).await {
                warn!(poa_id = %poa_id, error = %rollback, "Failed to abandon submission");
            }
            return Err(e);
        }

        state.sequence += 1;
        state.fees_collected = state.fees_collected.saturating_add(fee_paid);
        state.order.push(poa_id);
        state.submissions.insert(poa_id, submission);

        info!(
            poa_id = %poa_id,
            worker = %caller,
            action_type,
            studio = %self.config.name,
            "Work submitted"
        );
        Ok(poa_id)
    }

    /// Ask the engine to finalize a submission this studio owns.
    pub async fn finalize(&self, poa_id: PoaId) -> Result<SubmissionStatus> {
        self.engine.process_consensus(poa_id, self.capability()?).await
    }

    /// Operator escape hatch for submissions stuck past the emergency timeout.
    pub async fn emergency_finalize(
        &self,
        poa_id: PoaId,
        admin: &AdminCapability,
    ) -> Result<SubmissionStatus> {
        self.engine.emergency_process(poa_id, admin).await
    }

    pub async fn submission(&self, poa_id: PoaId) -> Option<Submission> {
        self.state.read().await.submissions.get(&poa_id).cloned()
    }

    /// Submissions by one agent, oldest first.
    pub async fn submissions_by(&self, agent_id: AgentId) -> Vec<Submission> {
        let state = self.state.read().await;
        state
            .order
            .iter()
            .filter_map(|id| state.submissions.get(id))
            .filter(|s| s.agent_id == agent_id)
            .cloned()
            .collect()
    }

    pub async fn fees_collected(&self) -> Amount {
        self.state.read().await.fees_collected
    }
}

#[async_trait]
impl Studio for PolicyStudio {
    async fn bind(&self, binding: StudioBinding) -> Result<()> {
        let grant = binding.capability.grant();
        self.binding.set(binding).map_err(|_| DvnError::AlreadyBound {
            role: StudioRole::NAME,
        })?;
        info!(studio = %self.config.name, grant = %grant, "Studio bound to consensus");
        Ok(())
    }

    async fn submission_status(&self, poa_id: PoaId) -> Result<SubmissionStatus> {
        self.state
            .read()
            .await
            .submissions
            .get(&poa_id)
            .map(|s| s.status)
            .ok_or(DvnError::SubmissionNotFound(poa_id))
    }

    async fn update_status(
        &self,
        poa_id: PoaId,
        status: SubmissionStatus,
        authority: &ConsensusCapability,
    ) -> Result<()> {
        let bound = self.binding.get().map(|b| b.consensus_authority);
        if let Err(e) = authority.authorize(bound) {
            warn!(poa_id = %poa_id, "Rejected status update from unknown authority");
            return Err(e);
        }

        let mut state = self.state.write().await;
        let before = state
            .submissions
            .get(&poa_id)
            .map(|s| s.status)
            .ok_or(DvnError::SubmissionNotFound(poa_id))?;
        if before != SubmissionStatus::Submitted || !status.is_final() {
            return Err(DvnError::InvalidStatusTransition {
                poa_id,
                from: before,
                to: status,
            });
        }

        journal(
            self.engine.ledger().as_ref(),
            LedgerEntryKind::SubmissionStatusUpdated,
            "consensus",
            poa_id.to_string(),
            json!({ "studio": self.config.name, "before": before, "after": status }),
        )
        .await?;

        if let Some(submission) = state.submissions.get_mut(&poa_id) {
            submission.status = status;
        }
        info!(poa_id = %poa_id, before = %before, after = %status, "Submission status updated");
        Ok(())
    }
}
