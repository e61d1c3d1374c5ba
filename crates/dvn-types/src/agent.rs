use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{AgentId, IdentityKey};
use crate::params::amount_serde;

/// Value in base units (wei-like).
pub type Amount = u128;

/// Reputation score, bounded by `ProtocolParams::max_reputation`.
pub type Reputation = u64;

/// Stake weighted by reputation.
pub type Weight = u128;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Worker,
    Verifier,
}

/// An agent that submits work for verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerAgent {
    pub agent_id: AgentId,
    pub identity: IdentityKey,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    pub submission_count: u64,
}

/// An agent that stakes value and votes on submissions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifierAgent {
    pub agent_id: AgentId,
    pub identity: IdentityKey,
    pub active: bool,
    pub registered_at: DateTime<Utc>,
    #[serde(with = "amount_serde")]
    pub staked_amount: Amount,
    pub reputation: Reputation,
    pub endpoint: Option<String>,
}

impl VerifierAgent {
    /// `staked_amount × reputation` for an active verifier at or above `min_stake`, else 0.
    pub fn weight(&self, min_stake: Amount) -> Weight {
        if !self.active || self.staked_amount < min_stake {
            return 0;
        }
        self.staked_amount.saturating_mul(Weight::from(self.reputation))
    }
}

/// A registered agent of either kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AgentRecord {
    Worker(WorkerAgent),
    Verifier(VerifierAgent),
}

impl AgentRecord {
    pub fn agent_id(&self) -> AgentId {
        match self {
            AgentRecord::Worker(w) => w.agent_id,
            AgentRecord::Verifier(v) => v.agent_id,
        }
    }

    pub fn identity(&self) -> IdentityKey {
        match self {
            AgentRecord::Worker(w) => w.identity,
            AgentRecord::Verifier(v) => v.identity,
        }
    }

    pub fn kind(&self) -> AgentKind {
        match self {
            AgentRecord::Worker(_) => AgentKind::Worker,
            AgentRecord::Verifier(_) => AgentKind::Verifier,
        }
    }

    pub fn is_active(&self) -> bool {
        match self {
            AgentRecord::Worker(w) => w.active,
            AgentRecord::Verifier(v) => v.active,
        }
    }

    pub fn set_active(&mut self, active: bool) {
        match self {
            AgentRecord::Worker(w) => w.active = active,
            AgentRecord::Verifier(v) => v.active = active,
        }
    }

    pub fn as_verifier(&self) -> Option<&VerifierAgent> {
        match self {
            AgentRecord::Verifier(v) => Some(v),
            AgentRecord::Worker(_) => None,
        }
    }

    pub fn as_worker(&self) -> Option<&WorkerAgent> {
        match self {
            AgentRecord::Worker(w) => Some(w),
            AgentRecord::Verifier(_) => None,
        }
    }
}
