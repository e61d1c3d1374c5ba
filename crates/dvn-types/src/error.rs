use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::agent::Amount;
use crate::ids::{IdentityKey, PoaId};
use crate::submission::SubmissionStatus;

/// Broad classification of a failure, used by callers to explain a rejection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    Identity,
    Authorization,
    State,
    Economic,
    Voting,
    Readiness,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum DvnError {
    // Identity
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    #[error("Identity {0} already owns an agent")]
    AlreadyRegistered(IdentityKey),

    #[error("Identity {0} has no registered agent")]
    NotRegistered(IdentityKey),

    #[error("Identity {0} is not an active verifier")]
    UnknownVerifier(IdentityKey),

    #[error("Identity {0} is not an active worker")]
    UnknownWorker(IdentityKey),

    // Authorization
    #[error("Unauthorized: caller does not hold the {role} capability")]
    Unauthorized { role: &'static str },

    #[error("The {role} capability has already been granted")]
    AlreadyBound { role: &'static str },

    // State
    #[error("Submission {0} has not started processing")]
    NotStarted(PoaId),

    #[error("Submission {0} is already processing")]
    AlreadyStarted(PoaId),

    #[error("Submission {0} has already been processed")]
    AlreadyProcessed(PoaId),

    #[error("Finalization of submission {0} is already in progress")]
    FinalizationInProgress(PoaId),

    #[error("Attestation window for {0} is already open")]
    AlreadyOpen(PoaId),

    #[error("Attestation window for {0} is not open")]
    NotOpen(PoaId),

    #[error("Attestation window for {0} has been closed for good")]
    WindowFinalized(PoaId),

    #[error("Submission {0} not found")]
    SubmissionNotFound(PoaId),

    #[error("Submission {poa_id} cannot move from {from} to {to}")]
    InvalidStatusTransition {
        poa_id: PoaId,
        from: SubmissionStatus,
        to: SubmissionStatus,
    },

    #[error("Identifier collision: {0} already exists")]
    IdentifierCollision(PoaId),

    #[error("Action type '{0}' is not supported by this studio")]
    UnsupportedAction(String),

    #[error("Invalid reference: {0}")]
    InvalidReference(String),

    // Economic
    #[error("Invalid amount: {0}")]
    InvalidAmount(Amount),

    #[error("Insufficient stake: {amount} < {required}")]
    InsufficientStake { amount: Amount, required: Amount },

    #[error("Insufficient balance: requested {requested}, available {available}")]
    InsufficientBalance { requested: Amount, available: Amount },

    #[error("Remaining stake {remainder} would fall below the minimum {minimum}")]
    BelowMinimum { remainder: Amount, minimum: Amount },

    #[error("Insufficient fee: paid {paid}, required {required}")]
    InsufficientFee { paid: Amount, required: Amount },

    // Voting
    #[error("Verifier {verifier} already voted on {poa_id}; use update_vote")]
    DoubleVote { poa_id: PoaId, verifier: IdentityKey },

    #[error("Verifier {verifier} has no vote on {poa_id} to update")]
    NoExistingVote { poa_id: PoaId, verifier: IdentityKey },

    // Readiness
    #[error(
        "Submission {poa_id} not ready: {attestations}/{required} attestations, timeout at {ready_at}"
    )]
    NotReady {
        poa_id: PoaId,
        attestations: u64,
        required: u64,
        ready_at: DateTime<Utc>,
    },

    // Infrastructure
    #[error("Invalid protocol parameters: {0}")]
    InvalidParams(String),

    #[error("Ledger error: {0}")]
    LedgerError(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DvnError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DvnError::InvalidIdentifier(_)
            | DvnError::AlreadyRegistered(_)
            | DvnError::NotRegistered(_)
            | DvnError::UnknownVerifier(_)
            | DvnError::UnknownWorker(_) => ErrorKind::Identity,

            DvnError::Unauthorized { .. } | DvnError::AlreadyBound { .. } => {
                ErrorKind::Authorization
            }

            DvnError::NotStarted(_)
            | DvnError::AlreadyStarted(_)
            | DvnError::AlreadyProcessed(_)
            | DvnError::FinalizationInProgress(_)
            | DvnError::AlreadyOpen(_)
            | DvnError::NotOpen(_)
            | DvnError::WindowFinalized(_)
            | DvnError::SubmissionNotFound(_)
            | DvnError::InvalidStatusTransition { .. }
            | DvnError::IdentifierCollision(_)
            | DvnError::UnsupportedAction(_)
            | DvnError::InvalidReference(_) => ErrorKind::State,

            DvnError::InvalidAmount(_)
            | DvnError::InsufficientStake { .. }
            | DvnError::InsufficientBalance { .. }
            | DvnError::BelowMinimum { .. }
            | DvnError::InsufficientFee { .. } => ErrorKind::Economic,

            DvnError::DoubleVote { .. } | DvnError::NoExistingVote { .. } => ErrorKind::Voting,

            DvnError::NotReady { .. } => ErrorKind::Readiness,

            DvnError::InvalidParams(_)
            | DvnError::LedgerError(_)
            | DvnError::Serialization(_)
            | DvnError::Internal(_) => ErrorKind::Infrastructure,
        }
    }
}

impl From<serde_json::Error> for DvnError {
    fn from(e: serde_json::Error) -> Self {
        DvnError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, DvnError>;
