use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Types of ledger entries. One per observable state transition.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum LedgerEntryKind {
    CapabilityBound,
    AgentRegistered,
    AgentStatusChanged,
    StakeDeposited,
    StakeWithdrawn,
    StakeSlashed,
    ReputationUpdated,
    SubmissionCounted,
    StudioRegistered,
    StudioDeregistered,
    SubmissionCreated,
    SubmissionStatusUpdated,
    ProcessingStarted,
    ProcessingAbandoned,
    WindowOpened,
    WindowClosed,
    VoteCast,
    VoteUpdated,
    TimeoutReached,
    ConsensusFinalized,
    RewardsDistributed,
    EmergencyProcessed,
}

/// An immutable ledger entry.
///
/// `actor` is whoever caused the transition (an identity key or a component
/// name); `subject` is the record it changed (an identity, a submission id).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub kind: LedgerEntryKind,
    pub timestamp: DateTime<Utc>,
    pub actor: String,
    pub subject: String,
    pub payload: serde_json::Value,
    pub previous_hash: Option<String>,
    pub hash: String,
}

impl LedgerEntry {
    pub fn new(
        kind: LedgerEntryKind,
        actor: impl Into<String>,
        subject: impl Into<String>,
        payload: serde_json::Value,
        previous_hash: Option<String>,
    ) -> Self {
        Self::stamped(Utc::now(), kind, actor, subject, payload, previous_hash)
    }

    /// Build an entry with a timestamp taken from the caller's clock.
    pub fn stamped(
        timestamp: DateTime<Utc>,
        kind: LedgerEntryKind,
        actor: impl Into<String>,
        subject: impl Into<String>,
        payload: serde_json::Value,
        previous_hash: Option<String>,
    ) -> Self {
        let id = Uuid::new_v4();
        let actor = actor.into();
        let subject = subject.into();
        let hash = Self::compute_hash(
            &id,
            &timestamp,
            kind,
            &actor,
            &subject,
            &payload,
            previous_hash.as_deref(),
        );

        Self {
            id,
            kind,
            timestamp,
            actor,
            subject,
            payload,
            previous_hash,
            hash,
        }
    }

    /// Recompute this entry's hash from its contents.
    pub fn recompute_hash(&self) -> String {
        Self::compute_hash(
            &self.id,
            &self.timestamp,
            self.kind,
            &self.actor,
            &self.subject,
            &self.payload,
            self.previous_hash.as_deref(),
        )
    }

    /// True if the stored hash still matches the contents.
    pub fn is_intact(&self) -> bool {
        self.recompute_hash() == self.hash
    }

    fn compute_hash(
        id: &Uuid,
        timestamp: &DateTime<Utc>,
        kind: LedgerEntryKind,
        actor: &str,
        subject: &str,
        payload: &serde_json::Value,
        previous_hash: Option<&str>,
    ) -> String {
        let hash_input = format!(
            "{}:{}:{}:{:?}:{}:{}:{}:{}",
            id,
            timestamp.timestamp(),
            timestamp.timestamp_subsec_nanos(),
            kind,
            actor,
            subject,
            payload,
            previous_hash.unwrap_or("genesis"),
        );
        hex::encode(Sha256::digest(hash_input.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_entry_creation() {
        let entry = LedgerEntry::new(
            LedgerEntryKind::AgentRegistered,
            "0xaa",
            "0xbb",
            serde_json::json!({"kind": "verifier"}),
            None,
        );
        assert_eq!(entry.hash.len(), 64);
        assert!(entry.previous_hash.is_none());
        assert!(entry.is_intact());
    }

    #[test]
    fn test_chained_entries() {
        let first = LedgerEntry::new(
            LedgerEntryKind::WindowOpened,
            "consensus",
            "0x01",
            serde_json::json!({}),
            None,
        );
        let second = LedgerEntry::new(
            LedgerEntryKind::VoteCast,
            "0x02",
            "0x01",
            serde_json::json!({}),
            Some(first.hash.clone()),
        );
        assert_eq!(second.previous_hash.as_ref().unwrap(), &first.hash);
        assert_ne!(first.hash, second.hash);
    }

    #[test]
    fn test_tampering_breaks_hash() {
        let mut entry = LedgerEntry::new(
            LedgerEntryKind::StakeDeposited,
            "0xaa",
            "0xaa",
            serde_json::json!({"after": "100"}),
            None,
        );
        entry.payload = serde_json::json!({"after": "1000000"});
        assert!(!entry.is_intact());
    }

    #[test]
    fn test_stamped_keeps_given_time() {
        let at = DateTime::parse_from_rfc3339("2030-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let entry = LedgerEntry::stamped(
            at,
            LedgerEntryKind::WindowClosed,
            "consensus",
            "0x01",
            serde_json::json!({}),
            None,
        );
        assert_eq!(entry.timestamp, at);
        assert!(entry.is_intact());
    }
}
