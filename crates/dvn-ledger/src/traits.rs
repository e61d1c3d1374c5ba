use async_trait::async_trait;
use uuid::Uuid;

use crate::entry::{LedgerEntry, LedgerEntryKind};
use dvn_types::DvnError;

/// Append-only audit ledger. Every component reports its state transitions here.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Append a pre-built entry to the ledger.
    async fn append(&self, entry: LedgerEntry) -> Result<(), DvnError>;

    /// Build an entry chained to the current head and append it in one step.
    async fn record(
        &self,
        kind: LedgerEntryKind,
        actor: String,
        subject: String,
        payload: serde_json::Value,
    ) -> Result<LedgerEntry, DvnError>;

    /// Get an entry by its ID.
    async fn get(&self, id: Uuid) -> Result<Option<LedgerEntry>, DvnError>;

    /// Get the latest entry hash (for chaining).
    async fn latest_hash(&self) -> Result<Option<String>, DvnError>;

    /// Query entries by subject.
    async fn query_by_subject(&self, subject: &str) -> Result<Vec<LedgerEntry>, DvnError>;

    /// Query entries by kind.
    async fn query_by_kind(&self, kind: LedgerEntryKind) -> Result<Vec<LedgerEntry>, DvnError>;

    /// Get all entries (for auditing).
    async fn all_entries(&self) -> Result<Vec<LedgerEntry>, DvnError>;

    /// Verify the chain integrity.
    async fn verify_integrity(&self) -> Result<bool, DvnError>;
}

/// Record an event, reporting any backend failure as `DvnError::LedgerError`.
pub async fn journal(
    ledger: &dyn Ledger,
    kind: LedgerEntryKind,
    actor: impl Into<String>,
    subject: impl Into<String>,
    payload: serde_json::Value,
) -> Result<LedgerEntry, DvnError> {
    let (actor, subject) = (actor.into(), subject.into());
    ledger
        .record(kind, actor, subject, payload)
        .await
        .map_err(|e| match e {
            DvnError::LedgerError(_) => e,
            other => DvnError::LedgerError(other.to_string()),
        })
}
