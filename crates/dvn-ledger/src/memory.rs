use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::entry::{LedgerEntry, LedgerEntryKind};
use crate::traits::Ledger;
use dvn_types::{Clock, DvnError, SystemClock};

/// In-memory ledger implementation (default).
#[derive(Clone)]
pub struct InMemoryLedger {
    entries: Arc<RwLock<Vec<LedgerEntry>>>,
    index_by_id: Arc<DashMap<Uuid, usize>>,
    index_by_subject: Arc<DashMap<String, Vec<usize>>>,
    clock: Arc<dyn Clock>,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Stamp recorded entries with `clock` instead of wall-clock time.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: Arc::new(RwLock::new(Vec::new())),
            index_by_id: Arc::new(DashMap::new()),
            index_by_subject: Arc::new(DashMap::new()),
            clock,
        }
    }

    fn index(&self, entry: &LedgerEntry, idx: usize) {
        self.index_by_id.insert(entry.id, idx);
        self.index_by_subject
            .entry(entry.subject.clone())
            .or_default()
            .push(idx);
    }
}

impl Default for InMemoryLedger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn append(&self, entry: LedgerEntry) -> Result<(), DvnError> {
        let mut entries = self.entries.write().await;
        let idx = entries.len();
        self.index(&entry, idx);
        entries.push(entry);
        Ok(())
    }

    async fn record(
        &self,
        kind: LedgerEntryKind,
        actor: String,
        subject: String,
        payload: serde_json::Value,
    ) -> Result<LedgerEntry, DvnError> {
        let mut entries = self.entries.write().await;
        let previous_hash = entries.last().map(|e| e.hash.clone());
        let entry = LedgerEntry::stamped(
            self.clock.now(),
            kind,
            actor,
            subject,
            payload,
            previous_hash,
        );
        let idx = entries.len();
        self.index(&entry, idx);
        entries.push(entry.clone());
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> Result<Option<LedgerEntry>, DvnError> {
        let entries = self.entries.read().await;
        Ok(self
            .index_by_id
            .get(&id)
            .and_then(|idx| entries.get(*idx).cloned()))
    }

    async fn latest_hash(&self) -> Result<Option<String>, DvnError> {
        let entries = self.entries.read().await;
        Ok(entries.last().map(|e| e.hash.clone()))
    }

    async fn query_by_subject(&self, subject: &str) -> Result<Vec<LedgerEntry>, DvnError> {
        let entries = self.entries.read().await;
        Ok(self
            .index_by_subject
            .get(subject)
            .map(|indices| {
                indices
                    .iter()
                    .filter_map(|i| entries.get(*i).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn query_by_kind(&self, kind: LedgerEntryKind) -> Result<Vec<LedgerEntry>, DvnError> {
        let entries = self.entries.read().await;
        Ok(entries.iter().filter(|e| e.kind == kind).cloned().collect())
    }

    async fn all_entries(&self) -> Result<Vec<LedgerEntry>, DvnError> {
        let entries = self.entries.read().await;
        Ok(entries.clone())
    }

    async fn verify_integrity(&self) -> Result<bool, DvnError> {
        let entries = self.entries.read().await;
        for (i, entry) in entries.iter().enumerate() {
            if !entry.is_intact() {
                return Ok(false);
            }
            if i == 0 {
                if entry.previous_hash.is_some() {
                    return Ok(false);
                }
            } else if entry.previous_hash.as_ref() != Some(&entries[i - 1].hash) {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
