use async_trait::async_trait;
use rs_merkle::{Hasher, MerkleTree, algorithms::Sha256};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::entry::{LedgerEntry, LedgerEntryKind};
use crate::traits::Ledger;
use dvn_types::{Clock, DvnError, SystemClock};

/// Merkle tree-backed ledger: a single root commits to the whole audit trail.
#[derive(Clone)]
pub struct MerkleLedger {
    inner: Arc<RwLock<MerkleState>>,
    clock: Arc<dyn Clock>,
}

struct MerkleState {
    entries: Vec<LedgerEntry>,
    tree: MerkleTree<Sha256>,
}

impl MerkleLedger {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Arc::new(RwLock::new(MerkleState {
                entries: Vec::new(),
                tree: MerkleTree::<Sha256>::new(),
            })),
            clock,
        }
    }

    /// Get the Merkle root hash.
    pub async fn root_hex(&self) -> Option<String> {
        self.inner.read().await.tree.root_hex()
    }

    /// Generate an inclusion proof for the entry at the given index.
    pub async fn proof(&self, index: usize) -> Option<Vec<u8>> {
        let state = self.inner.read().await;
        if index >= state.entries.len() {
            return None;
        }
        Some(state.tree.proof(&[index]).to_bytes())
    }
}

impl Default for MerkleLedger {
    fn default() -> Self {
        Self::new()
    }
}

fn entry_to_leaf(entry: &LedgerEntry) -> [u8; 32] {
    let data = format!("{}:{}", entry.id, entry.hash);
    Sha256::hash(data.as_bytes())
}

impl MerkleState {
    fn push(&mut self, entry: LedgerEntry) {
        self.tree.insert(entry_to_leaf(&entry));
        self.tree.commit();
        self.entries.push(entry);
    }
}

#[async_trait]
impl Ledger for MerkleLedger {
    async fn append(&self, entry: LedgerEntry) -> Result<(), DvnError> {
        self.inner.write().await.push(entry);
        Ok(())
    }

    async fn record(
        &self,
        kind: LedgerEntryKind,
        actor: String,
        subject: String,
        payload: serde_json::Value,
    ) -> Result<LedgerEntry, DvnError> {
        let mut state = self.inner.write().await;
        let previous_hash = state.entries.last().map(|e| e.hash.clone());
        let entry = LedgerEntry::stamped(
            self.clock.now(),
            kind,
            actor,
            subject,
            payload,
            previous_hash,
        );
        state.push(entry.clone());
        Ok(entry)
    }

    async fn get(&self, id: Uuid) -> Result<Option<LedgerEntry>, DvnError> {
        let state = self.inner.read().await;
        Ok(state.entries.iter().find(|e| e.id == id).cloned())
    }

    async fn latest_hash(&self) -> Result<Option<String>, DvnError> {
        let state = self.inner.read().await;
        Ok(state.entries.last().map(|e| e.hash.clone()))
    }

    async fn query_by_subject(&self, subject: &str) -> Result<Vec<LedgerEntry>, DvnError> {
        let state = self.inner.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.subject == subject)
            .cloned()
            .collect())
    }

    async fn query_by_kind(&self, kind: LedgerEntryKind) -> Result<Vec<LedgerEntry>, DvnError> {
        let state = self.inner.read().await;
        Ok(state
            .entries
            .iter()
            .filter(|e| e.kind == kind)
            .cloned()
            .collect())
    }

    async fn all_entries(&self) -> Result<Vec<LedgerEntry>, DvnError> {
        Ok(self.inner.read().await.entries.clone())
    }

    async fn verify_integrity(&self) -> Result<bool, DvnError> {
        let state = self.inner.read().await;
        if state.entries.is_empty() {
            return Ok(true);
        }
        if state.entries.iter().any(|e| !e.is_intact()) {
            return Ok(false);
        }

        // Verify Merkle tree leaves match entries
        let expected_leaves: Vec<[u8; 32]> = state.entries.iter().map(entry_to_leaf).collect();
        let indices: Vec<usize> = (0..state.entries.len()).collect();

        match state.tree.root() {
            Some(root) => {
                let proof = state.tree.proof(&indices);
                Ok(proof.verify(root, &indices, &expected_leaves, state.entries.len()))
            }
            None => Ok(false),
        }
    }
}
