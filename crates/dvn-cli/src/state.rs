use std::sync::Arc;

use anyhow::{Context, Result};

use dvn_consensus::ConsensusEngine;
use dvn_ledger::{InMemoryLedger, Ledger, MerkleLedger};
use dvn_studio::PolicyStudio;
use dvn_types::{AdminCapability, ManualClock};

use crate::config::{DvnConfig, LedgerBackend};

/// An in-process network: engine, one admitted studio, and the shared ledger
/// and clock they were wired with.
pub struct Network {
    pub engine: Arc<ConsensusEngine>,
    pub admin: AdminCapability,
    pub studio: Arc<PolicyStudio>,
    pub clock: Arc<ManualClock>,
    pub ledger: Arc<dyn Ledger>,
    /// Set when the Merkle backend is selected, for printing the root.
    pub merkle: Option<Arc<MerkleLedger>>,
}

impl Network {
    pub async fn wire(config: &DvnConfig) -> Result<Self> {
        let clock = Arc::new(ManualClock::default());
        let merkle = match config.ledger.backend {
            LedgerBackend::Memory => None,
            LedgerBackend::Merkle => Some(Arc::new(MerkleLedger::with_clock(clock.clone()))),
        };
        let ledger: Arc<dyn Ledger> = match &merkle {
            Some(merkle) => merkle.clone(),
            None => Arc::new(InMemoryLedger::with_clock(clock.clone())),
        };

        let (engine, admin) =
            ConsensusEngine::wire(config.protocol.clone(), ledger.clone(), clock.clone())
                .await
                .context("Failed to wire consensus engine")?;

        let studio = Arc::new(
            PolicyStudio::new(config.studio.clone(), engine.clone())
                .context("Failed to build studio")?,
        );
        engine
            .register_studio(&studio, config.studio.name.clone(), &admin)
            .await
            .context("Failed to register studio")?;

        Ok(Self {
            engine,
            admin,
            studio,
            clock,
            ledger,
            merkle,
        })
    }
}
