//! Read access to the governance contract.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;

use conclave_core::ChainProposal;

use crate::error::{Result, SyncError};

/// Reads authoritative proposal state from chain.
#[async_trait]
pub trait GovernanceReader: Send + Sync {
    async fn get_proposal(&self, id: u64) -> Result<ChainProposal>;
}

/// Fixed proposal table. Used in tests and offline demos.
#[derive(Default)]
pub struct StaticGovernance {
    proposals: RwLock<HashMap<u64, ChainProposal>>,
    reads: AtomicUsize,
}

impl StaticGovernance {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, id: u64, proposal: ChainProposal) {
        self.proposals
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, proposal);
    }

    /// Number of `get_proposal` calls served so far.
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl GovernanceReader for StaticGovernance {
    async fn get_proposal(&self, id: u64) -> Result<ChainProposal> {
        self.reads.fetch_add(1, Ordering::Relaxed);
        self.proposals
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::Governance(format!("proposal {id} not found")))
    }
}
