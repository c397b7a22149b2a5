//! Proposals: the client-side view of on-chain governance.
//!
//! A [`ProposalRecord`] is created the first time anything mentions its id
//! and is only ever filled in afterwards.

use serde::{Deserialize, Serialize};

use crate::types::Address;

/// Client-side state of one proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProposalRecord {
    pub id: u64,
    pub title: String,
    pub description: String,
    /// Proposer address, empty until learned.
    pub proposer: String,
    pub yes_votes: u64,
    pub no_votes: u64,
    /// Voting deadline (Unix seconds), 0 when unknown.
    pub end_time: u64,
    pub executed: bool,
    pub passed: bool,
}

impl ProposalRecord {
    /// A placeholder for a proposal we only know the id of.
    pub fn new(id: u64) -> Self {
        Self {
            id,
            title: Self::default_title(id),
            description: String::new(),
            proposer: String::new(),
            yes_votes: 0,
            no_votes: 0,
            end_time: 0,
            executed: false,
            passed: false,
        }
    }

    pub fn default_title(id: u64) -> String {
        format!("Proposal #{id}")
    }

    /// Shallow-merge a sparse patch.
    ///
    /// Empty strings, zero end times and `false` flags never overwrite what is
    /// already known.
    pub fn merge(&mut self, patch: &ProposalPatch) {
        merge_text(&mut self.title, patch.title.as_deref());
        merge_text(&mut self.description, patch.description.as_deref());
        if let Some(proposer) = patch.proposer.as_deref() {
            merge_text(&mut self.proposer, Some(&proposer.to_ascii_lowercase()));
        }
        if let Some(end_time) = patch.end_time.filter(|t| *t > 0) {
            self.end_time = end_time;
        }
        if patch.executed == Some(true) {
            self.executed = true;
        }
        if patch.passed == Some(true) {
            self.passed = true;
        }
    }

    /// Overwrite with the authoritative on-chain view.
    pub fn apply_chain(&mut self, chain: &ChainProposal) {
        self.merge(&ProposalPatch {
            title: Some(chain.title.clone()),
            description: Some(chain.description.clone()),
            proposer: Some(chain.proposer.to_string()),
            end_time: Some(chain.end_time),
            ..Default::default()
        });
        self.yes_votes = chain.yes_votes;
        self.no_votes = chain.no_votes;
        self.executed = chain.executed;
        self.passed = chain.passed;
    }
}

fn merge_text(field: &mut String, value: Option<&str>) {
    if let Some(value) = value {
        if !value.trim().is_empty() {
            *field = value.to_string();
        }
    }
}

/// Partial proposal fields carried by a single signal.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProposalPatch {
    pub title: Option<String>,
    pub description: Option<String>,
    pub proposer: Option<String>,
    pub end_time: Option<u64>,
    pub executed: Option<bool>,
    pub passed: Option<bool>,
}

impl ProposalPatch {
    pub fn titled(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }
}

/// Authoritative proposal state as returned by the governance contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainProposal {
    pub proposer: Address,
    pub yes_votes: u64,
    pub no_votes: u64,
    pub end_time: u64,
    pub executed: bool,
    pub passed: bool,
    pub title: String,
    pub description: String,
}

/// Events emitted by the governance contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChainEvent {
    ProposalCreated {
        id: u64,
        proposer: Address,
        end_time: u64,
        title: String,
        description: String,
    },
    VoteCast {
        id: u64,
        voter: Address,
        support: bool,
        timestamp: u64,
    },
}

impl ChainEvent {
    pub fn proposal_id(&self) -> u64 {
        match self {
            ChainEvent::ProposalCreated { id, .. } | ChainEvent::VoteCast { id, .. } => *id,
        }
    }
}
