//! # Conclave
//!
//! Client-side engine for a token-gated community that lives in one group
//! conversation on a decentralized messaging network, with governance on
//! chain.
//!
//! ## Overview
//!
//! - **Discovery**: gate on identity publication, then race direct lookup,
//!   enumeration and network events until the group resolves
//! - **History and live**: page backwards through history while streaming
//!   new messages, both merged idempotently
//! - **Interpretation**: structured JSON envelopes become proposals, votes
//!   and notices; anything else stays text
//! - **Reconciliation**: one ordered, deduplicated message list plus a
//!   proposal table, with optimistic echoes for local sends
//! - **Memory**: last group and pending echoes survive restarts
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use conclave::{Conclave, ConclaveConfig};
//! use conclave::store::SqliteKv;
//! use conclave::sync::transport::memory::MemoryNetwork;
//!
//! # async fn example(signer: Arc<dyn conclave::sync::Signer>) -> conclave::Result<()> {
//! let network = MemoryNetwork::new();
//! let store = SqliteKv::open("conclave.db")?;
//! let conclave = Conclave::new(network.connector(), signer, store, ConclaveConfig::default());
//!
//! // Explicit group the first time, remembered afterwards.
//! let mut community = conclave.open(Some("0xabc123")).await?;
//! community.send_text("gm").await?;
//! community.vote(7, true).await?;
//!
//! for message in community.snapshot().messages {
//!     println!("{} {}", message.sender, message.kind());
//! }
//! community.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Re-exports
//!
//! - `conclave::core` - identifiers, messages, proposals, reconciler
//! - `conclave::store` - key-value cache (SQLite or memory)
//! - `conclave::sync` - discovery, history, live stream, sessions

pub mod conclave;
pub mod error;

pub use conclave_core as core;
pub use conclave_store as store;
pub use conclave_sync as sync;

pub use crate::conclave::{Community, Conclave, ConclaveConfig};
pub use error::{ConclaveError, Result};

pub use conclave_core::{
    Address, ChainEvent, ChainProposal, GroupId, MessageKind, MessagePayload, MessageRecord,
    ProposalRecord, Snapshot, VoteOutcome,
};
pub use conclave_sync::{DiscoveryState, SessionObserver, SessionState};
