//! # Conclave Core
//!
//! Pure primitives for Conclave: group identifiers, message records,
//! proposal tallies, and the state reconciler that merges them.
//!
//! This crate contains no I/O, no networking, no async. Everything here is
//! deterministic computation over values handed in by the sync layer.
//!
//! ## Key Types
//!
//! - [`GroupId`] - Canonical (lowercase, unprefixed hex) conversation identifier
//! - [`RawMessage`] - A message as the transport delivers it
//! - [`MessageRecord`] - An interpreted message with a semantic [`MessageKind`]
//! - [`ProposalRecord`] - Client-side view of an on-chain proposal
//! - [`StateReconciler`] - Single owner of the ordered message list and tallies
//!
//! ## Interpretation
//!
//! Message bodies are JSON envelopes with a `type` discriminator. Anything
//! that fails to parse is kept as plain text. See [`interpret`].

pub mod error;
pub mod interpret;
pub mod message;
pub mod proposal;
pub mod reconciler;
pub mod types;

pub use error::{CoreError, Result};
pub use interpret::{interpret, parse_payload};
pub use message::{ContentKind, MessageKind, MessagePayload, MessageRecord, RawMessage};
pub use proposal::{ChainEvent, ChainProposal, ProposalPatch, ProposalRecord};
pub use reconciler::{ApplyReport, Snapshot, StateReconciler, VoteOutcome};
pub use types::{now_nanos, Address, GroupId, MessageId};
