//! Messages: raw transport messages and their interpreted records.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::{Address, MessageId};

/// What the transport says a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentKind {
    /// Application content written by a member.
    Application,
    /// Group membership change emitted by the transport itself.
    MembershipChange,
}

/// A message exactly as the transport hands it over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawMessage {
    /// Network-assigned identifier.
    pub id: MessageId,
    /// Sender address.
    pub sender: Address,
    /// Send time (Unix ns), as reported by the network.
    pub sent_at_ns: i64,
    /// Transport-level classification.
    pub content_kind: ContentKind,
    /// Undecoded body.
    pub content: Bytes,
}

impl RawMessage {
    /// Build an application message with a UTF-8 body.
    pub fn text(
        id: impl Into<MessageId>,
        sender: impl Into<Address>,
        sent_at_ns: i64,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            sender: sender.into(),
            sent_at_ns,
            content_kind: ContentKind::Application,
            content: Bytes::from(body.into()),
        }
    }
}

/// Semantic kind of an interpreted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageKind {
    Text,
    Proposal,
    ProposalMeta,
    Vote,
    System,
    PriestChanged,
    ProposalExecuted,
    MemberJoined,
}

impl MessageKind {
    /// The wire discriminator used in the JSON envelope.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Text => "text",
            MessageKind::Proposal => "proposal",
            MessageKind::ProposalMeta => "proposal-meta",
            MessageKind::Vote => "vote",
            MessageKind::System => "system",
            MessageKind::PriestChanged => "priest-changed",
            MessageKind::ProposalExecuted => "proposal-executed",
            MessageKind::MemberJoined => "member-joined",
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind-specific structured data of a message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessagePayload {
    /// Free text, or anything that did not parse as a known envelope.
    Text { body: String },
    /// A proposal was announced.
    Proposal { id: u64 },
    /// Human-readable details for a proposal.
    ProposalMeta {
        id: u64,
        title: String,
        description: String,
    },
    /// A member voted on a proposal.
    Vote { id: u64, support: bool, voter: Address },
    /// Transport-generated notice (membership changes and the like).
    System { body: String },
    /// The community's priest role moved to a new address.
    PriestChanged { new_priest: Address },
    /// A proposal was executed on-chain.
    ProposalExecuted { id: u64, success: bool },
    /// A new member joined.
    MemberJoined { member: Address },
}

impl MessagePayload {
    pub fn kind(&self) -> MessageKind {
        match self {
            MessagePayload::Text { .. } => MessageKind::Text,
            MessagePayload::Proposal { .. } => MessageKind::Proposal,
            MessagePayload::ProposalMeta { .. } => MessageKind::ProposalMeta,
            MessagePayload::Vote { .. } => MessageKind::Vote,
            MessagePayload::System { .. } => MessageKind::System,
            MessagePayload::PriestChanged { .. } => MessageKind::PriestChanged,
            MessagePayload::ProposalExecuted { .. } => MessageKind::ProposalExecuted,
            MessagePayload::MemberJoined { .. } => MessageKind::MemberJoined,
        }
    }

    /// The proposal this payload refers to, if any.
    pub fn proposal_id(&self) -> Option<u64> {
        match self {
            MessagePayload::Proposal { id }
            | MessagePayload::ProposalMeta { id, .. }
            | MessagePayload::Vote { id, .. }
            | MessagePayload::ProposalExecuted { id, .. } => Some(*id),
            _ => None,
        }
    }

    pub fn text(body: impl Into<String>) -> Self {
        MessagePayload::Text { body: body.into() }
    }
}

/// An interpreted message as the reconciler stores it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageRecord {
    /// `None` for a local echo the network has not confirmed yet.
    pub id: Option<MessageId>,
    /// Sender address (lowercase).
    pub sender: Address,
    /// Send time (Unix ns).
    pub sent_at_ns: i64,
    /// Structured content.
    pub payload: MessagePayload,
    /// True for optimistic local echoes.
    pub synthetic: bool,
}

impl MessageRecord {
    /// Build a local echo for a message that is about to be sent.
    pub fn echo(sender: impl Into<Address>, sent_at_ns: i64, payload: MessagePayload) -> Self {
        Self {
            id: None,
            sender: sender.into(),
            sent_at_ns,
            payload,
            synthetic: true,
        }
    }

    pub fn kind(&self) -> MessageKind {
        self.payload.kind()
    }

    /// Whether `self` is a pending echo that `authoritative` confirms.
    pub fn is_echo_of(&self, authoritative: &MessageRecord) -> bool {
        self.synthetic
            && self.sender == authoritative.sender
            && self.payload == authoritative.payload
    }
}
