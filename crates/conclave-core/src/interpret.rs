//! Message interpretation.
//!
//! Application bodies may carry a JSON envelope with a `type` discriminator:
//!
//! ```text
//! {"type":"proposal","id":7}
//! {"type":"proposal-meta","id":7,"title":"Raise fee","description":"..."}
//! {"type":"vote","id":7,"support":true,"voter":"0xabc..."}
//! {"type":"member-joined","member":"0xabc..."}
//! {"type":"priest-changed","newPriest":"0xabc..."}
//! {"type":"proposal-executed","id":7,"success":true}
//! ```
//!
//! Anything else (invalid JSON, an unknown `type`, missing fields) is kept
//! as text with the original body. Interpretation never fails.

use bytes::Bytes;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{CoreError, Result};
use crate::message::{ContentKind, MessagePayload, MessageRecord, RawMessage};
use crate::types::Address;

/// Interpret a raw transport message.
///
/// Pure: the same input always yields the same record.
pub fn interpret(raw: &RawMessage) -> MessageRecord {
    let payload = match raw.content_kind {
        ContentKind::MembershipChange => MessagePayload::System {
            body: String::from_utf8_lossy(&raw.content).into_owned(),
        },
        ContentKind::Application => parse_payload(&raw.content),
    };

    MessageRecord {
        id: Some(raw.id.clone()),
        sender: raw.sender.clone(),
        sent_at_ns: raw.sent_at_ns,
        payload,
        synthetic: false,
    }
}

/// Parse an application body into a payload, falling back to text.
pub fn parse_payload(content: &[u8]) -> MessagePayload {
    match serde_json::from_slice::<Envelope>(content) {
        Ok(envelope) => envelope.into(),
        Err(_) => MessagePayload::Text {
            body: String::from_utf8_lossy(content).into_owned(),
        },
    }
}

impl MessagePayload {
    /// Encode for sending. Structured kinds become a JSON envelope that
    /// [`interpret`] reads back into an equal payload.
    pub fn encode(&self) -> Result<Bytes> {
        let envelope = match self {
            MessagePayload::Text { body } | MessagePayload::System { body } => {
                return Ok(Bytes::from(body.clone()));
            }
            MessagePayload::Proposal { id } => Envelope::Proposal { id: *id },
            MessagePayload::ProposalMeta {
                id,
                title,
                description,
            } => Envelope::ProposalMeta {
                id: *id,
                title: title.clone(),
                description: description.clone(),
            },
            MessagePayload::Vote { id, support, voter } => Envelope::Vote {
                id: *id,
                support: *support,
                voter: voter.to_string(),
            },
            MessagePayload::PriestChanged { new_priest } => Envelope::PriestChanged {
                new_priest: new_priest.to_string(),
            },
            MessagePayload::ProposalExecuted { id, success } => Envelope::ProposalExecuted {
                id: *id,
                success: *success,
            },
            MessagePayload::MemberJoined { member } => Envelope::MemberJoined {
                member: member.to_string(),
            },
        };

        serde_json::to_vec(&envelope)
            .map(Bytes::from)
            .map_err(|e| CoreError::EncodingError(e.to_string()))
    }
}

/// Wire envelope for structured messages.
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum Envelope {
    Proposal {
        #[serde(deserialize_with = "flexible_id")]
        id: u64,
    },
    ProposalMeta {
        #[serde(deserialize_with = "flexible_id")]
        id: u64,
        title: String,
        description: String,
    },
    Vote {
        #[serde(deserialize_with = "flexible_id")]
        id: u64,
        support: bool,
        voter: String,
    },
    MemberJoined {
        member: String,
    },
    PriestChanged {
        #[serde(rename = "newPriest")]
        new_priest: String,
    },
    ProposalExecuted {
        #[serde(deserialize_with = "flexible_id")]
        id: u64,
        success: bool,
    },
}

impl From<Envelope> for MessagePayload {
    fn from(envelope: Envelope) -> Self {
        match envelope {
            Envelope::Proposal { id } => MessagePayload::Proposal { id },
            Envelope::ProposalMeta {
                id,
                title,
                description,
            } => MessagePayload::ProposalMeta {
                id,
                title,
                description,
            },
            Envelope::Vote { id, support, voter } => MessagePayload::Vote {
                id,
                support,
                voter: Address::new(voter),
            },
            Envelope::MemberJoined { member } => MessagePayload::MemberJoined {
                member: Address::new(member),
            },
            Envelope::PriestChanged { new_priest } => MessagePayload::PriestChanged {
                new_priest: Address::new(new_priest),
            },
            Envelope::ProposalExecuted { id, success } => {
                MessagePayload::ProposalExecuted { id, success }
            }
        }
    }
}

/// Proposal ids arrive as JSON numbers or as decimal strings.
fn flexible_id<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum IdRepr {
        Number(u64),
        Text(String),
    }

    match IdRepr::deserialize(deserializer)? {
        IdRepr::Number(n) => Ok(n),
        IdRepr::Text(s) => s.trim().parse().map_err(D::Error::custom),
    }
}
