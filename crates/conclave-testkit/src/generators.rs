//! Proptest generators for property-based testing.

use proptest::prelude::*;

use conclave_core::{Address, ContentKind, MessageId, MessagePayload, RawMessage};

/// Generate a member address.
pub fn address() -> impl Strategy<Value = Address> {
    any::<[u8; 20]>().prop_map(|bytes| Address::new(format!("0x{}", hex::encode(bytes))))
}

/// Generate a proposal id.
pub fn proposal_id() -> impl Strategy<Value = u64> {
    0u64..=1_000
}

/// Generate a send time (Unix ns).
pub fn sent_at() -> impl Strategy<Value = i64> {
    0i64..=1_000_000
}

/// Generate any structured or text payload.
pub fn payload() -> impl Strategy<Value = MessagePayload> {
    prop_oneof![
        "[ -~]{0,40}".prop_map(MessagePayload::text),
        proposal_id().prop_map(|id| MessagePayload::Proposal { id }),
        (proposal_id(), "[a-zA-Z ]{1,20}", "[ -~]{0,40}").prop_map(|(id, title, description)| {
            MessagePayload::ProposalMeta {
                id,
                title,
                description,
            }
        }),
        (proposal_id(), any::<bool>(), address())
            .prop_map(|(id, support, voter)| MessagePayload::Vote { id, support, voter }),
        address().prop_map(|new_priest| MessagePayload::PriestChanged { new_priest }),
        (proposal_id(), any::<bool>())
            .prop_map(|(id, success)| MessagePayload::ProposalExecuted { id, success }),
        address().prop_map(|member| MessagePayload::MemberJoined { member }),
    ]
}

/// Generate a raw message carrying an encoded payload, arbitrary text or a
/// membership change.
pub fn raw_message() -> impl Strategy<Value = RawMessage> {
    (
        "[a-z0-9]{1,12}",
        address(),
        sent_at(),
        payload(),
        any::<bool>(),
    )
        .prop_map(|(id, sender, sent_at_ns, payload, membership)| {
            let content = payload.encode().unwrap_or_default();
            RawMessage {
                id: MessageId::new(id),
                sender,
                sent_at_ns,
                content_kind: if membership {
                    ContentKind::MembershipChange
                } else {
                    ContentKind::Application
                },
                content,
            }
        })
}

/// Generate a page of messages with unique ids.
pub fn history(max_len: usize) -> impl Strategy<Value = Vec<RawMessage>> {
    prop::collection::vec(raw_message(), 0..=max_len).prop_map(|mut messages| {
        for (n, message) in messages.iter_mut().enumerate() {
            message.id = MessageId::new(format!("{n}-{}", message.id));
        }
        messages
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_core::{interpret, parse_payload, MessageKind, StateReconciler};

    proptest! {
        #[test]
        fn test_interpretation_is_pure(raw in raw_message()) {
            prop_assert_eq!(interpret(&raw), interpret(&raw));
        }

        #[test]
        fn test_structured_payload_reads_back(payload in payload()) {
            prop_assume!(payload.kind() != MessageKind::Text);
            let bytes = payload.encode().unwrap();
            prop_assert_eq!(parse_payload(&bytes), payload);
        }

        #[test]
        fn test_split_between_history_and_live_converges(
            messages in history(30),
            split in 0usize..=30,
        ) {
            let split = split.min(messages.len());

            let mut all_history = StateReconciler::new();
            all_history.apply_history_page(messages.iter().map(interpret));

            let mut mixed = StateReconciler::new();
            for message in &messages[split..] {
                mixed.apply_live_message(interpret(message));
            }
            mixed.apply_history_page(messages[..split].iter().map(interpret));
            mixed.apply_history_page(messages.iter().map(interpret));

            let mut left: Vec<_> = all_history.messages().iter().map(|m| m.id.clone()).collect();
            let mut right: Vec<_> = mixed.messages().iter().map(|m| m.id.clone()).collect();
            left.sort();
            right.sort();
            prop_assert_eq!(left, right);
            prop_assert!(mixed
                .messages()
                .windows(2)
                .all(|w| w[0].sent_at_ns <= w[1].sent_at_ns));
        }
    }
}
