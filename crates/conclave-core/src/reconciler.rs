//! The state reconciler: single owner of the message list and proposal map.
//!
//! Three sources feed it in no particular order: history pages, the live
//! stream, and on-chain governance events. Every `apply_*` call is
//! idempotent and absorbs duplicate or out-of-order input.
//!
//! ## Invariants
//!
//! - Messages are sorted non-decreasing by `sent_at_ns` after every call.
//! - At most one record exists per non-null message id.
//! - A proposal is never removed once created.
//! - Before the first on-chain refresh of a proposal, vote signals only ever
//!   increment its counters; afterwards they only request another refresh.
//!
//! ## Ordering
//!
//! Records with equal timestamps keep their insertion order. The transport
//! gives no stronger guarantee, so this is implementation-defined rather than
//! part of the contract.

use std::collections::{BTreeMap, HashMap, HashSet};

use crate::message::{MessagePayload, MessageRecord};
use crate::proposal::{ChainEvent, ChainProposal, ProposalPatch, ProposalRecord};
use crate::types::{Address, MessageId};

/// What a vote signal did to the tally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// The in-memory counter was incremented.
    Counted,
    /// This voter was already counted for the proposal.
    AlreadyCounted,
    /// The tally is chain-backed; fetch it again instead of incrementing.
    RefreshRequired,
}

/// Summary of a merge.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Records that were new.
    pub inserted: usize,
    /// Records whose id was already present.
    pub duplicates: usize,
    /// Local echoes replaced by their authoritative copy.
    pub echoes_reconciled: usize,
    /// Proposals whose tally should be re-fetched from chain.
    pub refresh: Vec<u64>,
}

impl ApplyReport {
    /// Whether the merge changed visible state.
    pub fn changed(&self) -> bool {
        self.inserted > 0 || self.echoes_reconciled > 0
    }
}

/// Read-only view of reconciled state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    pub messages: Vec<MessageRecord>,
    pub proposals: BTreeMap<u64, ProposalRecord>,
    /// The local member's own choices, for "you voted X".
    pub own_votes: BTreeMap<u64, bool>,
}

impl Snapshot {
    pub fn proposal(&self, id: u64) -> Option<&ProposalRecord> {
        self.proposals.get(&id)
    }

    /// Messages that are still waiting for network confirmation.
    pub fn pending(&self) -> impl Iterator<Item = &MessageRecord> {
        self.messages.iter().filter(|m| m.synthetic)
    }
}

/// Merges history, live and chain inputs into one consistent view.
#[derive(Debug, Default)]
pub struct StateReconciler {
    /// Ordered by `sent_at_ns`, ties in insertion order.
    messages: Vec<MessageRecord>,
    /// Ids of every confirmed record in `messages`.
    ids: HashSet<MessageId>,
    proposals: BTreeMap<u64, ProposalRecord>,
    /// Voters already counted per proposal, before any chain refresh.
    counted_voters: HashMap<u64, HashSet<Address>>,
    /// Proposals whose counters came from chain at least once.
    chain_refreshed: HashSet<u64>,
    own_votes: BTreeMap<u64, bool>,
}

impl StateReconciler {
    pub fn new() -> Self {
        Self::default()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Messages
    // ─────────────────────────────────────────────────────────────────────────

    /// Merge a page of history. Records already present win.
    pub fn apply_history_page<I>(&mut self, records: I) -> ApplyReport
    where
        I: IntoIterator<Item = MessageRecord>,
    {
        let mut report = ApplyReport::default();
        for record in records {
            self.merge_confirmed(record, &mut report);
        }
        report
    }

    /// Merge one message from the live stream.
    ///
    /// A pending echo with the same sender and payload is replaced by the
    /// authoritative copy.
    pub fn apply_live_message(&mut self, record: MessageRecord) -> ApplyReport {
        let mut report = ApplyReport::default();
        self.merge_confirmed(record, &mut report);
        report
    }

    /// Show a locally sent message before the network confirms it.
    pub fn apply_own_echo(&mut self, record: MessageRecord) {
        self.insert_sorted(MessageRecord {
            id: None,
            synthetic: true,
            ..record
        });
    }

    /// Drop a pending echo whose send failed. Returns false if none matched.
    pub fn discard_echo(&mut self, echo: &MessageRecord) -> bool {
        let found = self.messages.iter().position(|m| {
            m.synthetic
                && m.sender == echo.sender
                && m.payload == echo.payload
                && m.sent_at_ns == echo.sent_at_ns
        });
        match found {
            Some(pos) => {
                self.messages.remove(pos);
                true
            }
            None => false,
        }
    }

    /// Re-insert echoes persisted by a previous session.
    pub fn restore_echoes<I>(&mut self, echoes: I) -> usize
    where
        I: IntoIterator<Item = MessageRecord>,
    {
        let mut restored = 0;
        for echo in echoes {
            let present = self.messages.iter().any(|m| {
                m.synthetic
                    && m.sender == echo.sender
                    && m.payload == echo.payload
                    && m.sent_at_ns == echo.sent_at_ns
            });
            if !present {
                self.apply_own_echo(echo);
                restored += 1;
            }
        }
        restored
    }

    pub fn pending_echoes(&self) -> Vec<MessageRecord> {
        self.messages.iter().filter(|m| m.synthetic).cloned().collect()
    }

    pub fn messages(&self) -> &[MessageRecord] {
        &self.messages
    }

    pub fn contains_message(&self, id: &MessageId) -> bool {
        self.ids.contains(id)
    }

    /// Oldest confirmed send time, used as a history cursor.
    pub fn oldest_confirmed(&self) -> Option<i64> {
        self.messages
            .iter()
            .find(|m| !m.synthetic)
            .map(|m| m.sent_at_ns)
    }

    fn merge_confirmed(&mut self, record: MessageRecord, report: &mut ApplyReport) {
        let Some(id) = record.id.clone() else {
            // Nothing to deduplicate against; keep it visible as pending.
            self.apply_own_echo(record);
            report.inserted += 1;
            return;
        };

        if self.ids.contains(&id) {
            report.duplicates += 1;
            return;
        }

        let record = MessageRecord {
            synthetic: false,
            ..record
        };

        match self.messages.iter().position(|m| m.is_echo_of(&record)) {
            Some(pos) => {
                self.messages.remove(pos);
                report.echoes_reconciled += 1;
            }
            None => report.inserted += 1,
        }

        self.ids.insert(id);
        self.fold_signals(&record, report);
        self.insert_sorted(record);
    }

    /// Feed governance-related messages into the proposal map.
    fn fold_signals(&mut self, record: &MessageRecord, report: &mut ApplyReport) {
        match &record.payload {
            MessagePayload::Proposal { id } => {
                self.apply_proposal_signal(*id, &ProposalPatch::default());
            }
            MessagePayload::ProposalMeta {
                id,
                title,
                description,
            } => {
                self.apply_proposal_signal(
                    *id,
                    &ProposalPatch {
                        title: Some(title.clone()),
                        description: Some(description.clone()),
                        ..Default::default()
                    },
                );
            }
            MessagePayload::Vote { id, support, voter } => {
                if self.apply_vote_signal(*id, *support, Some(voter))
                    == VoteOutcome::RefreshRequired
                {
                    report.refresh.push(*id);
                }
            }
            MessagePayload::ProposalExecuted { id, success } => {
                self.apply_proposal_signal(
                    *id,
                    &ProposalPatch {
                        executed: Some(true),
                        passed: Some(*success),
                        ..Default::default()
                    },
                );
            }
            _ => {}
        }
    }

    fn insert_sorted(&mut self, record: MessageRecord) {
        let pos = self
            .messages
            .partition_point(|m| m.sent_at_ns <= record.sent_at_ns);
        self.messages.insert(pos, record);
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Proposals
    // ─────────────────────────────────────────────────────────────────────────

    /// Create the proposal if needed, then merge sparse fields into it.
    pub fn apply_proposal_signal(&mut self, id: u64, patch: &ProposalPatch) {
        self.proposals
            .entry(id)
            .or_insert_with(|| ProposalRecord::new(id))
            .merge(patch);
    }

    /// Count a vote, unless the tally is already chain-backed.
    ///
    /// When `voter` is known, each voter is counted at most once per proposal,
    /// so the same vote observed on the stream and as a chain event only
    /// increments once.
    pub fn apply_vote_signal(
        &mut self,
        id: u64,
        support: bool,
        voter: Option<&Address>,
    ) -> VoteOutcome {
        let proposal = self
            .proposals
            .entry(id)
            .or_insert_with(|| ProposalRecord::new(id));

        if self.chain_refreshed.contains(&id) {
            return VoteOutcome::RefreshRequired;
        }

        if let Some(voter) = voter.filter(|v| !v.is_empty()) {
            if !self.counted_voters.entry(id).or_default().insert(voter.clone()) {
                return VoteOutcome::AlreadyCounted;
            }
        }

        if support {
            proposal.yes_votes = proposal.yes_votes.saturating_add(1);
        } else {
            proposal.no_votes = proposal.no_votes.saturating_add(1);
        }
        VoteOutcome::Counted
    }

    /// Fold a governance contract event.
    ///
    /// Returns the vote outcome for `VoteCast`, `None` for `ProposalCreated`.
    pub fn apply_chain_event(&mut self, event: &ChainEvent) -> Option<VoteOutcome> {
        match event {
            ChainEvent::ProposalCreated {
                id,
                proposer,
                end_time,
                title,
                description,
            } => {
                self.apply_proposal_signal(
                    *id,
                    &ProposalPatch {
                        title: Some(title.clone()),
                        description: Some(description.clone()),
                        proposer: Some(proposer.to_string()),
                        end_time: Some(*end_time),
                        ..Default::default()
                    },
                );
                None
            }
            ChainEvent::VoteCast {
                id, voter, support, ..
            } => Some(self.apply_vote_signal(*id, *support, Some(voter))),
        }
    }

    /// Replace counters with the authoritative on-chain tally.
    pub fn apply_chain_tally(&mut self, id: u64, chain: &ChainProposal) {
        self.proposals
            .entry(id)
            .or_insert_with(|| ProposalRecord::new(id))
            .apply_chain(chain);
        self.chain_refreshed.insert(id);
        self.counted_voters.remove(&id);
    }

    pub fn is_chain_refreshed(&self, id: u64) -> bool {
        self.chain_refreshed.contains(&id)
    }

    pub fn proposal(&self, id: u64) -> Option<&ProposalRecord> {
        self.proposals.get(&id)
    }

    pub fn proposal_ids(&self) -> Vec<u64> {
        self.proposals.keys().copied().collect()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Vote attribution
    // ─────────────────────────────────────────────────────────────────────────

    /// Remember what the local member voted. Display only.
    pub fn record_own_vote(&mut self, id: u64, support: bool) {
        self.own_votes.insert(id, support);
    }

    pub fn own_vote(&self, id: u64) -> Option<bool> {
        self.own_votes.get(&id).copied()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Snapshot
    // ─────────────────────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            messages: self.messages.clone(),
            proposals: self.proposals.clone(),
            own_votes: self.own_votes.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn text(id: &str, sender: &str, at: i64, body: &str) -> MessageRecord {
        MessageRecord {
            id: Some(MessageId::new(id)),
            sender: Address::new(sender),
            sent_at_ns: at,
            payload: MessagePayload::text(body),
            synthetic: false,
        }
    }

    fn vote(id: &str, at: i64, proposal: u64, support: bool, voter: &str) -> MessageRecord {
        MessageRecord {
            id: Some(MessageId::new(id)),
            sender: Address::new(voter),
            sent_at_ns: at,
            payload: MessagePayload::Vote {
                id: proposal,
                support,
                voter: Address::new(voter),
            },
            synthetic: false,
        }
    }

    fn is_sorted(messages: &[MessageRecord]) -> bool {
        messages.windows(2).all(|w| w[0].sent_at_ns <= w[1].sent_at_ns)
    }

    #[test]
    fn test_history_page_idempotent() {
        let page = vec![
            text("a", "0x1", 30, "third"),
            text("b", "0x1", 10, "first"),
            text("c", "0x2", 20, "second"),
        ];

        let mut once = StateReconciler::new();
        once.apply_history_page(page.clone());

        let mut twice = StateReconciler::new();
        twice.apply_history_page(page.clone());
        let report = twice.apply_history_page(page);

        assert_eq!(report.duplicates, 3);
        assert!(!report.changed());
        assert_eq!(once.snapshot(), twice.snapshot());
        assert!(is_sorted(twice.messages()));
    }

    #[test]
    fn test_existing_record_wins() {
        let mut reconciler = StateReconciler::new();
        reconciler.apply_live_message(text("a", "0x1", 10, "live"));
        reconciler.apply_history_page(vec![text("a", "0x1", 10, "history")]);

        assert_eq!(reconciler.messages().len(), 1);
        assert_eq!(reconciler.messages()[0].payload, MessagePayload::text("live"));
    }

    #[test]
    fn test_echo_reconciled_by_live_copy() {
        let mut reconciler = StateReconciler::new();
        reconciler.apply_own_echo(MessageRecord::echo("0xME", 100, MessagePayload::text("gm")));
        assert_eq!(reconciler.pending_echoes().len(), 1);

        let report = reconciler.apply_live_message(text("m1", "0xme", 105, "gm"));

        assert_eq!(report.echoes_reconciled, 1);
        assert_eq!(reconciler.messages().len(), 1);
        let only = &reconciler.messages()[0];
        assert!(!only.synthetic);
        assert_eq!(only.id, Some(MessageId::new("m1")));
    }

    #[test]
    fn test_echo_not_matched_across_senders() {
        let mut reconciler = StateReconciler::new();
        reconciler.apply_own_echo(MessageRecord::echo("0xme", 100, MessagePayload::text("gm")));
        reconciler.apply_live_message(text("m1", "0xother", 101, "gm"));

        assert_eq!(reconciler.messages().len(), 2);
        assert_eq!(reconciler.pending_echoes().len(), 1);
    }

    #[test]
    fn test_echo_reconciled_by_history() {
        let mut reconciler = StateReconciler::new();
        reconciler.restore_echoes(vec![MessageRecord::echo(
            "0xme",
            100,
            MessagePayload::text("gm"),
        )]);
        reconciler.apply_history_page(vec![text("m1", "0xme", 101, "gm")]);

        assert_eq!(reconciler.messages().len(), 1);
        assert!(reconciler.pending_echoes().is_empty());
    }

    #[test]
    fn test_restore_echoes_skips_present() {
        let echo = MessageRecord::echo("0xme", 100, MessagePayload::text("gm"));
        let mut reconciler = StateReconciler::new();
        assert_eq!(reconciler.restore_echoes(vec![echo.clone()]), 1);
        assert_eq!(reconciler.restore_echoes(vec![echo]), 0);
        assert_eq!(reconciler.messages().len(), 1);
    }

    #[test]
    fn test_discard_echo() {
        let echo = MessageRecord::echo("0xme", 100, MessagePayload::text("oops"));
        let mut reconciler = StateReconciler::new();
        reconciler.apply_own_echo(echo.clone());
        assert!(reconciler.discard_echo(&echo));
        assert!(!reconciler.discard_echo(&echo));
        assert!(reconciler.messages().is_empty());
    }

    #[test]
    fn test_equal_timestamps_keep_insertion_order() {
        let mut reconciler = StateReconciler::new();
        reconciler.apply_live_message(text("x", "0x1", 5, "first"));
        reconciler.apply_live_message(text("y", "0x1", 5, "second"));
        reconciler.apply_live_message(text("z", "0x1", 1, "earlier"));

        let bodies: Vec<_> = reconciler
            .messages()
            .iter()
            .map(|m| m.id.clone().unwrap().0)
            .collect();
        assert_eq!(bodies, vec!["z", "x", "y"]);
    }

    #[test]
    fn test_vote_before_proposal_created() {
        let mut reconciler = StateReconciler::new();
        reconciler.apply_live_message(vote("v1", 10, 7, true, "0xvoter"));

        let proposal = reconciler.proposal(7).unwrap();
        assert_eq!(proposal.title, "Proposal #7");
        assert_eq!(proposal.yes_votes, 1);

        reconciler.apply_chain_event(&ChainEvent::ProposalCreated {
            id: 7,
            proposer: Address::new("0xproposer"),
            end_time: 0,
            title: "Raise fee".into(),
            description: String::new(),
        });

        let proposal = reconciler.proposal(7).unwrap();
        assert_eq!(proposal.title, "Raise fee");
        assert_eq!(proposal.yes_votes, 1);
        assert_eq!(proposal.proposer, "0xproposer");
    }

    #[test]
    fn test_same_voter_counted_once_across_sources() {
        let mut reconciler = StateReconciler::new();
        reconciler.apply_live_message(vote("v1", 10, 1, true, "0xaa"));
        let outcome = reconciler.apply_chain_event(&ChainEvent::VoteCast {
            id: 1,
            voter: Address::new("0xAA"),
            support: true,
            timestamp: 11,
        });

        assert_eq!(outcome, Some(VoteOutcome::AlreadyCounted));
        assert_eq!(reconciler.proposal(1).unwrap().yes_votes, 1);
    }

    #[test]
    fn test_vote_after_refresh_requests_refetch() {
        let mut reconciler = StateReconciler::new();
        reconciler.apply_vote_signal(2, false, None);
        reconciler.apply_chain_tally(
            2,
            &ChainProposal {
                proposer: Address::new("0xp"),
                yes_votes: 4,
                no_votes: 3,
                end_time: 50,
                executed: false,
                passed: false,
                title: "Treasury".into(),
                description: String::new(),
            },
        );

        let report = reconciler.apply_live_message(vote("v9", 20, 2, true, "0xnew"));
        assert_eq!(report.refresh, vec![2]);
        assert_eq!(reconciler.apply_vote_signal(2, true, None), VoteOutcome::RefreshRequired);

        let proposal = reconciler.proposal(2).unwrap();
        assert_eq!((proposal.yes_votes, proposal.no_votes), (4, 3));
        assert!(reconciler.is_chain_refreshed(2));
    }

    #[test]
    fn test_executed_message_marks_proposal() {
        let mut reconciler = StateReconciler::new();
        reconciler.apply_live_message(MessageRecord {
            id: Some(MessageId::new("e1")),
            sender: Address::new("0xpriest"),
            sent_at_ns: 1,
            payload: MessagePayload::ProposalExecuted { id: 4, success: true },
            synthetic: false,
        });
        let proposal = reconciler.proposal(4).unwrap();
        assert!(proposal.executed);
        assert!(proposal.passed);
    }

    #[test]
    fn test_echoed_vote_not_counted_until_confirmed() {
        let mut reconciler = StateReconciler::new();
        let payload = MessagePayload::Vote {
            id: 5,
            support: true,
            voter: Address::new("0xme"),
        };
        reconciler.apply_own_echo(MessageRecord::echo("0xme", 1, payload.clone()));
        reconciler.record_own_vote(5, true);
        assert!(reconciler.proposal(5).is_none());

        reconciler.apply_live_message(MessageRecord {
            id: Some(MessageId::new("v")),
            sender: Address::new("0xme"),
            sent_at_ns: 2,
            payload,
            synthetic: false,
        });
        assert_eq!(reconciler.proposal(5).unwrap().yes_votes, 1);
        assert_eq!(reconciler.own_vote(5), Some(true));
        assert_eq!(reconciler.snapshot().own_votes.get(&5), Some(&true));
    }

    #[derive(Debug, Clone)]
    enum Op {
        History(Vec<(u8, i64)>),
        Live(u8, i64),
        Echo(i64),
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            prop::collection::vec((0u8..20, 0i64..50), 0..10).prop_map(Op::History),
            (0u8..20, 0i64..50).prop_map(|(id, at)| Op::Live(id, at)),
            (0i64..50).prop_map(Op::Echo),
        ]
    }

    fn record(id: u8, at: i64) -> MessageRecord {
        text(&format!("m{id}"), "0xme", at, &format!("body {id}"))
    }

    proptest! {
        #[test]
        fn prop_sorted_and_unique(ops in prop::collection::vec(op(), 0..40)) {
            let mut reconciler = StateReconciler::new();
            for op in ops {
                match op {
                    Op::History(items) => {
                        reconciler.apply_history_page(items.into_iter().map(|(id, at)| record(id, at)));
                    }
                    Op::Live(id, at) => {
                        reconciler.apply_live_message(record(id, at));
                    }
                    Op::Echo(at) => {
                        reconciler.apply_own_echo(MessageRecord::echo(
                            "0xme",
                            at,
                            MessagePayload::text(format!("body {}", at % 20)),
                        ));
                    }
                }

                prop_assert!(is_sorted(reconciler.messages()));
                let mut seen = HashSet::new();
                for m in reconciler.messages() {
                    if let Some(id) = &m.id {
                        prop_assert!(seen.insert(id.clone()), "duplicate id {}", id);
                    }
                }
            }
        }

        #[test]
        fn prop_votes_monotonic_before_refresh(votes in prop::collection::vec((any::<bool>(), 0u8..8), 0..50)) {
            let mut reconciler = StateReconciler::new();
            let mut last = (0u64, 0u64);
            for (support, voter) in votes {
                let voter = Address::new(format!("0x{voter}"));
                reconciler.apply_vote_signal(1, support, Some(&voter));
                let p = reconciler.proposal(1).unwrap();
                prop_assert!(p.yes_votes >= last.0 && p.no_votes >= last.1);
                last = (p.yes_votes, p.no_votes);
            }
            prop_assert!(last.0 + last.1 <= 8);
        }
    }
}
