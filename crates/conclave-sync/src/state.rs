//! Shared reconciled state and the ingest pipeline.
//!
//! History, the live stream, chain events and local sends all run on
//! different tasks. They funnel through one [`SharedState`] so every change
//! is applied under a single lock and observers see snapshots in the order
//! the changes were made.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use conclave_core::{
    interpret, ApplyReport, ChainEvent, ChainProposal, MessageRecord, RawMessage, Snapshot,
    StateReconciler, VoteOutcome,
};

use crate::error::Result;
use crate::governance::GovernanceReader;
use crate::observer::SessionObserver;

/// Reconciler behind a lock, with change notification.
#[derive(Clone)]
pub struct SharedState {
    inner: Arc<Mutex<StateReconciler>>,
    /// Held from apply through notify. Readers only take `inner`.
    notify: Arc<Mutex<()>>,
    observer: Arc<dyn SessionObserver>,
}

impl SharedState {
    pub fn new(observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StateReconciler::new())),
            notify: Arc::new(Mutex::new(())),
            observer,
        }
    }

    fn lock(&self) -> MutexGuard<'_, StateReconciler> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply a mutation, then notify with the resulting snapshot if
    /// `changed` says so. The reconciler lock is released before the observer
    /// runs, but the next mutation waits until the notification is delivered.
    fn update<R>(
        &self,
        apply: impl FnOnce(&mut StateReconciler) -> R,
        changed: impl FnOnce(&R) -> bool,
    ) -> R {
        let _order = self.notify.lock().unwrap_or_else(|e| e.into_inner());
        let (result, snapshot) = {
            let mut reconciler = self.lock();
            let result = apply(&mut reconciler);
            let snapshot = changed(&result).then(|| reconciler.snapshot());
            (result, snapshot)
        };
        if let Some(snapshot) = snapshot {
            self.observer.on_state_change(&snapshot);
        }
        result
    }

    pub fn apply_history(&self, page: &[RawMessage]) -> ApplyReport {
        let records: Vec<MessageRecord> = page.iter().map(interpret).collect();
        self.update(|r| r.apply_history_page(records), ApplyReport::changed)
    }

    pub fn apply_live(&self, message: &RawMessage) -> ApplyReport {
        let record = interpret(message);
        self.update(|r| r.apply_live_message(record), ApplyReport::changed)
    }

    pub fn apply_echo(&self, echo: MessageRecord) {
        self.update(|r| r.apply_own_echo(echo), |_| true);
    }

    pub fn discard_echo(&self, echo: &MessageRecord) -> bool {
        self.update(|r| r.discard_echo(echo), |removed| *removed)
    }

    pub fn restore_echoes(&self, echoes: Vec<MessageRecord>) -> usize {
        self.update(|r| r.restore_echoes(echoes), |restored| *restored > 0)
    }

    pub fn apply_chain_event(&self, event: &ChainEvent) -> Option<VoteOutcome> {
        self.update(|r| r.apply_chain_event(event), |_| true)
    }

    pub fn apply_chain_tally(&self, id: u64, chain: &ChainProposal) {
        self.update(|r| r.apply_chain_tally(id, chain), |_| true);
    }

    pub fn record_own_vote(&self, id: u64, support: bool) {
        self.update(|r| r.record_own_vote(id, support), |_| true);
    }

    pub fn snapshot(&self) -> Snapshot {
        self.lock().snapshot()
    }

    pub fn pending_echoes(&self) -> Vec<MessageRecord> {
        self.lock().pending_echoes()
    }

    pub fn proposal_ids(&self) -> Vec<u64> {
        self.lock().proposal_ids()
    }
}

/// Interprets incoming messages and keeps chain-backed tallies fresh.
#[derive(Clone)]
pub struct Pipeline {
    state: SharedState,
    governance: Option<Arc<dyn GovernanceReader>>,
}

impl Pipeline {
    pub fn new(state: SharedState, governance: Option<Arc<dyn GovernanceReader>>) -> Self {
        Self { state, governance }
    }

    pub fn state(&self) -> &SharedState {
        &self.state
    }

    pub fn has_governance(&self) -> bool {
        self.governance.is_some()
    }

    pub async fn ingest_history(&self, page: &[RawMessage]) -> ApplyReport {
        let report = self.state.apply_history(page);
        debug!(
            inserted = report.inserted,
            duplicates = report.duplicates,
            echoes = report.echoes_reconciled,
            "history merged"
        );
        self.refresh_each(&report.refresh).await;
        report
    }

    pub async fn ingest_live(&self, message: &RawMessage) -> ApplyReport {
        let report = self.state.apply_live(message);
        self.refresh_each(&report.refresh).await;
        report
    }

    pub async fn ingest_chain_event(&self, event: &ChainEvent) -> Option<VoteOutcome> {
        let outcome = self.state.apply_chain_event(event);
        if outcome == Some(VoteOutcome::RefreshRequired) {
            if let Err(e) = self.refresh_tally(event.proposal_id()).await {
                debug!(proposal = event.proposal_id(), error = %e, "tally left stale after chain vote");
            }
        }
        outcome
    }

    /// Replace a proposal's counters with the on-chain tally.
    ///
    /// Returns `false` when no governance reader is configured.
    pub async fn refresh_tally(&self, id: u64) -> Result<bool> {
        let Some(governance) = &self.governance else {
            return Ok(false);
        };

        match governance.get_proposal(id).await {
            Ok(chain) => {
                debug!(proposal = id, yes = chain.yes_votes, no = chain.no_votes, "tally refreshed");
                self.state.apply_chain_tally(id, &chain);
                Ok(true)
            }
            Err(e) => {
                warn!(proposal = id, error = %e, "tally refresh failed");
                Err(e)
            }
        }
    }

    /// Refresh every proposal currently known.
    pub async fn refresh_known(&self) -> usize {
        let ids = self.state.proposal_ids();
        self.refresh_each(&ids).await
    }

    async fn refresh_each(&self, ids: &[u64]) -> usize {
        if self.governance.is_none() {
            return 0;
        }
        let mut refreshed = 0;
        for id in ids.iter().copied().collect::<BTreeSet<_>>() {
            if let Ok(true) = self.refresh_tally(id).await {
                refreshed += 1;
            }
        }
        refreshed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governance::StaticGovernance;
    use crate::observer::RecordingObserver;
    use conclave_core::{Address, MessagePayload};
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    fn chain(yes: u64, no: u64) -> ChainProposal {
        ChainProposal {
            proposer: Address::new("0xp"),
            yes_votes: yes,
            no_votes: no,
            end_time: 1_800_000_000,
            executed: false,
            passed: false,
            title: "Fund the shrine".into(),
            description: String::new(),
        }
    }

    fn vote(id: &str, at: i64, voter: &str) -> RawMessage {
        RawMessage::text(
            id,
            voter,
            at,
            format!(r#"{{"type":"vote","id":7,"support":true,"voter":"{voter}"}}"#),
        )
    }

    #[tokio::test]
    async fn test_observer_sees_changes_only() {
        let observer = Arc::new(RecordingObserver::new());
        let state = SharedState::new(observer.clone());
        let message = RawMessage::text("m1", "0xa", 1, "hello");

        state.apply_live(&message);
        state.apply_live(&message);

        assert_eq!(observer.change_count(), 1);
        assert_eq!(observer.latest_snapshot().unwrap().messages.len(), 1);
    }

    /// Blocks inside its first notification until released.
    struct GatedObserver {
        seen: Mutex<Vec<usize>>,
        gate: Mutex<Option<(mpsc::Sender<()>, mpsc::Receiver<()>)>>,
    }

    impl SessionObserver for GatedObserver {
        fn on_state_change(&self, snapshot: &Snapshot) {
            let gate = self.gate.lock().unwrap().take();
            if let Some((entered, release)) = gate {
                entered.send(()).unwrap();
                release.recv().unwrap();
            }
            self.seen.lock().unwrap().push(snapshot.messages.len());
        }
    }

    #[test]
    fn test_notifications_follow_apply_order() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        let observer = Arc::new(GatedObserver {
            seen: Mutex::new(Vec::new()),
            gate: Mutex::new(Some((entered_tx, release_rx))),
        });
        let state = SharedState::new(observer.clone());

        let first = {
            let state = state.clone();
            thread::spawn(move || state.apply_live(&RawMessage::text("m1", "0xa", 1, "one")))
        };
        entered_rx.recv().unwrap();

        let second = {
            let state = state.clone();
            thread::spawn(move || state.apply_live(&RawMessage::text("m2", "0xb", 2, "two")))
        };
        thread::sleep(Duration::from_millis(20));
        // Readers are not blocked by a slow observer.
        assert_eq!(state.snapshot().messages.len(), 1);
        release_tx.send(()).unwrap();

        first.join().unwrap();
        second.join().unwrap();
        assert_eq!(*observer.seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(state.snapshot().messages.len(), 2);
    }

    #[tokio::test]
    async fn test_vote_after_refresh_refetches() {
        let governance = Arc::new(StaticGovernance::new());
        governance.set(7, chain(3, 1));
        let pipeline = Pipeline::new(
            SharedState::new(Arc::new(RecordingObserver::new())),
            Some(governance.clone()),
        );

        pipeline.ingest_live(&vote("v1", 1, "0xa")).await;
        assert_eq!(pipeline.state().snapshot().proposal(7).unwrap().yes_votes, 1);
        assert_eq!(governance.reads(), 0);

        assert!(pipeline.refresh_tally(7).await.unwrap());
        assert_eq!(pipeline.state().snapshot().proposal(7).unwrap().yes_votes, 3);

        governance.set(7, chain(4, 1));
        pipeline.ingest_live(&vote("v2", 2, "0xb")).await;
        let snapshot = pipeline.state().snapshot();
        assert_eq!(snapshot.proposal(7).unwrap().yes_votes, 4);
        assert_eq!(governance.reads(), 2);
    }

    #[tokio::test]
    async fn test_chain_vote_after_refresh_refetches() {
        let governance = Arc::new(StaticGovernance::new());
        governance.set(7, chain(1, 0));
        let pipeline = Pipeline::new(
            SharedState::new(Arc::new(RecordingObserver::new())),
            Some(governance.clone()),
        );
        pipeline.refresh_tally(7).await.unwrap();

        governance.set(7, chain(1, 1));
        let outcome = pipeline
            .ingest_chain_event(&ChainEvent::VoteCast {
                id: 7,
                voter: Address::new("0xc"),
                support: false,
                timestamp: 0,
            })
            .await;
        assert_eq!(outcome, Some(VoteOutcome::RefreshRequired));
        assert_eq!(pipeline.state().snapshot().proposal(7).unwrap().no_votes, 1);
    }

    #[tokio::test]
    async fn test_no_governance_keeps_local_counts() {
        let pipeline = Pipeline::new(SharedState::new(Arc::new(RecordingObserver::new())), None);
        pipeline.ingest_live(&vote("v1", 1, "0xa")).await;
        assert!(!pipeline.refresh_tally(7).await.unwrap());
        assert_eq!(pipeline.refresh_known().await, 0);
        assert_eq!(pipeline.state().snapshot().proposal(7).unwrap().yes_votes, 1);
    }

    #[tokio::test]
    async fn test_missing_proposal_is_error() {
        let pipeline = Pipeline::new(
            SharedState::new(Arc::new(RecordingObserver::new())),
            Some(Arc::new(StaticGovernance::new())),
        );
        let err = pipeline.refresh_tally(99).await.unwrap_err();
        assert!(err.is_retryable());
    }

    #[tokio::test]
    async fn test_echo_then_confirmation() {
        let state = SharedState::new(Arc::new(RecordingObserver::new()));
        state.apply_echo(MessageRecord::echo("0xme", 5, MessagePayload::text("gm")));
        assert_eq!(state.pending_echoes().len(), 1);

        state.apply_live(&RawMessage::text("m9", "0xme", 6, "gm"));
        let snapshot = state.snapshot();
        assert_eq!(snapshot.messages.len(), 1);
        assert!(!snapshot.messages[0].synthetic);
    }
}
