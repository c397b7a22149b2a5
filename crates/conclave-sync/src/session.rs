//! Session orchestration.
//!
//! A [`SyncSession`] ties one identity to one community conversation:
//!
//! ```text
//! Disconnected ─> AwaitingIdentity ─> Discovering ─> Syncing <──> Connected
//!        │               │                 │            (stream lost/reopened)
//!        └───────────────┴──> Errored      └─(timeout: stays, retry)
//!
//! any state ── close() or cancelled token ──> Closed
//! ```
//!
//! Once the conversation resolves, the newest history page is loaded in the
//! background while the live stream is opened. Both feed the same
//! reconciler, so their relative order does not matter.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conclave_core::{
    now_nanos, Address, ChainEvent, GroupId, MessagePayload, MessageRecord, Snapshot, VoteOutcome,
};

use crate::config::{RetryPolicy, SessionConfig};
use crate::error::{Result, SyncError};
use crate::governance::GovernanceReader;
use crate::history::{Cursor, HistoryLoader, PageRequest};
use crate::identity::{Connector, IdentityGate, Signer};
use crate::locator::{ConversationLocator, DiscoveryState};
use crate::observer::{NoopObserver, SessionObserver};
use crate::state::{Pipeline, SharedState};
use crate::stream::LiveStreamReader;
use crate::transport::{Conversation, MessagingClient};

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SessionState {
    Disconnected,
    AwaitingIdentity,
    Discovering,
    Syncing,
    Connected,
    Closed,
    Errored,
}

impl SessionState {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Disconnected => "disconnected",
            SessionState::AwaitingIdentity => "awaiting-identity",
            SessionState::Discovering => "discovering",
            SessionState::Syncing => "syncing",
            SessionState::Connected => "connected",
            SessionState::Closed => "closed",
            SessionState::Errored => "errored",
        }
    }
}

type ConversationOf<K> = <<K as Connector>::Client as MessagingClient>::Conversation;

/// Backward pagination position.
#[derive(Debug, Default)]
struct HistoryCursor {
    oldest: Option<Cursor>,
    has_more: bool,
    loaded: bool,
}

/// Session state shared with the background tasks.
struct Lifecycle {
    state: StdMutex<SessionState>,
    /// Held from the state change through the observer call so observers
    /// see transitions in the order they happened.
    notify: StdMutex<()>,
    streaming: AtomicBool,
    observer: Arc<dyn SessionObserver>,
}

impl Lifecycle {
    fn new(observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            state: StdMutex::new(SessionState::Disconnected),
            notify: StdMutex::new(()),
            streaming: AtomicBool::new(false),
            observer,
        }
    }

    fn get(&self) -> SessionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_streaming(&self) -> bool {
        self.streaming.load(Ordering::Acquire)
    }

    fn set_streaming(&self, streaming: bool) {
        self.streaming.store(streaming, Ordering::Release);
    }

    /// Move to `next` if `allow` accepts the current state. `Closed` is never
    /// left. Returns whether the state changed.
    fn transition(&self, next: SessionState, allow: impl FnOnce(SessionState) -> bool) -> bool {
        let _order = self.notify.lock().unwrap_or_else(|e| e.into_inner());
        let previous = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let current = *state;
            if current == next || current == SessionState::Closed || !allow(current) {
                return false;
            }
            *state = next;
            current
        };
        debug!(from = previous.as_str(), to = next.as_str(), "session state");
        self.observer.on_session_state(next);
        true
    }

    fn set(&self, next: SessionState) -> bool {
        self.transition(next, |_| true)
    }
}

/// The resolved conversation, released on close or cancellation.
type ConversationSlot<V> = Arc<StdMutex<Option<V>>>;

fn take_conversation<V>(slot: &ConversationSlot<V>) -> Option<V> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

/// One identity connected to one community conversation.
pub struct SyncSession<K: Connector> {
    connector: Arc<K>,
    signer: Arc<dyn Signer>,
    config: SessionConfig,
    observer: Arc<dyn SessionObserver>,
    governance: Option<Arc<dyn GovernanceReader>>,
    pipeline: Pipeline,
    lifecycle: Arc<Lifecycle>,

    target: Option<GroupId>,
    client: Option<Arc<K::Client>>,
    gate: Option<Arc<IdentityGate<K::Client>>>,
    locator: Option<Arc<ConversationLocator<K::Client>>>,
    conversation: ConversationSlot<ConversationOf<K>>,

    cursor: Arc<Mutex<HistoryCursor>>,
    backfilled: watch::Sender<bool>,
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

impl<K: Connector> SyncSession<K> {
    pub fn new(connector: Arc<K>, signer: Arc<dyn Signer>, config: SessionConfig) -> Self {
        let observer: Arc<dyn SessionObserver> = Arc::new(NoopObserver);
        let (backfilled, _) = watch::channel(false);
        Self {
            connector,
            signer,
            config,
            pipeline: Pipeline::new(SharedState::new(Arc::clone(&observer)), None),
            lifecycle: Arc::new(Lifecycle::new(Arc::clone(&observer))),
            observer,
            governance: None,
            target: None,
            client: None,
            gate: None,
            locator: None,
            conversation: Arc::new(StdMutex::new(None)),
            cursor: Arc::new(Mutex::new(HistoryCursor::default())),
            backfilled,
            cancel: CancellationToken::new(),
            tasks: JoinSet::new(),
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self.lifecycle = Arc::new(Lifecycle::new(Arc::clone(&self.observer)));
        self.rebuild_pipeline();
        self
    }

    pub fn with_governance(mut self, governance: Arc<dyn GovernanceReader>) -> Self {
        self.governance = Some(governance);
        self.rebuild_pipeline();
        self
    }

    fn rebuild_pipeline(&mut self) {
        self.pipeline = Pipeline::new(
            SharedState::new(Arc::clone(&self.observer)),
            self.governance.clone(),
        );
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Accessors
    // ─────────────────────────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.lifecycle.get()
    }

    pub fn target(&self) -> Option<&GroupId> {
        self.target.as_ref()
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn discovery_state(&self) -> DiscoveryState {
        self.locator
            .as_ref()
            .map_or(DiscoveryState::Idle, |l| l.state())
    }

    /// The resolved conversation, if the session still holds one.
    pub fn conversation(&self) -> Option<ConversationOf<K>> {
        self.conversation
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Whether the live stream is currently delivering.
    pub fn is_streaming(&self) -> bool {
        self.lifecycle.is_streaming()
    }

    /// Token that stops every task owned by the session.
    ///
    /// Cancelling it has the same effect as [`close`]: the conversation is
    /// released and the session ends up `Closed`.
    ///
    /// [`close`]: Self::close
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.pipeline.state().snapshot()
    }

    pub fn pending_echoes(&self) -> Vec<MessageRecord> {
        self.pipeline.state().pending_echoes()
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Lifecycle
    // ─────────────────────────────────────────────────────────────────────────

    /// Connect the identity, wait for it to publish, then locate `target`.
    ///
    /// Returns the state reached. A discovery timeout is not an error: the
    /// session stays in `Discovering` and [`retry_discovery`] may be called.
    ///
    /// [`retry_discovery`]: Self::retry_discovery
    pub async fn start(&mut self, target: GroupId) -> Result<SessionState> {
        match self.state() {
            SessionState::Disconnected | SessionState::Errored => {}
            SessionState::Closed => return Err(SyncError::Closed),
            other => {
                return Err(SyncError::InvalidState(format!(
                    "cannot start while {}",
                    other.as_str()
                )))
            }
        }

        info!(group = %target, address = %self.signer.address(), "starting session");
        self.target = Some(target);
        self.lifecycle.set(SessionState::AwaitingIdentity);

        let client = match self.connector.connect(self.signer.as_ref()).await {
            Ok(client) => Arc::new(client),
            Err(e) => return Err(self.fail(e)),
        };

        self.gate = Some(Arc::new(IdentityGate::new(Arc::clone(&client))));
        self.locator = Some(Arc::new(ConversationLocator::new(
            Arc::clone(&client),
            self.config.discovery.clone(),
            Arc::clone(&self.observer),
        )));
        self.client = Some(client);

        let policy = self.config.discovery.policy;
        self.run_discovery(policy).await
    }

    /// Run discovery again after a timeout.
    pub async fn retry_discovery(&mut self, policy: Option<RetryPolicy>) -> Result<SessionState> {
        match self.state() {
            SessionState::Discovering => {}
            SessionState::Closed => return Err(SyncError::Closed),
            other => {
                return Err(SyncError::InvalidState(format!(
                    "cannot retry discovery while {}",
                    other.as_str()
                )))
            }
        }
        let policy = policy.unwrap_or(self.config.discovery.policy);
        self.run_discovery(policy).await
    }

    async fn run_discovery(&mut self, policy: RetryPolicy) -> Result<SessionState> {
        let (Some(gate), Some(locator), Some(target)) =
            (self.gate.clone(), self.locator.clone(), self.target.clone())
        else {
            return Err(SyncError::NotConnected);
        };

        let ready = locator
            .await_identity(&gate, &target, &self.config.identity, &self.cancel)
            .await;
        if self.cancel.is_cancelled() {
            self.close();
            return Ok(self.state());
        }
        if !ready {
            return Err(self.fail(SyncError::IdentityNotReady));
        }

        self.lifecycle.set(SessionState::Discovering);
        match locator.search(&target, &policy, &self.cancel).await {
            Some(conversation) => {
                self.begin_sync(conversation).await;
                Ok(self.state())
            }
            None if self.cancel.is_cancelled() => {
                self.close();
                Ok(self.state())
            }
            None => {
                info!(group = %target, "discovery timed out, waiting for retry");
                Ok(self.state())
            }
        }
    }

    async fn begin_sync(&mut self, conversation: ConversationOf<K>) {
        self.lifecycle.set(SessionState::Syncing);
        *self.conversation.lock().unwrap_or_else(|e| e.into_inner()) = Some(conversation.clone());
        self.spawn_release_on_cancel();
        self.spawn_backfill(conversation.clone());

        match self.open_stream(&conversation).await {
            Ok(()) => self.mark_connected(),
            Err(e) => warn!(error = %e, "live stream unavailable, staying in syncing"),
        }
    }

    /// Release the conversation as soon as the session token fires, even if
    /// nobody calls [`close`](Self::close).
    fn spawn_release_on_cancel(&mut self) {
        let cancel = self.cancel.clone();
        let lifecycle = Arc::clone(&self.lifecycle);
        let conversation = Arc::clone(&self.conversation);
        let group = self.target.clone();

        self.tasks.spawn(async move {
            cancel.cancelled().await;
            take_conversation(&conversation);
            lifecycle.set_streaming(false);
            if lifecycle.set(SessionState::Closed) {
                info!(group = ?group, "session cancelled");
            }
        });
    }

    /// Load the newest page in the background.
    fn spawn_backfill(&mut self, conversation: ConversationOf<K>) {
        let loader = HistoryLoader::new(conversation);
        let pipeline = self.pipeline.clone();
        let cursor = Arc::clone(&self.cursor);
        let backfilled = self.backfilled.clone();
        let page_size = self.config.page_size;
        let refresh = self.config.refresh_after_backfill;
        let cancel = self.cancel.child_token();

        self.tasks.spawn(async move {
            let mut cursor = cursor.lock().await;
            if !cursor.loaded {
                let page = tokio::select! {
                    _ = cancel.cancelled() => return,
                    page = loader.load_page(PageRequest::newest(page_size)) => page,
                };
                match page {
                    Ok(page) => {
                        pipeline.ingest_history(&page.records).await;
                        cursor.oldest = page.oldest_cursor;
                        cursor.has_more = page.has_more;
                        cursor.loaded = true;
                        if refresh {
                            pipeline.refresh_known().await;
                        }
                    }
                    Err(e) => warn!(error = %e, "history backfill failed"),
                }
            }
            drop(cursor);
            backfilled.send_replace(true);
        });
    }

    async fn open_stream(&mut self, conversation: &ConversationOf<K>) -> Result<()> {
        let mut stream = LiveStreamReader::open(conversation, self.cancel.child_token()).await?;
        let pipeline = self.pipeline.clone();
        let lifecycle = Arc::clone(&self.lifecycle);
        let cancel = self.cancel.clone();
        lifecycle.set_streaming(true);

        self.tasks.spawn(async move {
            while let Some(message) = stream.next().await {
                pipeline.ingest_live(&message).await;
            }
            lifecycle.set_streaming(false);
            if cancel.is_cancelled() {
                debug!("live stream closed");
            } else if lifecycle.transition(SessionState::Syncing, |s| s == SessionState::Connected) {
                warn!("live stream lost, waiting for reopen");
            }
        });
        Ok(())
    }

    /// `Connected` only while the stream is actually delivering.
    fn mark_connected(&self) {
        let lifecycle = &self.lifecycle;
        lifecycle.transition(SessionState::Connected, |s| {
            s == SessionState::Syncing && lifecycle.is_streaming()
        });
    }

    /// Re-open the live stream after it ended on a transport error.
    pub async fn reopen_stream(&mut self) -> Result<SessionState> {
        if self.state() == SessionState::Closed {
            return Err(SyncError::Closed);
        }
        let conversation = self.conversation().ok_or(SyncError::NotConnected)?;
        if !self.is_streaming() {
            self.open_stream(&conversation).await?;
        }
        self.mark_connected();
        Ok(self.state())
    }

    /// Wait until the initial history page has been merged (or failed).
    pub async fn wait_backfilled(&self) {
        let mut rx = self.backfilled.subscribe();
        let _ = rx.wait_for(|done| *done).await;
    }

    /// Load the next older page. Returns whether more history may exist.
    pub async fn load_older(&self) -> Result<bool> {
        let conversation = self.conversation().ok_or(SyncError::NotConnected)?;
        let mut cursor = self.cursor.lock().await;
        if cursor.loaded && !cursor.has_more {
            return Ok(false);
        }

        let page = HistoryLoader::new(conversation)
            .load_page(PageRequest {
                before: cursor.oldest.clone(),
                page_size: self.config.page_size,
            })
            .await?;
        self.pipeline.ingest_history(&page.records).await;

        cursor.oldest = page.oldest_cursor;
        cursor.has_more = page.has_more;
        cursor.loaded = true;
        Ok(page.has_more)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Writes
    // ─────────────────────────────────────────────────────────────────────────

    /// Send a message. The echo shows up immediately and is replaced once
    /// the network copy arrives; on failure it is withdrawn.
    pub async fn send(&self, payload: MessagePayload) -> Result<MessageRecord> {
        let conversation = self.conversation().ok_or(SyncError::NotConnected)?;
        let body = payload.encode()?;
        let echo = MessageRecord::echo(self.signer.address(), now_nanos(), payload);

        self.pipeline.state().apply_echo(echo.clone());
        match conversation.send(body).await {
            Ok(id) => {
                debug!(message = %id, kind = %echo.kind(), "message sent");
                Ok(echo)
            }
            Err(e) => {
                warn!(error = %e, "send failed, withdrawing echo");
                self.pipeline.state().discard_echo(&echo);
                Err(e)
            }
        }
    }

    /// Post a vote message and remember it as the local member's choice.
    pub async fn vote(&self, id: u64, support: bool) -> Result<MessageRecord> {
        let echo = self
            .send(MessagePayload::Vote {
                id,
                support,
                voter: self.signer.address(),
            })
            .await?;
        self.pipeline.state().record_own_vote(id, support);
        Ok(echo)
    }

    /// Put back echoes persisted by an earlier session.
    pub fn restore_echoes(&self, echoes: Vec<MessageRecord>) -> usize {
        self.pipeline.state().restore_echoes(echoes)
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Chain
    // ─────────────────────────────────────────────────────────────────────────

    pub async fn apply_chain_event(&self, event: &ChainEvent) -> Option<VoteOutcome> {
        self.pipeline.ingest_chain_event(event).await
    }

    /// Returns `false` when no governance reader is configured.
    pub async fn refresh_tally(&self, id: u64) -> Result<bool> {
        self.pipeline.refresh_tally(id).await
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Teardown
    // ─────────────────────────────────────────────────────────────────────────

    /// Stop discovery, history and the live stream. Idempotent.
    pub fn close(&mut self) {
        self.cancel.cancel();
        self.tasks.abort_all();
        self.lifecycle.set_streaming(false);
        take_conversation(&self.conversation);
        self.locator = None;
        self.gate = None;
        self.client = None;
        if self.lifecycle.set(SessionState::Closed) {
            info!(group = ?self.target, "session closed");
        }
    }

    fn fail(&mut self, error: SyncError) -> SyncError {
        warn!(error = %error, fatal = error.is_fatal(), "session errored");
        self.lifecycle.set(SessionState::Errored);
        error
    }
}

impl<K: Connector> Drop for SyncSession<K> {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
