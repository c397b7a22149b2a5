//! Conversation discovery.
//!
//! Finding the community conversation is unreliable right after an identity
//! is created or added to a group: welcomes propagate slowly, direct lookup
//! only matches one exact spelling of the id, and enumeration only sees the
//! conversation after a resync. The locator races every strategy and takes
//! the first hit.
//!
//! ```text
//!   Idle ─> AwaitingIdentity ─┬─> Searching ─┬─> Found
//!                             │       ^      ├─> TimedOut
//!                             │       └──────┘
//!                             └─> Failed
//! ```

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conclave_core::GroupId;

use crate::config::{pause, LocatorConfig, RetryPolicy};
use crate::identity::IdentityGate;
use crate::observer::SessionObserver;
use crate::transport::{ConsentState, Conversation, MessagingClient, NetworkEventStream};

/// Where a discovery attempt stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DiscoveryState {
    Idle,
    AwaitingIdentity,
    Searching,
    Found,
    TimedOut,
    Failed,
}

impl DiscoveryState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            DiscoveryState::Found | DiscoveryState::TimedOut | DiscoveryState::Failed
        )
    }
}

/// Result of a full discovery run.
#[derive(Debug)]
pub enum DiscoveryOutcome<V> {
    Found(V),
    TimedOut,
    IdentityNotReady,
    Cancelled,
}

/// Tracks the discovery state and forwards transitions to the observer.
///
/// Once terminal, only an explicit reset leaves the state.
struct DiscoveryTracker {
    state: Mutex<DiscoveryState>,
    observer: Arc<dyn SessionObserver>,
}

impl DiscoveryTracker {
    fn new(observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            state: Mutex::new(DiscoveryState::Idle),
            observer,
        }
    }

    fn current(&self) -> DiscoveryState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn reset(&self) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = DiscoveryState::Idle;
        self.observer.on_discovery_state(DiscoveryState::Idle);
    }

    fn advance(&self, next: DiscoveryState) -> bool {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.is_terminal() {
                return false;
            }
            *state = next;
        }
        self.observer.on_discovery_state(next);
        true
    }
}

/// Resolves a group id to a live conversation handle.
pub struct ConversationLocator<C: MessagingClient> {
    client: Arc<C>,
    config: LocatorConfig,
    tracker: Arc<DiscoveryTracker>,
}

impl<C: MessagingClient> ConversationLocator<C> {
    pub fn new(client: Arc<C>, config: LocatorConfig, observer: Arc<dyn SessionObserver>) -> Self {
        Self {
            client,
            config,
            tracker: Arc::new(DiscoveryTracker::new(observer)),
        }
    }

    pub fn state(&self) -> DiscoveryState {
        self.tracker.current()
    }

    pub fn config(&self) -> &LocatorConfig {
        &self.config
    }

    /// Gate on identity publication, then search.
    pub async fn discover(
        &self,
        gate: &IdentityGate<C>,
        target: &GroupId,
        identity_policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> DiscoveryOutcome<C::Conversation> {
        if !self.await_identity(gate, target, identity_policy, cancel).await {
            return if cancel.is_cancelled() {
                DiscoveryOutcome::Cancelled
            } else {
                DiscoveryOutcome::IdentityNotReady
            };
        }

        match self.search(target, &self.config.policy, cancel).await {
            Some(conversation) => DiscoveryOutcome::Found(conversation),
            None if cancel.is_cancelled() => DiscoveryOutcome::Cancelled,
            None => DiscoveryOutcome::TimedOut,
        }
    }

    /// Start a fresh attempt and wait for the identity gate.
    ///
    /// Moves to `Failed` if the identity never becomes ready.
    pub async fn await_identity(
        &self,
        gate: &IdentityGate<C>,
        target: &GroupId,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> bool {
        self.tracker.reset();
        self.tracker.advance(DiscoveryState::AwaitingIdentity);

        let ready = gate.await_ready(Some(target), policy, cancel).await;
        if !ready {
            self.tracker.advance(DiscoveryState::Failed);
        }
        ready
    }

    /// Start a fresh attempt without identity gating.
    pub async fn locate(
        &self,
        target: &GroupId,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Option<C::Conversation> {
        self.tracker.reset();
        self.search(target, policy, cancel).await
    }

    /// Race every strategy until one resolves the target or the budget
    /// (`interval * max_attempts`) runs out.
    ///
    /// Leaves no work running when it returns.
    pub async fn search(
        &self,
        target: &GroupId,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> Option<C::Conversation> {
        let scope = cancel.child_token();
        let mut tasks = JoinSet::new();

        tasks.spawn(sweep(
            Arc::clone(&self.client),
            target.clone(),
            *policy,
            self.config.consent_states.clone(),
            Arc::clone(&self.tracker),
            scope.clone(),
        ));
        if self.config.observe_events {
            tasks.spawn(observe_events(
                Arc::clone(&self.client),
                target.clone(),
                self.config.event_reopen_interval,
                scope.clone(),
            ));
        }

        let raced = tokio::time::timeout(policy.budget(), first_hit(&mut tasks)).await;
        scope.cancel();
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}

        match raced {
            Ok(Some(conversation)) => {
                info!(group = %target, conversation = conversation.id(), "conversation found");
                self.tracker.advance(DiscoveryState::Found);
                Some(conversation)
            }
            _ if cancel.is_cancelled() => {
                debug!(group = %target, "discovery cancelled");
                self.tracker.advance(DiscoveryState::Failed);
                None
            }
            _ => {
                warn!(
                    group = %target,
                    budget_ms = policy.budget().as_millis() as u64,
                    "conversation not found within budget"
                );
                self.tracker.advance(DiscoveryState::TimedOut);
                None
            }
        }
    }
}

async fn first_hit<V: Send + 'static>(tasks: &mut JoinSet<Option<V>>) -> Option<V> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Some(found)) => return Some(found),
            Ok(None) => {}
            Err(e) if e.is_panic() => warn!(error = %e, "discovery strategy panicked"),
            Err(_) => {}
        }
    }
    None
}

/// Periodic sweep: resync, then direct lookup and enumeration side by side.
async fn sweep<C: MessagingClient>(
    client: Arc<C>,
    target: GroupId,
    policy: RetryPolicy,
    consent: Vec<ConsentState>,
    tracker: Arc<DiscoveryTracker>,
    scope: CancellationToken,
) -> Option<C::Conversation> {
    for attempt in 1..=policy.max_attempts {
        if scope.is_cancelled() {
            return None;
        }
        tracker.advance(DiscoveryState::Searching);

        if let Err(e) = client.resync().await {
            debug!(attempt, error = %e, "resync failed");
        }

        let (direct, listed) = tokio::join!(
            direct_lookup(client.as_ref(), &target),
            enumerate(client.as_ref(), &target, &consent)
        );
        if let Some(found) = direct.or(listed) {
            debug!(attempt, "sweep resolved target");
            return Some(found);
        }

        if attempt < policy.max_attempts && !pause(policy.interval, &scope).await {
            return None;
        }
    }
    None
}

/// Try both spellings of the id.
async fn direct_lookup<C: MessagingClient>(client: &C, target: &GroupId) -> Option<C::Conversation> {
    for candidate in target.variants() {
        match client.find_conversation(&candidate).await {
            Ok(Some(found)) if target.matches(found.id()) => return Some(found),
            Ok(_) => {}
            Err(e) => debug!(candidate = %candidate, error = %e, "direct lookup failed"),
        }
    }
    None
}

/// List conversations and compare normalized ids.
async fn enumerate<C: MessagingClient>(
    client: &C,
    target: &GroupId,
    consent: &[ConsentState],
) -> Option<C::Conversation> {
    match client.list_conversations(consent).await {
        Ok(conversations) => conversations.into_iter().find(|c| target.matches(c.id())),
        Err(e) => {
            debug!(error = %e, "conversation enumeration failed");
            None
        }
    }
}

/// Watch network events and retry direct lookup when the target shows up.
///
/// A stream that fails to open or ends is reopened after `reopen_after`
/// until the scope is cancelled.
async fn observe_events<C: MessagingClient>(
    client: Arc<C>,
    target: GroupId,
    reopen_after: Duration,
    scope: CancellationToken,
) -> Option<C::Conversation> {
    loop {
        match client.stream_events().await {
            Ok(events) => {
                if let Some(found) = watch_events(client.as_ref(), &target, events, &scope).await {
                    return Some(found);
                }
            }
            Err(e) => debug!(error = %e, "event stream unavailable"),
        }

        if !pause(reopen_after, &scope).await {
            return None;
        }
        debug!("reopening event stream");
    }
}

/// Drain one event stream. Returns `None` when it ends or the scope fires.
async fn watch_events<C: MessagingClient>(
    client: &C,
    target: &GroupId,
    mut events: NetworkEventStream,
    scope: &CancellationToken,
) -> Option<C::Conversation> {
    loop {
        let next = tokio::select! {
            _ = scope.cancelled() => return None,
            next = events.next() => next,
        };

        match next {
            Some(Ok(event)) if target.matches(event.conversation_id()) => {
                debug!(?event, "target conversation event");
                if let Err(e) = client.resync().await {
                    debug!(error = %e, "resync after event failed");
                }
                if let Some(found) = direct_lookup(client, target).await {
                    return Some(found);
                }
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                debug!(error = %e, "event stream failed");
                return None;
            }
            None => {
                debug!("event stream ended");
                return None;
            }
        }
    }
}
