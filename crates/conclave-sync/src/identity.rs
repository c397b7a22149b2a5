//! Identity creation and publication gating.
//!
//! A freshly created messaging identity is not immediately discoverable by
//! other members. Adding it to a conversation before it propagates fails on
//! their side, so discovery waits until the identity is published.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conclave_core::{Address, GroupId};

use crate::config::{pause, RetryPolicy};
use crate::error::Result;
use crate::transport::MessagingClient;

/// Signs identity challenges on behalf of a wallet.
#[async_trait]
pub trait Signer: Send + Sync {
    fn address(&self) -> Address;

    async fn sign_message(&self, message: &[u8]) -> Result<Vec<u8>>;
}

/// Creates (or loads) a messaging identity and publishes it.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    type Client: MessagingClient;

    async fn connect(&self, signer: &dyn Signer) -> Result<Self::Client>;
}

/// Decides when an identity is visible enough to proceed with discovery.
///
/// Readiness is memoized: once reached it is never re-checked.
pub struct IdentityGate<C: MessagingClient> {
    client: Arc<C>,
    ready: AtomicBool,
}

impl<C: MessagingClient> IdentityGate<C> {
    pub fn new(client: Arc<C>) -> Self {
        Self {
            client,
            ready: AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Wait until the identity is published, the schedule runs out, or
    /// `cancel` fires.
    ///
    /// If the target conversation already resolves, the identity is
    /// necessarily published and the wait is skipped.
    pub async fn await_ready(
        &self,
        hint: Option<&GroupId>,
        policy: &RetryPolicy,
        cancel: &CancellationToken,
    ) -> bool {
        if self.is_ready() {
            return true;
        }

        if let Some(group) = hint {
            if self.hint_resolves(group).await {
                debug!(group = %group, "target already resolvable, identity ready");
                return self.mark_ready();
            }
        }

        for attempt in 1..=policy.max_attempts {
            if cancel.is_cancelled() {
                return false;
            }

            if self.probe().await {
                info!(
                    address = %self.client.address(),
                    attempt,
                    "identity published"
                );
                return self.mark_ready();
            }

            if attempt < policy.max_attempts && !pause(policy.interval, cancel).await {
                return false;
            }
        }

        warn!(
            address = %self.client.address(),
            attempts = policy.max_attempts,
            "identity not published within retry budget"
        );
        false
    }

    fn mark_ready(&self) -> bool {
        self.ready.store(true, Ordering::Release);
        true
    }

    async fn hint_resolves(&self, group: &GroupId) -> bool {
        for candidate in group.variants() {
            if let Ok(Some(_)) = self.client.find_conversation(&candidate).await {
                return true;
            }
        }
        false
    }

    /// Either signal is enough.
    async fn probe(&self) -> bool {
        let (confirmed, pending) = tokio::join!(
            self.client.publication_confirmed(),
            self.client.pending_publications()
        );

        match (&confirmed, &pending) {
            (Ok(true), _) | (_, Ok(0)) => true,
            _ => {
                if let Err(e) = &confirmed {
                    debug!(error = %e, "publication check failed");
                }
                if let Err(e) = &pending {
                    debug!(error = %e, "pending publication check failed");
                }
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestSigner;
    use crate::transport::memory::{MemoryClient, MemoryNetwork};
    use std::time::Duration;

    async fn client(network: &Arc<MemoryNetwork>, address: &str) -> Arc<MemoryClient> {
        Arc::new(network.connector().connect(&TestSigner::new(address)).await.unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_ready_after_delay_then_memoized() {
        let network = MemoryNetwork::new();
        network.set_publication_delay(&Address::new("0xme"), 3);
        let gate = IdentityGate::new(client(&network, "0xme").await);
        let policy = RetryPolicy::new(Duration::from_millis(100), 10);
        let cancel = CancellationToken::new();

        let started = tokio::time::Instant::now();
        assert!(gate.await_ready(None, &policy, &cancel).await);
        assert!(started.elapsed() >= Duration::from_millis(300));
        assert!(gate.is_ready());

        let again = tokio::time::Instant::now();
        assert!(gate.await_ready(None, &policy, &cancel).await);
        assert_eq!(again.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_budget() {
        let network = MemoryNetwork::new();
        network.set_publication_delay(&Address::new("0xme"), u32::MAX);
        let gate = IdentityGate::new(client(&network, "0xme").await);
        let policy = RetryPolicy::new(Duration::from_millis(100), 4);

        let started = tokio::time::Instant::now();
        assert!(!gate.await_ready(None, &policy, &CancellationToken::new()).await);
        assert!(started.elapsed() <= policy.budget());
        assert!(!gate.is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resolvable_hint_short_circuits() {
        let network = MemoryNetwork::new();
        let me = Address::new("0xme");
        network.set_publication_delay(&me, u32::MAX);
        network.create_conversation("0xabc123", &[me]);
        let gate = IdentityGate::new(client(&network, "0xme").await);
        let group = GroupId::parse("ABC123").unwrap();

        let ready = gate
            .await_ready(Some(&group), &RetryPolicy::fast(), &CancellationToken::new())
            .await;
        assert!(ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait() {
        let network = MemoryNetwork::new();
        network.set_publication_delay(&Address::new("0xme"), u32::MAX);
        let gate = IdentityGate::new(client(&network, "0xme").await);
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            trigger.cancel();
        });

        let started = tokio::time::Instant::now();
        assert!(!gate.await_ready(None, &RetryPolicy::patient(), &cancel).await);
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
