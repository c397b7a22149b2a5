//! Test fixtures and helpers.
//!
//! Common setup code for integration tests.

use std::sync::Arc;
use std::time::Duration;

use conclave_core::{Address, GroupId, RawMessage};
use conclave_sync::transport::memory::{MemoryConnector, MemoryNetwork};
use conclave_sync::{
    ConsentState, LocatorConfig, RecordingObserver, RetryPolicy, SessionConfig, Signer,
    SyncSession,
};

use crate::signer::LocalSigner;

/// A memory network with one community conversation, the local member and
/// one peer.
pub struct TestFixture {
    pub network: Arc<MemoryNetwork>,
    pub signer: Arc<LocalSigner>,
    pub peer: Address,
    pub group: GroupId,
    pub observer: Arc<RecordingObserver>,
    conversation_id: String,
}

impl TestFixture {
    /// Community conversation under `conversation_id`, visible to both
    /// members right away.
    ///
    /// # Panics
    ///
    /// If `conversation_id` is not a hex identifier.
    pub fn new(conversation_id: &str) -> Self {
        Self::with_signer(conversation_id, LocalSigner::generate())
    }

    /// Same as [`new`](Self::new) with a deterministic signer.
    pub fn with_seed(conversation_id: &str, seed: [u8; 32]) -> Self {
        Self::with_signer(conversation_id, LocalSigner::from_seed(&seed))
    }

    fn with_signer(conversation_id: &str, signer: LocalSigner) -> Self {
        let network = MemoryNetwork::new();
        let peer = Address::new("0x00000000000000000000000000000000000000aa");
        network.create_conversation(conversation_id, &[signer.address(), peer.clone()]);

        Self {
            network,
            signer: Arc::new(signer),
            peer,
            group: GroupId::parse(conversation_id).expect("fixture conversation id must be hex"),
            observer: Arc::new(RecordingObserver::new()),
            conversation_id: conversation_id.to_string(),
        }
    }

    /// Conversation the local member only sees after `resyncs` resyncs and
    /// that direct lookup cannot find.
    pub fn hidden(conversation_id: &str, resyncs: u32) -> Self {
        let fixture = Self::new(conversation_id);
        fixture.network.add_member(
            conversation_id,
            &fixture.member(),
            ConsentState::Unknown,
            resyncs,
        );
        fixture
            .network
            .set_direct_lookup(conversation_id, false);
        fixture
    }

    pub fn member(&self) -> Address {
        self.signer.address()
    }

    pub fn conversation_id(&self) -> &str {
        &self.conversation_id
    }

    pub fn connector(&self) -> MemoryConnector {
        self.network.connector()
    }

    /// Post `count` peer messages at network times `1..=count`.
    pub fn seed_history(&self, count: i64) -> Vec<RawMessage> {
        (1..=count)
            .map(|at| {
                self.network
                    .post_at(&self.conversation_id, &self.peer, at, &format!("message {at}"))
                    .expect("fixture conversation exists")
            })
            .collect()
    }

    /// Post a peer message at the next network time.
    pub fn post(&self, body: &str) -> RawMessage {
        self.network
            .post(&self.conversation_id, &self.peer, body)
            .expect("fixture conversation exists")
    }

    /// Short retry schedules suitable for tests.
    pub fn fast_config() -> SessionConfig {
        SessionConfig {
            identity: RetryPolicy::new(Duration::from_millis(10), 20),
            discovery: LocatorConfig {
                policy: RetryPolicy::new(Duration::from_millis(10), 20),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    pub fn session(&self) -> SyncSession<MemoryConnector> {
        self.session_with(Self::fast_config())
    }

    pub fn session_with(&self, config: SessionConfig) -> SyncSession<MemoryConnector> {
        SyncSession::new(Arc::new(self.connector()), self.signer.clone(), config)
            .with_observer(self.observer.clone())
    }
}

/// Poll `condition` until it holds.
///
/// # Panics
///
/// After two seconds of real time, or 400 polls under a paused clock.
pub async fn eventually(condition: impl Fn() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("condition not reached in time");
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_sync::SessionState;

    #[tokio::test]
    async fn test_fixture_session_connects() {
        let fixture = TestFixture::with_seed("abc123", [1; 32]);
        fixture.seed_history(3);
        let mut session = fixture.session();

        let state = session.start(fixture.group.clone()).await.unwrap();
        assert_eq!(state, SessionState::Connected);
        session.wait_backfilled().await;
        assert_eq!(session.snapshot().messages.len(), 3);
    }
}
