//! The Conclave facade: sessions plus persistent session memory.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use conclave_core::{
    Address, ChainEvent, GroupId, MessagePayload, MessageRecord, Snapshot, VoteOutcome,
};
use conclave_store::{KvStore, SessionCache};
use conclave_sync::{
    Connector, GovernanceReader, NoopObserver, SessionConfig, SessionObserver, SessionState,
    Signer, SyncSession,
};

use crate::error::{ConclaveError, Result};

/// Configuration for Conclave.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConclaveConfig {
    /// Session and discovery configuration.
    pub session: SessionConfig,
    /// Remember the group once it resolves, so it can be reopened without
    /// an identifier.
    pub remember_last_group: bool,
}

impl Default for ConclaveConfig {
    fn default() -> Self {
        Self {
            session: SessionConfig::default(),
            remember_last_group: true,
        }
    }
}

/// Entry point: one identity, one cache, any number of sessions over time.
pub struct Conclave<K: Connector, S: KvStore> {
    connector: Arc<K>,
    signer: Arc<dyn Signer>,
    cache: Arc<SessionCache<S>>,
    governance: Option<Arc<dyn GovernanceReader>>,
    observer: Arc<dyn SessionObserver>,
    config: ConclaveConfig,
}

impl<K: Connector, S: KvStore> Conclave<K, S> {
    pub fn new(connector: K, signer: Arc<dyn Signer>, store: S, config: ConclaveConfig) -> Self {
        Self {
            connector: Arc::new(connector),
            signer,
            cache: Arc::new(SessionCache::new(store)),
            governance: None,
            observer: Arc::new(NoopObserver),
            config,
        }
    }

    pub fn with_governance(mut self, governance: Arc<dyn GovernanceReader>) -> Self {
        self.governance = Some(governance);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn SessionObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn address(&self) -> Address {
        self.signer.address()
    }

    pub fn cache(&self) -> &SessionCache<S> {
        &self.cache
    }

    /// The group this identity last resolved, if remembered.
    pub async fn last_group(&self) -> Result<Option<GroupId>> {
        Ok(self.cache.last_group(&self.address()).await?)
    }

    /// Open a session on `group`, or on the remembered group when `None`.
    ///
    /// Echoes left pending by the previous session on the same group are
    /// restored before discovery starts. A discovery timeout still returns
    /// the community in the `Discovering` state.
    pub async fn open(&self, group: Option<&str>) -> Result<Community<K, S>> {
        let address = self.address();
        let group = match group {
            Some(input) => GroupId::parse(input)?,
            None => self
                .cache
                .last_group(&address)
                .await?
                .ok_or(ConclaveError::NoGroup)?,
        };

        let mut session = SyncSession::new(
            Arc::clone(&self.connector),
            Arc::clone(&self.signer),
            self.config.session.clone(),
        )
        .with_observer(Arc::clone(&self.observer));
        if let Some(governance) = &self.governance {
            session = session.with_governance(Arc::clone(governance));
        }

        let restored = session.restore_echoes(self.cache.pending_echoes(&group).await?);
        if restored > 0 {
            debug!(group = %group, restored, "restored pending echoes");
        }

        let mut community = Community {
            session,
            cache: Arc::clone(&self.cache),
            group: group.clone(),
            address,
            remember: self.config.remember_last_group,
        };

        let state = community.session.start(group).await?;
        community.after_discovery(state).await?;
        Ok(community)
    }
}

/// An open session on one community conversation.
pub struct Community<K: Connector, S: KvStore> {
    session: SyncSession<K>,
    cache: Arc<SessionCache<S>>,
    group: GroupId,
    address: Address,
    remember: bool,
}

impl<K: Connector, S: KvStore> Community<K, S> {
    pub fn group(&self) -> &GroupId {
        &self.group
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn snapshot(&self) -> Snapshot {
        self.session.snapshot()
    }

    pub fn session(&self) -> &SyncSession<K> {
        &self.session
    }

    pub async fn send_text(&self, body: impl Into<String>) -> Result<MessageRecord> {
        self.send(MessagePayload::text(body)).await
    }

    /// Announce a proposal created on chain, with its title for display.
    pub async fn announce_proposal(
        &self,
        id: u64,
        title: impl Into<String>,
        description: impl Into<String>,
    ) -> Result<MessageRecord> {
        self.send(MessagePayload::ProposalMeta {
            id,
            title: title.into(),
            description: description.into(),
        })
        .await
    }

    pub async fn vote(&self, id: u64, support: bool) -> Result<MessageRecord> {
        let sent = self.session.vote(id, support).await;
        self.persist_echoes().await?;
        Ok(sent?)
    }

    /// Send any payload. Pending echoes are persisted whether or not the
    /// send succeeds.
    pub async fn send(&self, payload: MessagePayload) -> Result<MessageRecord> {
        let sent = self.session.send(payload).await;
        self.persist_echoes().await?;
        Ok(sent?)
    }

    pub async fn load_older(&self) -> Result<bool> {
        Ok(self.session.load_older().await?)
    }

    pub async fn apply_chain_event(&self, event: &ChainEvent) -> Option<VoteOutcome> {
        self.session.apply_chain_event(event).await
    }

    pub async fn refresh_tally(&self, id: u64) -> Result<bool> {
        Ok(self.session.refresh_tally(id).await?)
    }

    /// Retry discovery after a timeout.
    pub async fn retry_discovery(&mut self) -> Result<SessionState> {
        let state = self.session.retry_discovery(None).await?;
        self.after_discovery(state).await?;
        Ok(state)
    }

    pub async fn reopen_stream(&mut self) -> Result<SessionState> {
        Ok(self.session.reopen_stream().await?)
    }

    /// Wait for the first history page.
    pub async fn wait_backfilled(&self) {
        self.session.wait_backfilled().await;
    }

    /// Close the session and persist echoes still awaiting confirmation.
    pub async fn close(&mut self) -> Result<()> {
        self.session.close();
        self.persist_echoes().await
    }

    /// Write the current pending echoes to the cache.
    pub async fn persist_echoes(&self) -> Result<()> {
        let pending = self.session.pending_echoes();
        self.cache.save_pending_echoes(&self.group, &pending).await?;
        Ok(())
    }

    async fn after_discovery(&self, state: SessionState) -> Result<()> {
        if self.remember && matches!(state, SessionState::Syncing | SessionState::Connected) {
            self.cache.remember_group(&self.address, &self.group).await?;
            info!(group = %self.group, address = %self.address, "group remembered");
        }
        Ok(())
    }
}
