//! Messaging network abstraction.
//!
//! The network client is the only thing that talks to the decentralized
//! messaging network. Everything above it (identity gating, discovery,
//! history and live ingestion) is written against these traits.

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};

use conclave_core::{Address, MessageId, RawMessage};

use crate::error::Result;

/// Local consent recorded for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConsentState {
    Allowed,
    Unknown,
    Denied,
}

impl ConsentState {
    pub const ALL: [ConsentState; 3] = [
        ConsentState::Allowed,
        ConsentState::Unknown,
        ConsentState::Denied,
    ];
}

/// Something happened on the network that may concern a conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetworkEvent {
    /// The local member was added to a conversation.
    ConversationCreated { conversation_id: String },
    /// A message was posted to a conversation the member belongs to.
    Message {
        conversation_id: String,
        message_id: MessageId,
    },
}

impl NetworkEvent {
    pub fn conversation_id(&self) -> &str {
        match self {
            NetworkEvent::ConversationCreated { conversation_id }
            | NetworkEvent::Message {
                conversation_id, ..
            } => conversation_id,
        }
    }
}

/// A history query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageQuery {
    /// Only messages strictly older than this send time.
    pub sent_before_ns: Option<i64>,
    /// Maximum number of messages, newest first.
    pub limit: usize,
}

pub type RawMessageStream = BoxStream<'static, Result<RawMessage>>;
pub type NetworkEventStream = BoxStream<'static, Result<NetworkEvent>>;

/// A resolved conversation handle.
#[async_trait]
pub trait Conversation: Clone + Send + Sync + 'static {
    /// Identifier exactly as the network reports it.
    fn id(&self) -> &str;

    /// Publish an encoded body. Returns the network id of the new message.
    async fn send(&self, content: Bytes) -> Result<MessageId>;

    /// Newest-first messages matching `query`.
    async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<RawMessage>>;

    /// Messages posted from now on. Ends on transport failure.
    async fn stream_messages(&self) -> Result<RawMessageStream>;
}

/// A connected messaging client for one identity.
#[async_trait]
pub trait MessagingClient: Send + Sync + 'static {
    type Conversation: Conversation;

    fn address(&self) -> &Address;

    /// Network-side check that the identity is discoverable.
    async fn publication_confirmed(&self) -> Result<bool>;

    /// Identity updates still queued locally.
    async fn pending_publications(&self) -> Result<usize>;

    /// Pull pending welcomes and conversation updates.
    async fn resync(&self) -> Result<()>;

    /// Direct lookup. Only exact identifier matches resolve.
    async fn find_conversation(&self, id: &str) -> Result<Option<Self::Conversation>>;

    /// Every conversation visible to the identity, filtered by consent.
    async fn list_conversations(&self, consent: &[ConsentState]) -> Result<Vec<Self::Conversation>>;

    /// Network events for this identity.
    async fn stream_events(&self) -> Result<NetworkEventStream>;
}

/// In-memory network for testing.
///
/// Models the propagation delays that make discovery hard: identities that
/// take a few polls to become visible, memberships that only show up after
/// some number of resyncs, and conversations that direct lookup cannot find.
pub mod memory {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::{Arc, Mutex, MutexGuard};
    use std::time::Duration;

    use futures::channel::mpsc;
    use futures::StreamExt;

    use conclave_core::ContentKind;

    use crate::error::SyncError;
    use crate::identity::{Connector, Signer};

    const CLOCK_STEP_NS: i64 = 1_000_000;

    #[derive(Default)]
    struct IdentityEntry {
        connected: bool,
        /// Confirmation polls that must pass before the identity is visible.
        publication_delay: u32,
        polls: u32,
        resyncs: u32,
    }

    struct Membership {
        consent: ConsentState,
        visible_after_resyncs: u32,
    }

    struct ConversationEntry {
        members: HashMap<Address, Membership>,
        direct_lookup: bool,
        /// Latency added to every history query.
        history_delay: Duration,
        messages: Vec<RawMessage>,
        subscribers: Vec<mpsc::UnboundedSender<Result<RawMessage>>>,
    }

    #[derive(Default)]
    struct Inner {
        identities: HashMap<Address, IdentityEntry>,
        rejected: HashSet<Address>,
        conversations: HashMap<String, ConversationEntry>,
        event_subscribers: Vec<(Address, mpsc::UnboundedSender<Result<NetworkEvent>>)>,
        clock_ns: i64,
        next_message: u64,
    }

    impl Inner {
        fn visible(&self, conversation: &ConversationEntry, member: &Address) -> bool {
            let resyncs = self.identities.get(member).map_or(0, |i| i.resyncs);
            conversation
                .members
                .get(member)
                .is_some_and(|m| resyncs >= m.visible_after_resyncs)
        }

        fn tick(&mut self, at: Option<i64>) -> i64 {
            let at = at.unwrap_or(self.clock_ns + CLOCK_STEP_NS);
            self.clock_ns = self.clock_ns.max(at);
            at
        }

        fn broadcast_event(&mut self, members: &HashSet<Address>, event: NetworkEvent) {
            self.event_subscribers.retain(|(address, tx)| {
                !members.contains(address) || tx.unbounded_send(Ok(event.clone())).is_ok()
            });
        }
    }

    /// Shared state for the memory messaging network.
    #[derive(Default)]
    pub struct MemoryNetwork {
        inner: Mutex<Inner>,
    }

    impl MemoryNetwork {
        pub fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        /// A connector that registers identities on this network.
        pub fn connector(self: &Arc<Self>) -> MemoryConnector {
            MemoryConnector {
                network: Arc::clone(self),
            }
        }

        fn lock(&self) -> MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Create a conversation whose members see it immediately.
        pub fn create_conversation(&self, id: &str, members: &[Address]) {
            let mut inner = self.lock();
            let entry = inner
                .conversations
                .entry(id.to_string())
                .or_insert_with(|| ConversationEntry {
                    members: HashMap::new(),
                    direct_lookup: true,
                    history_delay: Duration::ZERO,
                    messages: Vec::new(),
                    subscribers: Vec::new(),
                });
            for member in members {
                entry.members.insert(
                    member.clone(),
                    Membership {
                        consent: ConsentState::Allowed,
                        visible_after_resyncs: 0,
                    },
                );
            }
        }

        /// Add a member that only sees the conversation after `resyncs` resyncs.
        pub fn add_member(
            &self,
            id: &str,
            member: &Address,
            consent: ConsentState,
            visible_after_resyncs: u32,
        ) {
            let mut inner = self.lock();
            if let Some(entry) = inner.conversations.get_mut(id) {
                entry.members.insert(
                    member.clone(),
                    Membership {
                        consent,
                        visible_after_resyncs,
                    },
                );
            }
        }

        /// Make direct lookup of a conversation fail even when visible.
        pub fn set_direct_lookup(&self, id: &str, enabled: bool) {
            if let Some(entry) = self.lock().conversations.get_mut(id) {
                entry.direct_lookup = enabled;
            }
        }

        /// Delay every history query on a conversation.
        pub fn set_history_delay(&self, id: &str, delay: Duration) {
            if let Some(entry) = self.lock().conversations.get_mut(id) {
                entry.history_delay = delay;
            }
        }

        /// Require `polls` unsuccessful confirmation polls before an identity
        /// becomes visible.
        pub fn set_publication_delay(&self, address: &Address, polls: u32) {
            self.lock()
                .identities
                .entry(address.clone())
                .or_default()
                .publication_delay = polls;
        }

        /// Refuse to create an identity for `address`.
        pub fn reject_identity(&self, address: &Address) {
            self.lock().rejected.insert(address.clone());
        }

        pub fn resync_count(&self, address: &Address) -> u32 {
            self.lock().identities.get(address).map_or(0, |i| i.resyncs)
        }

        /// Post a text message at the next network time.
        pub fn post(&self, id: &str, sender: &Address, body: &str) -> Result<RawMessage> {
            self.publish(id, sender, None, ContentKind::Application, Bytes::from(body.to_string()))
        }

        /// Post a text message at an explicit time.
        pub fn post_at(
            &self,
            id: &str,
            sender: &Address,
            sent_at_ns: i64,
            body: &str,
        ) -> Result<RawMessage> {
            self.publish(
                id,
                sender,
                Some(sent_at_ns),
                ContentKind::Application,
                Bytes::from(body.to_string()),
            )
        }

        /// Emit a transport-level membership change.
        pub fn post_membership_change(&self, id: &str, body: &str) -> Result<RawMessage> {
            self.publish(
                id,
                &Address::new("network"),
                None,
                ContentKind::MembershipChange,
                Bytes::from(body.to_string()),
            )
        }

        /// Announce the conversation to members' event streams.
        pub fn announce(&self, id: &str) {
            let mut inner = self.lock();
            let Some(members) = inner
                .conversations
                .get(id)
                .map(|c| c.members.keys().cloned().collect::<HashSet<_>>())
            else {
                return;
            };
            inner.broadcast_event(
                &members,
                NetworkEvent::ConversationCreated {
                    conversation_id: id.to_string(),
                },
            );
        }

        /// Fail every open message stream on a conversation.
        pub fn break_streams(&self, id: &str) {
            if let Some(entry) = self.lock().conversations.get_mut(id) {
                for tx in entry.subscribers.drain(..) {
                    let _ = tx.unbounded_send(Err(SyncError::Transport("stream reset".into())));
                }
            }
        }

        /// Fail every open event stream.
        pub fn break_event_streams(&self) {
            for (_, tx) in self.lock().event_subscribers.drain(..) {
                let _ = tx.unbounded_send(Err(SyncError::Transport("event stream reset".into())));
            }
        }

        /// Open message streams on a conversation whose reader is still alive.
        pub fn subscriber_count(&self, id: &str) -> usize {
            let mut inner = self.lock();
            match inner.conversations.get_mut(id) {
                Some(entry) => {
                    entry.subscribers.retain(|tx| !tx.is_closed());
                    entry.subscribers.len()
                }
                None => 0,
            }
        }

        /// Open event streams whose reader is still alive.
        pub fn event_subscriber_count(&self) -> usize {
            let mut inner = self.lock();
            inner.event_subscribers.retain(|(_, tx)| !tx.is_closed());
            inner.event_subscribers.len()
        }

        fn publish(
            &self,
            id: &str,
            sender: &Address,
            at: Option<i64>,
            content_kind: ContentKind,
            content: Bytes,
        ) -> Result<RawMessage> {
            let mut inner = self.lock();
            if !inner.conversations.contains_key(id) {
                return Err(SyncError::Transport(format!("unknown conversation {id}")));
            }

            let sent_at_ns = inner.tick(at);
            inner.next_message += 1;
            let message = RawMessage {
                id: MessageId::new(format!("msg-{}", inner.next_message)),
                sender: sender.clone(),
                sent_at_ns,
                content_kind,
                content,
            };

            let members = match inner.conversations.get_mut(id) {
                Some(entry) => {
                    entry.messages.push(message.clone());
                    entry
                        .subscribers
                        .retain(|tx| tx.unbounded_send(Ok(message.clone())).is_ok());
                    entry.members.keys().cloned().collect::<HashSet<_>>()
                }
                None => HashSet::new(),
            };
            inner.broadcast_event(
                &members,
                NetworkEvent::Message {
                    conversation_id: id.to_string(),
                    message_id: message.id.clone(),
                },
            );

            Ok(message)
        }
    }

    /// Registers identities on a [`MemoryNetwork`].
    #[derive(Clone)]
    pub struct MemoryConnector {
        network: Arc<MemoryNetwork>,
    }

    #[async_trait]
    impl Connector for MemoryConnector {
        type Client = MemoryClient;

        async fn connect(&self, signer: &dyn Signer) -> Result<MemoryClient> {
            let address = signer.address();
            if self.network.lock().rejected.contains(&address) {
                return Err(SyncError::IdentityRejected(format!(
                    "network refused identity {address}"
                )));
            }

            let challenge = format!("conclave identity {address}");
            let signature = signer.sign_message(challenge.as_bytes()).await?;
            if signature.is_empty() {
                return Err(SyncError::IdentityRejected("empty signature".into()));
            }

            self.network
                .lock()
                .identities
                .entry(address.clone())
                .or_default()
                .connected = true;

            Ok(MemoryClient {
                network: Arc::clone(&self.network),
                address,
            })
        }
    }

    /// Client for one identity on a [`MemoryNetwork`].
    pub struct MemoryClient {
        network: Arc<MemoryNetwork>,
        address: Address,
    }

    impl MemoryClient {
        fn handle(&self, id: &str) -> MemoryConversation {
            MemoryConversation {
                network: Arc::clone(&self.network),
                id: id.to_string(),
                member: self.address.clone(),
            }
        }
    }

    #[async_trait]
    impl MessagingClient for MemoryClient {
        type Conversation = MemoryConversation;

        fn address(&self) -> &Address {
            &self.address
        }

        async fn publication_confirmed(&self) -> Result<bool> {
            let mut inner = self.network.lock();
            let identity = inner.identities.entry(self.address.clone()).or_default();
            identity.polls += 1;
            Ok(identity.connected && identity.polls > identity.publication_delay)
        }

        async fn pending_publications(&self) -> Result<usize> {
            let inner = self.network.lock();
            Ok(match inner.identities.get(&self.address) {
                Some(i) if i.connected && i.polls > i.publication_delay => 0,
                _ => 1,
            })
        }

        async fn resync(&self) -> Result<()> {
            self.network
                .lock()
                .identities
                .entry(self.address.clone())
                .or_default()
                .resyncs += 1;
            Ok(())
        }

        async fn find_conversation(&self, id: &str) -> Result<Option<MemoryConversation>> {
            let inner = self.network.lock();
            Ok(inner
                .conversations
                .get(id)
                .filter(|c| c.direct_lookup && inner.visible(c, &self.address))
                .map(|_| self.handle(id)))
        }

        async fn list_conversations(
            &self,
            consent: &[ConsentState],
        ) -> Result<Vec<MemoryConversation>> {
            let inner = self.network.lock();
            let mut found: Vec<_> = inner
                .conversations
                .iter()
                .filter(|(_, c)| inner.visible(c, &self.address))
                .filter(|(_, c)| {
                    c.members
                        .get(&self.address)
                        .is_some_and(|m| consent.contains(&m.consent))
                })
                .map(|(id, _)| self.handle(id))
                .collect();
            found.sort_by(|a, b| a.id.cmp(&b.id));
            Ok(found)
        }

        async fn stream_events(&self) -> Result<NetworkEventStream> {
            let (tx, rx) = mpsc::unbounded();
            self.network
                .lock()
                .event_subscribers
                .push((self.address.clone(), tx));
            Ok(rx.boxed())
        }
    }

    /// Conversation handle on a [`MemoryNetwork`].
    #[derive(Clone)]
    pub struct MemoryConversation {
        network: Arc<MemoryNetwork>,
        id: String,
        member: Address,
    }

    #[async_trait]
    impl Conversation for MemoryConversation {
        fn id(&self) -> &str {
            &self.id
        }

        async fn send(&self, content: Bytes) -> Result<MessageId> {
            self.network
                .publish(&self.id, &self.member, None, ContentKind::Application, content)
                .map(|m| m.id)
        }

        async fn list_messages(&self, query: &MessageQuery) -> Result<Vec<RawMessage>> {
            let delay = self
                .network
                .lock()
                .conversations
                .get(&self.id)
                .map_or(Duration::ZERO, |c| c.history_delay);
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let inner = self.network.lock();
            let entry = inner
                .conversations
                .get(&self.id)
                .ok_or_else(|| SyncError::Transport(format!("unknown conversation {}", self.id)))?;

            let mut page: Vec<RawMessage> = entry
                .messages
                .iter()
                .filter(|m| query.sent_before_ns.map_or(true, |before| m.sent_at_ns < before))
                .cloned()
                .collect();
            page.sort_by(|a, b| b.sent_at_ns.cmp(&a.sent_at_ns));
            page.truncate(query.limit);
            Ok(page)
        }

        async fn stream_messages(&self) -> Result<RawMessageStream> {
            let (tx, rx) = mpsc::unbounded();
            let mut inner = self.network.lock();
            let entry = inner
                .conversations
                .get_mut(&self.id)
                .ok_or_else(|| SyncError::Transport(format!("unknown conversation {}", self.id)))?;
            entry.subscribers.push(tx);
            Ok(rx.boxed())
        }
    }
}
