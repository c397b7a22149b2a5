//! # Conclave Sync
//!
//! Finds the community conversation on the messaging network and keeps a
//! reconciled view of it up to date.
//!
//! ## Overview
//!
//! - [`IdentityGate`] waits until a fresh messaging identity is published.
//! - [`ConversationLocator`] races direct lookup, enumeration and network
//!   events to resolve a group id to a conversation handle.
//! - [`HistoryLoader`] pages backwards through history.
//! - [`LiveStreamReader`] delivers new messages until cancelled.
//! - [`SyncSession`] wires all of the above into one lifecycle and feeds
//!   everything into a single reconciler.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use conclave_core::GroupId;
//! use conclave_sync::{SessionConfig, SyncSession};
//! use conclave_sync::transport::memory::MemoryNetwork;
//!
//! # async fn example(signer: Arc<dyn conclave_sync::Signer>) -> conclave_sync::Result<()> {
//! let network = MemoryNetwork::new();
//! let mut session = SyncSession::new(
//!     Arc::new(network.connector()),
//!     signer,
//!     SessionConfig::default(),
//! );
//!
//! session.start(GroupId::parse("0xabc123")?).await?;
//! session.send(conclave_core::MessagePayload::text("gm")).await?;
//! let snapshot = session.snapshot();
//! println!("{} messages", snapshot.messages.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod governance;
pub mod history;
pub mod identity;
pub mod locator;
pub mod observer;
pub mod session;
pub mod state;
pub mod stream;
pub mod transport;

pub use config::{LocatorConfig, RetryPolicy, SessionConfig};
pub use error::{Result, SyncError};
pub use governance::{GovernanceReader, StaticGovernance};
pub use history::{Cursor, HistoryLoader, HistoryPage, PageRequest};
pub use identity::{Connector, IdentityGate, Signer};
pub use locator::{ConversationLocator, DiscoveryOutcome, DiscoveryState};
pub use observer::{NoopObserver, RecordingObserver, SessionObserver};
pub use session::{SessionState, SyncSession};
pub use state::{Pipeline, SharedState};
pub use stream::{LiveStream, LiveStreamReader};
pub use transport::{
    ConsentState, Conversation, MessageQuery, MessagingClient, NetworkEvent,
};
