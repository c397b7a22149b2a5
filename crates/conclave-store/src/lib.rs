//! # Conclave Store
//!
//! Key-value persistence for Conclave. The sync engine treats everything
//! stored here as a best-effort cache, never as a source of truth.
//!
//! ## Key Types
//!
//! - [`KvStore`] - The async trait every backend implements
//! - [`SqliteKv`] - SQLite-backed persistent store
//! - [`MemoryKv`] - In-memory store for tests
//! - [`SessionCache`] - Typed view: last group per address, pending echoes per group
//!
//! ## Usage
//!
//! ```rust,no_run
//! use conclave_store::{SessionCache, SqliteKv};
//! use conclave_core::{Address, GroupId};
//!
//! async fn example() {
//!     let kv = SqliteKv::open("conclave.db").unwrap();
//!     let cache = SessionCache::new(kv);
//!
//!     let me = Address::new("0xabc");
//!     let group = GroupId::parse("0xdeadbeef").unwrap();
//!     cache.remember_group(&me, &group).await.unwrap();
//!     assert_eq!(cache.last_group(&me).await.unwrap(), Some(group));
//! }
//! ```

pub mod cache;
pub mod error;
pub mod memory;
pub mod migration;
pub mod sqlite;
pub mod traits;

pub use cache::SessionCache;
pub use error::{Result, StoreError};
pub use memory::MemoryKv;
pub use sqlite::SqliteKv;
pub use traits::KvStore;
