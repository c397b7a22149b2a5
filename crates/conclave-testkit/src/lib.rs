//! # Conclave Testkit
//!
//! Testing utilities for Conclave.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Signers**: [`LocalSigner`], an ed25519 wallet stand-in
//! - **Fixtures**: a memory network with a community conversation already set up
//! - **Generators**: Proptest strategies for messages and payloads
//!
//! ## Test Fixtures
//!
//! ```rust,no_run
//! use conclave_testkit::TestFixture;
//!
//! # async fn example() {
//! let fixture = TestFixture::new("abc123");
//! fixture.seed_history(140);
//! let mut session = fixture.session();
//! session.start(fixture.group.clone()).await.unwrap();
//! # }
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use conclave_testkit::generators::raw_message;
//!
//! proptest! {
//!     #[test]
//!     fn interpretation_never_panics(raw in raw_message()) {
//!         let _ = conclave_core::interpret(&raw);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod signer;

pub use fixtures::{eventually, TestFixture};
pub use signer::LocalSigner;
pub use conclave_sync::RecordingObserver;
