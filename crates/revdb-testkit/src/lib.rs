//! # revdb Testkit
//!
//! Testing utilities for revdb.
//!
//! ## Overview
//!
//! This crate provides:
//!
//! - **Fixtures**: databases in temporary directories, a local/remote pair
//!   wired through a [`MemoryPeer`](revdb_sync::MemoryPeer), validators
//!   that can be switched on and off
//! - **Generators**: proptest strategies for revision IDs, bodies and edit
//!   scripts
//! - **Scenarios**: canned revision trees (conflicts, unchanged attachments)
//!
//! ## Test Fixtures
//!
//! ```rust
//! use revdb_testkit::fixtures::{props, TestDb};
//! use serde_json::json;
//!
//! let db = TestDb::new();
//! let rev = db.put("doc", props(json!({"n": 1})));
//! assert_eq!(rev.generation(), 1);
//! ```
//!
//! ## Property Testing
//!
//! ```rust,ignore
//! use proptest::prelude::*;
//! use revdb_testkit::generators::{apply_edits, arb_edit_script};
//!
//! proptest! {
//!     #[test]
//!     fn sequences_increase(script in arb_edit_script(20)) {
//!         let db = revdb_testkit::fixtures::TestDb::new();
//!         apply_edits(&db, &script);
//!     }
//! }
//! ```

pub mod fixtures;
pub mod generators;
pub mod scenarios;

pub use fixtures::{init_tracing, props, ReplicationPair, TestDb, ToggleValidator};
