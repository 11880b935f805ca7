//! Vigil Test Utilities
//!
//! Fixtures shared by the integration tests of the worker and sentinel crates.
//! Everything runs against a private in-memory database; nothing touches the
//! network.
//!
//! # Usage
//!
//! ```rust,ignore
//! use vigil_test_utils::TestEnv;
//!
//! #[tokio::test]
//! async fn test_run_lifecycle() {
//!     let env = TestEnv::new().await.unwrap();
//!     let target = env.verified_target(&["shop.example.com"]).await.unwrap();
//!     // create runs against `target` with env.suite(SuiteKind::Replay) ...
//! }
//! ```

pub mod fixtures;
pub mod proof;

pub use fixtures::{suite_id, wait_for_run, TestEnv, PROOF_TOKEN};
pub use proof::StaticProofFetcher;
