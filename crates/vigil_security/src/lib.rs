//! Vigil security services.
//!
//! Provides:
//! - **AuthorizationService**: target registration, ownership proofs, and the
//!   `is_authorized` check every run depends on
//! - **ScopeGuard**: per-target allowlist and rate limiting, consulted before
//!   every outbound action a scan makes

pub mod authorization;
pub mod proof;
pub mod rate_limit;
pub mod scope;

pub use authorization::{AuthorizationService, VerificationError};
pub use proof::{HttpProofFetcher, ProofFetchError, ProofFetcher};
pub use rate_limit::{RateDecision, RateLimiter, RATE_WINDOW};
pub use scope::{check_scope, validate_scope, Denial, ScopeGuard, Verdict};
