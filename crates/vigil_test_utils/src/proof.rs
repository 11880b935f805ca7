//! Proof fetcher that answers from memory.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use vigil_protocol::defaults::DNS_PROOF_PREFIX;
use vigil_security::{ProofFetchError, ProofFetcher};

/// Serves the same token for every host, over both proof types.
pub struct StaticProofFetcher {
    token: String,
    fetches: AtomicUsize,
}

impl StaticProofFetcher {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Number of proof lookups served so far.
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProofFetcher for StaticProofFetcher {
    async fn fetch_http_token(&self, _host: &str) -> Result<String, ProofFetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.token.clone())
    }

    async fn fetch_txt_records(&self, _name: &str) -> Result<Vec<String>, ProofFetchError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        Ok(vec![format!("{}{}", DNS_PROOF_PREFIX, self.token)])
    }
}
