//! Ownership proof retrieval.
//!
//! Two proof types are supported:
//! - `http_file`: the token is served at `/.well-known/vigil-verification.txt`
//!   on the target host.
//! - `dns_txt`: a TXT record at `_vigil-challenge.<host>`, resolved through a
//!   DNS-over-HTTPS JSON endpoint.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use url::Url;
use vigil_protocol::defaults::{
    DEFAULT_DOH_RESOLVER, DNS_PROOF_LABEL, DNS_PROOF_PREFIX, HTTP_PROOF_PATH,
};

const FETCH_TIMEOUT: Duration = Duration::from_secs(10);
/// Proof files are a single token; anything larger is not a proof.
const MAX_PROOF_BYTES: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum ProofFetchError {
    #[error("unreachable: {0}")]
    Unreachable(String),

    #[error("unexpected HTTP status {0}")]
    Status(u16),

    #[error("malformed response: {0}")]
    Malformed(String),
}

/// Source of proof material published by a target owner.
#[async_trait]
pub trait ProofFetcher: Send + Sync {
    /// Body of the HTTP proof file on `host`, trimmed.
    async fn fetch_http_token(&self, host: &str) -> Result<String, ProofFetchError>;

    /// TXT record strings published under `name`.
    async fn fetch_txt_records(&self, name: &str) -> Result<Vec<String>, ProofFetchError>;
}

/// DNS name the TXT proof for `host` lives under.
pub fn dns_proof_name(host: &str) -> String {
    format!("{}.{}", DNS_PROOF_LABEL, host.trim_end_matches('.'))
}

/// True if a TXT record string carries `expected`, either bare or in
/// `vigil-verification=<token>` form.
pub fn txt_matches(record: &str, expected: &str) -> bool {
    let record = record.trim().trim_matches('"');
    let token = record.strip_prefix(DNS_PROOF_PREFIX).unwrap_or(record);
    token == expected
}

/// reqwest-backed fetcher. Redirects are not followed: the proof must be served
/// by the host itself.
pub struct HttpProofFetcher {
    client: reqwest::Client,
    doh_resolver: Url,
}

impl HttpProofFetcher {
    pub fn new() -> Result<Self, ProofFetchError> {
        let resolver = Url::parse(DEFAULT_DOH_RESOLVER)
            .map_err(|e| ProofFetchError::Malformed(e.to_string()))?;
        Self::with_resolver(resolver)
    }

    pub fn with_resolver(doh_resolver: Url) -> Result<Self, ProofFetchError> {
        let client = reqwest::Client::builder()
            .timeout(FETCH_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .map_err(|e| ProofFetchError::Unreachable(e.to_string()))?;
        Ok(Self {
            client,
            doh_resolver,
        })
    }
}

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status")]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

const DNS_TYPE_TXT: u16 = 16;

#[async_trait]
impl ProofFetcher for HttpProofFetcher {
    async fn fetch_http_token(&self, host: &str) -> Result<String, ProofFetchError> {
        let url = format!("https://{}{}", host, HTTP_PROOF_PATH);
        tracing::debug!("Fetching HTTP ownership proof from {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| ProofFetchError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProofFetchError::Status(status.as_u16()));
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| ProofFetchError::Unreachable(e.to_string()))?;
        if body.len() > MAX_PROOF_BYTES {
            return Err(ProofFetchError::Malformed(format!(
                "proof file is {} bytes",
                body.len()
            )));
        }
        let text = String::from_utf8_lossy(&body);
        Ok(text.trim().to_string())
    }

    async fn fetch_txt_records(&self, name: &str) -> Result<Vec<String>, ProofFetchError> {
        tracing::debug!("Resolving TXT {} via {}", name, self.doh_resolver);

        let response = self
            .client
            .get(self.doh_resolver.clone())
            .query(&[("name", name), ("type", "TXT")])
            .header(reqwest::header::ACCEPT, "application/dns-json")
            .send()
            .await
            .map_err(|e| ProofFetchError::Unreachable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(ProofFetchError::Status(status.as_u16()));
        }

        let parsed: DohResponse = response
            .json()
            .await
            .map_err(|e| ProofFetchError::Malformed(e.to_string()))?;
        // NXDOMAIN and friends: no records rather than an error.
        if parsed.status != 0 {
            return Ok(Vec::new());
        }

        Ok(parsed
            .answer
            .into_iter()
            .filter(|a| a.record_type == DNS_TYPE_TXT)
            .map(|a| a.data.trim_matches('"').to_string())
            .collect())
    }
}
