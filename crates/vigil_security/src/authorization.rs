//! Target registration, ownership verification and authorization checks.
//!
//! `is_authorized` sits on the hot path (every run creation and periodic
//! re-checks from executors), so the last known grant per target is cached and
//! only dropped when it expires or a sweep invalidates it.

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::{info, warn};
use vigil_db::{DbError, VigilDb};
use vigil_protocol::defaults::DEFAULT_AUTHORIZATION_TTL_SECS;
use vigil_protocol::{
    AuthorizationId, AuthorizationRecord, ProjectId, ProofType, Scope, Target, TargetId,
    VerificationStatus,
};

use crate::proof::{dns_proof_name, txt_matches, ProofFetchError, ProofFetcher};
use crate::scope::validate_scope;

#[derive(Debug, Error)]
pub enum VerificationError {
    #[error("target {0} not found")]
    TargetNotFound(TargetId),

    #[error("invalid scope: {0}")]
    InvalidScope(String),

    #[error("verification already in progress for target {0}")]
    AlreadyPending(TargetId),

    #[error("target scope has no host to verify against")]
    NoVerifiableHost,

    #[error("proof unreachable at {host}: {source}")]
    Unreachable {
        host: String,
        #[source]
        source: ProofFetchError,
    },

    #[error("{proof_type} proof does not match")]
    Mismatch { proof_type: ProofType },

    #[error("empty proof value")]
    EmptyProof,

    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Clone, Copy)]
struct CachedGrant {
    expires_at: DateTime<Utc>,
}

pub struct AuthorizationService {
    db: VigilDb,
    fetcher: Arc<dyn ProofFetcher>,
    ttl: Duration,
    cache: Mutex<HashMap<TargetId, CachedGrant>>,
}

impl AuthorizationService {
    pub fn new(db: VigilDb, fetcher: Arc<dyn ProofFetcher>) -> Self {
        Self {
            db,
            fetcher,
            ttl: Duration::seconds(DEFAULT_AUTHORIZATION_TTL_SECS),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Lifetime of newly issued records.
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Declare a target. It starts `unverified` and cannot be scanned until a
    /// proof is verified.
    pub async fn register_target(
        &self,
        project_id: &ProjectId,
        name: &str,
        scope: Scope,
    ) -> Result<Target, VerificationError> {
        validate_scope(&scope).map_err(VerificationError::InvalidScope)?;

        let now = Utc::now();
        let target = Target {
            id: TargetId::new(),
            project_id: project_id.clone(),
            name: name.to_string(),
            scope,
            verification_status: VerificationStatus::Unverified,
            created_at: now,
            updated_at: now,
        };
        self.db.insert_target(&target).await?;
        info!(target_id = %target.id, name = %target.name, "Target registered");
        Ok(target)
    }

    /// Check a proof against the target's primary host and issue a record.
    ///
    /// The target is held in `pending` while the proof is fetched; a second
    /// verification for the same target in that window fails with
    /// `AlreadyPending`. On failure the previous status is restored.
    pub async fn verify(
        &self,
        target_id: &TargetId,
        proof_type: ProofType,
        proof_value: &str,
    ) -> Result<AuthorizationRecord, VerificationError> {
        let proof_value = proof_value.trim();
        if proof_value.is_empty() {
            return Err(VerificationError::EmptyProof);
        }

        let target = self
            .db
            .get_target(target_id)
            .await?
            .ok_or_else(|| VerificationError::TargetNotFound(target_id.clone()))?;
        let host = target
            .scope
            .primary_host()
            .ok_or(VerificationError::NoVerifiableHost)?
            .to_string();

        let previous = target.verification_status;
        if previous == VerificationStatus::Pending {
            return Err(VerificationError::AlreadyPending(target_id.clone()));
        }
        let claimed = self
            .db
            .compare_and_set_verification(target_id, &[previous], VerificationStatus::Pending, Utc::now())
            .await?;
        if !claimed {
            return Err(VerificationError::AlreadyPending(target_id.clone()));
        }

        let checked = self.check_proof(&host, proof_type, proof_value).await;
        if let Err(err) = checked {
            warn!(target_id = %target_id, host = %host, error = %err, "Verification failed");
            self.db
                .compare_and_set_verification(
                    target_id,
                    &[VerificationStatus::Pending],
                    previous,
                    Utc::now(),
                )
                .await?;
            return Err(err);
        }

        let now = Utc::now();
        let record = AuthorizationRecord {
            id: AuthorizationId::new(),
            target_id: target_id.clone(),
            proof_type,
            proof_value: proof_value.to_string(),
            verified_at: now,
            expires_at: now + self.ttl,
        };
        self.db.record_authorization(&record).await?;
        self.cache_grant(target_id, record.expires_at);

        info!(
            target_id = %target_id,
            proof_type = %proof_type,
            expires_at = %record.expires_at,
            "Target verified"
        );
        Ok(record)
    }

    async fn check_proof(
        &self,
        host: &str,
        proof_type: ProofType,
        expected: &str,
    ) -> Result<(), VerificationError> {
        let unreachable = |source| VerificationError::Unreachable {
            host: host.to_string(),
            source,
        };
        let matched = match proof_type {
            ProofType::HttpFile => {
                let served = self.fetcher.fetch_http_token(host).await.map_err(unreachable)?;
                served == expected
            }
            ProofType::DnsTxt => {
                let records = self
                    .fetcher
                    .fetch_txt_records(&dns_proof_name(host))
                    .await
                    .map_err(unreachable)?;
                records.iter().any(|r| txt_matches(r, expected))
            }
        };
        if matched {
            Ok(())
        } else {
            Err(VerificationError::Mismatch { proof_type })
        }
    }

    /// True iff the target has an unexpired record at `at`.
    ///
    /// Served from cache when possible. A target found without a valid record
    /// is flipped to `expired` on the way out.
    pub async fn is_authorized(&self, target_id: &TargetId, at: DateTime<Utc>) -> Result<bool, DbError> {
        if let Some(grant) = self.cached_grant(target_id) {
            if grant.expires_at > at {
                return Ok(true);
            }
            self.evict(target_id);
        }

        // The record alone decides. A re-verification in flight holds the
        // target in `pending` but does not revoke the grant it already has.
        let record = self.db.latest_valid_authorization(target_id, at).await?;
        match record {
            Some(record) => {
                self.cache_grant(target_id, record.expires_at);
                Ok(true)
            }
            None => {
                let flipped = self
                    .db
                    .compare_and_set_verification(
                        target_id,
                        &[VerificationStatus::Verified],
                        VerificationStatus::Expired,
                        at,
                    )
                    .await?;
                if flipped {
                    info!(target_id = %target_id, "Authorization expired");
                }
                Ok(false)
            }
        }
    }

    /// Expire every verified target whose records have all lapsed.
    pub async fn expire_stale(&self, now: DateTime<Utc>) -> Result<Vec<TargetId>, DbError> {
        let expired = self.db.expire_stale_targets(now).await?;
        {
            let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
            cache.retain(|id, grant| grant.expires_at > now && !expired.contains(id));
        }
        if !expired.is_empty() {
            info!(count = expired.len(), "Expired stale target authorizations");
        }
        Ok(expired)
    }

    pub fn invalidate(&self, target_id: &TargetId) {
        self.evict(target_id);
    }

    fn cached_grant(&self, target_id: &TargetId) -> Option<CachedGrant> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(target_id).copied()
    }

    fn cache_grant(&self, target_id: &TargetId, expires_at: DateTime<Utc>) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(target_id.clone(), CachedGrant { expires_at });
    }

    fn evict(&self, target_id: &TargetId) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.remove(target_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use vigil_protocol::ScopeEntry;

    struct FixedFetcher {
        http: Result<String, u16>,
        txt: Vec<String>,
    }

    #[async_trait]
    impl ProofFetcher for FixedFetcher {
        async fn fetch_http_token(&self, _host: &str) -> Result<String, ProofFetchError> {
            self.http.clone().map_err(ProofFetchError::Status)
        }

        async fn fetch_txt_records(&self, _name: &str) -> Result<Vec<String>, ProofFetchError> {
            Ok(self.txt.clone())
        }
    }

    async fn service(http: Result<String, u16>, txt: Vec<String>) -> AuthorizationService {
        let db = VigilDb::open_in_memory().await.unwrap();
        AuthorizationService::new(db, Arc::new(FixedFetcher { http, txt }))
    }

    #[tokio::test]
    async fn http_proof_verifies_and_authorizes() {
        let auth = service(Ok("token-1".into()), vec![]).await;
        let target = auth
            .register_target(&ProjectId::new(), "shop", Scope::hosts(["shop.example.com"]))
            .await
            .unwrap();
        assert!(!auth.is_authorized(&target.id, Utc::now()).await.unwrap());

        let record = auth
            .verify(&target.id, ProofType::HttpFile, "token-1")
            .await
            .unwrap();
        assert!(record.expires_at > record.verified_at);
        assert!(auth.is_authorized(&target.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn mismatch_restores_previous_status() {
        let auth = service(Ok("other".into()), vec![]).await;
        let target = auth
            .register_target(&ProjectId::new(), "shop", Scope::hosts(["shop.example.com"]))
            .await
            .unwrap();

        let err = auth
            .verify(&target.id, ProofType::HttpFile, "token-1")
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::Mismatch { .. }));
        let stored = auth.db.get_target(&target.id).await.unwrap().unwrap();
        assert_eq!(stored.verification_status, VerificationStatus::Unverified);
    }

    #[tokio::test]
    async fn unreachable_host_is_reported() {
        let auth = service(Err(404), vec![]).await;
        let target = auth
            .register_target(&ProjectId::new(), "shop", Scope::hosts(["shop.example.com"]))
            .await
            .unwrap();
        let err = auth
            .verify(&target.id, ProofType::HttpFile, "token-1")
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::Unreachable { .. }));
    }

    #[tokio::test]
    async fn pending_target_rejects_second_verification() {
        let auth = service(Ok("t".into()), vec![]).await;
        let target = auth
            .register_target(&ProjectId::new(), "shop", Scope::hosts(["shop.example.com"]))
            .await
            .unwrap();
        auth.db
            .compare_and_set_verification(
                &target.id,
                &[VerificationStatus::Unverified],
                VerificationStatus::Pending,
                Utc::now(),
            )
            .await
            .unwrap();

        let err = auth.verify(&target.id, ProofType::HttpFile, "t").await.unwrap_err();
        assert!(matches!(err, VerificationError::AlreadyPending(_)));
    }

    #[tokio::test]
    async fn reverification_in_flight_keeps_existing_grant() {
        let auth = service(Ok("t".into()), vec![]).await;
        let target = auth
            .register_target(&ProjectId::new(), "shop", Scope::hosts(["shop.example.com"]))
            .await
            .unwrap();
        auth.verify(&target.id, ProofType::HttpFile, "t").await.unwrap();

        // A renewal has claimed the target and is still fetching its proof.
        assert!(auth
            .db
            .compare_and_set_verification(
                &target.id,
                &[VerificationStatus::Verified],
                VerificationStatus::Pending,
                Utc::now(),
            )
            .await
            .unwrap());

        // A process with a cold cache must still see the unexpired record.
        let fresh = AuthorizationService::new(
            auth.db.clone(),
            Arc::new(FixedFetcher {
                http: Ok("t".into()),
                txt: vec![],
            }),
        );
        assert!(fresh.is_authorized(&target.id, Utc::now()).await.unwrap());
        auth.invalidate(&target.id);
        assert!(auth.is_authorized(&target.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn dns_proof_accepts_prefixed_record() {
        let auth = service(Err(500), vec!["vigil-verification=dns-tok".into()]).await;
        let target = auth
            .register_target(&ProjectId::new(), "api", Scope::hosts(["api.example.com"]))
            .await
            .unwrap();
        auth.verify(&target.id, ProofType::DnsTxt, "dns-tok").await.unwrap();
        assert!(auth.is_authorized(&target.id, Utc::now()).await.unwrap());
    }

    #[tokio::test]
    async fn grants_expire_lazily() {
        let auth = service(Ok("t".into()), vec![])
            .await
            .with_ttl(Duration::minutes(5));
        let target = auth
            .register_target(&ProjectId::new(), "shop", Scope::hosts(["shop.example.com"]))
            .await
            .unwrap();
        auth.verify(&target.id, ProofType::HttpFile, "t").await.unwrap();

        let later = Utc::now() + Duration::minutes(10);
        assert!(!auth.is_authorized(&target.id, later).await.unwrap());
        let stored = auth.db.get_target(&target.id).await.unwrap().unwrap();
        assert_eq!(stored.verification_status, VerificationStatus::Expired);
    }

    #[tokio::test]
    async fn sweep_expires_and_evicts() {
        let auth = service(Ok("t".into()), vec![])
            .await
            .with_ttl(Duration::minutes(5));
        let target = auth
            .register_target(&ProjectId::new(), "shop", Scope::hosts(["shop.example.com"]))
            .await
            .unwrap();
        auth.verify(&target.id, ProofType::HttpFile, "t").await.unwrap();

        let expired = auth
            .expire_stale(Utc::now() + Duration::minutes(6))
            .await
            .unwrap();
        assert_eq!(expired, vec![target.id.clone()]);
        assert!(auth.cached_grant(&target.id).is_none());
    }

    #[tokio::test]
    async fn registration_rejects_bad_scopes() {
        let auth = service(Ok("t".into()), vec![]).await;
        let err = auth
            .register_target(&ProjectId::new(), "empty", Scope::default())
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::InvalidScope(_)));

        let err = auth
            .register_target(
                &ProjectId::new(),
                "bad-cidr",
                Scope::new(vec![ScopeEntry::cidr("10.0.0.0/99")]),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, VerificationError::InvalidScope(_)));
    }
}
