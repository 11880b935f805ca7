//! Runtime scope enforcement.
//!
//! `ScopeGuard::check_and_consume` is consulted before every outbound action a
//! scan performs. Two checks, in order:
//! 1. the destination matches the target's allowlist (exact host, CIDR for IP
//!    literals, or a declared API base);
//! 2. the target's rate limiter has capacity for the run's `rate_limit`.
//!
//! The guard only decides. What a denial does to the run (abort in safe mode,
//! log-and-continue otherwise) is the executor's job.

use ipnetwork::IpNetwork;
use std::net::IpAddr;
use std::time::{Duration, Instant};
use url::{Host, Url};
use vigil_protocol::{AuditKind, Scope, ScopeEntry, TargetId};

use crate::rate_limit::{RateDecision, RateLimiter};

/// Why a destination was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Denial {
    OutOfScope { destination: String },
    PortNotAllowed { destination: String, port: u16 },
    UnsupportedScheme { scheme: String },
    RateLimited { retry_after: Duration },
}

impl Denial {
    pub fn audit_kind(&self) -> AuditKind {
        match self {
            Denial::RateLimited { .. } => AuditKind::RateLimited,
            _ => AuditKind::ScopeViolation,
        }
    }
}

impl std::fmt::Display for Denial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Denial::OutOfScope { destination } => {
                write!(f, "destination {} is outside the target scope", destination)
            }
            Denial::PortNotAllowed { destination, port } => {
                write!(f, "port {} not allowed for {}", port, destination)
            }
            Denial::UnsupportedScheme { scheme } => write!(f, "scheme {} not allowed", scheme),
            Denial::RateLimited { retry_after } => write!(
                f,
                "rate limit exhausted, retry after {}ms",
                retry_after.as_millis()
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(Denial),
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allow)
    }
}

/// Shared scope and rate state for every executor in a process.
#[derive(Debug, Default)]
pub struct ScopeGuard {
    limiter: RateLimiter,
}

impl ScopeGuard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_limiter(limiter: RateLimiter) -> Self {
        Self { limiter }
    }

    pub fn check_and_consume(
        &self,
        target_id: &TargetId,
        scope: &Scope,
        rate_limit: u32,
        destination: &Url,
        cost: u32,
    ) -> Verdict {
        self.check_and_consume_at(target_id, scope, rate_limit, destination, cost, Instant::now())
    }

    /// Allowlist first, then the rate budget. Tokens are only spent on
    /// destinations that are in scope.
    pub fn check_and_consume_at(
        &self,
        target_id: &TargetId,
        scope: &Scope,
        rate_limit: u32,
        destination: &Url,
        cost: u32,
        now: Instant,
    ) -> Verdict {
        if let Err(denial) = check_scope(scope, destination) {
            return Verdict::Deny(denial);
        }
        match self.limiter.try_acquire_at(target_id, rate_limit, cost, now) {
            RateDecision::Allowed { .. } => Verdict::Allow,
            RateDecision::Limited { retry_after } => {
                Verdict::Deny(Denial::RateLimited { retry_after })
            }
        }
    }

    pub fn prune(&self) {
        self.limiter.prune(Instant::now());
    }
}

/// Allowlist check without spending rate budget.
pub fn check_scope(scope: &Scope, destination: &Url) -> Result<(), Denial> {
    let scheme = destination.scheme();
    if scheme != "http" && scheme != "https" {
        return Err(Denial::UnsupportedScheme {
            scheme: scheme.to_string(),
        });
    }
    let out_of_scope = || Denial::OutOfScope {
        destination: origin(destination),
    };
    let host = destination.host().ok_or_else(out_of_scope)?;
    let port = destination.port_or_known_default().ok_or_else(out_of_scope)?;

    let mut host_matched = false;
    for entry in &scope.entries {
        match entry {
            ScopeEntry::ApiBase { url } => {
                if api_base_matches(url, destination) {
                    return Ok(());
                }
            }
            ScopeEntry::Host { host: allowed } => {
                if host_matches(allowed, &host) {
                    host_matched = true;
                }
            }
            ScopeEntry::Cidr { cidr } => {
                if let (Some(ip), Ok(network)) = (host_ip(&host), cidr.parse::<IpNetwork>()) {
                    if network.contains(ip) {
                        host_matched = true;
                    }
                }
            }
        }
    }

    if !host_matched {
        return Err(out_of_scope());
    }
    if !scope.ports.is_empty() && !scope.ports.contains(&port) {
        return Err(Denial::PortNotAllowed {
            destination: origin(destination),
            port,
        });
    }
    Ok(())
}

/// Structural validation at registration time.
pub fn validate_scope(scope: &Scope) -> Result<(), String> {
    if scope.is_empty() {
        return Err("scope has no entries".to_string());
    }
    for entry in &scope.entries {
        match entry {
            ScopeEntry::Host { host } => {
                let trimmed = host.trim();
                if trimmed.is_empty() || trimmed.contains('/') || trimmed.contains(char::is_whitespace) {
                    return Err(format!("invalid host entry '{}'", host));
                }
                Host::parse(trimmed).map_err(|e| format!("invalid host '{}': {}", host, e))?;
            }
            ScopeEntry::Cidr { cidr } => {
                cidr.parse::<IpNetwork>()
                    .map_err(|e| format!("invalid CIDR '{}': {}", cidr, e))?;
            }
            ScopeEntry::ApiBase { url } => {
                if !matches!(url.scheme(), "http" | "https") || url.host().is_none() {
                    return Err(format!("invalid API base '{}'", url));
                }
            }
        }
    }
    if scope.ports.contains(&0) {
        return Err("port 0 is not a valid destination port".to_string());
    }
    Ok(())
}

fn host_matches(allowed: &str, host: &Host<&str>) -> bool {
    let allowed = allowed.trim().trim_end_matches('.');
    match host {
        Host::Domain(domain) => allowed.eq_ignore_ascii_case(domain.trim_end_matches('.')),
        Host::Ipv4(ip) => allowed.parse::<IpAddr>().is_ok_and(|a| a == IpAddr::V4(*ip)),
        Host::Ipv6(ip) => allowed
            .trim_start_matches('[')
            .trim_end_matches(']')
            .parse::<IpAddr>()
            .is_ok_and(|a| a == IpAddr::V6(*ip)),
    }
}

fn host_ip(host: &Host<&str>) -> Option<IpAddr> {
    match host {
        Host::Ipv4(ip) => Some(IpAddr::V4(*ip)),
        Host::Ipv6(ip) => Some(IpAddr::V6(*ip)),
        Host::Domain(_) => None,
    }
}

fn api_base_matches(base: &Url, destination: &Url) -> bool {
    if base.scheme() != destination.scheme()
        || base.port_or_known_default() != destination.port_or_known_default()
    {
        return false;
    }
    let same_host = match (base.host_str(), destination.host_str()) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        _ => false,
    };
    if !same_host {
        return false;
    }

    let prefix = base.path();
    let path = destination.path();
    if prefix.ends_with('/') {
        path.starts_with(prefix) || path == prefix.trim_end_matches('/')
    } else {
        path == prefix || path.starts_with(&format!("{}/", prefix))
    }
}

fn origin(url: &Url) -> String {
    match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{}://{}:{}", url.scheme(), host, port),
        (Some(host), None) => format!("{}://{}", url.scheme(), host),
        _ => url.as_str().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn url(s: &str) -> Url {
        Url::parse(s).unwrap()
    }

    #[test]
    fn exact_host_is_case_insensitive_and_exact() {
        let scope = Scope::hosts(["Example.com"]);
        assert!(check_scope(&scope, &url("https://example.com/login")).is_ok());
        assert!(check_scope(&scope, &url("http://EXAMPLE.COM./")).is_ok());
        assert!(check_scope(&scope, &url("https://api.example.com/")).is_err());
        assert!(check_scope(&scope, &url("https://example.com.evil.net/")).is_err());
        assert!(check_scope(&scope, &url("https://other.com/")).is_err());
    }

    #[test]
    fn cidr_matches_ip_literals_only() {
        let scope = Scope::new(vec![ScopeEntry::cidr("10.1.0.0/16")]);
        assert!(check_scope(&scope, &url("http://10.1.4.2:8080/")).is_ok());
        assert!(check_scope(&scope, &url("http://10.2.0.1/")).is_err());
        assert!(check_scope(&scope, &url("http://internal.example/")).is_err());
    }

    #[test]
    fn api_base_requires_origin_and_path_prefix() {
        let scope = Scope::new(vec![ScopeEntry::api_base(url("https://api.example.com/v1/"))]);
        assert!(check_scope(&scope, &url("https://api.example.com/v1/users?id=1")).is_ok());
        assert!(check_scope(&scope, &url("https://api.example.com/v1")).is_ok());
        assert!(check_scope(&scope, &url("https://api.example.com/v2/users")).is_err());
        assert!(check_scope(&scope, &url("http://api.example.com/v1/users")).is_err());
        assert!(check_scope(&scope, &url("https://api.example.com:8443/v1/")).is_err());
    }

    #[test]
    fn ports_restrict_host_entries() {
        let scope = Scope::hosts(["example.com"]).with_ports(vec![443]);
        assert!(check_scope(&scope, &url("https://example.com/")).is_ok());
        assert!(matches!(
            check_scope(&scope, &url("http://example.com/")),
            Err(Denial::PortNotAllowed { port: 80, .. })
        ));
    }

    #[test]
    fn non_http_schemes_are_refused() {
        let scope = Scope::hosts(["example.com"]);
        assert!(matches!(
            check_scope(&scope, &url("ftp://example.com/")),
            Err(Denial::UnsupportedScheme { .. })
        ));
    }

    #[test]
    fn out_of_scope_spends_no_budget() {
        let guard = ScopeGuard::new();
        let target = TargetId::new();
        let scope = Scope::hosts(["example.com"]);
        let now = Instant::now();

        let denied = guard.check_and_consume_at(&target, &scope, 1, &url("https://other.com/"), 1, now);
        match denied {
            Verdict::Deny(denial) => assert_eq!(denial.audit_kind(), AuditKind::ScopeViolation),
            Verdict::Allow => panic!("other.com is not in scope"),
        }
        assert!(guard
            .check_and_consume_at(&target, &scope, 1, &url("https://example.com/"), 1, now)
            .is_allowed());
    }

    #[test]
    fn rate_limit_applies_after_scope() {
        let guard = ScopeGuard::new();
        let target = TargetId::new();
        let scope = Scope::hosts(["example.com"]);
        let now = Instant::now();
        let dest = url("https://example.com/");

        for _ in 0..5 {
            assert!(guard.check_and_consume_at(&target, &scope, 5, &dest, 1, now).is_allowed());
        }
        match guard.check_and_consume_at(&target, &scope, 5, &dest, 1, now) {
            Verdict::Deny(denial) => assert_eq!(denial.audit_kind(), AuditKind::RateLimited),
            Verdict::Allow => panic!("sixth request in the window must be denied"),
        }
    }

    #[test]
    fn validation_rejects_malformed_entries() {
        assert!(validate_scope(&Scope::hosts(["example.com"])).is_ok());
        assert!(validate_scope(&Scope::default()).is_err());
        assert!(validate_scope(&Scope::hosts(["exa mple.com"])).is_err());
        assert!(validate_scope(&Scope::hosts(["example.com/path"])).is_err());
        assert!(validate_scope(&Scope::new(vec![ScopeEntry::cidr("300.0.0.0/8")])).is_err());
        assert!(validate_scope(&Scope::hosts(["example.com"]).with_ports(vec![0])).is_err());
    }
}
