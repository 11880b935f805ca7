//! Declared target scope.
//!
//! This is the stored shape only. Matching destinations against a scope lives in
//! `vigil_security::scope`, which compiles these entries once per check.

use serde::{Deserialize, Serialize};
use url::Url;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScopeEntry {
    /// Exact hostname (case-insensitive) or IP literal.
    Host { host: String },
    /// IPv4/IPv6 network in CIDR notation.
    Cidr { cidr: String },
    /// Scheme + authority + path prefix.
    ApiBase { url: Url },
}

impl ScopeEntry {
    pub fn host(host: impl Into<String>) -> Self {
        ScopeEntry::Host { host: host.into() }
    }

    pub fn cidr(cidr: impl Into<String>) -> Self {
        ScopeEntry::Cidr { cidr: cidr.into() }
    }

    pub fn api_base(url: Url) -> Self {
        ScopeEntry::ApiBase { url }
    }

    /// Hostname this entry names, if it names one.
    pub fn hostname(&self) -> Option<&str> {
        match self {
            ScopeEntry::Host { host } => Some(host.as_str()),
            ScopeEntry::ApiBase { url } => url.host_str(),
            ScopeEntry::Cidr { .. } => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Scope {
    pub entries: Vec<ScopeEntry>,
    /// Allowed destination ports. Empty means any port.
    #[serde(default)]
    pub ports: Vec<u16>,
}

impl Scope {
    pub fn new(entries: Vec<ScopeEntry>) -> Self {
        Self {
            entries,
            ports: Vec::new(),
        }
    }

    pub fn with_ports(mut self, ports: Vec<u16>) -> Self {
        self.ports = ports;
        self
    }

    pub fn hosts<I, S>(hosts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(hosts.into_iter().map(ScopeEntry::host).collect())
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First named host; ownership proofs are fetched from here.
    pub fn primary_host(&self) -> Option<&str> {
        self.entries.iter().find_map(ScopeEntry::hostname)
    }

    /// Base URL adapters start from: the first API base, else `https://<primary host>/`.
    pub fn primary_base_url(&self) -> Option<Url> {
        let api_base = self.entries.iter().find_map(|entry| match entry {
            ScopeEntry::ApiBase { url } => Some(url.clone()),
            _ => None,
        });
        api_base.or_else(|| {
            self.primary_host()
                .and_then(|host| Url::parse(&format!("https://{}/", host)).ok())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn primary_host_skips_cidr_entries() {
        let scope = Scope::new(vec![
            ScopeEntry::cidr("10.0.0.0/8"),
            ScopeEntry::host("example.com"),
        ]);
        assert_eq!(scope.primary_host(), Some("example.com"));
    }

    #[test]
    fn primary_base_prefers_api_base() {
        let scope = Scope::new(vec![
            ScopeEntry::host("example.com"),
            ScopeEntry::api_base(Url::parse("https://api.example.com/v1/").unwrap()),
        ]);
        assert_eq!(
            scope.primary_base_url().unwrap().as_str(),
            "https://api.example.com/v1/"
        );
    }

    #[test]
    fn scope_json_shape_is_tagged() {
        let scope = Scope::hosts(["example.com"]).with_ports(vec![443]);
        let json = serde_json::to_value(&scope).unwrap();
        assert_eq!(json["entries"][0]["kind"], "host");
        assert_eq!(json["ports"][0], 443);
        let back: Scope = serde_json::from_value(json).unwrap();
        assert_eq!(back, scope);
    }
}
