//! Dependency audit against a supplied advisory set.
//!
//! Packages come from the suite config, and optionally from a JSON manifest
//! fetched from the target (`{"dependencies": {"name": "version", ...}}`). Each
//! package is matched against the advisories by exact version or by an
//! `introduced`/`fixed` range.

use reqwest::redirect::Policy;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use url::Url;
use vigil_protocol::{ArtifactKind, LogLevel, Target};

use super::{parse_config, AdapterError};
use crate::normalizer::{RawRecord, RecordFormat};
use crate::sandbox::ScanContext;

/// Largest manifest accepted from the target.
const MAX_MANIFEST_BYTES: usize = 4 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Package {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Advisory {
    pub id: String,
    pub package: String,
    /// Exact affected versions.
    #[serde(default)]
    pub versions: Vec<String>,
    /// First affected version (inclusive).
    #[serde(default)]
    pub introduced: Option<String>,
    /// First fixed version (exclusive upper bound).
    #[serde(default)]
    pub fixed: Option<String>,
    #[serde(default)]
    pub severity: Option<String>,
    #[serde(default)]
    pub cvss: Option<f64>,
    #[serde(default)]
    pub summary: Option<String>,
}

impl Advisory {
    fn affects(&self, package: &Package) -> bool {
        if !self.package.eq_ignore_ascii_case(&package.name) {
            return false;
        }
        if self.versions.iter().any(|v| v == &package.version) {
            return true;
        }
        if self.introduced.is_none() && self.fixed.is_none() {
            return false;
        }
        let after_intro = self
            .introduced
            .as_deref()
            .map_or(true, |intro| compare_versions(&package.version, intro) != Ordering::Less);
        let before_fix = self
            .fixed
            .as_deref()
            .map_or(true, |fixed| compare_versions(&package.version, fixed) == Ordering::Less);
        after_intro && before_fix
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DependencyAuditConfig {
    pub ecosystem: Option<String>,
    pub packages: Vec<Package>,
    pub advisories: Vec<Advisory>,
    /// Manifest to fetch from the target, resolved against its base URL.
    pub manifest_path: Option<String>,
}

pub struct DependencyAuditAdapter {
    client: reqwest::Client,
}

impl DependencyAuditAdapter {
    pub fn new() -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .build()
            .map_err(|e| AdapterError::Http(e.to_string()))?;
        Ok(Self { client })
    }

    pub async fn run_scan(
        &self,
        target: &Target,
        config: &Value,
        ctx: &ScanContext,
    ) -> Result<(), AdapterError> {
        let config: DependencyAuditConfig = parse_config(config)?;
        let ecosystem = config.ecosystem.clone().unwrap_or_else(|| "npm".to_string());

        let mut packages = config.packages.clone();
        if let Some(path) = &config.manifest_path {
            let base = target
                .scope
                .primary_base_url()
                .ok_or_else(|| AdapterError::Config("target scope has no base URL".to_string()))?;
            let url = base
                .join(path.trim_start_matches('/'))
                .map_err(|e| AdapterError::Config(format!("bad manifest path '{}': {}", path, e)))?;
            packages.extend(self.fetch_manifest(&url, ctx).await?);
        }
        ctx.log(
            LogLevel::Info,
            format!(
                "Auditing {} packages against {} advisories",
                packages.len(),
                config.advisories.len()
            ),
        );

        let mut matches = 0usize;
        for package in &packages {
            ctx.checkpoint()?;
            for advisory in config.advisories.iter().filter(|a| a.affects(package)) {
                matches += 1;
                ctx.log(
                    LogLevel::Warn,
                    format!("{}@{} affected by {}", package.name, package.version, advisory.id),
                );
                ctx.emit(RawRecord::new(
                    RecordFormat::Advisory,
                    json!({
                        "id": advisory.id,
                        "package": package.name,
                        "version": package.version,
                        "ecosystem": ecosystem,
                        "severity": advisory.severity,
                        "cvss": advisory.cvss,
                        "summary": advisory.summary,
                        "fixed_in": advisory.fixed,
                    }),
                ))?;
            }
        }

        let report = serde_json::to_vec_pretty(&json!({
            "ecosystem": ecosystem,
            "packages_scanned": packages.len(),
            "matches": matches,
        }))
        .map_err(|e| AdapterError::Config(e.to_string()))?;
        ctx.attach(ArtifactKind::Report, "dependency-audit.json", report)?;
        Ok(())
    }

    async fn fetch_manifest(&self, url: &Url, ctx: &ScanContext) -> Result<Vec<Package>, AdapterError> {
        if !ctx.permit(url, 1).await? {
            ctx.log(LogLevel::Warn, format!("Manifest fetch from {} skipped", url));
            return Ok(Vec::new());
        }
        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .map_err(|e| AdapterError::Http(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AdapterError::Http(format!(
                "manifest {} returned HTTP {}",
                url,
                response.status().as_u16()
            )));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| AdapterError::Http(e.to_string()))?;
        if body.len() > MAX_MANIFEST_BYTES {
            return Err(AdapterError::ResourceLimit(format!(
                "manifest larger than {} bytes",
                MAX_MANIFEST_BYTES
            )));
        }
        parse_manifest(&body)
    }
}

fn parse_manifest(body: &[u8]) -> Result<Vec<Package>, AdapterError> {
    #[derive(Deserialize)]
    struct Manifest {
        #[serde(default)]
        dependencies: BTreeMap<String, String>,
    }
    let manifest: Manifest = serde_json::from_slice(body)
        .map_err(|e| AdapterError::Http(format!("manifest is not valid JSON: {}", e)))?;
    Ok(manifest
        .dependencies
        .into_iter()
        .map(|(name, version)| Package {
            name,
            version: version.trim_start_matches(['^', '~', '=']).to_string(),
        })
        .collect())
}

/// Dotted numeric comparison; non-numeric suffixes (`-beta`) are ignored.
fn compare_versions(a: &str, b: &str) -> Ordering {
    let parse = |v: &str| -> Vec<u64> {
        v.trim_start_matches('v')
            .split(['.', '-', '+'])
            .map_while(|part| part.parse::<u64>().ok())
            .collect()
    };
    let (a, b) = (parse(a), parse(b));
    let len = a.len().max(b.len());
    for i in 0..len {
        let x = a.get(i).copied().unwrap_or(0);
        let y = b.get(i).copied().unwrap_or(0);
        match x.cmp(&y) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}
