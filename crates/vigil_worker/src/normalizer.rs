//! Raw scanner output to canonical findings.
//!
//! Each record format has one mapping function. A record that cannot be mapped
//! (missing title, location or severity) is skipped and counted; if the share of
//! skipped records passes the threshold the batch is rejected as a whole, unless
//! the caller asked for lenient handling (partial output of a cancelled run).
//!
//! Records that map to the same dedup key within a batch are merged before they
//! reach the store: highest severity wins and occurrences add up.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use thiserror::Error;
use vigil_protocol::defaults::DEFAULT_MALFORMED_THRESHOLD;
use vigil_protocol::{
    finding_dedup_key, Finding, FindingId, FindingStatus, JobId, RunId, Severity,
};

/// Shape of a raw record; selects the mapping table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFormat {
    /// Passive web check alert (`alert`, `riskcode`, `url`, `pluginid`, ...).
    WebAlert,
    /// Dependency advisory match (`id`, `package`, `version`, `severity`, ...).
    Advisory,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub format: RecordFormat,
    pub data: Value,
}

impl RawRecord {
    pub fn new(format: RecordFormat, data: Value) -> Self {
        Self { format, data }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NormalizeMode {
    /// Reject the batch when too many records are malformed.
    Strict,
    /// Keep whatever maps; used for partial output.
    Lenient,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized {
    pub findings: Vec<Finding>,
    pub total: usize,
    pub malformed: usize,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum NormalizationError {
    #[error("{malformed} of {total} raw records were malformed (threshold {threshold})")]
    TooManyMalformed {
        malformed: usize,
        total: usize,
        threshold: f64,
    },
}

#[derive(Debug, Clone, Copy)]
pub struct FindingsNormalizer {
    malformed_threshold: f64,
}

impl Default for FindingsNormalizer {
    fn default() -> Self {
        Self::new(DEFAULT_MALFORMED_THRESHOLD)
    }
}

impl FindingsNormalizer {
    pub fn new(malformed_threshold: f64) -> Self {
        Self {
            malformed_threshold: malformed_threshold.clamp(0.0, 1.0),
        }
    }

    pub fn normalize(
        &self,
        run_id: &RunId,
        job_id: Option<&JobId>,
        records: &[RawRecord],
        mode: NormalizeMode,
    ) -> Result<Normalized, NormalizationError> {
        self.normalize_at(run_id, job_id, records, mode, Utc::now())
    }

    pub fn normalize_at(
        &self,
        run_id: &RunId,
        job_id: Option<&JobId>,
        records: &[RawRecord],
        mode: NormalizeMode,
        now: DateTime<Utc>,
    ) -> Result<Normalized, NormalizationError> {
        let mut findings: Vec<Finding> = Vec::new();
        let mut by_key: HashMap<String, usize> = HashMap::new();
        let mut malformed = 0;

        for record in records {
            let Some(mapped) = map_record(record) else {
                malformed += 1;
                continue;
            };
            let dedup_key = finding_dedup_key(run_id, &mapped.finding_type, &mapped.location);
            match by_key.get(&dedup_key) {
                Some(&index) => {
                    let existing = &mut findings[index];
                    existing.severity = existing.severity.max(mapped.severity);
                    existing.occurrences += 1;
                    existing.evidence = mapped.evidence;
                }
                None => {
                    by_key.insert(dedup_key.clone(), findings.len());
                    findings.push(Finding {
                        id: FindingId::new(),
                        run_id: run_id.clone(),
                        job_id: job_id.cloned(),
                        severity: mapped.severity,
                        finding_type: mapped.finding_type,
                        title: mapped.title,
                        location: mapped.location,
                        dedup_key,
                        status: FindingStatus::Open,
                        evidence: mapped.evidence,
                        occurrences: 1,
                        created_at: now,
                        updated_at: now,
                    });
                }
            }
        }

        let total = records.len();
        if mode == NormalizeMode::Strict && total > 0 {
            let ratio = malformed as f64 / total as f64;
            if ratio > self.malformed_threshold {
                return Err(NormalizationError::TooManyMalformed {
                    malformed,
                    total,
                    threshold: self.malformed_threshold,
                });
            }
        }

        Ok(Normalized {
            findings,
            total,
            malformed,
        })
    }
}

struct Mapped {
    severity: Severity,
    finding_type: String,
    title: String,
    location: String,
    evidence: Value,
}

fn map_record(record: &RawRecord) -> Option<Mapped> {
    match record.format {
        RecordFormat::WebAlert => map_web_alert(&record.data),
        RecordFormat::Advisory => map_advisory(&record.data),
    }
}

// ============================================================================
// Web alerts
// ============================================================================

fn map_web_alert(data: &Value) -> Option<Mapped> {
    let title = non_empty_str(data, "alert").or_else(|| non_empty_str(data, "name"))?;
    let location = non_empty_str(data, "url")?;
    let severity = data
        .get("riskcode")
        .and_then(riskcode_severity)
        .or_else(|| non_empty_str(data, "risk").and_then(severity_from_text))?;

    let finding_type = match data.get("pluginid").and_then(scalar_string) {
        Some(plugin) => format!("web:{}", plugin),
        None => format!("web:{}", slug(&title)),
    };

    Some(Mapped {
        severity,
        finding_type,
        title,
        location,
        evidence: pick(data, &["param", "evidence", "method", "confidence", "cweid", "other"]),
    })
}

fn riskcode_severity(value: &Value) -> Option<Severity> {
    let code = match value {
        Value::Number(n) => n.as_u64()?,
        Value::String(s) => s.trim().parse().ok()?,
        _ => return None,
    };
    match code {
        0 => Some(Severity::Info),
        1 => Some(Severity::Low),
        2 => Some(Severity::Medium),
        3 => Some(Severity::High),
        4 => Some(Severity::Critical),
        _ => None,
    }
}

// ============================================================================
// Dependency advisories
// ============================================================================

fn map_advisory(data: &Value) -> Option<Mapped> {
    let advisory_id = non_empty_str(data, "id")?;
    let package = non_empty_str(data, "package")?;
    let ecosystem = non_empty_str(data, "ecosystem").unwrap_or_else(|| "npm".to_string());
    let version = non_empty_str(data, "version");

    let severity = non_empty_str(data, "severity")
        .and_then(severity_from_text)
        .or_else(|| data.get("cvss").and_then(Value::as_f64).map(cvss_severity))?;

    let location = match &version {
        Some(version) => format!("pkg:{}/{}@{}", ecosystem, package, version),
        None => format!("pkg:{}/{}", ecosystem, package),
    };
    let title = non_empty_str(data, "summary")
        .unwrap_or_else(|| format!("{} in {}", advisory_id, package));

    let mut evidence = pick(data, &["version", "fixed_in", "cvss", "references"]);
    if let Value::Object(map) = &mut evidence {
        map.insert("advisory".to_string(), Value::String(advisory_id.clone()));
        map.insert("package".to_string(), Value::String(package));
    }

    Some(Mapped {
        severity,
        finding_type: format!("advisory:{}", advisory_id.to_lowercase()),
        title,
        location,
        evidence,
    })
}

fn cvss_severity(score: f64) -> Severity {
    if score >= 9.0 {
        Severity::Critical
    } else if score >= 7.0 {
        Severity::High
    } else if score >= 4.0 {
        Severity::Medium
    } else if score > 0.0 {
        Severity::Low
    } else {
        Severity::Info
    }
}

// ============================================================================
// Helpers
// ============================================================================

fn severity_from_text(text: String) -> Option<Severity> {
    match text.trim().to_ascii_lowercase().as_str() {
        "critical" => Some(Severity::Critical),
        "high" => Some(Severity::High),
        "medium" | "moderate" => Some(Severity::Medium),
        "low" => Some(Severity::Low),
        "info" | "informational" | "none" => Some(Severity::Info),
        _ => None,
    }
}

fn non_empty_str(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn pick(data: &Value, keys: &[&str]) -> Value {
    let mut out = Map::new();
    for key in keys {
        if let Some(value) = data.get(*key) {
            if !value.is_null() {
                out.insert((*key).to_string(), value.clone());
            }
        }
    }
    if out.is_empty() {
        json!({})
    } else {
        Value::Object(out)
    }
}

fn slug(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut dash = false;
    for c in text.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    out.trim_end_matches('-').to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn alert(title: &str, riskcode: &str, url: &str) -> RawRecord {
        RawRecord::new(
            RecordFormat::WebAlert,
            json!({"alert": title, "riskcode": riskcode, "url": url, "pluginid": "10035"}),
        )
    }

    #[test]
    fn web_alerts_map_to_findings() {
        let run = RunId::new();
        let out = FindingsNormalizer::default()
            .normalize(
                &run,
                None,
                &[alert("Strict-Transport-Security Header Not Set", "1", "https://example.com/")],
                NormalizeMode::Strict,
            )
            .unwrap();
        assert_eq!(out.findings.len(), 1);
        let finding = &out.findings[0];
        assert_eq!(finding.severity, Severity::Low);
        assert_eq!(finding.finding_type, "web:10035");
        assert_eq!(finding.status, FindingStatus::Open);
        assert_eq!(finding.occurrences, 1);
    }

    #[test]
    fn duplicates_in_a_batch_merge() {
        let run = RunId::new();
        let records = vec![
            alert("Missing HSTS", "1", "https://example.com/a/"),
            alert("Missing HSTS", "3", "https://EXAMPLE.com/a"),
        ];
        let out = FindingsNormalizer::default()
            .normalize(&run, None, &records, NormalizeMode::Strict)
            .unwrap();
        assert_eq!(out.findings.len(), 1);
        assert_eq!(out.findings[0].severity, Severity::High);
        assert_eq!(out.findings[0].occurrences, 2);
    }

    #[test]
    fn advisories_use_text_severity_then_cvss() {
        let run = RunId::new();
        let records = vec![
            RawRecord::new(
                RecordFormat::Advisory,
                json!({"id": "GHSA-xxxx", "package": "lodash", "version": "4.17.20", "severity": "moderate"}),
            ),
            RawRecord::new(
                RecordFormat::Advisory,
                json!({"id": "CVE-2024-1", "package": "left-pad", "cvss": 9.8}),
            ),
        ];
        let out = FindingsNormalizer::default()
            .normalize(&run, None, &records, NormalizeMode::Strict)
            .unwrap();
        assert_eq!(out.findings[0].severity, Severity::Medium);
        assert_eq!(out.findings[0].location, "pkg:npm/lodash@4.17.20");
        assert_eq!(out.findings[0].finding_type, "advisory:ghsa-xxxx");
        assert_eq!(out.findings[1].severity, Severity::Critical);
    }

    #[test]
    fn malformed_share_above_threshold_rejects_batch() {
        let run = RunId::new();
        let bad = RawRecord::new(RecordFormat::WebAlert, json!({"alert": "no url"}));
        let good = alert("ok", "2", "https://example.com/");

        // 1 of 4 = 0.25 is at the threshold, not above it.
        let batch = vec![bad.clone(), good.clone(), good.clone(), good.clone()];
        let out = FindingsNormalizer::default()
            .normalize(&run, None, &batch, NormalizeMode::Strict)
            .unwrap();
        assert_eq!(out.malformed, 1);

        let batch = vec![bad.clone(), bad.clone(), good.clone()];
        let err = FindingsNormalizer::default()
            .normalize(&run, None, &batch, NormalizeMode::Strict)
            .unwrap_err();
        assert_eq!(
            err,
            NormalizationError::TooManyMalformed {
                malformed: 2,
                total: 3,
                threshold: 0.25
            }
        );

        let out = FindingsNormalizer::default()
            .normalize(&run, None, &batch, NormalizeMode::Lenient)
            .unwrap();
        assert_eq!(out.findings.len(), 1);
    }

    #[test]
    fn unknown_severity_is_malformed() {
        let run = RunId::new();
        let record = RawRecord::new(
            RecordFormat::WebAlert,
            json!({"alert": "x", "url": "https://example.com/", "risk": "spicy"}),
        );
        let out = FindingsNormalizer::new(1.0)
            .normalize(&run, None, &[record], NormalizeMode::Strict)
            .unwrap();
        assert_eq!(out.malformed, 1);
        assert!(out.findings.is_empty());
    }

    #[test]
    fn empty_batch_is_fine() {
        let out = FindingsNormalizer::default()
            .normalize(&RunId::new(), None, &[], NormalizeMode::Strict)
            .unwrap();
        assert_eq!(out.total, 0);
    }

    #[test]
    fn slugs_are_stable() {
        assert_eq!(slug("X-Frame-Options Header Not Set"), "x-frame-options-header-not-set");
        assert_eq!(slug("  Cookie: no HttpOnly!"), "cookie-no-httponly");
    }
}
