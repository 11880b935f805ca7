//! Passive web baseline.
//!
//! Fetches a handful of pages from the target and reports missing security
//! headers, version disclosure and weak cookie flags. With safe mode off it
//! also probes a list of commonly exposed paths.
//!
//! Redirects are followed by hand so every hop goes through the egress check.

use reqwest::header::{HeaderMap, LOCATION, SERVER, SET_COOKIE};
use reqwest::redirect::Policy;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use url::Url;
use vigil_protocol::{ArtifactKind, LogLevel, Target};

use super::{parse_config, AdapterError};
use crate::normalizer::{RawRecord, RecordFormat};
use crate::sandbox::ScanContext;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebBaselineConfig {
    /// Start URL; defaults to the target's primary base URL.
    pub base_url: Option<Url>,
    /// Paths checked passively, relative to the base.
    pub paths: Vec<String>,
    /// Paths probed only when safe mode is off.
    pub active_paths: Vec<String>,
    pub max_redirects: u32,
    pub request_timeout_ms: u64,
}

impl Default for WebBaselineConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            paths: vec!["/".to_string()],
            active_paths: vec![
                "/.git/HEAD".to_string(),
                "/.env".to_string(),
                "/server-status".to_string(),
            ],
            max_redirects: 3,
            request_timeout_ms: 10_000,
        }
    }
}

pub struct WebBaselineAdapter {
    client: reqwest::Client,
}

struct Page {
    url: Url,
    status: u16,
    headers: HeaderMap,
}

impl WebBaselineAdapter {
    pub fn new() -> Result<Self, AdapterError> {
        let client = reqwest::Client::builder()
            .redirect(Policy::none())
            .user_agent(concat!("vigil-web-baseline/", env!("CARGO_PKG_VERSION")))
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
        let config: WebBaselineConfig = parse_config(config)?;
        let base = config
            .base_url
            .clone()
            .or_else(|| target.scope.primary_base_url())
            .ok_or_else(|| AdapterError::Config("target scope has no base URL".to_string()))?;
        let timeout = Duration::from_millis(config.request_timeout_ms.max(1));

        let mut checks: Vec<(String, bool)> =
            config.paths.iter().map(|p| (p.clone(), false)).collect();
        if !ctx.safe_mode() {
            checks.extend(config.active_paths.iter().map(|p| (p.clone(), true)));
        }

        let mut summary = Vec::new();
        let mut errors = 0usize;
        for (path, active) in &checks {
            ctx.checkpoint()?;
            let url = base
                .join(path.trim_start_matches('/'))
                .map_err(|e| AdapterError::Config(format!("bad path '{}': {}", path, e)))?;

            let page = match self.fetch(&url, config.max_redirects, timeout, ctx).await {
                Ok(Some(page)) => page,
                Ok(None) => continue,
                Err(AdapterError::Http(message)) => {
                    errors += 1;
                    ctx.log(LogLevel::Warn, format!("GET {} failed: {}", url, message));
                    continue;
                }
                Err(other) => return Err(other),
            };
            ctx.log(
                LogLevel::Info,
                format!("GET {} -> {}", page.url, page.status),
            );

            let alerts = if *active {
                exposure_checks(&page.url, page.status)
            } else {
                passive_checks(&page.url, &page.headers)
            };
            for alert in alerts {
                ctx.emit(RawRecord::new(RecordFormat::WebAlert, alert))?;
            }
            summary.push(json!({"url": page.url.as_str(), "status": page.status, "active": active}));
        }

        if !checks.is_empty() && errors == checks.len() {
            return Err(AdapterError::Http(format!(
                "all {} requests to {} failed",
                errors, base
            )));
        }

        let report = serde_json::to_vec_pretty(&json!({ "base_url": base.as_str(), "pages": summary }))
            .map_err(|e| AdapterError::Config(e.to_string()))?;
        ctx.attach(ArtifactKind::Report, "web-baseline.json", report)?;
        Ok(())
    }

    /// GET with manual redirects. `None` when a hop was refused without
    /// aborting the run.
    async fn fetch(
        &self,
        url: &Url,
        max_redirects: u32,
        timeout: Duration,
        ctx: &ScanContext,
    ) -> Result<Option<Page>, AdapterError> {
        let mut current = url.clone();
        for _ in 0..=max_redirects {
            if !ctx.permit(&current, 1).await? {
                return Ok(None);
            }
            let response = self
                .client
                .get(current.clone())
                .timeout(timeout)
                .send()
                .await
                .map_err(|e| AdapterError::Http(e.to_string()))?;

            let status = response.status();
            if status.is_redirection() {
                if let Some(location) = response
                    .headers()
                    .get(LOCATION)
                    .and_then(|v| v.to_str().ok())
                {
                    let next = current
                        .join(location)
                        .map_err(|e| AdapterError::Http(format!("bad redirect: {}", e)))?;
                    ctx.log(LogLevel::Debug, format!("{} redirects to {}", current, next));
                    current = next;
                    continue;
                }
            }
            return Ok(Some(Page {
                url: current,
                status: status.as_u16(),
                headers: response.headers().clone(),
            }));
        }
        Err(AdapterError::Http(format!(
            "more than {} redirects from {}",
            max_redirects, url
        )))
    }
}

fn alert(name: &str, riskcode: u8, pluginid: u32, url: &Url, extra: Value) -> Value {
    let mut value = json!({
        "alert": name,
        "riskcode": riskcode.to_string(),
        "pluginid": pluginid.to_string(),
        "url": url.as_str(),
    });
    if let (Value::Object(map), Value::Object(extra)) = (&mut value, extra) {
        map.extend(extra);
    }
    value
}

fn passive_checks(url: &Url, headers: &HeaderMap) -> Vec<Value> {
    let mut alerts = Vec::new();
    let https = url.scheme() == "https";

    if https && header_str(headers, "strict-transport-security").is_none() {
        alerts.push(alert("Strict-Transport-Security Header Not Set", 1, 10035, url, json!({})));
    }
    let csp = header_str(headers, "content-security-policy");
    if csp.is_none() {
        alerts.push(alert("Content Security Policy (CSP) Header Not Set", 2, 10038, url, json!({})));
    }
    if header_str(headers, "x-content-type-options").is_none() {
        alerts.push(alert("X-Content-Type-Options Header Missing", 1, 10021, url, json!({})));
    }
    let frame_ancestors = csp.is_some_and(|v| v.to_ascii_lowercase().contains("frame-ancestors"));
    if header_str(headers, "x-frame-options").is_none() && !frame_ancestors {
        alerts.push(alert("Missing Anti-clickjacking Header", 2, 10020, url, json!({})));
    }
    if let Some(server) = headers.get(SERVER).and_then(|v| v.to_str().ok()) {
        if server.chars().any(|c| c.is_ascii_digit()) {
            alerts.push(alert(
                "Server Leaks Version Information via \"Server\" HTTP Response Header Field",
                1,
                10036,
                url,
                json!({"evidence": server}),
            ));
        }
    }

    for cookie in headers.get_all(SET_COOKIE).iter().filter_map(|v| v.to_str().ok()) {
        let name = cookie.split('=').next().unwrap_or_default().trim();
        let attributes: Vec<String> = cookie
            .split(';')
            .skip(1)
            .map(|a| a.trim().to_ascii_lowercase())
            .collect();
        if !attributes.iter().any(|a| a == "httponly") {
            alerts.push(alert("Cookie No HttpOnly Flag", 1, 10010, url, json!({"param": name})));
        }
        if https && !attributes.iter().any(|a| a == "secure") {
            alerts.push(alert("Cookie Without Secure Flag", 1, 10011, url, json!({"param": name})));
        }
    }
    alerts
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}

fn exposure_checks(url: &Url, status: u16) -> Vec<Value> {
    if status == 200 {
        vec![alert(
            "Sensitive Path Exposed",
            3,
            40034,
            url,
            json!({"evidence": format!("HTTP {}", status)}),
        )]
    } else {
        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn names(alerts: &[Value]) -> Vec<&str> {
        alerts.iter().filter_map(|a| a["alert"].as_str()).collect()
    }

    #[test]
    fn bare_https_response_trips_header_checks() {
        let url = Url::parse("https://example.com/").unwrap();
        let alerts = passive_checks(&url, &HeaderMap::new());
        assert_eq!(
            names(&alerts),
            vec![
                "Strict-Transport-Security Header Not Set",
                "Content Security Policy (CSP) Header Not Set",
                "X-Content-Type-Options Header Missing",
                "Missing Anti-clickjacking Header",
            ]
        );
        assert_eq!(alerts[0]["pluginid"], "10035");
    }

    #[test]
    fn hardened_response_is_clean() {
        let url = Url::parse("https://example.com/").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("strict-transport-security", HeaderValue::from_static("max-age=63072000"));
        headers.insert(
            "content-security-policy",
            HeaderValue::from_static("default-src 'self'; frame-ancestors 'none'"),
        );
        headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
        headers.insert(SERVER, HeaderValue::from_static("nginx"));
        headers.append(SET_COOKIE, HeaderValue::from_static("sid=abc; Secure; HttpOnly"));
        assert!(passive_checks(&url, &headers).is_empty());
    }

    #[test]
    fn weak_cookies_and_versioned_server_are_reported() {
        let url = Url::parse("http://example.com/").unwrap();
        let mut headers = HeaderMap::new();
        headers.insert("content-security-policy", HeaderValue::from_static("frame-ancestors 'self'"));
        headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
        headers.insert(SERVER, HeaderValue::from_static("Apache/2.4.1"));
        headers.append(SET_COOKIE, HeaderValue::from_static("sid=abc; Path=/"));
        let alerts = passive_checks(&url, &headers);
        assert_eq!(
            names(&alerts),
            vec![
                "Server Leaks Version Information via \"Server\" HTTP Response Header Field",
                "Cookie No HttpOnly Flag",
            ]
        );
        assert_eq!(alerts[1]["param"], "sid");
    }

    #[test]
    fn exposure_only_on_success() {
        let url = Url::parse("https://example.com/.env").unwrap();
        assert_eq!(exposure_checks(&url, 200).len(), 1);
        assert!(exposure_checks(&url, 404).is_empty());
    }

    #[test]
    fn config_defaults_apply_to_missing_keys() {
        let config: WebBaselineConfig = parse_config(&json!({"max_redirects": 0})).unwrap();
        assert_eq!(config.max_redirects, 0);
        assert_eq!(config.paths, vec!["/"]);
    }
}
