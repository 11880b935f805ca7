//! Replay of a recorded scan session.
//!
//! Re-emits recorded raw output step by step. Recorded requests are not sent;
//! they are still run through the egress check so a replay against a target
//! whose scope has since narrowed is caught the same way a live scan would be.

use serde::Deserialize;
use serde_json::Value;
use std::time::{Duration, Instant};
use url::Url;
use vigil_protocol::{ArtifactKind, LogLevel, Target};

use super::{parse_config, AdapterError};
use crate::normalizer::RawRecord;
use crate::sandbox::ScanContext;

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplayStep {
    Request(Url),
    Emit(RawRecord),
    Log(String),
    SleepMs(u64),
    /// Milliseconds of CPU-bound work the recorded scanner did here.
    BusyMs(u64),
    Attach {
        kind: ArtifactKind,
        name: String,
        content: String,
    },
    /// The recorded scanner died here.
    Crash(String),
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ReplayConfig {
    pub steps: Vec<ReplayStep>,
    /// Emitted after the steps.
    pub records: Vec<RawRecord>,
}

pub struct ReplayAdapter;

impl ReplayAdapter {
    pub async fn run_scan(
        &self,
        target: &Target,
        config: &Value,
        ctx: &ScanContext,
    ) -> Result<(), AdapterError> {
        let config: ReplayConfig = parse_config(config)?;
        ctx.log(
            LogLevel::Info,
            format!(
                "Replaying {} steps against {}",
                config.steps.len(),
                target.name
            ),
        );

        for step in config.steps {
            ctx.checkpoint()?;
            match step {
                ReplayStep::Request(url) => {
                    if ctx.permit(&url, 1).await? {
                        ctx.log(LogLevel::Debug, format!("GET {}", url));
                    }
                }
                ReplayStep::Emit(record) => ctx.emit(record)?,
                ReplayStep::Log(message) => ctx.log(LogLevel::Info, message),
                ReplayStep::SleepMs(ms) => ctx.sleep(Duration::from_millis(ms)).await?,
                ReplayStep::BusyMs(ms) => {
                    let until = Instant::now() + Duration::from_millis(ms);
                    while Instant::now() < until {
                        std::hint::spin_loop();
                    }
                    tokio::task::yield_now().await;
                }
                ReplayStep::Attach {
                    kind,
                    name,
                    content,
                } => ctx.attach(kind, name, content.into_bytes())?,
                ReplayStep::Crash(message) => return Err(AdapterError::Crashed(message)),
            }
        }

        for record in config.records {
            ctx.emit(record)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalizer::RecordFormat;
    use serde_json::json;

    #[test]
    fn steps_parse_from_json() {
        let config: ReplayConfig = parse_config(&json!({
            "steps": [
                {"request": "https://example.com/"},
                {"emit": {"format": "web_alert", "data": {"alert": "x"}}},
                {"log": "hello"},
                {"sleep_ms": 5},
                {"busy_ms": 2},
                {"attach": {"kind": "report", "name": "r.txt", "content": "ok"}},
                {"crash": "segfault"}
            ]
        }))
        .unwrap();
        assert_eq!(config.steps.len(), 7);
        assert_eq!(
            config.steps[1],
            ReplayStep::Emit(RawRecord::new(RecordFormat::WebAlert, json!({"alert": "x"})))
        );
        assert_eq!(config.steps[3], ReplayStep::SleepMs(5));
        assert_eq!(config.steps[4], ReplayStep::BusyMs(2));
    }

    #[test]
    fn unknown_steps_are_config_errors() {
        let err = parse_config::<ReplayConfig>(&json!({"steps": [{"teleport": 1}]})).unwrap_err();
        assert!(matches!(err, AdapterError::Config(_)));
    }
}
