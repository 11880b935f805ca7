//! Run log capture.
//!
//! Scan log lines are product data: they are appended to the run log table as
//! they are produced so `stream_logs` can follow a live run, and a transcript is
//! kept for the log artifact stored at the end of the attempt.
//!
//! Producers never block on the database. Lines go through an unbounded channel
//! to a single writer task per attempt, which preserves order.

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::warn;
use vigil_db::VigilDb;
use vigil_protocol::{JobId, LogLevel, RunId};

struct LogEntry {
    level: LogLevel,
    message: String,
    at: DateTime<Utc>,
}

enum LogCommand {
    Line(LogEntry),
    Flush(oneshot::Sender<LogWriterReport>),
}

#[derive(Debug, Default)]
struct SinkState {
    lines: usize,
    transcript: String,
    overflowed: bool,
}

/// Cloneable handle producers write through.
#[derive(Clone)]
pub struct LogSink {
    tx: mpsc::UnboundedSender<LogCommand>,
    state: Arc<Mutex<SinkState>>,
    max_lines: usize,
}

impl LogSink {
    /// Queue a line. Returns false once the attempt's line ceiling is reached;
    /// the line is dropped in that case.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) -> bool {
        let message = message.into();
        let at = Utc::now();
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.lines >= self.max_lines {
                state.overflowed = true;
                return false;
            }
            state.lines += 1;
            state.transcript.push_str(&format!(
                "{} [{}] {}\n",
                at.to_rfc3339(),
                level,
                message
            ));
        }
        // Writer gone means the attempt is being torn down.
        let _ = self.tx.send(LogCommand::Line(LogEntry { level, message, at }));
        true
    }

    pub fn overflowed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).overflowed
    }

    pub fn transcript(&self) -> String {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .transcript
            .clone()
    }
}

/// Lines persisted and lines given up on.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LogWriterReport {
    pub written: usize,
    pub failed: usize,
}

/// Writer task for one attempt.
pub struct LogWriter {
    tx: mpsc::UnboundedSender<LogCommand>,
    handle: JoinHandle<()>,
}

impl LogWriter {
    /// Wait for every queued line to be written, then stop the writer.
    pub async fn finish(self) -> LogWriterReport {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(LogCommand::Flush(done_tx)).is_err() {
            return LogWriterReport::default();
        }
        let report = done_rx.await.unwrap_or_default();
        if let Err(e) = self.handle.await {
            warn!("Log writer task failed: {:?}", e);
        }
        report
    }
}

/// Start the writer task for one attempt.
pub fn spawn_log_writer(
    db: VigilDb,
    run_id: RunId,
    job_id: JobId,
    max_lines: usize,
    retries: u32,
    backoff: Duration,
) -> (LogSink, LogWriter) {
    let (tx, mut rx) = mpsc::unbounded_channel::<LogCommand>();
    let handle = tokio::spawn(async move {
        let mut report = LogWriterReport::default();
        while let Some(command) = rx.recv().await {
            match command {
                LogCommand::Line(entry) => {
                    if write_with_retry(&db, &run_id, &job_id, &entry, retries, backoff).await {
                        report.written += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                LogCommand::Flush(done) => {
                    let _ = done.send(report);
                    return;
                }
            }
        }
    });

    let sink = LogSink {
        tx: tx.clone(),
        state: Arc::new(Mutex::new(SinkState::default())),
        max_lines,
    };
    (sink, LogWriter { tx, handle })
}

async fn write_with_retry(
    db: &VigilDb,
    run_id: &RunId,
    job_id: &JobId,
    entry: &LogEntry,
    retries: u32,
    backoff: Duration,
) -> bool {
    let mut attempt = 0;
    loop {
        match db
            .append_log(run_id, Some(job_id), entry.level, &entry.message, entry.at)
            .await
        {
            Ok(_) => return true,
            Err(e) if attempt < retries => {
                attempt += 1;
                warn!(run_id = %run_id, attempt, "Log append failed, retrying: {}", e);
                tokio::time::sleep(backoff * attempt).await;
            }
            Err(e) => {
                warn!(run_id = %run_id, "Dropping run log line: {}", e);
                return false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn lines_are_written_in_order() {
        let db = VigilDb::open_in_memory().await.unwrap();
        let run_id = RunId::new();
        let (sink, writer) =
            spawn_log_writer(db.clone(), run_id.clone(), JobId::new(), 10, 0, Duration::ZERO);

        for i in 0..5 {
            assert!(sink.log(LogLevel::Info, format!("line {}", i)));
        }
        let report = writer.finish().await;
        assert_eq!(report, LogWriterReport { written: 5, failed: 0 });

        let lines = db.logs_after(&run_id, 0, 100).await.unwrap();
        let messages: Vec<_> = lines.iter().map(|l| l.message.as_str()).collect();
        assert_eq!(messages, vec!["line 0", "line 1", "line 2", "line 3", "line 4"]);
        assert!(sink.transcript().contains("[info] line 4"));
    }

    #[tokio::test]
    async fn ceiling_drops_extra_lines() {
        let db = VigilDb::open_in_memory().await.unwrap();
        let (sink, writer) =
            spawn_log_writer(db, RunId::new(), JobId::new(), 2, 0, Duration::ZERO);

        assert!(sink.log(LogLevel::Info, "a"));
        assert!(sink.log(LogLevel::Info, "b"));
        assert!(!sink.log(LogLevel::Info, "c"));
        assert!(sink.overflowed());
        assert_eq!(writer.finish().await.written, 2);
    }

    #[tokio::test]
    async fn failed_writes_are_counted() {
        let db = VigilDb::open_in_memory().await.unwrap();
        db.pool().close().await;
        let (sink, writer) =
            spawn_log_writer(db, RunId::new(), JobId::new(), 10, 1, Duration::ZERO);
        sink.log(LogLevel::Warn, "orphan");
        let report = writer.finish().await;
        assert_eq!(report, LogWriterReport { written: 0, failed: 1 });
    }
}
