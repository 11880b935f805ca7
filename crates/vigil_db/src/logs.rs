//! Run log lines.
//!
//! Each append commits before it is announced on the broadcast channel, so a
//! subscriber woken by a notification always finds the line in the table.

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use vigil_protocol::{JobId, LogLevel, LogLine, RunId};

use crate::error::Result;
use crate::rows::{log_from_row, to_millis};
use crate::VigilDb;

impl VigilDb {
    pub async fn append_log(
        &self,
        run_id: &RunId,
        job_id: Option<&JobId>,
        level: LogLevel,
        message: &str,
        at: DateTime<Utc>,
    ) -> Result<i64> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO run_logs (run_id, job_id, level, message, logged_at)
            VALUES (?, ?, ?, ?, ?)
            RETURNING seq
            "#,
        )
        .bind(run_id.as_str())
        .bind(job_id.map(|j| j.as_str()))
        .bind(level.as_str())
        .bind(message)
        .bind(to_millis(at))
        .fetch_one(&self.pool)
        .await?;

        // No subscribers is fine.
        let _ = self.log_events.send(run_id.clone());
        Ok(seq)
    }

    /// Lines with `seq > after`, in append order.
    pub async fn logs_after(&self, run_id: &RunId, after: i64, limit: u32) -> Result<Vec<LogLine>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM run_logs
            WHERE run_id = ? AND seq > ?
            ORDER BY seq ASC
            LIMIT ?
            "#,
        )
        .bind(run_id.as_str())
        .bind(after)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(log_from_row).collect()
    }

    /// Notifications carry only the run id; readers re-query with their cursor.
    pub fn subscribe_logs(&self) -> broadcast::Receiver<RunId> {
        self.log_events.subscribe()
    }

    pub async fn count_logs(&self, run_id: &RunId) -> Result<i64> {
        let n: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM run_logs WHERE run_id = ?")
            .bind(run_id.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn appends_are_ordered_and_announced() {
        let db = VigilDb::open_in_memory().await.unwrap();
        let run_id = RunId::new();
        let mut events = db.subscribe_logs();

        let first = db
            .append_log(&run_id, None, LogLevel::Info, "starting", Utc::now())
            .await
            .unwrap();
        let second = db
            .append_log(&run_id, None, LogLevel::Warn, "slow response", Utc::now())
            .await
            .unwrap();
        assert!(second > first);
        assert_eq!(events.recv().await.unwrap(), run_id);

        let lines = db.logs_after(&run_id, first, 100).await.unwrap();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].message, "slow response");
        assert_eq!(lines[0].level, LogLevel::Warn);
        assert_eq!(db.count_logs(&run_id).await.unwrap(), 2);
    }
}
