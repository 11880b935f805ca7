//! Per-attempt execution context handed to scan adapters.
//!
//! The adapter only sees a [`ScanContext`]. Everything it produces (raw records,
//! artifacts, log lines) is collected here as it is produced, so whatever was
//! gathered before a cancellation or timeout is still available afterwards.
//! Resource ceilings are enforced at the point of collection. CPU time is
//! metered by [`ScanContext::metered`], which charges the adapter for every
//! moment spent inside its `poll`; time parked on I/O or sleeps is free.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use url::Url;
use vigil_protocol::{ArtifactKind, JobId, LogLevel, ResourceLimits, RunId};

use crate::adapters::AdapterError;
use crate::cancel::CancellationToken;
use crate::egress::EgressChecker;
use crate::log_sink::LogSink;
use crate::normalizer::RawRecord;

/// Artifact bytes produced by an adapter, stored after the scan.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactPayload {
    pub kind: ArtifactKind,
    pub name: String,
    pub bytes: Vec<u8>,
}

/// Everything collected during one attempt.
#[derive(Debug, Default)]
pub struct ScanOutput {
    pub records: Vec<RawRecord>,
    pub artifacts: Vec<ArtifactPayload>,
    pub artifact_bytes: u64,
    /// Records and artifacts together.
    pub memory_bytes: u64,
    /// First ceiling that was hit, if any.
    pub limit_breach: Option<String>,
}

pub struct ScanContext {
    run_id: RunId,
    job_id: JobId,
    safe_mode: bool,
    limits: ResourceLimits,
    egress: Arc<dyn EgressChecker>,
    cancel: CancellationToken,
    log: LogSink,
    output: Mutex<ScanOutput>,
    cpu_nanos: AtomicU64,
}

impl ScanContext {
    pub fn new(
        run_id: RunId,
        job_id: JobId,
        safe_mode: bool,
        limits: ResourceLimits,
        egress: Arc<dyn EgressChecker>,
        cancel: CancellationToken,
        log: LogSink,
    ) -> Self {
        Self {
            run_id,
            job_id,
            safe_mode,
            limits,
            egress,
            cancel,
            log,
            output: Mutex::new(ScanOutput::default()),
            cpu_nanos: AtomicU64::new(0),
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn job_id(&self) -> &JobId {
        &self.job_id
    }

    pub fn safe_mode(&self) -> bool {
        self.safe_mode
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once the attempt is cancelled.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    /// Bail out between steps if the attempt was cancelled.
    pub fn checkpoint(&self) -> Result<(), AdapterError> {
        if self.cancel.is_cancelled() {
            Err(AdapterError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Sleep unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> Result<(), AdapterError> {
        tokio::select! {
            _ = tokio::time::sleep(duration) => Ok(()),
            _ = self.cancel.cancelled() => Err(AdapterError::Cancelled),
        }
    }

    /// Ask for permission to send `cost` requests to `destination`.
    ///
    /// `Ok(false)` means the action was refused but the scan may go on without
    /// it. A refusal that aborts the run comes back as an error.
    pub async fn permit(&self, destination: &Url, cost: u32) -> Result<bool, AdapterError> {
        self.checkpoint()?;
        match self.egress.check(destination, cost).await {
            Ok(()) => Ok(true),
            Err(denied) if denied.fatal => Err(AdapterError::Egress(denied)),
            Err(_) => Ok(false),
        }
    }

    pub fn emit(&self, record: RawRecord) -> Result<(), AdapterError> {
        let size = record.data.to_string().len() as u64;
        let mut output = self.output.lock().unwrap_or_else(|e| e.into_inner());
        if output.records.len() >= self.limits.max_raw_records {
            return Err(breach(
                &mut output,
                format!("raw record ceiling of {} reached", self.limits.max_raw_records),
            ));
        }
        self.charge_memory(&mut output, size)?;
        output.records.push(record);
        Ok(())
    }

    pub fn attach(
        &self,
        kind: ArtifactKind,
        name: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Result<(), AdapterError> {
        let mut output = self.output.lock().unwrap_or_else(|e| e.into_inner());
        let total = output.artifact_bytes + bytes.len() as u64;
        if total > self.limits.max_artifact_bytes {
            return Err(breach(
                &mut output,
                format!("artifact byte ceiling of {} reached", self.limits.max_artifact_bytes),
            ));
        }
        self.charge_memory(&mut output, bytes.len() as u64)?;
        output.artifact_bytes = total;
        output.artifacts.push(ArtifactPayload {
            kind,
            name: name.into(),
            bytes,
        });
        Ok(())
    }

    /// Scan log line, streamed to the run log.
    pub fn log(&self, level: LogLevel, message: impl Into<String>) {
        if !self.log.log(level, message) {
            let mut output = self.output.lock().unwrap_or_else(|e| e.into_inner());
            output.limit_breach.get_or_insert_with(|| {
                format!("log line ceiling of {} reached", self.limits.max_log_lines)
            });
        }
    }

    fn charge_memory(&self, output: &mut ScanOutput, bytes: u64) -> Result<(), AdapterError> {
        let total = output.memory_bytes + bytes;
        if total > self.limits.max_memory_bytes {
            return Err(breach(
                output,
                format!("memory ceiling of {} bytes reached", self.limits.max_memory_bytes),
            ));
        }
        output.memory_bytes = total;
        Ok(())
    }

    /// Wrap the adapter future so its polls are charged against the CPU
    /// ceiling. Once over budget the scan is dropped at its next yield.
    pub fn metered<F>(&self, scan: F) -> Metered<'_, F>
    where
        F: Future<Output = Result<(), AdapterError>>,
    {
        Metered {
            scan: Box::pin(scan),
            ctx: self,
        }
    }

    pub fn cpu_used(&self) -> Duration {
        Duration::from_nanos(self.cpu_nanos.load(Ordering::Relaxed))
    }

    /// Add `elapsed`; `Some(breach)` once the total is over the ceiling.
    fn charge_cpu(&self, elapsed: Duration) -> Option<AdapterError> {
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        let used = self.cpu_nanos.fetch_add(nanos, Ordering::Relaxed).saturating_add(nanos);
        if Duration::from_nanos(used) <= Duration::from_millis(self.limits.max_cpu_ms) {
            return None;
        }
        let mut output = self.output.lock().unwrap_or_else(|e| e.into_inner());
        Some(breach(
            &mut output,
            format!("CPU time ceiling of {}ms reached", self.limits.max_cpu_ms),
        ))
    }

    pub fn limit_breach(&self) -> Option<String> {
        self.output
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .limit_breach
            .clone()
    }

    /// Take what has been collected so far.
    pub fn take_output(&self) -> ScanOutput {
        std::mem::take(&mut *self.output.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

fn breach(output: &mut ScanOutput, message: String) -> AdapterError {
    output.limit_breach.get_or_insert_with(|| message.clone());
    AdapterError::ResourceLimit(message)
}

/// Adapter future returned by [`ScanContext::metered`].
pub struct Metered<'a, F> {
    scan: Pin<Box<F>>,
    ctx: &'a ScanContext,
}

impl<F> Future for Metered<'_, F>
where
    F: Future<Output = Result<(), AdapterError>>,
{
    type Output = Result<(), AdapterError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let started = Instant::now();
        let polled = this.scan.as_mut().poll(cx);
        let over = this.ctx.charge_cpu(started.elapsed());
        match (polled, over) {
            // A finished scan keeps its result; the recorded breach still fails it.
            (Poll::Ready(result), _) => Poll::Ready(result),
            (Poll::Pending, Some(err)) => Poll::Ready(Err(err)),
            (Poll::Pending, None) => Poll::Pending,
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use async_trait::async_trait;
    use crate::egress::EgressDenied;
    use crate::log_sink::{spawn_log_writer, LogWriter};
    use vigil_db::VigilDb;

    /// Allows everything except hosts named in `deny`.
    pub struct ListEgress {
        pub deny: Vec<String>,
        pub fatal: bool,
    }

    #[async_trait]
    impl EgressChecker for ListEgress {
        async fn check(&self, destination: &Url, _cost: u32) -> Result<(), EgressDenied> {
            let host = destination.host_str().unwrap_or_default();
            if self.deny.iter().any(|d| d == host) {
                return Err(EgressDenied {
                    destination: destination.to_string(),
                    reason: "not in list".to_string(),
                    fatal: self.fatal,
                });
            }
            Ok(())
        }
    }

    pub async fn context(
        limits: ResourceLimits,
        egress: ListEgress,
        safe_mode: bool,
    ) -> (ScanContext, CancellationToken, LogWriter) {
        let db = VigilDb::open_in_memory().await.unwrap();
        let run_id = RunId::new();
        let job_id = JobId::new();
        let (sink, writer) = spawn_log_writer(
            db,
            run_id.clone(),
            job_id.clone(),
            limits.max_log_lines,
            0,
            Duration::ZERO,
        );
        let cancel = CancellationToken::new();
        let ctx = ScanContext::new(
            run_id,
            job_id,
            safe_mode,
            limits,
            Arc::new(egress),
            cancel.clone(),
            sink,
        );
        (ctx, cancel, writer)
    }
}
