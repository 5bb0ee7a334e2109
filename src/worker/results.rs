//! Result delivery.
//!
//! The pool's outtake is read by exactly one consumer routine, which hands
//! every [`JobResult`] to a [`ResultSink`]. Retry or escalation policy for
//! failed executions belongs in the sink.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, warn};

use crate::logger::Logger;
use crate::worker::unit::JobResult;

/// Default outtake capacity.
pub const DEFAULT_RESULT_BUFFER: usize = 256;

/// Receives every result the pool produces.
#[async_trait]
pub trait ResultSink: Send + Sync {
    async fn handle(&self, result: JobResult);
}

/// Logs each result and otherwise discards it.
pub struct LogSink;

#[async_trait]
impl ResultSink for LogSink {
    async fn handle(&self, result: JobResult) {
        let elapsed_ms = result.elapsed().num_milliseconds();
        match &result.outcome {
            Ok(value) => info!(
                job = %result.job_id,
                unit = %result.unit_id,
                elapsed_ms,
                output = %value,
                "Job completed"
            ),
            Err(e) => warn!(
                job = %result.job_id,
                unit = %result.unit_id,
                elapsed_ms,
                error = %e,
                "Job failed"
            ),
        }
    }
}

/// Keeps results in memory. Useful for tests and for embedding callers that
/// poll results themselves.
#[derive(Default)]
pub struct CollectingSink {
    results: RwLock<Vec<JobResult>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn results(&self) -> Vec<JobResult> {
        self.results.read().await.clone()
    }

    pub async fn len(&self) -> usize {
        self.results.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.results.read().await.is_empty()
    }
}

#[async_trait]
impl ResultSink for CollectingSink {
    async fn handle(&self, result: JobResult) {
        self.results.write().await.push(result);
    }
}

/// Spawn the routine that drains the outtake into `sink`.
///
/// It exits once every sender of `outtake` is gone, which happens after the
/// pool has stopped.
pub fn spawn_result_consumer(
    mut outtake: mpsc::Receiver<JobResult>,
    sink: Arc<dyn ResultSink>,
    logger: Logger,
) -> JoinHandle<usize> {
    let span = logger.span().clone();
    tokio::spawn(
        async move {
            debug!("Result consumer started");
            let mut handled = 0usize;
            while let Some(result) = outtake.recv().await {
                sink.handle(result).await;
                handled += 1;
            }
            info!(handled, "Result consumer finished");
            handled
        }
        .instrument(span),
    )
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use uuid::Uuid;

    use super::*;
    use crate::error::JobError;

    fn result(job: &str, ok: bool) -> JobResult {
        JobResult {
            unit_id: Uuid::new_v4(),
            job_id: job.to_string(),
            outcome: if ok {
                Ok(serde_json::json!({"ok": true}))
            } else {
                Err(JobError::failed(job, "nope"))
            },
            started_at: Utc::now(),
            finished_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn consumer_forwards_everything_then_exits() {
        let (tx, rx) = mpsc::channel(8);
        let sink = CollectingSink::new();
        let handle = spawn_result_consumer(rx, sink.clone(), Logger::disabled());

        tx.send(result("a", true)).await.unwrap();
        tx.send(result("b", false)).await.unwrap();
        drop(tx);

        assert_eq!(handle.await.unwrap(), 2);
        let results = sink.results().await;
        assert_eq!(results[0].job_id, "a");
        assert!(results[0].is_ok());
        assert!(!results[1].is_ok());
    }

    #[tokio::test]
    async fn log_sink_accepts_failures() {
        LogSink.handle(result("c", false)).await;
        LogSink.handle(result("c", true)).await;
    }
}
