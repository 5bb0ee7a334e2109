//! Fixed-size worker pool.
//!
//! `N` interchangeable workers pull [`ExecutionUnit`]s from a shared intake
//! and publish [`JobResult`]s on an outtake owned by a separate consumer.
//! Submission is bounded by a semaphore of `N` permits: a caller of
//! [`WorkerPool::add_task`] waits until a worker is free, so nothing queues
//! without bound. Workers never read from the outtake.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, error, info, warn};

use crate::error::{JobError, PoolError};
use crate::logger::Logger;
use crate::worker::unit::{ExecutionUnit, JobResult};

/// A unit plus the permit that reserves a worker for it.
type Task = (ExecutionUnit, OwnedSemaphorePermit);

enum PoolState {
    Idle,
    Running(Vec<JoinHandle<()>>),
    Stopped,
}

/// Bounded pool of execution workers.
pub struct WorkerPool {
    name: String,
    size: usize,
    logger: Logger,
    execution_timeout: Option<Duration>,
    permits: Arc<Semaphore>,
    intake_tx: mpsc::Sender<Task>,
    intake_rx: Arc<Mutex<mpsc::Receiver<Task>>>,
    outtake: Mutex<Option<mpsc::Sender<JobResult>>>,
    stop: CancellationToken,
    state: Mutex<PoolState>,
}

impl WorkerPool {
    /// Create a pool of `size` workers publishing results on `outtake`.
    pub fn new(
        name: impl Into<String>,
        size: usize,
        logger: Logger,
        outtake: mpsc::Sender<JobResult>,
    ) -> Self {
        let size = size.max(1);
        let (intake_tx, intake_rx) = mpsc::channel(size);
        Self {
            name: name.into(),
            size,
            logger,
            execution_timeout: None,
            permits: Arc::new(Semaphore::new(size)),
            intake_tx,
            intake_rx: Arc::new(Mutex::new(intake_rx)),
            outtake: Mutex::new(Some(outtake)),
            stop: CancellationToken::new(),
            state: Mutex::new(PoolState::Idle),
        }
    }

    /// Abandon executions that run longer than `timeout`.
    pub fn with_execution_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.execution_timeout = timeout;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Units currently reserved by or running on a worker.
    pub fn busy(&self) -> usize {
        self.size - self.permits.available_permits()
    }

    pub async fn is_running(&self) -> bool {
        matches!(*self.state.lock().await, PoolState::Running(_))
    }

    /// Bring up the workers.
    pub async fn start(&self) -> Result<(), PoolError> {
        let mut state = self.state.lock().await;
        match *state {
            PoolState::Running(_) => return Err(PoolError::AlreadyStarted),
            PoolState::Stopped => return Err(PoolError::Stopped),
            PoolState::Idle => {}
        }

        let outtake = self
            .outtake
            .lock()
            .await
            .clone()
            .ok_or(PoolError::Stopped)?;

        let handles = (0..self.size as u32)
            .map(|id| {
                let logger = self.logger.with(format!("worker-{id}"));
                let span = logger.span().clone();
                let worker = Worker {
                    id,
                    intake: Arc::clone(&self.intake_rx),
                    outtake: outtake.clone(),
                    stop: self.stop.clone(),
                    execution_timeout: self.execution_timeout,
                };
                tokio::spawn(worker.run().instrument(span))
            })
            .collect();

        *state = PoolState::Running(handles);
        info!(parent: self.logger.span(), pool = %self.name, workers = self.size, "Worker pool started");
        Ok(())
    }

    /// Submit a unit, waiting for a free worker if all are busy.
    ///
    /// Fails with [`PoolError::Stopped`] once the pool is stopping, including
    /// for callers already waiting when `stop` is called.
    pub async fn add_task(&self, unit: ExecutionUnit) -> Result<(), PoolError> {
        match *self.state.lock().await {
            PoolState::Idle => return Err(PoolError::NotStarted),
            PoolState::Stopped => return Err(PoolError::Stopped),
            PoolState::Running(_) => {}
        }

        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Stopped)?;

        debug!(parent: self.logger.span(), unit = %unit.id(), job = %unit.job_id(), "Unit submitted");
        self.intake_tx
            .send((unit, permit))
            .await
            .map_err(|_| PoolError::Stopped)
    }

    /// Stop all workers. In-flight executions finish; units that were handed
    /// over but never started are published as [`JobError::Rejected`].
    /// Safe to call more than once.
    pub async fn stop(&self) {
        let handles = {
            let mut state = self.state.lock().await;
            match std::mem::replace(&mut *state, PoolState::Stopped) {
                PoolState::Running(handles) => handles,
                PoolState::Idle => Vec::new(),
                PoolState::Stopped => return,
            }
        };

        info!(parent: self.logger.span(), pool = %self.name, "Stopping worker pool");
        self.permits.close();
        self.stop.cancel();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(parent: self.logger.span(), error = %e, "Worker task failed");
            }
        }

        let outtake = self.outtake.lock().await.take();
        let mut intake = self.intake_rx.lock().await;
        intake.close();
        let mut rejected = 0usize;
        while let Ok((unit, _permit)) = intake.try_recv() {
            rejected += 1;
            let job = unit.job_id().to_string();
            warn!(parent: self.logger.span(), unit = %unit.id(), job = %job, "Rejecting unit queued at shutdown");
            if let Some(tx) = &outtake {
                let _ = tx.send(unit.into_failure(JobError::Rejected { job })).await;
            }
        }

        info!(parent: self.logger.span(), pool = %self.name, rejected, "Worker pool stopped");
    }
}

/// One execution worker.
struct Worker {
    id: u32,
    intake: Arc<Mutex<mpsc::Receiver<Task>>>,
    outtake: mpsc::Sender<JobResult>,
    stop: CancellationToken,
    execution_timeout: Option<Duration>,
}

impl Worker {
    async fn run(self) {
        info!(worker = self.id, "Starting");
        loop {
            let task = tokio::select! {
                biased;
                _ = self.stop.cancelled() => {
                    info!(worker = self.id, "Stopping worker");
                    return;
                }
                task = async { self.intake.lock().await.recv().await } => task,
            };

            let Some((unit, permit)) = task else {
                error!(worker = self.id, "Intake closed, worker exiting");
                return;
            };

            debug!(worker = self.id, unit = %unit.id(), job = %unit.job_id(), "Executing job");
            let result = self.execute(unit).await;
            match &result.outcome {
                Ok(_) => debug!(worker = self.id, job = %result.job_id, "Job succeeded"),
                Err(e) => warn!(worker = self.id, job = %result.job_id, error = %e, "Job failed"),
            }

            drop(permit);
            if self.outtake.send(result).await.is_err() {
                warn!(worker = self.id, "Result consumer gone, dropping result");
            }
        }
    }

    async fn execute(&self, unit: ExecutionUnit) -> JobResult {
        let unit_id = unit.id();
        let job = unit.job_id().to_string();
        let ctx = unit.context().clone();
        let started_at = Utc::now();

        let run = AssertUnwindSafe(unit.execute()).catch_unwind();
        let caught = match self.execution_timeout {
            None => run.await,
            Some(timeout) => match tokio::time::timeout(timeout, run).await {
                Ok(caught) => caught,
                Err(_) => {
                    ctx.cancel();
                    return JobResult {
                        unit_id,
                        outcome: Err(JobError::Timeout {
                            job: job.clone(),
                            timeout,
                        }),
                        job_id: job,
                        started_at,
                        finished_at: Utc::now(),
                    };
                }
            },
        };

        caught.unwrap_or_else(|panic| JobResult {
            unit_id,
            outcome: Err(JobError::Panicked {
                job: job.clone(),
                message: panic_message(&*panic),
            }),
            job_id: job,
            started_at,
            finished_at: Utc::now(),
        })
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::sync::Notify;
    use tokio::time::timeout;

    use super::*;
    use crate::chain::InMemoryChain;
    use crate::context::Context;
    use crate::job::{Input, Job, JobKind, Polling};

    const TEST_TIMEOUT: Duration = Duration::from_secs(5);

    /// Blocks until released, tracking peak concurrency.
    struct Gate {
        release: Arc<Notify>,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Job for Gate {
        fn id(&self) -> &str {
            "gate"
        }

        async fn execute(
            &self,
            _ctx: &Context,
            _input: Option<Input>,
        ) -> Result<serde_json::Value, JobError> {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            self.release.notified().await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(serde_json::Value::Null)
        }
    }

    impl Polling for Gate {
        fn interval(&self, _ctx: &Context) -> Duration {
            Duration::from_secs(1)
        }
    }

    struct Boom;

    #[async_trait]
    impl Job for Boom {
        fn id(&self) -> &str {
            "boom"
        }

        async fn execute(
            &self,
            _ctx: &Context,
            _input: Option<Input>,
        ) -> Result<serde_json::Value, JobError> {
            panic!("kaboom");
        }
    }

    struct Stuck;

    #[async_trait]
    impl Job for Stuck {
        fn id(&self) -> &str {
            "stuck"
        }

        async fn execute(
            &self,
            _ctx: &Context,
            _input: Option<Input>,
        ) -> Result<serde_json::Value, JobError> {
            std::future::pending().await
        }
    }

    fn root() -> Context {
        Context::new(Arc::new(InMemoryChain::new()), Logger::disabled())
    }

    fn pool(size: usize) -> (WorkerPool, mpsc::Receiver<JobResult>) {
        let (tx, rx) = mpsc::channel(64);
        (WorkerPool::new("test", size, Logger::disabled(), tx), rx)
    }

    #[tokio::test]
    async fn rejects_work_before_start() {
        let (pool, _rx) = pool(2);
        let unit = ExecutionUnit::new(&root(), JobKind::basic(Boom), None);
        assert_eq!(pool.add_task(unit).await, Err(PoolError::NotStarted));
    }

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let (pool, _rx) = pool(1);
        pool.start().await.unwrap();
        assert_eq!(pool.start().await, Err(PoolError::AlreadyStarted));
        pool.stop().await;
        assert_eq!(pool.start().await, Err(PoolError::Stopped));
    }

    #[tokio::test]
    async fn saturation_blocks_the_extra_submitter() {
        let ctx = root();
        let release = Arc::new(Notify::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let job = JobKind::Polling(Arc::new(Gate {
            release: Arc::clone(&release),
            running: Arc::clone(&running),
            peak: Arc::clone(&peak),
        }));

        let (pool, mut results) = pool(3);
        let pool = Arc::new(pool);
        pool.start().await.unwrap();

        for _ in 0..3 {
            timeout(TEST_TIMEOUT, pool.add_task(ExecutionUnit::new(&ctx, job.clone(), None)))
                .await
                .unwrap()
                .unwrap();
        }

        let extra = {
            let pool = Arc::clone(&pool);
            let unit = ExecutionUnit::new(&ctx, job.clone(), None);
            tokio::spawn(async move { pool.add_task(unit).await })
        };

        // All three workers busy: the fourth submission must still be waiting.
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(running.load(Ordering::SeqCst), 3);
        assert!(!extra.is_finished());

        release.notify_one();
        timeout(TEST_TIMEOUT, extra).await.unwrap().unwrap().unwrap();

        // Drain the remaining units.
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            release.notify_one();
        }
        for _ in 0..4 {
            let result = timeout(TEST_TIMEOUT, results.recv()).await.unwrap().unwrap();
            assert!(result.is_ok());
        }
        assert_eq!(peak.load(Ordering::SeqCst), 3);
        pool.stop().await;
    }

    #[tokio::test]
    async fn panics_become_failed_results() {
        let (pool, mut results) = pool(1);
        pool.start().await.unwrap();
        pool.add_task(ExecutionUnit::new(&root(), JobKind::basic(Boom), None))
            .await
            .unwrap();

        let result = timeout(TEST_TIMEOUT, results.recv()).await.unwrap().unwrap();
        assert_eq!(
            result.outcome,
            Err(JobError::Panicked {
                job: "boom".into(),
                message: "kaboom".into()
            })
        );

        // The worker survived the panic.
        pool.add_task(ExecutionUnit::new(&root(), JobKind::basic(Boom), None))
            .await
            .unwrap();
        assert!(timeout(TEST_TIMEOUT, results.recv()).await.unwrap().is_some());
        pool.stop().await;
    }

    #[tokio::test]
    async fn execution_timeout_frees_the_worker() {
        let (tx, mut results) = mpsc::channel(8);
        let pool = WorkerPool::new("test", 1, Logger::disabled(), tx)
            .with_execution_timeout(Some(Duration::from_millis(50)));
        pool.start().await.unwrap();

        let unit = ExecutionUnit::new(&root(), JobKind::basic(Stuck), None);
        let unit_ctx = unit.context().clone();
        pool.add_task(unit).await.unwrap();

        let result = timeout(TEST_TIMEOUT, results.recv()).await.unwrap().unwrap();
        assert!(matches!(result.outcome, Err(JobError::Timeout { .. })));
        assert!(unit_ctx.is_cancelled());
        assert_eq!(pool.busy(), 0);
        pool.stop().await;
    }

    #[tokio::test]
    async fn stop_rejects_later_submissions_and_closes_outtake() {
        let (pool, mut results) = pool(2);
        pool.start().await.unwrap();
        pool.stop().await;
        pool.stop().await;

        let unit = ExecutionUnit::new(&root(), JobKind::basic(Boom), None);
        assert_eq!(pool.add_task(unit).await, Err(PoolError::Stopped));
        assert!(!pool.is_running().await);
        assert!(timeout(TEST_TIMEOUT, results.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_waits_for_in_flight_and_unblocks_waiters() {
        let ctx = root();
        let release = Arc::new(Notify::new());
        let job = JobKind::Polling(Arc::new(Gate {
            release: Arc::clone(&release),
            running: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
        }));

        let (pool, mut results) = pool(1);
        let pool = Arc::new(pool);
        pool.start().await.unwrap();
        pool.add_task(ExecutionUnit::new(&ctx, job.clone(), None))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let waiter = {
            let pool = Arc::clone(&pool);
            let unit = ExecutionUnit::new(&ctx, job.clone(), None);
            tokio::spawn(async move { pool.add_task(unit).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let stopper = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move { pool.stop().await })
        };

        assert_eq!(
            timeout(TEST_TIMEOUT, waiter).await.unwrap().unwrap(),
            Err(PoolError::Stopped)
        );

        // The in-flight unit still completes and is reported.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!stopper.is_finished());
        release.notify_one();
        timeout(TEST_TIMEOUT, stopper).await.unwrap().unwrap();

        let result = timeout(TEST_TIMEOUT, results.recv()).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert!(timeout(TEST_TIMEOUT, results.recv()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn stop_publishes_queued_units_as_rejected() {
        let running = Arc::new(AtomicUsize::new(0));
        let job = JobKind::Polling(Arc::new(Gate {
            release: Arc::new(Notify::new()),
            running: Arc::clone(&running),
            peak: Arc::new(AtomicUsize::new(0)),
        }));
        let (pool, mut results) = pool(1);
        pool.start().await.unwrap();
        // Let the worker park on the intake.
        tokio::task::yield_now().await;

        // Single-threaded runtime: the worker cannot pick the unit up before
        // stop() signals it, so the unit is still queued when the pool stops.
        let unit = ExecutionUnit::new(&root(), job, None);
        let unit_id = unit.id();
        pool.add_task(unit).await.unwrap();
        pool.stop().await;

        let result = timeout(TEST_TIMEOUT, results.recv()).await.unwrap().unwrap();
        assert_eq!(result.unit_id, unit_id);
        assert_eq!(
            result.outcome,
            Err(JobError::Rejected {
                job: "gate".to_string()
            })
        );
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert!(timeout(TEST_TIMEOUT, results.recv()).await.unwrap().is_none());
    }
}
