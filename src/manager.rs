//! Job manager: one driver routine per job.
//!
//! Each driver watches for its job's activation trigger and submits an
//! [`ExecutionUnit`] to the shared [`WorkerPool`]:
//! - polling: sleep(interval) → submit → repeat
//! - conditional: check the predicate every poll interval, submit once, exit
//! - subscribable: submit once per received value
//! - eth-subscribable: submit once per log, resubscribe with backoff on error
//!
//! Every driver observes cancellation of the ambient context. A driver's
//! failure is logged and ends that driver only.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info, warn};

use crate::context::Context;
use crate::error::ConfigError;
use crate::job::{Conditional, EthSubscribable, Input, JobKind, Polling, RetryPolicy, Subscribable};
use crate::logger::Logger;
use crate::worker::{ExecutionUnit, WorkerPool};

/// Default predicate re-check interval for conditional jobs.
pub const DEFAULT_CONDITION_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Drives a fixed set of jobs.
pub struct JobManager {
    logger: Logger,
    jobs: Vec<JobKind>,
    pool: Arc<WorkerPool>,
    condition_poll_interval: Duration,
    drivers: Mutex<Vec<JoinHandle<()>>>,
    aborted: AtomicUsize,
}

impl JobManager {
    pub fn new(jobs: Vec<JobKind>, pool: Arc<WorkerPool>, logger: Logger) -> Self {
        Self {
            logger,
            jobs,
            pool,
            condition_poll_interval: DEFAULT_CONDITION_POLL_INTERVAL,
            drivers: Mutex::new(Vec::new()),
            aborted: AtomicUsize::new(0),
        }
    }

    pub fn with_condition_poll_interval(mut self, interval: Duration) -> Self {
        self.condition_poll_interval = interval;
        self
    }

    pub fn jobs(&self) -> &[JobKind] {
        &self.jobs
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// Check that every job has an activation capability and a unique id.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();
        for job in &self.jobs {
            if job.capability().is_none() {
                return Err(ConfigError::NoCapability {
                    job: job.id().to_string(),
                });
            }
            if !seen.insert(job.id()) {
                return Err(ConfigError::DuplicateJob {
                    job: job.id().to_string(),
                });
            }
        }
        Ok(())
    }

    /// Spawn one driver per job and return the number spawned.
    ///
    /// Validation happens before anything is spawned, so a misconfigured job
    /// set starts nothing. Does not wait for any activation.
    pub async fn start(&self, ctx: &Context) -> Result<usize, ConfigError> {
        self.validate()?;

        let mut drivers = self.drivers.lock().await;
        if !drivers.is_empty() {
            warn!(parent: self.logger.span(), "Job manager already started");
            return Ok(0);
        }

        for job in &self.jobs {
            let logger = self.logger.with(format!("job-{}", job.id()));
            let span = logger.span().clone();
            let driver = Driver {
                job: job.clone(),
                pool: Arc::clone(&self.pool),
                ctx: ctx.with_logger(logger),
                condition_poll_interval: self.condition_poll_interval,
            };
            drivers.push(tokio::spawn(driver.run().instrument(span)));
        }

        info!(parent: self.logger.span(), drivers = drivers.len(), "Job manager started");
        Ok(drivers.len())
    }

    /// Drivers that have not exited yet.
    pub async fn running_drivers(&self) -> usize {
        self.drivers
            .lock()
            .await
            .iter()
            .filter(|h| !h.is_finished())
            .count()
    }

    /// Drivers that ignored cancellation and had to be aborted by
    /// [`JobManager::shutdown`].
    pub fn aborted_drivers(&self) -> usize {
        self.aborted.load(Ordering::SeqCst)
    }

    /// Wait for drivers to exit, aborting any still running after `grace`.
    ///
    /// Drivers exit when the context passed to [`JobManager::start`] is
    /// cancelled; cancel it before calling this.
    pub async fn shutdown(&self, grace: Duration) {
        let handles = std::mem::take(&mut *self.drivers.lock().await);
        let deadline = tokio::time::Instant::now() + grace;
        let mut aborted = 0usize;

        for mut handle in handles {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(parent: self.logger.span(), error = %e, "Driver task failed"),
                Err(_) => {
                    handle.abort();
                    aborted += 1;
                }
            }
        }

        if aborted > 0 {
            self.aborted.fetch_add(aborted, Ordering::SeqCst);
            warn!(parent: self.logger.span(), aborted, "Aborted drivers that outlived the shutdown grace");
        }
        info!(parent: self.logger.span(), "Job manager stopped");
    }
}

/// Per-job activation loop.
struct Driver {
    job: JobKind,
    pool: Arc<WorkerPool>,
    ctx: Context,
    condition_poll_interval: Duration,
}

/// Why an eth subscription loop ended.
enum SubscriptionExit {
    Cancelled,
    Failed,
    PoolGone,
}

impl Driver {
    async fn run(self) {
        debug!(job = %self.job.id(), "Driver started");
        match self.job.clone() {
            JobKind::Polling(job) => self.drive_polling(job).await,
            JobKind::Conditional(job) => self.drive_conditional(job).await,
            JobKind::Subscribable(job) => self.drive_subscribable(job).await,
            JobKind::EthSubscribable(job) => self.drive_eth_subscribable(job).await,
            JobKind::Basic(_) => error!(job = %self.job.id(), "Job has no activation capability"),
        }
        debug!(job = %self.job.id(), "Driver exited");
    }

    /// Hand a new unit to the pool. Returns `false` when the driver should stop.
    async fn submit(&self, input: Option<Input>) -> bool {
        let unit = ExecutionUnit::new(&self.ctx, self.job.clone(), input);
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => false,
            submitted = self.pool.add_task(unit) => match submitted {
                Ok(()) => true,
                Err(e) => {
                    warn!(job = %self.job.id(), error = %e, "Submission refused, stopping driver");
                    false
                }
            },
        }
    }

    /// Sleep unless cancelled first. Returns `false` on cancellation.
    async fn pause(&self, duration: Duration) -> bool {
        tokio::select! {
            biased;
            _ = self.ctx.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn drive_polling(&self, job: Arc<dyn Polling>) {
        loop {
            if !self.pause(job.interval(&self.ctx)).await {
                return;
            }
            if !self.submit(None).await {
                return;
            }
        }
    }

    async fn drive_conditional(&self, job: Arc<dyn Conditional>) {
        loop {
            if !self.pause(self.condition_poll_interval).await {
                return;
            }
            if job.condition(&self.ctx).await {
                info!(job = %self.job.id(), "Condition met");
                self.submit(None).await;
                return;
            }
        }
    }

    async fn drive_subscribable(&self, job: Arc<dyn Subscribable>) {
        let mut values = match job.subscribe(&self.ctx).await {
            Ok(values) => values,
            Err(e) => {
                error!(job = %self.job.id(), error = %e, "Subscribe failed");
                return;
            }
        };

        loop {
            tokio::select! {
                biased;
                _ = self.ctx.cancelled() => break,
                value = values.recv() => match value {
                    Some(value) => {
                        if !self.submit(Some(Input::Value(value))).await {
                            break;
                        }
                    }
                    None => {
                        info!(job = %self.job.id(), "Subscription channel closed");
                        break;
                    }
                },
            }
        }

        job.unsubscribe(&self.ctx).await;
    }

    async fn drive_eth_subscribable(&self, job: Arc<dyn EthSubscribable>) {
        let policy = job.retry_policy();
        let mut failures = 0u32;

        loop {
            let (mut subscription, mut logs) = match job.subscribe(&self.ctx).await {
                Ok(pair) => pair,
                Err(e) => {
                    failures += 1;
                    error!(job = %self.job.id(), error = %e, attempt = failures, "Subscribe failed");
                    if !self.retry_after_failure(&policy, failures).await {
                        return;
                    }
                    continue;
                }
            };

            let exit = loop {
                tokio::select! {
                    biased;
                    _ = self.ctx.cancelled() => break SubscriptionExit::Cancelled,
                    err = subscription.err() => {
                        error!(job = %self.job.id(), error = %err, "Error in subscription");
                        break SubscriptionExit::Failed;
                    }
                    log = logs.recv() => match log {
                        Some(log) => {
                            failures = 0;
                            if !self.submit(Some(Input::Log(log))).await {
                                break SubscriptionExit::PoolGone;
                            }
                        }
                        None => {
                            warn!(job = %self.job.id(), "Log stream ended");
                            break SubscriptionExit::Failed;
                        }
                    },
                }
            };

            subscription.unsubscribe();
            job.unsubscribe(&self.ctx).await;

            match exit {
                SubscriptionExit::Failed => {
                    failures += 1;
                    if !self.retry_after_failure(&policy, failures).await {
                        return;
                    }
                }
                SubscriptionExit::Cancelled | SubscriptionExit::PoolGone => return,
            }
        }
    }

    /// Wait out the backoff for failure number `failures`. Returns `false`
    /// when the budget is spent or the context is cancelled.
    async fn retry_after_failure(&self, policy: &RetryPolicy, failures: u32) -> bool {
        if failures > policy.max_retries {
            error!(
                job = %self.job.id(),
                max_retries = policy.max_retries,
                "Subscription retries exhausted, stopping driver"
            );
            return false;
        }
        let delay = policy.backoff_with_jitter(failures);
        warn!(
            job = %self.job.id(),
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            "Resubscribing after backoff"
        );
        self.pause(delay).await
    }
}
