//! Application shell: wires chain, logger and config into a running job set.

use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::chain::Chain;
use crate::config::RuntimeConfig;
use crate::context::Context;
use crate::error::{Error, PoolError, Result};
use crate::job::JobKind;
use crate::logger::Logger;
use crate::manager::JobManager;
use crate::worker::results::DEFAULT_RESULT_BUFFER;
use crate::worker::{JobResult, ResultSink, WorkerPool, spawn_result_consumer};

enum Lifecycle {
    Idle,
    Running {
        ctx: Context,
        consumer: JoinHandle<usize>,
    },
    Stopped,
}

/// A job set plus the pool that executes it.
pub struct BaseApp {
    config: RuntimeConfig,
    chain: Arc<dyn Chain>,
    logger: Logger,
    manager: JobManager,
    pool: Arc<WorkerPool>,
    sink: Arc<dyn ResultSink>,
    outtake: Mutex<Option<mpsc::Receiver<JobResult>>>,
    lifecycle: Mutex<Lifecycle>,
}

impl BaseApp {
    pub fn new(
        config: RuntimeConfig,
        chain: Arc<dyn Chain>,
        jobs: Vec<JobKind>,
        sink: Arc<dyn ResultSink>,
    ) -> Self {
        let logger = Logger::new(format!("{}-app", config.name));
        let (results_tx, results_rx) = mpsc::channel(DEFAULT_RESULT_BUFFER);
        let pool = Arc::new(
            WorkerPool::new(
                format!("{}-execution", config.name),
                config.workers,
                logger.with(format!("{}-execution", config.name)),
                results_tx,
            )
            .with_execution_timeout(config.execution_timeout),
        );
        let manager = JobManager::new(jobs, Arc::clone(&pool), logger.with("job-manager"))
            .with_condition_poll_interval(config.condition_poll_interval);

        Self {
            config,
            chain,
            logger,
            manager,
            pool,
            sink,
            outtake: Mutex::new(Some(results_rx)),
            lifecycle: Mutex::new(Lifecycle::Idle),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn logger(&self) -> &Logger {
        &self.logger
    }

    pub fn manager(&self) -> &JobManager {
        &self.manager
    }

    pub fn pool(&self) -> &Arc<WorkerPool> {
        &self.pool
    }

    /// The root context, once started.
    pub async fn context(&self) -> Option<Context> {
        match &*self.lifecycle.lock().await {
            Lifecycle::Running { ctx, .. } => Some(ctx.clone()),
            _ => None,
        }
    }

    /// Build the root context and start the pool, the result consumer and
    /// the job drivers. Returns once everything is spawned.
    ///
    /// A job without an activation capability aborts startup with nothing
    /// left running. Any later startup failure tears down whatever was
    /// started and leaves the app stopped.
    pub async fn start(&self) -> Result<()> {
        let mut lifecycle = self.lifecycle.lock().await;
        match *lifecycle {
            Lifecycle::Idle => {}
            Lifecycle::Running { .. } => {
                info!(parent: self.logger.span(), "App already started");
                return Ok(());
            }
            Lifecycle::Stopped => return Err(PoolError::Stopped.into()),
        }
        info!(parent: self.logger.span(), "Starting app");

        self.manager.validate()?;

        let outtake = self
            .outtake
            .lock()
            .await
            .take()
            .ok_or(PoolError::Stopped)?;
        let ctx = Context::new(Arc::clone(&self.chain), self.logger.clone());
        let consumer = spawn_result_consumer(
            outtake,
            Arc::clone(&self.sink),
            self.logger.with("results"),
        );

        let started = match self.pool.start().await {
            Ok(()) => self.manager.start(&ctx).await.map_err(Error::from),
            Err(e) => Err(e.into()),
        };
        let drivers = match started {
            Ok(drivers) => drivers,
            Err(e) => {
                error!(parent: self.logger.span(), error = %e, "App failed to start");
                *lifecycle = Lifecycle::Stopped;
                self.teardown(&ctx, consumer).await;
                return Err(e);
            }
        };
        info!(
            parent: self.logger.span(),
            drivers,
            workers = self.pool.size(),
            "App started"
        );

        *lifecycle = Lifecycle::Running { ctx, consumer };
        Ok(())
    }

    /// Cancel the root context, let drivers wind down, stop the pool and
    /// flush remaining results. Safe to call more than once.
    pub async fn stop(&self) {
        let mut lifecycle = self.lifecycle.lock().await;
        let (ctx, consumer) = match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Running { ctx, consumer } => (ctx, consumer),
            Lifecycle::Idle | Lifecycle::Stopped => return,
        };
        info!(parent: self.logger.span(), "Stopping app");

        if let Some(handled) = self.teardown(&ctx, consumer).await {
            info!(parent: self.logger.span(), handled, "App stopped");
        }
    }

    async fn teardown(&self, ctx: &Context, consumer: JoinHandle<usize>) -> Option<usize> {
        ctx.cancel();
        self.manager.shutdown(self.config.shutdown_grace).await;
        self.pool.stop().await;

        match consumer.await {
            Ok(handled) => Some(handled),
            Err(e) => {
                error!(parent: self.logger.span(), error = %e, "Result consumer failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::chain::InMemoryChain;
    use crate::error::{ConfigError, JobError};
    use crate::job::{Input, Job, Polling};
    use crate::worker::CollectingSink;

    struct Heartbeat;

    #[async_trait]
    impl Job for Heartbeat {
        fn id(&self) -> &str {
            "heartbeat"
        }

        async fn execute(
            &self,
            _ctx: &Context,
            _input: Option<Input>,
        ) -> std::result::Result<serde_json::Value, JobError> {
            Ok(serde_json::json!("beat"))
        }
    }

    impl Polling for Heartbeat {
        fn interval(&self, _ctx: &Context) -> Duration {
            Duration::from_millis(10)
        }
    }

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            name: "test".into(),
            workers: 2,
            shutdown_grace: Duration::from_secs(1),
            ..RuntimeConfig::default()
        }
    }

    #[tokio::test]
    async fn runs_and_flushes_results_on_stop() {
        let sink = CollectingSink::new();
        let app = BaseApp::new(
            config(),
            Arc::new(InMemoryChain::new()),
            vec![JobKind::polling(Heartbeat)],
            sink.clone(),
        );
        assert_eq!(app.name(), "test");
        assert!(app.context().await.is_none());

        app.start().await.unwrap();
        assert!(app.context().await.is_some());
        tokio::time::sleep(Duration::from_millis(100)).await;

        app.stop().await;
        app.stop().await;
        assert!(!sink.is_empty().await);
        assert!(sink.results().await.iter().all(|r| r.job_id == "heartbeat"));
        assert!(!app.pool().is_running().await);
    }

    #[tokio::test]
    async fn capability_less_job_aborts_startup() {
        let app = BaseApp::new(
            config(),
            Arc::new(InMemoryChain::new()),
            vec![JobKind::polling(Heartbeat), JobKind::basic(Heartbeat)],
            CollectingSink::new(),
        );
        let err = app.start().await.unwrap_err();
        assert!(matches!(err, Error::Config(ConfigError::NoCapability { .. })));
        assert!(!app.pool().is_running().await);
        assert!(app.context().await.is_none());
    }

    #[tokio::test]
    async fn failed_start_tears_down_and_refuses_restart() {
        let sink = CollectingSink::new();
        let app = BaseApp::new(
            config(),
            Arc::new(InMemoryChain::new()),
            vec![JobKind::polling(Heartbeat)],
            sink.clone(),
        );
        app.pool().start().await.unwrap();

        let err = app.start().await.unwrap_err();
        assert!(matches!(err, Error::Pool(PoolError::AlreadyStarted)));
        assert!(!app.pool().is_running().await);
        assert!(app.context().await.is_none());

        let err = app.start().await.unwrap_err();
        assert!(matches!(err, Error::Pool(PoolError::Stopped)));
        assert_eq!(app.manager().running_drivers().await, 0);
        assert!(sink.is_empty().await);

        tokio::time::timeout(Duration::from_secs(1), app.stop())
            .await
            .unwrap();
    }
}
