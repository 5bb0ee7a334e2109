//! Job capability model.
//!
//! A job is domain logic behind [`Job::execute`]. How often it runs is
//! decided by exactly one activation capability:
//! - [`Polling`]: fixed interval timer
//! - [`Conditional`]: one-shot, once a predicate holds
//! - [`Subscribable`]: once per value pushed on a channel
//! - [`EthSubscribable`]: once per chain log, with a fallible subscription
//!
//! Jobs are registered as a [`JobKind`], a closed set of variants that the
//! manager dispatches with a single `match`.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::chain::{Log, Subscription};
use crate::context::Context;
use crate::error::{ChainError, JobError};

/// Input handed to an execution, if the activation carried one.
#[derive(Debug, Clone, PartialEq)]
pub enum Input {
    Value(serde_json::Value),
    Log(Log),
}

/// Domain logic run by a worker.
#[async_trait]
pub trait Job: Send + Sync {
    /// Unique identity of the job within a job set.
    fn id(&self) -> &str;

    async fn execute(
        &self,
        ctx: &Context,
        input: Option<Input>,
    ) -> Result<serde_json::Value, JobError>;
}

/// Reactivates on a fixed timer.
pub trait Polling: Job {
    fn interval(&self, ctx: &Context) -> Duration;
}

/// Reactivates once, the first time the predicate holds.
#[async_trait]
pub trait Conditional: Job {
    async fn condition(&self, ctx: &Context) -> bool;
}

/// Reactivates once per value emitted on its subscription channel.
#[async_trait]
pub trait Subscribable: Job {
    async fn subscribe(&self, ctx: &Context) -> Result<mpsc::Receiver<serde_json::Value>, JobError>;

    async fn unsubscribe(&self, ctx: &Context);
}

/// Reactivates once per chain log. The subscription itself can fail.
#[async_trait]
pub trait EthSubscribable: Job {
    async fn subscribe(
        &self,
        ctx: &Context,
    ) -> Result<(Subscription, mpsc::Receiver<Log>), ChainError>;

    async fn unsubscribe(&self, ctx: &Context);

    /// How the driver recovers from subscription failures.
    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
    }
}

/// Bounded exponential backoff for resubscribing after a failure.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Give up on the first failure.
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (1-based), capped at `max_backoff`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = self.multiplier.max(1.0).powi(attempt.saturating_sub(1) as i32);
        let millis = (self.initial_backoff.as_millis() as f64 * exp)
            .min(self.max_backoff.as_millis() as f64);
        Duration::from_millis(millis as u64)
    }

    /// Backoff with up to 10% random jitter added, still capped.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.backoff(attempt);
        let jitter_cap = (base.as_millis() / 10) as u64;
        let jitter = if jitter_cap == 0 {
            0
        } else {
            rand::random::<u64>() % (jitter_cap + 1)
        };
        (base + Duration::from_millis(jitter)).min(self.max_backoff)
    }
}

/// Which activation a job uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    Polling,
    Conditional,
    Subscribable,
    EthSubscribable,
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Polling => "polling",
            Self::Conditional => "conditional",
            Self::Subscribable => "subscribable",
            Self::EthSubscribable => "eth-subscribable",
        };
        f.write_str(name)
    }
}

/// A registered job tagged with its activation capability.
///
/// `Basic` holds a job with no activation capability; the manager refuses to
/// start with one in its job set.
#[derive(Clone)]
pub enum JobKind {
    Polling(Arc<dyn Polling>),
    Conditional(Arc<dyn Conditional>),
    Subscribable(Arc<dyn Subscribable>),
    EthSubscribable(Arc<dyn EthSubscribable>),
    Basic(Arc<dyn Job>),
}

impl JobKind {
    pub fn polling(job: impl Polling + 'static) -> Self {
        Self::Polling(Arc::new(job))
    }

    pub fn conditional(job: impl Conditional + 'static) -> Self {
        Self::Conditional(Arc::new(job))
    }

    pub fn subscribable(job: impl Subscribable + 'static) -> Self {
        Self::Subscribable(Arc::new(job))
    }

    pub fn eth_subscribable(job: impl EthSubscribable + 'static) -> Self {
        Self::EthSubscribable(Arc::new(job))
    }

    pub fn basic(job: impl Job + 'static) -> Self {
        Self::Basic(Arc::new(job))
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Polling(job) => job.id(),
            Self::Conditional(job) => job.id(),
            Self::Subscribable(job) => job.id(),
            Self::EthSubscribable(job) => job.id(),
            Self::Basic(job) => job.id(),
        }
    }

    pub fn capability(&self) -> Option<Capability> {
        match self {
            Self::Polling(_) => Some(Capability::Polling),
            Self::Conditional(_) => Some(Capability::Conditional),
            Self::Subscribable(_) => Some(Capability::Subscribable),
            Self::EthSubscribable(_) => Some(Capability::EthSubscribable),
            Self::Basic(_) => None,
        }
    }

    /// Run the job's domain logic.
    pub async fn execute(
        &self,
        ctx: &Context,
        input: Option<Input>,
    ) -> Result<serde_json::Value, JobError> {
        match self {
            Self::Polling(job) => job.execute(ctx, input).await,
            Self::Conditional(job) => job.execute(ctx, input).await,
            Self::Subscribable(job) => job.execute(ctx, input).await,
            Self::EthSubscribable(job) => job.execute(ctx, input).await,
            Self::Basic(job) => job.execute(ctx, input).await,
        }
    }
}

impl fmt::Debug for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobKind")
            .field("id", &self.id())
            .field("capability", &self.capability())
            .finish()
    }
}
