//! Execution units and their results.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::context::Context;
use crate::error::JobError;
use crate::job::{Input, JobKind};

/// "Run job J with optional input I under context C."
///
/// Built by a driver at activation time and consumed exactly once by a worker.
#[derive(Debug)]
pub struct ExecutionUnit {
    id: Uuid,
    job: JobKind,
    input: Option<Input>,
    ctx: Context,
    created_at: DateTime<Utc>,
}

impl ExecutionUnit {
    /// Build a unit with its own context derived from `ctx`.
    pub fn new(ctx: &Context, job: JobKind, input: Option<Input>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            ctx: ctx.derive(id),
            job,
            input,
            created_at: Utc::now(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn job_id(&self) -> &str {
        self.job.id()
    }

    pub fn input(&self) -> Option<&Input> {
        self.input.as_ref()
    }

    pub fn context(&self) -> &Context {
        &self.ctx
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// Run the job, consuming the unit. Cancelling the unit's context
    /// abandons the execution with [`JobError::Cancelled`].
    pub async fn execute(self) -> JobResult {
        let started_at = Utc::now();
        let job_id = self.job.id().to_string();
        let outcome = tokio::select! {
            biased;
            _ = self.ctx.cancelled() => Err(JobError::Cancelled { job: job_id.clone() }),
            outcome = self.job.execute(&self.ctx, self.input) => outcome,
        };
        JobResult {
            unit_id: self.id,
            job_id,
            outcome,
            started_at,
            finished_at: Utc::now(),
        }
    }

    /// Result for a unit that will never run.
    pub(crate) fn into_failure(self, error: JobError) -> JobResult {
        let now = Utc::now();
        JobResult {
            unit_id: self.id,
            job_id: self.job.id().to_string(),
            outcome: Err(error),
            started_at: now,
            finished_at: now,
        }
    }
}

/// Outcome of one execution.
#[derive(Debug, Clone)]
pub struct JobResult {
    pub unit_id: Uuid,
    pub job_id: String,
    pub outcome: Result<serde_json::Value, JobError>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl JobResult {
    pub fn is_ok(&self) -> bool {
        self.outcome.is_ok()
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::chain::InMemoryChain;
    use crate::job::{Conditional, Job};
    use crate::logger::Logger;

    struct Sleepy;

    #[async_trait]
    impl Job for Sleepy {
        fn id(&self) -> &str {
            "sleepy"
        }

        async fn execute(
            &self,
            ctx: &Context,
            input: Option<Input>,
        ) -> Result<serde_json::Value, JobError> {
            if let Some(Input::Value(v)) = input {
                return Ok(serde_json::json!({ "echo": v, "unit": ctx.activation() }));
            }
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(serde_json::Value::Null)
        }
    }

    #[async_trait]
    impl Conditional for Sleepy {
        async fn condition(&self, _ctx: &Context) -> bool {
            true
        }
    }

    fn root() -> Context {
        Context::new(Arc::new(InMemoryChain::new()), Logger::disabled())
    }

    #[tokio::test]
    async fn unit_runs_under_its_own_context() {
        let ctx = root();
        let unit = ExecutionUnit::new(
            &ctx,
            JobKind::conditional(Sleepy),
            Some(Input::Value(serde_json::json!(7))),
        );
        let unit_id = unit.id();
        assert_eq!(unit.context().activation(), Some(unit_id));

        let result = unit.execute().await;
        assert_eq!(result.unit_id, unit_id);
        assert_eq!(result.job_id, "sleepy");
        let value = result.outcome.unwrap();
        assert_eq!(value["echo"], 7);
        assert_eq!(value["unit"], serde_json::json!(unit_id));
    }

    #[tokio::test]
    async fn root_cancellation_abandons_execution() {
        let ctx = root();
        let unit = ExecutionUnit::new(&ctx, JobKind::conditional(Sleepy), None);
        ctx.cancel();
        let result = unit.execute().await;
        assert_eq!(
            result.outcome,
            Err(JobError::Cancelled {
                job: "sleepy".into()
            })
        );
    }
}
