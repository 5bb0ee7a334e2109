//! Offchain runtime: event-driven job execution over a bounded worker pool.

pub mod app;
pub mod chain;
pub mod config;
pub mod context;
pub mod error;
pub mod job;
pub mod logger;
pub mod manager;
pub mod worker;

pub use app::BaseApp;
pub use config::RuntimeConfig;
pub use context::Context;
pub use error::{Error, Result};
pub use job::{Capability, Input, Job, JobKind, RetryPolicy};
pub use logger::Logger;
pub use manager::JobManager;
