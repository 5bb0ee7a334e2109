//! Execution side of the runtime.
//!
//! - `unit`: execution units and their results
//! - `pool`: fixed-size worker pool with bounded intake
//! - `results`: result consumer and sinks

pub mod pool;
pub mod results;
pub mod unit;

pub use pool::WorkerPool;
pub use results::{CollectingSink, LogSink, ResultSink, spawn_result_consumer};
pub use unit::{ExecutionUnit, JobResult};
