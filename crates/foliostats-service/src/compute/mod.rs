//! Serialized access to the statistics engine.
//!
//! The statistics engine is a single stateful interpreter: scripts share one
//! global namespace, and the engine breaks when entered twice at the same
//! time. All computations therefore go through a [`SerialComputeQueue`],
//! which owns the engine and runs exactly one task at a time, in submission
//! order.
//!
//! The queue deliberately has no retry, backoff, or reordering. A failing
//! script is a caller problem; the queue's only job is mutual exclusion and
//! fairness. Callers that want retries layer them on top.
//!
//! ### Metrics
//!
//! - `compute.queue.submitted`: Tasks entering the queue.
//! - `compute.task.duration`: Timer over each task's execution, tagged with
//!   `status:ok` or `status:err`.
//! - `compute.task.failed`: Counter for tasks that resolved with an error.

mod queue;

pub use queue::SerialComputeQueue;

use futures::future::BoxFuture;
use serde_json::Value;
use thiserror::Error;

/// An error produced by a computation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ComputeError {
    /// The engine ran the script, but the script failed.
    ///
    /// The attached string contains the interpreter's message.
    #[error("script failed: {0}")]
    Script(String),
    /// The queue's driver is gone and the task can never run.
    #[error("the compute queue has been stopped")]
    QueueStopped,
}

/// The statistics interpreter.
///
/// Implementations are stateful and not reentrant: `run_script` takes
/// `&mut self` precisely so that the type system rules out concurrent
/// invocations. The only way to reach an engine in this crate is through a
/// [`SerialComputeQueue`] that owns it.
pub trait ComputeEngine: Send + 'static {
    /// Runs one script with the given JSON input and returns its result.
    fn run_script(
        &mut self,
        source: &str,
        input: Value,
    ) -> BoxFuture<'_, Result<Value, ComputeError>>;
}
