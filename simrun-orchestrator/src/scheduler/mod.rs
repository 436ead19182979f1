//! Admission and scheduling primitives
//!
//! The pending queue decides which queued job is next in line; the retry
//! policy decides how a job hit by a worker fault is retried. The dispatch
//! loop that drives both lives in the orchestrator.

mod queue;
mod retry;

pub use queue::{PendingQueue, QueuedEntry};
pub use retry::RetryPolicy;
