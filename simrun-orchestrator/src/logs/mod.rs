//! Job log capture and access
//!
//! Engine output is appended to `logs/engine.log` in the job workspace, one
//! JSON-encoded [`LogLine`](simrun_core::domain::log::LogLine) per line.
//! Readers only ever see complete lines, so a reader racing the writer
//! observes a growing prefix of the log.

mod stream;
mod writer;

pub use stream::{LogStream, read_lines, tail};
pub use writer::LogWriter;

/// Upper bound for a tail request
pub const MAX_TAIL_LINES: usize = 10_000;
