//! Simrun Orchestrator
//!
//! Supervised execution of simulation jobs on a single host.
//!
//! This crate contains:
//! - Job Store: durable job records (SQLite or in-memory)
//! - Resource Ledger: execution slots committed against host capacity
//! - Scheduler: the pending queue, dispatch and worker-fault retries
//! - Worker Pool and Process Supervisor: running and reaping the engine
//! - Result Collector: artifact discovery and outcome classification
//!
//! [`Orchestrator`] ties the pieces together and is the entry point for
//! front ends.

pub mod collector;
pub mod config;
pub mod db;
pub mod error;
pub mod ledger;
pub mod lock;
pub mod logs;
mod orchestrator;
pub mod repository;
pub mod scheduler;
pub mod script_check;
pub mod supervisor;
pub mod validation;
mod worker;
pub mod workspace;

pub use config::{Config, EngineConfig};
pub use error::{OrchestratorError, Result};
pub use orchestrator::{JobEvent, Orchestrator};
