//! Data Transfer Objects
//!
//! Requests accepted by the orchestrator and lightweight views of domain
//! entities used by front ends.

pub mod job;
