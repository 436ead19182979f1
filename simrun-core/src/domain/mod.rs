//! Core domain types
//!
//! These types are shared between the orchestration engine (which mutates and
//! persists them) and front ends such as the CLI (which only read them).

pub mod artifact;
pub mod job;
pub mod log;
