//! Simrun Core
//!
//! Core types for the simrun simulation job orchestrator.
//!
//! This crate contains:
//! - Domain types: simulation jobs, their state machine, artifacts and log lines
//! - DTOs: submission requests and job summaries used by front ends

pub mod domain;
pub mod dto;
