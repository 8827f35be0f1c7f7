//! Shared domain types for Switchyard.
//!
//! This crate contains the types exchanged between the orchestration core and
//! its callers: workflow definitions, stage and run status, model nodes,
//! routing decisions, transition events, errors, and configuration.
//!
//! No runtime dependencies beyond serde, serde_json, uuid, chrono and thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod node;
pub mod run;
pub mod workflow;
