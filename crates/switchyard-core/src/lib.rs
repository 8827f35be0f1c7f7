//! Orchestration core for Switchyard.
//!
//! This crate turns workflow definitions into dependency graphs, schedules
//! their stages under concurrency caps, routes inference calls to backend
//! nodes by live health data, and exposes run status and cancellation. The
//! actual model and tool calls are injected through the traits in
//! [`backend`]; this crate never speaks a provider wire protocol.

pub mod backend;
pub mod clock;
pub mod config;
pub mod event;
pub mod health;
pub mod orchestrator;
pub mod routing;
pub mod run;
pub mod workflow;

pub use orchestrator::{Orchestrator, OrchestratorBuilder};
