//! Collaborator traits for the calls the core dispatches but never makes
//! itself: model inference and tool invocation.
//!
//! Each trait uses RPITIT for zero-cost static dispatch, with an object-safe
//! `*Dyn` companion (blanket-implemented) and a `Box*` wrapper so the
//! orchestrator can hold implementations chosen at runtime.

pub mod inference;
pub mod tool;

pub use inference::{BoxInferenceBackend, InferenceBackend, InferenceBackendDyn};
pub use tool::{BoxToolBackend, ToolBackend, ToolBackendDyn};

#[cfg(test)]
pub(crate) mod scripted;
