//! Run control: starting, observing, cancelling and retiring pipeline runs.

pub mod registry;

pub use registry::RunRegistry;
