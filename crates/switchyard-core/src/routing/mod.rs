pub mod registry;
pub mod router;

pub use registry::NodeRegistry;
pub use router::InferenceRouter;
