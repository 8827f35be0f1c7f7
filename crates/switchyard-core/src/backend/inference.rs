//! Inference collaborator: the actual model call for one node.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use switchyard_types::error::CallError;
use switchyard_types::node::ModelNode;

/// Performs an inference call against a chosen node.
///
/// The core resolves the payload and picks the node; implementations own
/// the provider wire protocol. `cancel` fires when the stage times out, and
/// implementations should abandon the request promptly when it does.
pub trait InferenceBackend: Send + Sync {
    fn invoke(
        &self,
        node: &ModelNode,
        payload: &Value,
        cancel: CancellationToken,
    ) -> impl Future<Output = Result<Value, CallError>> + Send;
}

/// Object-safe version of [`InferenceBackend`] with boxed futures.
pub trait InferenceBackendDyn: Send + Sync {
    fn invoke_boxed<'a>(
        &'a self,
        node: &'a ModelNode,
        payload: &'a Value,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CallError>> + Send + 'a>>;
}

impl<T: InferenceBackend> InferenceBackendDyn for T {
    fn invoke_boxed<'a>(
        &'a self,
        node: &'a ModelNode,
        payload: &'a Value,
        cancel: CancellationToken,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CallError>> + Send + 'a>> {
        Box::pin(self.invoke(node, payload, cancel))
    }
}

/// Type-erased inference backend chosen at runtime.
pub struct BoxInferenceBackend {
    inner: Box<dyn InferenceBackendDyn + Send + Sync>,
}

impl BoxInferenceBackend {
    pub fn new<T: InferenceBackend + 'static>(backend: T) -> Self {
        Self {
            inner: Box::new(backend),
        }
    }

    pub async fn invoke(
        &self,
        node: &ModelNode,
        payload: &Value,
        cancel: CancellationToken,
    ) -> Result<Value, CallError> {
        self.inner.invoke_boxed(node, payload, cancel).await
    }
}

impl std::fmt::Debug for BoxInferenceBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxInferenceBackend").finish_non_exhaustive()
    }
}
