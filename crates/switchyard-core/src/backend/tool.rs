//! Tool collaborator: MCP or other non-inference calls.

use std::future::Future;
use std::pin::Pin;

use serde_json::Value;

use switchyard_types::error::CallError;

/// Dispatches a tool call. Tool calls are not routed.
pub trait ToolBackend: Send + Sync {
    fn call_tool(
        &self,
        tool_id: &str,
        args: &Value,
    ) -> impl Future<Output = Result<Value, CallError>> + Send;
}

/// Object-safe version of [`ToolBackend`] with boxed futures.
pub trait ToolBackendDyn: Send + Sync {
    fn call_tool_boxed<'a>(
        &'a self,
        tool_id: &'a str,
        args: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CallError>> + Send + 'a>>;
}

impl<T: ToolBackend> ToolBackendDyn for T {
    fn call_tool_boxed<'a>(
        &'a self,
        tool_id: &'a str,
        args: &'a Value,
    ) -> Pin<Box<dyn Future<Output = Result<Value, CallError>> + Send + 'a>> {
        Box::pin(self.call_tool(tool_id, args))
    }
}

/// Type-erased tool backend chosen at runtime.
pub struct BoxToolBackend {
    inner: Box<dyn ToolBackendDyn + Send + Sync>,
}

impl BoxToolBackend {
    pub fn new<T: ToolBackend + 'static>(backend: T) -> Self {
        Self {
            inner: Box::new(backend),
        }
    }

    pub async fn call_tool(&self, tool_id: &str, args: &Value) -> Result<Value, CallError> {
        self.inner.call_tool_boxed(tool_id, args).await
    }
}

impl std::fmt::Debug for BoxToolBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BoxToolBackend").finish_non_exhaustive()
    }
}
