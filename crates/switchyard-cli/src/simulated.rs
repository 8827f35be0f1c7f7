//! Simulated collaborators used by `syard run`.
//!
//! Inference calls sleep for the node's configured latency and echo the
//! payload back; tool calls echo immediately. Nothing leaves the process.

use std::collections::HashMap;
use std::time::Duration;

use serde_json::{Value, json};
use tokio_util::sync::CancellationToken;

use switchyard_core::backend::{InferenceBackend, ToolBackend};
use switchyard_types::config::NodeConfig;
use switchyard_types::error::CallError;
use switchyard_types::node::ModelNode;

/// Latency used for nodes without `simulated_latency_ms`.
const DEFAULT_LATENCY_MS: u64 = 25;

#[derive(Debug, Clone, Default)]
pub struct SimulatedInference {
    latency_ms: HashMap<String, u64>,
}

impl SimulatedInference {
    pub fn from_nodes(nodes: &[NodeConfig]) -> Self {
        Self {
            latency_ms: nodes
                .iter()
                .filter_map(|n| n.simulated_latency_ms.map(|ms| (n.id.clone(), ms)))
                .collect(),
        }
    }

    fn latency(&self, node_id: &str) -> Duration {
        Duration::from_millis(
            self.latency_ms
                .get(node_id)
                .copied()
                .unwrap_or(DEFAULT_LATENCY_MS),
        )
    }
}

impl InferenceBackend for SimulatedInference {
    async fn invoke(
        &self,
        node: &ModelNode,
        payload: &Value,
        cancel: CancellationToken,
    ) -> Result<Value, CallError> {
        tokio::select! {
            _ = tokio::time::sleep(self.latency(&node.node_id)) => {}
            _ = cancel.cancelled() => {
                return Err(CallError::Unavailable("call cancelled".to_string()));
            }
        }
        Ok(json!({
            "node": node.node_id,
            "endpoint": node.endpoint_ref,
            "echo": payload,
        }))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SimulatedTools;

impl ToolBackend for SimulatedTools {
    async fn call_tool(&self, tool_id: &str, args: &Value) -> Result<Value, CallError> {
        Ok(json!({ "tool": tool_id, "echo": args }))
    }
}
