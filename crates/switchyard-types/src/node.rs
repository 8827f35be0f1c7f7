//! Backend node types: registration records, routing decisions, and health
//! snapshots.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An external inference backend the router can target.
///
/// Identity is owned by whoever registers the node; the health monitor only
/// attaches statistics keyed by `node_id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelNode {
    /// Unique node identifier (e.g. "anthropic-primary").
    pub node_id: String,
    /// Opaque handle passed through to the inference collaborator.
    pub endpoint_ref: String,
    /// Capability tags advertised by this node (e.g. "chat", "vision").
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Maximum concurrent calls routed to this node (None = unlimited).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_in_flight: Option<u32>,
}

impl ModelNode {
    pub fn new(
        node_id: impl Into<String>,
        endpoint_ref: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            endpoint_ref: endpoint_ref.into(),
            capabilities,
            max_in_flight: None,
        }
    }

    /// Whether the node advertises the given capability.
    pub fn supports(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }
}

/// Why the router chose a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoutingReason {
    /// Best-ranked healthy node (lowest P95, then lowest load).
    HealthyLowestP95,
    /// No healthy node was available; the least-bad node was chosen.
    Failover,
    /// The stage pinned a specific node.
    Forced,
    /// An unhealthy node past its cool-down took a recovery probe.
    Probe,
}

impl RoutingReason {
    pub fn as_str(self) -> &'static str {
        match self {
            RoutingReason::HealthyLowestP95 => "healthy-lowest-p95",
            RoutingReason::Failover => "failover",
            RoutingReason::Forced => "forced",
            RoutingReason::Probe => "probe",
        }
    }
}

impl std::fmt::Display for RoutingReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one routing call. Ephemeral; logged and published as an event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingDecision {
    /// The node the call goes to.
    pub chosen_node: String,
    /// Why it was chosen.
    pub reason: RoutingReason,
    /// Other candidates, in ranking order.
    pub alternates_considered: Vec<String>,
}

/// Point-in-time health view of one node, for status displays.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealthSnapshot {
    pub node_id: String,
    pub healthy: bool,
    /// Median success latency, `None` while fewer than the minimum samples.
    pub p50_ms: Option<f64>,
    /// 95th percentile success latency, `None` while unknown.
    pub p95_ms: Option<f64>,
    /// Failure ratio over the current window.
    pub error_rate: f64,
    /// Samples currently held in the window.
    pub sample_count: usize,
    /// Calls currently outstanding.
    pub in_flight: u32,
    /// When the node last flipped unhealthy.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_since: Option<DateTime<Utc>>,
}

/// One latency/outcome observation, as forwarded to telemetry sinks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthSample {
    pub node_id: String,
    pub timestamp: DateTime<Utc>,
    pub latency_ms: u64,
    pub success: bool,
}
