//! Health-aware node selection for inference calls.
//!
//! Candidates are the registered nodes advertising the requested capability
//! that still have in-flight headroom. Healthy candidates with known latency
//! statistics rank first by P95, then healthy candidates without enough
//! samples, then unhealthy candidates by error rate. Load (in-flight count)
//! and registration order break ties. When no healthy candidate exists the
//! least-bad unhealthy one is returned as a failover.
//!
//! An unhealthy candidate whose cool-down has elapsed jumps the queue for a
//! single probe call, so it can recover even while healthy nodes exist.

use std::cmp::Ordering;
use std::sync::Arc;

use switchyard_types::error::StageError;
use switchyard_types::node::{ModelNode, NodeHealthSnapshot, RoutingDecision, RoutingReason};

use super::registry::NodeRegistry;
use crate::health::HealthMonitor;

/// Chooses exactly one node per call, or fails with `RouterNoAvailableNode`.
#[derive(Debug, Clone)]
pub struct InferenceRouter {
    registry: Arc<NodeRegistry>,
    health: Arc<HealthMonitor>,
}

/// A ranked candidate.
struct Candidate {
    node: ModelNode,
    order: usize,
    healthy: bool,
    p95: Option<f64>,
    error_rate: f64,
    in_flight: u32,
}

impl Candidate {
    /// 0 = healthy with known stats, 1 = healthy unknown, 2 = unhealthy.
    fn tier(&self) -> u8 {
        match (self.healthy, self.p95) {
            (true, Some(_)) => 0,
            (true, None) => 1,
            (false, _) => 2,
        }
    }
}

fn rank(a: &Candidate, b: &Candidate) -> Ordering {
    a.tier()
        .cmp(&b.tier())
        .then_with(|| match (a.tier(), a.p95, b.p95) {
            (0, Some(pa), Some(pb)) => pa.total_cmp(&pb),
            (2, _, _) => a.error_rate.total_cmp(&b.error_rate),
            _ => Ordering::Equal,
        })
        .then_with(|| a.in_flight.cmp(&b.in_flight))
        .then_with(|| a.order.cmp(&b.order))
}

impl InferenceRouter {
    pub fn new(registry: Arc<NodeRegistry>, health: Arc<HealthMonitor>) -> Self {
        Self { registry, health }
    }

    pub fn registry(&self) -> &Arc<NodeRegistry> {
        &self.registry
    }

    pub fn health(&self) -> &Arc<HealthMonitor> {
        &self.health
    }

    /// Pick a node for one inference attempt.
    ///
    /// `pinned` bypasses ranking (reason `forced`) but still requires the
    /// node to be registered and below its in-flight limit.
    pub fn route(
        &self,
        capability: Option<&str>,
        pinned: Option<&str>,
    ) -> Result<(ModelNode, RoutingDecision), StageError> {
        if let Some(node_id) = pinned {
            return self.route_pinned(node_id);
        }

        let registered = self.registry.list();
        let capable: Vec<(usize, ModelNode)> = registered
            .into_iter()
            .enumerate()
            .filter(|(_, node)| capability.is_none_or(|cap| node.supports(cap)))
            .collect();

        if capable.is_empty() {
            return Err(StageError::RouterNoAvailableNode {
                reason: match capability {
                    Some(cap) => format!("no registered node supports capability '{cap}'"),
                    None => "no nodes registered".to_string(),
                },
                retryable: false,
            });
        }

        let mut candidates: Vec<Candidate> = capable
            .into_iter()
            .filter_map(|(order, node)| {
                let in_flight = self.health.in_flight(&node.node_id);
                if node.max_in_flight.is_some_and(|max| in_flight >= max) {
                    return None;
                }
                let healthy = self.health.is_healthy(&node.node_id);
                Some(Candidate {
                    p95: self.health.p95(&node.node_id),
                    error_rate: self.health.error_rate(&node.node_id),
                    node,
                    order,
                    healthy,
                    in_flight,
                })
            })
            .collect();

        if candidates.is_empty() {
            return Err(StageError::RouterNoAvailableNode {
                reason: "all capable nodes are at their in-flight limit".to_string(),
                retryable: true,
            });
        }

        candidates.sort_by(rank);

        // `position` stops at the first successful claim.
        let probe = candidates
            .iter()
            .position(|c| !c.healthy && self.health.try_claim_probe(&c.node.node_id));
        if let Some(index) = probe {
            let probed = candidates.remove(index);
            candidates.insert(0, probed);
        }

        let mut ranked = candidates.into_iter();
        let Some(chosen) = ranked.next() else {
            return Err(StageError::RouterNoAvailableNode {
                reason: "no candidates".to_string(),
                retryable: false,
            });
        };
        let reason = if probe.is_some() {
            RoutingReason::Probe
        } else if chosen.healthy {
            RoutingReason::HealthyLowestP95
        } else {
            RoutingReason::Failover
        };
        let decision = RoutingDecision {
            chosen_node: chosen.node.node_id.clone(),
            reason,
            alternates_considered: ranked.map(|c| c.node.node_id).collect(),
        };

        match reason {
            RoutingReason::Failover => tracing::warn!(
                node_id = %decision.chosen_node,
                error_rate = chosen.error_rate,
                "no healthy node available, failing over"
            ),
            RoutingReason::Probe => tracing::info!(
                node_id = %decision.chosen_node,
                error_rate = chosen.error_rate,
                "probing unhealthy node after cool-down"
            ),
            _ => tracing::debug!(
                node_id = %decision.chosen_node,
                p95_ms = ?chosen.p95,
                alternates = decision.alternates_considered.len(),
                "routed inference call"
            ),
        }

        Ok((chosen.node, decision))
    }

    fn route_pinned(&self, node_id: &str) -> Result<(ModelNode, RoutingDecision), StageError> {
        let node = self
            .registry
            .get(node_id)
            .ok_or_else(|| StageError::RouterNoAvailableNode {
                reason: format!("pinned node '{node_id}' is not registered"),
                retryable: false,
            })?;

        if node
            .max_in_flight
            .is_some_and(|max| self.health.in_flight(node_id) >= max)
        {
            return Err(StageError::RouterNoAvailableNode {
                reason: format!("pinned node '{node_id}' is at its in-flight limit"),
                retryable: true,
            });
        }

        tracing::debug!(node_id, "routed inference call to pinned node");
        let decision = RoutingDecision {
            chosen_node: node.node_id.clone(),
            reason: RoutingReason::Forced,
            alternates_considered: Vec::new(),
        };
        Ok((node, decision))
    }

    /// Health snapshots for every registered node, in registration order.
    pub fn node_health(&self) -> Vec<NodeHealthSnapshot> {
        self.registry
            .list()
            .iter()
            .map(|node| self.health.snapshot(&node.node_id))
            .collect()
    }
}
