//! Live per-node health tracking.
//!
//! `HealthMonitor` ingests `{node_id, latency_ms, success}` observations from
//! concurrent stage attempts and answers the router's questions: is a node
//! healthy, what are its P50/P95 latencies, what is its error rate, how many
//! calls are outstanding.
//!
//! Health uses hysteresis. A node flips unhealthy when its windowed error
//! rate exceeds the threshold (once enough samples exist) or after a run of
//! consecutive failures. It flips back only when a call succeeds after the
//! cool-down has elapsed; a failure after the cool-down restarts it. After
//! recovery, the error rate only counts samples from the recovery onward.
//!
//! Once the cool-down has elapsed the node is half-open: the router may claim
//! a single probe call for it with [`HealthMonitor::try_claim_probe`]. The
//! claim is released by the next recorded sample, or lapses after another
//! cool-down if the probe never reports back.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use switchyard_types::config::HealthConfig;
use switchyard_types::node::{HealthSample, NodeHealthSnapshot};

use super::history::{LatencyHistory, Sample};
use super::telemetry::TelemetrySink;
use crate::clock::SharedClock;

/// A change of a node's health flag, returned from [`HealthMonitor::record`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthTransition {
    pub node_id: String,
    pub healthy: bool,
    pub at: DateTime<Utc>,
}

#[derive(Debug)]
struct NodeState {
    history: LatencyHistory,
    healthy: bool,
    consecutive_failures: u32,
    unhealthy_since: Option<DateTime<Utc>>,
    /// Error rate ignores samples before this instant (set on recovery).
    rate_floor: Option<DateTime<Utc>>,
    probe_claimed_at: Option<DateTime<Utc>>,
}

impl NodeState {
    fn new(config: &HealthConfig) -> Self {
        Self {
            history: LatencyHistory::new(
                config.window_capacity,
                Duration::seconds(config.window_secs as i64),
            ),
            healthy: true,
            consecutive_failures: 0,
            unhealthy_since: None,
            rate_floor: None,
            probe_claimed_at: None,
        }
    }
}

/// Thread-safe health statistics keyed by node ID.
///
/// Writers on different nodes never contend; writers on the same node are
/// serialized by the map shard lock, so append and evict happen atomically.
pub struct HealthMonitor {
    config: HealthConfig,
    clock: SharedClock,
    nodes: DashMap<String, NodeState>,
    in_flight: DashMap<String, Arc<AtomicU32>>,
    telemetry: Option<Arc<dyn TelemetrySink>>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            nodes: DashMap::new(),
            in_flight: DashMap::new(),
            telemetry: None,
        }
    }

    /// Forward every ingested sample to `sink`.
    pub fn with_telemetry(mut self, sink: Arc<dyn TelemetrySink>) -> Self {
        self.telemetry = Some(sink);
        self
    }

    pub fn config(&self) -> &HealthConfig {
        &self.config
    }

    /// Ingest one observation. Returns the transition if the health flag
    /// flipped.
    pub fn record(&self, node_id: &str, latency_ms: u64, success: bool) -> Option<HealthTransition> {
        let now = self.clock.now();
        let cooldown = Duration::seconds(self.config.cooldown_secs as i64);

        let transition = {
            let mut state = self
                .nodes
                .entry(node_id.to_string())
                .or_insert_with(|| NodeState::new(&self.config));
            state.history.push(Sample {
                timestamp: now,
                latency_ms,
                success,
            });
            state.probe_claimed_at = None;

            let cooled_down = state
                .unhealthy_since
                .is_some_and(|since| now - since >= cooldown);

            if success {
                state.consecutive_failures = 0;
                if !state.healthy && cooled_down {
                    state.healthy = true;
                    state.unhealthy_since = None;
                    state.rate_floor = Some(now);
                    Some(true)
                } else {
                    None
                }
            } else {
                state.consecutive_failures = state.consecutive_failures.saturating_add(1);
                if state.healthy {
                    let (total, _) = state.history.counts_since(state.rate_floor);
                    let error_rate = state.history.error_rate_since(state.rate_floor);
                    let rate_tripped = total >= self.config.min_samples_for_error_rate
                        && error_rate > self.config.error_rate_threshold;
                    let streak_tripped =
                        state.consecutive_failures >= self.config.consecutive_failure_threshold;
                    if rate_tripped || streak_tripped {
                        state.healthy = false;
                        state.unhealthy_since = Some(now);
                        Some(false)
                    } else {
                        None
                    }
                } else {
                    if cooled_down {
                        // Failed probe: start a fresh cool-down.
                        state.unhealthy_since = Some(now);
                    }
                    None
                }
            }
        };

        if let Some(sink) = &self.telemetry {
            sink.record(&HealthSample {
                node_id: node_id.to_string(),
                timestamp: now,
                latency_ms,
                success,
            });
        }

        transition.map(|healthy| {
            if healthy {
                tracing::info!(node_id, "node recovered after cool-down");
            } else {
                tracing::info!(node_id, latency_ms, "node marked unhealthy");
            }
            HealthTransition {
                node_id: node_id.to_string(),
                healthy,
                at: now,
            }
        })
    }

    /// Health flag for a node. Nodes without samples are healthy.
    pub fn is_healthy(&self, node_id: &str) -> bool {
        self.nodes.get(node_id).is_none_or(|s| s.healthy)
    }

    /// Whether an unhealthy node has sat out its cool-down and may be probed.
    pub fn probe_due(&self, node_id: &str) -> bool {
        let now = self.clock.now();
        let cooldown = Duration::seconds(self.config.cooldown_secs as i64);
        self.nodes.get(node_id).is_some_and(|state| {
            !state.healthy
                && state
                    .unhealthy_since
                    .is_some_and(|since| now - since >= cooldown)
        })
    }

    /// Claim the recovery probe for a half-open node.
    ///
    /// Returns `false` if the node is healthy, still cooling down, or already
    /// has an outstanding probe claim younger than the cool-down.
    pub fn try_claim_probe(&self, node_id: &str) -> bool {
        let now = self.clock.now();
        let cooldown = Duration::seconds(self.config.cooldown_secs as i64);
        let Some(mut state) = self.nodes.get_mut(node_id) else {
            return false;
        };
        let due = !state.healthy
            && state
                .unhealthy_since
                .is_some_and(|since| now - since >= cooldown);
        let outstanding = state
            .probe_claimed_at
            .is_some_and(|claimed| now - claimed < cooldown);
        if !due || outstanding {
            return false;
        }
        state.probe_claimed_at = Some(now);
        tracing::debug!(node_id, "claimed recovery probe");
        true
    }

    /// Median success latency, or `None` while unknown.
    pub fn p50(&self, node_id: &str) -> Option<f64> {
        self.percentile(node_id, 0.50)
    }

    /// 95th percentile success latency, or `None` while unknown.
    pub fn p95(&self, node_id: &str) -> Option<f64> {
        self.percentile(node_id, 0.95)
    }

    fn percentile(&self, node_id: &str, p: f64) -> Option<f64> {
        self.nodes
            .get(node_id)
            .and_then(|s| s.history.percentile(p, self.config.min_latency_samples))
    }

    /// Error rate over the current window (since recovery, if any).
    pub fn error_rate(&self, node_id: &str) -> f64 {
        self.nodes
            .get(node_id)
            .map_or(0.0, |s| s.history.error_rate_since(s.rate_floor))
    }

    pub fn sample_count(&self, node_id: &str) -> usize {
        self.nodes.get(node_id).map_or(0, |s| s.history.len())
    }

    pub fn consecutive_failures(&self, node_id: &str) -> u32 {
        self.nodes.get(node_id).map_or(0, |s| s.consecutive_failures)
    }

    /// Outstanding calls currently routed to a node.
    pub fn in_flight(&self, node_id: &str) -> u32 {
        self.in_flight
            .get(node_id)
            .map_or(0, |c| c.load(Ordering::Acquire))
    }

    /// Count a call against a node until the returned guard drops.
    pub fn begin_call(&self, node_id: &str) -> InFlightGuard {
        let counter = self
            .in_flight
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(AtomicU32::new(0)))
            .clone();
        counter.fetch_add(1, Ordering::AcqRel);
        InFlightGuard { counter }
    }

    /// Point-in-time view of one node.
    pub fn snapshot(&self, node_id: &str) -> NodeHealthSnapshot {
        let in_flight = self.in_flight(node_id);
        match self.nodes.get(node_id) {
            Some(state) => NodeHealthSnapshot {
                node_id: node_id.to_string(),
                healthy: state.healthy,
                p50_ms: state
                    .history
                    .percentile(0.50, self.config.min_latency_samples),
                p95_ms: state
                    .history
                    .percentile(0.95, self.config.min_latency_samples),
                error_rate: state.history.error_rate_since(state.rate_floor),
                sample_count: state.history.len(),
                in_flight,
                unhealthy_since: state.unhealthy_since,
            },
            None => NodeHealthSnapshot {
                node_id: node_id.to_string(),
                healthy: true,
                p50_ms: None,
                p95_ms: None,
                error_rate: 0.0,
                sample_count: 0,
                in_flight,
                unhealthy_since: None,
            },
        }
    }

    /// Forget everything about a node (on deregistration).
    pub fn remove(&self, node_id: &str) {
        self.nodes.remove(node_id);
        self.in_flight.remove(node_id);
    }
}

impl std::fmt::Debug for HealthMonitor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthMonitor")
            .field("config", &self.config)
            .field("tracked_nodes", &self.nodes.len())
            .field("telemetry", &self.telemetry.is_some())
            .finish()
    }
}

/// Decrements a node's in-flight count on drop.
#[derive(Debug)]
pub struct InFlightGuard {
    counter: Arc<AtomicU32>,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::health::telemetry::ChannelTelemetrySink;

    fn monitor_with_clock(config: HealthConfig) -> (HealthMonitor, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (HealthMonitor::new(config, clock.clone()), clock)
    }

    #[test]
    fn unknown_node_is_healthy() {
        let (monitor, _) = monitor_with_clock(HealthConfig::default());
        assert!(monitor.is_healthy("ghost"));
        assert_eq!(monitor.error_rate("ghost"), 0.0);
        assert_eq!(monitor.p95("ghost"), None);
        assert_eq!(monitor.sample_count("ghost"), 0);
    }

    #[test]
    fn consecutive_failures_flip_unhealthy() {
        let (monitor, _) = monitor_with_clock(HealthConfig::default());
        assert!(monitor.record("n1", 50, false).is_none());
        assert!(monitor.record("n1", 50, false).is_none());
        let transition = monitor.record("n1", 50, false).unwrap();
        assert!(!transition.healthy);
        assert_eq!(transition.node_id, "n1");
        assert!(!monitor.is_healthy("n1"));
    }

    #[test]
    fn error_rate_above_threshold_flips_unhealthy() {
        let (monitor, _) = monitor_with_clock(HealthConfig::default());
        // 4 successes then alternate failures: 1/5 = 0.2 is not above threshold
        for _ in 0..4 {
            monitor.record("n1", 40, true);
        }
        assert!(monitor.record("n1", 40, false).is_none());
        assert!(monitor.is_healthy("n1"));

        monitor.record("n1", 40, true);
        // 2/7 > 0.2
        let transition = monitor.record("n1", 40, false);
        assert_eq!(transition.map(|t| t.healthy), Some(false));
    }

    #[test]
    fn error_rate_needs_minimum_samples() {
        let (monitor, _) = monitor_with_clock(HealthConfig::default());
        monitor.record("n1", 40, true);
        // 1/2 failures but below min samples and below the streak threshold
        assert!(monitor.record("n1", 40, false).is_none());
        assert!(monitor.is_healthy("n1"));
    }

    #[test]
    fn recovery_waits_for_cooldown() {
        let (monitor, clock) = monitor_with_clock(HealthConfig::default());
        for _ in 0..3 {
            monitor.record("n1", 50, false);
        }
        assert!(!monitor.is_healthy("n1"));

        // Probe succeeds before the cool-down: still unhealthy
        clock.advance(Duration::seconds(10));
        assert!(monitor.record("n1", 50, true).is_none());
        assert!(!monitor.is_healthy("n1"));

        // Probe succeeds after the cool-down: healthy again
        clock.advance(Duration::seconds(25));
        let transition = monitor.record("n1", 50, true).unwrap();
        assert!(transition.healthy);
        assert!(monitor.is_healthy("n1"));
        // Pre-recovery failures no longer count
        assert_eq!(monitor.error_rate("n1"), 0.0);
    }

    #[test]
    fn cooldown_alone_does_not_restore_health() {
        let (monitor, clock) = monitor_with_clock(HealthConfig::default());
        for _ in 0..3 {
            monitor.record("n1", 50, false);
        }
        clock.advance(Duration::seconds(120));
        assert!(!monitor.is_healthy("n1"));
    }

    #[test]
    fn failed_probe_after_cooldown_restarts_it() {
        let config = HealthConfig {
            cooldown_secs: 5,
            ..HealthConfig::default()
        };
        let (monitor, clock) = monitor_with_clock(config);
        for _ in 0..3 {
            monitor.record("n1", 50, false);
        }
        clock.advance(Duration::seconds(6));
        monitor.record("n1", 50, false);

        clock.advance(Duration::seconds(3));
        assert!(monitor.record("n1", 50, true).is_none());
        assert!(!monitor.is_healthy("n1"));

        clock.advance(Duration::seconds(3));
        assert!(monitor.record("n1", 50, true).is_some());
    }

    #[test]
    fn thresholds_are_configurable() {
        let config = HealthConfig {
            consecutive_failure_threshold: 1,
            cooldown_secs: 0,
            ..HealthConfig::default()
        };
        let (monitor, _) = monitor_with_clock(config);
        assert!(monitor.record("n1", 5, false).is_some());
        assert!(monitor.record("n1", 5, true).is_some());
        assert!(monitor.is_healthy("n1"));
    }

    #[test]
    fn probe_claimed_once_per_cooldown() {
        let (monitor, clock) = monitor_with_clock(HealthConfig::default());
        assert!(!monitor.try_claim_probe("n1"));
        for _ in 0..3 {
            monitor.record("n1", 50, false);
        }
        assert!(!monitor.probe_due("n1"));
        assert!(!monitor.try_claim_probe("n1"));

        clock.advance(Duration::seconds(30));
        assert!(monitor.probe_due("n1"));
        assert!(monitor.try_claim_probe("n1"));
        assert!(!monitor.try_claim_probe("n1"));

        // An unreported claim lapses after another cool-down
        clock.advance(Duration::seconds(30));
        assert!(monitor.try_claim_probe("n1"));

        let transition = monitor.record("n1", 50, true).unwrap();
        assert!(transition.healthy);
        assert!(!monitor.probe_due("n1"));
        assert!(!monitor.try_claim_probe("n1"));
    }

    #[test]
    fn failed_probe_releases_claim_and_restarts_cooldown() {
        let (monitor, clock) = monitor_with_clock(HealthConfig::default());
        for _ in 0..3 {
            monitor.record("n1", 50, false);
        }
        clock.advance(Duration::seconds(31));
        assert!(monitor.try_claim_probe("n1"));
        monitor.record("n1", 50, false);

        assert!(!monitor.probe_due("n1"));
        clock.advance(Duration::seconds(30));
        assert!(monitor.try_claim_probe("n1"));
    }

    #[test]
    fn in_flight_guard_tracks_outstanding_calls() {
        let (monitor, _) = monitor_with_clock(HealthConfig::default());
        let a = monitor.begin_call("n1");
        let b = monitor.begin_call("n1");
        assert_eq!(monitor.in_flight("n1"), 2);
        drop(a);
        assert_eq!(monitor.in_flight("n1"), 1);
        drop(b);
        assert_eq!(monitor.in_flight("n1"), 0);
    }

    #[test]
    fn snapshot_reports_latencies() {
        let (monitor, _) = monitor_with_clock(HealthConfig::default());
        for latency in [10, 20, 30, 40, 50] {
            monitor.record("n1", latency, true);
        }
        let snap = monitor.snapshot("n1");
        assert!(snap.healthy);
        assert_eq!(snap.p50_ms, Some(30.0));
        assert_eq!(snap.sample_count, 5);
        assert_eq!(snap.error_rate, 0.0);
    }

    #[test]
    fn remove_forgets_history() {
        let (monitor, _) = monitor_with_clock(HealthConfig::default());
        for _ in 0..3 {
            monitor.record("n1", 50, false);
        }
        monitor.remove("n1");
        assert!(monitor.is_healthy("n1"));
        assert_eq!(monitor.sample_count("n1"), 0);
    }

    #[test]
    fn concurrent_writers_lose_no_samples() {
        let (monitor, _) = monitor_with_clock(HealthConfig {
            window_capacity: 10_000,
            ..HealthConfig::default()
        });
        let monitor = Arc::new(monitor);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let monitor = monitor.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        monitor.record("shared", 10, true);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(monitor.sample_count("shared"), 800);
    }

    #[tokio::test]
    async fn telemetry_sink_receives_samples() {
        let (sink, mut rx) = ChannelTelemetrySink::channel(8);
        let (monitor, _) = monitor_with_clock(HealthConfig::default());
        let monitor = monitor.with_telemetry(Arc::new(sink));
        monitor.record("n1", 77, true);
        let sample = rx.recv().await.unwrap();
        assert_eq!(sample.node_id, "n1");
        assert_eq!(sample.latency_ms, 77);
    }
}
