//! Optional external persistence of health samples.
//!
//! Sinks receive every sample the monitor ingests. They must not block: the
//! monitor's in-memory state stays authoritative for routing whether or not
//! a sink keeps up.

use std::sync::atomic::{AtomicU64, Ordering};

use switchyard_types::node::HealthSample;
use tokio::sync::mpsc;

/// Receiver of health samples for historical dashboards.
pub trait TelemetrySink: Send + Sync {
    fn record(&self, sample: &HealthSample);
}

/// Forwards samples over a bounded channel, dropping them on overflow.
#[derive(Debug)]
pub struct ChannelTelemetrySink {
    sender: mpsc::Sender<HealthSample>,
    dropped: AtomicU64,
}

impl ChannelTelemetrySink {
    /// Create a sink and the receiver a persistence task should drain.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<HealthSample>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                dropped: AtomicU64::new(0),
            },
            receiver,
        )
    }

    /// Samples discarded because the channel was full or closed.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

impl TelemetrySink for ChannelTelemetrySink {
    fn record(&self, sample: &HealthSample) {
        if let Err(e) = self.sender.try_send(sample.clone()) {
            let total = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
            tracing::debug!(node_id = %sample.node_id, dropped = total, "telemetry sample dropped: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(latency_ms: u64) -> HealthSample {
        HealthSample {
            node_id: "n1".to_string(),
            timestamp: Utc::now(),
            latency_ms,
            success: true,
        }
    }

    #[tokio::test]
    async fn forwards_samples() {
        let (sink, mut rx) = ChannelTelemetrySink::channel(4);
        sink.record(&sample(12));
        let got = rx.recv().await.unwrap();
        assert_eq!(got.latency_ms, 12);
        assert_eq!(sink.dropped(), 0);
    }

    #[test]
    fn drops_on_overflow_without_blocking() {
        let (sink, _rx) = ChannelTelemetrySink::channel(2);
        for i in 0..5 {
            sink.record(&sample(i));
        }
        assert_eq!(sink.dropped(), 3);
    }
}
