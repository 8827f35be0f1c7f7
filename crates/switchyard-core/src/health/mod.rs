pub mod history;
pub mod monitor;
pub mod telemetry;

pub use history::LatencyHistory;
pub use monitor::{HealthMonitor, HealthTransition, InFlightGuard};
pub use telemetry::{ChannelTelemetrySink, TelemetrySink};
