//! 节点测量 (Probes)

pub mod bandwidth;
pub mod latency;
pub mod unlock;

pub use bandwidth::{BandwidthProbe, BandwidthResult, ThroughputSampler};
pub use latency::{LatencyResult, ProgressFn, probe_all, tcp_ping, url_test_all};
pub use unlock::{UnlockReport, UnlockRunner};
