//! Latency probing
//!
//! Lightweight ping-based RTT sampling with dead-link and spike filtering.
//! Only used as a fallback when a client has no clock sync data.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

/// Number of valid samples kept for averaging
const LATENCY_SAMPLE_COUNT: usize = 3;

/// Anything slower than this is treated as a dead link (ms)
const MAX_LATENCY_MS: u64 = 2_000;

/// Samples must exceed this to count as a spike (ms)
const SPIKE_FLOOR_MS: f64 = 500.0;

/// Deviation from the average, as a multiple of the average, that marks a spike
const SPIKE_FACTOR: f64 = 1.5;

/// Why a ping was not merged into the average
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    InvalidTimestamp,
    DeadLink,
    Spike,
}

/// Result of a single ping
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PingResult {
    pub server_timestamp: u64,
    /// Measured one-way latency, `None` if the timestamp was unusable
    pub latency: Option<u64>,
    pub ignored: bool,
    pub reason: Option<IgnoreReason>,
}

/// Rolling latency window for a single connection
#[derive(Debug, Clone, Default)]
pub struct LatencySample {
    samples: VecDeque<u64>,
    /// Rejected spikes (diagnostic only)
    pub spike_count: u32,
}

impl LatencySample {
    fn add_sample(&mut self, latency_ms: u64) {
        if self.samples.len() >= LATENCY_SAMPLE_COUNT {
            self.samples.pop_front();
        }
        self.samples.push_back(latency_ms);
    }

    /// Average of the valid samples, `None` before the first one
    pub fn average_ms(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        Some(self.samples.iter().sum::<u64>() as f64 / self.samples.len() as f64)
    }

    fn is_spike(&self, latency_ms: u64) -> bool {
        let Some(avg) = self.average_ms() else {
            return false;
        };
        let sample = latency_ms as f64;
        (sample - avg).abs() > SPIKE_FACTOR * avg && sample > SPIKE_FLOOR_MS
    }
}

/// Tracks ping latency for every connection
#[derive(Debug, Default)]
pub struct LatencyProbe {
    connections: HashMap<String, LatencySample>,
}

impl LatencyProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle a ping carrying the client's send timestamp
    pub fn handle_ping(&mut self, conn_id: &str, client_ts: Option<u64>, now_ms: u64) -> PingResult {
        let Some(client_ts) = client_ts else {
            return PingResult {
                server_timestamp: now_ms,
                latency: None,
                ignored: true,
                reason: Some(IgnoreReason::InvalidTimestamp),
            };
        };

        let latency = now_ms.saturating_sub(client_ts);
        let mut result = PingResult {
            server_timestamp: now_ms,
            latency: Some(latency),
            ignored: false,
            reason: None,
        };

        if latency > MAX_LATENCY_MS {
            tracing::debug!("Ping from {} ignored: {}ms looks like a dead link", conn_id, latency);
            result.ignored = true;
            result.reason = Some(IgnoreReason::DeadLink);
            return result;
        }

        let entry = self.connections.entry(conn_id.to_string()).or_default();
        if entry.is_spike(latency) {
            entry.spike_count = entry.spike_count.saturating_add(1);
            tracing::debug!(
                "Ping from {} ignored: spike {}ms vs avg {:.1}ms ({} spikes)",
                conn_id,
                latency,
                entry.average_ms().unwrap_or_default(),
                entry.spike_count
            );
            result.ignored = true;
            result.reason = Some(IgnoreReason::Spike);
            return result;
        }

        entry.add_sample(latency);
        result
    }

    /// Average latency for a connection, if any valid samples exist
    pub fn average_ms(&self, conn_id: &str) -> Option<f64> {
        self.connections.get(conn_id).and_then(LatencySample::average_ms)
    }

    /// Forget a connection (on disconnect)
    pub fn cleanup(&mut self, conn_id: &str) {
        self.connections.remove(conn_id);
    }
}
