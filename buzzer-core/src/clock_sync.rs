//! Clock offset estimation
//!
//! Clients echo the server timestamp back and report the offset and RTT they
//! measured. We keep a short history per connection and derive a median offset
//! (robust to one-off delays), the mean RTT and the RTT jitter.

use std::collections::{HashMap, VecDeque};

use serde::Serialize;

/// Number of offset/RTT samples kept per connection
pub const SYNC_SAMPLE_COUNT: usize = 10;

/// Reply to a sync request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReply {
    /// Client timestamp echoed back (absent if the client sent garbage)
    pub client_timestamp: Option<u64>,
    pub server_timestamp: u64,
}

/// Sync history for a single connection
#[derive(Debug, Clone, PartialEq)]
pub struct ClientSyncRecord {
    offsets: VecDeque<f64>,
    rtts: VecDeque<f64>,
    /// Median of the offset samples (lower-middle element on even counts)
    pub median_offset: f64,
    /// Mean of the RTT samples
    pub average_rtt: f64,
    /// Population standard deviation of the RTT samples
    pub jitter: f64,
    /// Server time of the last accepted sample
    pub last_sync_at: u64,
}

impl ClientSyncRecord {
    fn new() -> Self {
        Self {
            offsets: VecDeque::with_capacity(SYNC_SAMPLE_COUNT),
            rtts: VecDeque::with_capacity(SYNC_SAMPLE_COUNT),
            median_offset: 0.0,
            average_rtt: 0.0,
            jitter: 0.0,
            last_sync_at: 0,
        }
    }

    fn add_sample(&mut self, offset: f64, rtt: f64, now_ms: u64) {
        if self.offsets.len() >= SYNC_SAMPLE_COUNT {
            self.offsets.pop_front();
        }
        if self.rtts.len() >= SYNC_SAMPLE_COUNT {
            self.rtts.pop_front();
        }
        self.offsets.push_back(offset);
        self.rtts.push_back(rtt);
        self.last_sync_at = now_ms;
        self.recalculate();
    }

    fn recalculate(&mut self) {
        let mut sorted: Vec<f64> = self.offsets.iter().copied().collect();
        sorted.sort_by(|a, b| a.total_cmp(b));
        self.median_offset = sorted.get((sorted.len().max(1) - 1) / 2).copied().unwrap_or(0.0);

        if self.rtts.is_empty() {
            self.average_rtt = 0.0;
            self.jitter = 0.0;
            return;
        }
        let n = self.rtts.len() as f64;
        let mean = self.rtts.iter().sum::<f64>() / n;
        let variance = self.rtts.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / n;
        self.average_rtt = mean;
        self.jitter = variance.sqrt();
    }

    /// Whether at least one offset sample exists
    pub fn is_synced(&self) -> bool {
        !self.offsets.is_empty()
    }
}

/// Tracks clock offsets for every connected client
#[derive(Debug, Default)]
pub struct ClockOffsetEstimator {
    records: HashMap<String, ClientSyncRecord>,
}

impl ClockOffsetEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Answer a sync request. Pure echo, never touches state.
    pub fn handle_sync(&self, conn_id: &str, client_ts: Option<u64>, now_ms: u64) -> SyncReply {
        if client_ts.is_none() {
            tracing::debug!("Sync from {} without a usable timestamp", conn_id);
        }
        SyncReply {
            client_timestamp: client_ts,
            server_timestamp: now_ms,
        }
    }

    /// Record an offset/RTT pair measured by the client.
    /// Returns false (and leaves state untouched) for malformed input.
    pub fn record_offset(&mut self, conn_id: &str, offset: f64, rtt: f64, now_ms: u64) -> bool {
        if !offset.is_finite() || !rtt.is_finite() || rtt < 0.0 {
            tracing::debug!(
                "Ignoring malformed sync sample from {}: offset={}, rtt={}",
                conn_id,
                offset,
                rtt
            );
            return false;
        }

        let record = self
            .records
            .entry(conn_id.to_string())
            .or_insert_with(ClientSyncRecord::new);
        record.add_sample(offset, rtt, now_ms);

        tracing::debug!(
            "Sync {}: offset={:.1}ms rtt={:.1}ms, median={:.1}ms avg_rtt={:.1}ms jitter={:.1}ms",
            conn_id,
            offset,
            rtt,
            record.median_offset,
            record.average_rtt,
            record.jitter
        );
        true
    }

    pub fn get_stats(&self, conn_id: &str) -> Option<&ClientSyncRecord> {
        self.records.get(conn_id)
    }

    /// Forget a connection (on disconnect)
    pub fn cleanup(&mut self, conn_id: &str) {
        self.records.remove(conn_id);
    }
}
