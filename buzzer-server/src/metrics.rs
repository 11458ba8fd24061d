//! Metrics tracking for the buzzer server

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use buzzer_core::collaborators::AnalyticsSink;
use buzzer_core::{BuzzVerdict, PublishError};
use chrono::{DateTime, Local};
use parking_lot::RwLock;

/// Maximum number of log entries to keep
const MAX_LOG_ENTRIES: usize = 100;

/// Maximum number of verdicts shown on the dashboard
const MAX_RECENT_VERDICTS: usize = 8;

/// A log entry for the dashboard
#[derive(Clone)]
pub struct LogEntry {
    pub timestamp: DateTime<Local>,
    pub level: LogLevel,
    pub message: String,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
    Connection,
    Buzz,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Info => "INFO",
            LogLevel::Warning => "WARN",
            LogLevel::Error => "ERROR",
            LogLevel::Connection => "CONN",
            LogLevel::Buzz => "BUZZ",
        }
    }
}

/// Summary of one resolved round
#[derive(Clone, Debug, PartialEq)]
pub struct VerdictSummary {
    pub room_id: String,
    pub winner: String,
    pub candidates: usize,
    pub random_tiebreak: bool,
    pub window_ms: u64,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum ServerStatus {
    Starting,
    Running,
    Error,
}

/// Server metrics
pub struct Metrics {
    /// Server start time
    pub start_time: DateTime<Local>,

    /// Address we listen on
    pub bind_addr: String,

    /// Current number of connected clients
    pub connected_clients: usize,

    /// Total connections since start
    pub total_connections: u64,

    /// Peak simultaneous connections
    pub peak_connections: usize,

    /// Rooms currently open
    pub open_rooms: usize,

    /// Buzzes accepted into a grace window
    pub buzzes_accepted: u64,

    /// Buzzes rejected, by wire code
    pub rejections: HashMap<&'static str, u64>,

    /// Verdicts published since start
    pub verdicts: u64,

    /// Verdicts that needed a random tie-break
    pub random_tiebreaks: u64,

    /// Most recent verdicts, newest last
    pub recent_verdicts: VecDeque<VerdictSummary>,

    /// Log entries
    pub logs: VecDeque<LogEntry>,

    /// Entries logged since start, including those already evicted
    pub total_logged: u64,

    /// Server status
    pub status: ServerStatus,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            start_time: Local::now(),
            bind_addr: String::new(),
            connected_clients: 0,
            total_connections: 0,
            peak_connections: 0,
            open_rooms: 0,
            buzzes_accepted: 0,
            rejections: HashMap::new(),
            verdicts: 0,
            random_tiebreaks: 0,
            recent_verdicts: VecDeque::with_capacity(MAX_RECENT_VERDICTS),
            logs: VecDeque::with_capacity(MAX_LOG_ENTRIES),
            total_logged: 0,
            status: ServerStatus::Starting,
        }
    }

    /// Add a log entry
    pub fn log(&mut self, level: LogLevel, message: impl Into<String>) {
        if self.logs.len() >= MAX_LOG_ENTRIES {
            self.logs.pop_front();
        }
        self.logs.push_back(LogEntry {
            timestamp: Local::now(),
            level,
            message: message.into(),
        });
        self.total_logged += 1;
    }

    /// Record a new client connection
    pub fn connection_opened(&mut self, conn_id: &str, peer: &str) {
        self.connected_clients += 1;
        self.total_connections += 1;
        if self.connected_clients > self.peak_connections {
            self.peak_connections = self.connected_clients;
        }
        self.log(LogLevel::Connection, format!("Connected: {} ({})", conn_id, peer));
    }

    /// Record a disconnection
    pub fn connection_closed(&mut self, conn_id: &str) {
        self.connected_clients = self.connected_clients.saturating_sub(1);
        self.log(LogLevel::Connection, format!("Disconnected: {}", conn_id));
    }

    pub fn buzz_accepted(&mut self) {
        self.buzzes_accepted += 1;
    }

    pub fn buzz_rejected(&mut self, code: &'static str) {
        *self.rejections.entry(code).or_insert(0) += 1;
    }

    pub fn total_rejections(&self) -> u64 {
        self.rejections.values().sum()
    }

    /// Record a published verdict
    pub fn verdict_recorded(&mut self, room_id: &str, verdict: &BuzzVerdict) {
        self.verdicts += 1;
        if verdict.had_random_tiebreak {
            self.random_tiebreaks += 1;
        }

        if self.recent_verdicts.len() >= MAX_RECENT_VERDICTS {
            self.recent_verdicts.pop_front();
        }
        self.recent_verdicts.push_back(VerdictSummary {
            room_id: room_id.to_string(),
            winner: verdict.winner_pseudonym.clone(),
            candidates: verdict.candidates.len(),
            random_tiebreak: verdict.had_random_tiebreak,
            window_ms: verdict.window_duration_ms,
        });

        let tiebreak = if verdict.had_random_tiebreak { ", random tie-break" } else { "" };
        self.log(
            LogLevel::Buzz,
            format!(
                "{}: {} wins of {}{}",
                truncate_id(room_id),
                verdict.winner_pseudonym,
                verdict.candidates.len(),
                tiebreak
            ),
        );
    }

    /// Get uptime as formatted string
    pub fn uptime(&self) -> String {
        let duration = Local::now().signed_duration_since(self.start_time);
        let secs = duration.num_seconds();

        if secs < 60 {
            format!("{}s", secs)
        } else if secs < 3600 {
            format!("{}m {}s", secs / 60, secs % 60)
        } else {
            let hours = secs / 3600;
            let mins = (secs % 3600) / 60;
            format!("{}h {}m", hours, mins)
        }
    }
}

/// Analytics collaborator backed by the metrics store
pub struct MetricsSink(pub Arc<RwLock<Metrics>>);

impl AnalyticsSink for MetricsSink {
    fn record_buzz_event(&self, room_id: &str, verdict: &BuzzVerdict) -> Result<(), PublishError> {
        self.0.write().verdict_recorded(room_id, verdict);
        Ok(())
    }
}

/// Truncate an id for display (show first and last few chars)
pub fn truncate_id(id: &str) -> String {
    let chars: Vec<char> = id.chars().collect();
    if chars.len() > 16 {
        let head: String = chars[..8].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    } else {
        id.to_string()
    }
}
