//! Buzz Protocol Messages
//!
//! Wire format is JSON, one message per line, tagged by `type`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::clock_sync::SyncReply;
use crate::error::BuzzRejection;
use crate::latency::PingResult;

/// One buzz considered during a grace window, as published
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CandidateDetail {
    pub player_id: String,
    pub pseudonym: String,
    /// Timestamp as sent by the client (absent if it was unusable)
    pub raw_client_timestamp: Option<u64>,
    pub server_receive_timestamp: u64,
    /// Timestamp on the common server-time reference used for ordering
    pub compensated_timestamp: f64,
    /// RTT used for compensation / window sizing
    pub rtt: f64,
    /// Whether the player had clock sync data when buzzing
    pub is_synced: bool,
}

/// Outcome of a grace window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuzzVerdict {
    pub winner_id: String,
    pub winner_pseudonym: String,
    /// Surviving candidates, earliest compensated time first
    pub candidates: Vec<CandidateDetail>,
    /// A runner-up was within the equality threshold
    pub had_equality: bool,
    /// The winner was picked at random among tied candidates
    pub had_random_tiebreak: bool,
    pub window_duration_ms: u64,
    pub equality_threshold_ms: u64,
    pub window_started_at: u64,
    pub resolved_at: u64,
}

/// Administrative ruling on the current winner's answer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum JudgmentOutcome {
    /// Answer accepted, round is over
    Correct,
    /// Answer rejected, winner is locked out for a while
    Incorrect {
        #[serde(default)]
        penalty_ms: Option<u64>,
    },
    /// Judgment abandoned, round unchanged
    Aborted,
}

/// Why a round went back to `NO_WINNER`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetReason {
    Admin,
    QuestionChanged,
    Judged,
}

/// Room-scoped events published to the broadcast collaborator
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum RoomEvent {
    BuzzVerdict(BuzzVerdict),
    RoundReset { reason: ResetReason },
    RoundPaused { paused: bool },
    JudgmentStarted,
    JudgmentEnded { outcome: JudgmentOutcome },
    PenaltyStarted { player_id: String, until_ms: u64 },
    PenaltyExpired { player_id: String },
}

/// Response to a buzz: `{received: true}` or `{error, lateAttempt?, buzzedBy?}`
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BuzzResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub received: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub late_attempt: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub buzzed_by: Option<String>,
}

impl BuzzResponse {
    /// Buzz recorded (not yet a verdict)
    pub fn received() -> Self {
        Self {
            received: Some(true),
            ..Self::default()
        }
    }

    pub fn rejected(rejection: &BuzzRejection) -> Self {
        Self {
            received: None,
            error: Some(rejection.code().to_string()),
            late_attempt: rejection.is_late_attempt().then_some(true),
            buzzed_by: rejection.buzzed_by().map(str::to_string),
        }
    }
}

/// Messages sent by clients
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    // === Clock Synchronization ===
    Sync {
        #[serde(default)]
        client_timestamp: Value,
    },
    /// Offset/RTT the client derived from a sync exchange
    SyncReport {
        #[serde(default)]
        offset: Value,
        #[serde(default)]
        rtt: Value,
    },
    Ping {
        #[serde(default)]
        client_timestamp: Value,
    },

    // === Room Membership ===
    Join {
        room_id: String,
        player_id: String,
        pseudonym: String,
        /// Admin rights are granted to the room's opener, or with the admin token
        #[serde(default)]
        admin: bool,
        #[serde(default)]
        admin_token: Option<String>,
    },

    // === Gameplay ===
    Buzz {
        #[serde(default)]
        client_timestamp: Value,
    },

    // === Administration ===
    JudgmentStart,
    JudgmentEnd { outcome: JudgmentOutcome },
    Reset,
    Pause { paused: bool },
    QuestionChanged,
}

impl ClientMessage {
    /// Check if this message requires admin privileges
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            ClientMessage::JudgmentStart
                | ClientMessage::JudgmentEnd { .. }
                | ClientMessage::Reset
                | ClientMessage::Pause { .. }
                | ClientMessage::QuestionChanged
        )
    }
}

/// Messages sent to clients
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    SyncReply(SyncReply),
    Pong(PingResult),
    Joined { room_id: String, player_id: String },
    BuzzResponse(BuzzResponse),
    Event { room_id: String, event: RoomEvent },
    Error { message: String },
}

/// Parse a client timestamp (ms since epoch). Only non-negative JSON numbers count.
pub fn parse_timestamp(value: &Value) -> Option<u64> {
    let ms = value.as_f64()?;
    if !ms.is_finite() || ms < 0.0 {
        return None;
    }
    Some(ms.round() as u64)
}

/// Parse a finite JSON number
pub fn parse_number(value: &Value) -> Option<f64> {
    value.as_f64().filter(|v| v.is_finite())
}
