//! Error types
//!
//! Guard rejections are expected outcomes returned to the caller, not
//! operational failures.

/// Reasons a buzz is refused. No state is mutated when one is returned.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BuzzRejection {
    #[error("Room does not exist")]
    RoomMissing,

    #[error("Round is paused")]
    RoundPaused,

    #[error("A verdict is being applied")]
    JudgmentInProgress,

    /// Someone already won this round. Carries the winner's display name.
    #[error("Round already won by {buzzed_by}")]
    AlreadyWon { buzzed_by: String },

    #[error("Buzz arrived before the question opened")]
    TooEarly,

    #[error("Player is not part of this room")]
    PlayerUnknown,

    /// Player already won or is serving a penalty
    #[error("Player has already buzzed this round")]
    AlreadyBuzzed,
}

impl BuzzRejection {
    /// Stable code sent over the wire
    pub fn code(&self) -> &'static str {
        match self {
            BuzzRejection::RoomMissing => "room_missing",
            BuzzRejection::RoundPaused => "round_paused",
            BuzzRejection::JudgmentInProgress => "judgment_in_progress",
            BuzzRejection::AlreadyWon { .. } => "already_won",
            BuzzRejection::TooEarly => "too_early",
            BuzzRejection::PlayerUnknown => "player_unknown",
            BuzzRejection::AlreadyBuzzed => "already_buzzed",
        }
    }

    /// Whether the buzz lost to an existing winner
    pub fn is_late_attempt(&self) -> bool {
        matches!(self, BuzzRejection::AlreadyWon { .. })
    }

    /// Winner display name revealed to the rejected caller, if any
    pub fn buzzed_by(&self) -> Option<&str> {
        match self {
            BuzzRejection::AlreadyWon { buzzed_by } => Some(buzzed_by),
            _ => None,
        }
    }
}

/// Errors from the verdict path
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JudgmentError {
    #[error("Room does not exist")]
    RoomMissing,

    #[error("Judgment already in progress")]
    AlreadyInProgress,

    #[error("No judgment in progress")]
    NotInProgress,

    #[error("No winner to judge")]
    NoWinner,
}

impl JudgmentError {
    pub fn code(&self) -> &'static str {
        match self {
            JudgmentError::RoomMissing => "room_missing",
            JudgmentError::AlreadyInProgress => "judgment_already_in_progress",
            JudgmentError::NotInProgress => "judgment_not_in_progress",
            JudgmentError::NoWinner => "no_winner",
        }
    }
}

/// Internal failure while resolving a grace window. The window is discarded.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ResolutionError {
    #[error("Candidate {0} has a non-finite compensated time")]
    InvalidTimestamp(String),
}

/// Failure reported by a broadcast or analytics collaborator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PublishError {
    #[error("No subscribers for room {0}")]
    NoSubscribers(String),

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Publish failed: {0}")]
    Other(String),
}
