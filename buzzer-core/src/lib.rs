//! Buzzer Core - Buzz Arbitration Library
//!
//! Decides, fairly and under network jitter, which player buzzed first in a
//! live quiz round. Clients are kept on the server time reference by clock
//! sync and latency probing; near-simultaneous buzzes are collected during a
//! short grace window and resolved with latency compensation.

pub mod arbitration;
pub mod clock_sync;
pub mod collaborators;
pub mod config;
pub mod error;
pub mod latency;
pub mod round;
pub mod service;
pub mod time;

// Re-exports for convenience
pub use arbitration::{BuzzAccepted, BuzzEngine, JudgmentGuard, PenaltyTicket, RoundSnapshot};
pub use collaborators::{AnalyticsSink, Broadcaster, Collaborators, NullSink};
pub use config::EngineConfig;
pub use error::{BuzzRejection, JudgmentError, PublishError, ResolutionError};
pub use round::{BuzzVerdict, ClientMessage, JudgmentOutcome, RoomEvent, ServerMessage};
pub use service::BuzzService;
pub use time::{ManualTime, SystemTime, TimeSource};
