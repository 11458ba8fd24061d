//! Collaborator interfaces
//!
//! The engine publishes room events and verdict summaries through these
//! traits. Publishing is fire-and-forget: errors are logged by the engine and
//! never roll back a decision.

use std::sync::Arc;

use crate::error::PublishError;
use crate::round::{BuzzVerdict, RoomEvent};

/// Room-scoped fan-out to connected clients
pub trait Broadcaster: Send + Sync {
    fn publish(&self, room_id: &str, event: &RoomEvent) -> Result<(), PublishError>;
}

/// Buzz history sink
pub trait AnalyticsSink: Send + Sync {
    fn record_buzz_event(&self, room_id: &str, verdict: &BuzzVerdict) -> Result<(), PublishError>;
}

/// Collaborator that drops everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl Broadcaster for NullSink {
    fn publish(&self, _room_id: &str, _event: &RoomEvent) -> Result<(), PublishError> {
        Ok(())
    }
}

impl AnalyticsSink for NullSink {
    fn record_buzz_event(&self, _room_id: &str, _verdict: &BuzzVerdict) -> Result<(), PublishError> {
        Ok(())
    }
}

/// Shared handles to the engine's collaborators
#[derive(Clone)]
pub struct Collaborators {
    pub broadcaster: Arc<dyn Broadcaster>,
    pub analytics: Arc<dyn AnalyticsSink>,
}

impl Collaborators {
    pub fn new(broadcaster: Arc<dyn Broadcaster>, analytics: Arc<dyn AnalyticsSink>) -> Self {
        Self {
            broadcaster,
            analytics,
        }
    }

    /// Collaborators that discard every event
    pub fn null() -> Self {
        Self::new(Arc::new(NullSink), Arc::new(NullSink))
    }

    pub(crate) fn publish(&self, room_id: &str, event: &RoomEvent) {
        if let Err(e) = self.broadcaster.publish(room_id, event) {
            tracing::warn!("Broadcast to room {} failed: {}", room_id, e);
        }
    }

    pub(crate) fn record(&self, room_id: &str, verdict: &BuzzVerdict) {
        if let Err(e) = self.analytics.record_buzz_event(room_id, verdict) {
            tracing::warn!("Analytics for room {} failed: {}", room_id, e);
        }
    }
}
