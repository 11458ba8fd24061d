//! Timer-driven front of the engine
//!
//! Wraps [`BuzzEngine`] and arms the tokio timers the engine relies on: the
//! grace window, penalty expiry and the judgment-lock failsafe. Each timer
//! carries the identity it was armed with, so a timer that outlives its
//! round simply does nothing when it fires.

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::debug;

use crate::arbitration::{BuzzAccepted, BuzzEngine, PenaltyTicket};
use crate::error::{BuzzRejection, JudgmentError};
use crate::round::JudgmentOutcome;

/// Shared buzz service
#[derive(Clone)]
pub struct BuzzService {
    engine: Arc<BuzzEngine>,
    runtime: Handle,
}

impl BuzzService {
    pub fn new(engine: Arc<BuzzEngine>, runtime: Handle) -> Self {
        Self { engine, runtime }
    }

    /// Engine for the operations that need no timer
    pub fn engine(&self) -> &Arc<BuzzEngine> {
        &self.engine
    }

    /// Accept a buzz, arming the resolution timer if it opened a window
    pub fn accept_buzz(
        &self,
        room_id: &str,
        player_id: &str,
        client_ts: Option<u64>,
    ) -> Result<BuzzAccepted, BuzzRejection> {
        let accepted = self.engine.accept_buzz(room_id, player_id, client_ts)?;
        if let BuzzAccepted::WindowOpened { window_id, duration_ms } = accepted {
            let engine = Arc::clone(&self.engine);
            let room_id = room_id.to_string();
            self.runtime.spawn(async move {
                tokio::time::sleep(Duration::from_millis(duration_ms)).await;
                engine.resolve_window(&room_id, window_id);
            });
        }
        Ok(accepted)
    }

    /// Take the judgment lock, arming the failsafe release
    pub fn accept_judgment_start(&self, room_id: &str) -> Result<u64, JudgmentError> {
        let token = self.engine.accept_judgment_start(room_id)?;
        let timeout = self.engine.config().judgment_lock_timeout_ms;
        let engine = Arc::clone(&self.engine);
        let room_id = room_id.to_string();
        self.runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(timeout)).await;
            engine.force_release_judgment(&room_id, token);
        });
        Ok(token)
    }

    /// Apply a verdict, arming penalty expiry for an incorrect answer
    pub fn accept_judgment_end(
        &self,
        room_id: &str,
        outcome: JudgmentOutcome,
    ) -> Result<Option<PenaltyTicket>, JudgmentError> {
        let ticket = self.engine.accept_judgment_end(room_id, outcome)?;
        if let Some(ticket) = &ticket {
            self.arm_penalty(ticket.clone());
        }
        Ok(ticket)
    }

    fn arm_penalty(&self, ticket: PenaltyTicket) {
        debug!(
            "Penalty for {} in {} expires in {}ms",
            ticket.player_id, ticket.room_id, ticket.duration_ms
        );
        let engine = Arc::clone(&self.engine);
        self.runtime.spawn(async move {
            tokio::time::sleep(Duration::from_millis(ticket.duration_ms)).await;
            engine.expire_penalty(&ticket.room_id, &ticket.player_id, ticket.token);
        });
    }
}
