//! Round State Management

use std::collections::HashMap;

use tracing::info;

use crate::arbitration::GracePeriodWindow;
use crate::error::{BuzzRejection, JudgmentError};

/// A timed lockout after an incorrect answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Penalty {
    /// Identity checked by the expiry timer
    pub token: u64,
    pub until_ms: u64,
}

/// A participant in a room
#[derive(Debug, Clone, PartialEq)]
pub struct PlayerState {
    pub player_id: String,
    /// Display name shown to other players
    pub pseudonym: String,
    /// Connection used for sync/latency lookups
    pub conn_id: Option<String>,
    pub connected: bool,
    /// Hosts/admins do not buzz and do not size the grace window
    pub is_admin: bool,
    /// Set when the player won this round or is serving a penalty
    pub buzzed: bool,
    pub penalty: Option<Penalty>,
}

impl PlayerState {
    pub fn new(player_id: impl Into<String>, pseudonym: impl Into<String>) -> Self {
        Self {
            player_id: player_id.into(),
            pseudonym: pseudonym.into(),
            conn_id: None,
            connected: true,
            is_admin: false,
            buzzed: false,
            penalty: None,
        }
    }

    /// Connected, non-admin player
    pub fn is_active(&self) -> bool {
        self.connected && !self.is_admin
    }
}

/// Where the round stands
#[derive(Debug, Clone, PartialEq)]
pub enum RoundPhase {
    /// Waiting for the first buzz
    NoWinner,
    /// Grace window open, collecting candidates
    Collecting(GracePeriodWindow),
    /// Winner decided, waiting for an administrative verdict
    WinnerPendingJudgment { winner_id: String },
}

/// Held while an administrative verdict is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JudgmentLock {
    pub token: u64,
    pub acquired_at: u64,
}

/// Compact view of a round for observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
    NoWinner,
    Collecting,
    WinnerPendingJudgment,
}

/// Current state of one room's round
#[derive(Debug, Clone)]
pub struct RoundState {
    pub room_id: String,
    pub players: HashMap<String, PlayerState>,
    pub paused: bool,
    judgment: Option<JudgmentLock>,
    phase: RoundPhase,
    /// When the current question/track started, if one has been announced
    pub question_started_at: Option<u64>,
}

impl RoundState {
    pub fn new(room_id: impl Into<String>) -> Self {
        Self {
            room_id: room_id.into(),
            players: HashMap::new(),
            paused: false,
            judgment: None,
            phase: RoundPhase::NoWinner,
            question_started_at: None,
        }
    }

    pub fn status(&self) -> RoundStatus {
        match self.phase {
            RoundPhase::NoWinner => RoundStatus::NoWinner,
            RoundPhase::Collecting(_) => RoundStatus::Collecting,
            RoundPhase::WinnerPendingJudgment { .. } => RoundStatus::WinnerPendingJudgment,
        }
    }

    pub fn winner_id(&self) -> Option<&str> {
        match &self.phase {
            RoundPhase::WinnerPendingJudgment { winner_id } => Some(winner_id),
            _ => None,
        }
    }

    pub fn window(&self) -> Option<&GracePeriodWindow> {
        match &self.phase {
            RoundPhase::Collecting(window) => Some(window),
            _ => None,
        }
    }

    pub fn window_mut(&mut self) -> Option<&mut GracePeriodWindow> {
        match &mut self.phase {
            RoundPhase::Collecting(window) => Some(window),
            _ => None,
        }
    }

    /// Open a grace window. Only valid from `NoWinner`.
    pub fn open_window(&mut self, window: GracePeriodWindow) -> bool {
        if !matches!(self.phase, RoundPhase::NoWinner) {
            return false;
        }
        self.phase = RoundPhase::Collecting(window);
        true
    }

    /// Remove the open window if it has the given id
    pub fn take_window(&mut self, window_id: u64) -> Option<GracePeriodWindow> {
        match &self.phase {
            RoundPhase::Collecting(window) if window.id == window_id => {}
            _ => return None,
        }
        match std::mem::replace(&mut self.phase, RoundPhase::NoWinner) {
            RoundPhase::Collecting(window) => Some(window),
            other => {
                self.phase = other;
                None
            }
        }
    }

    /// Drop any open window without a verdict. Returns true if one existed.
    pub fn discard_window(&mut self) -> bool {
        if matches!(self.phase, RoundPhase::Collecting(_)) {
            self.phase = RoundPhase::NoWinner;
            return true;
        }
        false
    }

    /// Record the winner of a resolved window
    pub fn set_winner(&mut self, player_id: &str) -> bool {
        let Some(player) = self.players.get_mut(player_id) else {
            return false;
        };
        player.buzzed = true;
        self.phase = RoundPhase::WinnerPendingJudgment {
            winner_id: player_id.to_string(),
        };
        true
    }

    /// Clear the winner without touching anyone's buzzed flag
    pub fn clear_winner(&mut self) {
        if matches!(self.phase, RoundPhase::WinnerPendingJudgment { .. }) {
            self.phase = RoundPhase::NoWinner;
        }
    }

    /// Full reset: no window, no winner, all flags and penalties cleared
    pub fn reset(&mut self) {
        self.phase = RoundPhase::NoWinner;
        for player in self.players.values_mut() {
            player.buzzed = false;
            player.penalty = None;
        }
    }

    /// A winner whose buzzed flag was already cleared (or who left) is stale
    pub fn has_stale_winner(&self) -> bool {
        match self.winner_id() {
            Some(id) => !self.players.get(id).is_some_and(|p| p.buzzed),
            None => false,
        }
    }

    /// Silently drop a stale winner. Returns true if one was healed.
    pub fn heal_stale_winner(&mut self) -> bool {
        if self.has_stale_winner() {
            self.phase = RoundPhase::NoWinner;
            return true;
        }
        false
    }

    // === Judgment lock ===

    pub fn is_judgment_locked(&self) -> bool {
        self.judgment.is_some()
    }

    pub fn judgment_lock(&self) -> Option<JudgmentLock> {
        self.judgment
    }

    /// Take the judgment lock. Not reentrant.
    pub fn acquire_judgment(&mut self, token: u64, now_ms: u64) -> Result<(), JudgmentError> {
        if self.judgment.is_some() {
            return Err(JudgmentError::AlreadyInProgress);
        }
        self.judgment = Some(JudgmentLock {
            token,
            acquired_at: now_ms,
        });
        Ok(())
    }

    /// Release the lock. With a token, only that acquisition is released.
    pub fn release_judgment(&mut self, token: Option<u64>) -> bool {
        match (self.judgment, token) {
            (Some(lock), Some(t)) if lock.token != t => false,
            (Some(_), _) => {
                self.judgment = None;
                true
            }
            (None, _) => false,
        }
    }

    // === Penalties ===

    /// Lock a player out until `until_ms`
    pub fn start_penalty(&mut self, player_id: &str, token: u64, until_ms: u64) -> bool {
        let Some(player) = self.players.get_mut(player_id) else {
            return false;
        };
        player.buzzed = true;
        player.penalty = Some(Penalty { token, until_ms });
        true
    }

    /// End a penalty if it is still the one identified by `token`
    pub fn expire_penalty(&mut self, player_id: &str, token: u64) -> bool {
        let Some(player) = self.players.get_mut(player_id) else {
            return false;
        };
        if player.penalty.map(|p| p.token) != Some(token) {
            return false;
        }
        player.penalty = None;
        if !player.buzzed {
            return false;
        }
        player.buzzed = false;
        true
    }

    // === Buzz eligibility ===

    /// Run the buzz guards in order. A stale winner is treated as absent and
    /// only healed once every guard has passed, so a rejection changes nothing.
    pub fn check_buzz(
        &mut self,
        player_id: &str,
        now_ms: u64,
        min_buzz_delay_ms: u64,
    ) -> Result<&PlayerState, BuzzRejection> {
        if self.paused {
            return Err(BuzzRejection::RoundPaused);
        }
        if self.is_judgment_locked() {
            return Err(BuzzRejection::JudgmentInProgress);
        }
        let stale = self.has_stale_winner();
        if let Some(winner_id) = self.winner_id().filter(|_| !stale) {
            let buzzed_by = self
                .players
                .get(winner_id)
                .map(|p| p.pseudonym.clone())
                .unwrap_or_default();
            return Err(BuzzRejection::AlreadyWon { buzzed_by });
        }
        if let Some(started) = self.question_started_at {
            if now_ms < started.saturating_add(min_buzz_delay_ms) {
                return Err(BuzzRejection::TooEarly);
            }
        }
        let player = self
            .players
            .get(player_id)
            .filter(|p| !p.is_admin)
            .ok_or(BuzzRejection::PlayerUnknown)?;
        if player.buzzed {
            return Err(BuzzRejection::AlreadyBuzzed);
        }

        if stale && self.heal_stale_winner() {
            info!("Room {}: stale winner cleared, accepting new buzz", self.room_id);
        }
        self.players.get(player_id).ok_or(BuzzRejection::PlayerUnknown)
    }

    /// Connected non-admin players
    pub fn active_players(&self) -> impl Iterator<Item = &PlayerState> {
        self.players.values().filter(|p| p.is_active())
    }

    /// Mark every player on a connection as disconnected
    pub fn disconnect(&mut self, conn_id: &str) -> Vec<String> {
        let mut affected = Vec::new();
        for player in self.players.values_mut() {
            if player.conn_id.as_deref() == Some(conn_id) {
                player.connected = false;
                affected.push(player.player_id.clone());
            }
        }
        affected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arbitration::BuzzCandidate;

    fn round_with_players() -> RoundState {
        let mut round = RoundState::new("room");
        round.players.insert("p1".to_string(), PlayerState::new("p1", "Ada"));
        round.players.insert("p2".to_string(), PlayerState::new("p2", "Bob"));
        round
    }

    fn window(id: u64, player: &str) -> GracePeriodWindow {
        GracePeriodWindow::open(
            id,
            150,
            0,
            BuzzCandidate {
                player_id: player.to_string(),
                pseudonym: player.to_string(),
                raw_client_timestamp: None,
                server_receive_timestamp: 0,
                compensated_timestamp: 0.0,
                rtt: 150.0,
                is_synced: false,
            },
        )
    }

    #[test]
    fn test_guard_order() {
        let mut round = round_with_players();
        round.paused = true;
        round.acquire_judgment(1, 0).unwrap();
        assert_eq!(round.check_buzz("p1", 0, 0).unwrap_err(), BuzzRejection::RoundPaused);

        round.paused = false;
        assert_eq!(round.check_buzz("p1", 0, 0).unwrap_err(), BuzzRejection::JudgmentInProgress);

        round.release_judgment(None);
        assert_eq!(round.check_buzz("ghost", 0, 0).unwrap_err(), BuzzRejection::PlayerUnknown);
        assert!(round.check_buzz("p1", 0, 0).is_ok());
    }

    #[test]
    fn test_too_early() {
        let mut round = round_with_players();
        round.question_started_at = Some(1_000);
        assert_eq!(round.check_buzz("p1", 1_200, 500).unwrap_err(), BuzzRejection::TooEarly);
        assert!(round.check_buzz("p1", 1_500, 500).is_ok());
    }

    #[test]
    fn test_already_won_reveals_name() {
        let mut round = round_with_players();
        assert!(round.set_winner("p1"));
        assert_eq!(
            round.check_buzz("p2", 0, 0).unwrap_err(),
            BuzzRejection::AlreadyWon {
                buzzed_by: "Ada".to_string()
            }
        );
        assert_eq!(round.status(), RoundStatus::WinnerPendingJudgment);
    }

    #[test]
    fn test_stale_winner_self_heals() {
        let mut round = round_with_players();
        round.set_winner("p1");
        round.players.get_mut("p1").unwrap().buzzed = false;

        assert!(round.check_buzz("p2", 0, 0).is_ok());
        assert_eq!(round.winner_id(), None);
    }

    #[test]
    fn test_rejected_buzz_keeps_stale_winner() {
        let mut round = round_with_players();
        round.set_winner("p1");
        round.players.get_mut("p1").unwrap().buzzed = false;
        round.players.get_mut("p2").unwrap().buzzed = true;
        round.question_started_at = Some(1_000);

        assert_eq!(round.check_buzz("ghost", 2_000, 0).unwrap_err(), BuzzRejection::PlayerUnknown);
        assert_eq!(round.check_buzz("p1", 1_100, 500).unwrap_err(), BuzzRejection::TooEarly);
        assert_eq!(round.check_buzz("p2", 2_000, 500).unwrap_err(), BuzzRejection::AlreadyBuzzed);
        assert_eq!(round.status(), RoundStatus::WinnerPendingJudgment);
        assert_eq!(round.winner_id(), Some("p1"));

        // The first buzz that passes every guard heals it
        assert!(round.check_buzz("p1", 2_000, 500).is_ok());
        assert_eq!(round.status(), RoundStatus::NoWinner);
    }

    #[test]
    fn test_winner_who_left_is_stale() {
        let mut round = round_with_players();
        round.set_winner("p1");
        round.players.remove("p1");
        assert!(round.has_stale_winner());
    }

    #[test]
    fn test_judgment_lock_not_reentrant() {
        let mut round = round_with_players();
        round.acquire_judgment(7, 0).unwrap();
        assert_eq!(round.acquire_judgment(8, 0).unwrap_err(), JudgmentError::AlreadyInProgress);
        // Wrong token does not release
        assert!(!round.release_judgment(Some(8)));
        assert!(round.is_judgment_locked());
        assert!(round.release_judgment(Some(7)));
        assert!(!round.release_judgment(None));
    }

    #[test]
    fn test_window_lifecycle() {
        let mut round = round_with_players();
        assert!(round.open_window(window(1, "p1")));
        assert!(!round.open_window(window(2, "p2")));
        assert_eq!(round.status(), RoundStatus::Collecting);

        assert!(round.take_window(2).is_none());
        assert!(round.window().is_some());
        assert!(round.take_window(1).is_some());
        assert_eq!(round.status(), RoundStatus::NoWinner);

        round.open_window(window(3, "p1"));
        assert!(round.discard_window());
        assert!(!round.discard_window());
    }

    #[test]
    fn test_penalty_expiry_respects_token() {
        let mut round = round_with_players();
        round.start_penalty("p1", 1, 5_000);
        assert!(!round.expire_penalty("p1", 2));
        assert!(round.players["p1"].buzzed);

        assert!(round.expire_penalty("p1", 1));
        assert!(!round.players["p1"].buzzed);
        // Second expiry is a no-op
        assert!(!round.expire_penalty("p1", 1));
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut round = round_with_players();
        round.set_winner("p1");
        round.start_penalty("p2", 1, 10);
        round.reset();
        assert_eq!(round.winner_id(), None);
        assert!(round.players.values().all(|p| !p.buzzed && p.penalty.is_none()));
    }

    #[test]
    fn test_disconnect_marks_players() {
        let mut round = round_with_players();
        round.players.get_mut("p1").unwrap().conn_id = Some("c1".to_string());
        assert_eq!(round.disconnect("c1"), vec!["p1".to_string()]);
        assert!(!round.players["p1"].connected);
        assert_eq!(round.active_players().count(), 1);
    }
}
