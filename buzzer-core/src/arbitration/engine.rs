//! Arbitration engine
//!
//! Owns every room's round state plus the per-connection sync and latency
//! stores. All mutation goes through the operations below; the only
//! suspension points (grace window, penalty, judgment failsafe) are timers
//! driven from outside that call back with the identity they were armed with.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use crate::clock_sync::{ClientSyncRecord, ClockOffsetEstimator, SyncReply};
use crate::collaborators::Collaborators;
use crate::config::EngineConfig;
use crate::error::{BuzzRejection, JudgmentError, ResolutionError};
use crate::latency::{LatencyProbe, PingResult};
use crate::round::{
    BuzzVerdict, CandidateDetail, JudgmentOutcome, PlayerState, ResetReason, RoomEvent, RoundState,
    RoundStatus,
};
use crate::time::TimeSource;

use super::window::{self, BuzzCandidate, GracePeriodWindow};

/// Round state of one room behind its own lock
pub type SharedRound = Arc<Mutex<RoundState>>;

/// Successful buzz acknowledgement. None of these is a verdict yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BuzzAccepted {
    /// First buzz of the round; the caller must fire `resolve_window` after `duration_ms`
    WindowOpened { window_id: u64, duration_ms: u64 },
    /// Added to the open window
    Queued,
    /// Repeat buzz from a player already in the window
    Duplicate,
}

/// Penalty armed by an incorrect verdict; fire `expire_penalty` after `duration_ms`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PenaltyTicket {
    pub room_id: String,
    pub player_id: String,
    pub token: u64,
    pub duration_ms: u64,
}

/// Point-in-time view of a room, for observers and tests
#[derive(Debug, Clone, PartialEq)]
pub struct RoundSnapshot {
    pub status: RoundStatus,
    pub winner_id: Option<String>,
    pub paused: bool,
    pub judgment_locked: bool,
    pub window_candidates: Vec<String>,
    pub buzzed_players: Vec<String>,
}

/// The buzz arbitration engine
pub struct BuzzEngine {
    config: EngineConfig,
    time: Arc<dyn TimeSource>,
    collaborators: Collaborators,
    rooms: RwLock<HashMap<String, SharedRound>>,
    clock: RwLock<ClockOffsetEstimator>,
    probe: Mutex<LatencyProbe>,
    rng: Mutex<StdRng>,
    next_id: AtomicU64,
}

impl BuzzEngine {
    pub fn new(config: EngineConfig, time: Arc<dyn TimeSource>, collaborators: Collaborators) -> Self {
        let rng = match config.tiebreak_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            time,
            collaborators,
            rooms: RwLock::new(HashMap::new()),
            clock: RwLock::new(ClockOffsetEstimator::new()),
            probe: Mutex::new(LatencyProbe::new()),
            rng: Mutex::new(rng),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now_ms(&self) -> u64 {
        self.time.now_ms()
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    fn room(&self, room_id: &str) -> Option<SharedRound> {
        self.rooms.read().get(room_id).cloned()
    }

    fn publish_all(&self, room_id: &str, events: &[RoomEvent]) {
        for event in events {
            self.collaborators.publish(room_id, event);
        }
    }

    // === Room collaborator feed ===

    /// Create a room. Returns false if it already exists.
    pub fn open_room(&self, room_id: &str) -> bool {
        let mut rooms = self.rooms.write();
        if rooms.contains_key(room_id) {
            return false;
        }
        rooms.insert(room_id.to_string(), Arc::new(Mutex::new(RoundState::new(room_id))));
        info!("Opened room {}", room_id);
        true
    }

    /// Remove a room. Any open window is dropped and pending timers become no-ops.
    pub fn close_room(&self, room_id: &str) -> bool {
        let removed = self.rooms.write().remove(room_id).is_some();
        if removed {
            info!("Closed room {}", room_id);
        }
        removed
    }

    pub fn room_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.rooms.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Add or refresh a player. Rejoining keeps the buzzed flag and penalty.
    pub fn register_player(
        &self,
        room_id: &str,
        player_id: &str,
        pseudonym: &str,
        conn_id: Option<&str>,
        is_admin: bool,
    ) -> bool {
        let Some(shared) = self.room(room_id) else {
            return false;
        };
        let mut round = shared.lock();
        let player = round
            .players
            .entry(player_id.to_string())
            .or_insert_with(|| PlayerState::new(player_id, pseudonym));
        player.pseudonym = pseudonym.to_string();
        player.conn_id = conn_id.map(str::to_string);
        player.connected = true;
        player.is_admin = is_admin;
        debug!("Room {}: registered {} ({}), admin={}", room_id, player_id, pseudonym, is_admin);
        true
    }

    pub fn remove_player(&self, room_id: &str, player_id: &str) -> bool {
        let Some(shared) = self.room(room_id) else {
            return false;
        };
        let removed = shared.lock().players.remove(player_id).is_some();
        if removed {
            debug!("Room {}: removed {}", room_id, player_id);
        }
        removed
    }

    /// Pause or resume buzzing. Pausing drops any open window without a verdict.
    pub fn set_paused(&self, room_id: &str, paused: bool) -> bool {
        let Some(shared) = self.room(room_id) else {
            return false;
        };
        {
            let mut round = shared.lock();
            if round.paused == paused {
                return true;
            }
            round.paused = paused;
            if paused && round.discard_window() {
                info!("Room {}: paused, open window discarded", room_id);
            }
        }
        self.collaborators.publish(room_id, &RoomEvent::RoundPaused { paused });
        true
    }

    /// A new question/track started: reset the round and restart the early-buzz guard
    pub fn mark_question_changed(&self, room_id: &str) -> bool {
        let Some(shared) = self.room(room_id) else {
            return false;
        };
        {
            let mut round = shared.lock();
            round.reset();
            round.question_started_at = Some(self.now_ms());
        }
        debug!("Room {}: question changed", room_id);
        self.collaborators.publish(
            room_id,
            &RoomEvent::RoundReset {
                reason: ResetReason::QuestionChanged,
            },
        );
        true
    }

    // === Clock sync and latency ===

    pub fn accept_sync(&self, conn_id: &str, client_ts: Option<u64>) -> SyncReply {
        self.clock.read().handle_sync(conn_id, client_ts, self.now_ms())
    }

    /// Offset/RTT computed by the client from a sync exchange
    pub fn accept_sync_report(&self, conn_id: &str, offset: Option<f64>, rtt: Option<f64>) -> bool {
        let (Some(offset), Some(rtt)) = (offset, rtt) else {
            debug!("Incomplete sync report from {}", conn_id);
            return false;
        };
        self.clock.write().record_offset(conn_id, offset, rtt, self.now_ms())
    }

    pub fn accept_ping(&self, conn_id: &str, client_ts: Option<u64>) -> PingResult {
        self.probe.lock().handle_ping(conn_id, client_ts, self.now_ms())
    }

    pub fn sync_stats(&self, conn_id: &str) -> Option<ClientSyncRecord> {
        self.clock.read().get_stats(conn_id).cloned()
    }

    /// Connection closed: forget its sync data and mark its players absent.
    /// Open windows are left alone; absent candidates drop out at resolution.
    pub fn accept_disconnect(&self, conn_id: &str) {
        self.clock.write().cleanup(conn_id);
        self.probe.lock().cleanup(conn_id);

        let rooms: Vec<SharedRound> = self.rooms.read().values().cloned().collect();
        for shared in rooms {
            let mut round = shared.lock();
            for player_id in round.disconnect(conn_id) {
                debug!("Room {}: {} disconnected", round.room_id, player_id);
            }
        }
    }

    /// RTT used for a player: clock sync average if synced, else the fallback
    fn player_rtt(&self, player: &PlayerState, use_probe: bool) -> (f64, bool) {
        let Some(conn_id) = player.conn_id.as_deref() else {
            return (self.config.default_rtt_ms, false);
        };
        if let Some(stats) = self.clock.read().get_stats(conn_id).filter(|s| s.is_synced()) {
            return (stats.average_rtt, true);
        }
        let fallback = if use_probe {
            self.probe.lock().average_ms(conn_id)
        } else {
            None
        };
        (fallback.unwrap_or(self.config.default_rtt_ms), false)
    }

    // === Buzzing ===

    /// Accept a buzz. On rejection nothing changes.
    pub fn accept_buzz(
        &self,
        room_id: &str,
        player_id: &str,
        client_ts: Option<u64>,
    ) -> Result<BuzzAccepted, BuzzRejection> {
        let shared = self.room(room_id).ok_or(BuzzRejection::RoomMissing)?;
        let now = self.now_ms();
        let mut round = shared.lock();

        let player = round
            .check_buzz(player_id, now, self.config.min_buzz_delay_ms)?
            .clone();

        if round.window().is_some_and(|w| w.contains(player_id)) {
            debug!("Room {}: duplicate buzz from {}", room_id, player_id);
            return Ok(BuzzAccepted::Duplicate);
        }

        let (rtt, is_synced) = self.player_rtt(&player, true);
        let candidate = BuzzCandidate {
            player_id: player.player_id.clone(),
            pseudonym: player.pseudonym.clone(),
            raw_client_timestamp: client_ts,
            server_receive_timestamp: now,
            compensated_timestamp: window::compensate(client_ts, now, is_synced, rtt),
            rtt,
            is_synced,
        };

        if let Some(open) = round.window_mut() {
            open.push(candidate);
            debug!(
                "Room {}: {} joined window {} ({} candidates)",
                room_id,
                player_id,
                open.id,
                open.candidates().len()
            );
            return Ok(BuzzAccepted::Queued);
        }

        let rtts: Vec<f64> = round
            .active_players()
            .map(|p| self.player_rtt(p, false).0)
            .collect();
        let duration_ms = window::window_duration_ms(&rtts);
        let window_id = self.next_id();
        round.open_window(GracePeriodWindow::open(window_id, duration_ms, now, candidate));

        debug!(
            "Room {}: {} opened window {} for {}ms ({} active players)",
            room_id,
            player_id,
            window_id,
            duration_ms,
            rtts.len()
        );
        Ok(BuzzAccepted::WindowOpened { window_id, duration_ms })
    }

    /// Timer callback: resolve the window if it is still the one that was armed.
    /// Returns the published verdict, or `None` for a stale timer, an empty
    /// window or an internal failure.
    pub fn resolve_window(&self, room_id: &str, window_id: u64) -> Option<BuzzVerdict> {
        let Some(shared) = self.room(room_id) else {
            debug!("Window {} fired for closed room {}", window_id, room_id);
            return None;
        };

        let verdict = {
            let mut round = shared.lock();
            let Some(window) = round.take_window(window_id) else {
                debug!("Room {}: stale window {} ignored", room_id, window_id);
                return None;
            };
            match self.decide(&mut round, window) {
                Ok(verdict) => verdict,
                Err(e) => {
                    error!("Room {}: resolution of window {} failed: {}", room_id, window_id, e);
                    return None;
                }
            }
        };

        let verdict = verdict?;
        info!(
            "Room {}: {} wins ({} candidates, equality={}, random={})",
            room_id,
            verdict.winner_pseudonym,
            verdict.candidates.len(),
            verdict.had_equality,
            verdict.had_random_tiebreak
        );
        self.collaborators.record(room_id, &verdict);
        self.collaborators.publish(room_id, &RoomEvent::BuzzVerdict(verdict.clone()));
        Some(verdict)
    }

    fn decide(
        &self,
        round: &mut RoundState,
        window: GracePeriodWindow,
    ) -> Result<Option<BuzzVerdict>, ResolutionError> {
        let duration_ms = window.duration_ms;
        let started_at = window.started_at;
        let present: Vec<BuzzCandidate> = window
            .into_candidates()
            .into_iter()
            .filter(|c| round.players.get(&c.player_id).is_some_and(|p| p.connected))
            .collect();

        let resolution = {
            let mut rng = self.rng.lock();
            window::resolve(present, &mut *rng)?
        };
        let Some(resolution) = resolution else {
            debug!("Room {}: no candidates left, round aborted", round.room_id);
            return Ok(None);
        };

        // Candidates were filtered against the roster under this lock
        let winner = resolution.winner().clone();
        round.set_winner(&winner.player_id);

        Ok(Some(BuzzVerdict {
            winner_id: winner.player_id,
            winner_pseudonym: winner.pseudonym,
            candidates: resolution.ranked.iter().map(CandidateDetail::from).collect(),
            had_equality: resolution.had_equality,
            had_random_tiebreak: resolution.had_random_tiebreak,
            window_duration_ms: duration_ms,
            equality_threshold_ms: resolution.equality_threshold_ms,
            window_started_at: started_at,
            resolved_at: self.now_ms(),
        }))
    }

    // === Judgment ===

    /// Take the judgment lock. Returns the lock token for the failsafe timer.
    pub fn accept_judgment_start(&self, room_id: &str) -> Result<u64, JudgmentError> {
        let shared = self.room(room_id).ok_or(JudgmentError::RoomMissing)?;
        let token = self.next_id();
        shared.lock().acquire_judgment(token, self.now_ms())?;
        debug!("Room {}: judgment started (lock {})", room_id, token);
        self.collaborators.publish(room_id, &RoomEvent::JudgmentStarted);
        Ok(token)
    }

    /// Apply the verdict and release the lock. The lock is released whatever
    /// the outcome of applying the verdict.
    pub fn accept_judgment_end(
        &self,
        room_id: &str,
        outcome: JudgmentOutcome,
    ) -> Result<Option<PenaltyTicket>, JudgmentError> {
        self.end_judgment(room_id, None, outcome)
    }

    /// Scoped judgment: the lock is released when the guard is finished or dropped
    pub fn begin_judgment(&self, room_id: &str) -> Result<JudgmentGuard<'_>, JudgmentError> {
        let token = self.accept_judgment_start(room_id)?;
        Ok(JudgmentGuard {
            engine: self,
            room_id: room_id.to_string(),
            token,
            finished: false,
        })
    }

    /// Failsafe: release the lock if `token` still holds it
    pub fn force_release_judgment(&self, room_id: &str, token: u64) -> bool {
        let Some(shared) = self.room(room_id) else {
            return false;
        };
        let released = shared.lock().release_judgment(Some(token));
        if released {
            warn!("Room {}: judgment lock {} force-released", room_id, token);
            self.collaborators.publish(
                room_id,
                &RoomEvent::JudgmentEnded {
                    outcome: JudgmentOutcome::Aborted,
                },
            );
        }
        released
    }

    fn end_judgment(
        &self,
        room_id: &str,
        token: Option<u64>,
        outcome: JudgmentOutcome,
    ) -> Result<Option<PenaltyTicket>, JudgmentError> {
        let shared = self.room(room_id).ok_or(JudgmentError::RoomMissing)?;
        let mut events = Vec::new();

        let result = {
            let mut round = shared.lock();
            match round.judgment_lock() {
                Some(lock) if token.map_or(true, |t| t == lock.token) => {}
                _ => return Err(JudgmentError::NotInProgress),
            }
            let applied = self.apply_outcome(&mut round, outcome, &mut events);
            round.release_judgment(token);
            applied
        };

        debug!("Room {}: judgment ended ({:?})", room_id, outcome);
        events.insert(0, RoomEvent::JudgmentEnded { outcome });
        self.publish_all(room_id, &events);
        result
    }

    fn apply_outcome(
        &self,
        round: &mut RoundState,
        outcome: JudgmentOutcome,
        events: &mut Vec<RoomEvent>,
    ) -> Result<Option<PenaltyTicket>, JudgmentError> {
        match outcome {
            JudgmentOutcome::Aborted => Ok(None),
            JudgmentOutcome::Correct => {
                if round.winner_id().is_none() {
                    return Err(JudgmentError::NoWinner);
                }
                round.reset();
                events.push(RoomEvent::RoundReset {
                    reason: ResetReason::Judged,
                });
                Ok(None)
            }
            JudgmentOutcome::Incorrect { penalty_ms } => {
                let winner_id = round.winner_id().ok_or(JudgmentError::NoWinner)?.to_string();
                let duration_ms = penalty_ms.unwrap_or(self.config.default_penalty_ms);
                let token = self.next_id();
                let until_ms = self.now_ms().saturating_add(duration_ms);

                round.start_penalty(&winner_id, token, until_ms);
                round.clear_winner();
                events.push(RoomEvent::PenaltyStarted {
                    player_id: winner_id.clone(),
                    until_ms,
                });
                Ok(Some(PenaltyTicket {
                    room_id: round.room_id.clone(),
                    player_id: winner_id,
                    token,
                    duration_ms,
                }))
            }
        }
    }

    /// Penalty timer callback. No-op if the player, room or penalty is gone.
    pub fn expire_penalty(&self, room_id: &str, player_id: &str, token: u64) -> bool {
        let Some(shared) = self.room(room_id) else {
            return false;
        };
        let expired = shared.lock().expire_penalty(player_id, token);
        if expired {
            debug!("Room {}: penalty for {} expired", room_id, player_id);
            self.collaborators.publish(
                room_id,
                &RoomEvent::PenaltyExpired {
                    player_id: player_id.to_string(),
                },
            );
        }
        expired
    }

    // === Reset ===

    /// Administrative reset: drop any window without a verdict and clear the round
    pub fn accept_reset(&self, room_id: &str) -> bool {
        let Some(shared) = self.room(room_id) else {
            return false;
        };
        {
            let mut round = shared.lock();
            if round.discard_window() {
                info!("Room {}: reset discarded open window", room_id);
            }
            round.reset();
        }
        self.collaborators.publish(
            room_id,
            &RoomEvent::RoundReset {
                reason: ResetReason::Admin,
            },
        );
        true
    }

    // === Observation ===

    pub fn snapshot(&self, room_id: &str) -> Option<RoundSnapshot> {
        let shared = self.room(room_id)?;
        let round = shared.lock();
        let mut buzzed_players: Vec<String> = round
            .players
            .values()
            .filter(|p| p.buzzed)
            .map(|p| p.player_id.clone())
            .collect();
        buzzed_players.sort();
        let snapshot = RoundSnapshot {
            status: round.status(),
            winner_id: round.winner_id().map(str::to_string),
            paused: round.paused,
            judgment_locked: round.is_judgment_locked(),
            window_candidates: round
                .window()
                .map(|w| w.candidates().iter().map(|c| c.player_id.clone()).collect())
                .unwrap_or_default(),
            buzzed_players,
        };
        Some(snapshot)
    }
}

/// Judgment lock held for the lifetime of the guard
pub struct JudgmentGuard<'a> {
    engine: &'a BuzzEngine,
    room_id: String,
    token: u64,
    finished: bool,
}

impl JudgmentGuard<'_> {
    pub fn token(&self) -> u64 {
        self.token
    }

    /// Apply the verdict and release the lock
    pub fn finish(mut self, outcome: JudgmentOutcome) -> Result<Option<PenaltyTicket>, JudgmentError> {
        self.finished = true;
        self.engine.end_judgment(&self.room_id, Some(self.token), outcome)
    }
}

impl Drop for JudgmentGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.engine.force_release_judgment(&self.room_id, self.token);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::testing::{recording, Recorder};
    use crate::time::ManualTime;

    struct Harness {
        engine: BuzzEngine,
        time: Arc<ManualTime>,
        recorder: Arc<Recorder>,
    }

    fn harness_with(recorder: Recorder, seed: u64) -> Harness {
        let time = ManualTime::new(1_000_000);
        let recorder = Arc::new(recorder);
        let engine = BuzzEngine::new(
            EngineConfig::default().with_seed(seed),
            time.clone(),
            recording(&recorder),
        );
        engine.open_room("room");
        for (id, name) in [("p1", "Ada"), ("p2", "Bob"), ("p3", "Cy")] {
            let conn = format!("conn-{}", id);
            engine.register_player("room", id, name, Some(&conn), false);
        }
        engine.register_player("room", "host", "Host", Some("conn-host"), true);
        Harness { engine, time, recorder }
    }

    fn harness() -> Harness {
        harness_with(Recorder::default(), 7)
    }

    fn sync(h: &Harness, player: &str, rtt: f64) {
        let conn = format!("conn-{}", player);
        assert!(h.engine.accept_sync_report(&conn, Some(0.0), Some(rtt)));
    }

    fn opened(result: Result<BuzzAccepted, BuzzRejection>) -> (u64, u64) {
        match result.unwrap() {
            BuzzAccepted::WindowOpened { window_id, duration_ms } => (window_id, duration_ms),
            other => panic!("expected a new window, got {:?}", other),
        }
    }

    #[test]
    fn test_single_synced_buzz_wins() {
        let h = harness();
        sync(&h, "p1", 80.0);
        let now = h.engine.now_ms();

        let (window_id, duration_ms) = opened(h.engine.accept_buzz("room", "p1", Some(now - 40)));
        assert!(h.recorder.verdicts().is_empty());

        h.time.advance(duration_ms);
        let verdict = h.engine.resolve_window("room", window_id).unwrap();
        assert_eq!(verdict.winner_id, "p1");
        assert_eq!(verdict.winner_pseudonym, "Ada");
        assert!(!verdict.had_equality);
        assert!(!verdict.had_random_tiebreak);
        assert_eq!(verdict.candidates[0].compensated_timestamp, (now - 40) as f64);
        assert_eq!(verdict.window_duration_ms, duration_ms);

        let snapshot = h.engine.snapshot("room").unwrap();
        assert_eq!(snapshot.status, RoundStatus::WinnerPendingJudgment);
        assert_eq!(snapshot.winner_id.as_deref(), Some("p1"));
        assert_eq!(snapshot.buzzed_players, vec!["p1".to_string()]);
        assert_eq!(h.recorder.verdicts().len(), 1);
        assert!(matches!(h.recorder.events().last(), Some(RoomEvent::BuzzVerdict(_))));
    }

    #[test]
    fn test_synced_earliest_wins_outside_threshold() {
        let h = harness();
        sync(&h, "p1", 100.0);
        sync(&h, "p2", 100.0);
        let now = h.engine.now_ms();

        // p2 arrives first but its client timestamp is 200ms later
        let (window_id, _) = opened(h.engine.accept_buzz("room", "p2", Some(now)));
        h.time.advance(20);
        assert_eq!(h.engine.accept_buzz("room", "p1", Some(now - 200)), Ok(BuzzAccepted::Queued));

        let verdict = h.engine.resolve_window("room", window_id).unwrap();
        assert_eq!(verdict.winner_id, "p1");
        assert!(!verdict.had_random_tiebreak);
        assert_eq!(verdict.equality_threshold_ms, 50);
        assert_eq!(verdict.candidates.len(), 2);
    }

    #[test]
    fn test_unsynced_near_tie_is_randomized() {
        let mut wins = HashMap::new();
        for seed in 0..400 {
            let h = harness_with(Recorder::default(), seed);
            // 100ms probe average for both -> threshold 50
            for conn in ["conn-p1", "conn-p2"] {
                h.engine.accept_ping(conn, Some(h.engine.now_ms() - 100));
            }
            let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
            h.time.advance(10);
            h.engine.accept_buzz("room", "p2", None).unwrap();

            let verdict = h.engine.resolve_window("room", window_id).unwrap();
            assert!(verdict.had_equality);
            assert!(verdict.had_random_tiebreak);
            assert_eq!(verdict.equality_threshold_ms, 50);
            *wins.entry(verdict.winner_id).or_insert(0) += 1;
        }
        let p1 = *wins.get("p1").unwrap_or(&0) as f64 / 400.0;
        assert!((0.35..=0.65).contains(&p1), "p1 won {}", p1);
    }

    #[test]
    fn test_seeded_engines_agree() {
        let run = |seed| {
            let h = harness_with(Recorder::default(), seed);
            let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
            h.engine.accept_buzz("room", "p2", None).unwrap();
            h.engine.accept_buzz("room", "p3", None).unwrap();
            h.engine.resolve_window("room", window_id).unwrap().winner_id
        };
        for seed in 0..10 {
            assert_eq!(run(seed), run(seed));
        }
    }

    #[test]
    fn test_judgment_lock_blocks_buzz() {
        let h = harness();
        h.engine.accept_judgment_start("room").unwrap();
        let before = h.engine.snapshot("room").unwrap();

        assert_eq!(
            h.engine.accept_buzz("room", "p1", None),
            Err(BuzzRejection::JudgmentInProgress)
        );
        let after = h.engine.snapshot("room").unwrap();
        assert_eq!(before, after);

        assert_eq!(h.engine.accept_judgment_start("room"), Err(JudgmentError::AlreadyInProgress));
        h.engine.accept_judgment_end("room", JudgmentOutcome::Aborted).unwrap();
        assert!(h.engine.accept_buzz("room", "p1", None).is_ok());
    }

    #[test]
    fn test_reset_mid_window_discards() {
        let h = harness();
        let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
        h.engine.accept_buzz("room", "p2", None).unwrap();

        assert!(h.engine.accept_reset("room"));
        assert!(h.engine.resolve_window("room", window_id).is_none());
        assert!(h.recorder.verdicts().is_empty());
        assert!(!h.recorder.events().iter().any(|e| matches!(e, RoomEvent::BuzzVerdict(_))));
        assert_eq!(h.engine.snapshot("room").unwrap().status, RoundStatus::NoWinner);
    }

    #[test]
    fn test_sole_candidate_disconnect_aborts() {
        let h = harness();
        let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
        h.engine.accept_disconnect("conn-p1");

        assert!(h.engine.resolve_window("room", window_id).is_none());
        let snapshot = h.engine.snapshot("room").unwrap();
        assert_eq!(snapshot.status, RoundStatus::NoWinner);
        assert_eq!(snapshot.winner_id, None);
        assert!(h.recorder.verdicts().is_empty());
    }

    #[test]
    fn test_disconnected_candidate_excluded() {
        let h = harness();
        sync(&h, "p1", 50.0);
        sync(&h, "p2", 50.0);
        let now = h.engine.now_ms();
        let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", Some(now - 500)));
        h.engine.accept_buzz("room", "p2", Some(now)).unwrap();
        h.engine.accept_disconnect("conn-p1");

        let verdict = h.engine.resolve_window("room", window_id).unwrap();
        assert_eq!(verdict.winner_id, "p2");
        assert_eq!(verdict.candidates.len(), 1);
    }

    #[test]
    fn test_duplicate_buzz_suppressed() {
        let h = harness();
        let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
        assert_eq!(h.engine.accept_buzz("room", "p1", None), Ok(BuzzAccepted::Duplicate));
        assert_eq!(
            h.engine.snapshot("room").unwrap().window_candidates,
            vec!["p1".to_string()]
        );
        let verdict = h.engine.resolve_window("room", window_id).unwrap();
        assert_eq!(verdict.candidates.len(), 1);
    }

    #[test]
    fn test_stale_timer_is_noop() {
        let h = harness();
        let (first, _) = opened(h.engine.accept_buzz("room", "p1", None));
        h.engine.accept_reset("room");
        let (second, _) = opened(h.engine.accept_buzz("room", "p2", None));

        assert!(h.engine.resolve_window("room", first).is_none());
        assert_eq!(h.engine.snapshot("room").unwrap().status, RoundStatus::Collecting);
        assert!(h.engine.resolve_window("room", second).is_some());
        // Firing twice does nothing
        assert!(h.engine.resolve_window("room", second).is_none());
    }

    #[test]
    fn test_rejections() {
        let h = harness();
        assert_eq!(h.engine.accept_buzz("nope", "p1", None), Err(BuzzRejection::RoomMissing));
        assert_eq!(h.engine.accept_buzz("room", "ghost", None), Err(BuzzRejection::PlayerUnknown));
        assert_eq!(h.engine.accept_buzz("room", "host", None), Err(BuzzRejection::PlayerUnknown));

        h.engine.set_paused("room", true);
        assert_eq!(h.engine.accept_buzz("room", "p1", None), Err(BuzzRejection::RoundPaused));
        h.engine.set_paused("room", false);

        h.engine.mark_question_changed("room");
        assert_eq!(h.engine.accept_buzz("room", "p1", None), Err(BuzzRejection::TooEarly));
        h.time.advance(h.engine.config().min_buzz_delay_ms);

        let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
        h.engine.resolve_window("room", window_id);
        assert_eq!(
            h.engine.accept_buzz("room", "p2", None),
            Err(BuzzRejection::AlreadyWon {
                buzzed_by: "Ada".to_string()
            })
        );
    }

    #[test]
    fn test_pause_discards_window() {
        let h = harness();
        let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
        h.engine.set_paused("room", true);
        assert!(h.engine.resolve_window("room", window_id).is_none());
        assert!(h.recorder.verdicts().is_empty());
    }

    #[test]
    fn test_correct_verdict_resets_round() {
        let h = harness();
        let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
        h.engine.resolve_window("room", window_id).unwrap();

        h.engine.accept_judgment_start("room").unwrap();
        let ticket = h.engine.accept_judgment_end("room", JudgmentOutcome::Correct).unwrap();
        assert!(ticket.is_none());

        let snapshot = h.engine.snapshot("room").unwrap();
        assert_eq!(snapshot.status, RoundStatus::NoWinner);
        assert!(!snapshot.judgment_locked);
        assert!(snapshot.buzzed_players.is_empty());
    }

    #[test]
    fn test_incorrect_verdict_penalizes_winner() {
        let h = harness();
        let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
        h.engine.resolve_window("room", window_id).unwrap();

        h.engine.accept_judgment_start("room").unwrap();
        let ticket = h
            .engine
            .accept_judgment_end("room", JudgmentOutcome::Incorrect { penalty_ms: Some(3_000) })
            .unwrap()
            .unwrap();
        assert_eq!(ticket.player_id, "p1");
        assert_eq!(ticket.duration_ms, 3_000);

        // Others may buzz, the penalized player may not
        assert_eq!(h.engine.accept_buzz("room", "p1", None), Err(BuzzRejection::AlreadyBuzzed));
        let (second, _) = opened(h.engine.accept_buzz("room", "p2", None));
        assert_eq!(h.engine.resolve_window("room", second).unwrap().winner_id, "p2");

        assert!(h.engine.expire_penalty("room", "p1", ticket.token));
        assert!(!h.engine.expire_penalty("room", "p1", ticket.token));
        let snapshot = h.engine.snapshot("room").unwrap();
        assert_eq!(snapshot.buzzed_players, vec!["p2".to_string()]);
    }

    #[test]
    fn test_penalty_expiry_after_reset_is_noop() {
        let h = harness();
        let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
        h.engine.resolve_window("room", window_id).unwrap();
        h.engine.accept_judgment_start("room").unwrap();
        let ticket = h
            .engine
            .accept_judgment_end("room", JudgmentOutcome::Incorrect { penalty_ms: None })
            .unwrap()
            .unwrap();
        assert_eq!(ticket.duration_ms, h.engine.config().default_penalty_ms);

        h.engine.accept_reset("room");
        assert!(!h.engine.expire_penalty("room", "p1", ticket.token));
        h.engine.close_room("room");
        assert!(!h.engine.expire_penalty("room", "p1", ticket.token));
    }

    #[test]
    fn test_judgment_without_winner_still_releases() {
        let h = harness();
        h.engine.accept_judgment_start("room").unwrap();
        assert_eq!(
            h.engine.accept_judgment_end("room", JudgmentOutcome::Correct),
            Err(JudgmentError::NoWinner)
        );
        assert!(!h.engine.snapshot("room").unwrap().judgment_locked);
        assert_eq!(
            h.engine.accept_judgment_end("room", JudgmentOutcome::Aborted),
            Err(JudgmentError::NotInProgress)
        );
    }

    #[test]
    fn test_guard_releases_on_drop() {
        let h = harness();
        {
            let _guard = h.engine.begin_judgment("room").unwrap();
            assert!(h.engine.snapshot("room").unwrap().judgment_locked);
        }
        assert!(!h.engine.snapshot("room").unwrap().judgment_locked);

        let guard = h.engine.begin_judgment("room").unwrap();
        guard.finish(JudgmentOutcome::Aborted).unwrap();
        assert!(!h.engine.snapshot("room").unwrap().judgment_locked);
    }

    #[test]
    fn test_failsafe_release_matches_token() {
        let h = harness();
        let old = h.engine.accept_judgment_start("room").unwrap();
        h.engine.accept_judgment_end("room", JudgmentOutcome::Aborted).unwrap();
        let current = h.engine.accept_judgment_start("room").unwrap();

        assert!(!h.engine.force_release_judgment("room", old));
        assert!(h.engine.snapshot("room").unwrap().judgment_locked);
        assert!(h.engine.force_release_judgment("room", current));
        assert!(!h.engine.snapshot("room").unwrap().judgment_locked);
    }

    #[test]
    fn test_stale_winner_heals_on_buzz() {
        let h = harness();
        let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
        h.engine.resolve_window("room", window_id).unwrap();

        // Winner's flag cleared by a path that forgot the winner id
        if let Some(shared) = h.engine.room("room") {
            shared.lock().players.get_mut("p1").unwrap().buzzed = false;
        }
        assert!(matches!(
            h.engine.accept_buzz("room", "p2", None),
            Ok(BuzzAccepted::WindowOpened { .. })
        ));
    }

    #[test]
    fn test_publish_failures_do_not_roll_back() {
        let h = harness_with(Recorder::failing(), 1);
        let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
        let verdict = h.engine.resolve_window("room", window_id).unwrap();
        assert_eq!(verdict.winner_id, "p1");
        assert_eq!(
            h.engine.snapshot("room").unwrap().winner_id.as_deref(),
            Some("p1")
        );
    }

    #[test]
    fn test_failed_resolution_discards_window() {
        let h = harness();
        let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
        if let Some(shared) = h.engine.room("room") {
            let mut round = shared.lock();
            let open = round.window_mut().unwrap();
            assert!(open.push(BuzzCandidate {
                player_id: "p2".to_string(),
                pseudonym: "Bob".to_string(),
                raw_client_timestamp: None,
                server_receive_timestamp: h.engine.now_ms(),
                compensated_timestamp: f64::NAN,
                rtt: 150.0,
                is_synced: false,
            }));
        }

        assert!(h.engine.resolve_window("room", window_id).is_none());
        assert!(h.recorder.verdicts().is_empty());
        assert!(h.recorder.events().is_empty());
        let snapshot = h.engine.snapshot("room").unwrap();
        assert_eq!(snapshot.status, RoundStatus::NoWinner);
        assert!(snapshot.buzzed_players.is_empty());

        let (next, _) = opened(h.engine.accept_buzz("room", "p1", None));
        assert_ne!(next, window_id);
    }

    #[test]
    fn test_runs_without_collaborators() {
        let engine = BuzzEngine::new(EngineConfig::default(), ManualTime::new(0), Collaborators::null());
        assert!(engine.open_room("solo"));
        assert!(!engine.open_room("solo"));
        engine.register_player("solo", "p1", "Ada", None, false);
        let (window_id, duration_ms) = opened(engine.accept_buzz("solo", "p1", None));
        // No RTT data at all: lone player gets the default RTT
        assert_eq!(duration_ms, 150);
        assert_eq!(engine.resolve_window("solo", window_id).unwrap().winner_id, "p1");
        assert!(engine.remove_player("solo", "p1"));
        assert!(engine.close_room("solo"));
        assert!(engine.room_ids().is_empty());
    }

    #[test]
    fn test_window_duration_uses_active_players() {
        let h = harness();
        sync(&h, "p1", 100.0);
        sync(&h, "p2", 300.0);
        // p3 unsynced -> 150 fallback; admin ignored. 3 players -> base 200, spread 200
        let (_, duration_ms) = opened(h.engine.accept_buzz("room", "p1", None));
        assert_eq!(duration_ms, 300);
    }

    #[test]
    fn test_at_most_one_winner() {
        let h = harness();
        for round in 0..5 {
            let (window_id, _) = opened(h.engine.accept_buzz("room", "p1", None));
            for p in ["p2", "p3"] {
                h.engine.accept_buzz("room", p, None).unwrap();
            }
            h.engine.resolve_window("room", window_id).unwrap();
            let snapshot = h.engine.snapshot("room").unwrap();
            assert!(snapshot.winner_id.is_some(), "round {}", round);
            assert_eq!(snapshot.buzzed_players.len(), 1);
            for p in ["p1", "p2", "p3"] {
                assert!(h.engine.accept_buzz("room", p, None).is_err());
            }
            h.engine.accept_reset("room");
        }
    }
}
