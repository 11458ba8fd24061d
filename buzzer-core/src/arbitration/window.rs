//! Grace-period window
//!
//! Candidate collection plus the pure parts of arbitration: timestamp
//! compensation, adaptive window sizing and winner selection.

use rand::Rng;

use crate::error::ResolutionError;
use crate::round::CandidateDetail;

/// RTTs outside this range are ignored for sizing and thresholds (ms)
const MAX_VALID_RTT_MS: f64 = 1_000.0;

/// Window used when no player has a usable RTT (ms)
const FALLBACK_WINDOW_MS: u64 = 300;

/// RTT assumed for the equality threshold when no candidate has a usable one (ms)
const FALLBACK_THRESHOLD_RTT_MS: f64 = 150.0;

/// A buzz recorded in an open window
#[derive(Debug, Clone, PartialEq)]
pub struct BuzzCandidate {
    pub player_id: String,
    pub pseudonym: String,
    pub raw_client_timestamp: Option<u64>,
    pub server_receive_timestamp: u64,
    pub compensated_timestamp: f64,
    pub rtt: f64,
    pub is_synced: bool,
}

impl From<&BuzzCandidate> for CandidateDetail {
    fn from(c: &BuzzCandidate) -> Self {
        Self {
            player_id: c.player_id.clone(),
            pseudonym: c.pseudonym.clone(),
            raw_client_timestamp: c.raw_client_timestamp,
            server_receive_timestamp: c.server_receive_timestamp,
            compensated_timestamp: c.compensated_timestamp,
            rtt: c.rtt,
            is_synced: c.is_synced,
        }
    }
}

/// Collection window opened by the first buzz of a round
#[derive(Debug, Clone, PartialEq)]
pub struct GracePeriodWindow {
    /// Identity checked by the timer when it fires
    pub id: u64,
    pub duration_ms: u64,
    pub started_at: u64,
    candidates: Vec<BuzzCandidate>,
}

impl GracePeriodWindow {
    pub fn open(id: u64, duration_ms: u64, started_at: u64, first: BuzzCandidate) -> Self {
        Self {
            id,
            duration_ms,
            started_at,
            candidates: vec![first],
        }
    }

    pub fn contains(&self, player_id: &str) -> bool {
        self.candidates.iter().any(|c| c.player_id == player_id)
    }

    /// Add a candidate. Returns false for a repeat buzz from the same player.
    pub fn push(&mut self, candidate: BuzzCandidate) -> bool {
        if self.contains(&candidate.player_id) {
            return false;
        }
        self.candidates.push(candidate);
        true
    }

    pub fn candidates(&self) -> &[BuzzCandidate] {
        &self.candidates
    }

    pub fn into_candidates(self) -> Vec<BuzzCandidate> {
        self.candidates
    }
}

/// Put a buzz on the server time reference.
///
/// Synced clients already applied their offset, so their timestamp is taken
/// as-is. Everyone else is placed half an RTT before the server saw the buzz.
pub fn compensate(
    client_ts: Option<u64>,
    server_receive_ts: u64,
    is_synced: bool,
    fallback_rtt_ms: f64,
) -> f64 {
    match client_ts {
        Some(ts) if is_synced => ts as f64,
        _ => server_receive_ts as f64 - fallback_rtt_ms / 2.0,
    }
}

fn is_valid_rtt(rtt: f64) -> bool {
    rtt.is_finite() && (0.0..=MAX_VALID_RTT_MS).contains(&rtt)
}

/// Window length from the RTTs of the active players (one entry per player)
pub fn window_duration_ms(player_rtts: &[f64]) -> u64 {
    let valid: Vec<f64> = player_rtts.iter().copied().filter(|r| is_valid_rtt(*r)).collect();
    if valid.is_empty() {
        return FALLBACK_WINDOW_MS;
    }

    let max = valid.iter().copied().fold(f64::MIN, f64::max);
    let min = valid.iter().copied().fold(f64::MAX, f64::min);
    let spread = max - min;

    let players = player_rtts.len();
    let base = match players {
        0..=2 => 150.0,
        3..=4 => 200.0,
        5..=6 => 250.0,
        _ => 300.0,
    };
    let cap = if players > 6 { 600.0 } else { 500.0 };

    (base + spread / 2.0).min(cap).round() as u64
}

/// Equality threshold from the average candidate RTT
pub fn equality_threshold_ms(average_rtt_ms: f64) -> u64 {
    match average_rtt_ms {
        r if r < 50.0 => 30,
        r if r < 150.0 => 50,
        r if r < 300.0 => 75,
        _ => 100,
    }
}

/// Average of the candidates' valid RTTs
fn average_candidate_rtt(candidates: &[BuzzCandidate]) -> f64 {
    let valid: Vec<f64> = candidates.iter().map(|c| c.rtt).filter(|r| is_valid_rtt(*r)).collect();
    if valid.is_empty() {
        return FALLBACK_THRESHOLD_RTT_MS;
    }
    valid.iter().sum::<f64>() / valid.len() as f64
}

/// Result of ranking a window's candidates
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// Candidates sorted by compensated time (arrival order among equals)
    pub ranked: Vec<BuzzCandidate>,
    /// Index into `ranked` of the winner
    pub winner: usize,
    pub equality_threshold_ms: u64,
    pub had_equality: bool,
    pub had_random_tiebreak: bool,
}

impl Resolution {
    pub fn winner(&self) -> &BuzzCandidate {
        &self.ranked[self.winner]
    }
}

/// Pick a winner among the surviving candidates.
///
/// Returns `Ok(None)` when there is nobody left to pick. When every candidate
/// is synced the earliest always wins; otherwise a near tie is broken at random.
pub fn resolve<R: Rng + ?Sized>(
    mut candidates: Vec<BuzzCandidate>,
    rng: &mut R,
) -> Result<Option<Resolution>, ResolutionError> {
    if let Some(bad) = candidates.iter().find(|c| !c.compensated_timestamp.is_finite()) {
        return Err(ResolutionError::InvalidTimestamp(bad.player_id.clone()));
    }
    if candidates.is_empty() {
        return Ok(None);
    }

    // Stable sort keeps arrival order for identical timestamps
    candidates.sort_by(|a, b| a.compensated_timestamp.total_cmp(&b.compensated_timestamp));

    let threshold = equality_threshold_ms(average_candidate_rtt(&candidates));
    let top = candidates[0].compensated_timestamp;
    let tied = candidates
        .iter()
        .take_while(|c| c.compensated_timestamp - top <= threshold as f64)
        .count();

    let had_equality = tied > 1;
    let all_synced = candidates.iter().all(|c| c.is_synced);

    let (winner, had_random_tiebreak) = if had_equality && !all_synced {
        (rng.gen_range(0..tied), true)
    } else {
        (0, false)
    };

    Ok(Some(Resolution {
        ranked: candidates,
        winner,
        equality_threshold_ms: threshold,
        had_equality,
        had_random_tiebreak,
    }))
}
