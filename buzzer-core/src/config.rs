//! Engine configuration
//!
//! Defaults suit a typical pub-quiz room; every value can be overridden from the
//! environment by the server binary.

/// Fallback RTT for players without sync data (ms)
pub const DEFAULT_RTT_MS: f64 = 150.0;

/// Minimum wait after a question/track change before buzzes count (ms)
const DEFAULT_MIN_BUZZ_DELAY_MS: u64 = 500;

/// Penalty applied after an incorrect answer when none is given (ms)
const DEFAULT_PENALTY_MS: u64 = 5_000;

/// Judgment locks older than this are force-released by the service (ms)
const DEFAULT_JUDGMENT_LOCK_TIMEOUT_MS: u64 = 10_000;

/// Tunables for the buzz engine
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Buzzes earlier than this after a question change are rejected as `too_early`
    pub min_buzz_delay_ms: u64,
    /// RTT assumed for unsynced players with no latency samples
    pub default_rtt_ms: f64,
    /// Penalty duration after an incorrect verdict
    pub default_penalty_ms: u64,
    /// Failsafe for a judgment lock whose end never arrives
    pub judgment_lock_timeout_ms: u64,
    /// Fixed seed for the tie-break RNG; `None` seeds from entropy
    pub tiebreak_seed: Option<u64>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            min_buzz_delay_ms: DEFAULT_MIN_BUZZ_DELAY_MS,
            default_rtt_ms: DEFAULT_RTT_MS,
            default_penalty_ms: DEFAULT_PENALTY_MS,
            judgment_lock_timeout_ms: DEFAULT_JUDGMENT_LOCK_TIMEOUT_MS,
            tiebreak_seed: None,
        }
    }
}

impl EngineConfig {
    /// Build a config from defaults overridden by `BUZZ_*` environment variables.
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parse_u64 = |key: &str| lookup(key).and_then(|v| v.trim().parse::<u64>().ok());

        Self {
            min_buzz_delay_ms: parse_u64("BUZZ_MIN_DELAY_MS").unwrap_or(defaults.min_buzz_delay_ms),
            default_rtt_ms: lookup("BUZZ_DEFAULT_RTT_MS")
                .and_then(|v| v.trim().parse::<f64>().ok())
                .filter(|v| v.is_finite() && *v >= 0.0)
                .unwrap_or(defaults.default_rtt_ms),
            default_penalty_ms: parse_u64("BUZZ_PENALTY_MS").unwrap_or(defaults.default_penalty_ms),
            judgment_lock_timeout_ms: parse_u64("BUZZ_JUDGMENT_TIMEOUT_MS")
                .unwrap_or(defaults.judgment_lock_timeout_ms),
            tiebreak_seed: parse_u64("BUZZ_TIEBREAK_SEED"),
        }
    }

    /// Config with a fixed tie-break seed (reproducible winners)
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.tiebreak_seed = Some(seed);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_env_overrides() {
        let env: HashMap<&str, &str> = [
            ("BUZZ_MIN_DELAY_MS", "750"),
            ("BUZZ_DEFAULT_RTT_MS", "not-a-number"),
            ("BUZZ_TIEBREAK_SEED", "7"),
        ]
        .into_iter()
        .collect();

        let config = EngineConfig::from_lookup(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(config.min_buzz_delay_ms, 750);
        assert_eq!(config.default_rtt_ms, DEFAULT_RTT_MS); // invalid value ignored
        assert_eq!(config.tiebreak_seed, Some(7));
        assert_eq!(config.default_penalty_ms, DEFAULT_PENALTY_MS);
    }
}
