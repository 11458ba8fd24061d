//! Buzzer Server
//!
//! Buzz arbitration server for live quiz rooms, with a terminal dashboard.
//!
//! Usage:
//!   cargo run --release
//!   cargo run --release -- --no-dashboard  # Plain logging mode
//!
//! Environment:
//!   BIND_ADDR                 listen address (default 0.0.0.0:4002)
//!   BUZZ_MIN_DELAY_MS         early-buzz guard after a question change
//!   BUZZ_DEFAULT_RTT_MS       RTT assumed for unsynced players
//!   BUZZ_PENALTY_MS           lockout after an incorrect answer
//!   BUZZ_JUDGMENT_TIMEOUT_MS  failsafe for a stuck judgment
//!   BUZZ_TIEBREAK_SEED        fixed tie-break seed
//!   BUZZ_ADMIN_TOKEN          lets later joiners claim admin

mod dashboard;
mod error;
mod hub;
mod metrics;
mod network;

use parking_lot::RwLock;
use std::sync::Arc;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().collect();
    let use_dashboard = !args.contains(&"--no-dashboard".to_string());

    // Shared metrics state
    let metrics = Arc::new(RwLock::new(metrics::Metrics::new()));

    if use_dashboard {
        dashboard::run(metrics).await
    } else {
        network::run_with_logging(metrics).await?;
        Ok(())
    }
}
