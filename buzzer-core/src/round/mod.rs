//! Round Engine
//!
//! Per-room round state and the messages exchanged with clients.

mod protocol;
mod state;

pub use protocol::*;
pub use state::*;
