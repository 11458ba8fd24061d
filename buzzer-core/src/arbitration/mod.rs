//! Buzz arbitration
//!
//! Grace-period collection of buzzes and fair winner resolution.

mod engine;
mod window;

pub use engine::*;
pub use window::*;
