//! Utility module
//!
//! - Logging setup
//! - JSON persistence helpers

pub mod io;
mod logging;

pub use io::{load_json, save_json};
pub use logging::setup_logging;
