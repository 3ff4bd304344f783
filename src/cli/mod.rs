//! CLI subcommands.
//!
//! Each subcommand is a clap `Args` struct with a `run()` method taking
//! the opened [`Manager`](crate::manager::Manager).

pub mod create;
pub mod exec;
pub mod files;
pub mod lifecycle;
pub mod list;
pub mod snapshot;

use std::time::Duration;

/// Parse a duration string (e.g., "30s", "5m", "1h").
pub(crate) fn parse_duration(s: &str) -> Result<Duration, humantime::DurationError> {
    humantime::parse_duration(s)
}
