//! Tilestream Node -- library crate for the replication session drivers.
//!
//! Re-exports config, session and loopback simulation so integration tests
//! and the binary share one surface.

pub mod config;
pub mod session;
pub mod sim;

use std::path::PathBuf;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}
