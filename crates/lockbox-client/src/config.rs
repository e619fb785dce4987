//! Client configuration

use std::time::Duration;

/// Default lower bound for the directory's one-time prekey pool.
pub const DEFAULT_OPK_MIN: usize = 10;

/// Default pool size after replenishment.
pub const DEFAULT_OPK_TARGET: usize = 40;

/// Default number of one-time prekeys uploaded with the first bundle.
pub const DEFAULT_INITIAL_OPKS: usize = 10;

/// Default deadline for key directory requests.
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Replenish when the directory holds fewer one-time prekeys than this
    pub opk_min: usize,
    /// Number of one-time prekeys the directory should hold after
    /// replenishment
    pub opk_target: usize,
    /// One-time prekeys uploaded with the first bundle registration
    pub initial_opks: usize,
    /// Deadline for each key directory request
    pub fetch_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            opk_min: DEFAULT_OPK_MIN,
            opk_target: DEFAULT_OPK_TARGET,
            initial_opks: DEFAULT_INITIAL_OPKS,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
        }
    }
}
