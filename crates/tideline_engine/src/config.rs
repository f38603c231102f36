//! Configuration for the sync engine.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Default watchdog threshold for a session with no transport activity.
pub const DEFAULT_STALL_TIMEOUT: Duration = Duration::from_secs(10);

/// Default persisted key of the error journal.
pub const DEFAULT_JOURNAL_KEY: &str = "sync_errors";

/// Ambient platform connectivity flag.
///
/// Used as the `online` value when neither the operation nor the collection
/// supplies one. Clones share the same flag.
#[derive(Debug, Clone)]
pub struct Connectivity(Arc<AtomicBool>);

impl Connectivity {
    /// Creates a flag with the given initial state.
    pub fn new(online: bool) -> Self {
        Self(Arc::new(AtomicBool::new(online)))
    }

    /// Returns the current state.
    pub fn is_online(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    /// Updates the current state.
    pub fn set_online(&self, online: bool) {
        self.0.store(online, Ordering::SeqCst);
    }
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How long an active session may go without transport activity
    /// before the watchdog force-closes it.
    pub stall_timeout: Duration,
    /// Persisted key under which the error journal is appended.
    pub journal_key: String,
    /// Ambient connectivity flag.
    pub connectivity: Connectivity,
}

impl EngineConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            stall_timeout: DEFAULT_STALL_TIMEOUT,
            journal_key: DEFAULT_JOURNAL_KEY.to_string(),
            connectivity: Connectivity::default(),
        }
    }

    /// Sets the watchdog threshold.
    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    /// Sets the error journal key.
    pub fn with_journal_key(mut self, key: impl Into<String>) -> Self {
        self.journal_key = key.into();
        self
    }

    /// Shares an existing connectivity flag.
    pub fn with_connectivity(mut self, connectivity: Connectivity) -> Self {
        self.connectivity = connectivity;
        self
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn engine_config_builder() {
        let config = EngineConfig::new()
            .with_stall_timeout(Duration::from_secs(3))
            .with_journal_key("errors");

        assert_eq!(config.stall_timeout, Duration::from_secs(3));
        assert_eq!(config.journal_key, "errors");
        assert!(config.connectivity.is_online());
    }

    #[test]
    fn engine_config_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.stall_timeout, Duration::from_secs(10));
        assert_eq!(config.journal_key, DEFAULT_JOURNAL_KEY);
    }

    #[test]
    fn connectivity_is_shared_between_clones() {
        let flag = Connectivity::new(true);
        let config = EngineConfig::new().with_connectivity(flag.clone());

        flag.set_online(false);
        assert!(!config.connectivity.is_online());
    }
}
