/**
 * Configuration constants for the mirrors, the dispatch queue and the controller
 */
use std::time::Duration;

/// Fixed delay before a failed task is pushed back onto the dispatch queue
pub const RETRY_DELAY_SECONDS: u64 = 1;

/// Maximum backoff time in seconds between relist attempts
pub const MAX_BACKOFF_SECONDS: u64 = 60;

/// Initial backoff time in seconds
pub const INITIAL_BACKOFF_SECONDS: u64 = 1;

/// Watch stream timeout in seconds (294 vs 300 to allow 6 seconds for graceful shutdown)
pub const WATCH_TIMEOUT_SECONDS: u32 = 294;

/// Default full resync period for every mirror
pub const DEFAULT_RESYNC_SECONDS: u64 = 60;

/// Default cluster domain used for hostnames and workload identities
pub const DEFAULT_DOMAIN_SUFFIX: &str = "cluster.local";

/// Configurable attributes of a `Controller`
#[derive(Debug, Clone)]
pub struct ControllerOptions {
    /// Namespace to restrict the controller to (empty to disable restriction)
    pub namespace: String,
    /// Interval between full relists; `Duration::ZERO` disables periodic resync
    pub resync_period: Duration,
    pub domain_suffix: String,
    /// Delay before a failed task is retried
    pub retry_delay: Duration,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        Self {
            namespace: String::new(),
            resync_period: Duration::from_secs(DEFAULT_RESYNC_SECONDS),
            domain_suffix: DEFAULT_DOMAIN_SUFFIX.to_string(),
            retry_delay: Duration::from_secs(RETRY_DELAY_SECONDS),
        }
    }
}

impl ControllerOptions {
    /// The namespace restriction, or `None` when watching every namespace
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        if self.namespace.is_empty() {
            None
        } else {
            Some(self.namespace.as_str())
        }
    }
}

/// Validate configuration constants at compile time
const _: () = {
    assert!(RETRY_DELAY_SECONDS > 0, "RETRY_DELAY_SECONDS must be greater than 0");
    assert!(MAX_BACKOFF_SECONDS > 0, "MAX_BACKOFF_SECONDS must be greater than 0");
    assert!(INITIAL_BACKOFF_SECONDS > 0, "INITIAL_BACKOFF_SECONDS must be greater than 0");
    assert!(
        INITIAL_BACKOFF_SECONDS <= MAX_BACKOFF_SECONDS,
        "INITIAL_BACKOFF_SECONDS must not exceed MAX_BACKOFF_SECONDS"
    );
    assert!(WATCH_TIMEOUT_SECONDS > 0, "WATCH_TIMEOUT_SECONDS must be greater than 0");
};
