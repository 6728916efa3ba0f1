/**
 * Helper functions for creating common error types
 */
use crate::error::Error;

/// Create a `NotSynced` error naming the mirrors still waiting on their initial list
#[must_use]
pub fn not_synced_error(pending: &[&str]) -> Error {
    Error::NotSynced(format!(
        "waiting till full synchronization (pending: {})",
        pending.join(", ")
    ))
}

/// Create an `InvalidHostname` error for hostnames outside the catalog's domain
#[must_use]
pub fn invalid_hostname_error(hostname: &str, suffix: &str) -> Error {
    Error::InvalidHostname(format!(
        "{hostname:?} is not of the form <name>.<namespace>.{suffix}"
    ))
}

/// Create a `LockPoisoned` error for mutex/rwlock poisoning (indicates prior panic)
#[must_use]
pub fn lock_poisoned_error(message: &str) -> Error {
    Error::LockPoisoned(format!(
        "{message} - this indicates a prior panic, application may be in an inconsistent state"
    ))
}
