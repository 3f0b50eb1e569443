//! Dial timeout for one coalesced dial round.
//!
//! This module provides a validated timeout type bounding how long a dial
//! round may run before every waiter of that round receives a timeout error.

use std::time::Duration;

use crate::error::{CacheError, CacheResult};

/// Upper bound on a single dial round (1-300s).
///
/// The timeout belongs to the round, not to any waiter: a waiter that gives
/// up early uses its own cancellation token instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialTimeout(Duration);

impl DialTimeout {
    /// Default timeout: 30 seconds
    const DEFAULT_SECS: u64 = 30;

    /// Minimum valid timeout: 1 second
    const MIN: Duration = Duration::from_secs(1);

    /// Maximum valid timeout: 300 seconds
    const MAX: Duration = Duration::from_secs(300);

    /// Create a new DialTimeout with validation.
    ///
    /// Returns a configuration error if `duration` is outside 1-300 seconds
    /// (both bounds inclusive).
    pub fn new(duration: Duration) -> CacheResult<Self> {
        if duration < Self::MIN {
            return Err(CacheError::config(format!(
                "dial timeout must be at least {:?}, got {:?}",
                Self::MIN,
                duration
            )));
        }
        if duration > Self::MAX {
            return Err(CacheError::config(format!(
                "dial timeout must be at most {:?}, got {:?}",
                Self::MAX,
                duration
            )));
        }
        Ok(Self(duration))
    }

    /// Create a DialTimeout from whole seconds.
    pub fn from_secs(secs: u64) -> CacheResult<Self> {
        Self::new(Duration::from_secs(secs))
    }

    /// Get the inner Duration value.
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl Default for DialTimeout {
    fn default() -> Self {
        Self(Duration::from_secs(Self::DEFAULT_SECS))
    }
}
