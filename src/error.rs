//! Error handling types for apiconn
//!
//! This module provides the error type shared by the connection cache,
//! the settings loader and the TCP dialer.

use std::error::Error as StdError;
use std::io;
use std::sync::{Arc, PoisonError};
use std::time::Duration;

use thiserror::Error;

/// Boxed error returned by dial functions.
pub type BoxError = Box<dyn StdError + Send + Sync>;

/// Comprehensive error type for connection cache operations.
///
/// `Clone` so that the single outcome of a dial round can be handed to
/// every caller that waited on it.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// The injected dial function failed
    #[error("cannot dial controller: {0}")]
    Dial(Arc<dyn StdError + Send + Sync>),

    /// The dial round did not finish within the configured timeout
    #[error("dial timed out after {timeout:?}")]
    DialTimeout { timeout: Duration },

    /// The dial task ended without publishing an outcome
    #[error("dial task ended without a result")]
    DialAborted,

    /// The caller's own cancellation token fired
    #[error("operation canceled")]
    Canceled,

    /// Closing the underlying connection failed
    #[error("cannot close connection: {0}")]
    Close(Arc<io::Error>),

    /// A handle was used after its connection was fully closed
    #[error("connection lifecycle misuse: {message}")]
    Lifecycle { message: String },

    /// The connection was torn down before a handle could be leased
    #[error("connection for {key} was evicted before it could be used")]
    Evicted { key: String },

    /// The cache has been shut down
    #[error("connection cache is shut down")]
    ShutDown,

    /// Configuration error
    #[error("invalid configuration: {message}")]
    Config { message: String },

    /// IO error
    #[error("IO error: {0}")]
    Io(Arc<io::Error>),
}

/// Result type for connection cache operations
pub type CacheResult<T> = Result<T, CacheError>;

impl CacheError {
    /// Wrap a dial failure.
    pub fn dial(err: impl Into<BoxError>) -> Self {
        CacheError::Dial(Arc::from(err.into()))
    }

    /// Wrap a close failure.
    pub fn close(err: io::Error) -> Self {
        CacheError::Close(Arc::new(err))
    }

    /// Create a lifecycle misuse error
    pub fn lifecycle(message: impl Into<String>) -> Self {
        CacheError::Lifecycle {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        CacheError::Config {
            message: message.into(),
        }
    }

    /// Returns true if this error came from the caller's own cancellation.
    pub fn is_canceled(&self) -> bool {
        matches!(self, CacheError::Canceled)
    }
}

impl From<io::Error> for CacheError {
    fn from(err: io::Error) -> Self {
        CacheError::Io(Arc::new(err))
    }
}

/// Helper trait to recover the guard from a poisoned lock.
pub trait LockResultExt<T> {
    /// Return the guard even if the lock was poisoned, logging the recovery.
    ///
    /// The context parameter identifies which operation triggered lock recovery,
    /// helping developers debug thread safety issues.
    fn recover_poison(self, context: &str) -> T;
}

impl<T> LockResultExt<T> for Result<T, PoisonError<T>> {
    fn recover_poison(self, context: &str) -> T {
        match self {
            Ok(guard) => guard,
            Err(poisoned) => {
                log::warn!(
                    target: "apiconn::lock_recovery",
                    "Recovered from poisoned lock in {}",
                    context
                );
                poisoned.into_inner()
            }
        }
    }
}
