pub mod cache;
pub mod config;
pub mod connection;
pub mod error;
pub mod tcp;

pub use cache::{Cache, ConnectionHandle, DialTimeout, EndpointKey, SharedConnection};
pub use config::{CacheConfig, Settings};
pub use connection::{Dialed, EndpointInfo, RawConnection};
pub use error::{BoxError, CacheError, CacheResult};

// Callers pass their cancellation as this token type
pub use tokio_util::sync::CancellationToken;
