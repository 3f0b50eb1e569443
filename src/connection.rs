//! Capabilities the cache needs from a live controller connection.
//!
//! The cache never knows how a connection is established. A dial function
//! hands it something implementing [`RawConnection`] together with the
//! [`EndpointInfo`] that was used to reach the controller.

use std::io;

use serde::{Deserialize, Serialize};

/// A live connection to one remote controller.
///
/// Implementations are shared by every handle leased from the same cached
/// connection, so both methods take `&self`.
pub trait RawConnection: Send + Sync + 'static {
    /// Whether the connection is known to be dead.
    ///
    /// Must not block: the cache calls this while holding its registry lock.
    fn is_broken(&self) -> bool;

    /// Close the connection.
    ///
    /// The cache calls this exactly once, when the last lease is released.
    fn close(&self) -> io::Result<()>;
}

/// Information describing how a controller endpoint was reached.
///
/// Immutable once the dial completes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInfo {
    /// Addresses tried by the dialer, in preference order
    #[serde(default)]
    pub addresses: Vec<String>,
    /// PEM encoded CA certificate used to verify the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert: Option<String>,
    /// Identity the connection was authenticated as
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<String>,
}

impl EndpointInfo {
    /// Endpoint info for the given addresses with no certificate or identity.
    pub fn with_addresses<I, S>(addresses: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            addresses: addresses.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }
}

/// The successful result of a dial.
#[derive(Debug)]
pub struct Dialed<C> {
    /// The live connection
    pub conn: C,
    /// How the connection was made
    pub info: EndpointInfo,
}

impl<C> Dialed<C> {
    pub fn new(conn: C, info: EndpointInfo) -> Self {
        Self { conn, info }
    }
}
