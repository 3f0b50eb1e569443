//! Plain TCP controller connections.
//!
//! [`TcpConnection`] is the simplest [`RawConnection`]: liveness is a
//! non-blocking one byte peek, so a peer that closed its end (EOF) or a socket
//! error marks the connection broken. [`dial`] tries the endpoint's addresses
//! in order and returns the first one that connects.

use std::io;
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, trace};
use tokio_util::sync::CancellationToken;

use crate::connection::{Dialed, EndpointInfo, RawConnection};

/// A connected TCP stream shared through the cache.
#[derive(Debug)]
pub struct TcpConnection {
    stream: TcpStream,
    peer: SocketAddr,
    closed: AtomicBool,
}

impl TcpConnection {
    /// Wrap a connected stream, switching it to non-blocking mode.
    pub fn new(stream: TcpStream) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        let peer = stream.peer_addr()?;
        Ok(Self {
            stream,
            peer,
            closed: AtomicBool::new(false),
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    /// The underlying stream, for protocol code layered on top.
    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }
}

impl RawConnection for TcpConnection {
    fn is_broken(&self) -> bool {
        if self.closed.load(Ordering::Acquire) {
            return true;
        }
        let mut buf = [0u8; 1];
        match self.stream.peek(&mut buf) {
            // EOF: the controller hung up
            Ok(0) => true,
            Ok(_) => false,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => false,
            Err(e) => {
                trace!(target: "apiconn::tcp", "Peek on {} failed: {}", self.peer, e);
                true
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.stream.shutdown(Shutdown::Both) {
            // The peer got there first
            Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// Connect to the first reachable address of `info`.
///
/// Fails with `Interrupted` as soon as `cancel` fires, and with the last
/// connect error if no address is reachable.
pub async fn dial(info: EndpointInfo, cancel: CancellationToken) -> io::Result<Dialed<TcpConnection>> {
    if info.addresses.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "endpoint has no addresses",
        ));
    }

    let addresses = info.addresses.clone();
    let mut last_err = None;
    for addr in &addresses {
        let attempt = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(io::Error::new(io::ErrorKind::Interrupted, "dial canceled"));
            }
            attempt = tokio::net::TcpStream::connect(addr.as_str()) => attempt,
        };

        match attempt {
            Ok(stream) => {
                stream.set_nodelay(true)?;
                let conn = TcpConnection::new(stream.into_std()?)?;
                debug!(target: "apiconn::tcp", "Connected to {} ({})", addr, conn.peer_addr());
                return Ok(Dialed::new(conn, info));
            }
            Err(e) => {
                debug!(target: "apiconn::tcp", "Cannot connect to {}: {}", addr, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| io::Error::other("no address could be dialed")))
}
