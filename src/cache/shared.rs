//! Reference-counted controller connections and the handles leased from them.
//!
//! A [`SharedConnection`] owns one raw connection to one endpoint key. Every
//! [`ConnectionHandle`] is one lease on it. The raw connection is closed
//! exactly once, by whichever release drops the lease count from 1 to 0.

use std::fmt;
use std::ops::Deref;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, warn};

use super::{CacheInner, EndpointKey};
use crate::connection::{Dialed, EndpointInfo, RawConnection};
use crate::error::{CacheError, CacheResult, LockResultExt};

/// Lease bookkeeping, guarded by the connection's own lock.
#[derive(Debug)]
struct Leases {
    count: usize,
    terminated: bool,
}

/// One physical connection to one endpoint, shared by every handle leased from it.
pub struct SharedConnection<K: EndpointKey, C: RawConnection> {
    key: K,
    conn: C,
    info: EndpointInfo,
    leases: Mutex<Leases>,
    /// Cache whose registry this connection was dialed for (None when uncached).
    /// Only used by eviction to check it still occupies its slot.
    owner: Option<Weak<CacheInner<K, C>>>,
}

impl<K: EndpointKey, C: RawConnection> SharedConnection<K, C> {
    /// Wrap a freshly dialed connection and return its first lease.
    pub(super) fn open(
        key: K,
        dialed: Dialed<C>,
        owner: Option<Weak<CacheInner<K, C>>>,
    ) -> ConnectionHandle<K, C> {
        let shared = Arc::new(Self {
            key,
            conn: dialed.conn,
            info: dialed.info,
            leases: Mutex::new(Leases {
                count: 1,
                terminated: false,
            }),
            owner,
        });
        ConnectionHandle {
            shared,
            released: false,
        }
    }

    /// Take a new lease.
    ///
    /// Fails if the connection was already closed: handing it out again would
    /// resurrect a dead count.
    pub(super) fn lease(self: &Arc<Self>) -> CacheResult<ConnectionHandle<K, C>> {
        let mut leases = self.leases.lock().recover_poison("SharedConnection::lease");
        if leases.terminated {
            return Err(CacheError::lifecycle(format!(
                "clone of closed connection to {:?}",
                self.key
            )));
        }
        leases.count += 1;
        Ok(ConnectionHandle {
            shared: Arc::clone(self),
            released: false,
        })
    }

    /// Give one lease back, closing the raw connection if it was the last.
    fn release_lease(&self) -> CacheResult<()> {
        let mut leases = self
            .leases
            .lock()
            .recover_poison("SharedConnection::release_lease");
        if leases.terminated || leases.count == 0 {
            return Err(CacheError::lifecycle(format!(
                "release of closed connection to {:?}",
                self.key
            )));
        }
        leases.count -= 1;
        if leases.count > 0 {
            return Ok(());
        }
        leases.terminated = true;
        drop(leases);

        debug!(
            target: "apiconn::cache",
            "Last lease released, closing connection to {:?}",
            self.key
        );
        self.conn.close().map_err(CacheError::close)
    }

    pub fn key(&self) -> &K {
        &self.key
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.info
    }

    pub fn connection(&self) -> &C {
        &self.conn
    }

    /// Number of outstanding leases, the registry's own included.
    pub fn ref_count(&self) -> usize {
        self.leases
            .lock()
            .recover_poison("SharedConnection::ref_count")
            .count
    }

    /// Whether the raw connection has been closed.
    pub fn is_terminated(&self) -> bool {
        self.leases
            .lock()
            .recover_poison("SharedConnection::is_terminated")
            .terminated
    }

    /// The raw connection's own liveness signal.
    pub fn is_broken(&self) -> bool {
        self.conn.is_broken()
    }

    pub(super) fn owner(&self) -> Option<Arc<CacheInner<K, C>>> {
        self.owner.as_ref().and_then(Weak::upgrade)
    }
}

impl<K: EndpointKey, C: RawConnection> fmt::Debug for SharedConnection<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let leases = self.leases.lock().recover_poison("SharedConnection::fmt");
        f.debug_struct("SharedConnection")
            .field("key", &self.key)
            .field("info", &self.info)
            .field("ref_count", &leases.count)
            .field("terminated", &leases.terminated)
            .finish()
    }
}

/// A single caller's lease on a [`SharedConnection`].
///
/// Release it with [`release`](Self::release) to observe close errors; a
/// handle dropped without being released releases itself. Releasing twice is
/// a no-op.
pub struct ConnectionHandle<K: EndpointKey, C: RawConnection> {
    shared: Arc<SharedConnection<K, C>>,
    released: bool,
}

impl<K: EndpointKey, C: RawConnection> ConnectionHandle<K, C> {
    /// Lease another handle on the same connection.
    ///
    /// Returns a lifecycle error if this handle was already released or the
    /// connection is closed.
    pub fn try_clone(&self) -> CacheResult<Self> {
        if self.released {
            return Err(CacheError::lifecycle(format!(
                "clone of released handle to {:?}",
                self.shared.key
            )));
        }
        self.shared.lease()
    }

    /// Release this lease.
    ///
    /// Idempotent. The close error of the raw connection, if any, is returned
    /// only to the release that dropped the count to zero.
    pub fn release(&mut self) -> CacheResult<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.shared.release_lease()
    }

    /// Release this lease and remove the connection from its cache.
    ///
    /// The registry entry is only removed if it still holds this same
    /// connection; a connection installed after an earlier eviction is left
    /// alone. Close errors are not reported: a connection is usually evicted
    /// because it is already bad.
    pub fn evict(&mut self) {
        if let Err(e) = self.release() {
            debug!(
                target: "apiconn::cache",
                "Ignoring release error while evicting {:?}: {}",
                self.shared.key,
                e
            );
        }
        if let Some(cache) = self.shared.owner() {
            cache.unregister(&self.shared);
        }
    }

    pub fn key(&self) -> &K {
        &self.shared.key
    }

    pub fn info(&self) -> &EndpointInfo {
        &self.shared.info
    }

    pub fn connection(&self) -> &C {
        &self.shared.conn
    }

    pub fn ref_count(&self) -> usize {
        self.shared.ref_count()
    }

    pub fn is_broken(&self) -> bool {
        self.shared.is_broken()
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Whether both handles lease the same underlying connection.
    pub fn same_connection(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.shared, &other.shared)
    }

    pub fn shared(&self) -> &Arc<SharedConnection<K, C>> {
        &self.shared
    }
}

impl<K: EndpointKey, C: RawConnection> Clone for ConnectionHandle<K, C> {
    /// # Panics
    ///
    /// Panics if the handle was released or the connection is closed; use
    /// [`try_clone`](ConnectionHandle::try_clone) to handle that as an error.
    fn clone(&self) -> Self {
        match self.try_clone() {
            Ok(handle) => handle,
            Err(e) => panic!("{e}"),
        }
    }
}

impl<K: EndpointKey, C: RawConnection> Deref for ConnectionHandle<K, C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.shared.conn
    }
}

impl<K: EndpointKey, C: RawConnection> Drop for ConnectionHandle<K, C> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(
                target: "apiconn::cache",
                "Error releasing dropped handle to {:?}: {}",
                self.shared.key,
                e
            );
        }
    }
}

impl<K: EndpointKey, C: RawConnection> fmt::Debug for ConnectionHandle<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("key", &self.shared.key)
            .field("released", &self.released)
            .field("ref_count", &self.shared.ref_count())
            .finish()
    }
}
