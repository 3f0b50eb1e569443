//! Upstream connection cache for remote controllers.
//!
//! This module provides the [`Cache`] which shares live connections to
//! controllers between concurrent operations:
//!
//! - A healthy registered connection is leased immediately, without dialing.
//! - A registered connection reporting itself broken is evicted and redialed.
//! - Concurrent callers for a key with nothing registered share one dial round
//!   (see `join_group`).
//! - Cancellation is per caller: a canceled caller stops waiting, but the dial
//!   it may have started keeps running and its connection is still registered
//!   for the callers that come after.
//!
//! # Architecture
//!
//! The dial of a round runs in a spawned task under a child of the cache's own
//! shutdown token, never under a caller's token. That task installs the new
//! connection in the registry (compare-and-swap against the current occupant)
//! before publishing the outcome, so callers arriving afterwards find it there.
//!
//! The registry holds one lease of its own on every registered connection.
//! Releasing every caller handle therefore keeps the connection cached; the raw
//! connection is closed once the registry lease is dropped too (eviction, a
//! failed health check, [`Cache::close_all`]).

mod dial_timeout;
mod entry_action;
pub(crate) mod join_group;
mod shared;
#[cfg(test)]
pub(crate) mod test_helpers;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::sync::{Arc, Mutex};

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub use dial_timeout::DialTimeout;
pub use shared::{ConnectionHandle, SharedConnection};

use self::entry_action::{
    InstallAction, LookupAction, Occupant, decide_install, decide_lookup,
};
use self::join_group::{JoinGroup, Joined, Round};
use crate::config::CacheConfig;
use crate::connection::{Dialed, RawConnection};
use crate::error::{BoxError, CacheError, CacheResult, LockResultExt};

/// Identifier of a remote controller (e.g. its UUID or name).
pub trait EndpointKey: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> EndpointKey for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// How many times a caller may find its published connection already torn
/// down before giving up.
const MAX_LEASE_ATTEMPTS: usize = 3;

/// What a dial round publishes to its waiters.
type DialOutcome<K, C> = CacheResult<Arc<SharedConnection<K, C>>>;

type OutcomeReceiver<K, C> = watch::Receiver<Option<DialOutcome<K, C>>>;

pub(crate) struct CacheInner<K: EndpointKey, C: RawConnection> {
    /// Map of key -> the registry's own lease on the current connection
    registry: Mutex<HashMap<K, ConnectionHandle<K, C>>>,
    /// In-flight dial rounds
    dials: JoinGroup<K, DialOutcome<K, C>>,
    /// Parent of every dial's token; cancelled on shutdown and on drop
    shutdown: CancellationToken,
    dial_timeout: DialTimeout,
}

/// Cache of connections to remote controllers.
///
/// Cheap to clone; clones share the same registry.
pub struct Cache<K: EndpointKey, C: RawConnection> {
    inner: Arc<CacheInner<K, C>>,
}

impl<K: EndpointKey, C: RawConnection> Clone for Cache<K, C> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<K: EndpointKey, C: RawConnection> Default for Cache<K, C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<K: EndpointKey, C: RawConnection> Cache<K, C> {
    /// Create a cache with the default configuration.
    pub fn new() -> Self {
        Self::with_config(&CacheConfig::default())
    }

    /// Create a cache using the given configuration.
    pub fn with_config(config: &CacheConfig) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                registry: Mutex::new(HashMap::new()),
                dials: JoinGroup::new(),
                shutdown: CancellationToken::new(),
                dial_timeout: config.dial_timeout,
            }),
        }
    }

    /// Get a handle to the controller identified by `key`.
    ///
    /// If a healthy connection is registered it is leased without dialing.
    /// Otherwise the caller joins (or starts) the dial round for `key`; `dial`
    /// is only invoked if this caller ends up leading a round.
    ///
    /// If `cancel` fires first, this caller gets [`CacheError::Canceled`]; the
    /// round continues for everyone else and its connection is still
    /// registered. Dropping the returned future has the same effect.
    pub async fn acquire<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        key: K,
        dial: F,
    ) -> CacheResult<ConnectionHandle<K, C>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Dialed<C>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        for attempt in 1..=MAX_LEASE_ATTEMPTS {
            if self.inner.shutdown.is_cancelled() {
                return Err(CacheError::ShutDown);
            }
            if cancel.is_cancelled() {
                return Err(CacheError::Canceled);
            }

            if let Some(handle) = self.inner.lookup(&key) {
                return Ok(handle);
            }

            let rx = match self.inner.dials.join(&key) {
                Joined::Waiter(rx) => rx,
                Joined::Leader(round) => {
                    // Our own dial is spent after this; no retry past it.
                    let rx = self.start_round(round, key.clone(), dial)?;
                    let shared = join_group::wait(rx, cancel).await??;
                    return shared.lease().map_err(|e| {
                        debug!(
                            target: "apiconn::cache",
                            "Connection to {:?} torn down before lease: {}",
                            key,
                            e
                        );
                        evicted(&key)
                    });
                }
            };

            // A round that already published stays joinable until it leaves
            // the group, so its connection may have been evicted since.
            let shared = join_group::wait(rx, cancel).await??;
            match shared.lease() {
                Ok(handle) if !handle.is_broken() => return Ok(handle),
                Ok(mut handle) => {
                    debug!(
                        target: "apiconn::cache",
                        "Published connection to {:?} is broken (attempt {})",
                        key,
                        attempt
                    );
                    handle.evict();
                }
                Err(e) => {
                    debug!(
                        target: "apiconn::cache",
                        "Connection to {:?} torn down before lease (attempt {}): {}",
                        key,
                        attempt,
                        e
                    );
                }
            }
        }

        Err(evicted(&key))
    }

    /// Dial `key` without sharing or registering the connection.
    ///
    /// For rarely used, short-lived connections that are not worth caching.
    /// The caller is the only party interested in this dial, so `cancel`
    /// aborts the dial itself. [`ConnectionHandle::evict`] on the result only
    /// releases it.
    pub async fn dial_uncached<F, Fut, E>(
        &self,
        cancel: &CancellationToken,
        key: K,
        dial: F,
    ) -> CacheResult<ConnectionHandle<K, C>>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<Dialed<C>, E>>,
        E: Into<BoxError>,
    {
        if self.inner.shutdown.is_cancelled() {
            return Err(CacheError::ShutDown);
        }
        let token = self.inner.shutdown.child_token();
        let dialed = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(CacheError::Canceled),
            dialed = run_dial(dial, token, self.inner.dial_timeout) => dialed?,
        };
        Ok(SharedConnection::open(key, dialed, None))
    }

    /// Release `handle` and remove its connection from the registry, if the
    /// registry still holds that same connection.
    pub fn evict(&self, handle: &mut ConnectionHandle<K, C>) {
        handle.evict();
    }

    /// Release every registered connection and empty the registry.
    ///
    /// Keeps going when a close fails; every failure is logged and the first
    /// one is returned. Connections still leased by callers are closed when
    /// their last handle is released. Later acquisitions dial afresh.
    pub fn close_all(&self) -> CacheResult<()> {
        let drained: Vec<(K, ConnectionHandle<K, C>)> = {
            let mut registry = self.inner.registry.lock().recover_poison("Cache::close_all");
            registry.drain().collect()
        };

        let mut first_err = None;
        for (key, mut lease) in drained {
            if let Err(e) = lease.release() {
                warn!(
                    target: "apiconn::cache",
                    "Cannot close connection to {:?}: {}",
                    key,
                    e
                );
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Shut the cache down for good.
    ///
    /// Cancels in-flight dials, refuses further acquisitions with
    /// [`CacheError::ShutDown`] and releases every registered connection.
    pub fn shutdown(&self) -> CacheResult<()> {
        info!(target: "apiconn::cache", "Shutting down connection cache");
        self.inner.shutdown.cancel();
        self.close_all()
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.inner.registry.lock().recover_poison("Cache::len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether a connection is registered for `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.inner
            .registry
            .lock()
            .recover_poison("Cache::contains")
            .contains_key(key)
    }

    /// Whether a dial round is in flight for `key`.
    pub fn is_dialing(&self, key: &K) -> bool {
        self.inner.dials.in_flight(key)
    }

    /// Spawn the dial task for a round this caller leads.
    fn start_round<F, Fut, E>(
        &self,
        round: Round<K, DialOutcome<K, C>>,
        key: K,
        dial: F,
    ) -> CacheResult<OutcomeReceiver<K, C>>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<Dialed<C>, E>> + Send + 'static,
        E: Into<BoxError> + Send + 'static,
    {
        let rx = round.subscribe().ok_or(CacheError::DialAborted)?;
        let cache = Arc::downgrade(&self.inner);
        let token = self.inner.shutdown.child_token();
        let timeout = self.inner.dial_timeout;

        tokio::spawn(async move {
            // A round that lost the race with the previous round's install
            // reuses that connection instead of dialing again.
            let registered = cache
                .upgrade()
                .and_then(|cache| cache.lookup(&key))
                .map(|handle| Arc::clone(handle.shared()));
            if let Some(shared) = registered {
                round.finish(Ok(shared));
                return;
            }

            debug!(
                target: "apiconn::dial",
                "Dial round {} for {:?} started",
                round.id(),
                key
            );
            let dialed = run_dial(dial, token, timeout).await;

            let outcome = match cache.upgrade() {
                Some(cache) => cache.install(&key, dialed),
                None => {
                    if let Ok(dialed) = dialed {
                        close_unused(&key, &dialed.conn);
                    }
                    Err(CacheError::ShutDown)
                }
            };
            match &outcome {
                Ok(_) => debug!(
                    target: "apiconn::dial",
                    "Dial round {} for {:?} succeeded",
                    round.id(),
                    key
                ),
                Err(e) => debug!(
                    target: "apiconn::dial",
                    "Dial round {} for {:?} failed: {}",
                    round.id(),
                    key,
                    e
                ),
            }
            round.finish(outcome);
        });

        Ok(rx)
    }
}

impl<K: EndpointKey, C: RawConnection> fmt::Debug for Cache<K, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cache")
            .field("len", &self.len())
            .field("dial_timeout", &self.inner.dial_timeout)
            .field("shut_down", &self.inner.shutdown.is_cancelled())
            .finish()
    }
}

impl<K: EndpointKey, C: RawConnection> CacheInner<K, C> {
    /// Lease the registered connection for `key` if it is healthy.
    ///
    /// A broken registered connection is removed and its registry lease
    /// released before returning `None`.
    fn lookup(&self, key: &K) -> Option<ConnectionHandle<K, C>> {
        let mut stale = {
            let mut registry = self.registry.lock().recover_poison("CacheInner::lookup");
            let occupant = registry
                .get(key)
                .map(|lease| Occupant::from_broken(lease.is_broken()));

            match decide_lookup(occupant) {
                LookupAction::Dial => return None,
                LookupAction::ReturnExisting => {
                    let leased = registry.get(key).map(ConnectionHandle::try_clone);
                    match leased {
                        Some(Ok(handle)) => return Some(handle),
                        _ => registry.remove(key),
                    }
                }
                LookupAction::EvictAndDial => {
                    debug!(
                        target: "apiconn::cache",
                        "Evicting broken connection to {:?}",
                        key
                    );
                    registry.remove(key)
                }
            }
        };

        if let Some(lease) = stale.as_mut()
            && let Err(e) = lease.release()
        {
            debug!(
                target: "apiconn::cache",
                "Ignoring close error of broken connection to {:?}: {}",
                key,
                e
            );
        }
        None
    }

    /// Register a freshly dialed connection, unless a healthy one got there first.
    fn install(self: &Arc<Self>, key: &K, dialed: CacheResult<Dialed<C>>) -> DialOutcome<K, C> {
        let lease = SharedConnection::open(key.clone(), dialed?, Some(Arc::downgrade(self)));
        let fresh = Arc::clone(lease.shared());

        let (outcome, discarded) = {
            let mut registry = self.registry.lock().recover_poison("CacheInner::install");

            // Checked under the lock: shutdown cancels before close_all drains.
            if self.shutdown.is_cancelled() {
                (Err(CacheError::ShutDown), Some(lease))
            } else {
                let occupant = registry
                    .get(key)
                    .map(|lease| Occupant::from_broken(lease.is_broken()));

                match decide_install(occupant) {
                    InstallAction::Insert | InstallAction::Replace => {
                        let displaced = registry.insert(key.clone(), lease);
                        (Ok(fresh), displaced)
                    }
                    InstallAction::KeepExisting => {
                        let existing = registry.get(key).map(|lease| Arc::clone(lease.shared()));
                        match existing {
                            Some(existing) => (Ok(existing), Some(lease)),
                            None => {
                                registry.insert(key.clone(), lease);
                                (Ok(fresh), None)
                            }
                        }
                    }
                }
            }
        };

        if let Some(mut discarded) = discarded {
            debug!(
                target: "apiconn::cache",
                "Releasing unused connection to {:?}",
                key
            );
            if let Err(e) = discarded.release() {
                debug!(
                    target: "apiconn::cache",
                    "Ignoring close error of unused connection to {:?}: {}",
                    key,
                    e
                );
            }
        }

        outcome
    }

    /// Remove `shared` from the registry if it is still the occupant of its key.
    pub(crate) fn unregister(&self, shared: &Arc<SharedConnection<K, C>>) {
        let removed = {
            let mut registry = self.registry.lock().recover_poison("CacheInner::unregister");
            let same = registry
                .get(shared.key())
                .is_some_and(|lease| Arc::ptr_eq(lease.shared(), shared));
            if same {
                registry.remove(shared.key())
            } else {
                None
            }
        };

        if let Some(mut lease) = removed {
            debug!(
                target: "apiconn::cache",
                "Evicted connection to {:?}",
                shared.key()
            );
            if let Err(e) = lease.release() {
                debug!(
                    target: "apiconn::cache",
                    "Ignoring close error while evicting {:?}: {}",
                    shared.key(),
                    e
                );
            }
        }
    }
}

impl<K: EndpointKey, C: RawConnection> Drop for CacheInner<K, C> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Run one dial under the round's token and timeout.
async fn run_dial<C, F, Fut, E>(
    dial: F,
    token: CancellationToken,
    timeout: DialTimeout,
) -> CacheResult<Dialed<C>>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = Result<Dialed<C>, E>>,
    E: Into<BoxError>,
{
    let attempt = dial(token.clone());
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(CacheError::ShutDown),
        result = tokio::time::timeout(timeout.as_duration(), attempt) => match result {
            Ok(Ok(dialed)) => Ok(dialed),
            Ok(Err(e)) => Err(CacheError::dial(e)),
            Err(_elapsed) => Err(CacheError::DialTimeout {
                timeout: timeout.as_duration(),
            }),
        },
    }
}

fn close_unused<K: fmt::Debug, C: RawConnection>(key: &K, conn: &C) {
    if let Err(e) = conn.close() {
        debug!(
            target: "apiconn::cache",
            "Ignoring close error of unused connection to {:?}: {}",
            key,
            e
        );
    }
}

fn evicted<K: fmt::Debug>(key: &K) -> CacheError {
    CacheError::Evicted {
        key: format!("{key:?}"),
    }
}
